//! Distinguished names and subject alternative names
//!
//! A [`DistinguishedName`] keeps its attributes in the order they were added;
//! that order is the encoded RDN order, and two names compare equal only if
//! they carry the same attributes in the same order.

use std::fmt;
use std::net::IpAddr;

use openssl::nid::Nid;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Extension, X509Name, X509v3Context};
use x509_parser::extensions::GeneralName;
use x509_parser::x509::X509Name as ParsedName;

use crate::error::{PkiError, Result};

// RFC 5280 Appendix A upper bounds
const UB_COMMON_NAME: usize = 64;
const UB_ORGANIZATION: usize = 64;
const UB_ORGANIZATIONAL_UNIT: usize = 64;
const UB_LOCALITY: usize = 128;
const UB_STATE: usize = 128;
const UB_EMAIL_ADDRESS: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttributeType {
    CommonName,
    Country,
    State,
    Locality,
    Organization,
    OrganizationalUnit,
    EmailAddress,
    /// Any other attribute, identified by dotted OID
    Other(String),
}

impl AttributeType {
    fn from_oid(oid: &str) -> Self {
        match oid {
            "2.5.4.3" => AttributeType::CommonName,
            "2.5.4.6" => AttributeType::Country,
            "2.5.4.8" => AttributeType::State,
            "2.5.4.7" => AttributeType::Locality,
            "2.5.4.10" => AttributeType::Organization,
            "2.5.4.11" => AttributeType::OrganizationalUnit,
            "1.2.840.113549.1.9.1" => AttributeType::EmailAddress,
            other => AttributeType::Other(other.to_string()),
        }
    }

    fn nid(&self) -> Option<Nid> {
        match self {
            AttributeType::CommonName => Some(Nid::COMMONNAME),
            AttributeType::Country => Some(Nid::COUNTRYNAME),
            AttributeType::State => Some(Nid::STATEORPROVINCENAME),
            AttributeType::Locality => Some(Nid::LOCALITYNAME),
            AttributeType::Organization => Some(Nid::ORGANIZATIONNAME),
            AttributeType::OrganizationalUnit => Some(Nid::ORGANIZATIONALUNITNAME),
            AttributeType::EmailAddress => Some(Nid::PKCS9_EMAILADDRESS),
            AttributeType::Other(_) => None,
        }
    }

    fn upper_bound(&self) -> usize {
        match self {
            AttributeType::CommonName => UB_COMMON_NAME,
            AttributeType::Country => 2,
            AttributeType::State => UB_STATE,
            AttributeType::Locality => UB_LOCALITY,
            AttributeType::Organization => UB_ORGANIZATION,
            AttributeType::OrganizationalUnit => UB_ORGANIZATIONAL_UNIT,
            AttributeType::EmailAddress => UB_EMAIL_ADDRESS,
            AttributeType::Other(_) => 0,
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeType::CommonName => f.write_str("CN"),
            AttributeType::Country => f.write_str("C"),
            AttributeType::State => f.write_str("ST"),
            AttributeType::Locality => f.write_str("L"),
            AttributeType::Organization => f.write_str("O"),
            AttributeType::OrganizationalUnit => f.write_str("OU"),
            AttributeType::EmailAddress => f.write_str("emailAddress"),
            AttributeType::Other(oid) => f.write_str(oid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NameAttribute {
    pub kind: AttributeType,
    pub value: String,
}

/// Ordered sequence of attribute type/value pairs
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DistinguishedName {
    attributes: Vec<NameAttribute>,
}

impl DistinguishedName {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an attribute, keeping insertion order
    pub fn push(&mut self, kind: AttributeType, value: impl Into<String>) {
        self.attributes.push(NameAttribute {
            kind,
            value: value.into(),
        });
    }

    /// Builder-style [`push`](Self::push)
    pub fn with(mut self, kind: AttributeType, value: impl Into<String>) -> Self {
        self.push(kind, value);
        self
    }

    pub fn attributes(&self) -> &[NameAttribute] {
        &self.attributes
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// First value of `kind`, if present
    pub fn get(&self, kind: &AttributeType) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| &a.kind == kind)
            .map(|a| a.value.as_str())
    }

    pub fn common_name(&self) -> Option<&str> {
        self.get(&AttributeType::CommonName)
    }

    /// Encode as an OpenSSL name, rejecting attributes X.509 cannot carry
    ///
    /// # Errors
    /// [`PkiError::UnsupportedSubjectEncoding`] if an attribute is empty, too long,
    /// contains control characters, is a malformed country code, or has no
    /// known encoding.
    pub fn to_x509_name(&self) -> Result<X509Name> {
        let mut builder = X509Name::builder()?;
        for attribute in &self.attributes {
            check_encodable(attribute)?;
            let nid = attribute.kind.nid().ok_or_else(|| unsupported(
                attribute,
                "attribute type has no known string encoding",
            ))?;
            builder
                .append_entry_by_nid(nid, &attribute.value)
                .map_err(|e| unsupported(attribute, &e.to_string()))?;
        }
        Ok(builder.build())
    }

    /// Read a parsed name back into ordered attributes
    pub(crate) fn from_parsed(name: &ParsedName<'_>) -> std::result::Result<Self, String> {
        let mut dn = DistinguishedName::new();
        for attribute in name.iter_attributes() {
            let oid = attribute.attr_type().to_id_string();
            let value = attribute
                .as_str()
                .map_err(|e| format!("attribute {} is not a string: {}", oid, e))?;
            dn.push(AttributeType::from_oid(&oid), value);
        }
        Ok(dn)
    }
}

fn unsupported(attribute: &NameAttribute, reason: &str) -> PkiError {
    PkiError::UnsupportedSubjectEncoding {
        attribute: attribute.kind.to_string(),
        reason: reason.to_string(),
    }
}

fn check_encodable(attribute: &NameAttribute) -> Result<()> {
    let value = &attribute.value;
    if value.is_empty() {
        return Err(unsupported(attribute, "value is empty"));
    }
    if value.chars().any(char::is_control) {
        return Err(unsupported(attribute, "value contains control characters"));
    }
    let bound = attribute.kind.upper_bound();
    if value.chars().count() > bound {
        return Err(unsupported(
            attribute,
            &format!("value exceeds {} characters", bound),
        ));
    }
    match attribute.kind {
        AttributeType::Country
            if value.len() != 2 || !value.chars().all(|c| c.is_ascii_alphabetic()) =>
        {
            Err(unsupported(attribute, "country must be a two-letter ISO code"))
        }
        AttributeType::EmailAddress if !value.is_ascii() => {
            Err(unsupported(attribute, "email address must be ASCII"))
        }
        _ => Ok(()),
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .attributes
            .iter()
            .map(|a| format!("{}={}", a.kind, a.value))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

// ================= Subject Alternative Names =================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubjectAltName {
    Dns(String),
    Ip(IpAddr),
    Email(String),
}

impl SubjectAltName {
    /// Parse `dns:<name>`, `ip:<addr>` or `email:<addr>`; a bare value is a DNS name
    pub fn parse(text: &str) -> Result<Self> {
        let (kind, value) = text.split_once(':').unwrap_or(("dns", text));
        match kind.to_ascii_lowercase().as_str() {
            "dns" => Ok(SubjectAltName::Dns(value.to_string())),
            "email" => Ok(SubjectAltName::Email(value.to_string())),
            "ip" => value
                .parse()
                .map(SubjectAltName::Ip)
                .map_err(|_| PkiError::InvalidParameter(format!("invalid IP address: {}", value))),
            _ => Err(PkiError::InvalidParameter(format!(
                "unknown subject alternative name kind: {}",
                kind
            ))),
        }
    }

    pub(crate) fn from_general_name(name: &GeneralName<'_>) -> std::result::Result<Self, String> {
        match name {
            GeneralName::DNSName(dns) => Ok(SubjectAltName::Dns(dns.to_string())),
            GeneralName::RFC822Name(email) => Ok(SubjectAltName::Email(email.to_string())),
            GeneralName::IPAddress(bytes) => match bytes.len() {
                4 => {
                    let octets: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
                    Ok(SubjectAltName::Ip(IpAddr::from(octets)))
                }
                16 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(bytes);
                    Ok(SubjectAltName::Ip(IpAddr::from(octets)))
                }
                n => Err(format!("IP address SAN has invalid length {}", n)),
            },
            other => Err(format!("unsupported subject alternative name: {:?}", other)),
        }
    }
}

impl fmt::Display for SubjectAltName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectAltName::Dns(name) => write!(f, "DNS:{}", name),
            SubjectAltName::Ip(addr) => write!(f, "IP:{}", addr),
            SubjectAltName::Email(addr) => write!(f, "email:{}", addr),
        }
    }
}

/// Build the subjectAltName extension, or `None` for an empty list
pub(crate) fn san_extension(
    names: &[SubjectAltName],
    context: &X509v3Context<'_>,
) -> Result<Option<X509Extension>> {
    if names.is_empty() {
        return Ok(None);
    }
    let mut san = SubjectAlternativeName::new();
    for name in names {
        match name {
            SubjectAltName::Dns(dns) => {
                if dns.is_empty() || !dns.is_ascii() {
                    return Err(PkiError::InvalidParameter(format!(
                        "DNS name must be non-empty ASCII: {:?}",
                        dns
                    )));
                }
                san.dns(dns);
            }
            SubjectAltName::Ip(addr) => {
                san.ip(&addr.to_string());
            }
            SubjectAltName::Email(email) => {
                san.email(email);
            }
        }
    }
    Ok(Some(san.build(context)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_name() -> DistinguishedName {
        DistinguishedName::new()
            .with(AttributeType::CommonName, "client.example.local")
            .with(AttributeType::Organization, "example.local")
            .with(AttributeType::Country, "JP")
    }

    #[test]
    fn test_order_is_preserved() {
        let name = example_name();
        let kinds: Vec<_> = name.attributes().iter().map(|a| a.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                AttributeType::CommonName,
                AttributeType::Organization,
                AttributeType::Country
            ]
        );
        assert_eq!(name.common_name(), Some("client.example.local"));
        assert_eq!(
            name.to_string(),
            "CN=client.example.local, O=example.local, C=JP"
        );
    }

    #[test]
    fn test_encodes_to_openssl_name() {
        let x509_name = example_name().to_x509_name().unwrap();
        let entry = x509_name.entries_by_nid(Nid::COMMONNAME).next().unwrap();
        assert_eq!(entry.data().as_slice(), b"client.example.local");
    }

    #[test]
    fn test_rejects_unencodable_attributes() {
        let cases = [
            DistinguishedName::new().with(AttributeType::CommonName, ""),
            DistinguishedName::new().with(AttributeType::Country, "JPN"),
            DistinguishedName::new().with(AttributeType::Country, "J1"),
            DistinguishedName::new().with(AttributeType::CommonName, "a".repeat(65)),
            DistinguishedName::new().with(AttributeType::Locality, "bad\u{0}value"),
            DistinguishedName::new().with(AttributeType::Other("2.5.4.97".into()), "x"),
        ];
        for name in cases {
            match name.to_x509_name() {
                Err(PkiError::UnsupportedSubjectEncoding { .. }) => {}
                Err(other) => panic!("{:?} rejected with {:?}", name, other),
                Ok(_) => panic!("{:?} should be rejected", name),
            }
        }
    }

    #[test]
    fn test_email_attribute_is_encodable() {
        let name = example_name().with(AttributeType::EmailAddress, "client@example.local");
        assert!(name.to_x509_name().is_ok());
    }

    #[test]
    fn test_parse_subject_alt_names() {
        assert_eq!(
            SubjectAltName::parse("dns:server.example.local").unwrap(),
            SubjectAltName::Dns("server.example.local".into())
        );
        assert_eq!(
            SubjectAltName::parse("localhost").unwrap(),
            SubjectAltName::Dns("localhost".into())
        );
        assert_eq!(
            SubjectAltName::parse("ip:127.0.0.1").unwrap(),
            SubjectAltName::Ip("127.0.0.1".parse().unwrap())
        );
        assert_eq!(
            SubjectAltName::parse("ip:::1").unwrap(),
            SubjectAltName::Ip("::1".parse().unwrap())
        );
        assert!(SubjectAltName::parse("ip:not-an-ip").is_err());
        assert!(SubjectAltName::parse("uri:https://x").is_err());
    }
}
