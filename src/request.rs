//! Certificate Signing Request Module
//!
//! Builds PKCS#10 requests signed by the subject's own key and parses
//! requests received from elsewhere.
//!
//! # Request Properties
//! - **Version**: PKCS#10 v1
//! - **Subject**: ordered distinguished name, validated before encoding
//! - **Extensions**: subjectAltName (only when names are requested)
//! - **Signature**: SHA-256 with the subject key (SHA-384 for P-384 keys)
//!
//! # Example
//! ```rust,no_run
//! use pki_issuer::key_material::{KeyAlgorithm, KeyPair};
//! use pki_issuer::request::RequestBuilder;
//! # fn example() -> pki_issuer::Result<()> {
//! let key = KeyPair::generate(KeyAlgorithm::default())?;
//! let request = RequestBuilder::new(&key)
//!     .common_name("client.example.local")
//!     .organization("example.local")
//!     .country("JP")
//!     .subject_alt_name_dns("client.example.local")
//!     .build()?;
//! assert!(request.verify_signature());
//! # Ok(())
//! # }
//! ```

use openssl::stack::Stack;
use openssl::x509::X509Req;
use tracing::{debug, warn};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::FromDer;

use crate::error::{PkiError, Result};
use crate::key_material::{KeyPair, PublicKey};
use crate::name::{san_extension, AttributeType, DistinguishedName, SubjectAltName};

const CSR_VERSION_1: i32 = 0; // PKCS#10 v1 is represented by 0

/// A parsed certificate signing request
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateRequest {
    der: Vec<u8>,
    subject: DistinguishedName,
    subject_alt_names: Vec<SubjectAltName>,
    public_key: PublicKey,
}

impl CertificateRequest {
    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    pub fn subject_alt_names(&self) -> &[SubjectAltName] {
        &self.subject_alt_names
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    /// Re-check the self-signature against the embedded public key
    pub fn verify_signature(&self) -> bool {
        X509Req::from_der(&self.der)
            .and_then(|req| req.verify(self.public_key.pkey()))
            .unwrap_or(false)
    }
}

/// Encode `subject` and `subject_alt_names` into a request signed by `key_pair`
///
/// # Errors
/// - [`PkiError::UnsupportedSubjectEncoding`] if a subject attribute cannot be encoded
/// - [`PkiError::InvalidParameter`] for an empty subject or an unusable SAN
pub fn build(
    subject: &DistinguishedName,
    subject_alt_names: &[SubjectAltName],
    key_pair: &KeyPair,
) -> Result<CertificateRequest> {
    if subject.is_empty() {
        return Err(PkiError::InvalidParameter(
            "certificate request subject is empty".to_string(),
        ));
    }
    let name = subject.to_x509_name()?;

    let mut builder = X509Req::builder()?;
    builder.set_version(CSR_VERSION_1)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(key_pair.private_key())?;

    let san = {
        let context = builder.x509v3_context(None);
        san_extension(subject_alt_names, &context)?
    };
    if let Some(extension) = san {
        let mut extensions = Stack::new()?;
        extensions.push(extension)?;
        builder.add_extensions(&extensions)?;
    }

    builder.sign(key_pair.private_key(), key_pair.algorithm().signature_digest())?;
    let der = builder.build().to_der()?;
    debug!(%subject, "built certificate request");
    parse(&der)
}

/// Parse a DER request and verify its self-signature
///
/// # Errors
/// - [`PkiError::MalformedRequest`] on structural errors
/// - [`PkiError::SignatureMismatch`] if the signature does not verify under the embedded key
pub fn parse(der: &[u8]) -> Result<CertificateRequest> {
    let request = parse_unverified(der)?;
    if !request.verify_signature() {
        warn!(subject = %request.subject, "certificate request signature mismatch");
        return Err(PkiError::SignatureMismatch);
    }
    Ok(request)
}

/// Parse a DER request without checking its signature, for inspection only
pub fn parse_unverified(der: &[u8]) -> Result<CertificateRequest> {
    X509Req::from_der(der).map_err(|e| PkiError::MalformedRequest(e.to_string()))?;
    let (rest, csr) = X509CertificationRequest::from_der(der)
        .map_err(|e| PkiError::MalformedRequest(e.to_string()))?;
    if !rest.is_empty() {
        return Err(PkiError::MalformedRequest(format!(
            "{} trailing bytes after request",
            rest.len()
        )));
    }

    let info = &csr.certification_request_info;
    let subject = DistinguishedName::from_parsed(&info.subject).map_err(PkiError::MalformedRequest)?;
    let public_key = PublicKey::from_spki_der(info.subject_pki.raw)?;

    let mut subject_alt_names = Vec::new();
    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for general_name in &san.general_names {
                    subject_alt_names.push(
                        SubjectAltName::from_general_name(general_name)
                            .map_err(PkiError::MalformedRequest)?,
                    );
                }
            }
        }
    }

    Ok(CertificateRequest {
        der: der.to_vec(),
        subject,
        subject_alt_names,
        public_key,
    })
}

// ================= Request Builder =================

/// Fluent builder for certificate requests
///
/// Attributes land in the subject in the order the setters are called.
pub struct RequestBuilder<'k> {
    key_pair: &'k KeyPair,
    subject: DistinguishedName,
    subject_alt_names: Vec<SubjectAltName>,
}

impl<'k> RequestBuilder<'k> {
    pub fn new(key_pair: &'k KeyPair) -> Self {
        Self {
            key_pair,
            subject: DistinguishedName::new(),
            subject_alt_names: Vec::new(),
        }
    }

    /// Replace the subject wholesale
    pub fn subject(mut self, subject: DistinguishedName) -> Self {
        self.subject = subject;
        self
    }

    /// Set the common name (CN)
    pub fn common_name(mut self, cn: impl Into<String>) -> Self {
        self.subject.push(AttributeType::CommonName, cn);
        self
    }

    /// Set the organization (O)
    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.subject.push(AttributeType::Organization, org);
        self
    }

    /// Set the organizational unit (OU)
    pub fn organizational_unit(mut self, ou: impl Into<String>) -> Self {
        self.subject.push(AttributeType::OrganizationalUnit, ou);
        self
    }

    /// Set the locality (L)
    pub fn locality(mut self, locality: impl Into<String>) -> Self {
        self.subject.push(AttributeType::Locality, locality);
        self
    }

    /// Set the state/province (ST)
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.subject.push(AttributeType::State, state);
        self
    }

    /// Set the country (C), a two-letter ISO code
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.subject.push(AttributeType::Country, country);
        self
    }

    /// Add an emailAddress attribute and the matching email SAN
    pub fn email_address(mut self, email: impl Into<String>) -> Self {
        let email = email.into();
        self.subject.push(AttributeType::EmailAddress, email.clone());
        self.subject_alt_names.push(SubjectAltName::Email(email));
        self
    }

    pub fn subject_alt_name(mut self, name: SubjectAltName) -> Self {
        self.subject_alt_names.push(name);
        self
    }

    pub fn subject_alt_name_dns(self, dns: impl Into<String>) -> Self {
        self.subject_alt_name(SubjectAltName::Dns(dns.into()))
    }

    pub fn build(self) -> Result<CertificateRequest> {
        build(&self.subject, &self.subject_alt_names, self.key_pair)
    }
}
