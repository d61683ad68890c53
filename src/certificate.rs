//! Parsed X.509 certificate model
//!
//! A [`Certificate`] keeps its DER encoding alongside the fields the engine
//! reasons about (names, validity, key, CA flag, key usages, identifiers).
//! The DER is the source of truth; every field is read back from it.

use std::fmt;

use chrono::{DateTime, Utc};
use openssl::x509::X509;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::FromDer;

use crate::error::{PkiError, Result};
use crate::identifier::KeyIdentifier;
use crate::key_material::PublicKey;
use crate::name::{DistinguishedName, SubjectAltName};
use crate::serial::SerialNumber;

/// keyUsage bitset, bit `n` of the DER BIT STRING mapped to `1 << n`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct KeyUsage(u16);

impl KeyUsage {
    pub const DIGITAL_SIGNATURE: KeyUsage = KeyUsage(1 << 0);
    pub const NON_REPUDIATION: KeyUsage = KeyUsage(1 << 1);
    pub const KEY_ENCIPHERMENT: KeyUsage = KeyUsage(1 << 2);
    pub const DATA_ENCIPHERMENT: KeyUsage = KeyUsage(1 << 3);
    pub const KEY_AGREEMENT: KeyUsage = KeyUsage(1 << 4);
    pub const KEY_CERT_SIGN: KeyUsage = KeyUsage(1 << 5);
    pub const CRL_SIGN: KeyUsage = KeyUsage(1 << 6);

    pub const fn empty() -> Self {
        KeyUsage(0)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn union(self, other: KeyUsage) -> Self {
        KeyUsage(self.0 | other.0)
    }

    pub const fn contains(&self, other: KeyUsage) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for KeyUsage {
    type Output = KeyUsage;

    fn bitor(self, rhs: KeyUsage) -> KeyUsage {
        self.union(rhs)
    }
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(KeyUsage, &str); 7] = [
            (KeyUsage::DIGITAL_SIGNATURE, "digitalSignature"),
            (KeyUsage::NON_REPUDIATION, "nonRepudiation"),
            (KeyUsage::KEY_ENCIPHERMENT, "keyEncipherment"),
            (KeyUsage::DATA_ENCIPHERMENT, "dataEncipherment"),
            (KeyUsage::KEY_AGREEMENT, "keyAgreement"),
            (KeyUsage::KEY_CERT_SIGN, "keyCertSign"),
            (KeyUsage::CRL_SIGN, "cRLSign"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtendedKeyUsage {
    ServerAuth,
    ClientAuth,
}

impl fmt::Display for ExtendedKeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtendedKeyUsage::ServerAuth => f.write_str("serverAuth"),
            ExtendedKeyUsage::ClientAuth => f.write_str("clientAuth"),
        }
    }
}

/// An issued (or imported) X.509 v3 certificate
#[derive(Debug, Clone)]
pub struct Certificate {
    der: Vec<u8>,
    serial: SerialNumber,
    issuer: DistinguishedName,
    subject: DistinguishedName,
    issuer_der: Vec<u8>,
    subject_der: Vec<u8>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    public_key: PublicKey,
    is_ca: bool,
    path_len: Option<u32>,
    key_usage: Option<KeyUsage>,
    extended_key_usage: Vec<ExtendedKeyUsage>,
    subject_key_id: Option<KeyIdentifier>,
    authority_key_id: Option<KeyIdentifier>,
    subject_alt_names: Vec<SubjectAltName>,
}

fn malformed(reason: impl fmt::Display) -> PkiError {
    PkiError::MalformedCertificate(reason.to_string())
}

fn timestamp(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0).ok_or_else(|| malformed(format!("timestamp {} out of range", ts)))
}

fn key_identifier(bytes: &[u8], which: &str) -> Result<KeyIdentifier> {
    KeyIdentifier::from_slice(bytes).ok_or_else(|| {
        malformed(format!(
            "{} is {} bytes, expected 20",
            which,
            bytes.len()
        ))
    })
}

impl Certificate {
    /// Parse a DER certificate
    ///
    /// # Errors
    /// [`PkiError::MalformedCertificate`] on any structural problem, including
    /// duplicated or unparsable extensions the engine relies on.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (rest, cert) = X509Certificate::from_der(der).map_err(malformed)?;
        if !rest.is_empty() {
            return Err(malformed(format!("{} trailing bytes after certificate", rest.len())));
        }

        let issuer = DistinguishedName::from_parsed(cert.issuer()).map_err(malformed)?;
        let subject = DistinguishedName::from_parsed(cert.subject()).map_err(malformed)?;
        let validity = cert.validity();
        let not_before = timestamp(validity.not_before.timestamp())?;
        let not_after = timestamp(validity.not_after.timestamp())?;
        let public_key = PublicKey::from_spki_der(cert.public_key().raw)?;

        let (is_ca, path_len) = match cert.basic_constraints().map_err(malformed)? {
            Some(ext) => (ext.value.ca, ext.value.path_len_constraint),
            None => (false, None),
        };
        let key_usage = cert
            .key_usage()
            .map_err(malformed)?
            .map(|ext| KeyUsage(ext.value.flags));

        let mut extended_key_usage = Vec::new();
        if let Some(ext) = cert.extended_key_usage().map_err(malformed)? {
            if ext.value.server_auth {
                extended_key_usage.push(ExtendedKeyUsage::ServerAuth);
            }
            if ext.value.client_auth {
                extended_key_usage.push(ExtendedKeyUsage::ClientAuth);
            }
        }

        let mut subject_alt_names = Vec::new();
        if let Some(ext) = cert.subject_alternative_name().map_err(malformed)? {
            for general_name in &ext.value.general_names {
                subject_alt_names.push(SubjectAltName::from_general_name(general_name).map_err(malformed)?);
            }
        }

        let mut subject_key_id = None;
        let mut authority_key_id = None;
        for extension in cert.extensions() {
            match extension.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(id) => {
                    subject_key_id = Some(key_identifier(id.0, "subjectKeyIdentifier")?);
                }
                ParsedExtension::AuthorityKeyIdentifier(aki) => {
                    if let Some(id) = &aki.key_identifier {
                        authority_key_id = Some(key_identifier(id.0, "authorityKeyIdentifier")?);
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            der: der.to_vec(),
            serial: SerialNumber::from_be_bytes(cert.raw_serial()),
            issuer,
            subject,
            issuer_der: cert.issuer().as_raw().to_vec(),
            subject_der: cert.subject().as_raw().to_vec(),
            not_before,
            not_after,
            public_key,
            is_ca,
            path_len,
            key_usage,
            extended_key_usage,
            subject_key_id,
            authority_key_id,
            subject_alt_names,
        })
    }

    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    pub fn serial(&self) -> &SerialNumber {
        &self.serial
    }

    pub fn issuer(&self) -> &DistinguishedName {
        &self.issuer
    }

    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    /// Issuer `Name` exactly as encoded, RDN structure and string types included
    pub fn issuer_der(&self) -> &[u8] {
        &self.issuer_der
    }

    pub fn subject_der(&self) -> &[u8] {
        &self.subject_der
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Whether `at` falls inside `[not_before, not_after]`
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    pub fn path_len(&self) -> Option<u32> {
        self.path_len
    }

    /// keyUsage bits, `None` when the extension is absent
    pub fn key_usage(&self) -> Option<KeyUsage> {
        self.key_usage
    }

    pub fn extended_key_usage(&self) -> &[ExtendedKeyUsage] {
        &self.extended_key_usage
    }

    pub fn subject_key_id(&self) -> Option<&KeyIdentifier> {
        self.subject_key_id.as_ref()
    }

    pub fn authority_key_id(&self) -> Option<&KeyIdentifier> {
        self.authority_key_id.as_ref()
    }

    pub fn subject_alt_names(&self) -> &[SubjectAltName] {
        &self.subject_alt_names
    }

    /// Issuer name is encoded identically to the subject name
    pub fn is_self_issued(&self) -> bool {
        self.issuer_der == self.subject_der
    }

    pub(crate) fn to_x509(&self) -> Result<X509> {
        X509::from_der(&self.der).map_err(malformed)
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}
