//! Certificate Issuance Module
//!
//! Self-issues root CA certificates and issues leaf certificates from
//! certificate requests.
//!
//! # PKI Hierarchy
//! ```text
//! Root CA (self-signed, pathlen=0)   <- issue_root
//!   └── Leaf certificate (CA=false)  <- issue_leaf
//! ```
//!
//! # Issuance States
//! Every issuance moves through `Drafted → SerialAssigned → Extended → Signed`.
//! Each transition consumes the previous state, so no step can be skipped or
//! repeated, and a failure anywhere drops the half-built certificate. Nothing
//! is returned unless the certificate is completely signed.
//!
//! # Certificate Properties
//! | | Root | Leaf |
//! |---|---|---|
//! | Basic Constraints | CA=true, pathlen=0, critical | CA=false, critical |
//! | Key Usage | keyCertSign, cRLSign, digitalSignature | digitalSignature, keyEncipherment |
//! | Extended Key Usage | none | per [`ExtensionProfile`] |
//! | Subject Key Identifier | derive(own key) | derive(request key) |
//! | Authority Key Identifier | derive(own key) | derive(CA key) |
//! | Validity | `[now - skew, now + years]` | `[now - skew, now + years]` |
//! | Serial | random, `serial_bits` wide | from the CA's [`SerialAllocator`] |

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Months, Utc};
use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time};
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage as ExtendedKeyUsageBuilder, KeyUsage as KeyUsageBuilder,
};
use openssl::x509::{X509Builder, X509Extension, X509NameRef, X509Req, X509};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::certificate::{Certificate, ExtendedKeyUsage, KeyUsage};
use crate::clock::{truncate_to_seconds, Clock, SystemClock};
use crate::error::{PkiError, Result};
use crate::identifier::{derive, KeyIdentifier};
use crate::key_material::{KeyPair, PublicKey};
use crate::name::{san_extension, DistinguishedName, SubjectAltName};
use crate::request::CertificateRequest;
use crate::serial::{
    OsRandom, RandomSource, SerialAllocator, SerialNumber, SerialPolicy, DEFAULT_SERIAL_BITS,
};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const ROOT_CA_PATH_LENGTH: u32 = 0;
const MAX_VALIDITY_YEARS: u32 = 100;
const OID_SUBJECT_KEY_IDENTIFIER: &str = "2.5.29.14";
const OID_AUTHORITY_KEY_IDENTIFIER: &str = "2.5.29.35";
const KEY_PAIR_CHALLENGE: &[u8] = b"pki-issuer authority key pair challenge";

/// Default backdating of `notBefore`, absorbing clock drift between parties
pub const DEFAULT_CLOCK_SKEW_MARGIN_SECS: i64 = 300;
/// Largest accepted backdating of `notBefore`
pub const MAX_CLOCK_SKEW_MARGIN_SECS: i64 = 24 * 60 * 60;

pub const ROOT_KEY_USAGE: KeyUsage = KeyUsage::KEY_CERT_SIGN
    .union(KeyUsage::CRL_SIGN)
    .union(KeyUsage::DIGITAL_SIGNATURE);

pub const LEAF_KEY_USAGE: KeyUsage = KeyUsage::DIGITAL_SIGNATURE.union(KeyUsage::KEY_ENCIPHERMENT);

/// Extended key usage selected for a leaf
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionProfile {
    ClientAuth,
    ServerAuth,
    #[default]
    ClientAndServer,
}

impl ExtensionProfile {
    pub fn extended_key_usages(&self) -> &'static [ExtendedKeyUsage] {
        match self {
            ExtensionProfile::ClientAuth => &[ExtendedKeyUsage::ClientAuth],
            ExtensionProfile::ServerAuth => &[ExtendedKeyUsage::ServerAuth],
            ExtensionProfile::ClientAndServer => {
                &[ExtendedKeyUsage::ClientAuth, ExtendedKeyUsage::ServerAuth]
            }
        }
    }
}

impl FromStr for ExtensionProfile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "client_auth" | "client" => Ok(ExtensionProfile::ClientAuth),
            "server_auth" | "server" => Ok(ExtensionProfile::ServerAuth),
            "client_and_server" | "both" => Ok(ExtensionProfile::ClientAndServer),
            other => Err(format!(
                "unknown profile `{}` (expected client_auth, server_auth or client_and_server)",
                other
            )),
        }
    }
}

impl fmt::Display for ExtensionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionProfile::ClientAuth => f.write_str("client_auth"),
            ExtensionProfile::ServerAuth => f.write_str("server_auth"),
            ExtensionProfile::ClientAndServer => f.write_str("client_and_server"),
        }
    }
}

// ================= Certificate Authority =================

/// A CA certificate, its private key, and its serial allocation state
///
/// Safe to share across threads: issuance only reads the certificate and key,
/// and the allocator synchronizes itself.
pub struct CertificateAuthority {
    certificate: Certificate,
    key_pair: KeyPair,
    serials: SerialAllocator,
}

impl CertificateAuthority {
    /// Assemble an authority from its parts
    ///
    /// The key pair is not checked here; [`CertificateIssuer::issue_leaf`]
    /// checks it before every issuance.
    ///
    /// # Errors
    /// [`PkiError::NotACertificateAuthority`] if the certificate is not a CA.
    pub fn new(certificate: Certificate, key_pair: KeyPair, serials: SerialAllocator) -> Result<Self> {
        if !certificate.is_ca() {
            return Err(PkiError::NotACertificateAuthority {
                subject: certificate.subject().to_string(),
            });
        }
        serials.record(certificate.serial());
        Ok(Self {
            certificate,
            key_pair,
            serials,
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn serials(&self) -> &SerialAllocator {
        &self.serials
    }

    pub fn into_parts(self) -> (Certificate, KeyPair) {
        (self.certificate, self.key_pair)
    }

    /// Signature self-check: the private key must produce signatures the
    /// certificate's public key accepts
    pub fn check_key_pair(&self) -> Result<()> {
        let signature = self.key_pair.sign(KEY_PAIR_CHALLENGE)?;
        if self.certificate.public_key().verify(KEY_PAIR_CHALLENGE, &signature) {
            Ok(())
        } else {
            warn!(subject = %self.certificate.subject(), "CA key does not match CA certificate");
            Err(PkiError::CAKeyMismatch {
                subject: self.certificate.subject().to_string(),
            })
        }
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("subject", &self.certificate.subject().to_string())
            .field("serial", &self.certificate.serial().to_string())
            .field("key_pair", &self.key_pair)
            .field("serials", &self.serials)
            .finish()
    }
}

// ================= Issuance State Machine =================

/// Issuance state: names, key and validity window set
pub struct Drafted;
/// Issuance state: serial number set
pub struct SerialAssigned;
/// Issuance state: all extensions appended, ready to sign
pub struct Extended;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityWindow {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl ValidityWindow {
    /// `[now - skew, now + years]`, computed from one clock reading
    ///
    /// # Errors
    /// [`PkiError::InvalidParameter`] when `validity_years` is outside
    /// `1..=100`, when the skew margin is negative or above
    /// [`MAX_CLOCK_SKEW_MARGIN_SECS`], or when either bound is not representable.
    pub fn starting_at(now: DateTime<Utc>, validity_years: u32, clock_skew_margin: Duration) -> Result<Self> {
        if clock_skew_margin < Duration::zero()
            || clock_skew_margin > Duration::seconds(MAX_CLOCK_SKEW_MARGIN_SECS)
        {
            return Err(PkiError::InvalidParameter(format!(
                "clock skew margin must be within 0..={} seconds, got {}",
                MAX_CLOCK_SKEW_MARGIN_SECS,
                clock_skew_margin.num_seconds()
            )));
        }
        if validity_years == 0 || validity_years > MAX_VALIDITY_YEARS {
            return Err(PkiError::InvalidParameter(format!(
                "validity must be between 1 and {} years, got {}",
                MAX_VALIDITY_YEARS, validity_years
            )));
        }
        let now = truncate_to_seconds(now);
        let not_before = now
            .checked_sub_signed(clock_skew_margin)
            .ok_or_else(|| PkiError::InvalidParameter("validity start out of range".to_string()))?;
        let not_after = now
            .checked_add_months(Months::new(validity_years * 12))
            .ok_or_else(|| PkiError::InvalidParameter("validity end out of range".to_string()))?;
        if not_before > not_after {
            return Err(PkiError::InvalidParameter(format!(
                "validity start {} is after its end {}",
                not_before, not_after
            )));
        }
        Ok(Self {
            not_before,
            not_after,
        })
    }
}

struct ExtensionSet {
    is_ca: bool,
    path_len: Option<u32>,
    key_usage: KeyUsage,
    extended_key_usage: Vec<ExtendedKeyUsage>,
    subject_key_id: KeyIdentifier,
    authority_key_id: KeyIdentifier,
    subject_alt_names: Vec<SubjectAltName>,
}

/// A certificate body under construction
pub struct Issuance<State> {
    builder: X509Builder,
    subject: String,
    _state: PhantomData<State>,
}

impl<State> Issuance<State> {
    fn advance<Next>(self) -> Issuance<Next> {
        Issuance {
            builder: self.builder,
            subject: self.subject,
            _state: PhantomData,
        }
    }
}

fn raw_extension(oid: &str, critical: bool, value_der: &[u8]) -> Result<X509Extension> {
    let oid = Asn1Object::from_str(oid)?;
    let contents = Asn1OctetString::new_from_bytes(value_der)?;
    Ok(X509Extension::new_from_der(&oid, critical, &contents)?)
}

impl Issuance<Drafted> {
    fn draft(
        subject: &X509NameRef,
        subject_display: String,
        issuer: &X509NameRef,
        public_key: &PublicKey,
        window: &ValidityWindow,
    ) -> Result<Self> {
        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;
        builder.set_subject_name(subject)?;
        builder.set_issuer_name(issuer)?;
        builder.set_pubkey(public_key.pkey())?;

        let not_before = Asn1Time::from_unix(window.not_before.timestamp())?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::from_unix(window.not_after.timestamp())?;
        builder.set_not_after(&not_after)?;

        Ok(Self {
            builder,
            subject: subject_display,
            _state: PhantomData,
        })
    }

    fn assign_serial(mut self, serial: SerialNumber) -> Result<Issuance<SerialAssigned>> {
        let asn1_serial = serial.to_asn1_integer()?;
        self.builder.set_serial_number(&asn1_serial)?;
        debug!(subject = %self.subject, %serial, "serial assigned");
        Ok(self.advance())
    }
}

impl Issuance<SerialAssigned> {
    fn extend(mut self, extensions: &ExtensionSet) -> Result<Issuance<Extended>> {
        let mut bc = BasicConstraints::new();
        bc.critical();
        if extensions.is_ca {
            bc.ca();
            if let Some(path_len) = extensions.path_len {
                bc.pathlen(path_len);
            }
        }
        self.builder.append_extension(bc.build()?)?;

        let mut ku = KeyUsageBuilder::new();
        ku.critical();
        let usage = extensions.key_usage;
        if usage.contains(KeyUsage::DIGITAL_SIGNATURE) {
            ku.digital_signature();
        }
        if usage.contains(KeyUsage::NON_REPUDIATION) {
            ku.non_repudiation();
        }
        if usage.contains(KeyUsage::KEY_ENCIPHERMENT) {
            ku.key_encipherment();
        }
        if usage.contains(KeyUsage::DATA_ENCIPHERMENT) {
            ku.data_encipherment();
        }
        if usage.contains(KeyUsage::KEY_AGREEMENT) {
            ku.key_agreement();
        }
        if usage.contains(KeyUsage::KEY_CERT_SIGN) {
            ku.key_cert_sign();
        }
        if usage.contains(KeyUsage::CRL_SIGN) {
            ku.crl_sign();
        }
        self.builder.append_extension(ku.build()?)?;

        if !extensions.extended_key_usage.is_empty() {
            let mut eku = ExtendedKeyUsageBuilder::new();
            for purpose in &extensions.extended_key_usage {
                match purpose {
                    ExtendedKeyUsage::ServerAuth => eku.server_auth(),
                    ExtendedKeyUsage::ClientAuth => eku.client_auth(),
                };
            }
            self.builder.append_extension(eku.build()?)?;
        }

        self.builder.append_extension(raw_extension(
            OID_SUBJECT_KEY_IDENTIFIER,
            false,
            &extensions.subject_key_id.subject_key_identifier_der(),
        )?)?;
        self.builder.append_extension(raw_extension(
            OID_AUTHORITY_KEY_IDENTIFIER,
            false,
            &extensions.authority_key_id.authority_key_identifier_der(),
        )?)?;

        let san = {
            let context = self.builder.x509v3_context(None, None);
            san_extension(&extensions.subject_alt_names, &context)?
        };
        if let Some(san) = san {
            self.builder.append_extension(san)?;
        }

        Ok(self.advance())
    }
}

impl Issuance<Extended> {
    /// Sign the TBS structure; this is the only way out of the state machine
    fn sign(mut self, signer: &KeyPair) -> Result<Certificate> {
        self.builder
            .sign(signer.private_key(), signer.algorithm().signature_digest())?;
        let der = self.builder.build().to_der()?;
        let certificate = Certificate::from_der(&der)?;
        info!(
            subject = %self.subject,
            serial = %certificate.serial(),
            not_after = %certificate.not_after(),
            "certificate signed"
        );
        Ok(certificate)
    }
}

// ================= Certificate Issuer =================

/// Issues root and leaf certificates
///
/// Holds the external collaborators issuance needs: a wall clock and a secure
/// random source. Both default to the system implementations.
pub struct CertificateIssuer {
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    clock_skew_margin: Duration,
    serial_bits: u32,
}

impl Default for CertificateIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateIssuer {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            random: Arc::new(OsRandom),
            clock_skew_margin: Duration::seconds(DEFAULT_CLOCK_SKEW_MARGIN_SECS),
            serial_bits: DEFAULT_SERIAL_BITS,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_random_source(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Backdating applied to `notBefore`; values outside
    /// `0..=MAX_CLOCK_SKEW_MARGIN_SECS` make every issuance fail with
    /// [`PkiError::InvalidParameter`]
    pub fn with_clock_skew_margin(mut self, margin: Duration) -> Self {
        self.clock_skew_margin = margin;
        self
    }

    /// Width of root serials; leaf serials follow the CA's own allocator
    pub fn with_serial_bits(mut self, bits: u32) -> Self {
        self.serial_bits = bits;
        self
    }

    /// Fresh allocator using this issuer's serial width
    pub fn serial_allocator(&self, policy: SerialPolicy) -> Result<SerialAllocator> {
        SerialAllocator::new(policy, self.serial_bits)
    }

    /// Self-issue a root CA certificate for `key_pair`
    ///
    /// # Errors
    /// - [`PkiError::UnsupportedSubjectEncoding`] if the subject cannot be encoded
    /// - [`PkiError::InvalidParameter`] for an empty subject or out-of-range validity
    /// - [`PkiError::InsufficientEntropy`] if no serial could be drawn (retryable)
    pub fn issue_root(
        &self,
        subject: &DistinguishedName,
        key_pair: &KeyPair,
        validity_years: u32,
    ) -> Result<Certificate> {
        if subject.is_empty() {
            return Err(PkiError::InvalidParameter("root subject is empty".to_string()));
        }
        let name = subject.to_x509_name()?;
        let public_key = key_pair.public_key()?;
        let key_id = derive(&public_key);

        let window = ValidityWindow::starting_at(self.clock.now(), validity_years, self.clock_skew_margin)?;
        let serial = SerialAllocator::new(SerialPolicy::Random, self.serial_bits)?
            .allocate(self.random.as_ref())?;

        let extensions = ExtensionSet {
            is_ca: true,
            path_len: Some(ROOT_CA_PATH_LENGTH),
            key_usage: ROOT_KEY_USAGE,
            extended_key_usage: Vec::new(),
            subject_key_id: key_id,
            authority_key_id: key_id,
            subject_alt_names: Vec::new(),
        };

        Issuance::draft(&name, subject.to_string(), &name, &public_key, &window)?
            .assign_serial(serial)?
            .extend(&extensions)?
            .sign(key_pair)
    }

    /// Issue a leaf certificate for `request`, signed by `ca`
    ///
    /// The request's subject, public key and subject alternative names are
    /// copied into the certificate.
    ///
    /// # Errors
    /// - [`PkiError::InvalidRequestSignature`] if the request's self-signature fails
    /// - [`PkiError::NotACertificateAuthority`] if the CA certificate is not a CA
    /// - [`PkiError::CAKeyMismatch`] if the CA key does not belong to the CA certificate
    /// - [`PkiError::InsufficientEntropy`] if no serial could be drawn (retryable)
    pub fn issue_leaf(
        &self,
        ca: &CertificateAuthority,
        request: &CertificateRequest,
        validity_years: u32,
        profile: ExtensionProfile,
    ) -> Result<Certificate> {
        if !request.verify_signature() {
            warn!(subject = %request.subject(), "rejecting request with invalid self-signature");
            return Err(PkiError::InvalidRequestSignature {
                subject: request.subject().to_string(),
            });
        }
        if !ca.certificate().is_ca() {
            return Err(PkiError::NotACertificateAuthority {
                subject: ca.certificate().subject().to_string(),
            });
        }
        ca.check_key_pair()?;

        let window = ValidityWindow::starting_at(self.clock.now(), validity_years, self.clock_skew_margin)?;

        let req = X509Req::from_der(request.to_der())
            .map_err(|e| PkiError::MalformedRequest(e.to_string()))?;
        let ca_x509 = ca.certificate().to_x509()?;

        let extensions = ExtensionSet {
            is_ca: false,
            path_len: None,
            key_usage: LEAF_KEY_USAGE,
            extended_key_usage: profile.extended_key_usages().to_vec(),
            subject_key_id: derive(request.public_key()),
            authority_key_id: derive(ca.certificate().public_key()),
            subject_alt_names: request.subject_alt_names().to_vec(),
        };

        let drafted = Issuance::draft(
            req.subject_name(),
            request.subject().to_string(),
            ca_x509.subject_name(),
            request.public_key(),
            &window,
        )?;
        let serial = ca.serials().allocate(self.random.as_ref())?;
        drafted
            .assign_serial(serial)?
            .extend(&extensions)?
            .sign(ca.key_pair())
    }
}
