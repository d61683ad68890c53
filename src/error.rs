//! Error taxonomy for the issuance engine
//!
//! Every core operation returns [`Result<T>`] with a [`PkiError`]. Chain
//! verification failures are reported through [`ChainError`] so callers can
//! tell an expired certificate apart from a wrong issuer or a bad signature.
//!
//! Only [`PkiError::InsufficientEntropy`] is worth retrying; every other kind
//! is deterministic for the same input.

use std::fmt;

use chrono::{DateTime, Utc};
use openssl::error::ErrorStack;
use thiserror::Error;

/// Which certificate of a leaf/authority pair a validity error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateRole {
    Leaf,
    Authority,
}

impl fmt::Display for CertificateRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateRole::Leaf => f.write_str("leaf"),
            CertificateRole::Authority => f.write_str("authority"),
        }
    }
}

/// First violated condition found while checking a leaf against its CA
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("`{subject}` is not a certificate authority")]
    NotACA { subject: String },

    #[error("certificate issued by `{issuer}` does not chain to `{authority}`")]
    WrongIssuer { issuer: String, authority: String },

    #[error("certificate signature does not verify under the authority's public key")]
    BadSignature,

    #[error("{role} certificate expired at {not_after}")]
    Expired {
        role: CertificateRole,
        not_after: DateTime<Utc>,
    },

    #[error("{role} certificate is not valid before {not_before}")]
    NotYetValid {
        role: CertificateRole,
        not_before: DateTime<Utc>,
    },
}

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("malformed private key: {0}")]
    MalformedKey(String),

    #[error("malformed certificate request: {0}")]
    MalformedRequest(String),

    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),

    #[error("malformed artifact: {0}")]
    MalformedArtifact(String),

    #[error("unsupported key type: expected {expected}, found {found}")]
    UnsupportedKeyType { expected: String, found: String },

    #[error("attribute {attribute} cannot be encoded: {reason}")]
    UnsupportedSubjectEncoding { attribute: String, reason: String },

    #[error("certificate request signature does not verify under its embedded public key")]
    SignatureMismatch,

    #[error("certificate request for `{subject}` carries an invalid self-signature")]
    InvalidRequestSignature { subject: String },

    #[error("CA private key does not match the CA certificate `{subject}`")]
    CAKeyMismatch { subject: String },

    #[error("`{subject}` cannot issue certificates: not a CA certificate")]
    NotACertificateAuthority { subject: String },

    #[error("secure random source unavailable: {0}")]
    InsufficientEntropy(String),

    #[error("no unused serial number found after {attempts} draws")]
    SerialSpaceExhausted { attempts: usize },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("cryptographic backend error: {0}")]
    Crypto(#[source] ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PkiError {
    /// Whether retrying the same call (with backoff) can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, PkiError::InsufficientEntropy(_))
    }
}

/// OpenSSL's name for the RAND library in error reports
const RAND_LIBRARY: &str = "random number generator";

fn is_random_failure(library: Option<&str>, reason: Option<&str>) -> bool {
    library == Some(RAND_LIBRARY)
        || reason.map_or(false, |r| {
            let r = r.to_ascii_lowercase();
            r.contains("entropy") || r.contains("drbg")
        })
}

/// Backend errors raised by the random generator (key generation, ECDSA
/// nonces, RSA blinding) become [`PkiError::InsufficientEntropy`]
impl From<ErrorStack> for PkiError {
    fn from(stack: ErrorStack) -> Self {
        let random_failure = stack
            .errors()
            .iter()
            .any(|e| is_random_failure(e.library(), e.reason()));
        if random_failure {
            PkiError::InsufficientEntropy(stack.to_string())
        } else {
            PkiError::Crypto(stack)
        }
    }
}

pub type Result<T> = std::result::Result<T, PkiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_entropy_is_retryable() {
        assert!(PkiError::InsufficientEntropy("starved".into()).is_retryable());
        assert!(!PkiError::SignatureMismatch.is_retryable());
        assert!(!PkiError::MalformedKey("truncated".into()).is_retryable());
        assert!(!PkiError::Chain(ChainError::BadSignature).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let e = ChainError::Expired {
            role: CertificateRole::Leaf,
            not_after: DateTime::from_timestamp(0, 0).unwrap(),
        };
        assert_eq!(
            e.to_string(),
            "leaf certificate expired at 1970-01-01 00:00:00 UTC"
        );

        let e = PkiError::UnsupportedKeyType {
            expected: "RSA".into(),
            found: "EC".into(),
        };
        assert_eq!(e.to_string(), "unsupported key type: expected RSA, found EC");
    }

    #[test]
    fn test_chain_error_converts() {
        let e: PkiError = ChainError::BadSignature.into();
        assert!(matches!(e, PkiError::Chain(ChainError::BadSignature)));
    }

    #[test]
    fn test_random_generator_failures_are_retryable() {
        assert!(is_random_failure(Some("random number generator"), None));
        assert!(is_random_failure(Some("Provider routines"), Some("entropy source failure")));
        assert!(is_random_failure(None, Some("error retrieving entropy")));
        assert!(!is_random_failure(Some("asn1 encoding routines"), Some("wrong tag")));
        assert!(!is_random_failure(None, None));
    }

    #[test]
    fn test_other_backend_errors_are_not_retryable() {
        let stack = openssl::pkey::PKey::private_key_from_der(b"not a key")
            .err()
            .expect("garbage must not decode");
        let e: PkiError = stack.into();
        assert!(matches!(e, PkiError::Crypto(_)));
        assert!(!e.is_retryable());
    }
}
