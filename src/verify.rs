//! Chain verification of a leaf certificate against its issuing CA
//!
//! Checks run in a fixed order and the first failure is returned:
//! 1. the CA certificate is a CA (basicConstraints CA=true, and keyCertSign
//!    when keyUsage is present)
//! 2. the leaf names the CA as issuer: its issuer `Name` is byte-identical to
//!    the CA subject, and its authorityKeyIdentifier equals the CA
//!    subjectKeyIdentifier (a leaf without one does not match)
//! 3. the CA public key verifies the leaf signature
//! 4. `at` lies inside the leaf validity window
//! 5. `at` lies inside the CA validity window

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::certificate::{Certificate, KeyUsage};
use crate::error::{CertificateRole, ChainError};

/// Verify `leaf` against `ca` at instant `at`
///
/// A self-signed root verifies against itself.
pub fn verify(leaf: &Certificate, ca: &Certificate, at: DateTime<Utc>) -> Result<(), ChainError> {
    let result = check(leaf, ca, at);
    match &result {
        Ok(()) => debug!(
            leaf = %leaf.subject(),
            authority = %ca.subject(),
            %at,
            "chain verified"
        ),
        Err(e) => warn!(leaf = %leaf.subject(), authority = %ca.subject(), "chain rejected: {}", e),
    }
    result
}

fn check(leaf: &Certificate, ca: &Certificate, at: DateTime<Utc>) -> Result<(), ChainError> {
    let can_sign_certificates = ca
        .key_usage()
        .map_or(true, |usage| usage.contains(KeyUsage::KEY_CERT_SIGN));
    if !ca.is_ca() || !can_sign_certificates {
        return Err(ChainError::NotACA {
            subject: ca.subject().to_string(),
        });
    }

    let wrong_issuer = || ChainError::WrongIssuer {
        issuer: leaf.issuer().to_string(),
        authority: ca.subject().to_string(),
    };
    if leaf.issuer_der() != ca.subject_der() {
        return Err(wrong_issuer());
    }
    if leaf.authority_key_id().is_none() || leaf.authority_key_id() != ca.subject_key_id() {
        return Err(wrong_issuer());
    }

    let signature_ok = leaf
        .to_x509()
        .ok()
        .and_then(|x509| x509.verify(ca.public_key().pkey()).ok())
        .unwrap_or(false);
    if !signature_ok {
        return Err(ChainError::BadSignature);
    }

    check_validity(leaf, CertificateRole::Leaf, at)?;
    check_validity(ca, CertificateRole::Authority, at)
}

fn check_validity(cert: &Certificate, role: CertificateRole, at: DateTime<Utc>) -> Result<(), ChainError> {
    if at < cert.not_before() {
        return Err(ChainError::NotYetValid {
            role,
            not_before: cert.not_before(),
        });
    }
    if at > cert.not_after() {
        return Err(ChainError::Expired {
            role,
            not_after: cert.not_after(),
        });
    }
    Ok(())
}
