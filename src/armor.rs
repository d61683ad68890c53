//! PEM armor for persisted artifacts
//!
//! | Artifact | Label |
//! |---|---|
//! | RSA private key (PKCS#1) | `RSA PRIVATE KEY` |
//! | EC private key (PKCS#8) | `PRIVATE KEY` |
//! | Certificate signing request | `CERTIFICATE REQUEST` |
//! | Certificate | `CERTIFICATE` |
//!
//! Decoding checks the label against the artifact the caller expects, then
//! hands the DER to the parser for that artifact.

use pem::{EncodeConfig, LineEnding, Pem};

use crate::certificate::Certificate;
use crate::error::{PkiError, Result};
use crate::key_material::{KeyKind, KeyPair};
use crate::request::{self, CertificateRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    RsaPrivateKey,
    PrivateKey,
    CertificateRequest,
    Certificate,
}

impl ArtifactKind {
    pub fn label(&self) -> &'static str {
        match self {
            ArtifactKind::RsaPrivateKey => "RSA PRIVATE KEY",
            ArtifactKind::PrivateKey => "PRIVATE KEY",
            ArtifactKind::CertificateRequest => "CERTIFICATE REQUEST",
            ArtifactKind::Certificate => "CERTIFICATE",
        }
    }

    pub fn for_key(kind: KeyKind) -> Self {
        match kind {
            KeyKind::Rsa => ArtifactKind::RsaPrivateKey,
            KeyKind::Ec => ArtifactKind::PrivateKey,
        }
    }
}

/// Wrap `der` in a PEM block labelled for `kind`
pub fn encode(kind: ArtifactKind, der: Vec<u8>) -> String {
    let block = Pem::new(kind.label(), der);
    pem::encode_config(&block, EncodeConfig::new().set_line_ending(LineEnding::LF))
}

/// Unwrap the first PEM block in `text`, which must be labelled for `kind`
pub fn decode(kind: ArtifactKind, text: &str) -> Result<Vec<u8>> {
    let block = pem::parse(text).map_err(|e| PkiError::MalformedArtifact(e.to_string()))?;
    if block.tag() != kind.label() {
        return Err(PkiError::MalformedArtifact(format!(
            "expected a `{}` block, found `{}`",
            kind.label(),
            block.tag()
        )));
    }
    Ok(block.into_contents())
}

pub fn encode_private_key(key_pair: &KeyPair) -> Result<String> {
    let kind = ArtifactKind::for_key(key_pair.algorithm().kind());
    Ok(encode(kind, key_pair.encode()?))
}

/// Decode a private key of the expected scheme
///
/// A block labelled for the other scheme is [`PkiError::UnsupportedKeyType`].
pub fn decode_private_key(text: &str, expected: KeyKind) -> Result<KeyPair> {
    let block = pem::parse(text).map_err(|e| PkiError::MalformedArtifact(e.to_string()))?;
    let wanted = ArtifactKind::for_key(expected);
    let other = match expected {
        KeyKind::Rsa => ArtifactKind::PrivateKey,
        KeyKind::Ec => ArtifactKind::RsaPrivateKey,
    };
    if block.tag() == other.label() {
        return Err(PkiError::UnsupportedKeyType {
            expected: expected.to_string(),
            found: format!("`{}` block", block.tag()),
        });
    }
    if block.tag() != wanted.label() {
        return Err(PkiError::MalformedArtifact(format!(
            "expected a `{}` block, found `{}`",
            wanted.label(),
            block.tag()
        )));
    }
    KeyPair::decode(block.contents(), expected)
}

pub fn encode_request(request: &CertificateRequest) -> String {
    encode(ArtifactKind::CertificateRequest, request.to_der().to_vec())
}

/// Decode and verify a certificate request
pub fn decode_request(text: &str) -> Result<CertificateRequest> {
    let der = decode(ArtifactKind::CertificateRequest, text)?;
    request::parse(&der)
}

pub fn encode_certificate(certificate: &Certificate) -> String {
    encode(ArtifactKind::Certificate, certificate.to_der().to_vec())
}

pub fn decode_certificate(text: &str) -> Result<Certificate> {
    let der = decode(ArtifactKind::Certificate, text)?;
    Certificate::from_der(&der)
}
