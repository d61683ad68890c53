//! Key Material Module
//!
//! Generation and binary (de)serialization of asymmetric key pairs.
//!
//! # Encodings
//! - **RSA**: PKCS#1 `RSAPrivateKey` DER (armored as `RSA PRIVATE KEY`)
//! - **ECDSA**: PKCS#8 `PrivateKeyInfo` DER (armored as `PRIVATE KEY`)
//!
//! # Signature Digests
//! The digest used when a key signs a request or a certificate is bound to the
//! key type: SHA-256 for RSA and P-256, SHA-384 for P-384.
//!
//! # Example
//! ```rust,no_run
//! use pki_issuer::key_material::{KeyAlgorithm, KeyKind, KeyPair};
//! # fn example() -> pki_issuer::Result<()> {
//! let key = KeyPair::generate(KeyAlgorithm::Rsa { bits: 2048 })?;
//! let der = key.encode()?;
//! let restored = KeyPair::decode(&der, KeyKind::Rsa)?;
//! assert_eq!(key, restored);
//! # Ok(())
//! # }
//! ```

use std::fmt;

use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, Id, PKey, PKeyRef, Private, Public};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use tracing::debug;
use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::error::{PkiError, Result};
use crate::serial::{OsRandom, RandomSource};

pub const RSA_KEY_SIZE_DEFAULT: u32 = 2048;
const RSA_KEY_SIZE_MIN: u32 = 2048;
const RSA_KEY_SIZE_MAX: u32 = 16384;
const ENTROPY_CHECK_LEN: usize = 32;

/// Asymmetric scheme and its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyAlgorithm {
    Rsa { bits: u32 },
    EcdsaP256,
    EcdsaP384,
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        KeyAlgorithm::Rsa {
            bits: RSA_KEY_SIZE_DEFAULT,
        }
    }
}

impl KeyAlgorithm {
    pub fn kind(&self) -> KeyKind {
        match self {
            KeyAlgorithm::Rsa { .. } => KeyKind::Rsa,
            KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384 => KeyKind::Ec,
        }
    }

    pub fn signature_digest(&self) -> MessageDigest {
        match self {
            KeyAlgorithm::EcdsaP384 => MessageDigest::sha384(),
            _ => MessageDigest::sha256(),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            KeyAlgorithm::Rsa { bits } if !(RSA_KEY_SIZE_MIN..=RSA_KEY_SIZE_MAX).contains(bits) => {
                Err(PkiError::InvalidParameter(format!(
                    "RSA modulus must be between {} and {} bits, got {}",
                    RSA_KEY_SIZE_MIN, RSA_KEY_SIZE_MAX, bits
                )))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa { bits } => write!(f, "RSA-{}", bits),
            KeyAlgorithm::EcdsaP256 => f.write_str("ECDSA P-256"),
            KeyAlgorithm::EcdsaP384 => f.write_str("ECDSA P-384"),
        }
    }
}

/// Scheme family expected when decoding a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    Ec,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Rsa => f.write_str("RSA"),
            KeyKind::Ec => f.write_str("EC"),
        }
    }
}

fn algorithm_of<T: HasPublic>(key: &PKeyRef<T>, expected: KeyKind) -> Result<KeyAlgorithm> {
    match key.id() {
        Id::RSA => Ok(KeyAlgorithm::Rsa { bits: key.bits() }),
        Id::EC => {
            let curve = key.ec_key()?.group().curve_name();
            match curve {
                Some(Nid::X9_62_PRIME256V1) => Ok(KeyAlgorithm::EcdsaP256),
                Some(Nid::SECP384R1) => Ok(KeyAlgorithm::EcdsaP384),
                other => Err(PkiError::UnsupportedKeyType {
                    expected: expected.to_string(),
                    found: format!("EC curve {:?}", other.map(|nid| nid.as_raw())),
                }),
            }
        }
        other => Err(PkiError::UnsupportedKeyType {
            expected: expected.to_string(),
            found: format!("key type id {}", other.as_raw()),
        }),
    }
}

// ================= Key Pair =================

/// An asymmetric key pair owned by the entity that generated it
///
/// Not `Clone`; the private half is only ever moved.
pub struct KeyPair {
    key: PKey<Private>,
    algorithm: KeyAlgorithm,
}

impl KeyPair {
    /// Generate a key pair using OpenSSL's CSPRNG
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self> {
        Self::generate_with(algorithm, &OsRandom)
    }

    /// Generate a key pair after confirming `source` can supply entropy
    ///
    /// The draw from `source` is an early check only and its bytes are
    /// discarded: the key itself comes from OpenSSL's DRBG. A DRBG failure
    /// during generation is reported as retryable too, through the
    /// `ErrorStack` conversion in [`crate::error`].
    ///
    /// # Errors
    /// - [`PkiError::InvalidParameter`] for unsupported sizes
    /// - [`PkiError::InsufficientEntropy`] when `source` or OpenSSL's random
    ///   generator fails (retryable)
    pub fn generate_with(algorithm: KeyAlgorithm, source: &dyn RandomSource) -> Result<Self> {
        algorithm.validate()?;

        let mut seed_check = [0u8; ENTROPY_CHECK_LEN];
        source.fill(&mut seed_check)?;

        let key = match algorithm {
            KeyAlgorithm::Rsa { bits } => PKey::from_rsa(Rsa::generate(bits)?)?,
            KeyAlgorithm::EcdsaP256 => {
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
                PKey::from_ec_key(EcKey::generate(&group)?)?
            }
            KeyAlgorithm::EcdsaP384 => {
                let group = EcGroup::from_curve_name(Nid::SECP384R1)?;
                PKey::from_ec_key(EcKey::generate(&group)?)?
            }
        };
        debug!(%algorithm, "generated key pair");
        Ok(Self { key, algorithm })
    }

    /// Binary encoding: PKCS#1 for RSA, PKCS#8 otherwise
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self.algorithm {
            KeyAlgorithm::Rsa { .. } => Ok(self.key.rsa()?.private_key_to_der()?),
            _ => Ok(self.key.private_key_to_pkcs8()?),
        }
    }

    /// Decode a private key, insisting on the `expected` scheme
    ///
    /// Accepts PKCS#1 (RSA) and PKCS#8 (any scheme) DER.
    ///
    /// # Errors
    /// - [`PkiError::MalformedKey`] if the bytes are not a structurally valid key
    /// - [`PkiError::UnsupportedKeyType`] if the key is of another scheme
    pub fn decode(der: &[u8], expected: KeyKind) -> Result<Self> {
        let key = PKey::private_key_from_der(der)
            .map_err(|e| PkiError::MalformedKey(e.to_string()))?;
        let algorithm = algorithm_of(&key, expected)?;
        if algorithm.kind() != expected {
            return Err(PkiError::UnsupportedKeyType {
                expected: expected.to_string(),
                found: algorithm.kind().to_string(),
            });
        }
        if let KeyAlgorithm::Rsa { .. } = algorithm {
            let consistent = key
                .rsa()?
                .check_key()
                .map_err(|e| PkiError::MalformedKey(e.to_string()))?;
            if !consistent {
                return Err(PkiError::MalformedKey(
                    "RSA key components are inconsistent".to_string(),
                ));
            }
        }
        Ok(Self { key, algorithm })
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn public_key(&self) -> Result<PublicKey> {
        PublicKey::from_spki_der(&self.key.public_key_to_der()?)
    }

    /// Whether `public` is the public half of this pair
    pub fn matches(&self, public: &PublicKey) -> bool {
        self.key.public_eq(public.pkey())
    }

    /// Sign `message` with the digest bound to this key's scheme
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(self.algorithm.signature_digest(), &self.key)?;
        signer.update(message)?;
        Ok(signer.sign_to_vec()?)
    }

    pub(crate) fn private_key(&self) -> &PKey<Private> {
        &self.key
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        match (self.encode(), other.encode()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

// ================= Public Key =================

/// A SubjectPublicKeyInfo together with its parsed key
#[derive(Clone)]
pub struct PublicKey {
    key: PKey<Public>,
    algorithm: KeyAlgorithm,
    spki_der: Vec<u8>,
    subject_public_key: Vec<u8>,
}

impl PublicKey {
    /// Parse a DER SubjectPublicKeyInfo
    pub fn from_spki_der(der: &[u8]) -> Result<Self> {
        let key = PKey::public_key_from_der(der)
            .map_err(|e| PkiError::MalformedKey(e.to_string()))?;
        let (_, spki) = SubjectPublicKeyInfo::from_der(der)
            .map_err(|e| PkiError::MalformedKey(e.to_string()))?;
        let algorithm = match key.id() {
            Id::RSA => algorithm_of(&key, KeyKind::Rsa)?,
            _ => algorithm_of(&key, KeyKind::Ec)?,
        };
        Ok(Self {
            algorithm,
            spki_der: spki.raw.to_vec(),
            subject_public_key: spki.subject_public_key.data.to_vec(),
            key,
        })
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn spki_der(&self) -> &[u8] {
        &self.spki_der
    }

    /// Contents of the `subjectPublicKey` BIT STRING (e.g. PKCS#1 `RSAPublicKey`)
    pub fn subject_public_key(&self) -> &[u8] {
        &self.subject_public_key
    }

    /// Verify a signature produced by [`KeyPair::sign`]
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let check = || -> Result<bool> {
            let mut verifier = Verifier::new(self.algorithm.signature_digest(), &self.key)?;
            verifier.update(message)?;
            Ok(verifier.verify(signature)?)
        };
        check().unwrap_or(false)
    }

    pub(crate) fn pkey(&self) -> &PKey<Public> {
        &self.key
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.spki_der == other.spki_der
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &self.algorithm)
            .field("spki_len", &self.spki_der.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::tests::StarvedRandom;

    fn rsa_2048() -> KeyPair {
        KeyPair::generate(KeyAlgorithm::Rsa { bits: 2048 }).unwrap()
    }

    #[test]
    fn test_rsa_round_trip() {
        let key = rsa_2048();
        let der = key.encode().unwrap();
        let restored = KeyPair::decode(&der, KeyKind::Rsa).unwrap();
        assert_eq!(key, restored);
        assert_eq!(restored.algorithm(), KeyAlgorithm::Rsa { bits: 2048 });
        assert_eq!(restored.encode().unwrap(), der);
    }

    #[test]
    fn test_ec_round_trip() {
        for algorithm in [KeyAlgorithm::EcdsaP256, KeyAlgorithm::EcdsaP384] {
            let key = KeyPair::generate(algorithm).unwrap();
            let der = key.encode().unwrap();
            let restored = KeyPair::decode(&der, KeyKind::Ec).unwrap();
            assert_eq!(key, restored);
            assert_eq!(restored.algorithm(), algorithm);
        }
    }

    #[test]
    fn test_rsa_encoding_is_pkcs1() {
        let key = rsa_2048();
        let der = key.encode().unwrap();
        assert!(Rsa::private_key_from_der(&der).is_ok());
    }

    #[test]
    fn test_decode_wrong_scheme() {
        let ec = KeyPair::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let err = KeyPair::decode(&ec.encode().unwrap(), KeyKind::Rsa).unwrap_err();
        assert!(matches!(err, PkiError::UnsupportedKeyType { .. }));

        let rsa = rsa_2048();
        let err = KeyPair::decode(&rsa.encode().unwrap(), KeyKind::Ec).unwrap_err();
        assert!(matches!(err, PkiError::UnsupportedKeyType { .. }));
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let err = KeyPair::decode(b"definitely not DER", KeyKind::Rsa).unwrap_err();
        assert!(matches!(err, PkiError::MalformedKey(_)));

        let der = rsa_2048().encode().unwrap();
        let err = KeyPair::decode(&der[..der.len() / 2], KeyKind::Rsa).unwrap_err();
        assert!(matches!(err, PkiError::MalformedKey(_)));
    }

    #[test]
    fn test_rsa_size_bounds() {
        let err = KeyPair::generate(KeyAlgorithm::Rsa { bits: 1024 }).unwrap_err();
        assert!(matches!(err, PkiError::InvalidParameter(_)));
    }

    #[test]
    fn test_starved_source_fails_generation() {
        let err =
            KeyPair::generate_with(KeyAlgorithm::EcdsaP256, &StarvedRandom).unwrap_err();
        assert!(matches!(err, PkiError::InsufficientEntropy(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_sign_and_verify() {
        let key = KeyPair::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let public = key.public_key().unwrap();
        let signature = key.sign(b"challenge").unwrap();
        assert!(public.verify(b"challenge", &signature));
        assert!(!public.verify(b"other", &signature));
        assert!(key.matches(&public));

        let stranger = KeyPair::generate(KeyAlgorithm::EcdsaP256).unwrap();
        assert!(!stranger.matches(&public));
    }

    #[test]
    fn test_public_key_bits_are_pkcs1_for_rsa() {
        let key = rsa_2048();
        let public = key.public_key().unwrap();
        let pkcs1 = key.private_key().rsa().unwrap().public_key_to_der_pkcs1().unwrap();
        assert_eq!(public.subject_public_key(), pkcs1.as_slice());
    }

    #[test]
    fn test_debug_no_leak() {
        let key = rsa_2048();
        let debug_str = format!("{:?}", key);
        assert!(debug_str.contains("<redacted>"));
        assert!(!debug_str.contains("BEGIN"));
    }
}
