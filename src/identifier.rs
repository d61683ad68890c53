//! Subject/Authority Key Identifier derivation
//!
//! RFC 5280 §4.2.1.2 method (1): the identifier is the SHA-1 hash of the value
//! of the `subjectPublicKey` BIT STRING, i.e. the bare key encoding (PKCS#1
//! `RSAPublicKey` for RSA, the uncompressed point for EC) without the
//! SubjectPublicKeyInfo algorithm wrapper. This is what OpenSSL and most other
//! toolkits compute, so identifiers match across independently built
//! certificates that reference the same key.

use std::fmt;

use crate::key_material::PublicKey;

pub const KEY_IDENTIFIER_LEN: usize = 20;

/// 20-byte key identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyIdentifier([u8; KEY_IDENTIFIER_LEN]);

impl KeyIdentifier {
    pub fn as_bytes(&self) -> &[u8; KEY_IDENTIFIER_LEN] {
        &self.0
    }

    /// Accepts only identifiers of exactly 20 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; KEY_IDENTIFIER_LEN]>::try_from(bytes).ok().map(KeyIdentifier)
    }

    /// DER of the SubjectKeyIdentifier extension value (`OCTET STRING`)
    pub(crate) fn subject_key_identifier_der(&self) -> Vec<u8> {
        let mut der = Vec::with_capacity(2 + KEY_IDENTIFIER_LEN);
        der.push(0x04);
        der.push(KEY_IDENTIFIER_LEN as u8);
        der.extend_from_slice(&self.0);
        der
    }

    /// DER of the AuthorityKeyIdentifier extension value
    /// (`SEQUENCE { [0] IMPLICIT keyIdentifier }`)
    pub(crate) fn authority_key_identifier_der(&self) -> Vec<u8> {
        let mut der = Vec::with_capacity(4 + KEY_IDENTIFIER_LEN);
        der.push(0x30);
        der.push((KEY_IDENTIFIER_LEN + 2) as u8);
        der.push(0x80);
        der.push(KEY_IDENTIFIER_LEN as u8);
        der.extend_from_slice(&self.0);
        der
    }
}

impl fmt::Display for KeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        f.write_str(&parts.join(":"))
    }
}

impl fmt::Debug for KeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyIdentifier({})", hex::encode(self.0))
    }
}

/// Derive the key identifier for `public_key`
pub fn derive(public_key: &PublicKey) -> KeyIdentifier {
    KeyIdentifier(openssl::sha::sha1(public_key.subject_public_key()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_material::{KeyAlgorithm, KeyPair};
    use openssl::x509::extension::SubjectKeyIdentifier;
    use openssl::x509::X509;

    #[test]
    fn test_derive_is_deterministic() {
        let key = KeyPair::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let public = key.public_key().unwrap();
        let first = derive(&public);
        let second = derive(&key.public_key().unwrap());
        assert_eq!(first, second);
        assert_eq!(first.as_bytes().len(), KEY_IDENTIFIER_LEN);
    }

    #[test]
    fn test_distinct_keys_distinct_identifiers() {
        let a = KeyPair::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let b = KeyPair::generate(KeyAlgorithm::EcdsaP256).unwrap();
        assert_ne!(
            derive(&a.public_key().unwrap()),
            derive(&b.public_key().unwrap())
        );
    }

    #[test]
    fn test_rsa_identifier_hashes_pkcs1_key() {
        let key = KeyPair::generate(KeyAlgorithm::Rsa { bits: 2048 }).unwrap();
        let pkcs1 = key
            .private_key()
            .rsa()
            .unwrap()
            .public_key_to_der_pkcs1()
            .unwrap();
        let expected = openssl::sha::sha1(&pkcs1);
        assert_eq!(derive(&key.public_key().unwrap()).as_bytes(), &expected);
    }

    #[test]
    fn test_matches_openssl_hash_method() {
        let key = KeyPair::generate(KeyAlgorithm::Rsa { bits: 2048 }).unwrap();
        let mut builder = X509::builder().unwrap();
        builder.set_pubkey(key.private_key()).unwrap();
        let ext = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(None, None))
            .unwrap();
        builder.append_extension(ext).unwrap();
        builder
            .sign(key.private_key(), openssl::hash::MessageDigest::sha256())
            .unwrap();
        let cert = builder.build();

        let openssl_ski = cert.subject_key_id().unwrap().as_slice().to_vec();
        assert_eq!(
            openssl_ski,
            derive(&key.public_key().unwrap()).as_bytes().to_vec()
        );
    }

    #[test]
    fn test_extension_encodings() {
        let id = KeyIdentifier([0xAB; KEY_IDENTIFIER_LEN]);
        let ski = id.subject_key_identifier_der();
        assert_eq!(&ski[..2], &[0x04, 0x14]);
        assert_eq!(ski.len(), 22);

        let aki = id.authority_key_identifier_der();
        assert_eq!(&aki[..4], &[0x30, 0x16, 0x80, 0x14]);
        assert_eq!(aki.len(), 24);
    }

    #[test]
    fn test_from_slice_requires_twenty_bytes() {
        assert!(KeyIdentifier::from_slice(&[0u8; 19]).is_none());
        assert!(KeyIdentifier::from_slice(&[0u8; 20]).is_some());
    }

    #[test]
    fn test_display_is_colon_hex() {
        let id = KeyIdentifier([0x0F; KEY_IDENTIFIER_LEN]);
        let shown = id.to_string();
        assert!(shown.starts_with("0F:0F:"));
        assert_eq!(shown.len(), 20 * 3 - 1);
    }
}
