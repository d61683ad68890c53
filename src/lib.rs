//! PKI Issuer - Certificate Authority Issuance Engine
//!
//! Generates key material, builds certificate signing requests, self-issues a
//! root CA, issues leaf certificates from requests, and verifies a leaf
//! against its CA.
//!
//! # Overview
//!
//! ```text
//! KeyPair ──► RequestBuilder ──► CertificateIssuer ──► verify
//!                                  │
//!                                  ├─ issue_root: self-signed CA (pathlen=0)
//!                                  └─ issue_leaf: CA=false, signed by the root
//! ```
//!
//! Every issuance runs through the states `Drafted → SerialAssigned →
//! Extended → Signed` and either yields a complete certificate or an error.
//! Subject and authority key identifiers are derived from the public key
//! (SHA-1 over the `subjectPublicKey` bits), so certificates built elsewhere
//! for the same key carry the same identifiers.
//!
//! # Features
//!
//! - **Key Material**: RSA (2048 to 16384 bits) and ECDSA P-256 / P-384
//! - **Extension Profiles**: clientAuth, serverAuth, or both
//! - **Serial Policies**: pure random, or recorded for guaranteed uniqueness
//! - **Typed Errors**: every failure kind is distinguishable, chain errors included
//! - **PEM Artifacts**: standard labels, atomic writes, private keys mode 0600
//!
//! # Example
//!
//! ```no_run
//! use pki_issuer::issuer::{CertificateAuthority, CertificateIssuer, ExtensionProfile};
//! use pki_issuer::key_material::{KeyAlgorithm, KeyPair};
//! use pki_issuer::name::{AttributeType, DistinguishedName};
//! use pki_issuer::request::RequestBuilder;
//! use pki_issuer::serial::SerialPolicy;
//!
//! fn main() -> pki_issuer::Result<()> {
//!     let issuer = CertificateIssuer::new();
//!
//!     // Root CA
//!     let ca_key = KeyPair::generate(KeyAlgorithm::default())?;
//!     let subject = DistinguishedName::new()
//!         .with(AttributeType::CommonName, "example.local")
//!         .with(AttributeType::Country, "JP");
//!     let root = issuer.issue_root(&subject, &ca_key, 4)?;
//!     let ca = CertificateAuthority::new(
//!         root,
//!         ca_key,
//!         issuer.serial_allocator(SerialPolicy::Recorded)?,
//!     )?;
//!
//!     // Leaf from a request
//!     let leaf_key = KeyPair::generate(KeyAlgorithm::default())?;
//!     let request = RequestBuilder::new(&leaf_key)
//!         .common_name("client.example.local")
//!         .build()?;
//!     let leaf = issuer.issue_leaf(&ca, &request, 4, ExtensionProfile::ClientAuth)?;
//!
//!     pki_issuer::verify::verify(&leaf, ca.certificate(), chrono::Utc::now())?;
//!     Ok(())
//! }
//! ```

pub mod armor;
pub mod certificate;
pub mod clock;
pub mod configs;
pub mod error;
pub mod identifier;
pub mod issuer;
pub mod key_material;
pub mod name;
pub mod request;
pub mod serial;
pub mod storage;
pub mod verify;

pub use error::{CertificateRole, ChainError, PkiError, Result};
