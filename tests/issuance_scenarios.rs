// Root → leaf → verify scenarios against the public API

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use pki_issuer::certificate::{Certificate, ExtendedKeyUsage};
use pki_issuer::clock::FixedClock;
use pki_issuer::identifier::derive;
use pki_issuer::issuer::{CertificateAuthority, CertificateIssuer, ExtensionProfile};
use pki_issuer::key_material::{KeyAlgorithm, KeyKind, KeyPair};
use pki_issuer::name::{AttributeType, DistinguishedName};
use pki_issuer::request::{self, RequestBuilder};
use pki_issuer::serial::SerialPolicy;
use pki_issuer::verify::verify;
use pki_issuer::{CertificateRole, ChainError};

fn issued_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap()
}

fn issuer() -> CertificateIssuer {
    CertificateIssuer::new().with_clock(Arc::new(FixedClock(issued_at())))
}

fn root(issuer: &CertificateIssuer, domain: &str, policy: SerialPolicy) -> CertificateAuthority {
    let key = KeyPair::generate(KeyAlgorithm::Rsa { bits: 2048 }).unwrap();
    let subject = DistinguishedName::new()
        .with(AttributeType::CommonName, domain)
        .with(AttributeType::Organization, domain)
        .with(AttributeType::Country, "JP");
    let certificate = issuer.issue_root(&subject, &key, 4).unwrap();
    CertificateAuthority::new(certificate, key, issuer.serial_allocator(policy).unwrap()).unwrap()
}

fn leaf(
    issuer: &CertificateIssuer,
    ca: &CertificateAuthority,
    cn: &str,
    profile: ExtensionProfile,
) -> Certificate {
    let key = KeyPair::generate(KeyAlgorithm::Rsa { bits: 2048 }).unwrap();
    let request = RequestBuilder::new(&key)
        .common_name(cn)
        .organization("example.local")
        .country("JP")
        .subject_alt_name_dns(cn)
        .build()
        .unwrap();
    // Requests travel as bytes between requester and CA
    let received = request::parse(request.to_der()).unwrap();
    issuer.issue_leaf(ca, &received, 4, profile).unwrap()
}

#[test]
fn test_client_leaf_lifecycle() {
    let issuer = issuer();
    let ca = root(&issuer, "example.local", SerialPolicy::Random);
    let root_cert = ca.certificate();

    verify(root_cert, root_cert, issued_at()).unwrap();
    assert_eq!(root_cert.subject_key_id(), root_cert.authority_key_id());
    assert_eq!(
        root_cert.not_after(),
        Utc.with_ymd_and_hms(2030, 10, 1, 8, 0, 0).unwrap()
    );

    let client = leaf(&issuer, &ca, "client.example.local", ExtensionProfile::ClientAuth);
    assert_eq!(client.extended_key_usage(), &[ExtendedKeyUsage::ClientAuth]);
    verify(&client, root_cert, issued_at()).unwrap();

    let before = client.not_before() - Duration::days(1);
    assert_eq!(
        verify(&client, root_cert, before),
        Err(ChainError::NotYetValid {
            role: CertificateRole::Leaf,
            not_before: client.not_before(),
        })
    );
}

#[test]
fn test_expired_leaf() {
    let issuer = issuer();
    let ca = root(&issuer, "example.local", SerialPolicy::Random);
    let server = leaf(&issuer, &ca, "server.example.local", ExtensionProfile::ServerAuth);
    let after = server.not_after() + Duration::seconds(1);
    assert!(matches!(
        verify(&server, ca.certificate(), after),
        Err(ChainError::Expired {
            role: CertificateRole::Leaf,
            ..
        })
    ));
}

#[test]
fn test_unrelated_ca_rejected() {
    let issuer = issuer();
    let ca = root(&issuer, "example.local", SerialPolicy::Random);
    let unrelated = root(&issuer, "unrelated.local", SerialPolicy::Random);
    let client = leaf(&issuer, &ca, "client.example.local", ExtensionProfile::ClientAuth);
    assert!(matches!(
        verify(&client, unrelated.certificate(), issued_at()),
        Err(ChainError::WrongIssuer { .. })
    ));
}

#[test]
fn test_corrupted_signature_byte() {
    let issuer = issuer();
    let ca = root(&issuer, "example.local", SerialPolicy::Random);
    let client = leaf(&issuer, &ca, "client.example.local", ExtensionProfile::ClientAuth);

    // RSA signature value is the trailing 256 bytes of the DER
    let mut der = client.to_der().to_vec();
    let index = der.len() - 100;
    der[index] ^= 0x5A;
    let corrupted = Certificate::from_der(&der).unwrap();
    assert_eq!(
        verify(&corrupted, ca.certificate(), issued_at()),
        Err(ChainError::BadSignature)
    );
}

#[test]
fn test_distinct_serials_both_policies() {
    for policy in [SerialPolicy::Random, SerialPolicy::Recorded] {
        let issuer = issuer();
        let ca = root(&issuer, "example.local", policy);
        let serials: HashSet<_> = (0..5)
            .map(|i| {
                leaf(
                    &issuer,
                    &ca,
                    &format!("host{}.example.local", i),
                    ExtensionProfile::ClientAndServer,
                )
                .serial()
                .clone()
            })
            .collect();
        assert_eq!(serials.len(), 5);
    }
}

#[test]
fn test_identifiers_link_leaf_to_root() {
    let issuer = issuer();
    let ca = root(&issuer, "example.local", SerialPolicy::Random);
    let client = leaf(&issuer, &ca, "client.example.local", ExtensionProfile::ClientAuth);
    let ca_id = derive(ca.certificate().public_key());
    assert_eq!(client.authority_key_id(), Some(&ca_id));
    assert_eq!(ca.certificate().subject_key_id(), Some(&ca_id));
    assert_eq!(client.subject_key_id(), Some(&derive(client.public_key())));
}

#[test]
fn test_key_round_trip_preserves_issuing_power() {
    let issuer = issuer();
    let ca = root(&issuer, "example.local", SerialPolicy::Random);
    let (certificate, key) = ca.into_parts();
    let restored = KeyPair::decode(&key.encode().unwrap(), KeyKind::Rsa).unwrap();
    assert_eq!(restored, key);

    let ca = CertificateAuthority::new(
        certificate,
        restored,
        issuer.serial_allocator(SerialPolicy::Random).unwrap(),
    )
    .unwrap();
    let client = leaf(&issuer, &ca, "client.example.local", ExtensionProfile::ClientAuth);
    verify(&client, ca.certificate(), issued_at()).unwrap();
}
