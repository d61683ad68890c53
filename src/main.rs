//! PKI Issuer - command line driver
//!
//! Loads configuration, reads and writes PEM artifacts, and calls into the
//! issuance engine. All artifacts land in the output directory
//! (`[output] directory`, overridable with `--out`).
//!
//! # Quick Start
//!
//! ```bash
//! # Root CA, client and server leaves, then verify both
//! pki-issuer bootstrap --domain example.local
//!
//! # Step by step
//! pki-issuer init-root --name example.local          # --force replaces an existing CA
//! pki-issuer request --name client.example.local --san dns:client.example.local
//! pki-issuer issue --name client.example.local --ca example.local --profile client_auth
//! pki-issuer verify --cert pki/client.example.local.signed.crt.pem --ca pki/example.local.CAcert.pem
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use pki_issuer::armor;
use pki_issuer::certificate::Certificate;
use pki_issuer::clock::{Clock, SystemClock};
use pki_issuer::configs::AppConfig;
use pki_issuer::identifier;
use pki_issuer::issuer::{CertificateAuthority, CertificateIssuer, ExtensionProfile};
use pki_issuer::key_material::{KeyKind, KeyPair};
use pki_issuer::name::SubjectAltName;
use pki_issuer::request::{CertificateRequest, RequestBuilder};
use pki_issuer::storage::{self, ArtifactStore};
use pki_issuer::{verify, PkiError};

#[derive(Parser, Debug)]
#[command(name = "pki-issuer", version, about = "Private CA issuance engine")]
struct Cli {
    /// Configuration file (defaults to ./config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Artifact directory, overrides [output] directory
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a CA key and self-issue the root certificate
    InitRoot {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        years: Option<u32>,
        /// Replace an existing CA key and certificate of the same name
        #[arg(long)]
        force: bool,
    },
    /// Generate a leaf key and certificate signing request
    Request {
        #[arg(long)]
        name: String,
        /// dns:<name>, ip:<addr> or email:<addr>; repeatable
        #[arg(long = "san")]
        sans: Vec<String>,
    },
    /// Issue a leaf certificate from a stored request
    Issue {
        #[arg(long)]
        name: String,
        #[arg(long)]
        ca: String,
        #[arg(long)]
        profile: Option<ExtensionProfile>,
        #[arg(long)]
        years: Option<u32>,
    },
    /// Verify a certificate against a CA certificate
    Verify {
        #[arg(long)]
        cert: PathBuf,
        #[arg(long)]
        ca: PathBuf,
        /// RFC 3339 instant, defaults to now
        #[arg(long)]
        at: Option<String>,
    },
    /// Print the fields of a certificate
    Inspect {
        #[arg(long)]
        cert: PathBuf,
    },
    /// Derive the key identifier of a certificate or private key
    Ski {
        #[arg(long, conflicts_with = "key", required_unless_present = "key")]
        cert: Option<PathBuf>,
        #[arg(long)]
        key: Option<PathBuf>,
    },
    /// Root CA, client and server leaves, then verify both
    Bootstrap {
        #[arg(long)]
        domain: String,
        /// Replace an existing CA key and certificate of the same name
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - respect RUST_LOG environment variable
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        std::env::var("RUST_LOG")
            .ok()
            .and_then(|s| s.parse::<Level>().ok())
            .unwrap_or(Level::INFO)
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("Failed to set subscriber: {}", e))?;

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::load()?,
    };
    let out = cli.out.clone().unwrap_or_else(|| config.output.directory.clone());
    let app = App::new(config, &out)?;

    match cli.command {
        Command::InitRoot { name, years, force } => {
            app.init_root(name.as_deref(), years, force)?;
        }
        Command::Request { name, sans } => {
            app.request(&name, &sans)?;
        }
        Command::Issue {
            name,
            ca,
            profile,
            years,
        } => {
            app.issue(&name, &ca, profile, years)?;
        }
        Command::Verify { cert, ca, at } => {
            let at = match at {
                Some(at) => DateTime::parse_from_rfc3339(&at)
                    .context("Invalid --at timestamp, expected RFC 3339")?
                    .with_timezone(&Utc),
                None => SystemClock.now(),
            };
            let leaf = read_certificate(&cert)?;
            let authority = read_certificate(&ca)?;
            verify::verify(&leaf, &authority, at)
                .with_context(|| format!("{} does not verify against {}", cert.display(), ca.display()))?;
            println!("✓ {} verifies against {} at {}", leaf.subject(), authority.subject(), at);
        }
        Command::Inspect { cert } => {
            print_certificate(&read_certificate(&cert)?);
        }
        Command::Ski { cert, key } => {
            let public_key = match (cert, key) {
                (Some(cert), _) => read_certificate(&cert)?.public_key().clone(),
                (None, Some(key)) => read_any_key(&key)?.public_key()?,
                (None, None) => return Err(anyhow!("Either --cert or --key is required")),
            };
            println!("{}", identifier::derive(&public_key));
        }
        Command::Bootstrap { domain, force } => {
            app.bootstrap(&domain, force)?;
        }
    }
    Ok(())
}

struct App {
    config: AppConfig,
    store: ArtifactStore,
    issuer: CertificateIssuer,
}

impl App {
    fn new(config: AppConfig, out: &Path) -> Result<Self> {
        let store = ArtifactStore::open(out)?;
        let issuer = CertificateIssuer::new()
            .with_clock_skew_margin(Duration::seconds(config.issuance.clock_skew_margin_secs))
            .with_serial_bits(config.issuance.serial_bits);
        Ok(Self {
            config,
            store,
            issuer,
        })
    }

    fn init_root(
        &self,
        name: Option<&str>,
        years: Option<u32>,
        force: bool,
    ) -> Result<CertificateAuthority> {
        let authority = &self.config.authority;
        let subject = authority.subject(name);
        let ca_name = subject
            .common_name()
            .unwrap_or(&authority.common_name)
            .to_string();
        let years = years.unwrap_or(authority.validity_years);

        let key_file = storage::ca_key_file(&ca_name);
        let certificate_file = storage::ca_certificate_file(&ca_name);
        if !force && (self.store.exists(&key_file) || self.store.exists(&certificate_file)) {
            return Err(anyhow!(
                "CA {} already exists in {}; pass --force to replace it",
                ca_name,
                self.store.directory().display()
            ));
        }

        let key = KeyPair::generate(authority.key).context("Failed to generate CA key")?;
        let certificate = self
            .issuer
            .issue_root(&subject, &key, years)
            .context("Failed to issue root certificate")?;
        println!("✓ Root CA generated: {}", certificate.subject());

        self.store.save_key(&key_file, &key)?;
        let path = self.store.save_certificate(&certificate_file, &certificate)?;
        println!("✓ Root CA certificate saved to {}", path.display());
        self.store.save_serials(
            &storage::serial_record_file(&ca_name),
            &[certificate.serial().clone()],
        )?;

        let serials = self.issuer.serial_allocator(self.config.issuance.serial_policy)?;
        Ok(CertificateAuthority::new(certificate, key, serials)?)
    }

    fn load_authority(&self, ca_name: &str) -> Result<CertificateAuthority> {
        let certificate = self
            .store
            .load_certificate(&storage::ca_certificate_file(ca_name))?;
        let key = self.store.load_key(
            &storage::ca_key_file(ca_name),
            self.config.authority.key.kind(),
        )?;
        info!(subject = %certificate.subject(), is_ca = certificate.is_ca(), "loaded CA certificate");
        let serials = self.issuer.serial_allocator(self.config.issuance.serial_policy)?;
        let ca = CertificateAuthority::new(certificate, key, serials)?;
        for serial in self.store.load_serials(&storage::serial_record_file(ca_name))? {
            ca.serials().record(&serial);
        }
        Ok(ca)
    }

    fn request(&self, name: &str, sans: &[String]) -> Result<CertificateRequest> {
        let leaf = &self.config.leaf;
        let key = KeyPair::generate(leaf.key).context("Failed to generate leaf key")?;

        let mut builder = RequestBuilder::new(&key).subject(leaf.subject(name));
        if let Some(email) = &leaf.email {
            builder = builder.subject_alt_name(SubjectAltName::Email(email.clone()));
        }
        for san in sans {
            builder = builder.subject_alt_name(SubjectAltName::parse(san)?);
        }
        let request = builder.build().context("Failed to build certificate request")?;

        self.store.save_key(&storage::leaf_key_file(name), &key)?;
        let path = self
            .store
            .save_request(&storage::request_file(name), &request)?;
        println!("✓ Certificate request for {} saved to {}", request.subject(), path.display());
        Ok(request)
    }

    fn issue(
        &self,
        name: &str,
        ca_name: &str,
        profile: Option<ExtensionProfile>,
        years: Option<u32>,
    ) -> Result<Certificate> {
        let ca = self.load_authority(ca_name)?;
        let request = self.store.load_request(&storage::request_file(name))?;
        self.issue_from(&ca, ca_name, name, &request, profile, years)
    }

    fn issue_from(
        &self,
        ca: &CertificateAuthority,
        ca_name: &str,
        name: &str,
        request: &CertificateRequest,
        profile: Option<ExtensionProfile>,
        years: Option<u32>,
    ) -> Result<Certificate> {
        let profile = profile.unwrap_or(self.config.leaf.profile);
        let years = years.unwrap_or(self.config.leaf.validity_years);
        let certificate = self
            .issuer
            .issue_leaf(ca, request, years, profile)
            .with_context(|| format!("Failed to issue certificate for {}", name))?;
        let path = self
            .store
            .save_certificate(&storage::signed_certificate_file(name), &certificate)?;
        self.store
            .append_serial(&storage::serial_record_file(ca_name), certificate.serial())?;
        println!(
            "✓ Issued {} ({}), serial {}, saved to {}",
            certificate.subject(),
            profile,
            certificate.serial(),
            path.display()
        );
        Ok(certificate)
    }

    fn bootstrap(&self, domain: &str, force: bool) -> Result<()> {
        let ca = self.init_root(Some(domain), None, force)?;
        let now = SystemClock.now();

        for (prefix, profile) in [
            ("client", ExtensionProfile::ClientAuth),
            ("server", ExtensionProfile::ServerAuth),
        ] {
            let name = format!("{}.{}", prefix, domain);
            let sans = vec![format!("dns:{}", name)];
            let request = self.request(&name, &sans)?;
            let certificate = self.issue_from(&ca, domain, &name, &request, Some(profile), None)?;
            verify::verify(&certificate, ca.certificate(), now)
                .with_context(|| format!("Issued certificate for {} does not verify", name))?;
            println!("✓ {} verifies against {}", name, ca.certificate().subject());
        }
        Ok(())
    }
}

fn read_certificate(path: &Path) -> Result<Certificate> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    armor::decode_certificate(&text).with_context(|| format!("Failed to decode {}", path.display()))
}

fn read_any_key(path: &Path) -> Result<KeyPair> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match armor::decode_private_key(&text, KeyKind::Rsa) {
        Err(PkiError::UnsupportedKeyType { .. }) => armor::decode_private_key(&text, KeyKind::Ec),
        other => other,
    }
    .with_context(|| format!("Failed to decode {}", path.display()))
}

fn print_certificate(cert: &Certificate) {
    let or_none = |id: Option<&identifier::KeyIdentifier>| {
        id.map_or_else(|| "(none)".to_string(), |id| id.to_string())
    };
    println!("Subject:       {}", cert.subject());
    println!("Issuer:        {}", cert.issuer());
    println!("Serial:        {}", cert.serial());
    println!("Not Before:    {}", cert.not_before());
    println!("Not After:     {}", cert.not_after());
    println!("Key:           {}", cert.public_key().algorithm());
    println!("Is CA:         {}", cert.is_ca());
    if let Some(path_len) = cert.path_len() {
        println!("Path Length:   {}", path_len);
    }
    if let Some(usage) = cert.key_usage() {
        println!("Key Usage:     {}", usage);
    }
    if !cert.extended_key_usage().is_empty() {
        let eku: Vec<String> = cert.extended_key_usage().iter().map(|u| u.to_string()).collect();
        println!("Ext Key Usage: {}", eku.join(", "));
    }
    for san in cert.subject_alt_names() {
        println!("SAN:           {}", san);
    }
    println!("Subject KeyID: {}", or_none(cert.subject_key_id()));
    println!("Auth KeyID:    {}", or_none(cert.authority_key_id()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pki_issuer::certificate::ExtendedKeyUsage;
    use pki_issuer::key_material::KeyAlgorithm;
    use pki_issuer::serial::SerialPolicy;
    use std::collections::HashSet;

    const DOMAIN: &str = "example.local";

    fn test_app(dir: &Path) -> App {
        let mut config = AppConfig::default();
        config.authority.key = KeyAlgorithm::EcdsaP256;
        config.leaf.key = KeyAlgorithm::EcdsaP256;
        config.issuance.serial_policy = SerialPolicy::Recorded;
        App::new(config, dir).unwrap()
    }

    #[test]
    fn test_bootstrap_writes_verifiable_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        app.bootstrap(DOMAIN, false).unwrap();

        let store = &app.store;
        let root = store
            .load_certificate(&storage::ca_certificate_file(DOMAIN))
            .unwrap();
        assert!(root.is_ca());
        assert!(store.exists(&storage::ca_key_file(DOMAIN)));

        for (prefix, usage) in [
            ("client", ExtendedKeyUsage::ClientAuth),
            ("server", ExtendedKeyUsage::ServerAuth),
        ] {
            let name = format!("{}.{}", prefix, DOMAIN);
            assert!(store.exists(&storage::leaf_key_file(&name)));
            assert!(store.exists(&storage::request_file(&name)));
            let leaf = store
                .load_certificate(&storage::signed_certificate_file(&name))
                .unwrap();
            assert_eq!(leaf.extended_key_usage(), &[usage]);
            assert_eq!(leaf.subject().common_name(), Some(name.as_str()));
            verify::verify(&leaf, &root, SystemClock.now()).unwrap();
        }

        let serials = store
            .load_serials(&storage::serial_record_file(DOMAIN))
            .unwrap();
        assert_eq!(serials.len(), 3);
        assert_eq!(&serials[0], root.serial());
    }

    #[test]
    fn test_issue_after_reload_extends_serial_record() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        app.bootstrap(DOMAIN, false).unwrap();

        let name = format!("client.{}", DOMAIN);
        let reissued = app.issue(&name, DOMAIN, None, Some(1)).unwrap();
        let serials = app
            .store
            .load_serials(&storage::serial_record_file(DOMAIN))
            .unwrap();
        assert_eq!(serials.len(), 4);
        assert_eq!(serials.last(), Some(reissued.serial()));
        let unique: HashSet<_> = serials.iter().collect();
        assert_eq!(unique.len(), serials.len());
    }

    #[test]
    fn test_init_root_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        app.init_root(Some(DOMAIN), None, false).unwrap();
        let key_file = storage::ca_key_file(DOMAIN);
        let original_key = app.store.load(&key_file).unwrap();

        assert!(app.init_root(Some(DOMAIN), None, false).is_err());
        assert!(app.bootstrap(DOMAIN, false).is_err());
        assert_eq!(app.store.load(&key_file).unwrap(), original_key);

        let replaced = app.init_root(Some(DOMAIN), None, true).unwrap();
        assert_ne!(app.store.load(&key_file).unwrap(), original_key);
        let serials = app
            .store
            .load_serials(&storage::serial_record_file(DOMAIN))
            .unwrap();
        assert_eq!(serials, vec![replaced.certificate().serial().clone()]);
    }
}
