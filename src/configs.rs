//! Application configuration loaded from TOML
//!
//! Every section and field has a default, so an empty file (or no file at
//! all, via [`AppConfig::load`]) yields a working configuration.
//!
//! ```toml
//! [authority]
//! common_name = "example.local"
//! validity_years = 4
//! key = { type = "rsa", bits = 2048 }
//!
//! [leaf]
//! email = "admin@example.local"
//! profile = "client_and_server"
//!
//! [issuance]
//! serial_policy = "recorded"
//! serial_bits = 128
//! clock_skew_margin_secs = 300
//!
//! [output]
//! directory = "pki"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PkiError;
use crate::issuer::{ExtensionProfile, DEFAULT_CLOCK_SKEW_MARGIN_SECS, MAX_CLOCK_SKEW_MARGIN_SECS};
use crate::key_material::KeyAlgorithm;
use crate::name::{AttributeType, DistinguishedName};
use crate::serial::{SerialPolicy, DEFAULT_SERIAL_BITS, MAX_SERIAL_BITS, MIN_SERIAL_BITS};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub leaf: LeafConfig,
    #[serde(default)]
    pub issuance: IssuanceConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Root CA subject and key
#[derive(Debug, Deserialize, Clone)]
pub struct AuthorityConfig {
    #[serde(default = "default_authority_cn")]
    pub common_name: String,
    /// Defaults to the common name
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default = "default_organizational_unit")]
    pub organizational_unit: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default = "default_locality")]
    pub locality: String,
    #[serde(default = "default_validity_years")]
    pub validity_years: u32,
    #[serde(default)]
    pub key: KeyAlgorithm,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            common_name: default_authority_cn(),
            organization: None,
            organizational_unit: default_organizational_unit(),
            country: default_country(),
            state: default_state(),
            locality: default_locality(),
            validity_years: default_validity_years(),
            key: KeyAlgorithm::default(),
        }
    }
}

impl AuthorityConfig {
    /// Root subject for `common_name` (the configured one when `None`)
    pub fn subject(&self, common_name: Option<&str>) -> DistinguishedName {
        let cn = common_name.unwrap_or(&self.common_name);
        let organization = self.organization.as_deref().unwrap_or(cn);
        DistinguishedName::new()
            .with(AttributeType::CommonName, cn)
            .with(AttributeType::Organization, organization)
            .with(AttributeType::OrganizationalUnit, self.organizational_unit.as_str())
            .with(AttributeType::Locality, self.locality.as_str())
            .with(AttributeType::State, self.state.as_str())
            .with(AttributeType::Country, self.country.as_str())
    }
}

/// Defaults applied to every leaf subject
#[derive(Debug, Deserialize, Clone)]
pub struct LeafConfig {
    /// Defaults to the leaf common name
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default = "default_organizational_unit")]
    pub organizational_unit: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default = "default_locality")]
    pub locality: String,
    /// Added as both an emailAddress attribute and an email SAN
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_validity_years")]
    pub validity_years: u32,
    #[serde(default)]
    pub key: KeyAlgorithm,
    #[serde(default)]
    pub profile: ExtensionProfile,
}

impl Default for LeafConfig {
    fn default() -> Self {
        Self {
            organization: None,
            organizational_unit: default_organizational_unit(),
            country: default_country(),
            state: default_state(),
            locality: default_locality(),
            email: None,
            validity_years: default_validity_years(),
            key: KeyAlgorithm::default(),
            profile: ExtensionProfile::default(),
        }
    }
}

impl LeafConfig {
    pub fn subject(&self, common_name: &str) -> DistinguishedName {
        let organization = self.organization.as_deref().unwrap_or(common_name);
        let mut subject = DistinguishedName::new()
            .with(AttributeType::CommonName, common_name)
            .with(AttributeType::Organization, organization)
            .with(AttributeType::OrganizationalUnit, self.organizational_unit.as_str())
            .with(AttributeType::Locality, self.locality.as_str())
            .with(AttributeType::State, self.state.as_str())
            .with(AttributeType::Country, self.country.as_str());
        if let Some(email) = &self.email {
            subject.push(AttributeType::EmailAddress, email.as_str());
        }
        subject
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IssuanceConfig {
    #[serde(default)]
    pub serial_policy: SerialPolicy,
    #[serde(default = "default_serial_bits")]
    pub serial_bits: u32,
    #[serde(default = "default_clock_skew_margin_secs")]
    pub clock_skew_margin_secs: i64,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            serial_policy: SerialPolicy::default(),
            serial_bits: default_serial_bits(),
            clock_skew_margin_secs: default_clock_skew_margin_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
        }
    }
}

fn default_authority_cn() -> String {
    "example.local".to_string()
}

fn default_organizational_unit() -> String {
    "Example Private CA".to_string()
}

fn default_country() -> String {
    "JP".to_string()
}

fn default_state() -> String {
    "Tokyo".to_string()
}

fn default_locality() -> String {
    "Chuo-ku".to_string()
}

fn default_validity_years() -> u32 {
    4
}

fn default_serial_bits() -> u32 {
    DEFAULT_SERIAL_BITS
}

fn default_clock_skew_margin_secs() -> i64 {
    DEFAULT_CLOCK_SKEW_MARGIN_SECS
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("pki")
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;
        config.validate().context("Invalid configuration")?;

        Ok(config)
    }

    /// Load configuration with default path (config.toml), or defaults when absent
    pub fn load() -> Result<Self> {
        if Path::new(DEFAULT_CONFIG_PATH).exists() {
            Self::from_file(DEFAULT_CONFIG_PATH)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject values no issuance could succeed with
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: String| Err(PkiError::InvalidParameter(msg));
        if self.authority.common_name.trim().is_empty() {
            return invalid("authority.common_name is empty".to_string());
        }
        if self.authority.validity_years == 0 {
            return invalid("authority.validity_years must be at least 1".to_string());
        }
        if self.leaf.validity_years == 0 {
            return invalid("leaf.validity_years must be at least 1".to_string());
        }
        if !(MIN_SERIAL_BITS..=MAX_SERIAL_BITS).contains(&self.issuance.serial_bits) {
            return invalid(format!(
                "issuance.serial_bits must be within {}..={}, got {}",
                MIN_SERIAL_BITS, MAX_SERIAL_BITS, self.issuance.serial_bits
            ));
        }
        if !(0..=MAX_CLOCK_SKEW_MARGIN_SECS).contains(&self.issuance.clock_skew_margin_secs) {
            return invalid(format!(
                "issuance.clock_skew_margin_secs must be within 0..={}, got {}",
                MAX_CLOCK_SKEW_MARGIN_SECS, self.issuance.clock_skew_margin_secs
            ));
        }
        Ok(())
    }
}
