//! Directory-backed artifact store
//!
//! Loads and saves PEM artifacts by name:
//!
//! | Artifact | File |
//! |---|---|
//! | CA certificate | `<ca>.CAcert.pem` |
//! | CA private key | `<ca>.CAkey.pem` |
//! | Leaf private key | `<name>.pem` |
//! | Certificate request | `<name>.csr.pem` |
//! | Signed leaf certificate | `<name>.signed.crt.pem` |
//! | Serials issued by a CA | `<ca>.serials` |
//!
//! Every save writes a temp file in the target directory and renames it into
//! place, so a failed save never leaves a partial artifact behind. Private
//! keys are written with mode 0600 on Unix.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::armor;
use crate::certificate::Certificate;
use crate::key_material::{KeyKind, KeyPair};
use crate::request::CertificateRequest;
use crate::serial::SerialNumber;

const PRIVATE_FILE_MODE: u32 = 0o600;
const PUBLIC_FILE_MODE: u32 = 0o644;

pub fn ca_certificate_file(ca: &str) -> String {
    format!("{}.CAcert.pem", ca)
}

pub fn ca_key_file(ca: &str) -> String {
    format!("{}.CAkey.pem", ca)
}

pub fn leaf_key_file(name: &str) -> String {
    format!("{}.pem", name)
}

pub fn request_file(name: &str) -> String {
    format!("{}.csr.pem", name)
}

pub fn signed_certificate_file(name: &str) -> String {
    format!("{}.signed.crt.pem", name)
}

/// One hex serial per line, the CA's own first
pub fn serial_record_file(ca: &str) -> String {
    format!("{}.serials", ca)
}

/// Artifact names become file names, so path separators are not allowed
fn check_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(anyhow!("Invalid artifact name: {:?}", name));
    }
    Ok(())
}

pub struct ArtifactStore {
    directory: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) the artifact directory
    pub fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).with_context(|| {
            format!("Failed to create artifact directory {}", directory.display())
        })?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_of(&self, file_name: &str) -> PathBuf {
        self.directory.join(file_name)
    }

    pub fn exists(&self, file_name: &str) -> bool {
        self.path_of(file_name).exists()
    }

    /// Atomically write `contents` to `file_name`
    pub fn save(&self, file_name: &str, contents: &[u8], private: bool) -> Result<PathBuf> {
        check_name(file_name)?;
        let path = self.path_of(file_name);
        let mut temp = NamedTempFile::new_in(&self.directory)
            .context("Failed to create temporary artifact file")?;
        temp.write_all(contents)
            .context("Failed to write temporary artifact file")?;
        temp.as_file()
            .sync_all()
            .context("Failed to flush temporary artifact file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if private { PRIVATE_FILE_MODE } else { PUBLIC_FILE_MODE };
            fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode))
                .context("Failed to set artifact permissions")?;
        }
        #[cfg(not(unix))]
        let _ = private;

        temp.persist(&path)
            .map_err(|e| anyhow!("Failed to save {}: {}", path.display(), e.error))?;
        debug!(path = %path.display(), "artifact saved");
        Ok(path)
    }

    pub fn load(&self, file_name: &str) -> Result<String> {
        check_name(file_name)?;
        let path = self.path_of(file_name);
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
    }

    pub fn save_key(&self, file_name: &str, key_pair: &KeyPair) -> Result<PathBuf> {
        let text = armor::encode_private_key(key_pair).context("Failed to encode private key")?;
        self.save(file_name, text.as_bytes(), true)
    }

    pub fn load_key(&self, file_name: &str, expected: KeyKind) -> Result<KeyPair> {
        let text = self.load(file_name)?;
        armor::decode_private_key(&text, expected)
            .with_context(|| format!("Failed to decode private key {}", file_name))
    }

    pub fn save_request(&self, file_name: &str, request: &CertificateRequest) -> Result<PathBuf> {
        self.save(file_name, armor::encode_request(request).as_bytes(), false)
    }

    pub fn load_request(&self, file_name: &str) -> Result<CertificateRequest> {
        let text = self.load(file_name)?;
        armor::decode_request(&text)
            .with_context(|| format!("Failed to decode certificate request {}", file_name))
    }

    pub fn save_certificate(&self, file_name: &str, certificate: &Certificate) -> Result<PathBuf> {
        self.save(file_name, armor::encode_certificate(certificate).as_bytes(), false)
    }

    pub fn load_certificate(&self, file_name: &str) -> Result<Certificate> {
        let text = self.load(file_name)?;
        armor::decode_certificate(&text)
            .with_context(|| format!("Failed to decode certificate {}", file_name))
    }

    /// Serials recorded so far; a missing record is empty
    pub fn load_serials(&self, file_name: &str) -> Result<Vec<SerialNumber>> {
        if !self.exists(file_name) {
            return Ok(Vec::new());
        }
        let text = self.load(file_name)?;
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .enumerate()
            .map(|(i, line)| {
                SerialNumber::from_hex(line)
                    .with_context(|| format!("Bad serial on entry {} of {}", i + 1, file_name))
            })
            .collect()
    }

    /// Replace the record with `serials`
    pub fn save_serials(&self, file_name: &str, serials: &[SerialNumber]) -> Result<PathBuf> {
        let text: String = serials.iter().map(|serial| format!("{}\n", serial)).collect();
        self.save(file_name, text.as_bytes(), false)
    }

    /// Append one serial, rewriting the record atomically
    pub fn append_serial(&self, file_name: &str, serial: &SerialNumber) -> Result<PathBuf> {
        let mut serials = self.load_serials(file_name)?;
        serials.push(serial.clone());
        self.save_serials(file_name, &serials)
    }
}
