//! Crypto Engine Adapter
//!
//! The narrow boundary between the registry and whatever performs the actual
//! cryptography. Two implementations ship with the crate:
//!
//! - [`OpensslEngine`](crate::openssl_engine::OpensslEngine): in-process, on
//!   the `openssl` crate
//! - [`CommandEngine`](crate::command_engine::CommandEngine): drives the
//!   `openssl` binary as a subprocess, with a bounded wait per invocation
//!
//! Handles are references to artifacts on disk. The registry never holds key
//! bytes in its own structures; an engine writes each artifact to the output
//! path it is given and returns a handle pointing at it.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::identity_template::RenderedConfig;
use crate::passphrase::Passphrase;

/// Which engine operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStage {
    GenerateKey,
    SelfSign,
    GenerateCsr,
    SignCsr,
}

impl fmt::Display for EngineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            EngineStage::GenerateKey => "key generation",
            EngineStage::SelfSign => "self-signed certificate generation",
            EngineStage::GenerateCsr => "CSR generation",
            EngineStage::SignCsr => "CSR signing",
        };
        f.write_str(stage)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{stage}: {message}")]
pub struct EngineError {
    pub stage: EngineStage,
    pub message: String,
}

impl EngineError {
    pub fn new(stage: EngineStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }

    /// Adapter for `map_err` on any displayable error
    pub(crate) fn at<E: fmt::Display>(stage: EngineStage) -> impl Fn(E) -> Self {
        move |e| Self::new(stage, e.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Private key on disk, optionally passphrase-protected
#[derive(Debug, Clone)]
pub struct KeyHandle {
    pub path: PathBuf,
    pub passphrase: Option<Passphrase>,
}

impl KeyHandle {
    pub fn new(path: impl Into<PathBuf>, passphrase: Option<Passphrase>) -> Self {
        Self {
            path: path.into(),
            passphrase,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertHandle {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrHandle {
    pub path: PathBuf,
}

/// Rendered configuration together with the file it was written to
#[derive(Debug, Clone, Copy)]
pub struct ConfigRef<'a> {
    pub rendered: &'a RenderedConfig,
    pub path: &'a Path,
}

/// Named extensions section a CSR is signed with
#[derive(Debug, Clone, Copy)]
pub struct ExtensionsRef<'a> {
    pub section: &'a str,
    pub config: ConfigRef<'a>,
}

pub trait CryptoEngine {
    /// Create an RSA key pair of `bits` and write it to `out`
    fn generate_key(
        &self,
        bits: u32,
        passphrase: Option<&Passphrase>,
        out: &Path,
    ) -> EngineResult<KeyHandle>;

    /// Self-sign a certificate for `key`; only used for root CA bootstrap
    fn generate_self_signed_cert(
        &self,
        key: &KeyHandle,
        config: ConfigRef<'_>,
        validity_days: u32,
        out: &Path,
    ) -> EngineResult<CertHandle>;

    fn generate_csr(&self, key: &KeyHandle, config: ConfigRef<'_>, out: &Path)
        -> EngineResult<CsrHandle>;

    /// Sign `csr` with the issuer, copying the extensions requested in the CSR
    /// rather than regenerating them
    fn sign_csr(
        &self,
        csr: &CsrHandle,
        issuer_cert: &CertHandle,
        issuer_key: &KeyHandle,
        extensions: ExtensionsRef<'_>,
        validity_days: u32,
        out: &Path,
    ) -> EngineResult<CertHandle>;
}

impl<E: CryptoEngine + ?Sized> CryptoEngine for Box<E> {
    fn generate_key(
        &self,
        bits: u32,
        passphrase: Option<&Passphrase>,
        out: &Path,
    ) -> EngineResult<KeyHandle> {
        (**self).generate_key(bits, passphrase, out)
    }

    fn generate_self_signed_cert(
        &self,
        key: &KeyHandle,
        config: ConfigRef<'_>,
        validity_days: u32,
        out: &Path,
    ) -> EngineResult<CertHandle> {
        (**self).generate_self_signed_cert(key, config, validity_days, out)
    }

    fn generate_csr(
        &self,
        key: &KeyHandle,
        config: ConfigRef<'_>,
        out: &Path,
    ) -> EngineResult<CsrHandle> {
        (**self).generate_csr(key, config, out)
    }

    fn sign_csr(
        &self,
        csr: &CsrHandle,
        issuer_cert: &CertHandle,
        issuer_key: &KeyHandle,
        extensions: ExtensionsRef<'_>,
        validity_days: u32,
        out: &Path,
    ) -> EngineResult<CertHandle> {
        (**self).sign_csr(csr, issuer_cert, issuer_key, extensions, validity_days, out)
    }
}

/// Write an artifact readable only by its owner
pub(crate) fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_stage() {
        let error = EngineError::new(EngineStage::GenerateCsr, "exit status 1");
        assert_eq!(error.to_string(), "CSR generation: exit status 1");
    }

    #[cfg(unix)]
    #[test]
    fn private_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("secret.key");
        write_private(&path, b"key material").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read(&path).unwrap(), b"key material");
    }
}
