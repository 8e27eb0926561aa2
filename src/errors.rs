//! Error taxonomy for the registry.
//!
//! Every library operation returns [`RegistryError`]. All variants are
//! recoverable from the caller's point of view: the interactive front-end
//! reports them and keeps its command loop running.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::crypto_engine::{EngineError, EngineStage};

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("crypto engine failed during {stage}: {message}")]
    CryptoEngine { stage: EngineStage, message: String },

    #[error("no certificate authority selected")]
    NoAuthoritySelected,

    #[error("invalid selection {index}: {count} certificate authorities available")]
    InvalidSelection { index: usize, count: usize },

    #[error("no certificate authority found for domain {domain}")]
    NotFound { domain: String },

    #[error("domain {domain} is already managed by {}", path.display())]
    DomainExists { domain: String, path: PathBuf },

    #[error("invalid storage path {}: {reason}", path.display())]
    InvalidStoragePath { path: PathBuf, reason: String },

    #[error("corrupt metadata record {}: {source}", path.display())]
    CorruptRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RegistryError {
    /// Wrap an I/O error with the path it happened on.
    pub(crate) fn io(path: impl AsRef<Path>) -> impl FnOnce(io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        move |source| RegistryError::Io { path, source }
    }
}

impl From<EngineError> for RegistryError {
    fn from(error: EngineError) -> Self {
        RegistryError::CryptoEngine {
            stage: error.stage,
            message: error.message,
        }
    }
}
