use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command_engine::CommandEngine;
use crate::crypto_engine::CryptoEngine;
use crate::issuance::{IssuanceSettings, DEFAULT_KEY_BITS, DEFAULT_VALIDITY_DAYS};
use crate::openssl_engine::OpensslEngine;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub issuance: IssuanceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Directory holding one subdirectory per CA
    #[serde(default = "default_registry_root")]
    pub root: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: default_registry_root(),
        }
    }
}

fn default_registry_root() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    /// In-process `openssl` crate
    #[default]
    Library,
    /// External `openssl` executable
    Command,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: EngineBackend,
    #[serde(default = "default_engine_program")]
    pub program: PathBuf,
    #[serde(default = "default_engine_timeout")]
    pub timeout_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: EngineBackend::default(),
            program: default_engine_program(),
            timeout_seconds: default_engine_timeout(),
        }
    }
}

fn default_engine_program() -> PathBuf {
    PathBuf::from("openssl")
}

fn default_engine_timeout() -> u64 {
    300
}

impl EngineConfig {
    pub fn build(&self) -> Box<dyn CryptoEngine> {
        match self.backend {
            EngineBackend::Library => Box::new(OpensslEngine::new()),
            EngineBackend::Command => Box::new(CommandEngine::new(
                self.program.clone(),
                Duration::from_secs(self.timeout_seconds),
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IssuanceConfig {
    #[serde(default = "default_key_bits")]
    pub key_bits: u32,
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            key_bits: default_key_bits(),
            validity_days: default_validity_days(),
        }
    }
}

fn default_key_bits() -> u32 {
    DEFAULT_KEY_BITS
}

fn default_validity_days() -> u32 {
    DEFAULT_VALIDITY_DAYS // 5 years
}

impl From<&IssuanceConfig> for IssuanceSettings {
    fn from(config: &IssuanceConfig) -> Self {
        Self {
            key_bits: config.key_bits,
            validity_days: config.validity_days,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load an explicit config file, or `config.toml` when present
    ///
    /// An explicitly named file must exist; the default one is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => Self::from_file(DEFAULT_CONFIG_FILE),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.issuance.key_bits >= 2048, "issuance.key_bits must be at least 2048");
        anyhow::ensure!(self.issuance.validity_days > 0, "issuance.validity_days must be positive");
        anyhow::ensure!(self.engine.timeout_seconds > 0, "engine.timeout_seconds must be positive");
        Ok(())
    }
}
