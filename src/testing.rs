//! Test fixtures shared by the unit tests.

use std::cell::RefCell;
use std::fs;
use std::path::Path;

use crate::crypto_engine::{
    CertHandle, ConfigRef, CryptoEngine, CsrHandle, EngineError, EngineResult, EngineStage,
    ExtensionsRef, KeyHandle,
};
use crate::identity_template::SubjectFields;
use crate::passphrase::Passphrase;
use crate::record_store::CertificateAuthority;

pub(crate) fn subject() -> SubjectFields {
    SubjectFields::builder()
        .common_name("Example Root CA".to_string())
        .state("Bavaria".to_string())
        .country("DE".to_string())
        .email("pki@example.com".to_string())
        .organization("Example GmbH".to_string())
        .organizational_unit("Platform".to_string())
        .build()
        .unwrap()
}

pub(crate) fn authority(root: &Path, domain: &str) -> CertificateAuthority {
    CertificateAuthority {
        domain: domain.to_string(),
        storage_path: root.join(domain.replace('.', "-")),
        subject: subject(),
    }
}

/// One recorded engine invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EngineCall {
    pub stage: EngineStage,
    pub encrypted_key: bool,
    /// Whether the config file existed when the engine was called
    pub config_present: bool,
    pub extensions_section: Option<String>,
}

/// Engine that writes placeholder artifacts and records every call
#[derive(Debug, Default)]
pub(crate) struct FakeEngine {
    pub calls: RefCell<Vec<EngineCall>>,
    pub fail_at: Option<EngineStage>,
}

impl FakeEngine {
    pub(crate) fn failing_at(stage: EngineStage) -> Self {
        Self {
            fail_at: Some(stage),
            ..Self::default()
        }
    }

    pub(crate) fn stages(&self) -> Vec<EngineStage> {
        self.calls.borrow().iter().map(|c| c.stage).collect()
    }

    fn record(
        &self,
        stage: EngineStage,
        encrypted_key: bool,
        config: Option<ConfigRef<'_>>,
        extensions_section: Option<&str>,
    ) -> EngineResult<()> {
        self.calls.borrow_mut().push(EngineCall {
            stage,
            encrypted_key,
            config_present: config.map(|c| c.path.is_file()).unwrap_or(false),
            extensions_section: extensions_section.map(str::to_string),
        });
        if self.fail_at == Some(stage) {
            return Err(EngineError::new(stage, "injected failure"));
        }
        Ok(())
    }
}

impl CryptoEngine for FakeEngine {
    fn generate_key(
        &self,
        bits: u32,
        passphrase: Option<&Passphrase>,
        out: &Path,
    ) -> EngineResult<KeyHandle> {
        self.record(EngineStage::GenerateKey, passphrase.is_some(), None, None)?;
        fs::write(out, format!("FAKE KEY {bits}\n")).map_err(EngineError::at(EngineStage::GenerateKey))?;
        Ok(KeyHandle::new(out, passphrase.cloned()))
    }

    fn generate_self_signed_cert(
        &self,
        key: &KeyHandle,
        config: ConfigRef<'_>,
        validity_days: u32,
        out: &Path,
    ) -> EngineResult<CertHandle> {
        self.record(EngineStage::SelfSign, key.passphrase.is_some(), Some(config), None)?;
        let body = format!(
            "FAKE CERT {} {validity_days}\n",
            config.rendered.subject().common_name
        );
        fs::write(out, body).map_err(EngineError::at(EngineStage::SelfSign))?;
        Ok(CertHandle {
            path: out.to_path_buf(),
        })
    }

    fn generate_csr(
        &self,
        key: &KeyHandle,
        config: ConfigRef<'_>,
        out: &Path,
    ) -> EngineResult<CsrHandle> {
        self.record(EngineStage::GenerateCsr, key.passphrase.is_some(), Some(config), None)?;
        fs::write(out, "FAKE CSR\n").map_err(EngineError::at(EngineStage::GenerateCsr))?;
        Ok(CsrHandle {
            path: out.to_path_buf(),
        })
    }

    fn sign_csr(
        &self,
        _csr: &CsrHandle,
        _issuer_cert: &CertHandle,
        issuer_key: &KeyHandle,
        extensions: ExtensionsRef<'_>,
        validity_days: u32,
        out: &Path,
    ) -> EngineResult<CertHandle> {
        self.record(
            EngineStage::SignCsr,
            issuer_key.passphrase.is_some(),
            Some(extensions.config),
            Some(extensions.section),
        )?;
        fs::write(out, format!("FAKE LEAF {validity_days}\n"))
            .map_err(EngineError::at(EngineStage::SignCsr))?;
        Ok(CertHandle {
            path: out.to_path_buf(),
        })
    }
}
