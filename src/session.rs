//! Registry Session
//!
//! In-memory selection state consumed by the interactive front-end.
//!
//! ```text
//! NoSelection ──select(i)──▶ Selected(ca) ──select(j)──▶ Selected(ca')
//! ```
//!
//! There is no deselect and nothing is persisted: a new process always starts
//! in `NoSelection`. The list of known authorities is rebuilt from the store on
//! every `list`/`select`, never cached across mutations.

use crate::crypto_engine::CryptoEngine;
use crate::errors::{RegistryError, Result};
use crate::identity_template::ServerIdentity;
use crate::issuance::{BootstrapRequest, CreateOutcome, IssuanceSettings, IssuanceWorkflow};
use crate::passphrase::Passphrase;
use crate::record_store::{CertificateAuthority, IssuedCertificate, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState<'a> {
    NoSelection,
    Selected(&'a CertificateAuthority),
}

/// What `show` reports about the selected CA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionSummary {
    pub authority: CertificateAuthority,
    pub issued_servers: Vec<String>,
}

pub struct RegistrySession<S, E> {
    store: S,
    workflow: IssuanceWorkflow<E>,
    known_authorities: Vec<CertificateAuthority>,
    selected: Option<CertificateAuthority>,
}

impl<S: RecordStore, E: CryptoEngine> RegistrySession<S, E> {
    pub fn new(store: S, engine: E, settings: IssuanceSettings) -> Self {
        Self {
            store,
            workflow: IssuanceWorkflow::new(engine, settings),
            known_authorities: Vec::new(),
            selected: None,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn state(&self) -> SessionState<'_> {
        match &self.selected {
            Some(ca) => SessionState::Selected(ca),
            None => SessionState::NoSelection,
        }
    }

    /// Rescan the store; the returned order is the one `select` indexes into
    pub fn list(&mut self) -> Result<&[CertificateAuthority]> {
        self.known_authorities = self.store.list()?;
        Ok(&self.known_authorities)
    }

    /// Select the CA at `index` (0-based) of a fresh listing
    ///
    /// An out-of-range index leaves the current selection unchanged.
    pub fn select(&mut self, index: usize) -> Result<&CertificateAuthority> {
        let count = self.list()?.len();
        let Some(authority) = self.known_authorities.get(index) else {
            return Err(RegistryError::InvalidSelection { index, count });
        };
        tracing::info!(domain = %authority.domain, "certificate authority selected");
        Ok(self.selected.insert(authority.clone()))
    }

    pub fn selected(&self) -> Result<&CertificateAuthority> {
        self.selected
            .as_ref()
            .ok_or(RegistryError::NoAuthoritySelected)
    }

    pub fn show_selection(&self) -> Result<SelectionSummary> {
        let authority = self.selected()?.clone();
        let issued_servers = authority.issued_server_names()?;
        Ok(SelectionSummary {
            authority,
            issued_servers,
        })
    }

    /// Create a root CA; see [`IssuanceWorkflow::bootstrap`]
    pub fn create<F>(&mut self, request: &BootstrapRequest, confirm_overwrite: F) -> Result<CreateOutcome>
    where
        F: FnOnce(&std::path::Path) -> bool,
    {
        let outcome = self.workflow.bootstrap(&self.store, request, confirm_overwrite)?;
        // a recreated CA replaces the selected one on disk
        if let (CreateOutcome::Created(ca), Some(selected)) = (&outcome, &self.selected) {
            if ca.storage_path == selected.storage_path {
                self.selected = Some(ca.clone());
            }
        }
        Ok(outcome)
    }

    /// Issue a server certificate from the selected CA
    pub fn add(
        &mut self,
        server_name: &str,
        server_ip: &str,
        passphrase: &Passphrase,
    ) -> Result<IssuedCertificate> {
        let authority = self.selected()?;
        let server = ServerIdentity::parse(server_name, server_ip)?;
        self.workflow.issue_leaf(authority, &server, passphrase)
    }
}
