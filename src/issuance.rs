//! Issuance Workflow
//!
//! Orchestrates root CA bootstrap and leaf certificate issuance on top of the
//! identity template, the record store and a crypto engine.
//!
//! # Bootstrap
//! ```text
//! validate ─▶ confirm overwrite? ─▶ stage (hidden temp dir under the root)
//!   ─▶ render root config ─▶ generate encrypted key ─▶ self-sign
//!   ─▶ swap staged dir into place ─▶ save metadata record
//! ```
//! Bootstrap is all-or-nothing for the CA directory: a failure before the swap
//! removes the staging directory and leaves any existing CA untouched. The
//! metadata record is written last, so a directory only becomes discoverable
//! once it is complete.
//!
//! # Leaf issuance
//! Key, CSR, certificate and bundle are produced in a hidden directory inside
//! the CA directory together with the rendered config, and moved next to the
//! root certificate only after signing succeeded. A failed issuance leaves any
//! earlier certificate for the same server untouched.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use crate::crypto_engine::{write_private, CertHandle, ConfigRef, CryptoEngine, ExtensionsRef, KeyHandle};
use crate::errors::{RegistryError, Result};
use crate::identity_template::{render, validate_domain, ServerIdentity, SubjectFields, TemplateMode};
use crate::passphrase::Passphrase;
use crate::record_store::{
    CertificateAuthority, IssuedCertificate, LeafPaths, RecordStore, CA_CERTS_DIR,
    CA_DATABASE_FILE, CA_SERIAL_FILE, CONFIG_FILE, PRIVATE_DIR, ROOT_CERTIFICATE_FILE,
    ROOT_KEY_FILE,
};

const LEAF_CONFIG_FILE: &str = "leaf.cnf";

pub const DEFAULT_KEY_BITS: u32 = 4096;
pub const DEFAULT_VALIDITY_DAYS: u32 = 1825;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuanceSettings {
    pub key_bits: u32,
    pub validity_days: u32,
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self {
            key_bits: DEFAULT_KEY_BITS,
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }
}

/// Everything needed to create a root CA
#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    pub domain: String,
    /// Directory name under the registry root; defaults to the domain with
    /// dots replaced by dashes
    pub storage_dir: Option<String>,
    pub subject: SubjectFields,
    /// Protects the root private key
    pub passphrase: Passphrase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(CertificateAuthority),
    /// The storage directory already existed and the caller refused to replace it
    Declined { path: PathBuf },
}

pub fn default_storage_dir(domain: &str) -> String {
    domain.replace('.', "-")
}

/// Resolve a storage directory name to a path directly under `root`
fn resolve_storage_path(root: &Path, dir_name: &str) -> Result<PathBuf> {
    let invalid = |reason: &str| RegistryError::InvalidStoragePath {
        path: PathBuf::from(dir_name),
        reason: reason.to_string(),
    };
    let mut components = Path::new(dir_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => {
            if name.to_string_lossy().starts_with('.') {
                return Err(invalid("hidden directories are reserved"));
            }
            Ok(root.join(name))
        }
        (None, _) => Err(invalid("directory name is empty")),
        _ => Err(invalid("must be a single directory name inside the registry root")),
    }
}

/// Empty database, serial and output directory for `openssl ca`
fn create_ca_database(dir: &Path) -> Result<()> {
    let database = dir.join(CA_DATABASE_FILE);
    fs::write(&database, "").map_err(RegistryError::io(&database))?;
    let serial = dir.join(CA_SERIAL_FILE);
    fs::write(&serial, "1000\n").map_err(RegistryError::io(&serial))?;
    let certs = dir.join(CA_CERTS_DIR);
    fs::create_dir(&certs).map_err(RegistryError::io(&certs))
}

fn create_private_dir(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path).map_err(RegistryError::io(path))
}

pub struct IssuanceWorkflow<E> {
    engine: E,
    settings: IssuanceSettings,
}

impl<E: CryptoEngine> IssuanceWorkflow<E> {
    pub fn new(engine: E, settings: IssuanceSettings) -> Self {
        Self { engine, settings }
    }

    pub fn settings(&self) -> IssuanceSettings {
        self.settings
    }

    /// Create a root CA under the store's root directory
    ///
    /// `confirm_overwrite` is asked only when the target directory already
    /// exists. Refusing returns [`CreateOutcome::Declined`] with nothing touched.
    pub fn bootstrap<S, F>(
        &self,
        store: &S,
        request: &BootstrapRequest,
        confirm_overwrite: F,
    ) -> Result<CreateOutcome>
    where
        S: RecordStore + ?Sized,
        F: FnOnce(&Path) -> bool,
    {
        let domain = request.domain.trim();
        validate_domain(domain)?;
        request.subject.validate()?;
        if request.passphrase.is_empty() {
            return Err(RegistryError::MissingField {
                field: "passphrase",
            });
        }

        let dir_name = request
            .storage_dir
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_storage_dir(domain));
        let storage_path = resolve_storage_path(store.root(), &dir_name)?;

        if let Some(existing) = store
            .list()?
            .into_iter()
            .find(|ca| ca.domain == domain && ca.storage_path != storage_path)
        {
            return Err(RegistryError::DomainExists {
                domain: domain.to_string(),
                path: existing.storage_path,
            });
        }

        let replacing = storage_path.exists();
        if replacing && !confirm_overwrite(storage_path.as_path()) {
            info!(path = %storage_path.display(), "overwrite declined, nothing changed");
            return Ok(CreateOutcome::Declined { path: storage_path });
        }

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(store.root())
            .map_err(RegistryError::io(store.root()))?;
        let staged = staging.path();
        debug!(staging = %staged.display(), "staging CA artifacts");

        create_private_dir(&staged.join(PRIVATE_DIR))?;
        create_ca_database(staged)?;

        let rendered = render(
            &request.subject,
            &TemplateMode::Root {
                domain,
                storage_path: &storage_path,
            },
        )?;
        let config_path = staged.join(CONFIG_FILE);
        fs::write(&config_path, rendered.text()).map_err(RegistryError::io(&config_path))?;

        let key = self.engine.generate_key(
            self.settings.key_bits,
            Some(&request.passphrase),
            &staged.join(PRIVATE_DIR).join(ROOT_KEY_FILE),
        )?;
        self.engine.generate_self_signed_cert(
            &key,
            ConfigRef {
                rendered: &rendered,
                path: &config_path,
            },
            self.settings.validity_days,
            &staged.join(ROOT_CERTIFICATE_FILE),
        )?;

        // the previous CA is only moved aside; it is deleted once the new one is in place
        let retired = if replacing {
            let holder = tempfile::Builder::new()
                .prefix(".retired-")
                .tempdir_in(store.root())
                .map_err(RegistryError::io(store.root()))?;
            let aside = holder.path().join("previous");
            fs::rename(&storage_path, &aside).map_err(RegistryError::io(&storage_path))?;
            Some((holder, aside))
        } else {
            None
        };

        if let Err(e) = fs::rename(staging.path(), &storage_path) {
            if let Some((holder, aside)) = retired {
                if let Err(restore) = fs::rename(&aside, &storage_path) {
                    let kept = holder.keep();
                    warn!(path = %kept.display(), error = %restore, "previous CA could not be restored");
                }
            }
            return Err(RegistryError::io(&storage_path)(e));
        }
        let _ = staging.keep();
        drop(retired);

        let record = CertificateAuthority {
            domain: domain.to_string(),
            storage_path,
            subject: request.subject.clone(),
        };
        store.save(&record)?;
        info!(domain = %record.domain, path = %record.storage_path.display(), replaced = replacing, "root CA created");
        Ok(CreateOutcome::Created(record))
    }

    /// Issue a server certificate signed by `authority`
    pub fn issue_leaf(
        &self,
        authority: &CertificateAuthority,
        server: &ServerIdentity,
        passphrase: &Passphrase,
    ) -> Result<IssuedCertificate> {
        let rendered = render(
            &authority.subject,
            &TemplateMode::Leaf {
                domain: &authority.domain,
                server,
            },
        )?;

        let files = authority.leaf_paths(&server.name);
        if files.certificate_file.exists() {
            warn!(server = %server.name, domain = %authority.domain, "overwriting existing leaf certificate");
        }

        // artifacts and the rendered config are built here and only moved into
        // the CA directory once signing succeeded; the rest is removed on drop
        let staging = tempfile::Builder::new()
            .prefix(".leaf-")
            .tempdir_in(&authority.storage_path)
            .map_err(RegistryError::io(&authority.storage_path))?;
        let staged = LeafPaths::new(staging.path(), &server.name);
        let config_path = staging.path().join(LEAF_CONFIG_FILE);
        fs::write(&config_path, rendered.text()).map_err(RegistryError::io(&config_path))?;
        let config = ConfigRef {
            rendered: &rendered,
            path: &config_path,
        };

        let key = self
            .engine
            .generate_key(self.settings.key_bits, None, &staged.key_file)?;
        let csr = self.engine.generate_csr(&key, config, &staged.csr_file)?;

        let issuer_cert = CertHandle {
            path: authority.root_certificate_path(),
        };
        let issuer_key = KeyHandle::new(authority.root_key_path(), Some(passphrase.clone()));
        let cert = self.engine.sign_csr(
            &csr,
            &issuer_cert,
            &issuer_key,
            ExtensionsRef {
                section: rendered.extensions_section(),
                config,
            },
            self.settings.validity_days,
            &staged.certificate_file,
        )?;

        let mut bundle = fs::read(&cert.path).map_err(RegistryError::io(&cert.path))?;
        bundle.extend(fs::read(&key.path).map_err(RegistryError::io(&key.path))?);
        write_private(&staged.bundle_file, &bundle)
            .map_err(RegistryError::io(&staged.bundle_file))?;

        for (from, to) in [
            (&staged.key_file, &files.key_file),
            (&staged.csr_file, &files.csr_file),
            (&staged.certificate_file, &files.certificate_file),
            (&staged.bundle_file, &files.bundle_file),
        ] {
            fs::rename(from, to).map_err(RegistryError::io(to))?;
        }

        info!(server = %server.fqdn(&authority.domain), ip = %server.ip, "leaf certificate issued");
        Ok(IssuedCertificate {
            server_name: server.name.clone(),
            server_ip: server.ip,
            authority_domain: authority.domain.clone(),
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto_engine::EngineStage;
    use crate::record_store::{DirectoryStore, METADATA_FILE};
    use crate::testing::{subject, FakeEngine};
    use tempfile::TempDir;

    fn request(domain: &str) -> BootstrapRequest {
        BootstrapRequest {
            domain: domain.to_string(),
            storage_dir: None,
            subject: subject(),
            passphrase: Passphrase::new("root-pass"),
        }
    }

    fn workflow(engine: FakeEngine) -> IssuanceWorkflow<FakeEngine> {
        IssuanceWorkflow::new(engine, IssuanceSettings::default())
    }

    fn created(outcome: CreateOutcome) -> CertificateAuthority {
        match outcome {
            CreateOutcome::Created(ca) => ca,
            other => panic!("expected a created CA, got {other:?}"),
        }
    }

    fn dir_entries(path: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(path)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn bootstrap_writes_complete_ca_directory() {
        let root = TempDir::new().unwrap();
        let store = DirectoryStore::new(root.path());
        let flow = workflow(FakeEngine::default());

        let ca = created(flow.bootstrap(&store, &request("example.com"), |_| panic!("no prompt")).unwrap());
        assert_eq!(ca.storage_path, root.path().join("example-com"));
        assert_eq!(
            dir_entries(&ca.storage_path),
            vec![
                "RootCA.pem",
                "ca_config.cnf",
                "data.json",
                "index.txt",
                "private",
                "serial",
                "signedcerts"
            ]
        );
        assert!(ca.root_key_path().is_file());
        assert_eq!(store.load("example.com").unwrap(), ca);

        // the only entry left in the registry root is the CA itself
        assert_eq!(dir_entries(root.path()), vec!["example-com"]);

        let config = fs::read_to_string(ca.config_path()).unwrap();
        assert!(config.contains("critical,CA:true"));

        let calls = flow.engine.calls.borrow();
        assert_eq!(calls[0].stage, EngineStage::GenerateKey);
        assert!(calls[0].encrypted_key);
        assert_eq!(calls[1].stage, EngineStage::SelfSign);
        assert!(calls[1].config_present);
    }

    #[cfg(unix)]
    #[test]
    fn private_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new().unwrap();
        let store = DirectoryStore::new(root.path());
        let ca = created(
            workflow(FakeEngine::default())
                .bootstrap(&store, &request("example.com"), |_| true)
                .unwrap(),
        );
        let mode = fs::metadata(ca.storage_path.join(PRIVATE_DIR))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn declined_overwrite_changes_nothing() {
        let root = TempDir::new().unwrap();
        let store = DirectoryStore::new(root.path());
        let existing = root.path().join("example-com");
        fs::create_dir(&existing).unwrap();
        fs::write(existing.join("keep.txt"), "precious").unwrap();

        let flow = workflow(FakeEngine::default());
        let mut asked = None;
        let outcome = flow
            .bootstrap(&store, &request("example.com"), |path| {
                asked = Some(path.to_path_buf());
                false
            })
            .unwrap();

        assert_eq!(outcome, CreateOutcome::Declined { path: existing.clone() });
        assert_eq!(asked, Some(existing.clone()));
        assert_eq!(dir_entries(&existing), vec!["keep.txt"]);
        assert!(!existing.join(METADATA_FILE).exists());
        assert!(flow.engine.calls.borrow().is_empty());
        assert_eq!(dir_entries(root.path()), vec!["example-com"]);
    }

    #[test]
    fn confirmed_overwrite_replaces_directory() {
        let root = TempDir::new().unwrap();
        let store = DirectoryStore::new(root.path());
        let existing = root.path().join("example-com");
        fs::create_dir(&existing).unwrap();
        fs::write(existing.join("stale.crt"), "old").unwrap();

        let ca = created(
            workflow(FakeEngine::default())
                .bootstrap(&store, &request("example.com"), |_| true)
                .unwrap(),
        );
        assert!(!ca.storage_path.join("stale.crt").exists());
        assert!(ca.metadata_path().is_file());
        assert_eq!(store.list().unwrap().len(), 1);
        // neither the staging nor the set-aside directory survives the swap
        assert_eq!(dir_entries(root.path()), vec!["example-com"]);
    }

    #[test]
    fn root_config_database_files_exist() {
        let root = TempDir::new().unwrap();
        let store = DirectoryStore::new(root.path());
        let ca = created(
            workflow(FakeEngine::default())
                .bootstrap(&store, &request("example.com"), |_| true)
                .unwrap(),
        );
        let config = fs::read_to_string(ca.config_path()).unwrap();
        for name in [CA_DATABASE_FILE, CA_SERIAL_FILE, CA_CERTS_DIR] {
            assert!(config.contains(&format!("$dir/{name}")), "{name} not referenced");
            assert!(ca.storage_path.join(name).exists(), "{name} missing");
        }
        assert!(ca.storage_path.join(CA_CERTS_DIR).is_dir());
        assert_eq!(fs::read_to_string(ca.storage_path.join(CA_SERIAL_FILE)).unwrap(), "1000\n");
    }

    #[test]
    fn recreating_same_domain_does_not_duplicate() {
        let root = TempDir::new().unwrap();
        let store = DirectoryStore::new(root.path());
        let flow = workflow(FakeEngine::default());
        flow.bootstrap(&store, &request("example.com"), |_| true).unwrap();
        flow.bootstrap(&store, &request("example.com"), |_| true).unwrap();

        let domains: Vec<String> = store.list().unwrap().into_iter().map(|c| c.domain).collect();
        assert_eq!(domains, vec!["example.com"]);
    }

    #[test]
    fn same_domain_in_another_directory_is_rejected() {
        let root = TempDir::new().unwrap();
        let store = DirectoryStore::new(root.path());
        let flow = workflow(FakeEngine::default());
        flow.bootstrap(&store, &request("example.com"), |_| true).unwrap();

        let mut again = request("example.com");
        again.storage_dir = Some("second-copy".to_string());
        let err = flow.bootstrap(&store, &again, |_| true).unwrap_err();
        assert!(matches!(err, RegistryError::DomainExists { .. }));
        assert!(!root.path().join("second-copy").exists());
    }

    #[test]
    fn engine_failure_leaves_no_partial_state() {
        let root = TempDir::new().unwrap();
        let store = DirectoryStore::new(root.path());
        let existing = root.path().join("example-com");
        fs::create_dir(&existing).unwrap();
        fs::write(existing.join("keep.txt"), "precious").unwrap();

        let flow = workflow(FakeEngine::failing_at(EngineStage::SelfSign));
        let err = flow
            .bootstrap(&store, &request("example.com"), |_| true)
            .unwrap_err();

        assert!(matches!(
            err,
            RegistryError::CryptoEngine {
                stage: EngineStage::SelfSign,
                ..
            }
        ));
        assert_eq!(dir_entries(&existing), vec!["keep.txt"]);
        assert_eq!(dir_entries(root.path()), vec!["example-com"]);
    }

    #[test]
    fn storage_dir_must_be_a_plain_child() {
        let root = TempDir::new().unwrap();
        let store = DirectoryStore::new(root.path());
        let flow = workflow(FakeEngine::default());
        for bad in ["../escape", "a/b", ".hidden", "/abs"] {
            let mut req = request("example.com");
            req.storage_dir = Some(bad.to_string());
            assert!(
                matches!(
                    flow.bootstrap(&store, &req, |_| true),
                    Err(RegistryError::InvalidStoragePath { .. })
                ),
                "{bad} accepted"
            );
        }
    }

    #[test]
    fn bootstrap_requires_domain_and_passphrase() {
        let root = TempDir::new().unwrap();
        let store = DirectoryStore::new(root.path());
        let flow = workflow(FakeEngine::default());

        let err = flow.bootstrap(&store, &request(""), |_| true).unwrap_err();
        assert!(matches!(err, RegistryError::MissingField { field: "domain" }));

        let mut req = request("example.com");
        req.passphrase = Passphrase::new("");
        let err = flow.bootstrap(&store, &req, |_| true).unwrap_err();
        assert!(matches!(err, RegistryError::MissingField { field: "passphrase" }));
        assert_eq!(dir_entries(root.path()), Vec::<String>::new());
    }

    fn bootstrapped(flow: &IssuanceWorkflow<FakeEngine>, root: &Path) -> CertificateAuthority {
        let store = DirectoryStore::new(root);
        created(flow.bootstrap(&store, &request("example.com"), |_| true).unwrap())
    }

    #[test]
    fn leaf_issuance_writes_four_artifacts() {
        let root = TempDir::new().unwrap();
        let flow = workflow(FakeEngine::default());
        let ca = bootstrapped(&flow, root.path());
        flow.engine.calls.borrow_mut().clear();

        let server = ServerIdentity::parse("www", "10.0.0.5").unwrap();
        let issued = flow
            .issue_leaf(&ca, &server, &Passphrase::new("root-pass"))
            .unwrap();

        assert_eq!(issued.files.key_file, ca.storage_path.join("www.key"));
        for file in [
            &issued.files.key_file,
            &issued.files.csr_file,
            &issued.files.certificate_file,
            &issued.files.bundle_file,
        ] {
            assert!(file.is_file(), "{} missing", file.display());
        }

        let bundle = fs::read_to_string(&issued.files.bundle_file).unwrap();
        assert_eq!(bundle, "FAKE LEAF 1825\nFAKE KEY 4096\n");

        assert_eq!(
            flow.engine.stages(),
            vec![EngineStage::GenerateKey, EngineStage::GenerateCsr, EngineStage::SignCsr]
        );
        let calls = flow.engine.calls.borrow();
        assert!(!calls[0].encrypted_key);
        assert!(calls[1].config_present);
        assert!(calls[2].encrypted_key);
        assert_eq!(calls[2].extensions_section.as_deref(), Some("req_ext"));
    }

    #[test]
    fn transient_config_is_removed_on_success_and_failure() {
        let root = TempDir::new().unwrap();
        let flow = workflow(FakeEngine::default());
        let ca = bootstrapped(&flow, root.path());
        let server = ServerIdentity::parse("www", "10.0.0.5").unwrap();
        flow.issue_leaf(&ca, &server, &Passphrase::new("root-pass"))
            .unwrap();
        assert!(!dir_entries(&ca.storage_path).iter().any(|n| n.starts_with(".leaf-")));

        let failing = workflow(FakeEngine::failing_at(EngineStage::SignCsr));
        let api = ServerIdentity::parse("api", "10.0.0.6").unwrap();
        let err = failing
            .issue_leaf(&ca, &api, &Passphrase::new("root-pass"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::CryptoEngine { stage: EngineStage::SignCsr, .. }));

        let entries = dir_entries(&ca.storage_path);
        assert!(!entries.iter().any(|n| n.starts_with(".leaf-")));
        assert!(!entries.contains(&"api.key".to_string()));
        assert!(!entries.contains(&"api.crt".to_string()));
    }

    #[test]
    fn failed_reissue_keeps_previous_artifacts() {
        let root = TempDir::new().unwrap();
        let flow = workflow(FakeEngine::default());
        let ca = bootstrapped(&flow, root.path());
        let server = ServerIdentity::parse("www", "10.0.0.5").unwrap();
        let first = flow
            .issue_leaf(&ca, &server, &Passphrase::new("root-pass"))
            .unwrap();
        let files = [
            &first.files.key_file,
            &first.files.csr_file,
            &first.files.certificate_file,
            &first.files.bundle_file,
        ];
        let before: Vec<Vec<u8>> = files.iter().map(|f| fs::read(f).unwrap()).collect();

        let failing = IssuanceWorkflow::new(
            FakeEngine::failing_at(EngineStage::SignCsr),
            IssuanceSettings {
                key_bits: 2048,
                validity_days: 30,
            },
        );
        failing
            .issue_leaf(&ca, &server, &Passphrase::new("wrong-pass"))
            .unwrap_err();

        let after: Vec<Vec<u8>> = files.iter().map(|f| fs::read(f).unwrap()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn issuing_other_servers_leaves_prior_artifacts_alone() {
        let root = TempDir::new().unwrap();
        let flow = workflow(FakeEngine::default());
        let ca = bootstrapped(&flow, root.path());
        let pass = Passphrase::new("root-pass");

        let www = flow
            .issue_leaf(&ca, &ServerIdentity::parse("www", "10.0.0.5").unwrap(), &pass)
            .unwrap();
        let before = fs::read(&www.files.bundle_file).unwrap();
        flow.issue_leaf(&ca, &ServerIdentity::parse("db", "10.0.0.7").unwrap(), &pass)
            .unwrap();

        assert_eq!(fs::read(&www.files.bundle_file).unwrap(), before);
        assert_eq!(ca.issued_server_names().unwrap(), vec!["db", "www"]);
    }
}
