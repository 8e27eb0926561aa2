//! CA Record Store
//!
//! Durable mapping from domain to certificate authority metadata. The only
//! backend is [`DirectoryStore`]: every immediate subdirectory of the registry
//! root that contains a `data.json` metadata file is a CA. The [`RecordStore`]
//! trait keeps the issuance workflow independent of that layout.
//!
//! # Layout of one CA directory
//! ```text
//! example-com/
//! ├── data.json          metadata record
//! ├── ca_config.cnf      root config (audit artifact)
//! ├── RootCA.pem         root certificate
//! ├── private/RootCA.key passphrase-protected root key (0700 directory)
//! ├── index.txt, serial, signedcerts/   `openssl ca` bookkeeping
//! ├── www.key / www.csr / www.crt / www.pem
//! └── ...
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::errors::{RegistryError, Result};
use crate::identity_template::SubjectFields;

pub const METADATA_FILE: &str = "data.json";
pub const CONFIG_FILE: &str = "ca_config.cnf";
pub const ROOT_CERTIFICATE_FILE: &str = "RootCA.pem";
pub const ROOT_KEY_FILE: &str = "RootCA.key";
pub const PRIVATE_DIR: &str = "private";
/// `openssl ca` database, serial and output directory named by the root config
pub const CA_DATABASE_FILE: &str = "index.txt";
pub const CA_SERIAL_FILE: &str = "serial";
pub const CA_CERTS_DIR: &str = "signedcerts";

/// One root certificate authority
///
/// Serialized as the flat metadata record
/// `domain, path, common_name, state, country, email, organization,
/// organization_unit_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateAuthority {
    pub domain: String,
    #[serde(rename = "path")]
    pub storage_path: PathBuf,
    #[serde(flatten)]
    pub subject: SubjectFields,
}

impl CertificateAuthority {
    pub fn metadata_path(&self) -> PathBuf {
        self.storage_path.join(METADATA_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.storage_path.join(CONFIG_FILE)
    }

    pub fn root_certificate_path(&self) -> PathBuf {
        self.storage_path.join(ROOT_CERTIFICATE_FILE)
    }

    pub fn root_key_path(&self) -> PathBuf {
        self.storage_path.join(PRIVATE_DIR).join(ROOT_KEY_FILE)
    }

    /// Artifact paths for a leaf certificate issued by this CA
    pub fn leaf_paths(&self, server_name: &str) -> LeafPaths {
        LeafPaths::new(&self.storage_path, server_name)
    }

    /// Server names with an issued certificate in this CA's directory
    pub fn issued_server_names(&self) -> Result<Vec<String>> {
        let entries =
            fs::read_dir(&self.storage_path).map_err(RegistryError::io(&self.storage_path))?;
        let mut names = Vec::new();
        for entry in entries {
            let path = entry.map_err(RegistryError::io(&self.storage_path))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("crt") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Files produced for one leaf certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPaths {
    pub key_file: PathBuf,
    pub csr_file: PathBuf,
    pub certificate_file: PathBuf,
    /// Certificate followed by its key
    pub bundle_file: PathBuf,
}

impl LeafPaths {
    pub(crate) fn new(dir: &Path, server_name: &str) -> Self {
        Self {
            key_file: dir.join(format!("{server_name}.key")),
            csr_file: dir.join(format!("{server_name}.csr")),
            certificate_file: dir.join(format!("{server_name}.crt")),
            bundle_file: dir.join(format!("{server_name}.pem")),
        }
    }
}

/// A leaf certificate issued by a CA
///
/// Not persisted as a record of its own: it is the set of artifacts under the
/// owning CA's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub server_name: String,
    pub server_ip: std::net::IpAddr,
    pub authority_domain: String,
    pub files: LeafPaths,
}

pub trait RecordStore {
    /// Directory under which new CA directories are created
    fn root(&self) -> &Path;

    /// All known CAs, sorted by domain then path
    fn list(&self) -> Result<Vec<CertificateAuthority>>;

    fn load(&self, domain: &str) -> Result<CertificateAuthority> {
        self.list()?
            .into_iter()
            .find(|ca| ca.domain == domain)
            .ok_or_else(|| RegistryError::NotFound {
                domain: domain.to_string(),
            })
    }

    /// Write or overwrite the record for `record.storage_path`
    fn save(&self, record: &CertificateAuthority) -> Result<()>;
}

/// Registry backed by a directory scan
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Read the record of the CA directory `dir`
    ///
    /// The directory the record was found in is the CA; the stored `path` is
    /// informational and goes stale when the registry root moves.
    fn read_record(dir: &Path) -> Result<CertificateAuthority> {
        let path = dir.join(METADATA_FILE);
        let data = fs::read(&path).map_err(RegistryError::io(&path))?;
        let mut record: CertificateAuthority =
            serde_json::from_slice(&data).map_err(|source| RegistryError::CorruptRecord {
                path: path.clone(),
                source,
            })?;
        record.storage_path = dir.to_path_buf();
        Ok(record)
    }
}

impl RecordStore for DirectoryStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn list(&self) -> Result<Vec<CertificateAuthority>> {
        let entries = fs::read_dir(&self.root).map_err(RegistryError::io(&self.root))?;
        let mut authorities = Vec::new();
        for entry in entries {
            let dir = entry.map_err(RegistryError::io(&self.root))?.path();
            if !dir.is_dir() {
                continue;
            }
            let metadata = dir.join(METADATA_FILE);
            if !metadata.is_file() {
                continue;
            }
            match Self::read_record(&dir) {
                Ok(record) => authorities.push(record),
                Err(e) => warn!(path = %metadata.display(), error = %e, "skipping unreadable CA record"),
            }
        }
        authorities.sort_by(|a, b| {
            a.domain
                .cmp(&b.domain)
                .then_with(|| a.storage_path.cmp(&b.storage_path))
        });
        debug!(root = %self.root.display(), count = authorities.len(), "scanned registry");
        Ok(authorities)
    }

    fn load(&self, domain: &str) -> Result<CertificateAuthority> {
        // strict variant of the scan: a corrupt record for the requested domain
        // cannot be told apart from a missing one, so corrupt files are reported
        let entries = fs::read_dir(&self.root).map_err(RegistryError::io(&self.root))?;
        let mut first_corrupt = None;
        for entry in entries {
            let dir = entry.map_err(RegistryError::io(&self.root))?.path();
            if !dir.join(METADATA_FILE).is_file() {
                continue;
            }
            match Self::read_record(&dir) {
                Ok(record) if record.domain == domain => return Ok(record),
                Ok(_) => {}
                Err(e @ RegistryError::CorruptRecord { .. }) => {
                    first_corrupt.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(first_corrupt.unwrap_or_else(|| RegistryError::NotFound {
            domain: domain.to_string(),
        }))
    }

    fn save(&self, record: &CertificateAuthority) -> Result<()> {
        let dir = &record.storage_path;
        let target = record.metadata_path();
        let json = serde_json::to_vec_pretty(record).map_err(|source| {
            RegistryError::CorruptRecord {
                path: target.clone(),
                source,
            }
        })?;

        // temp file in the same directory so the rename cannot cross filesystems
        let mut tmp = NamedTempFile::new_in(dir).map_err(RegistryError::io(dir))?;
        tmp.write_all(&json).map_err(RegistryError::io(tmp.path()))?;
        tmp.as_file().sync_all().map_err(RegistryError::io(tmp.path()))?;
        tmp.persist(&target)
            .map_err(|e| RegistryError::io(&target)(e.error))?;
        debug!(domain = %record.domain, path = %target.display(), "saved CA record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{authority, subject};
    use tempfile::TempDir;

    fn store_with(domains: &[&str]) -> (TempDir, DirectoryStore) {
        let root = TempDir::new().unwrap();
        let store = DirectoryStore::new(root.path());
        for domain in domains {
            let record = authority(root.path(), domain);
            fs::create_dir_all(&record.storage_path).unwrap();
            store.save(&record).unwrap();
        }
        (root, store)
    }

    #[test]
    fn save_then_load_round_trips() {
        let (root, store) = store_with(&["example.com"]);
        let loaded = store.load("example.com").unwrap();
        assert_eq!(loaded, authority(root.path(), "example.com"));

        store.save(&loaded).unwrap();
        assert_eq!(store.load("example.com").unwrap(), loaded);
    }

    #[test]
    fn metadata_uses_flat_field_names() {
        let (root, _store) = store_with(&["example.com"]);
        let raw = fs::read_to_string(root.path().join("example-com").join(METADATA_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        for key in [
            "domain",
            "path",
            "common_name",
            "state",
            "country",
            "email",
            "organization",
            "organization_unit_name",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["organization_unit_name"], subject().organizational_unit);
    }

    #[test]
    fn list_ignores_directories_without_metadata() {
        let (root, store) = store_with(&["b.example", "a.example"]);
        fs::create_dir(root.path().join("scratch")).unwrap();
        fs::write(root.path().join("notes.txt"), "not a CA").unwrap();

        let domains: Vec<String> = store.list().unwrap().into_iter().map(|ca| ca.domain).collect();
        assert_eq!(domains, vec!["a.example", "b.example"]);
    }

    #[test]
    fn list_is_idempotent() {
        let (_root, store) = store_with(&["c.example", "a.example", "b.example"]);
        assert_eq!(store.list().unwrap(), store.list().unwrap());
    }

    #[test]
    fn list_skips_corrupt_records_but_load_reports_them() {
        let (root, store) = store_with(&["good.example"]);
        let broken = root.path().join("broken");
        fs::create_dir(&broken).unwrap();
        fs::write(broken.join(METADATA_FILE), "{ not json").unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
        assert!(store.load("good.example").is_ok());
        assert!(matches!(
            store.load("missing.example"),
            Err(RegistryError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn records_follow_their_directory_when_the_root_moves() {
        let parent = TempDir::new().unwrap();
        let before = parent.path().join("reg1");
        fs::create_dir(&before).unwrap();
        let record = authority(&before, "example.com");
        fs::create_dir(&record.storage_path).unwrap();
        DirectoryStore::new(&before).save(&record).unwrap();

        let after = parent.path().join("reg2");
        fs::rename(&before, &after).unwrap();
        let store = DirectoryStore::new(&after);

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].storage_path, after.join("example-com"));
        assert_eq!(store.load("example.com").unwrap().storage_path, after.join("example-com"));
    }

    #[test]
    fn load_unknown_domain_is_not_found() {
        let (_root, store) = store_with(&["example.com"]);
        assert!(matches!(
            store.load("other.com"),
            Err(RegistryError::NotFound { domain }) if domain == "other.com"
        ));
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let (root, store) = store_with(&["example.com"]);
        let record = store.load("example.com").unwrap();
        store.save(&record).unwrap();
        let files: Vec<_> = fs::read_dir(root.path().join("example-com"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from(METADATA_FILE)]);
    }

    #[test]
    fn issued_server_names_come_from_certificate_files() {
        let (root, store) = store_with(&["example.com"]);
        let ca = store.load("example.com").unwrap();
        let dir = root.path().join("example-com");
        fs::write(dir.join("www.crt"), "").unwrap();
        fs::write(dir.join("api.crt"), "").unwrap();
        fs::write(dir.join("api.key"), "").unwrap();
        fs::write(dir.join(ROOT_CERTIFICATE_FILE), "").unwrap();

        assert_eq!(ca.issued_server_names().unwrap(), vec!["api", "www"]);
    }
}
