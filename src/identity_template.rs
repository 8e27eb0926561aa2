//! Identity Template Module
//!
//! Renders a subject (distinguished name) and an extension policy into the
//! OpenSSL configuration format consumed by the crypto engine.
//!
//! Rendering is structured: the template first builds a typed model
//! ([`RenderedConfig`]) of sections and entries, and only then serializes it to
//! text. Every caller-supplied value is validated and escaped on the way in, so
//! a subject field can never open a new section or expand a `$variable`.
//!
//! # Modes
//! ```text
//! root  basicConstraints = critical,CA:true
//!       subjectAltName   = *.<domain>, <domain>
//!
//! leaf  basicConstraints = CA:FALSE
//!       keyUsage         = nonRepudiation, digitalSignature, keyEncipherment
//!       subjectAltName   = localhost, <server>.<domain>, <server>, <server ip>
//! ```
//!
//! # Example
//! ```rust
//! use local_ca::identity_template::{render, SubjectFields, TemplateMode};
//! # fn example() -> local_ca::errors::Result<()> {
//! let subject = SubjectFields::builder()
//!     .common_name("Example Root CA".to_string())
//!     .state("Bavaria".to_string())
//!     .country("DE".to_string())
//!     .email("pki@example.com".to_string())
//!     .organization("Example".to_string())
//!     .organizational_unit("Ops".to_string())
//!     .build()?;
//!
//! let config = render(
//!     &subject,
//!     &TemplateMode::Root {
//!         domain: "example.com",
//!         storage_path: std::path::Path::new("example-com"),
//!     },
//! )?;
//! assert!(config.extensions().ca);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{RegistryError, Result};
use crate::record_store::{
    CA_CERTS_DIR, CA_DATABASE_FILE, CA_SERIAL_FILE, CONFIG_FILE, METADATA_FILE, PRIVATE_DIR,
    ROOT_CERTIFICATE_FILE, ROOT_KEY_FILE,
};

/// Extensions section used when self-signing the root certificate
pub const ROOT_EXTENSIONS_SECTION: &str = "root_ca_extensions";
/// Extensions section requested by leaf CSRs and copied when signing them
pub const LEAF_EXTENSIONS_SECTION: &str = "req_ext";

const CA_DEFAULT_DAYS: u32 = 1825;

// ================= Subject =================

/// The six distinguished-name attributes of a certificate authority
///
/// All fields are required. Leaf certificates inherit every field except the
/// common name, which becomes `<server>.<domain>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectFields {
    pub common_name: String,
    pub state: String,
    pub country: String,
    pub email: String,
    pub organization: String,
    #[serde(rename = "organization_unit_name")]
    pub organizational_unit: String,
}

impl SubjectFields {
    pub fn builder() -> SubjectFieldsBuilder {
        SubjectFieldsBuilder::default()
    }

    /// Check that every attribute is present and representable in a certificate
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("common_name", &self.common_name),
            ("state", &self.state),
            ("country", &self.country),
            ("email", &self.email),
            ("organization", &self.organization),
            ("organizational_unit", &self.organizational_unit),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(RegistryError::MissingField { field });
            }
            reject_control_chars(field, value)?;
        }
        if self.country.len() != 2 || !self.country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(RegistryError::InvalidField {
                field: "country",
                reason: "expected a two-letter ISO country code".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for [`SubjectFields`]; `build()` reports the first missing attribute
#[derive(Debug, Default)]
pub struct SubjectFieldsBuilder {
    common_name: Option<String>,
    state: Option<String>,
    country: Option<String>,
    email: Option<String>,
    organization: Option<String>,
    organizational_unit: Option<String>,
}

impl SubjectFieldsBuilder {
    pub fn common_name(mut self, cn: String) -> Self {
        self.common_name = Some(cn);
        self
    }

    pub fn state(mut self, state: String) -> Self {
        self.state = Some(state);
        self
    }

    /// Two-letter ISO code
    pub fn country(mut self, country: String) -> Self {
        self.country = Some(country);
        self
    }

    pub fn email(mut self, email: String) -> Self {
        self.email = Some(email);
        self
    }

    pub fn organization(mut self, org: String) -> Self {
        self.organization = Some(org);
        self
    }

    pub fn organizational_unit(mut self, ou: String) -> Self {
        self.organizational_unit = Some(ou);
        self
    }

    pub fn build(self) -> Result<SubjectFields> {
        fn required(value: Option<String>, field: &'static str) -> Result<String> {
            match value {
                Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
                _ => Err(RegistryError::MissingField { field }),
            }
        }

        let subject = SubjectFields {
            common_name: required(self.common_name, "common_name")?,
            state: required(self.state, "state")?,
            country: required(self.country, "country")?,
            email: required(self.email, "email")?,
            organization: required(self.organization, "organization")?,
            organizational_unit: required(self.organizational_unit, "organizational_unit")?,
        };
        subject.validate()?;
        Ok(subject)
    }
}

// ================= Server identity =================

/// Identity of a leaf certificate: a host name inside the CA's domain and its IP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub name: String,
    pub ip: IpAddr,
}

impl ServerIdentity {
    /// Validate raw caller input
    ///
    /// The server name doubles as the artifact file stem, so it is restricted
    /// to host-name characters.
    pub fn parse(name: &str, ip: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::MissingField {
                field: "server_name",
            });
        }
        if !is_host_name(name) || name.starts_with('.') || name.ends_with('.') {
            return Err(RegistryError::InvalidField {
                field: "server_name",
                reason: format!("{name:?} is not a host name"),
            });
        }
        if is_reserved_stem(name) {
            return Err(RegistryError::InvalidField {
                field: "server_name",
                reason: format!("{name:?} collides with the CA's own files"),
            });
        }

        let ip = ip.trim();
        if ip.is_empty() {
            return Err(RegistryError::MissingField { field: "server_ip" });
        }
        let ip = ip.parse::<IpAddr>().map_err(|e| RegistryError::InvalidField {
            field: "server_ip",
            reason: e.to_string(),
        })?;

        Ok(Self {
            name: name.to_string(),
            ip,
        })
    }

    pub fn fqdn(&self, domain: &str) -> String {
        format!("{}.{}", self.name, domain)
    }
}

/// File stems a leaf may not use inside a CA directory
fn is_reserved_stem(name: &str) -> bool {
    [ROOT_CERTIFICATE_FILE, ROOT_KEY_FILE, CONFIG_FILE, METADATA_FILE, PRIVATE_DIR]
        .iter()
        .filter_map(|file| Path::new(file).file_stem().and_then(|stem| stem.to_str()))
        .any(|stem| stem.eq_ignore_ascii_case(name))
}

/// Domains are used in DNS subject-alternative-names and directory names
pub fn validate_domain(domain: &str) -> Result<()> {
    if domain.trim().is_empty() {
        return Err(RegistryError::MissingField { field: "domain" });
    }
    if !is_host_name(domain) || domain.starts_with('.') || domain.ends_with('.') {
        return Err(RegistryError::InvalidField {
            field: "domain",
            reason: format!("{domain:?} is not a DNS domain"),
        });
    }
    Ok(())
}

fn is_host_name(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
        && !value.contains("..")
}

fn reject_control_chars(field: &'static str, value: &str) -> Result<()> {
    if value.chars().any(char::is_control) {
        return Err(RegistryError::InvalidField {
            field,
            reason: "control characters are not allowed".to_string(),
        });
    }
    Ok(())
}

/// Escape a value for the OpenSSL config syntax
///
/// `$` would trigger variable expansion, `#` starts a comment, quotes and the
/// backslash itself are escape/quote characters.
pub fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '$' | '#' | '"' | '\'') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// ================= Extension model =================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsageFlag {
    NonRepudiation,
    DigitalSignature,
    KeyEncipherment,
}

impl KeyUsageFlag {
    fn as_config(&self) -> &'static str {
        match self {
            KeyUsageFlag::NonRepudiation => "nonRepudiation",
            KeyUsageFlag::DigitalSignature => "digitalSignature",
            KeyUsageFlag::KeyEncipherment => "keyEncipherment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltName {
    Dns(String),
    Ip(IpAddr),
}

/// Extensions a certificate rendered from this template must carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionPolicy {
    pub ca: bool,
    /// Whether basicConstraints is marked critical
    pub critical: bool,
    pub key_usage: Vec<KeyUsageFlag>,
    pub alt_names: Vec<AltName>,
}

impl ExtensionPolicy {
    fn basic_constraints(&self) -> &'static str {
        match (self.critical, self.ca) {
            (true, true) => "critical,CA:true",
            (false, true) => "CA:true",
            (true, false) => "critical,CA:FALSE",
            (false, false) => "CA:FALSE",
        }
    }

    fn key_usage_value(&self) -> Option<String> {
        if self.key_usage.is_empty() {
            return None;
        }
        let flags: Vec<&str> = self.key_usage.iter().map(KeyUsageFlag::as_config).collect();
        Some(flags.join(", "))
    }

    fn alt_name_entries(&self) -> Vec<(String, String)> {
        let mut dns = 0;
        let mut ip = 0;
        self.alt_names
            .iter()
            .map(|name| match name {
                AltName::Dns(value) => {
                    dns += 1;
                    (format!("DNS.{dns}"), escape_value(value))
                }
                AltName::Ip(value) => {
                    ip += 1;
                    (format!("IP.{ip}"), value.to_string())
                }
            })
            .collect()
    }
}

// ================= Rendered configuration =================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Root,
    Leaf,
}

/// Inputs selecting which certificate the template describes
#[derive(Debug, Clone, Copy)]
pub enum TemplateMode<'a> {
    Root {
        domain: &'a str,
        /// Final directory of the CA, referenced by the `[ local_ca ]` section
        storage_path: &'a Path,
    },
    Leaf {
        domain: &'a str,
        server: &'a ServerIdentity,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSection {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl ConfigSection {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    fn entry(mut self, key: &str, value: impl Into<String>) -> Self {
        self.entries.push((key.to_string(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Configuration payload handed to the crypto engine
///
/// Carries both the typed model (used by the in-process engine) and the
/// sections that serialize to OpenSSL config text (used by the subprocess
/// engine and kept as an audit artifact for root CAs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    kind: TemplateKind,
    subject: SubjectFields,
    extensions: ExtensionPolicy,
    extensions_section: &'static str,
    sections: Vec<ConfigSection>,
}

impl RenderedConfig {
    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    /// Distinguished name of the certificate being requested
    pub fn subject(&self) -> &SubjectFields {
        &self.subject
    }

    pub fn extensions(&self) -> &ExtensionPolicy {
        &self.extensions
    }

    /// Name of the section holding the certificate extensions
    pub fn extensions_section(&self) -> &'static str {
        self.extensions_section
    }

    pub fn section(&self, name: &str) -> Option<&ConfigSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RenderedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[ {} ]", section.name)?;
            let width = section.entries.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
            for (key, value) in &section.entries {
                writeln!(f, "{key:<width$} = {value}")?;
            }
        }
        Ok(())
    }
}

/// Render the engine configuration for a root CA or a leaf certificate
///
/// Pure function of its inputs. Fails with `MissingField` when an identity
/// attribute is absent and `InvalidField` when one cannot be represented.
pub fn render(subject: &SubjectFields, mode: &TemplateMode<'_>) -> Result<RenderedConfig> {
    subject.validate()?;
    match *mode {
        TemplateMode::Root {
            domain,
            storage_path,
        } => {
            validate_domain(domain)?;
            Ok(render_root(subject, domain, storage_path))
        }
        TemplateMode::Leaf { domain, server } => {
            validate_domain(domain)?;
            Ok(render_leaf(subject, domain, server))
        }
    }
}

fn distinguished_name(name: &str, subject: &SubjectFields) -> ConfigSection {
    ConfigSection::new(name)
        .entry("commonName", escape_value(&subject.common_name))
        .entry("stateOrProvinceName", escape_value(&subject.state))
        .entry("countryName", escape_value(&subject.country))
        .entry("emailAddress", escape_value(&subject.email))
        .entry("organizationName", escape_value(&subject.organization))
        .entry(
            "organizationalUnitName",
            escape_value(&subject.organizational_unit),
        )
}

fn alt_names_section(policy: &ExtensionPolicy) -> ConfigSection {
    let mut section = ConfigSection::new("alt_names");
    section.entries = policy.alt_name_entries();
    section
}

fn render_root(subject: &SubjectFields, domain: &str, storage_path: &Path) -> RenderedConfig {
    let extensions = ExtensionPolicy {
        ca: true,
        critical: true,
        key_usage: Vec::new(),
        alt_names: vec![
            AltName::Dns(format!("*.{domain}")),
            AltName::Dns(domain.to_string()),
        ],
    };

    let dir = escape_value(&storage_path.to_string_lossy());
    let sections = vec![
        ConfigSection::new("ca").entry("default_ca", "local_ca"),
        ConfigSection::new("local_ca")
            .entry("dir", dir)
            .entry("database", format!("$dir/{CA_DATABASE_FILE}"))
            .entry("new_certs_dir", format!("$dir/{CA_CERTS_DIR}"))
            .entry("certificate", format!("$dir/{ROOT_CERTIFICATE_FILE}"))
            .entry("serial", format!("$dir/{CA_SERIAL_FILE}"))
            .entry("private_key", format!("$dir/{PRIVATE_DIR}/{ROOT_KEY_FILE}"))
            .entry("default_days", CA_DEFAULT_DAYS.to_string())
            .entry("default_md", "sha256")
            .entry("policy", "local_ca_policy")
            .entry("x509_extensions", "local_ca_extensions")
            .entry("copy_extensions", "copy"),
        ConfigSection::new("local_ca_policy")
            .entry("commonName", "supplied")
            .entry("stateOrProvinceName", "supplied")
            .entry("countryName", "supplied")
            .entry("emailAddress", "supplied")
            .entry("organizationName", "supplied")
            .entry("organizationalUnitName", "supplied"),
        ConfigSection::new("local_ca_extensions").entry("basicConstraints", "CA:FALSE"),
        ConfigSection::new("req")
            .entry("default_md", "sha256")
            .entry("prompt", "no")
            .entry("distinguished_name", "root_ca_distinguished_name")
            .entry("x509_extensions", ROOT_EXTENSIONS_SECTION),
        distinguished_name("root_ca_distinguished_name", subject),
        ConfigSection::new(ROOT_EXTENSIONS_SECTION)
            .entry("basicConstraints", extensions.basic_constraints())
            .entry("subjectAltName", "@alt_names"),
        alt_names_section(&extensions),
    ];

    RenderedConfig {
        kind: TemplateKind::Root,
        subject: subject.clone(),
        extensions,
        extensions_section: ROOT_EXTENSIONS_SECTION,
        sections,
    }
}

fn render_leaf(subject: &SubjectFields, domain: &str, server: &ServerIdentity) -> RenderedConfig {
    let fqdn = server.fqdn(domain);
    let leaf_subject = SubjectFields {
        common_name: fqdn.clone(),
        ..subject.clone()
    };
    let extensions = ExtensionPolicy {
        ca: false,
        critical: false,
        key_usage: vec![
            KeyUsageFlag::NonRepudiation,
            KeyUsageFlag::DigitalSignature,
            KeyUsageFlag::KeyEncipherment,
        ],
        alt_names: vec![
            AltName::Dns("localhost".to_string()),
            AltName::Dns(fqdn),
            AltName::Dns(server.name.clone()),
            AltName::Ip(server.ip),
        ],
    };

    let mut ext_section = ConfigSection::new(LEAF_EXTENSIONS_SECTION)
        .entry("basicConstraints", extensions.basic_constraints());
    if let Some(usage) = extensions.key_usage_value() {
        ext_section = ext_section.entry("keyUsage", usage);
    }
    ext_section = ext_section.entry("subjectAltName", "@alt_names");

    let sections = vec![
        ConfigSection::new("req")
            .entry("default_md", "sha256")
            .entry("prompt", "no")
            .entry("distinguished_name", "server_distinguished_name")
            .entry("req_extensions", LEAF_EXTENSIONS_SECTION),
        distinguished_name("server_distinguished_name", &leaf_subject),
        ext_section,
        alt_names_section(&extensions),
    ];

    RenderedConfig {
        kind: TemplateKind::Leaf,
        subject: leaf_subject,
        extensions,
        extensions_section: LEAF_EXTENSIONS_SECTION,
        sections,
    }
}
