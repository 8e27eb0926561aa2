//! Local CA - file-system backed private Certificate Authority registry
//!
//! Bootstraps root Certificate Authorities on local disk and issues TLS server
//! certificates from them. Every CA lives in its own directory under a common
//! registry root and is described by a small JSON record that makes it
//! discoverable on the next run.
//!
//! # Overview
//!
//! ```text
//! Root CA (self-signed, CA:true, SAN *.domain + domain)
//!   └── Server certificate (CA:FALSE, SAN localhost + fqdn + name + IP)
//! ```
//!
//! A registry root looks like this after `create example.com` and `add www`:
//!
//! ```text
//! ./example-com/
//!   ca_config.cnf        rendered root configuration
//!   data.json            metadata record, written last
//!   RootCA.pem           self-signed root certificate
//!   index.txt, serial    `openssl ca` database named by ca_config.cnf
//!   signedcerts/         `openssl ca` output directory
//!   private/RootCA.key   passphrase-encrypted root key (0600, dir 0700)
//!   www.key              unencrypted server key (0600)
//!   www.csr              certificate signing request
//!   www.crt              server certificate signed by RootCA
//!   www.pem              www.crt followed by www.key
//! ```
//!
//! # Quick Start
//!
//! ```bash
//! cargo build --release
//! ./target/release/local-ca --root ./ca
//! ```
//!
//! # Library Use
//!
//! ```no_run
//! use local_ca::issuance::{BootstrapRequest, IssuanceSettings};
//! use local_ca::identity_template::SubjectFields;
//! use local_ca::openssl_engine::OpensslEngine;
//! use local_ca::passphrase::Passphrase;
//! use local_ca::record_store::DirectoryStore;
//! use local_ca::session::RegistrySession;
//!
//! let mut session = RegistrySession::new(
//!     DirectoryStore::new("./ca"),
//!     OpensslEngine::new(),
//!     IssuanceSettings::default(),
//! );
//!
//! let subject = SubjectFields::builder()
//!     .common_name("Example Root CA".to_string())
//!     .state("Bavaria".to_string())
//!     .country("DE".to_string())
//!     .email("pki@example.com".to_string())
//!     .organization("Example GmbH".to_string())
//!     .organizational_unit("Platform".to_string())
//!     .build()?;
//!
//! let passphrase = Passphrase::new("correct horse battery staple");
//! session.create(
//!     &BootstrapRequest {
//!         domain: "example.com".to_string(),
//!         storage_dir: None,
//!         subject,
//!         passphrase: passphrase.clone(),
//!     },
//!     |_existing| false,
//! )?;
//!
//! session.select(0)?;
//! let issued = session.add("www", "10.0.0.5", &passphrase)?;
//! println!("certificate at {}", issued.files.certificate_file.display());
//! # Ok::<(), local_ca::errors::RegistryError>(())
//! ```
//!
//! # Module Overview
//!
//! - [`identity_template`]: subject validation and rendering of root and leaf
//!   configuration documents
//! - [`crypto_engine`]: the engine contract plus key/certificate handles
//! - [`openssl_engine`]: in-process engine on the `openssl` crate
//! - [`command_engine`]: engine driving the `openssl` executable with a timeout
//! - [`record_store`]: `data.json` records and artifact paths per CA
//! - [`issuance`]: atomic root bootstrap and leaf issuance workflows
//! - [`session`]: selection state used by the interactive front-end
//! - [`configs`]: TOML configuration
//!
//! # Security Considerations
//!
//! - The root key is always encrypted with AES-256 under the operator's
//!   passphrase and written with mode `0600` inside a `0700` directory.
//! - Server keys are unencrypted so that servers can load them unattended.
//! - Passphrases are held in [`secrecy::SecretString`] and reach the
//!   subprocess engine through its environment, never through argv.

pub mod command_engine;
pub mod configs;
pub mod crypto_engine;
pub mod errors;
pub mod identity_template;
pub mod issuance;
pub mod openssl_engine;
pub mod passphrase;
pub mod record_store;
pub mod session;

#[cfg(test)]
mod testing;
