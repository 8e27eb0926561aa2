//! Secure in-memory storage for the root CA passphrase using the secrecy crate
//!
//! The passphrase protecting a CA's root key is needed twice: when the key is
//! generated at bootstrap and every time a leaf certificate is signed. This
//! module keeps it in a zeroize-on-drop container that never shows up in debug
//! output.

use secrecy::{ExposeSecret, SecretString};
use std::fmt;

/// Passphrase for a root CA private key
///
/// Uses the `secrecy` crate to ensure the passphrase is:
/// - Protected from accidental exposure (won't appear in debug output)
/// - Automatically zeroized when dropped
/// - Only accessible through an explicit `expose()` call
pub struct Passphrase {
    secret: SecretString,
}

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            secret: SecretString::from(value.into()),
        }
    }

    /// Read a passphrase from the terminal without echoing it
    pub fn prompt(message: &str) -> std::io::Result<Self> {
        let value = rpassword::prompt_password(message)?;
        Ok(Self::new(value))
    }

    pub fn is_empty(&self) -> bool {
        self.secret.expose_secret().is_empty()
    }

    /// Compare with a second entry, e.g. a verification prompt
    pub fn matches(&self, other: &Passphrase) -> bool {
        self.expose() == other.expose()
    }

    pub(crate) fn expose(&self) -> &str {
        self.secret.expose_secret()
    }
}

impl Clone for Passphrase {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Passphrase")
            .field("secret", &"<redacted>")
            .finish()
    }
}
