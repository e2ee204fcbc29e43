//! Credential loading from the runtime `.env` file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;

use crate::config::{runtime_paths, ConfigError};

/// Key holding the sender mailbox address.
pub const SENDER_ADDRESS_KEY: &str = "GMAIL_ADDRESS";

/// Key holding the sender app password.
pub const SENDER_SECRET_KEY: &str = "GMAIL_APP_PASSWORD";

/// Runtime credentials loaded from the `.env` file.
#[derive(Clone, Default)]
pub struct Credentials {
    vars: BTreeMap<String, String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .field("values", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Build credentials from a key-value map.
    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    /// Returns a credential value for a key, if present and non-blank.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Sender address and secret for the mail session.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredential`] when either value is absent
    /// or blank.
    pub fn mail_credentials(&self) -> Result<MailCredentials, ConfigError> {
        let address = self
            .get(SENDER_ADDRESS_KEY)
            .ok_or(ConfigError::MissingCredential(SENDER_ADDRESS_KEY))?;
        let secret = self
            .get(SENDER_SECRET_KEY)
            .ok_or(ConfigError::MissingCredential(SENDER_SECRET_KEY))?;
        Ok(MailCredentials {
            address: address.to_owned(),
            secret: secret.to_owned(),
        })
    }
}

/// Authenticated sender identity for SMTP.
#[derive(Clone, PartialEq, Eq)]
pub struct MailCredentials {
    /// Sender mailbox; also the SMTP login name.
    pub address: String,
    /// App password used for `AUTH PLAIN`.
    pub secret: String,
}

impl std::fmt::Debug for MailCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailCredentials")
            .field("address", &self.address)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Load credentials from a specific `.env` path.
///
/// # Errors
///
/// Returns an error if the file does not exist, permissions are too broad,
/// or parsing fails.
pub fn load_credentials(path: &Path) -> anyhow::Result<Credentials> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "credentials file does not exist: {}",
            path.display()
        ));
    }

    validate_private_permissions(path)?;

    let mut vars = BTreeMap::new();
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read credentials at {}", path.display()))?;

    for item in iter {
        let (key, value) = item.with_context(|| {
            format!(
                "failed to parse key-value entry in credentials file {}",
                path.display()
            )
        })?;
        vars.insert(key, value);
    }

    Ok(Credentials { vars })
}

/// Load credentials from `~/.invoice-mailer/.env`.
///
/// # Errors
///
/// Returns an error when runtime paths cannot be resolved or the credentials
/// file is invalid.
pub fn load_default_credentials() -> anyhow::Result<Credentials> {
    let paths = runtime_paths()?;
    load_credentials(&paths.env_file)
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to inspect credentials file {}", path.display()))?;
    let mode = metadata.permissions().mode() & 0o777;

    if mode & 0o077 != 0 {
        return Err(anyhow::anyhow!(
            "credentials file {} must be 0600, found {:o}",
            path.display(),
            mode
        ));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}
