//! Configuration loading and validation.
//!
//! Invoice-mailer uses a split config model:
//! - `config.toml` — mail routing, renderer, store, and billing defaults
//! - `.env` — the sender credentials (see [`crate::credentials`])
//!
//! Every section has defaults, so a missing or empty `config.toml` is valid.
//! Recipients have no default and are checked when a send is configured.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::delivery::RenderPolicy;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "INVOICE_MAILER_CONFIG";

/// Errors raised when configuration is insufficient for an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required credential is absent or empty.
    #[error("missing required credential: {0}")]
    MissingCredential(&'static str),

    /// No displayed recipients are configured for outbound mail.
    #[error("no recipients configured under [mail].recipients")]
    NoRecipients,

    /// A configured value is unusable.
    #[error("invalid configuration value for {key}: {reason}")]
    Invalid {
        /// Dotted config key.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Outbound mail routing.
    #[serde(default)]
    pub mail: MailConfig,

    /// External document renderer.
    #[serde(default)]
    pub renderer: RendererConfig,

    /// Invoice database location.
    #[serde(default)]
    pub store: StoreConfig,

    /// Defaults for newly created weekly invoices.
    #[serde(default)]
    pub billing: BillingConfig,
}

/// Outbound mail routing.
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// SMTP host; also the name the server certificate is verified against.
    #[serde(default = "default_mail_host")]
    pub host: String,

    /// Implicit-TLS submission port.
    #[serde(default = "default_mail_port")]
    pub port: u16,

    /// Addresses shown in the `To` header.
    #[serde(default)]
    pub recipients: Vec<String>,

    /// Identity string embedded in the subject line and signature.
    #[serde(default = "default_sender_name")]
    pub sender_name: String,

    /// Addressee line in the HTML body.
    #[serde(default = "default_greeting")]
    pub greeting: String,

    /// Name announced in `EHLO`.
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Deadline for the whole SMTP session.
    #[serde(default = "default_mail_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            host: default_mail_host(),
            port: default_mail_port(),
            recipients: Vec::new(),
            sender_name: default_sender_name(),
            greeting: default_greeting(),
            client_name: default_client_name(),
            timeout_secs: default_mail_timeout_secs(),
        }
    }
}

/// External document renderer invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct RendererConfig {
    /// Program to execute.
    #[serde(default = "default_renderer_program")]
    pub program: String,

    /// Arguments; `{invoice}` is replaced with the invoice number.
    #[serde(default = "default_renderer_args")]
    pub args: Vec<String>,

    /// Working directory for the renderer process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Directory the renderer writes `invoice_{number}.pdf` into.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Deadline for one renderer invocation.
    #[serde(default = "default_renderer_timeout_secs")]
    pub timeout_secs: u64,

    /// Whether to regenerate an existing document before sending.
    #[serde(default)]
    pub policy: RenderPolicy,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            program: default_renderer_program(),
            args: default_renderer_args(),
            working_dir: None,
            output_dir: None,
            timeout_secs: default_renderer_timeout_secs(),
            policy: RenderPolicy::default(),
        }
    }
}

/// Invoice database location.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database. Defaults to `~/.invoice-mailer/invoices.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Defaults applied by `create-week`.
#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    /// Payee name.
    #[serde(default)]
    pub payee: String,

    /// Payee address.
    #[serde(default)]
    pub payee_address: String,

    /// Payor name.
    #[serde(default)]
    pub payor: String,

    /// Payor address.
    #[serde(default)]
    pub payor_address: String,

    /// Payor phone.
    #[serde(default)]
    pub payor_phone: String,

    /// Payment terms in days.
    #[serde(default = "default_payment_terms")]
    pub payment_terms: i64,

    /// Hourly rate.
    #[serde(default = "default_hourly_rate")]
    pub hourly_rate: f64,

    /// Hours billed per working day.
    #[serde(default = "default_daily_hours")]
    pub daily_hours: f64,

    /// Clock-in time (`HH:MM`).
    #[serde(default = "default_clock_in")]
    pub clock_in: String,

    /// Clock-out time (`HH:MM`).
    #[serde(default = "default_clock_out")]
    pub clock_out: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            payee: String::new(),
            payee_address: String::new(),
            payor: String::new(),
            payor_address: String::new(),
            payor_phone: String::new(),
            payment_terms: default_payment_terms(),
            hourly_rate: default_hourly_rate(),
            daily_hours: default_daily_hours(),
            clock_in: default_clock_in(),
            clock_out: default_clock_out(),
        }
    }
}

// Default value functions for serde

fn default_mail_host() -> String {
    "smtp.gmail.com".to_owned()
}
fn default_mail_port() -> u16 {
    465
}
fn default_sender_name() -> String {
    "Contractor".to_owned()
}
fn default_greeting() -> String {
    "Dear Billing Team,".to_owned()
}
fn default_client_name() -> String {
    "localhost".to_owned()
}
fn default_mail_timeout_secs() -> u64 {
    60
}
fn default_renderer_program() -> String {
    "python3".to_owned()
}
fn default_renderer_args() -> Vec<String> {
    vec![
        "invoice_cli.py".to_owned(),
        "generate".to_owned(),
        "{invoice}".to_owned(),
    ]
}
fn default_renderer_timeout_secs() -> u64 {
    120
}
fn default_payment_terms() -> i64 {
    15
}
fn default_hourly_rate() -> f64 {
    80.0
}
fn default_daily_hours() -> f64 {
    8.0
}
fn default_clock_in() -> String {
    "10:00".to_owned()
}
fn default_clock_out() -> String {
    "18:00".to_owned()
}

/// Resolved runtime file locations under `~/.invoice-mailer/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Root directory.
    pub root: PathBuf,
    /// Default `config.toml`.
    pub config_toml: PathBuf,
    /// Credentials `.env`.
    pub env_file: PathBuf,
    /// Default SQLite database.
    pub database: PathBuf,
    /// Default rendered document directory.
    pub documents_dir: PathBuf,
    /// JSON log directory for unattended runs.
    pub logs_dir: PathBuf,
}

impl RuntimePaths {
    /// Lay out runtime paths under an explicit root.
    pub fn under(root: PathBuf) -> Self {
        Self {
            config_toml: root.join("config.toml"),
            env_file: root.join(".env"),
            database: root.join("invoices.db"),
            documents_dir: root.join("invoices"),
            logs_dir: root.join("logs"),
            root,
        }
    }
}

/// Resolve the default config directory (`~/.invoice-mailer/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".invoice-mailer"))
}

/// Resolve all runtime paths under the default config directory.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths() -> anyhow::Result<RuntimePaths> {
    Ok(RuntimePaths::under(config_dir()?))
}

impl AppConfig {
    /// Database path, falling back to the runtime default.
    pub fn database_path(&self, paths: &RuntimePaths) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| paths.database.clone())
    }

    /// Rendered document directory, falling back to the runtime default.
    pub fn documents_dir(&self, paths: &RuntimePaths) -> PathBuf {
        self.renderer
            .output_dir
            .clone()
            .unwrap_or_else(|| paths.documents_dir.clone())
    }
}

/// Load the config from a TOML file; a missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            tracing::debug!(path = %path.display(), "loading config from file");
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config at {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            Ok(AppConfig::default())
        }
        Err(e) => Err(anyhow::anyhow!(
            "failed to read config at {}: {e}",
            path.display()
        )),
    }
}
