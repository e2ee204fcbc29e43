//! External document renderer.
//!
//! Invoice documents are produced by an external program invoked once per
//! invoice. The renderer writes `invoice_{number}.pdf` into the output
//! directory; this module only runs it and checks the result.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::RendererConfig;
use crate::invoice::document_name;

/// Placeholder replaced with the invoice number in renderer arguments.
pub const INVOICE_PLACEHOLDER: &str = "{invoice}";

/// Maximum characters of renderer output kept in an error.
const OUTPUT_TAIL_CHARS: usize = 2000;

/// Errors from document rendering.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The invoice number cannot be used in a file name.
    #[error("invoice number {0:?} is not usable as a document name")]
    InvalidNumber(String),

    /// The renderer process could not be started.
    #[error("failed to start renderer {program}: {reason}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying failure.
        reason: String,
    },

    /// The renderer exited unsuccessfully.
    #[error(
        "renderer exited with {}: {output}",
        .code.map_or_else(|| "signal".to_owned(), |c| format!("status {c}"))
    )]
    Exited {
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// Tail of the renderer's stderr and stdout.
        output: String,
    },

    /// The renderer succeeded but the document is missing or empty.
    #[error("renderer produced no document at {}", .path.display())]
    MissingOutput {
        /// Expected document path.
        path: PathBuf,
    },

    /// The renderer did not finish in time and was killed.
    #[error("renderer timed out after {seconds}s")]
    TimedOut {
        /// Configured deadline in seconds.
        seconds: u64,
    },
}

/// Produces the document for an invoice.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Path where the document for `number` is expected.
    fn document_path(&self, number: &str) -> PathBuf;

    /// Render the document for `number` and return its path.
    async fn render(&self, number: &str) -> Result<PathBuf, RenderError>;
}

/// Runs a configured external command per invoice.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    output_dir: PathBuf,
    timeout: Duration,
}

impl CommandRenderer {
    /// Build a renderer from config, writing into `output_dir`.
    pub fn new(config: &RendererConfig, output_dir: PathBuf) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            output_dir,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Directory documents are read from.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Arguments with the invoice placeholder substituted.
    pub fn args_for(&self, number: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace(INVOICE_PLACEHOLDER, number))
            .collect()
    }
}

/// Reject numbers that would escape the output directory.
fn check_number(number: &str) -> Result<(), RenderError> {
    let trimmed = number.trim();
    if trimmed.is_empty()
        || trimmed != number
        || number.contains(['/', '\\', '\0'])
        || number.starts_with('.')
    {
        return Err(RenderError::InvalidNumber(number.to_owned()));
    }
    Ok(())
}

fn output_tail(stdout: &[u8], stderr: &[u8]) -> String {
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(stderr),
        String::from_utf8_lossy(stdout)
    );
    let trimmed = combined.trim();
    let count = trimmed.chars().count();
    trimmed
        .chars()
        .skip(count.saturating_sub(OUTPUT_TAIL_CHARS))
        .collect()
}

#[async_trait]
impl Renderer for CommandRenderer {
    fn document_path(&self, number: &str) -> PathBuf {
        self.output_dir.join(document_name(number))
    }

    async fn render(&self, number: &str) -> Result<PathBuf, RenderError> {
        check_number(number)?;
        let path = self.document_path(number);

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.args_for(number))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(program = %self.program, invoice = %number, "starting renderer");
        let child = cmd.spawn().map_err(|e| RenderError::Spawn {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;

        // Dropping the output future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| RenderError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                warn!(invoice = %number, "renderer timed out, killed");
                return Err(RenderError::TimedOut {
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            return Err(RenderError::Exited {
                code: output.status.code(),
                output: output_tail(&output.stdout, &output.stderr),
            });
        }

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                info!(invoice = %number, path = %path.display(), "document rendered");
                Ok(path)
            }
            _ => Err(RenderError::MissingOutput { path }),
        }
    }
}
