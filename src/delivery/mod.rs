//! Delivery orchestration: render, compose, transmit, record.
//!
//! One orchestrated attempt runs for one invoice under an in-flight guard.
//! Every failure before transmission leaves the stored invoice untouched.
//! A failure to record the status after a successful transmission is
//! reported as [`DeliveryError::PersistFailedAfterDelivery`]: the mail has
//! gone out and the stored flags are stale until reconciled by hand.

pub mod locks;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ConfigError;
use crate::invoice::store::StoreError;
use crate::invoice::{Invoice, InvoiceStatus, InvoiceStore, InvoiceSummary, StatusChange};
use crate::mail::composer::{compose, ComposeError, MailSettings};
use crate::mail::transport::{MailTransport, TransportError};
use crate::render::{RenderError, Renderer};

pub use locks::{InvoiceLockGuard, InvoiceLocks};

/// Whether an existing rendered document is regenerated before sending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderPolicy {
    /// Run the renderer on every attempt.
    #[default]
    Always,
    /// Send an existing non-empty document as is; render only when absent.
    ReuseExisting,
}

/// Stage of an orchestrated attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStage {
    /// External document rendering.
    Render,
    /// Reading the document and building the message.
    Compose,
    /// The mail session.
    Transport,
    /// Recording the status transition.
    Persist,
}

impl fmt::Display for DeliveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Render => "render",
            Self::Compose => "compose",
            Self::Transport => "transport",
            Self::Persist => "persist",
        })
    }
}

/// Outcome of a failed orchestrated operation.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Sending is not configured; nothing was attempted.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// No invoice with this number exists.
    #[error("invoice not found: {0}")]
    NotFound(String),

    /// Another attempt for this invoice is in progress.
    #[error("a delivery attempt for invoice {0} is already in progress")]
    AlreadyInFlight(String),

    /// The invoice was already sent; sending it again would bill twice.
    #[error("invoice {number} is already {status}; refusing to send it again")]
    AlreadySubmitted {
        /// Invoice number.
        number: String,
        /// Current status.
        status: InvoiceStatus,
    },

    /// The renderer did not produce the document.
    #[error("rendering invoice {number} failed: {source}")]
    RenderFailed {
        /// Invoice number.
        number: String,
        /// Renderer failure.
        #[source]
        source: RenderError,
    },

    /// The document could not be read or the message could not be built.
    #[error("composing mail for invoice {number} failed: {source}")]
    ComposeFailed {
        /// Invoice number.
        number: String,
        /// Composition failure.
        #[source]
        source: ComposeError,
    },

    /// The mail session failed; the invoice is unchanged and safe to retry.
    #[error("sending invoice {number} failed during {}: {source}", .source.phase())]
    TransportFailed {
        /// Invoice number.
        number: String,
        /// Transport failure, carrying the failed phase.
        #[source]
        source: TransportError,
    },

    /// A stage ran past its deadline.
    #[error("invoice {number}: {stage} timed out: {detail}")]
    TimedOut {
        /// Invoice number.
        number: String,
        /// Stage that timed out.
        stage: DeliveryStage,
        /// Description of the expired deadline.
        detail: String,
    },

    /// The store failed before any external effect.
    #[error("store error: {0}")]
    Store(#[source] StoreError),

    /// The mail was delivered but the status update failed.
    #[error(
        "invoice {number} was delivered to {} but recording it as submitted failed: {source}",
        .recipients.join(", ")
    )]
    PersistFailedAfterDelivery {
        /// Invoice number.
        number: String,
        /// Envelope recipients that received the message.
        recipients: Vec<String>,
        /// Store failure.
        #[source]
        source: StoreError,
    },
}

impl DeliveryError {
    /// Whether the external effect already happened and stored state is stale.
    pub fn is_after_delivery(&self) -> bool {
        matches!(self, Self::PersistFailedAfterDelivery { .. })
    }

    /// Stage that failed, for stage-bound failures.
    pub fn stage(&self) -> Option<DeliveryStage> {
        match self {
            Self::RenderFailed { .. } => Some(DeliveryStage::Render),
            Self::ComposeFailed { .. } => Some(DeliveryStage::Compose),
            Self::TransportFailed { .. } => Some(DeliveryStage::Transport),
            Self::TimedOut { stage, .. } => Some(*stage),
            Self::PersistFailedAfterDelivery { .. } => Some(DeliveryStage::Persist),
            Self::Configuration(_)
            | Self::NotFound(_)
            | Self::AlreadyInFlight(_)
            | Self::AlreadySubmitted { .. }
            | Self::Store(_) => None,
        }
    }
}

impl From<StoreError> for DeliveryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(number) => Self::NotFound(number),
            other => Self::Store(other),
        }
    }
}

/// Result of a successful orchestrated submission.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// Invoice number delivered.
    pub number: String,
    /// Envelope recipients the message was accepted for.
    pub recipients: Vec<String>,
    /// Size of the transmitted message in bytes.
    pub message_bytes: usize,
    /// Invoice reloaded after the status transition, if the reload succeeded.
    pub invoice: Option<Invoice>,
    /// Summary recomputed after the status transition, if it succeeded.
    pub summary: Option<InvoiceSummary>,
}

/// Outbound mail wiring: sender identity plus transport.
#[derive(Clone)]
pub struct Outbound {
    /// Sender and displayed routing.
    pub settings: MailSettings,
    /// Mail transport.
    pub transport: Arc<dyn MailTransport>,
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Sequences render, compose, transport, and persist for one invoice.
pub struct DeliveryOrchestrator {
    store: Arc<dyn InvoiceStore>,
    renderer: Arc<dyn Renderer>,
    outbound: Result<Outbound, ConfigError>,
    policy: RenderPolicy,
    locks: InvoiceLocks,
}

impl DeliveryOrchestrator {
    /// Create an orchestrator.
    ///
    /// `outbound` carries the configuration error, if any, that makes sending
    /// impossible; operations that do not send still work.
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        renderer: Arc<dyn Renderer>,
        outbound: Result<Outbound, ConfigError>,
        policy: RenderPolicy,
    ) -> Self {
        Self {
            store,
            renderer,
            outbound,
            policy,
            locks: InvoiceLocks::new(),
        }
    }

    /// Create an orchestrator for operations that never send mail.
    pub fn without_mail(
        store: Arc<dyn InvoiceStore>,
        renderer: Arc<dyn Renderer>,
        policy: RenderPolicy,
    ) -> Self {
        let disabled = ConfigError::Invalid {
            key: "mail",
            reason: "outbound mail is not configured for this operation".to_owned(),
        };
        Self::new(store, renderer, Err(disabled), policy)
    }

    /// Store shared with this orchestrator.
    pub fn store(&self) -> &Arc<dyn InvoiceStore> {
        &self.store
    }

    /// In-flight guard registry.
    pub fn locks(&self) -> &InvoiceLocks {
        &self.locks
    }

    fn outbound(&self) -> Result<&Outbound, DeliveryError> {
        self.outbound
            .as_ref()
            .map_err(|e| DeliveryError::Configuration(e.clone()))
    }

    fn claim(&self, number: &str) -> Result<InvoiceLockGuard, DeliveryError> {
        self.locks.try_acquire(number).ok_or_else(|| {
            warn!(invoice = %number, "delivery attempt already in flight");
            DeliveryError::AlreadyInFlight(number.to_owned())
        })
    }

    /// Render, compose, transmit, and record one invoice as submitted.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::AlreadySubmitted`] for an invoice that is
    /// already submitted or paid, otherwise the [`DeliveryError`] of the first
    /// failing stage. Only
    /// [`DeliveryError::PersistFailedAfterDelivery`] follows a transmission.
    #[instrument(skip(self), fields(invoice = %number))]
    pub async fn submit(&self, number: &str) -> Result<DeliveryReport, DeliveryError> {
        let outbound = self.outbound()?;
        let _guard = self.claim(number)?;
        let invoice = self.store.fetch_by_number(number).await?;
        if invoice.submitted {
            let status = invoice.status();
            warn!(invoice = %number, %status, "invoice already submitted, not sending");
            return Err(DeliveryError::AlreadySubmitted {
                number: invoice.number,
                status,
            });
        }
        self.deliver(outbound, &invoice).await
    }

    /// Submit the most recently created pending invoice.
    ///
    /// Returns `Ok(None)` when no invoice is pending.
    ///
    /// # Errors
    ///
    /// As [`DeliveryOrchestrator::submit`].
    #[instrument(skip(self))]
    pub async fn submit_next_pending(&self) -> Result<Option<DeliveryReport>, DeliveryError> {
        let outbound = self.outbound()?;
        let Some(candidate) = self.store.latest_pending().await? else {
            info!("no pending invoice to submit");
            return Ok(None);
        };
        let _guard = self.claim(&candidate.number)?;
        // Re-read under the guard; another process may have submitted it.
        let invoice = self.store.fetch_by_number(&candidate.number).await?;
        if invoice.submitted {
            info!(invoice = %invoice.number, "invoice submitted concurrently, skipping");
            return Ok(None);
        }
        self.deliver(outbound, &invoice).await.map(Some)
    }

    async fn deliver(
        &self,
        outbound: &Outbound,
        invoice: &Invoice,
    ) -> Result<DeliveryReport, DeliveryError> {
        let number = invoice.number.as_str();

        let path = self.ensure_document(number).await?;
        let document = tokio::fs::read(&path)
            .await
            .map_err(|source| DeliveryError::ComposeFailed {
                number: number.to_owned(),
                source: ComposeError::Unreadable {
                    path: path.clone(),
                    source,
                },
            })?;

        let message = compose(invoice, &document, &outbound.settings).map_err(|source| {
            DeliveryError::ComposeFailed {
                number: number.to_owned(),
                source,
            }
        })?;
        debug!(
            bytes = message.as_bytes().len(),
            recipients = message.envelope.recipients.len(),
            "message composed"
        );

        outbound
            .transport
            .send(&message)
            .await
            .map_err(|source| match source {
                TransportError::TimedOut { .. } => DeliveryError::TimedOut {
                    number: number.to_owned(),
                    stage: DeliveryStage::Transport,
                    detail: source.to_string(),
                },
                source => DeliveryError::TransportFailed {
                    number: number.to_owned(),
                    source,
                },
            })?;
        info!(
            invoice = %number,
            recipients = %message.envelope.recipients.join(", "),
            "invoice delivered"
        );

        if let Err(source) = self.store.apply_change(number, StatusChange::Submit).await {
            error!(
                invoice = %number,
                error = %source,
                "invoice delivered but status update failed; manual reconciliation required"
            );
            return Err(DeliveryError::PersistFailedAfterDelivery {
                number: number.to_owned(),
                recipients: message.envelope.recipients.clone(),
                source,
            });
        }

        let reloaded = match self.store.fetch_by_number(number).await {
            Ok(inv) => Some(inv),
            Err(e) => {
                warn!(invoice = %number, error = %e, "failed to reload invoice after submission");
                None
            }
        };
        let summary = match self.store.summary().await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "failed to recompute summary after submission");
                None
            }
        };

        Ok(DeliveryReport {
            number: number.to_owned(),
            recipients: message.envelope.recipients.clone(),
            message_bytes: message.as_bytes().len(),
            invoice: reloaded,
            summary,
        })
    }

    async fn ensure_document(&self, number: &str) -> Result<std::path::PathBuf, DeliveryError> {
        if self.policy == RenderPolicy::ReuseExisting {
            let path = self.renderer.document_path(number);
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                if meta.is_file() && meta.len() > 0 {
                    debug!(invoice = %number, path = %path.display(), "reusing rendered document");
                    return Ok(path);
                }
            }
        }
        self.renderer
            .render(number)
            .await
            .map_err(|source| match source {
                RenderError::TimedOut { .. } => DeliveryError::TimedOut {
                    number: number.to_owned(),
                    stage: DeliveryStage::Render,
                    detail: source.to_string(),
                },
                source => DeliveryError::RenderFailed {
                    number: number.to_owned(),
                    source,
                },
            })
    }

    /// Render the document for an existing invoice without sending it.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::NotFound`] for unknown numbers, otherwise the
    /// render-stage failure.
    #[instrument(skip(self), fields(invoice = %number))]
    pub async fn render(&self, number: &str) -> Result<std::path::PathBuf, DeliveryError> {
        let _guard = self.claim(number)?;
        let invoice = self.store.fetch_by_number(number).await?;
        self.renderer
            .render(&invoice.number)
            .await
            .map_err(|source| match source {
                RenderError::TimedOut { .. } => DeliveryError::TimedOut {
                    number: invoice.number.clone(),
                    stage: DeliveryStage::Render,
                    detail: source.to_string(),
                },
                source => DeliveryError::RenderFailed {
                    number: invoice.number.clone(),
                    source,
                },
            })
    }

    /// Mark an invoice paid (and submitted). Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::NotFound`] when no row was affected.
    #[instrument(skip(self), fields(invoice = %number))]
    pub async fn mark_paid(&self, number: &str) -> Result<Invoice, DeliveryError> {
        self.apply(number, StatusChange::Pay).await
    }

    /// Mark an invoice submitted without sending it. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::NotFound`] when no row was affected.
    #[instrument(skip(self), fields(invoice = %number))]
    pub async fn mark_submitted(&self, number: &str) -> Result<Invoice, DeliveryError> {
        self.apply(number, StatusChange::Submit).await
    }

    async fn apply(&self, number: &str, change: StatusChange) -> Result<Invoice, DeliveryError> {
        self.store.apply_change(number, change).await?;
        let invoice = self.store.fetch_by_number(number).await?;
        info!(status = %invoice.status(), "invoice status updated");
        Ok(invoice)
    }
}
