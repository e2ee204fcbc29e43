//! Multipart message composition for invoice delivery.
//!
//! Builds a `multipart/mixed` message with an HTML summary part and the
//! rendered document as a base64 `application/pdf` attachment. The displayed
//! `To` header lists only the configured recipients; the envelope also
//! includes the sender so they keep a copy.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::Rng;
use tracing::debug;

use super::encoding::encode_wrapped;
use crate::config::{ConfigError, MailConfig};
use crate::invoice::Invoice;

/// Fresh boundaries tried before composition gives up.
const MAX_BOUNDARY_ATTEMPTS: usize = 8;

/// Errors from message composition.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    /// The rendered document could not be read.
    #[error("failed to read rendered document {}: {source}", .path.display())]
    Unreadable {
        /// Document path.
        path: std::path::PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The rendered document has no content.
    #[error("rendered document for {0} is empty")]
    EmptyDocument(String),

    /// A header value contains a line break.
    #[error("header {field} contains a line break")]
    HeaderInjection {
        /// Header name.
        field: &'static str,
    },

    /// Every boundary tried occurred inside a body part.
    #[error("boundary collided with message content after {attempts} attempts")]
    BoundaryCollision {
        /// Number of boundaries tried.
        attempts: usize,
    },
}

/// Sender identity and displayed routing for outbound invoices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSettings {
    /// Sender address: `From`, `Cc`, and an envelope copy recipient.
    pub sender: String,
    /// Addresses displayed in the `To` header.
    pub recipients: Vec<String>,
    /// Identity string embedded in the subject and signature.
    pub sender_name: String,
    /// Addressee line at the top of the HTML body.
    pub greeting: String,
}

impl MailSettings {
    /// Build settings from the mail config and the authenticated sender address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoRecipients`] when no recipients are configured.
    pub fn from_config(sender: &str, mail: &MailConfig) -> Result<Self, ConfigError> {
        let recipients: Vec<String> = mail
            .recipients
            .iter()
            .map(|r| r.trim().to_owned())
            .filter(|r| !r.is_empty())
            .collect();
        if recipients.is_empty() {
            return Err(ConfigError::NoRecipients);
        }
        Ok(Self {
            sender: sender.to_owned(),
            recipients,
            sender_name: mail.sender_name.clone(),
            greeting: mail.greeting.clone(),
        })
    }

    /// Envelope recipients: displayed recipients plus the sender, deduplicated.
    pub fn envelope_recipients(&self) -> Vec<String> {
        let mut all = self.recipients.clone();
        if !all.iter().any(|r| r.eq_ignore_ascii_case(&self.sender)) {
            all.push(self.sender.clone());
        }
        all
    }
}

/// Protocol-level sender and recipients for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// `MAIL FROM` address.
    pub sender: String,
    /// `RCPT TO` addresses, in order.
    pub recipients: Vec<String>,
}

/// A complete message ready for transport.
#[derive(Debug, Clone)]
pub struct ComposedMessage {
    /// Envelope to declare before `DATA`.
    pub envelope: Envelope,
    /// Multipart boundary token used in this message.
    pub boundary: String,
    /// Attachment file name.
    pub attachment_name: String,
    /// Full message text with CRLF line endings.
    pub content: String,
}

impl ComposedMessage {
    /// Message bytes as written to the data channel.
    pub fn as_bytes(&self) -> &[u8] {
        self.content.as_bytes()
    }
}

/// Generate a random multipart boundary token.
pub fn generate_boundary() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "----=_Part_{:016x}.{:016x}",
        rng.gen::<u64>(),
        rng.gen::<u64>()
    )
}

/// Compose an invoice message with a fresh random boundary.
///
/// # Errors
///
/// Returns [`ComposeError`] when the document is empty, a header value carries
/// a line break, or no collision-free boundary is found.
pub fn compose(
    invoice: &Invoice,
    document: &[u8],
    settings: &MailSettings,
) -> Result<ComposedMessage, ComposeError> {
    for _ in 0..MAX_BOUNDARY_ATTEMPTS {
        match compose_with_boundary(invoice, document, settings, &generate_boundary()) {
            Err(ComposeError::BoundaryCollision { .. }) => {
                debug!(invoice = %invoice.number, "boundary collision, regenerating");
            }
            other => return other,
        }
    }
    Err(ComposeError::BoundaryCollision {
        attempts: MAX_BOUNDARY_ATTEMPTS,
    })
}

/// Compose an invoice message with a caller-chosen boundary.
///
/// # Errors
///
/// As [`compose`]; a boundary occurring in either body part yields
/// [`ComposeError::BoundaryCollision`] with `attempts = 1`.
pub fn compose_with_boundary(
    invoice: &Invoice,
    document: &[u8],
    settings: &MailSettings,
    boundary: &str,
) -> Result<ComposedMessage, ComposeError> {
    if document.is_empty() {
        return Err(ComposeError::EmptyDocument(invoice.number.clone()));
    }

    let envelope_recipients = settings.envelope_recipients();
    let subject = format!(
        "Weekly Invoice {} - {}",
        invoice.number, settings.sender_name
    );
    let to = settings.recipients.join(", ");
    for (field, value) in [
        ("From", settings.sender.as_str()),
        ("To", to.as_str()),
        ("Subject", subject.as_str()),
    ] {
        if value.contains(['\r', '\n']) {
            return Err(ComposeError::HeaderInjection { field });
        }
    }

    let html = html_body(invoice, settings);
    let encoded = encode_wrapped(document);
    if html.contains(boundary) || encoded.contains(boundary) {
        return Err(ComposeError::BoundaryCollision { attempts: 1 });
    }

    let attachment_name = invoice.document_name();
    let capacity = encoded.len().saturating_add(html.len()).saturating_add(1024);
    let mut out = String::with_capacity(capacity);

    push_line(&mut out, &format!("From: {}", settings.sender));
    push_line(&mut out, &format!("To: {to}"));
    push_line(&mut out, &format!("Cc: {}", settings.sender));
    push_line(&mut out, &format!("Subject: {}", encode_header_text(&subject)));
    push_line(&mut out, "MIME-Version: 1.0");
    push_line(
        &mut out,
        &format!("Content-Type: multipart/mixed; boundary=\"{boundary}\""),
    );
    push_line(&mut out, "");

    push_line(&mut out, &format!("--{boundary}"));
    push_line(&mut out, "Content-Type: text/html; charset=\"utf-8\"");
    push_line(&mut out, "");
    push_line(&mut out, &html);

    push_line(&mut out, &format!("--{boundary}"));
    push_line(&mut out, "Content-Type: application/pdf");
    push_line(
        &mut out,
        &format!("Content-Disposition: attachment; filename=\"{attachment_name}\""),
    );
    push_line(&mut out, "Content-Transfer-Encoding: base64");
    push_line(&mut out, "");
    push_line(&mut out, &encoded);

    push_line(&mut out, &format!("--{boundary}--"));

    Ok(ComposedMessage {
        envelope: Envelope {
            sender: settings.sender.clone(),
            recipients: envelope_recipients,
        },
        boundary: boundary.to_owned(),
        attachment_name,
        content: out,
    })
}

fn push_line(out: &mut String, line: &str) {
    out.push_str(line);
    out.push_str("\r\n");
}

/// HTML summary part, CRLF-terminated lines without a trailing break.
fn html_body(invoice: &Invoice, settings: &MailSettings) -> String {
    let lines = [
        "<html>".to_owned(),
        "<body style=\"font-family: Arial, sans-serif;\">".to_owned(),
        "<h2>Weekly Timesheet &amp; Invoice</h2>".to_owned(),
        format!("<p>{}</p>", escape_html(&settings.greeting)),
        "<p>Please find attached my weekly invoice.</p>".to_owned(),
        "<div style=\"background: #f8f9fa; padding: 20px; margin: 20px 0;\">".to_owned(),
        format!(
            "<p><strong>Invoice:</strong> {}</p>",
            escape_html(&invoice.number)
        ),
        format!("<p><strong>Hours:</strong> {:.1}</p>", invoice.total_hours),
        format!("<p><strong>Amount:</strong> ${:.2}</p>", invoice.total_amount),
        "</div>".to_owned(),
        format!(
            "<p>Best regards,<br>{}<br>{}</p>",
            escape_html(&settings.sender_name),
            escape_html(&settings.sender)
        ),
        "</body>".to_owned(),
        "</html>".to_owned(),
    ];
    lines.join("\r\n")
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

/// RFC 2047 encoded-word for non-ASCII header text.
fn encode_header_text(text: &str) -> String {
    if text.is_ascii() {
        text.to_owned()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(text.as_bytes()))
    }
}
