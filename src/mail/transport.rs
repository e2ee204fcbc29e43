//! SMTP transport over an implicit-TLS session.
//!
//! The session is driven step by step: greeting, `EHLO`, `AUTH PLAIN`,
//! `MAIL FROM`, one `RCPT TO` per recipient, `DATA`, end-of-data, `QUIT`.
//! Each step fails fast with its own [`TransportError`] variant. Any single
//! rejected recipient aborts the whole transaction. All steps share one
//! deadline, and the stream is shut down on every exit path.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};

use super::composer::ComposedMessage;
use crate::config::MailConfig;
use crate::credentials::MailCredentials;

/// Protocol phase of an SMTP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpPhase {
    /// TCP connect and TLS handshake.
    Connection,
    /// Server greeting and `EHLO`.
    Negotiation,
    /// `AUTH PLAIN`.
    Authentication,
    /// `MAIL FROM`.
    Sender,
    /// `RCPT TO`.
    Recipient,
    /// `DATA` and message body.
    DataWrite,
    /// End-of-data marker and final acceptance.
    DataClose,
}

impl SmtpPhase {
    /// Returns the phase label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Negotiation => "negotiation",
            Self::Authentication => "authentication",
            Self::Sender => "sender",
            Self::Recipient => "recipient",
            Self::DataWrite => "data_write",
            Self::DataClose => "data_close",
        }
    }
}

impl fmt::Display for SmtpPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the mail transport, one variant per protocol phase.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// TCP connect or TLS handshake failed.
    #[error("connection to {host}:{port} failed: {reason}")]
    Connection {
        /// Mail host.
        host: String,
        /// Mail port.
        port: u16,
        /// Underlying failure.
        reason: String,
    },

    /// Greeting or `EHLO` was not accepted.
    #[error("session negotiation failed: {0}")]
    Negotiation(String),

    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// `MAIL FROM` was rejected.
    #[error("sender {sender} rejected: {reply}")]
    SenderRejected {
        /// Envelope sender.
        sender: String,
        /// Server reply or I/O failure.
        reply: String,
    },

    /// A `RCPT TO` was rejected; no recipient receives the message.
    #[error("recipient {recipient} rejected: {reply}")]
    RecipientRejected {
        /// The rejected recipient.
        recipient: String,
        /// Server reply or I/O failure.
        reply: String,
    },

    /// Opening the data channel or writing the message failed.
    #[error("writing message data failed: {0}")]
    DataWrite(String),

    /// The server did not accept the message at end-of-data.
    #[error("closing message data failed: {0}")]
    DataClose(String),

    /// The session deadline passed during a phase.
    #[error("mail session timed out after {after:?} during {phase}")]
    TimedOut {
        /// Phase in progress when the deadline passed.
        phase: SmtpPhase,
        /// Configured session deadline.
        after: Duration,
    },
}

impl TransportError {
    /// Phase that failed.
    pub fn phase(&self) -> SmtpPhase {
        match self {
            Self::Connection { .. } => SmtpPhase::Connection,
            Self::Negotiation(_) => SmtpPhase::Negotiation,
            Self::Authentication(_) => SmtpPhase::Authentication,
            Self::SenderRejected { .. } => SmtpPhase::Sender,
            Self::RecipientRejected { .. } => SmtpPhase::Recipient,
            Self::DataWrite(_) => SmtpPhase::DataWrite,
            Self::DataClose(_) => SmtpPhase::DataClose,
            Self::TimedOut { phase, .. } => *phase,
        }
    }
}

/// Delivers a composed message to its envelope recipients.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Deliver `message` to every envelope recipient, or to none.
    async fn send(&self, message: &ComposedMessage) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// A complete (possibly multi-line) SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit reply code.
    pub code: u16,
    /// Text of every line, without codes, joined by newlines.
    pub text: String,
}

impl Reply {
    /// 2xx.
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx.
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text.replace('\n', " / "))
    }
}

/// Apply SMTP transparency: normalize to CRLF and double leading dots.
///
/// The result always ends with CRLF and excludes the `.` terminator.
pub fn dot_stuff(content: &str) -> String {
    let mut out = String::with_capacity(content.len().saturating_add(64));
    for line in content.lines() {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

// ---------------------------------------------------------------------------
// Session driver
// ---------------------------------------------------------------------------

/// Per-session parameters.
#[derive(Debug, Clone, Copy)]
pub struct SessionParams<'a> {
    /// Name announced in `EHLO`.
    pub client_name: &'a str,
    /// Login identity.
    pub credentials: &'a MailCredentials,
}

/// Upper bound on stream shutdown once the session is over.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

struct SmtpSession<S> {
    stream: BufReader<S>,
    deadline: Instant,
    timeout: Duration,
}

impl<S> SmtpSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_reply(&mut self) -> std::io::Result<Reply> {
        let mut code: Option<u16> = None;
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let read = self.stream.read_line(&mut line).await?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                ));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            let parsed = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("malformed reply line: {line:?}"),
                    )
                })?;
            if code.is_some_and(|c| c != parsed) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "reply code changed within a multi-line reply",
                ));
            }
            code = Some(parsed);
            lines.push(line.get(4..).unwrap_or_default().to_owned());
            if line.as_bytes().get(3) != Some(&b'-') {
                break;
            }
        }
        Ok(Reply {
            code: code.unwrap_or_default(),
            text: lines.join("\n"),
        })
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await
    }

    async fn command(&mut self, line: &str) -> std::io::Result<Reply> {
        self.write_line(line).await?;
        self.read_reply().await
    }

    async fn transact(
        &mut self,
        params: SessionParams<'_>,
        message: &ComposedMessage,
    ) -> Result<(), TransportError> {
        let deadline = self.deadline;
        let after = self.timeout;
        let timed_out = |phase| TransportError::TimedOut { phase, after };

        // 1. Greeting and EHLO.
        let greeting = tokio::time::timeout_at(deadline, self.read_reply())
            .await
            .map_err(|_| timed_out(SmtpPhase::Negotiation))?
            .map_err(|e| TransportError::Negotiation(format!("reading greeting: {e}")))?;
        if greeting.code != 220 {
            return Err(TransportError::Negotiation(format!("greeting: {greeting}")));
        }
        let ehlo = tokio::time::timeout_at(
            deadline,
            self.command(&format!("EHLO {}", params.client_name)),
        )
        .await
        .map_err(|_| timed_out(SmtpPhase::Negotiation))?
        .map_err(|e| TransportError::Negotiation(format!("EHLO: {e}")))?;
        if !ehlo.is_positive() {
            return Err(TransportError::Negotiation(format!("EHLO: {ehlo}")));
        }
        debug!(phase = %SmtpPhase::Negotiation, "session negotiated");

        // 2. AUTH PLAIN with initial response; the channel is already encrypted.
        let token = STANDARD.encode(format!(
            "\0{}\0{}",
            params.credentials.address, params.credentials.secret
        ));
        let auth_line = format!("AUTH PLAIN {token}");
        let auth = tokio::time::timeout_at(deadline, self.command(&auth_line))
            .await
            .map_err(|_| timed_out(SmtpPhase::Authentication))?
            .map_err(|e| TransportError::Authentication(e.to_string()))?;
        if auth.code != 235 {
            return Err(TransportError::Authentication(auth.to_string()));
        }
        debug!(phase = %SmtpPhase::Authentication, "authenticated");

        // 3. Envelope sender.
        let sender = &message.envelope.sender;
        let mail_line = format!("MAIL FROM:<{sender}>");
        let reply = tokio::time::timeout_at(deadline, self.command(&mail_line))
            .await
            .map_err(|_| timed_out(SmtpPhase::Sender))?
            .map_err(|e| TransportError::SenderRejected {
                sender: sender.clone(),
                reply: e.to_string(),
            })?;
        if !reply.is_positive() {
            return Err(TransportError::SenderRejected {
                sender: sender.clone(),
                reply: reply.to_string(),
            });
        }

        // 4. Envelope recipients; any rejection aborts.
        for recipient in &message.envelope.recipients {
            let reply =
                tokio::time::timeout_at(deadline, self.command(&format!("RCPT TO:<{recipient}>")))
                    .await
                    .map_err(|_| timed_out(SmtpPhase::Recipient))?
                    .map_err(|e| TransportError::RecipientRejected {
                        recipient: recipient.clone(),
                        reply: e.to_string(),
                    })?;
            if !reply.is_positive() {
                return Err(TransportError::RecipientRejected {
                    recipient: recipient.clone(),
                    reply: reply.to_string(),
                });
            }
        }
        debug!(
            recipients = message.envelope.recipients.len(),
            "envelope accepted"
        );

        // 5. Data channel.
        let data = tokio::time::timeout_at(deadline, self.command("DATA"))
            .await
            .map_err(|_| timed_out(SmtpPhase::DataWrite))?
            .map_err(|e| TransportError::DataWrite(format!("DATA: {e}")))?;
        if !data.is_intermediate() {
            return Err(TransportError::DataWrite(format!("DATA: {data}")));
        }

        let body = dot_stuff(&message.content);
        tokio::time::timeout_at(deadline, self.stream.write_all(body.as_bytes()))
            .await
            .map_err(|_| timed_out(SmtpPhase::DataWrite))?
            .map_err(|e| TransportError::DataWrite(e.to_string()))?;

        let accepted = tokio::time::timeout_at(deadline, self.command("."))
            .await
            .map_err(|_| timed_out(SmtpPhase::DataClose))?
            .map_err(|e| TransportError::DataClose(e.to_string()))?;
        if !accepted.is_positive() {
            return Err(TransportError::DataClose(accepted.to_string()));
        }
        debug!(reply = %accepted, "message accepted");
        Ok(())
    }

    /// Best-effort `QUIT` and stream shutdown; failures are logged, not returned.
    async fn close(mut self) {
        let quit = tokio::time::timeout_at(self.deadline, self.command("QUIT")).await;
        match quit {
            Ok(Ok(reply)) if reply.code == 221 => {}
            Ok(Ok(reply)) => debug!(reply = %reply, "unexpected QUIT reply"),
            Ok(Err(e)) => debug!(error = %e, "QUIT failed"),
            Err(_) => debug!("QUIT timed out"),
        }
        // TLS shutdown flushes close_notify and stalls if the peer stops reading.
        match tokio::time::timeout(CLOSE_GRACE, self.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "stream shutdown failed"),
            Err(_) => debug!(grace = ?CLOSE_GRACE, "stream shutdown timed out, dropping"),
        }
    }
}

/// Drive one SMTP transaction over an established stream.
///
/// The stream is closed before this returns, whatever the outcome.
///
/// # Errors
///
/// Returns the [`TransportError`] of the first phase that fails.
pub async fn run_session<S>(
    stream: S,
    params: SessionParams<'_>,
    message: &ComposedMessage,
    timeout: Duration,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let deadline = deadline_after(timeout);
    drive(stream, params, message, deadline, timeout).await
}

async fn drive<S>(
    stream: S,
    params: SessionParams<'_>,
    message: &ComposedMessage,
    deadline: Instant,
    timeout: Duration,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = SmtpSession {
        stream: BufReader::new(stream),
        deadline,
        timeout,
    };
    let result = session.transact(params, message).await;
    if let Err(ref e) = result {
        warn!(phase = %e.phase(), error = %e, "mail session failed");
    }
    session.close().await;
    result
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now)
}

// ---------------------------------------------------------------------------
// TLS transport
// ---------------------------------------------------------------------------

/// Implicit-TLS SMTP transport verifying the server against the configured host.
pub struct SmtpTransport {
    host: String,
    port: u16,
    client_name: String,
    credentials: MailCredentials,
    timeout: Duration,
    connector: TlsConnector,
}

impl fmt::Debug for SmtpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credentials", &self.credentials)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SmtpTransport {
    /// Build a transport trusting the bundled web PKI roots.
    pub fn new(config: &MailConfig, credentials: MailCredentials) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            host: config.host.clone(),
            port: config.port,
            client_name: config.client_name.clone(),
            credentials,
            timeout: Duration::from_secs(config.timeout_secs),
            connector: TlsConnector::from(Arc::new(tls)),
        }
    }

    /// Sender address used for login.
    pub fn sender(&self) -> &str {
        &self.credentials.address
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    #[instrument(skip_all, fields(host = %self.host, port = self.port))]
    async fn send(&self, message: &ComposedMessage) -> Result<(), TransportError> {
        let deadline = deadline_after(self.timeout);
        let after = self.timeout;
        let connection_error = |reason: String| TransportError::Connection {
            host: self.host.clone(),
            port: self.port,
            reason,
        };
        let timed_out = || TransportError::TimedOut {
            phase: SmtpPhase::Connection,
            after,
        };

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let tcp = tokio::time::timeout_at(deadline, connect)
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| connection_error(e.to_string()))?;

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| connection_error(format!("invalid server name: {e}")))?;
        let tls = tokio::time::timeout_at(deadline, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| connection_error(format!("TLS handshake: {e}")))?;
        debug!(phase = %SmtpPhase::Connection, "TLS session established");

        let params = SessionParams {
            client_name: &self.client_name,
            credentials: &self.credentials,
        };
        drive(tls, params, message, deadline, after).await
    }
}
