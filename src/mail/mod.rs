//! Outbound invoice mail: content encoding, message composition, SMTP transport.

pub mod composer;
pub mod encoding;
pub mod transport;

pub use composer::{compose, ComposeError, ComposedMessage, Envelope, MailSettings};
pub use encoding::{decode_wrapped, encode_wrapped};
pub use transport::{MailTransport, SmtpPhase, SmtpTransport, TransportError};
