//! Invoice mailer: weekly contractor invoices, rendered and sent by mail.
//!
//! The outbound pipeline renders an invoice document with an external
//! program, composes a multipart message around it, sends it over an
//! authenticated TLS mail session, and records the invoice as submitted.
//! Payment is recorded separately. See `DESIGN.md` for the module map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod logging;

pub mod invoice;
pub mod mail;
pub mod render;

pub mod delivery;
