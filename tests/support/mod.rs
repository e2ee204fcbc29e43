//! Shared fixtures and test doubles for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use invoice_mailer::config::BillingConfig;
use invoice_mailer::invoice::store::{normalize_flags, StoreError};
use invoice_mailer::invoice::{DailyEntry, Invoice, InvoiceStore, NewInvoice, Weekday};
use invoice_mailer::mail::composer::{ComposedMessage, MailSettings};
use invoice_mailer::mail::transport::{MailTransport, TransportError};
use invoice_mailer::render::{RenderError, Renderer};

/// Sender used across tests.
pub const SENDER: &str = "contractor@example.com";

/// Friday 2024-01-19 closes ISO week 2024-W03.
pub fn week_three_friday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 19).expect("valid date")
}

/// Billing defaults yielding `amount` for a 40-hour week.
pub fn billing_for(amount: f64) -> BillingConfig {
    BillingConfig {
        payee: "Pat Contractor".to_owned(),
        payee_address: "1 Main St".to_owned(),
        payor: "Acme Corp".to_owned(),
        payor_address: "2 Market St".to_owned(),
        payor_phone: "555-0100".to_owned(),
        hourly_rate: amount / 40.0,
        daily_hours: 8.0,
        ..BillingConfig::default()
    }
}

/// A new invoice for week three totalling `amount`.
pub fn new_invoice(number: &str, amount: f64) -> NewInvoice {
    NewInvoice::for_week(number, week_three_friday(), &billing_for(amount))
        .expect("week three is a valid billing week")
}

/// A stored-looking invoice with explicit totals and flags.
pub fn invoice(number: &str, hours: f64, amount: f64, submitted: bool, paid: bool) -> Invoice {
    let daily_hours = hours / 5.0;
    let daily_amount = amount / 5.0;
    let entries = Weekday::ALL
        .iter()
        .map(|&weekday| DailyEntry {
            weekday,
            date: format!("{} 01/15/2024", weekday.short_label()),
            clock_in: "10:00".to_owned(),
            clock_out: "18:00".to_owned(),
            hours: daily_hours,
            rate: if daily_hours > 0.0 {
                daily_amount / daily_hours
            } else {
                0.0
            },
            subtotal: daily_amount,
        })
        .collect();
    Invoice {
        id: 1,
        number: number.to_owned(),
        created_on: "01/21/2024".to_owned(),
        due_on: "02/05/2024".to_owned(),
        payment_terms: 15,
        payee: "Pat Contractor".to_owned(),
        payee_address: "1 Main St".to_owned(),
        payor: "Acme Corp".to_owned(),
        payor_address: "2 Market St".to_owned(),
        payor_phone: "555-0100".to_owned(),
        entries,
        total_hours: hours,
        total_amount: amount,
        submitted,
        paid,
        recorded_at: "2024-01-21 09:00:00".to_owned(),
    }
}

/// Mail settings with two displayed recipients.
pub fn settings() -> MailSettings {
    MailSettings {
        sender: SENDER.to_owned(),
        recipients: vec![
            "billing@client.example".to_owned(),
            "approver@client.example".to_owned(),
        ],
        sender_name: "Pat Contractor".to_owned(),
        greeting: "Dear Billing Team,".to_owned(),
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-memory [`InvoiceStore`] with a switch to fail status updates.
#[derive(Default)]
pub struct MemoryStore {
    invoices: Mutex<Vec<Invoice>>,
    fail_updates: AtomicBool,
    update_calls: AtomicUsize,
}

impl MemoryStore {
    /// Store seeded with invoices.
    pub fn with(invoices: Vec<Invoice>) -> Self {
        Self {
            invoices: Mutex::new(invoices),
            ..Self::default()
        }
    }

    /// Make every later `update_status` fail.
    pub fn fail_updates(&self) {
        self.fail_updates.store(true, Ordering::SeqCst);
    }

    /// Number of `update_status` calls so far.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Current copy of an invoice.
    pub fn get(&self, number: &str) -> Option<Invoice> {
        self.invoices
            .lock()
            .expect("store lock")
            .iter()
            .find(|i| i.number == number)
            .cloned()
    }

    /// Current copy of every invoice.
    pub fn snapshot(&self) -> Vec<Invoice> {
        self.invoices.lock().expect("store lock").clone()
    }
}

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn fetch_all(&self) -> Result<Vec<Invoice>, StoreError> {
        Ok(self.snapshot())
    }

    async fn fetch_by_number(&self, number: &str) -> Result<Invoice, StoreError> {
        self.get(number)
            .ok_or_else(|| StoreError::NotFound(number.to_owned()))
    }

    async fn update_status(
        &self,
        number: &str,
        submitted: Option<bool>,
        paid: Option<bool>,
    ) -> Result<u64, StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let (submitted, paid) = normalize_flags(number, submitted, paid)?;
        let mut invoices = self.invoices.lock().expect("store lock");
        let Some(invoice) = invoices.iter_mut().find(|i| i.number == number) else {
            return Ok(0);
        };
        if let Some(s) = submitted {
            invoice.submitted = s;
        }
        if let Some(p) = paid {
            invoice.paid = p;
        }
        Ok(1)
    }

    async fn insert(&self, new: &NewInvoice) -> Result<i64, StoreError> {
        let mut invoices = self.invoices.lock().expect("store lock");
        if invoices.iter().any(|i| i.number == new.number) {
            return Err(StoreError::Duplicate(new.number.clone()));
        }
        let id = i64::try_from(invoices.len())
            .expect("small store")
            .saturating_add(1);
        let mut stored = invoice(&new.number, new.total_hours, new.total_amount, false, false);
        stored.id = id;
        invoices.push(stored);
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Renderer double
// ---------------------------------------------------------------------------

/// Renderer that writes fixed bytes into a directory, or fails.
pub struct FakeRenderer {
    dir: PathBuf,
    document: Vec<u8>,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeRenderer {
    /// Renderer writing `document` into `dir`.
    pub fn writing(dir: &Path, document: &[u8]) -> Self {
        Self {
            dir: dir.to_path_buf(),
            document: document.to_vec(),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Renderer that always exits unsuccessfully.
    pub fn failing(dir: &Path) -> Self {
        Self {
            fail: true,
            ..Self::writing(dir, b"")
        }
    }

    /// Number of render invocations.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    fn document_path(&self, number: &str) -> PathBuf {
        self.dir.join(invoice_mailer::invoice::document_name(number))
    }

    async fn render(&self, number: &str) -> Result<PathBuf, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RenderError::Exited {
                code: Some(1),
                output: "renderer crashed".to_owned(),
            });
        }
        let path = self.document_path(number);
        std::fs::write(&path, &self.document).map_err(|e| RenderError::Spawn {
            program: "fake".to_owned(),
            reason: e.to_string(),
        })?;
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Transport double
// ---------------------------------------------------------------------------

/// How the recording transport responds.
#[derive(Debug, Clone)]
pub enum TransportScript {
    /// Accept every message.
    Accept,
    /// Reject the named recipient.
    RejectRecipient(String),
    /// Time out during the data phase.
    TimeOut,
}

/// Transport that records messages instead of sending them.
pub struct RecordingTransport {
    script: TransportScript,
    sent: Mutex<Vec<ComposedMessage>>,
    attempts: AtomicUsize,
}

impl RecordingTransport {
    /// Transport responding per `script`.
    pub fn new(script: TransportScript) -> Self {
        Self {
            script,
            sent: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Messages accepted so far.
    pub fn sent(&self) -> Vec<ComposedMessage> {
        self.sent.lock().expect("sent lock").clone()
    }

    /// Send attempts so far, accepted or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, message: &ComposedMessage) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            TransportScript::Accept => {
                self.sent.lock().expect("sent lock").push(message.clone());
                Ok(())
            }
            TransportScript::RejectRecipient(recipient) => Err(TransportError::RecipientRejected {
                recipient: recipient.clone(),
                reply: "550 5.1.1 mailbox unavailable".to_owned(),
            }),
            TransportScript::TimeOut => Err(TransportError::TimedOut {
                phase: invoice_mailer::mail::SmtpPhase::DataWrite,
                after: Duration::from_secs(1),
            }),
        }
    }
}
