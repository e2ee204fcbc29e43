//! Invoice data model: weekly records, the status lifecycle, and summaries.
//!
//! The persistent store owns the canonical copy of every [`Invoice`]. Callers
//! hold transient copies and request status changes through
//! [`store::InvoiceStore`], then reload.

pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::config::BillingConfig;

pub use store::{InvoiceStore, SqliteInvoiceStore};

/// Date format used for creation and due dates (`MM/DD/YYYY`).
const DATE_FORMAT: &str = "%m/%d/%Y";

// ---------------------------------------------------------------------------
// Daily entries
// ---------------------------------------------------------------------------

/// Working day of a billing week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    /// Monday.
    Monday,
    /// Tuesday.
    Tuesday,
    /// Wednesday.
    Wednesday,
    /// Thursday.
    Thursday,
    /// Friday.
    Friday,
}

impl Weekday {
    /// All billable days in week order.
    pub const ALL: [Weekday; 5] = [
        Self::Monday,
        Self::Tuesday,
        Self::Wednesday,
        Self::Thursday,
        Self::Friday,
    ];

    /// Column prefix used in SQLite (`monday`, `tuesday`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monday => "monday",
            Self::Tuesday => "tuesday",
            Self::Wednesday => "wednesday",
            Self::Thursday => "thursday",
            Self::Friday => "friday",
        }
    }

    /// Three-letter label used in date strings (`Mon 10/06/2025`).
    pub fn short_label(&self) -> &'static str {
        match self {
            Self::Monday => "Mon",
            Self::Tuesday => "Tue",
            Self::Wednesday => "Wed",
            Self::Thursday => "Thu",
            Self::Friday => "Fri",
        }
    }

    /// Days between this weekday and the Friday closing the week.
    fn days_before_friday(&self) -> u64 {
        match self {
            Self::Monday => 4,
            Self::Tuesday => 3,
            Self::Wednesday => 2,
            Self::Thursday => 1,
            Self::Friday => 0,
        }
    }
}

/// One worked day on an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyEntry {
    /// Which day of the week this entry covers.
    pub weekday: Weekday,
    /// Date label, e.g. `Mon 10/06/2025`.
    pub date: String,
    /// Clock-in time (`HH:MM`).
    pub clock_in: String,
    /// Clock-out time (`HH:MM`).
    pub clock_out: String,
    /// Hours worked.
    pub hours: f64,
    /// Hourly rate.
    pub rate: f64,
    /// Line subtotal (`hours * rate`).
    pub subtotal: f64,
}

// ---------------------------------------------------------------------------
// Invoice
// ---------------------------------------------------------------------------

/// A persisted weekly invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    /// Surrogate row id.
    pub id: i64,
    /// Natural key, e.g. `N001` or `2024-W03`.
    pub number: String,
    /// Creation date (`MM/DD/YYYY`).
    pub created_on: String,
    /// Due date (`MM/DD/YYYY`).
    pub due_on: String,
    /// Payment terms in days.
    pub payment_terms: i64,
    /// Name of the party being paid.
    pub payee: String,
    /// Payee postal address.
    pub payee_address: String,
    /// Name of the paying party.
    pub payor: String,
    /// Payor postal address.
    pub payor_address: String,
    /// Payor phone number.
    pub payor_phone: String,
    /// Five daily entries, Monday through Friday.
    pub entries: Vec<DailyEntry>,
    /// Sum of hours across all entries.
    pub total_hours: f64,
    /// Sum of line subtotals.
    pub total_amount: f64,
    /// Whether the invoice has been sent.
    pub submitted: bool,
    /// Whether the invoice has been paid. Implies `submitted`.
    pub paid: bool,
    /// Row insertion timestamp as recorded by SQLite.
    pub recorded_at: String,
}

impl Invoice {
    /// Current lifecycle status derived from the two flags.
    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_flags(self.submitted, self.paid)
    }

    /// File name of the rendered document for this invoice.
    pub fn document_name(&self) -> String {
        document_name(&self.number)
    }

    /// Date label of the last working day of the week.
    pub fn week_ending(&self) -> Option<&str> {
        self.entries.last().map(|e| e.date.as_str())
    }
}

/// File name of the rendered document for an invoice number.
pub fn document_name(number: &str) -> String {
    format!("invoice_{number}.pdf")
}

// ---------------------------------------------------------------------------
// Status lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state: Pending → Submitted → Paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    /// Not yet sent.
    Pending,
    /// Sent, awaiting payment.
    Submitted,
    /// Paid.
    Paid,
}

impl InvoiceStatus {
    /// Derive the status from the persisted flags.
    ///
    /// `paid` wins over `submitted`, matching the invariant that a paid
    /// invoice is always also submitted.
    pub fn from_flags(submitted: bool, paid: bool) -> Self {
        if paid {
            Self::Paid
        } else if submitted {
            Self::Submitted
        } else {
            Self::Pending
        }
    }

    /// Returns the lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Paid => "paid",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// Set `submitted`, leave `paid` unchanged.
    Submit,
    /// Set both `submitted` and `paid`.
    Pay,
}

impl StatusChange {
    /// Flag values to persist as `(submitted, paid)`; `None` leaves a flag as is.
    pub fn flags(&self) -> (Option<bool>, Option<bool>) {
        match self {
            Self::Submit => (Some(true), None),
            Self::Pay => (Some(true), Some(true)),
        }
    }
}

/// Listing filter over invoice status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusFilter {
    /// Every invoice.
    #[default]
    All,
    /// Not submitted.
    Pending,
    /// Submitted but not paid.
    Submitted,
    /// Paid.
    Paid,
    /// Not paid (pending or submitted).
    Unpaid,
}

impl StatusFilter {
    /// Whether an invoice passes this filter.
    pub fn matches(&self, invoice: &Invoice) -> bool {
        match self {
            Self::All => true,
            Self::Pending => !invoice.submitted,
            Self::Submitted => invoice.submitted && !invoice.paid,
            Self::Paid => invoice.paid,
            Self::Unpaid => !invoice.paid,
        }
    }
}

impl FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "pending" => Ok(Self::Pending),
            "submitted" => Ok(Self::Submitted),
            "paid" => Ok(Self::Paid),
            "unpaid" => Ok(Self::Unpaid),
            other => Err(format!(
                "unknown status filter '{other}' (expected all, pending, submitted, paid, unpaid)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Counts and totals partitioned by status. Recomputed on demand, never stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSummary {
    /// Number of invoices.
    pub total_count: i64,
    /// Invoices not yet submitted.
    pub pending_count: i64,
    /// Invoices submitted but not paid.
    pub submitted_count: i64,
    /// Invoices paid.
    pub paid_count: i64,
    /// Invoices not paid (pending + submitted).
    pub unpaid_count: i64,
    /// Sum of all invoice totals.
    pub total_amount: f64,
    /// Sum over pending invoices.
    pub pending_amount: f64,
    /// Sum over submitted-but-unpaid invoices.
    pub submitted_amount: f64,
    /// Sum over paid invoices.
    pub paid_amount: f64,
    /// Sum over unpaid invoices.
    pub unpaid_amount: f64,
}

impl InvoiceSummary {
    /// Aggregate an in-memory invoice set.
    pub fn from_invoices(invoices: &[Invoice]) -> Self {
        let mut summary = Self::default();
        for invoice in invoices {
            let amount = invoice.total_amount;
            summary.total_count = summary.total_count.saturating_add(1);
            summary.total_amount += amount;
            match invoice.status() {
                InvoiceStatus::Pending => {
                    summary.pending_count = summary.pending_count.saturating_add(1);
                    summary.pending_amount += amount;
                }
                InvoiceStatus::Submitted => {
                    summary.submitted_count = summary.submitted_count.saturating_add(1);
                    summary.submitted_amount += amount;
                }
                InvoiceStatus::Paid => {
                    summary.paid_count = summary.paid_count.saturating_add(1);
                    summary.paid_amount += amount;
                }
            }
            if !invoice.paid {
                summary.unpaid_count = summary.unpaid_count.saturating_add(1);
                summary.unpaid_amount += amount;
            }
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// New invoices
// ---------------------------------------------------------------------------

/// An invoice not yet persisted. Both status flags start false.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInvoice {
    /// Natural key.
    pub number: String,
    /// Creation date (`MM/DD/YYYY`).
    pub created_on: String,
    /// Due date (`MM/DD/YYYY`).
    pub due_on: String,
    /// Payment terms in days.
    pub payment_terms: i64,
    /// Payee name.
    pub payee: String,
    /// Payee address.
    pub payee_address: String,
    /// Payor name.
    pub payor: String,
    /// Payor address.
    pub payor_address: String,
    /// Payor phone.
    pub payor_phone: String,
    /// Five daily entries, Monday through Friday.
    pub entries: Vec<DailyEntry>,
    /// Sum of hours.
    pub total_hours: f64,
    /// Sum of subtotals.
    pub total_amount: f64,
}

impl NewInvoice {
    /// Build a Monday–Friday invoice for the week ending on `friday`.
    ///
    /// The creation date is the Sunday after `friday`; the due date is the
    /// creation date plus the configured payment terms.
    ///
    /// # Errors
    ///
    /// Returns [`store::StoreError::InvalidInvoice`] when `friday` is not a
    /// Friday, the number is blank, or date arithmetic leaves the calendar range.
    pub fn for_week(
        number: &str,
        friday: NaiveDate,
        billing: &BillingConfig,
    ) -> Result<Self, store::StoreError> {
        let number = number.trim();
        if number.is_empty() {
            return Err(store::StoreError::InvalidInvoice(
                "invoice number must not be empty".to_owned(),
            ));
        }
        if friday.weekday() != chrono::Weekday::Fri {
            return Err(store::StoreError::InvalidInvoice(format!(
                "{friday} is a {}, not a Friday",
                friday.weekday()
            )));
        }

        let out_of_range =
            || store::StoreError::InvalidInvoice(format!("date out of range near {friday}"));
        let created = friday.checked_add_days(Days::new(2)).ok_or_else(out_of_range)?;
        let terms = u64::try_from(billing.payment_terms).map_err(|_| {
            store::StoreError::InvalidInvoice(format!(
                "payment terms must be non-negative, got {}",
                billing.payment_terms
            ))
        })?;
        let due = created.checked_add_days(Days::new(terms)).ok_or_else(out_of_range)?;

        let subtotal = billing.daily_hours * billing.hourly_rate;
        let mut entries = Vec::with_capacity(Weekday::ALL.len());
        for weekday in Weekday::ALL {
            let day = friday
                .checked_sub_days(Days::new(weekday.days_before_friday()))
                .ok_or_else(out_of_range)?;
            entries.push(DailyEntry {
                weekday,
                date: format!("{} {}", weekday.short_label(), day.format(DATE_FORMAT)),
                clock_in: billing.clock_in.clone(),
                clock_out: billing.clock_out.clone(),
                hours: billing.daily_hours,
                rate: billing.hourly_rate,
                subtotal,
            });
        }

        let total_hours = entries.iter().map(|e| e.hours).sum();
        let total_amount = entries.iter().map(|e| e.subtotal).sum();

        Ok(Self {
            number: number.to_owned(),
            created_on: created.format(DATE_FORMAT).to_string(),
            due_on: due.format(DATE_FORMAT).to_string(),
            payment_terms: billing.payment_terms,
            payee: billing.payee.clone(),
            payee_address: billing.payee_address.clone(),
            payor: billing.payor.clone(),
            payor_address: billing.payor_address.clone(),
            payor_phone: billing.payor_phone.clone(),
            entries,
            total_hours,
            total_amount,
        })
    }
}

/// Friday of the week before the one containing `today`.
pub fn previous_week_friday(today: NaiveDate) -> Option<NaiveDate> {
    let back = u64::from(today.weekday().num_days_from_monday()).checked_add(3)?;
    today.checked_sub_days(Days::new(back))
}

/// Default invoice number for the week ending `friday`: `N` plus the Monday as `YYYYMMDD`.
pub fn default_number(friday: NaiveDate) -> Option<String> {
    let monday = friday.checked_sub_days(Days::new(4))?;
    Some(format!("N{}", monday.format("%Y%m%d")))
}
