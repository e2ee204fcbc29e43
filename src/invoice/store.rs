//! Invoice persistence: the [`InvoiceStore`] seam and its SQLite backing.
//!
//! The store is opened once per process and shared behind an `Arc`. It is
//! safe for concurrent use; no transaction spans a delivery attempt.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::{DailyEntry, Invoice, InvoiceSummary, NewInvoice, StatusChange, StatusFilter, Weekday};

/// Errors from invoice persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No invoice with this number exists.
    #[error("invoice not found: {0}")]
    NotFound(String),

    /// An invoice with this number already exists.
    #[error("invoice already exists: {0}")]
    Duplicate(String),

    /// The requested flag combination would break `paid => submitted`.
    #[error("invalid status update for {number}: {reason}")]
    InvalidStatus {
        /// Invoice number targeted by the update.
        number: String,
        /// Why the update was refused.
        reason: String,
    },

    /// The invoice data itself is malformed.
    #[error("invalid invoice: {0}")]
    InvalidInvoice(String),
}

/// Persistent invoice store.
///
/// Only the four core operations plus `insert` are required; the filtered
/// listing, latest-pending lookup, and summary have in-memory defaults that
/// backends may override with native queries.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// All invoices in insertion order.
    async fn fetch_all(&self) -> Result<Vec<Invoice>, StoreError>;

    /// A single invoice by number.
    ///
    /// Returns [`StoreError::NotFound`] when no row matches.
    async fn fetch_by_number(&self, number: &str) -> Result<Invoice, StoreError>;

    /// Update status flags; `None` leaves a flag unchanged.
    ///
    /// Returns the number of rows affected. Zero means the number does not exist.
    async fn update_status(
        &self,
        number: &str,
        submitted: Option<bool>,
        paid: Option<bool>,
    ) -> Result<u64, StoreError>;

    /// Persist a new invoice with both flags false, returning its row id.
    async fn insert(&self, invoice: &NewInvoice) -> Result<i64, StoreError>;

    /// Invoices passing a status filter, in insertion order.
    async fn fetch_by_status(&self, filter: StatusFilter) -> Result<Vec<Invoice>, StoreError> {
        Ok(self
            .fetch_all()
            .await?
            .into_iter()
            .filter(|inv| filter.matches(inv))
            .collect())
    }

    /// The most recently inserted invoice that has not been submitted.
    async fn latest_pending(&self) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .fetch_all()
            .await?
            .into_iter()
            .rev()
            .find(|inv| !inv.submitted))
    }

    /// Counts and totals by status over the current invoice set.
    async fn summary(&self) -> Result<InvoiceSummary, StoreError> {
        Ok(InvoiceSummary::from_invoices(&self.fetch_all().await?))
    }

    /// Apply a status transition, mapping zero affected rows to `NotFound`.
    ///
    /// Re-applying a transition that already holds is a successful no-op.
    async fn apply_change(&self, number: &str, change: StatusChange) -> Result<(), StoreError> {
        let (submitted, paid) = change.flags();
        let affected = self.update_status(number, submitted, paid).await?;
        if affected == 0 {
            return Err(StoreError::NotFound(number.to_owned()));
        }
        Ok(())
    }
}

/// Resolve the flag pair actually written for an update request.
///
/// Setting `paid` always sets `submitted` in the same statement.
///
/// # Errors
///
/// Returns [`StoreError::InvalidStatus`] for `submitted = false, paid = true`.
pub fn normalize_flags(
    number: &str,
    submitted: Option<bool>,
    paid: Option<bool>,
) -> Result<(Option<bool>, Option<bool>), StoreError> {
    match (submitted, paid) {
        (Some(false), Some(true)) => Err(StoreError::InvalidStatus {
            number: number.to_owned(),
            reason: "a paid invoice must also be submitted".to_owned(),
        }),
        (None, Some(true)) => Ok((Some(true), Some(true))),
        other => Ok(other),
    }
}

// ---------------------------------------------------------------------------
// SQLite backing
// ---------------------------------------------------------------------------

const HEADER_COLUMNS: &str = "id, invoice_number, invoice_create_date, payment_terms, due_date, \
     payee, payee_address, payor, payor_address, payor_phone";

const TRAILER_COLUMNS: &str = "total_hours, line_total, submitted, paid, created_at";

/// SQLite-backed [`InvoiceStore`].
#[derive(Debug, Clone)]
pub struct SqliteInvoiceStore {
    pool: SqlitePool,
}

impl SqliteInvoiceStore {
    /// Open (or create) the invoice database at the given path and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the database cannot
    /// be opened, or the schema migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open invoice db at {}", path.display()))?;

        let migration_sql = include_str!("../../migrations/001_invoices.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply invoice schema migration")?;

        info!(path = %path.display(), "invoice store opened");
        Ok(Self { pool })
    }

    /// Close the underlying pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn select_sql(tail: &str) -> String {
        let day_columns: Vec<String> = Weekday::ALL
            .iter()
            .map(|d| {
                let p = d.as_str();
                format!(
                    "{p}_date, {p}_in, {p}_out, {p}_hours_worked, {p}_unit_price, {p}_line_total"
                )
            })
            .collect();
        format!(
            "SELECT {HEADER_COLUMNS}, {}, {TRAILER_COLUMNS} FROM invoices {tail}",
            day_columns.join(", ")
        )
    }
}

fn invoice_from_row(row: &SqliteRow) -> Result<Invoice, sqlx::Error> {
    let mut entries = Vec::with_capacity(Weekday::ALL.len());
    for weekday in Weekday::ALL {
        let p = weekday.as_str();
        entries.push(DailyEntry {
            weekday,
            date: row.try_get(format!("{p}_date").as_str())?,
            clock_in: row.try_get(format!("{p}_in").as_str())?,
            clock_out: row.try_get(format!("{p}_out").as_str())?,
            hours: row.try_get(format!("{p}_hours_worked").as_str())?,
            rate: row.try_get(format!("{p}_unit_price").as_str())?,
            subtotal: row.try_get(format!("{p}_line_total").as_str())?,
        });
    }

    Ok(Invoice {
        id: row.try_get("id")?,
        number: row.try_get("invoice_number")?,
        created_on: row.try_get("invoice_create_date")?,
        due_on: row.try_get("due_date")?,
        payment_terms: row.try_get("payment_terms")?,
        payee: row.try_get("payee")?,
        payee_address: row.try_get("payee_address")?,
        payor: row.try_get("payor")?,
        payor_address: row.try_get("payor_address")?,
        payor_phone: row.try_get("payor_phone")?,
        entries,
        total_hours: row.try_get("total_hours")?,
        total_amount: row.try_get("line_total")?,
        submitted: row.try_get("submitted")?,
        paid: row.try_get("paid")?,
        recorded_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl InvoiceStore for SqliteInvoiceStore {
    async fn fetch_all(&self) -> Result<Vec<Invoice>, StoreError> {
        let rows = sqlx::query(&Self::select_sql("ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(invoice_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn fetch_by_number(&self, number: &str) -> Result<Invoice, StoreError> {
        let row = sqlx::query(&Self::select_sql("WHERE invoice_number = ?1"))
            .bind(number)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(invoice_from_row(&row)?),
            None => Err(StoreError::NotFound(number.to_owned())),
        }
    }

    async fn fetch_by_status(&self, filter: StatusFilter) -> Result<Vec<Invoice>, StoreError> {
        let condition = match filter {
            StatusFilter::All => "",
            StatusFilter::Pending => "WHERE submitted = 0",
            StatusFilter::Submitted => "WHERE submitted = 1 AND paid = 0",
            StatusFilter::Paid => "WHERE paid = 1",
            StatusFilter::Unpaid => "WHERE paid = 0",
        };
        let rows = sqlx::query(&Self::select_sql(&format!("{condition} ORDER BY id ASC")))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(invoice_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn latest_pending(&self) -> Result<Option<Invoice>, StoreError> {
        let row = sqlx::query(&Self::select_sql(
            "WHERE submitted = 0 ORDER BY id DESC LIMIT 1",
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(invoice_from_row)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn update_status(
        &self,
        number: &str,
        submitted: Option<bool>,
        paid: Option<bool>,
    ) -> Result<u64, StoreError> {
        let (submitted, paid) = normalize_flags(number, submitted, paid)?;

        let result = sqlx::query(
            "UPDATE invoices SET \
                submitted = COALESCE(?2, submitted), \
                paid = COALESCE(?3, paid) \
             WHERE invoice_number = ?1",
        )
        .bind(number)
        .bind(submitted)
        .bind(paid)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_check_violation() => StoreError::InvalidStatus {
                number: number.to_owned(),
                reason: "a paid invoice must also be submitted".to_owned(),
            },
            other => StoreError::Database(other),
        })?;

        let affected = result.rows_affected();
        debug!(invoice = number, ?submitted, ?paid, affected, "status updated");
        Ok(affected)
    }

    async fn insert(&self, invoice: &NewInvoice) -> Result<i64, StoreError> {
        if invoice.entries.len() != Weekday::ALL.len() {
            return Err(StoreError::InvalidInvoice(format!(
                "expected {} daily entries, got {}",
                Weekday::ALL.len(),
                invoice.entries.len()
            )));
        }

        let mut columns = vec![
            "invoice_number",
            "invoice_create_date",
            "payment_terms",
            "due_date",
            "payee",
            "payee_address",
            "payor",
            "payor_address",
            "payor_phone",
            "total_hours",
            "line_total",
        ]
        .into_iter()
        .map(str::to_owned)
        .collect::<Vec<_>>();
        for entry in &invoice.entries {
            let p = entry.weekday.as_str();
            for suffix in ["date", "in", "out", "hours_worked", "unit_price", "line_total"] {
                columns.push(format!("{p}_{suffix}"));
            }
        }
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO invoices ({}) VALUES ({placeholders})",
            columns.join(", ")
        );

        let mut query = sqlx::query(&sql)
            .bind(&invoice.number)
            .bind(&invoice.created_on)
            .bind(invoice.payment_terms)
            .bind(&invoice.due_on)
            .bind(&invoice.payee)
            .bind(&invoice.payee_address)
            .bind(&invoice.payor)
            .bind(&invoice.payor_address)
            .bind(&invoice.payor_phone)
            .bind(invoice.total_hours)
            .bind(invoice.total_amount);
        for entry in &invoice.entries {
            query = query
                .bind(&entry.date)
                .bind(&entry.clock_in)
                .bind(&entry.clock_out)
                .bind(entry.hours)
                .bind(entry.rate)
                .bind(entry.subtotal);
        }

        let result = query.execute(&self.pool).await.map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::Duplicate(invoice.number.clone())
            }
            other => StoreError::Database(other),
        })?;

        info!(invoice = %invoice.number, total = invoice.total_amount, "invoice created");
        Ok(result.last_insert_rowid())
    }

    async fn summary(&self) -> Result<InvoiceSummary, StoreError> {
        let row = sqlx::query(
            "SELECT \
                COUNT(*) AS total_count, \
                COALESCE(SUM(CASE WHEN submitted = 0 THEN 1 ELSE 0 END), 0) AS pending_count, \
                COALESCE(SUM(CASE WHEN submitted = 1 AND paid = 0 THEN 1 ELSE 0 END), 0) AS submitted_count, \
                COALESCE(SUM(CASE WHEN paid = 1 THEN 1 ELSE 0 END), 0) AS paid_count, \
                COALESCE(SUM(CASE WHEN paid = 0 THEN 1 ELSE 0 END), 0) AS unpaid_count, \
                COALESCE(SUM(line_total), 0.0) AS total_amount, \
                COALESCE(SUM(CASE WHEN submitted = 0 THEN line_total ELSE 0.0 END), 0.0) AS pending_amount, \
                COALESCE(SUM(CASE WHEN submitted = 1 AND paid = 0 THEN line_total ELSE 0.0 END), 0.0) AS submitted_amount, \
                COALESCE(SUM(CASE WHEN paid = 1 THEN line_total ELSE 0.0 END), 0.0) AS paid_amount, \
                COALESCE(SUM(CASE WHEN paid = 0 THEN line_total ELSE 0.0 END), 0.0) AS unpaid_amount \
             FROM invoices",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(InvoiceSummary {
            total_count: row.try_get("total_count")?,
            pending_count: row.try_get("pending_count")?,
            submitted_count: row.try_get("submitted_count")?,
            paid_count: row.try_get("paid_count")?,
            unpaid_count: row.try_get("unpaid_count")?,
            total_amount: row.try_get("total_amount")?,
            pending_amount: row.try_get("pending_amount")?,
            submitted_amount: row.try_get("submitted_amount")?,
            paid_amount: row.try_get("paid_amount")?,
            unpaid_amount: row.try_get("unpaid_amount")?,
        })
    }
}
