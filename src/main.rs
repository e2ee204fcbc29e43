//! Invoice mailer CLI entry point.
//!
//! Lists and inspects stored invoices, renders and mails them, and records
//! payment. `submit-next` is the unattended weekly job and logs to JSON files.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use invoice_mailer::config::{
    load_config, runtime_paths, AppConfig, ConfigError, RuntimePaths, CONFIG_PATH_ENV,
};
use invoice_mailer::credentials::{load_credentials, Credentials};
use invoice_mailer::delivery::{DeliveryError, DeliveryOrchestrator, DeliveryReport, Outbound};
use invoice_mailer::invoice::{
    default_number, previous_week_friday, Invoice, InvoiceStore, InvoiceSummary, NewInvoice,
    SqliteInvoiceStore, StatusFilter,
};
use invoice_mailer::logging;
use invoice_mailer::mail::{MailSettings, SmtpTransport};
use invoice_mailer::render::CommandRenderer;

/// Exit status for a delivered invoice whose status could not be recorded.
const EXIT_RECONCILE: u8 = 3;

/// Invoice mailer: render, send, and track weekly invoices.
#[derive(Parser)]
#[command(name = "invoice-mailer", version, about)]
struct Cli {
    /// Path to `config.toml`.
    ///
    /// Defaults to `$INVOICE_MAILER_CONFIG`, then `~/.invoice-mailer/config.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// List invoices.
    List {
        /// Status filter: all, pending, submitted, paid, unpaid.
        #[arg(long, default_value = "all")]
        status: StatusFilter,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Show one invoice with its daily entries.
    Show {
        /// Invoice number.
        number: String,
        /// Print JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print counts and totals by status.
    Summary {
        /// Print JSON.
        #[arg(long)]
        json: bool,
    },
    /// Render the invoice document without sending it.
    Render {
        /// Invoice number.
        number: String,
    },
    /// Render, mail, and mark an invoice submitted.
    Submit {
        /// Invoice number.
        number: String,
    },
    /// Submit the most recent pending invoice (unattended weekly run).
    SubmitNext,
    /// Record an invoice as submitted without sending it.
    MarkSubmitted {
        /// Invoice number.
        number: String,
    },
    /// Record an invoice as paid.
    MarkPaid {
        /// Invoice number.
        number: String,
    },
    /// Create a Monday-Friday invoice from the billing defaults.
    CreateWeek {
        /// Invoice number (default: `N` plus the week's Monday as `YYYYMMDD`).
        number: Option<String>,
        /// Friday ending the billed week, `YYYY-MM-DD` (default: last week's Friday).
        #[arg(long, value_parser = parse_date)]
        friday: Option<NaiveDate>,
    },
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD, got {value:?}: {e}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<DeliveryError>() {
            Some(delivery) if delivery.is_after_delivery() => {
                eprintln!("RECONCILE: {delivery}");
                eprintln!(
                    "RECONCILE: the mail was sent; mark the invoice submitted by hand \
                     (`invoice-mailer mark-submitted <number>`) instead of resending"
                );
                ExitCode::from(EXIT_RECONCILE)
            }
            _ => {
                eprintln!("error: {err:#}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Loaded configuration and resolved paths for one invocation.
struct App {
    config: AppConfig,
    paths: RuntimePaths,
}

impl App {
    fn load(config_override: Option<PathBuf>) -> anyhow::Result<Self> {
        let paths = runtime_paths()?;
        let config_path = config_override
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| paths.config_toml.clone());
        let config = load_config(&config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?;
        Ok(Self { config, paths })
    }

    async fn open_store(&self) -> anyhow::Result<Arc<SqliteInvoiceStore>> {
        let path = self.config.database_path(&self.paths);
        let store = SqliteInvoiceStore::open(&path)
            .await
            .with_context(|| format!("failed to open invoice store {}", path.display()))?;
        Ok(Arc::new(store))
    }

    fn renderer(&self) -> Arc<CommandRenderer> {
        Arc::new(CommandRenderer::new(
            &self.config.renderer,
            self.config.documents_dir(&self.paths),
        ))
    }

    /// Sender identity and transport. Configuration gaps are [`ConfigError`]s;
    /// an unreadable credentials file is a hard error.
    fn outbound(&self) -> anyhow::Result<Result<Outbound, ConfigError>> {
        let credentials = if self.paths.env_file.exists() {
            load_credentials(&self.paths.env_file)
                .with_context(|| format!("failed to load {}", self.paths.env_file.display()))?
        } else {
            Credentials::default()
        };
        Ok(credentials.mail_credentials().and_then(|creds| {
            let settings = MailSettings::from_config(&creds.address, &self.config.mail)?;
            let transport = Arc::new(SmtpTransport::new(&self.config.mail, creds));
            Ok(Outbound {
                settings,
                transport,
            })
        }))
    }

    async fn orchestrator(&self) -> anyhow::Result<DeliveryOrchestrator> {
        let store = self.open_store().await?;
        Ok(DeliveryOrchestrator::without_mail(
            store,
            self.renderer(),
            self.config.renderer.policy,
        ))
    }

    /// Orchestrator for sending; configuration is checked before the store opens.
    async fn sending_orchestrator(&self) -> anyhow::Result<DeliveryOrchestrator> {
        let outbound = self.outbound()?.map_err(DeliveryError::Configuration)?;
        let store = self.open_store().await?;
        Ok(DeliveryOrchestrator::new(
            store,
            self.renderer(),
            Ok(outbound),
            self.config.renderer.policy,
        ))
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if !matches!(cli.command, Command::SubmitNext) {
        logging::init_cli();
    }
    let app = App::load(cli.config)?;

    match cli.command {
        Command::List { status, json } => handle_list(&app, status, json).await,
        Command::Show { number, json } => handle_show(&app, &number, json).await,
        Command::Summary { json } => handle_summary(&app, json).await,
        Command::Render { number } => {
            let path = app.orchestrator().await?.render(&number).await?;
            println!("Rendered {}", path.display());
            Ok(())
        }
        Command::Submit { number } => {
            let report = app.sending_orchestrator().await?.submit(&number).await?;
            print_report(&report);
            Ok(())
        }
        Command::SubmitNext => handle_submit_next(&app).await,
        Command::MarkSubmitted { number } => {
            let invoice = app.orchestrator().await?.mark_submitted(&number).await?;
            println!("Invoice {} is {}", invoice.number, invoice.status());
            Ok(())
        }
        Command::MarkPaid { number } => {
            let invoice = app.orchestrator().await?.mark_paid(&number).await?;
            println!("Invoice {} is {}", invoice.number, invoice.status());
            Ok(())
        }
        Command::CreateWeek { number, friday } => handle_create_week(&app, number, friday).await,
    }
}

async fn handle_list(app: &App, filter: StatusFilter, json: bool) -> anyhow::Result<()> {
    let store = app.open_store().await?;
    let invoices = store.fetch_by_status(filter).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&invoices)?);
        return Ok(());
    }
    if invoices.is_empty() {
        println!("No invoices.");
        return Ok(());
    }
    println!(
        "{:<14} {:<12} {:<12} {:>7} {:>11}  {:<9}",
        "NUMBER", "CREATED", "DUE", "HOURS", "AMOUNT", "STATUS"
    );
    for invoice in &invoices {
        print_row(invoice);
    }
    Ok(())
}

fn print_row(invoice: &Invoice) {
    println!(
        "{:<14} {:<12} {:<12} {:>7.1} {:>11.2}  {:<9}",
        invoice.number,
        invoice.created_on,
        invoice.due_on,
        invoice.total_hours,
        invoice.total_amount,
        invoice.status()
    );
}

async fn handle_show(app: &App, number: &str, json: bool) -> anyhow::Result<()> {
    let store = app.open_store().await?;
    let invoice = store.fetch_by_number(number).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&invoice)?);
        return Ok(());
    }
    println!("Invoice  {}", invoice.number);
    println!("Status   {}", invoice.status());
    println!("Created  {}", invoice.created_on);
    println!("Due      {} (net {})", invoice.due_on, invoice.payment_terms);
    println!("Payee    {} / {}", invoice.payee, invoice.payee_address);
    println!(
        "Payor    {} / {} / {}",
        invoice.payor, invoice.payor_address, invoice.payor_phone
    );
    println!();
    for entry in &invoice.entries {
        println!(
            "  {:<16} {:>5}-{:<5} {:>5.1}h x {:>7.2} = {:>9.2}",
            entry.date, entry.clock_in, entry.clock_out, entry.hours, entry.rate, entry.subtotal
        );
    }
    println!();
    println!(
        "Total    {:.1}h  ${:.2}",
        invoice.total_hours, invoice.total_amount
    );
    Ok(())
}

async fn handle_summary(app: &App, json: bool) -> anyhow::Result<()> {
    let store = app.open_store().await?;
    let summary = store.summary().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &InvoiceSummary) {
    let rows = [
        ("Pending", summary.pending_count, summary.pending_amount),
        ("Submitted", summary.submitted_count, summary.submitted_amount),
        ("Paid", summary.paid_count, summary.paid_amount),
        ("Unpaid", summary.unpaid_count, summary.unpaid_amount),
        ("Total", summary.total_count, summary.total_amount),
    ];
    for (label, count, amount) in rows {
        println!("{label:<10} {count:>4}  ${amount:>11.2}");
    }
}

fn print_report(report: &DeliveryReport) {
    println!(
        "Sent invoice {} to {} ({} bytes)",
        report.number,
        report.recipients.join(", "),
        report.message_bytes
    );
    match &report.invoice {
        Some(invoice) => println!("Invoice {} is {}", invoice.number, invoice.status()),
        None => println!("Invoice {} recorded as submitted", report.number),
    }
    if let Some(summary) = &report.summary {
        print_summary(summary);
    }
}

async fn handle_submit_next(app: &App) -> anyhow::Result<()> {
    let _logging_guard = logging::init_production(&app.paths.logs_dir)?;
    info!("weekly submission run starting");

    let orchestrator = app.sending_orchestrator().await?;
    match orchestrator.submit_next_pending().await? {
        Some(report) => {
            info!(invoice = %report.number, "weekly submission complete");
            print_report(&report);
        }
        None => {
            warn!("no pending invoice found");
            println!("No pending invoice to submit.");
        }
    }
    Ok(())
}

async fn handle_create_week(
    app: &App,
    number: Option<String>,
    friday: Option<NaiveDate>,
) -> anyhow::Result<()> {
    let friday = match friday {
        Some(date) => date,
        None => previous_week_friday(chrono::Local::now().date_naive())
            .context("cannot determine last week's Friday")?,
    };
    let number = match number {
        Some(n) => n,
        None => default_number(friday).context("cannot derive an invoice number")?,
    };

    let new_invoice = NewInvoice::for_week(&number, friday, &app.config.billing)?;
    let store = app.open_store().await?;
    let id = store.insert(&new_invoice).await?;
    info!(invoice = %new_invoice.number, id, "invoice created");
    println!(
        "Created invoice {} for the week ending {} ({:.1}h, ${:.2})",
        new_invoice.number, friday, new_invoice.total_hours, new_invoice.total_amount
    );
    Ok(())
}
