//! CLI contract tests against an isolated home directory.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use tempfile::TempDir;

struct Workspace {
    home: TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let home = tempfile::tempdir().expect("temp home");
        let config = home.path().join("config.toml");
        let db = home.path().join("data").join("invoices.db");
        fs::write(
            &config,
            format!(
                "[store]\npath = \"{}\"\n\n[mail]\nrecipients = [\"billing@client.example\"]\n",
                db.display()
            ),
        )
        .expect("write config");
        Self { home, config }
    }

    fn home(&self) -> &Path {
        self.home.path()
    }

    fn cmd(&self, args: &[&str]) -> Command {
        let mut cmd = Command::cargo_bin("invoice-mailer").expect("binary builds");
        cmd.env("HOME", self.home())
            .env_remove("INVOICE_MAILER_CONFIG")
            .env("RUST_LOG", "warn")
            .arg("--config")
            .arg(&self.config)
            .args(args);
        cmd
    }

    fn stdout(&self, args: &[&str]) -> String {
        let output = self.cmd(args).output().expect("command runs");
        assert!(
            output.status.success(),
            "{args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }
}

#[test]
fn create_list_and_pay_an_invoice() {
    let ws = Workspace::new();

    let created = ws.stdout(&["create-week", "N1", "--friday", "2024-01-19"]);
    assert!(created.contains("Created invoice N1"), "{created}");
    assert!(created.contains("2024-01-19"), "{created}");

    let pending = ws.stdout(&["list", "--status", "pending"]);
    assert!(pending.contains("N1"), "{pending}");
    assert!(pending.contains("pending"), "{pending}");

    let paid = ws.stdout(&["mark-paid", "N1"]);
    assert!(paid.contains("Invoice N1 is paid"), "{paid}");

    // Paying again is a no-op.
    let again = ws.stdout(&["mark-paid", "N1"]);
    assert!(again.contains("Invoice N1 is paid"), "{again}");

    let pending = ws.stdout(&["list", "--status", "pending"]);
    assert!(pending.contains("No invoices."), "{pending}");
}

#[test]
fn summary_json_reports_totals() {
    let ws = Workspace::new();
    ws.stdout(&["create-week", "N1", "--friday", "2024-01-12"]);
    ws.stdout(&["create-week", "N2", "--friday", "2024-01-19"]);
    ws.stdout(&["mark-paid", "N1"]);

    let raw = ws.stdout(&["summary", "--json"]);
    let summary: serde_json::Value = serde_json::from_str(&raw).expect("summary is JSON");

    assert_eq!(summary["total_count"], 2);
    assert_eq!(summary["paid_count"], 1);
    assert_eq!(summary["pending_count"], 1);
    assert_eq!(summary["unpaid_count"], 1);
}

#[test]
fn create_week_defaults_number_from_monday() {
    let ws = Workspace::new();
    let created = ws.stdout(&["create-week", "--friday", "2024-01-19"]);
    assert!(created.contains("Created invoice N20240115"), "{created}");
}

#[test]
fn mark_paid_unknown_invoice_fails() {
    let ws = Workspace::new();
    ws.cmd(&["mark-paid", "N404"]).assert().failure().code(1);
}

#[test]
fn submit_without_credentials_is_a_configuration_error() {
    let ws = Workspace::new();
    ws.stdout(&["create-week", "N1", "--friday", "2024-01-19"]);

    let output = ws.cmd(&["submit", "N1"]).output().expect("command runs");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("GMAIL_ADDRESS"), "{stderr}");

    let pending = ws.stdout(&["list", "--status", "pending"]);
    assert!(pending.contains("N1"), "{pending}");
}

#[test]
fn invalid_friday_is_rejected_by_the_parser() {
    let ws = Workspace::new();
    ws.cmd(&["create-week", "N1", "--friday", "2024-01-18"])
        .assert()
        .failure();
    ws.cmd(&["create-week", "N1", "--friday", "19/01/2024"])
        .assert()
        .failure();
}
