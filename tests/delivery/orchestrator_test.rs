//! Tests for `src/delivery/mod.rs`: stage ordering and the partial-failure contract.

use std::sync::Arc;

use invoice_mailer::config::ConfigError;
use invoice_mailer::delivery::{
    DeliveryError, DeliveryOrchestrator, DeliveryStage, Outbound, RenderPolicy,
};
use invoice_mailer::invoice::InvoiceStatus;
use invoice_mailer::mail::composer::ComposeError;
use invoice_mailer::mail::encoding::encode_wrapped;
use invoice_mailer::mail::transport::SmtpPhase;

use crate::support::{
    invoice, settings, FakeRenderer, MemoryStore, RecordingTransport, TransportScript,
};

const DOCUMENT: &[u8] = b"%PDF-1.4 rendered invoice";

struct Fixture {
    dir: tempfile::TempDir,
    store: Arc<MemoryStore>,
    renderer: Arc<FakeRenderer>,
    transport: Arc<RecordingTransport>,
    orchestrator: DeliveryOrchestrator,
}

fn seeded_store() -> MemoryStore {
    MemoryStore::with(vec![
        invoice("N1", 40.0, 2000.0, false, false),
        invoice("N2", 40.0, 2000.0, false, false),
        invoice("N3", 40.0, 2000.0, true, false),
        invoice("N4", 40.0, 2000.0, true, true),
    ])
}

fn fixture_with(
    script: TransportScript,
    policy: RenderPolicy,
    renderer: impl FnOnce(&std::path::Path) -> FakeRenderer,
) -> Fixture {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(seeded_store());
    let renderer = Arc::new(renderer(dir.path()));
    let transport = Arc::new(RecordingTransport::new(script));
    let outbound = Outbound {
        settings: settings(),
        transport: transport.clone(),
    };
    let orchestrator =
        DeliveryOrchestrator::new(store.clone(), renderer.clone(), Ok(outbound), policy);
    Fixture {
        dir,
        store,
        renderer,
        transport,
        orchestrator,
    }
}

fn fixture(script: TransportScript) -> Fixture {
    fixture_with(script, RenderPolicy::Always, |dir| {
        FakeRenderer::writing(dir, DOCUMENT)
    })
}

#[tokio::test]
async fn submit_delivers_then_records_submission() {
    let f = fixture(TransportScript::Accept);

    let report = f.orchestrator.submit("N1").await.expect("delivered");

    assert_eq!(report.number, "N1");
    assert_eq!(report.recipients.len(), 3);
    assert!(report.message_bytes > DOCUMENT.len());
    let reloaded = report.invoice.expect("reloaded invoice");
    assert_eq!(reloaded.status(), InvoiceStatus::Submitted);
    let summary = report.summary.expect("summary");
    assert_eq!(summary.pending_count, 1);
    assert_eq!(summary.submitted_count, 2);

    assert_eq!(f.renderer.calls(), 1);
    let sent = f.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].content.contains(&encode_wrapped(DOCUMENT)));

    let stored = f.store.get("N1").expect("stored");
    assert!(stored.submitted);
    assert!(!stored.paid);
}

#[tokio::test]
async fn recipient_rejection_leaves_invoice_unchanged() {
    let f = fixture(TransportScript::RejectRecipient(
        "approver@client.example".to_owned(),
    ));
    let before = f.store.snapshot();

    let err = f.orchestrator.submit("N1").await.expect_err("rejected");

    match &err {
        DeliveryError::TransportFailed { number, source } => {
            assert_eq!(number, "N1");
            assert_eq!(source.phase(), SmtpPhase::Recipient);
        }
        other => panic!("expected TransportFailed, got {other:?}"),
    }
    assert!(!err.is_after_delivery());
    assert_eq!(f.store.update_calls(), 0);
    assert_eq!(f.store.snapshot(), before);
    assert!(!f.store.get("N1").expect("stored").submitted);
}

#[tokio::test]
async fn store_failure_after_delivery_is_reported_as_stale_record() {
    let f = fixture(TransportScript::Accept);
    f.store.fail_updates();

    let err = f.orchestrator.submit("N1").await.expect_err("persist fails");

    assert!(err.is_after_delivery());
    assert_eq!(err.stage(), Some(DeliveryStage::Persist));
    match &err {
        DeliveryError::PersistFailedAfterDelivery {
            number, recipients, ..
        } => {
            assert_eq!(number, "N1");
            assert_eq!(recipients.len(), 3);
        }
        other => panic!("expected PersistFailedAfterDelivery, got {other:?}"),
    }

    // The effect happened...
    assert_eq!(f.transport.sent().len(), 1);
    // ...and the record is stale.
    assert_eq!(f.store.update_calls(), 1);
    assert!(!f.store.get("N1").expect("stored").submitted);
}

#[tokio::test]
async fn render_failure_stops_before_transport() {
    let f = fixture_with(
        TransportScript::Accept,
        RenderPolicy::Always,
        FakeRenderer::failing,
    );

    let err = f.orchestrator.submit("N1").await.expect_err("render fails");

    assert!(matches!(err, DeliveryError::RenderFailed { .. }));
    assert_eq!(err.stage(), Some(DeliveryStage::Render));
    assert_eq!(f.transport.attempts(), 0);
    assert_eq!(f.store.update_calls(), 0);
}

#[tokio::test]
async fn empty_document_fails_composition() {
    let f = fixture_with(TransportScript::Accept, RenderPolicy::Always, |dir| {
        FakeRenderer::writing(dir, b"")
    });

    let err = f.orchestrator.submit("N1").await.expect_err("empty document");

    assert!(matches!(
        err,
        DeliveryError::ComposeFailed {
            source: ComposeError::EmptyDocument(_),
            ..
        }
    ));
    assert_eq!(f.transport.attempts(), 0);
}

#[tokio::test]
async fn transport_timeout_is_its_own_outcome() {
    let f = fixture(TransportScript::TimeOut);

    let err = f.orchestrator.submit("N1").await.expect_err("timed out");

    assert!(matches!(
        err,
        DeliveryError::TimedOut {
            stage: DeliveryStage::Transport,
            ..
        }
    ));
    assert!(!f.store.get("N1").expect("stored").submitted);
}

#[tokio::test]
async fn missing_credentials_fail_before_any_work() {
    let store = Arc::new(seeded_store());
    let dir = tempfile::tempdir().expect("temp dir");
    let renderer = Arc::new(FakeRenderer::writing(dir.path(), DOCUMENT));
    let orchestrator = DeliveryOrchestrator::new(
        store.clone(),
        renderer.clone(),
        Err(ConfigError::MissingCredential("GMAIL_APP_PASSWORD")),
        RenderPolicy::Always,
    );

    let err = orchestrator.submit("N1").await.expect_err("not configured");

    assert!(matches!(
        err,
        DeliveryError::Configuration(ConfigError::MissingCredential("GMAIL_APP_PASSWORD"))
    ));
    assert_eq!(renderer.calls(), 0);
    assert_eq!(store.update_calls(), 0);
}

#[tokio::test]
async fn unknown_invoice_is_not_found() {
    let f = fixture(TransportScript::Accept);
    let err = f.orchestrator.submit("N999").await.expect_err("missing");
    assert!(matches!(err, DeliveryError::NotFound(ref n) if n == "N999"));
    assert_eq!(f.renderer.calls(), 0);
}

#[tokio::test]
async fn submitted_or_paid_invoice_is_never_sent_again() {
    let f = fixture(TransportScript::Accept);
    let before = f.store.snapshot();

    for (number, status) in [("N3", InvoiceStatus::Submitted), ("N4", InvoiceStatus::Paid)] {
        let err = f.orchestrator.submit(number).await.expect_err("already sent");
        match err {
            DeliveryError::AlreadySubmitted {
                number: ref n,
                status: s,
            } => {
                assert_eq!(n, number);
                assert_eq!(s, status);
            }
            other => panic!("expected AlreadySubmitted, got {other:?}"),
        }
        assert!(!f.orchestrator.locks().is_held(number));
    }

    assert_eq!(f.renderer.calls(), 0);
    assert_eq!(f.transport.attempts(), 0);
    assert_eq!(f.store.update_calls(), 0);
    assert_eq!(f.store.snapshot(), before);
}

#[tokio::test]
async fn attempt_in_flight_blocks_a_second_attempt() {
    let f = fixture(TransportScript::Accept);

    let held = f.orchestrator.locks().try_acquire("N1").expect("free");
    let err = f.orchestrator.submit("N1").await.expect_err("in flight");
    assert!(matches!(err, DeliveryError::AlreadyInFlight(ref n) if n == "N1"));
    assert_eq!(f.renderer.calls(), 0);

    // Other invoices are unaffected.
    f.orchestrator.submit("N2").await.expect("other invoice");

    drop(held);
    f.orchestrator.submit("N1").await.expect("released");
    assert!(!f.orchestrator.locks().is_held("N1"));
}

#[tokio::test]
async fn guard_is_released_after_a_failed_attempt() {
    let f = fixture(TransportScript::RejectRecipient(
        "billing@client.example".to_owned(),
    ));
    assert!(f.orchestrator.submit("N1").await.is_err());
    assert!(!f.orchestrator.locks().is_held("N1"));
}

#[tokio::test]
async fn reuse_policy_sends_existing_document() {
    let f = fixture_with(
        TransportScript::Accept,
        RenderPolicy::ReuseExisting,
        |dir| FakeRenderer::writing(dir, DOCUMENT),
    );
    let existing = b"%PDF-1.4 already on disk";
    std::fs::write(f.dir.path().join("invoice_N1.pdf"), existing).expect("write");

    f.orchestrator.submit("N1").await.expect("delivered");

    assert_eq!(f.renderer.calls(), 0);
    assert!(f.transport.sent()[0]
        .content
        .contains(&encode_wrapped(existing)));
}

#[tokio::test]
async fn reuse_policy_renders_when_document_is_absent() {
    let f = fixture_with(
        TransportScript::Accept,
        RenderPolicy::ReuseExisting,
        |dir| FakeRenderer::writing(dir, DOCUMENT),
    );
    f.orchestrator.submit("N1").await.expect("delivered");
    assert_eq!(f.renderer.calls(), 1);
}

#[tokio::test]
async fn always_policy_regenerates_existing_document() {
    let f = fixture(TransportScript::Accept);
    std::fs::write(f.dir.path().join("invoice_N1.pdf"), b"stale").expect("write");

    f.orchestrator.submit("N1").await.expect("delivered");

    assert_eq!(f.renderer.calls(), 1);
    assert!(f.transport.sent()[0]
        .content
        .contains(&encode_wrapped(DOCUMENT)));
}

#[tokio::test]
async fn submit_next_picks_latest_pending() {
    let f = fixture(TransportScript::Accept);

    let report = f
        .orchestrator
        .submit_next_pending()
        .await
        .expect("delivered")
        .expect("an invoice was pending");

    assert_eq!(report.number, "N2");
    assert!(f.store.get("N2").expect("stored").submitted);
    assert!(!f.store.get("N1").expect("stored").submitted);
}

#[tokio::test]
async fn submit_next_without_pending_sends_nothing() {
    let f = fixture(TransportScript::Accept);
    f.orchestrator.mark_submitted("N1").await.expect("N1");
    f.orchestrator.mark_submitted("N2").await.expect("N2");

    let outcome = f.orchestrator.submit_next_pending().await.expect("no error");

    assert!(outcome.is_none());
    assert_eq!(f.transport.attempts(), 0);
}

#[tokio::test]
async fn mark_paid_is_idempotent() {
    let f = fixture(TransportScript::Accept);

    let first = f.orchestrator.mark_paid("N4").await.expect("already paid");
    let second = f.orchestrator.mark_paid("N4").await.expect("still paid");

    assert_eq!(first.status(), InvoiceStatus::Paid);
    assert_eq!(first, second);
}

#[tokio::test]
async fn mark_paid_from_pending_sets_submitted_too() {
    let f = fixture(TransportScript::Accept);
    let paid = f.orchestrator.mark_paid("N1").await.expect("paid");
    assert!(paid.submitted && paid.paid);
    assert_eq!(f.transport.attempts(), 0);
}

#[tokio::test]
async fn mark_on_unknown_invoice_is_not_found_and_changes_nothing() {
    let f = fixture(TransportScript::Accept);
    let before = f.store.snapshot();

    let paid = f.orchestrator.mark_paid("N999").await.expect_err("missing");
    let submitted = f
        .orchestrator
        .mark_submitted("N999")
        .await
        .expect_err("missing");

    assert!(matches!(paid, DeliveryError::NotFound(_)));
    assert!(matches!(submitted, DeliveryError::NotFound(_)));
    assert_eq!(f.store.snapshot(), before);
}

#[tokio::test]
async fn mark_submitted_keeps_paid_flag() {
    let f = fixture(TransportScript::Accept);
    let inv = f.orchestrator.mark_submitted("N4").await.expect("ok");
    assert_eq!(inv.status(), InvoiceStatus::Paid);
}

#[tokio::test]
async fn render_only_produces_document_without_state_change() {
    let f = fixture(TransportScript::Accept);
    let before = f.store.snapshot();

    let path = f.orchestrator.render("N1").await.expect("rendered");

    assert_eq!(std::fs::read(&path).expect("document"), DOCUMENT);
    assert_eq!(f.store.snapshot(), before);
    assert_eq!(f.transport.attempts(), 0);

    let err = f.orchestrator.render("N999").await.expect_err("missing");
    assert!(matches!(err, DeliveryError::NotFound(_)));
}

#[tokio::test]
async fn without_mail_refuses_to_send_but_tracks_status() {
    let store = Arc::new(seeded_store());
    let dir = tempfile::tempdir().expect("temp dir");
    let orchestrator = DeliveryOrchestrator::without_mail(
        store.clone(),
        Arc::new(FakeRenderer::writing(dir.path(), DOCUMENT)),
        RenderPolicy::Always,
    );

    assert!(matches!(
        orchestrator.submit("N1").await,
        Err(DeliveryError::Configuration(_))
    ));
    orchestrator.mark_paid("N1").await.expect("paid");
    assert!(store.get("N1").expect("stored").paid);
}
