//! Settlement engine: decision table, settlement calls, and Error Sink usage.
use std::collections::HashMap;
use std::error::Error as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use tokio::sync::watch;
use tokio::time::Instant;

use peeklock_consumer::emit::ErrorSink;
use peeklock_consumer::errors::{CancelReason, ConsumerError, SettlementError};
use peeklock_consumer::ingest::{Delivery, Envelope, Settle, SettlementHandle, SettlementMode};
use peeklock_consumer::settle::{
    decide, record, settlement_action, Decision, DeliveryPolicy, LockBudget, SettlementAction,
    SettlementEngine, MAX_DELIVERY_COUNT_EXCEEDED,
};
use tracing_subscriber::fmt::MakeWriter;

/// ---- Fakes -----

#[derive(Clone, Default)]
struct RecordingPort {
    // (action, id)
    calls: Arc<Mutex<Vec<(String, String)>>>,
    fail_with: Option<SettlementError>,
}

impl RecordingPort {
    fn failing(err: SettlementError) -> Self {
        Self {
            calls: Default::default(),
            fail_with: Some(err),
        }
    }

    fn push(&self, action: &str, id: &str) -> Result<(), SettlementError> {
        self.calls
            .lock()
            .unwrap()
            .push((action.to_string(), id.to_string()));
        match &self.fail_with {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Settle for RecordingPort {
    async fn complete(&self, id: &str) -> Result<(), SettlementError> {
        self.push("complete", id)
    }
    async fn abandon(&self, id: &str) -> Result<(), SettlementError> {
        self.push("abandon", id)
    }
    async fn dead_letter(&self, id: &str, reason: &str, _d: &str) -> Result<(), SettlementError> {
        self.push(&format!("dead_letter:{reason}"), id)
    }
}

#[derive(Clone, Default)]
struct RecordingSink {
    // (id, error text)
    alerts: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl ErrorSink for RecordingSink {
    async fn notify(&self, delivery: &Delivery, error: &ConsumerError) {
        self.alerts
            .lock()
            .unwrap()
            .push((delivery.id().to_string(), error.to_string()));
    }
}

/// ---- Helpers ----

struct Harness {
    engine: SettlementEngine<RecordingSink>,
    sink: RecordingSink,
    shutdown: watch::Sender<bool>,
}

fn harness(policy: DeliveryPolicy) -> Harness {
    let (shutdown, rx) = watch::channel(false);
    let sink = RecordingSink::default();
    let engine = SettlementEngine::new(policy, LockBudget::default(), sink.clone(), rx);
    Harness {
        engine,
        sink,
        shutdown,
    }
}

fn delivery(id: &str, payload: &str, count: u32, mode: SettlementMode) -> Delivery {
    Delivery::new(
        id,
        Bytes::copy_from_slice(payload.as_bytes()),
        count,
        Utc::now() + chrono::Duration::seconds(120),
        mode,
    )
}

fn manual(id: &str, payload: &str, count: u32, port: &RecordingPort) -> Envelope {
    let d = delivery(id, payload, count, SettlementMode::ManualComplete);
    Envelope::manual(d, Some(SettlementHandle::new(id, Arc::new(port.clone()))))
}

fn auto(id: &str, payload: &str) -> Envelope {
    Envelope::auto(delivery(id, payload, 1, SettlementMode::AutoComplete))
}

/// ---- Decision table ----

#[test]
fn decision_table() {
    let none = DeliveryPolicy::unlimited();
    let ok: Result<(), ConsumerError> = Ok(());
    let failed: Result<(), ConsumerError> = Err(ConsumerError::Processing("x".into()));

    assert_eq!(decide(SettlementMode::ManualComplete, &none, 1, &ok), Decision::Complete);
    assert_eq!(decide(SettlementMode::ManualComplete, &none, 1, &failed), Decision::Abandon);
    assert_eq!(decide(SettlementMode::AutoComplete, &none, 1, &ok), Decision::NoOp);
    assert_eq!(decide(SettlementMode::AutoComplete, &none, 1, &failed), Decision::Unrecoverable);
}

#[test]
fn delivery_count_policy_only_dead_letters_manual_failures() {
    let policy = DeliveryPolicy::max_deliveries(3);
    let ok: Result<(), ConsumerError> = Ok(());
    let failed: Result<(), ConsumerError> = Err(ConsumerError::Processing("boom".into()));

    assert_eq!(decide(SettlementMode::ManualComplete, &policy, 2, &failed), Decision::Abandon);
    assert_eq!(
        decide(SettlementMode::ManualComplete, &policy, 3, &failed),
        Decision::DeadLetter {
            reason: MAX_DELIVERY_COUNT_EXCEEDED.to_string(),
            description: "Processing error: boom".to_string(),
        }
    );
    assert_eq!(decide(SettlementMode::ManualComplete, &policy, 9, &ok), Decision::Complete);
    assert_eq!(
        decide(SettlementMode::AutoComplete, &policy, 9, &failed),
        Decision::Unrecoverable
    );
}

#[test]
fn manual_outcomes_always_map_to_a_settlement_call() {
    let policy = DeliveryPolicy::max_deliveries(2);
    let ok: Result<(), ConsumerError> = Ok(());
    let failed: Result<(), ConsumerError> = Err(ConsumerError::Decode("bad".into()));

    assert_eq!(settlement_action(&policy, 5, &ok), SettlementAction::Complete);
    assert_eq!(settlement_action(&policy, 1, &failed), SettlementAction::Abandon);
    let dead = settlement_action(&policy, 2, &failed);
    assert!(matches!(dead, SettlementAction::DeadLetter { ref reason, .. } if reason == MAX_DELIVERY_COUNT_EXCEEDED));
    assert_eq!(
        Decision::from(dead),
        decide(SettlementMode::ManualComplete, &policy, 2, &failed)
    );
}

/// ---- Scenarios ----

#[tokio::test(start_paused = true)]
async fn manual_success_completes_after_delay() {
    let h = harness(DeliveryPolicy::unlimited());
    let port = RecordingPort::default();
    let start = Instant::now();

    let decision = h
        .engine
        .handle(manual("a", r#"{"sleepTime":2,"message":""}"#, 1, &port))
        .await
        .expect("handled");

    assert_eq!(decision, Decision::Complete);
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(port.calls(), vec![("complete".into(), "a".into())]);
    assert!(h.sink.alerts.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn manual_failure_abandons_once_without_alert() {
    let h = harness(DeliveryPolicy::unlimited());
    let port = RecordingPort::default();

    let decision = h
        .engine
        .handle(manual("b", r#"{"sleepTime":1,"message":"boom"}"#, 1, &port))
        .await
        .expect("handled");

    assert_eq!(decision, Decision::Abandon);
    assert_eq!(port.calls(), vec![("abandon".into(), "b".into())]);
    assert!(h.sink.alerts.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn auto_failure_is_unrecoverable_and_alerts() {
    let h = harness(DeliveryPolicy::unlimited());

    let err = h
        .engine
        .handle(auto("c", r#"{"sleepTime":0,"message":"boom"}"#))
        .await
        .unwrap_err();

    match &err {
        ConsumerError::Unrecoverable { id, source } => {
            assert_eq!(id, "c");
            assert!(matches!(**source, ConsumerError::Processing(ref m) if m == "boom"));
        }
        other => panic!("expected Unrecoverable, got {other:?}"),
    }
    assert!(err.source().is_some());

    let alerts = h.sink.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].0, "c");
}

#[tokio::test(start_paused = true)]
async fn bare_integer_payload_completes_after_delay() {
    let h = harness(DeliveryPolicy::unlimited());
    let port = RecordingPort::default();
    let start = Instant::now();

    let decision = h.engine.handle(manual("d", "5", 1, &port)).await.unwrap();

    assert_eq!(decision, Decision::Complete);
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert_eq!(port.calls(), vec![("complete".into(), "d".into())]);
}

#[tokio::test(start_paused = true)]
async fn manual_without_handle_is_rejected_before_work() {
    let h = harness(DeliveryPolicy::unlimited());
    let start = Instant::now();
    let envelope = Envelope::manual(
        delivery("e", r#"{"sleepTime":30,"message":""}"#, 1, SettlementMode::ManualComplete),
        None,
    );

    let err = h.engine.handle(envelope).await.unwrap_err();

    assert!(matches!(err, ConsumerError::Configuration(_)), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(30), "work must not run");
    assert!(h.sink.alerts.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn auto_success_is_noop() {
    let h = harness(DeliveryPolicy::unlimited());
    let decision = h.engine.handle(auto("f", r#"{"sleepTime":1}"#)).await.unwrap();
    assert_eq!(decision, Decision::NoOp);
    assert!(h.sink.alerts.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn auto_mode_ignores_a_supplied_handle() {
    let h = harness(DeliveryPolicy::unlimited());
    let port = RecordingPort::default();
    let d = delivery("g", "0", 1, SettlementMode::AutoComplete);
    let envelope = Envelope::manual(d, Some(SettlementHandle::new("g", Arc::new(port.clone()))));

    let decision = h.engine.handle(envelope).await.unwrap();
    assert_eq!(decision, Decision::NoOp);
    assert!(port.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn malformed_payload_takes_the_failure_branch() {
    let h = harness(DeliveryPolicy::unlimited());
    let port = RecordingPort::default();

    let decision = h.engine.handle(manual("m1", "not-a-payload", 1, &port)).await.unwrap();
    assert_eq!(decision, Decision::Abandon);

    let err = h.engine.handle(auto("m2", "not-a-payload")).await.unwrap_err();
    match err {
        ConsumerError::Unrecoverable { source, .. } => {
            assert!(matches!(*source, ConsumerError::Decode(_)))
        }
        other => panic!("expected Unrecoverable, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_delivery_count_dead_letters() {
    let h = harness(DeliveryPolicy::max_deliveries(3));
    let port = RecordingPort::default();

    let first = h
        .engine
        .handle(manual("h", r#"{"message":"boom"}"#, 2, &port))
        .await
        .unwrap();
    let last = h
        .engine
        .handle(manual("h", r#"{"message":"boom"}"#, 3, &port))
        .await
        .unwrap();

    assert_eq!(first, Decision::Abandon);
    assert!(matches!(last, Decision::DeadLetter { ref reason, .. } if reason == MAX_DELIVERY_COUNT_EXCEEDED));
    assert_eq!(
        port.calls(),
        vec![
            ("abandon".into(), "h".into()),
            (format!("dead_letter:{MAX_DELIVERY_COUNT_EXCEEDED}"), "h".into()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn settlement_failure_is_reported_not_retried() {
    let h = harness(DeliveryPolicy::unlimited());
    let port = RecordingPort::failing(SettlementError::LockLost("i".into()));

    let err = h.engine.handle(manual("i", "0", 1, &port)).await.unwrap_err();

    assert!(
        matches!(err, ConsumerError::Settlement(SettlementError::LockLost(ref id)) if id == "i"),
        "{err:?}"
    );
    assert_eq!(port.calls().len(), 1, "no retry of a stale lock");
    let alerts = h.sink.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].1.contains("Lock lost"));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_work_and_abandons() {
    let h = harness(DeliveryPolicy::unlimited());
    let port = RecordingPort::default();
    h.shutdown.send(true).unwrap();

    let decision = h
        .engine
        .handle(manual("j", r#"{"sleepTime":30}"#, 1, &port))
        .await
        .unwrap();

    assert_eq!(decision, Decision::Abandon);
    assert_eq!(port.calls(), vec![("abandon".into(), "j".into())]);
}

#[tokio::test(start_paused = true)]
async fn lock_deadline_cancels_work() {
    let (_tx, rx) = watch::channel(false);
    let sink = RecordingSink::default();
    let budget = LockBudget {
        max_auto_lock_renew: Duration::ZERO,
        margin: Duration::from_secs(1),
    };
    let engine = SettlementEngine::new(DeliveryPolicy::unlimited(), budget, sink.clone(), rx);
    let port = RecordingPort::default();
    let d = Delivery::new(
        "k",
        Bytes::from_static(br#"{"sleepTime":60}"#),
        1,
        Utc::now() + chrono::Duration::seconds(5),
        SettlementMode::ManualComplete,
    );
    let start = Instant::now();

    let decision = engine
        .handle(Envelope::manual(d, Some(SettlementHandle::new("k", Arc::new(port.clone())))))
        .await
        .unwrap();

    assert_eq!(decision, Decision::Abandon);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(port.calls(), vec![("abandon".into(), "k".into())]);
}

#[test]
fn lock_budget_extends_deadline_by_renewal() {
    let now = Utc::now();
    let d = Delivery::new(
        "x",
        Bytes::new(),
        1,
        now + chrono::Duration::seconds(30),
        SettlementMode::ManualComplete,
    )
    .with_received_at(now);

    let plain = LockBudget::default();
    assert_eq!(plain.deadline(&d), now + chrono::Duration::seconds(30));

    let renewed = LockBudget {
        max_auto_lock_renew: Duration::from_secs(300),
        margin: Duration::from_secs(2),
    };
    assert_eq!(renewed.deadline(&d), now + chrono::Duration::seconds(298));
}

#[tokio::test(start_paused = true)]
async fn at_most_one_settlement_per_id() {
    let h = harness(DeliveryPolicy::max_deliveries(2));
    let port = RecordingPort::default();
    let payloads = [
        ("p1", "0", 1),
        ("p2", r#"{"message":"boom"}"#, 1),
        ("p3", r#"{"message":"boom"}"#, 2),
        ("p4", "garbage", 1),
        ("p5", r#"{"sleepTime":1,"message":""}"#, 1),
    ];

    for (id, payload, count) in payloads {
        let _ = h.engine.handle(manual(id, payload, count, &port)).await;
    }

    let mut per_id: HashMap<String, usize> = HashMap::new();
    for (_, id) in port.calls() {
        *per_id.entry(id).or_default() += 1;
    }
    assert_eq!(per_id.len(), payloads.len());
    assert!(per_id.values().all(|n| *n == 1), "{per_id:?}");
}

#[test]
fn cancel_reason_is_displayed() {
    let err = ConsumerError::Cancelled(CancelReason::LockDeadline);
    assert_eq!(err.to_string(), "Processing cancelled: lock deadline");
    assert!(err.is_processing_failure());
    assert!(!ConsumerError::Configuration("x".into()).is_processing_failure());
}

#[tokio::test]
async fn redelivery_of_the_same_id_is_settled_once_per_attempt() {
    let h = harness(DeliveryPolicy::max_deliveries(2));
    let port = RecordingPort::default();

    let first = h.engine.handle(manual("m", r#"{"message":"boom"}"#, 1, &port)).await;
    let second = h.engine.handle(manual("m", r#"{"message":"boom"}"#, 2, &port)).await;

    assert_eq!(first.unwrap(), Decision::Abandon);
    assert!(matches!(second.unwrap(), Decision::DeadLetter { .. }));
    assert_eq!(
        port.calls(),
        vec![
            ("abandon".to_string(), "m".to_string()),
            ("dead_letter".to_string(), "m".to_string()),
        ]
    );
}

#[derive(Clone, Default)]
struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLog {
    type Writer = CapturedLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn terminal_event_carries_id_count_and_lock_expiry() {
    let locked_until = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
    let d = Delivery::new(
        "evt-1",
        Bytes::from_static(b"0"),
        3,
        locked_until,
        SettlementMode::ManualComplete,
    );
    let log = CapturedLog::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(log.clone())
        .with_ansi(false)
        .finish();

    tracing::subscriber::with_default(subscriber, || record(&d, "complete", None));

    let out = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
    assert!(out.contains("message_id=evt-1"), "{out}");
    assert!(out.contains("delivery_count=3"), "{out}");
    assert!(out.contains(&format!("locked_until={locked_until}")), "{out}");
    assert!(out.contains("decision=\"complete\""), "{out}");
}
