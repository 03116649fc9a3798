//! End-to-end tests for bulk dispatch and conversation automation.
//!
//! Everything runs against an in-memory libSQL store and a scripted fake
//! transport; no network is involved.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::timeout;
use uuid::Uuid;

use courier::automation::{
    Action, AutoReplyRule, Conversation, ConversationKey, ConversationManager, InboundEvent,
    InboundHandler, MatchType, RuleDraft,
};
use courier::config::DispatchConfig;
use courier::dispatch::{
    Dispatcher, Job, JobItem, JobItemStatus, JobStatus, OutboundTransport, Outcome, RetryPolicy,
};
use courier::error::{DatabaseError, DeliveryError, Error};
use courier::events::{Event, EventBus};
use courier::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

type SendResult = Result<String, DeliveryError>;

/// Fake transport: scripted per-recipient results, optional latency,
/// per-device in-flight tracking.
#[derive(Default)]
struct FakeTransport {
    script: Mutex<HashMap<String, VecDeque<SendResult>>>,
    calls: Mutex<Vec<(String, String)>>,
    in_flight: Mutex<HashMap<String, usize>>,
    peak_per_device: Mutex<HashMap<String, usize>>,
    peak_total: Mutex<usize>,
    latency: Duration,
}

impl FakeTransport {
    fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    fn script(&self, recipient: &str, results: Vec<SendResult>) {
        self.script
            .lock()
            .unwrap()
            .insert(recipient.to_string(), results.into());
    }

    fn recipients_called(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    fn peak_for(&self, device: &str) -> usize {
        self.peak_per_device
            .lock()
            .unwrap()
            .get(device)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl OutboundTransport for FakeTransport {
    async fn send(
        &self,
        device_id: &str,
        recipient: &str,
        _payload: &serde_json::Value,
    ) -> SendResult {
        let call_no = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((device_id.to_string(), recipient.to_string()));
            calls.len()
        };
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let now = in_flight.entry(device_id.to_string()).or_default();
            *now += 1;
            let mut peaks = self.peak_per_device.lock().unwrap();
            let peak = peaks.entry(device_id.to_string()).or_default();
            *peak = (*peak).max(*now);
            let total: usize = in_flight.values().sum();
            let mut peak_total = self.peak_total.lock().unwrap();
            *peak_total = (*peak_total).max(total);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(n) = self.in_flight.lock().unwrap().get_mut(device_id) {
            *n -= 1;
        }

        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(recipient)
            .and_then(|q| q.pop_front());
        scripted.unwrap_or_else(|| Ok(format!("wamid-{call_no}")))
    }
}

fn config() -> DispatchConfig {
    DispatchConfig {
        batch_size: 10,
        per_device_concurrency: 3,
        poll_interval: Duration::from_millis(25),
        send_timeout: Duration::from_secs(2),
        retry: RetryPolicy::immediate(3),
    }
}

async fn setup(
    transport: Arc<FakeTransport>,
    config: DispatchConfig,
) -> (Arc<Dispatcher>, Arc<LibSqlBackend>, EventBus) {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let events = EventBus::default();
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        transport,
        events.clone(),
        config,
    ));
    (dispatcher, store, events)
}

fn numbers(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Store that fails the first `get_job` after being armed, then behaves.
struct FlakyStore {
    inner: LibSqlBackend,
    fail_next_get_job: AtomicBool,
}

impl FlakyStore {
    async fn new() -> Self {
        Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            fail_next_get_job: AtomicBool::new(false),
        }
    }

    fn arm(&self) {
        self.fail_next_get_job.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Database for FlakyStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.inner.init_schema().await
    }

    async fn create_job(&self, job: &Job, recipients: &[String]) -> Result<(), DatabaseError> {
        self.inner.create_job(job, recipients).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        if self.fail_next_get_job.swap(false, Ordering::SeqCst) {
            return Err(DatabaseError::Query("database is locked".into()));
        }
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self, device_id: &str, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        self.inner.list_jobs(device_id, limit).await
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        self.inner.delete_job(id).await
    }

    async fn list_job_items(&self, job_id: Uuid) -> Result<Vec<JobItem>, DatabaseError> {
        self.inner.list_job_items(job_id).await
    }

    async fn claim_next_batch(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<JobItem>, DatabaseError> {
        self.inner.claim_next_batch(device_id, limit).await
    }

    async fn record_outcome(
        &self,
        item_id: i64,
        outcome: &Outcome,
    ) -> Result<Option<Job>, DatabaseError> {
        self.inner.record_outcome(item_id, outcome).await
    }

    async fn release_for_retry(
        &self,
        item_id: i64,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        self.inner.release_for_retry(item_id, error, available_at).await
    }

    async fn cancel_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        self.inner.cancel_job(id).await
    }

    async fn fail_job(&self, id: Uuid, reason: &str) -> Result<Option<Job>, DatabaseError> {
        self.inner.fail_job(id, reason).await
    }

    async fn recover_in_flight(&self) -> Result<u64, DatabaseError> {
        self.inner.recover_in_flight().await
    }

    async fn release_in_flight(&self, device_id: &str, error: &str) -> Result<u64, DatabaseError> {
        self.inner.release_in_flight(device_id, error).await
    }

    async fn devices_with_pending_work(&self) -> Result<Vec<String>, DatabaseError> {
        self.inner.devices_with_pending_work().await
    }

    async fn create_rule(
        &self,
        device_id: &str,
        draft: &RuleDraft,
    ) -> Result<AutoReplyRule, DatabaseError> {
        self.inner.create_rule(device_id, draft).await
    }

    async fn update_rule(
        &self,
        id: i64,
        draft: &RuleDraft,
    ) -> Result<Option<AutoReplyRule>, DatabaseError> {
        self.inner.update_rule(id, draft).await
    }

    async fn delete_rule(&self, id: i64) -> Result<Option<AutoReplyRule>, DatabaseError> {
        self.inner.delete_rule(id).await
    }

    async fn get_rule(&self, id: i64) -> Result<Option<AutoReplyRule>, DatabaseError> {
        self.inner.get_rule(id).await
    }

    async fn list_rules(&self, device_id: &str) -> Result<Vec<AutoReplyRule>, DatabaseError> {
        self.inner.list_rules(device_id).await
    }

    async fn get_conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Conversation>, DatabaseError> {
        self.inner.get_conversation(key).await
    }

    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError> {
        self.inner.upsert_conversation(conversation).await
    }

    async fn list_conversations(
        &self,
        device_id: &str,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        self.inner.list_conversations(device_id).await
    }
}

// ── Dispatch scenarios ───────────────────────────────────────────────

#[tokio::test]
async fn permanent_failure_is_recorded_per_recipient() {
    timeout(TEST_TIMEOUT, async {
        let transport = Arc::new(FakeTransport::default());
        transport.script(
            "6282222222",
            vec![Err(DeliveryError::Permanent("recipient blocked".into()))],
        );
        let (dispatcher, _, _) = setup(transport.clone(), config()).await;

        let id = dispatcher
            .enqueue_job(
                "dev-1",
                &numbers(&["6281111111", "6282222222", "6283333333"]),
                serde_json::json!({"text": "Flash sale today"}),
            )
            .await
            .unwrap();
        dispatcher.drain_device("dev-1").await.unwrap();

        let job = dispatcher.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress.total, 3);
        assert_eq!(job.progress.completed, 2);
        assert_eq!(job.progress.failed, 1);

        let items = dispatcher.list_job_items(id).await.unwrap();
        let blocked = items.iter().find(|i| i.recipient == "6282222222").unwrap();
        assert_eq!(blocked.status, JobItemStatus::Failed);
        assert!(blocked.error.as_deref().unwrap().contains("recipient blocked"));
        assert!(
            items
                .iter()
                .filter(|i| i.recipient != "6282222222")
                .all(|i| i.status == JobItemStatus::Sent && i.message_id.is_some())
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn transient_failure_then_success_is_sent() {
    timeout(TEST_TIMEOUT, async {
        let transport = Arc::new(FakeTransport::default());
        transport.script(
            "6284444444",
            vec![
                Err(DeliveryError::Transient("gateway 503".into())),
                Ok("wamid-retry".into()),
            ],
        );
        let (dispatcher, _, events) = setup(transport.clone(), config()).await;
        let mut rx = events.subscribe();

        let id = dispatcher
            .enqueue_job("dev-1", &numbers(&["6284444444"]), serde_json::json!({}))
            .await
            .unwrap();
        dispatcher.drain_device("dev-1").await.unwrap();

        let items = dispatcher.list_job_items(id).await.unwrap();
        assert_eq!(items[0].status, JobItemStatus::Sent);
        assert_eq!(items[0].message_id.as_deref(), Some("wamid-retry"));
        assert_eq!(items[0].attempts, 2);
        assert!(items[0].error.is_none());

        let job = dispatcher.get_job(id).await.unwrap();
        assert_eq!(job.progress.completed, 1);
        assert_eq!(job.progress.failed, 0);

        // The failed counter never moved, not even transiently
        for event in drain_events(&mut rx) {
            if let Event::JobProgress { progress, .. } | Event::JobCompleted { progress, .. } =
                event
            {
                assert_eq!(progress.failed, 0);
            }
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn store_error_after_claim_returns_items_to_pending() {
    timeout(TEST_TIMEOUT, async {
        let transport = Arc::new(FakeTransport::default());
        let store = Arc::new(FlakyStore::new().await);
        let events = EventBus::default();
        let dispatcher = Dispatcher::new(store.clone(), transport.clone(), events.clone(), config());
        let list = numbers(&["6281111111", "6282222222", "6283333333"]);
        let id = dispatcher
            .enqueue_job("dev-1", &list, serde_json::json!({"text": "restock"}))
            .await
            .unwrap();

        // Loading the payload fails right after the claim
        store.arm();
        let failed = dispatcher.drain_device("dev-1").await;
        assert!(matches!(failed, Err(Error::Database(DatabaseError::Query(_)))));
        assert!(transport.recipients_called().is_empty());

        let items = dispatcher.list_job_items(id).await.unwrap();
        assert!(items.iter().all(|i| i.status == JobItemStatus::Pending));
        assert!(
            items
                .iter()
                .all(|i| i.error.as_deref().is_some_and(|e| e.contains("database is locked")))
        );

        // The background pool picks them up again on its own
        let mut rx = events.subscribe();
        store.arm();
        dispatcher.start().await.unwrap();
        loop {
            if let Event::JobCompleted { job_id, .. } = rx.recv().await.unwrap() {
                assert_eq!(job_id, id);
                break;
            }
        }
        dispatcher.shutdown().await;

        let job = dispatcher.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress.completed, 3);
        assert_eq!(job.progress.failed, 0);
        let items = dispatcher.list_job_items(id).await.unwrap();
        assert!(items.iter().all(|i| i.status == JobItemStatus::Sent && i.error.is_none()));

        let mut called = transport.recipients_called();
        called.sort();
        assert_eq!(called, list);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rate_limit_backoff_defers_the_retry() {
    timeout(TEST_TIMEOUT, async {
        let transport = Arc::new(FakeTransport::default());
        transport.script(
            "6285555555",
            vec![Err(DeliveryError::RateLimited {
                retry_after: Some(Duration::from_secs(60)),
            })],
        );
        let mut cfg = config();
        cfg.retry = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        let (dispatcher, store, _) = setup(transport.clone(), cfg).await;

        let id = dispatcher
            .enqueue_job("dev-1", &numbers(&["6285555555"]), serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(dispatcher.drain_device("dev-1").await.unwrap(), 1);

        // Parked until the deadline: still pending, not claimable yet
        let items = dispatcher.list_job_items(id).await.unwrap();
        assert_eq!(items[0].status, JobItemStatus::Pending);
        assert!(store.claim_next_batch("dev-1", 10).await.unwrap().is_empty());
        assert_eq!(store.devices_with_pending_work().await.unwrap(), vec!["dev-1"]);
        assert_eq!(transport.recipients_called().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn counters_add_up_at_completion() {
    timeout(TEST_TIMEOUT, async {
        let transport = Arc::new(FakeTransport::default());
        let list: Vec<String> = (0..25).map(|n| format!("62811{n:06}")).collect();
        for (n, recipient) in list.iter().enumerate() {
            match n % 5 {
                0 => transport.script(recipient, vec![Err(DeliveryError::Permanent("invalid".into()))]),
                1 => transport.script(
                    recipient,
                    vec![Err(DeliveryError::Timeout(Duration::from_secs(1)))],
                ),
                2 => transport.script(
                    recipient,
                    vec![
                        Err(DeliveryError::Transient("a".into())),
                        Err(DeliveryError::Transient("b".into())),
                        Err(DeliveryError::Transient("c".into())),
                    ],
                ),
                _ => {}
            }
        }
        let (dispatcher, _, _) = setup(transport.clone(), config()).await;

        let id = dispatcher
            .enqueue_job("dev-1", &list, serde_json::json!({}))
            .await
            .unwrap();
        dispatcher.drain_device("dev-1").await.unwrap();

        let job = dispatcher.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress.total, 25);
        assert_eq!(job.progress.completed + job.progress.failed, 25);
        assert_eq!(job.progress.failed, 10);

        let items = dispatcher.list_job_items(id).await.unwrap();
        assert!(items
            .iter()
            .all(|i| matches!(i.status, JobItemStatus::Sent | JobItemStatus::Failed)));
        assert!(items.iter().all(|i| i.attempts >= 1 && i.attempts <= 3));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn jobs_of_one_device_run_fifo() {
    timeout(TEST_TIMEOUT, async {
        let transport = Arc::new(FakeTransport::default());
        let mut cfg = config();
        cfg.batch_size = 1;
        cfg.per_device_concurrency = 1;
        let (dispatcher, _, _) = setup(transport.clone(), cfg).await;

        dispatcher
            .enqueue_job("dev-1", &numbers(&["6281000001", "6281000002"]), serde_json::json!({}))
            .await
            .unwrap();
        dispatcher
            .enqueue_job("dev-1", &numbers(&["6282000001"]), serde_json::json!({}))
            .await
            .unwrap();
        dispatcher.drain_device("dev-1").await.unwrap();

        assert_eq!(
            transport.recipients_called(),
            numbers(&["6281000001", "6281000002", "6282000001"])
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn per_device_concurrency_is_bounded_but_devices_overlap() {
    timeout(TEST_TIMEOUT, async {
        let transport = Arc::new(FakeTransport::with_latency(Duration::from_millis(80)));
        let (dispatcher, _, events) = setup(transport.clone(), config()).await;
        let mut rx = events.subscribe();
        dispatcher.start().await.unwrap();

        let a: Vec<String> = (0..9).map(|n| format!("62810{n:06}")).collect();
        let b: Vec<String> = (0..9).map(|n| format!("62820{n:06}")).collect();
        dispatcher
            .enqueue_job("dev-a", &a, serde_json::json!({}))
            .await
            .unwrap();
        dispatcher
            .enqueue_job("dev-b", &b, serde_json::json!({}))
            .await
            .unwrap();

        let mut completed = 0;
        while completed < 2 {
            if let Event::JobCompleted { .. } = rx.recv().await.unwrap() {
                completed += 1;
            }
        }
        dispatcher.shutdown().await;

        assert!(transport.peak_for("dev-a") <= 3);
        assert!(transport.peak_for("dev-b") <= 3);
        assert!(*transport.peak_total.lock().unwrap() > 3);
        assert_eq!(transport.recipients_called().len(), 18);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_mid_job_stops_remaining_sends() {
    timeout(TEST_TIMEOUT, async {
        let transport = Arc::new(FakeTransport::default());
        let mut cfg = config();
        cfg.batch_size = 2;
        let (dispatcher, store, events) = setup(transport.clone(), cfg).await;
        let mut rx = events.subscribe();

        let list: Vec<String> = (0..6).map(|n| format!("62812{n:06}")).collect();
        let id = dispatcher
            .enqueue_job("dev-1", &list, serde_json::json!({}))
            .await
            .unwrap();

        // First batch goes out, then the operator cancels
        let first = store.claim_next_batch("dev-1", 2).await.unwrap();
        assert!(dispatcher.cancel_job(id).await.unwrap());
        for item in &first {
            store
                .record_outcome(
                    item.id,
                    &courier::dispatch::Outcome::Sent {
                        message_id: format!("wamid-{}", item.id),
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(dispatcher.drain_device("dev-1").await.unwrap(), 0);

        let job = dispatcher.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.progress.completed, 2);

        let items = dispatcher.list_job_items(id).await.unwrap();
        let cancelled = items
            .iter()
            .filter(|i| i.status == JobItemStatus::Cancelled)
            .count();
        assert_eq!(cancelled, 4);
        assert!(transport.recipients_called().is_empty());

        let kinds: Vec<&str> = drain_events(&mut rx).iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["job_cancelled"]);
    })
    .await
    .expect("test timed out");
}

// ── Automation scenarios ─────────────────────────────────────────────

async fn automation() -> (Arc<ConversationManager>, InboundHandler, Arc<FakeTransport>) {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let manager = Arc::new(ConversationManager::new(store, EventBus::default()));
    for (name, match_type, trigger, priority) in [
        ("greeting", MatchType::Exact, "hi", 1),
        ("help", MatchType::Contains, "help", 2),
    ] {
        manager
            .create_rule(
                "dev-1",
                &RuleDraft {
                    name: name.into(),
                    match_type,
                    trigger: trigger.into(),
                    response: format!("{name} reply"),
                    priority,
                    is_active: true,
                },
            )
            .await
            .unwrap();
    }

    let transport = Arc::new(FakeTransport::default());
    let handler = InboundHandler::new(
        Arc::clone(&manager),
        transport.clone(),
        RetryPolicy::immediate(2),
        Duration::from_secs(1),
    );
    (manager, handler, transport)
}

fn message(sender: &str, text: &str) -> InboundEvent {
    InboundEvent {
        device_id: "dev-1".into(),
        sender_id: sender.into(),
        text: text.into(),
        timestamp: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn exact_and_contains_rules_fire_in_order() {
    let (manager, handler, transport) = automation().await;
    let rules = manager.list_rules("dev-1").await.unwrap();

    let action = handler.handle(&message("6281111111", "hi")).await.unwrap();
    assert_eq!(
        action,
        Action::AutoReply {
            rule_id: rules[0].id,
            response: "greeting reply".into()
        }
    );

    let action = handler
        .handle(&message("6281111111", "i need help"))
        .await
        .unwrap();
    assert_eq!(
        action,
        Action::AutoReply {
            rule_id: rules[1].id,
            response: "help reply".into()
        }
    );
    assert_eq!(transport.recipients_called().len(), 2);
}

#[tokio::test]
async fn handoff_conversation_gets_no_auto_reply() {
    let (manager, handler, transport) = automation().await;
    manager
        .request_handoff("dev-1", "6281111111", Some("angry customer"))
        .await
        .unwrap();

    let action = handler.handle(&message("6281111111", "hi")).await.unwrap();
    assert_eq!(action, Action::NoAutoReply);
    assert!(transport.recipients_called().is_empty());

    // Other counterparts on the same device still get replies
    let other = handler.handle(&message("6282222222", "hi")).await.unwrap();
    assert!(matches!(other, Action::AutoReply { .. }));
}

#[tokio::test]
async fn concurrent_inbound_and_handoff_never_reply_after_handoff() {
    timeout(TEST_TIMEOUT, async {
        let (manager, handler, transport) = automation().await;
        let handler = Arc::new(handler);

        let mut tasks = Vec::new();
        for n in 0..10 {
            let handler = Arc::clone(&handler);
            tasks.push(tokio::spawn(async move {
                handler.handle(&message("6281111111", "hi")).await.unwrap();
            }));
            if n == 4 {
                manager
                    .request_handoff("dev-1", "6281111111", None)
                    .await
                    .unwrap();
            }
        }
        for task in tasks {
            task.await.unwrap();
        }

        let replies_before = transport.recipients_called().len();
        assert!(replies_before <= 10);

        // Once the handoff is in place, nothing more goes out
        handler.handle(&message("6281111111", "hi")).await.unwrap();
        assert_eq!(transport.recipients_called().len(), replies_before);
    })
    .await
    .expect("test timed out");
}
