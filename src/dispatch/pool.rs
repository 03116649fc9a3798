//! Dispatch worker pool: drains pending job items per device.
//!
//! A single supervisor task polls the store for devices with pending work
//! (and is woken early on enqueue). It keeps at most one shard task per
//! device; a shard claims a batch, sends it with bounded concurrency, writes
//! every outcome back, and exits once a claim comes back empty.
//!
//! On start, items left in flight by a previous process are returned to
//! pending, so a crash mid-send costs at most one duplicate attempt.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::dispatch::address::validate_recipients;
use crate::dispatch::model::{Job, JobItem, JobStatus, Outcome};
use crate::dispatch::retry::RetryDecision;
use crate::dispatch::transport::OutboundTransport;
use crate::error::{DatabaseError, DeliveryError, JobError, Result, ValidationError};
use crate::events::{Event, EventBus};
use crate::store::Database;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// State shared by the facade, the supervisor and every shard.
struct Shared {
    store: Arc<dyn Database>,
    transport: Arc<dyn OutboundTransport>,
    events: EventBus,
    config: DispatchConfig,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    /// Devices whose in-flight items could not be handed back yet.
    stranded: Mutex<HashSet<String>>,
}

/// Bulk-send dispatcher: job intake, background delivery, job control.
pub struct Dispatcher {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Database>,
        transport: Arc<dyn OutboundTransport>,
        events: EventBus,
        config: DispatchConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                store,
                transport,
                events,
                config,
                wake: Notify::new(),
                shutdown,
                stranded: Mutex::new(HashSet::new()),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Validate and persist a bulk-send job, then wake the pool.
    ///
    /// Returns as soon as the job and its items are stored.
    pub async fn enqueue_job(
        &self,
        device_id: &str,
        recipients: &[String],
        payload: serde_json::Value,
    ) -> Result<Uuid> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(ValidationError::EmptyDevice.into());
        }
        let recipients = validate_recipients(recipients)?;

        let job = Job::new(device_id, recipients.len() as u32, payload);
        self.shared.store.create_job(&job, &recipients).await?;

        info!(
            job_id = %job.id,
            device_id,
            total = recipients.len(),
            "Bulk-send job queued"
        );
        self.shared.wake.notify_one();
        Ok(job.id)
    }

    /// Cancel a queued or processing job.
    ///
    /// Returns `false` when the job was already terminal.
    pub async fn cancel_job(&self, id: Uuid) -> Result<bool> {
        match self.shared.store.cancel_job(id).await? {
            Some(job) => {
                info!(job_id = %id, device_id = %job.device_id, "Job cancelled");
                self.shared.events.publish(Event::JobCancelled {
                    job_id: job.id,
                    device_id: job.device_id,
                    progress: job.progress,
                });
                Ok(true)
            }
            None => {
                self.get_job(id).await?;
                debug!(job_id = %id, "Cancel ignored, job already terminal");
                Ok(false)
            }
        }
    }

    /// Fail a job as a whole. Pending items are finalized as failed.
    pub async fn fail_job(&self, id: Uuid, reason: &str) -> Result<bool> {
        if fail_job_and_publish(&self.shared, id, reason).await? {
            return Ok(true);
        }
        self.get_job(id).await?;
        Ok(false)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job> {
        self.shared
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id }.into())
    }

    /// Delete a finished job and its items. Active jobs must be cancelled first.
    pub async fn delete_job(&self, id: Uuid) -> Result<Job> {
        let job = self.get_job(id).await?;
        if !job.status.is_terminal() {
            return Err(JobError::StillActive {
                id,
                status: job.status,
            }
            .into());
        }
        if !self.shared.store.delete_job(id).await? {
            return Err(JobError::NotFound { id }.into());
        }
        info!(job_id = %id, device_id = %job.device_id, "Job deleted");
        Ok(job)
    }

    pub async fn list_jobs(&self, device_id: &str, limit: usize) -> Result<Vec<Job>> {
        Ok(self.shared.store.list_jobs(device_id, limit).await?)
    }

    /// Per-recipient status of a job.
    pub async fn list_job_items(&self, id: Uuid) -> Result<Vec<JobItem>> {
        self.get_job(id).await?;
        Ok(self.shared.store.list_job_items(id).await?)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.supervisor
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Recover stranded items and spawn the supervisor. No-op if already running.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let recovered = self.shared.store.recover_in_flight().await?;
        if recovered > 0 {
            warn!(recovered, "Returned in-flight items from a previous run to pending");
        }

        self.shared.shutdown.send_replace(false);
        let handle = tokio::spawn(supervise(Arc::clone(&self.shared)));
        if let Ok(mut slot) = self.supervisor.lock() {
            *slot = Some(handle);
        }
        info!(
            batch_size = self.shared.config.batch_size,
            per_device_concurrency = self.shared.config.per_device_concurrency,
            poll_interval_ms = self.shared.config.poll_interval.as_millis() as u64,
            "Dispatcher started"
        );
        Ok(())
    }

    /// Stop the supervisor and its shards. Sends already in flight finish.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let handle = self.supervisor.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatcher supervisor panicked");
            }
        }
        info!("Dispatcher stopped");
    }

    /// Drain one device in the caller's task until nothing is claimable.
    ///
    /// A maintenance and test entry point: it bypasses the supervisor, so it
    /// is refused while the background pool is running. Returns how many
    /// items were processed. Items waiting on a retry backoff are left for a
    /// later pass.
    pub async fn drain_device(&self, device_id: &str) -> Result<usize> {
        if self.is_running() {
            return Err(JobError::DispatcherRunning.into());
        }
        let mut processed = 0;
        loop {
            let n = process_batch(&self.shared, device_id).await?;
            if n == 0 {
                return Ok(processed);
            }
            processed += n;
        }
    }
}

// ── Supervisor and shards ───────────────────────────────────────────

async fn supervise(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    let period = shared.config.poll_interval.max(MIN_POLL_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut shards: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shared.wake.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }

        shards.retain(|_, handle| !handle.is_finished());
        retry_stranded(&shared, &shards).await;

        let devices = match shared.store.devices_with_pending_work().await {
            Ok(devices) => devices,
            Err(e) => {
                error!(error = %e, "Failed to scan for devices with pending work");
                continue;
            }
        };

        for device_id in devices {
            if shards.contains_key(&device_id) {
                continue;
            }
            debug!(device_id = %device_id, "Spawning shard");
            let handle = tokio::spawn(run_shard(Arc::clone(&shared), device_id.clone()));
            shards.insert(device_id, handle);
        }
    }

    debug!(shards = shards.len(), "Supervisor stopping, waiting for shards");
    for (device_id, handle) in shards {
        if let Err(e) = handle.await {
            error!(device_id = %device_id, error = %e, "Shard panicked");
        }
    }
}

/// Settle devices whose shard could not hand its claims back earlier.
///
/// A device is only touched while it has no live shard, so no claim of a
/// running worker is released from under it.
async fn retry_stranded(shared: &Shared, shards: &HashMap<String, JoinHandle<()>>) {
    let pending: Vec<String> = match shared.stranded.lock() {
        Ok(mut stranded) => {
            let idle: Vec<String> = stranded
                .iter()
                .filter(|device| !shards.contains_key(*device))
                .cloned()
                .collect();
            for device in &idle {
                stranded.remove(device);
            }
            idle
        }
        Err(_) => return,
    };

    for device_id in pending {
        settle_stranded(shared, &device_id, "worker lost track of in-flight items").await;
    }
}

async fn run_shard(shared: Arc<Shared>, device_id: String) {
    let shutdown = shared.shutdown.subscribe();
    let mut processed = 0usize;

    while !*shutdown.borrow() {
        match process_batch(&shared, &device_id).await {
            Ok(0) => break,
            Ok(n) => processed += n,
            Err(e) => {
                error!(device_id = %device_id, error = %e, "Shard stopped on a store error");
                break;
            }
        }
    }

    debug!(device_id = %device_id, processed, "Shard idle");
}

/// Claim one batch for a device and process it. Returns the batch size.
///
/// If the store fails after the claim, whatever the batch left in flight is
/// handed back before the error is returned.
async fn process_batch(shared: &Shared, device_id: &str) -> std::result::Result<usize, DatabaseError> {
    let items = shared
        .store
        .claim_next_batch(device_id, shared.config.batch_size)
        .await?;
    if items.is_empty() {
        return Ok(0);
    }
    let claimed = items.len();

    if let Err(e) = process_claimed(shared, device_id, items).await {
        settle_stranded(shared, device_id, &e.to_string()).await;
        return Err(e);
    }
    Ok(claimed)
}

async fn process_claimed(
    shared: &Shared,
    device_id: &str,
    items: Vec<JobItem>,
) -> std::result::Result<(), DatabaseError> {
    let mut payloads: HashMap<Uuid, Arc<serde_json::Value>> = HashMap::new();
    for item in &items {
        if payloads.contains_key(&item.job_id) {
            continue;
        }
        match shared.store.get_job(item.job_id).await? {
            Some(job) => {
                payloads.insert(job.id, Arc::new(job.payload));
            }
            None => warn!(job_id = %item.job_id, "Claimed item of a deleted job"),
        }
    }

    let work: Vec<(JobItem, Arc<serde_json::Value>)> = items
        .into_iter()
        .filter_map(|item| {
            let payload = Arc::clone(payloads.get(&item.job_id)?);
            Some((item, payload))
        })
        .collect();

    let results: Vec<std::result::Result<(), DatabaseError>> = futures::stream::iter(work)
        .map(|(item, payload)| process_item(shared, device_id, item, payload))
        .buffer_unordered(shared.config.per_device_concurrency.max(1))
        .collect()
        .await;

    results.into_iter().collect()
}

/// Hand a device's in-flight items back, or remember the device for later.
async fn settle_stranded(shared: &Shared, device_id: &str, reason: &str) {
    match shared.store.release_in_flight(device_id, reason).await {
        Ok(released) => {
            if released > 0 {
                warn!(device_id, released, reason, "Returned stranded items to pending");
                shared.wake.notify_one();
            }
        }
        Err(e) => {
            error!(device_id, error = %e, "Failed to release stranded items, will retry");
            if let Ok(mut stranded) = shared.stranded.lock() {
                stranded.insert(device_id.to_string());
            }
        }
    }
}

/// Send one claimed item and write its outcome back.
///
/// An `Err` means the outcome could not be stored and the item may still be
/// in flight.
async fn process_item(
    shared: &Shared,
    device_id: &str,
    item: JobItem,
    payload: Arc<serde_json::Value>,
) -> std::result::Result<(), DatabaseError> {
    let timeout = shared.config.send_timeout;
    let result = match tokio::time::timeout(
        timeout,
        shared.transport.send(device_id, &item.recipient, &payload),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::Timeout(timeout)),
    };

    let error = match result {
        Ok(message_id) => {
            debug!(item_id = item.id, recipient = %item.recipient, message_id = %message_id, "Message sent");
            return finalize(shared, &item, Outcome::Sent { message_id }).await;
        }
        Err(error) => error,
    };

    if error.is_fatal_for_job() {
        warn!(
            job_id = %item.job_id,
            device_id,
            error = %error,
            "Device session lost, failing job"
        );
        let reason = error.to_string();
        fail_job_and_publish(shared, item.job_id, &reason).await?;
        return finalize(shared, &item, Outcome::Failed { error: reason }).await;
    }

    match shared.config.retry.decide(item.attempts, &error) {
        RetryDecision::Retry { delay } => {
            let available_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            let released = shared
                .store
                .release_for_retry(item.id, &error.to_string(), available_at)
                .await?;
            if released {
                debug!(
                    item_id = item.id,
                    attempts = item.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Send failed, retry scheduled"
                );
                Ok(())
            } else {
                // Job went terminal while the send was in flight
                finalize(shared, &item, Outcome::Failed { error: error.to_string() }).await
            }
        }
        RetryDecision::GiveUp => {
            info!(
                item_id = item.id,
                recipient = %item.recipient,
                attempts = item.attempts,
                error = %error,
                "Delivery failed"
            );
            finalize(shared, &item, Outcome::Failed { error: error.to_string() }).await
        }
    }
}

/// Record an outcome and publish the resulting job transition.
async fn finalize(
    shared: &Shared,
    item: &JobItem,
    outcome: Outcome,
) -> std::result::Result<(), DatabaseError> {
    match shared.store.record_outcome(item.id, &outcome).await {
        Ok(Some(job)) => publish_progress(&shared.events, &job),
        Ok(None) => debug!(item_id = item.id, "Outcome already recorded"),
        Err(e) => {
            error!(item_id = item.id, error = %e, "Failed to record outcome");
            return Err(e);
        }
    }
    Ok(())
}

fn publish_progress(events: &EventBus, job: &Job) {
    debug!(
        job_id = %job.id,
        remaining = job.progress.remaining(),
        "Job progress"
    );
    events.publish(Event::JobProgress {
        job_id: job.id,
        device_id: job.device_id.clone(),
        progress: job.progress,
    });

    if job.status == JobStatus::Completed && job.progress.is_done() {
        info!(
            job_id = %job.id,
            device_id = %job.device_id,
            completed = job.progress.completed,
            failed = job.progress.failed,
            "Job completed"
        );
        events.publish(Event::JobCompleted {
            job_id: job.id,
            device_id: job.device_id.clone(),
            progress: job.progress,
        });
    }
}

async fn fail_job_and_publish(
    shared: &Shared,
    id: Uuid,
    reason: &str,
) -> std::result::Result<bool, DatabaseError> {
    let Some(job) = shared.store.fail_job(id, reason).await? else {
        return Ok(false);
    };
    warn!(job_id = %id, device_id = %job.device_id, reason, "Job failed");
    shared.events.publish(Event::JobFailed {
        job_id: job.id,
        device_id: job.device_id,
        progress: job.progress,
        error: reason.to_string(),
    });
    Ok(true)
}
