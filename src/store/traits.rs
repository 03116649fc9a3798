//! Unified `Database` trait: single async interface for all persistence.
//!
//! The queue-critical operations (`claim_next_batch`, `record_outcome`) carry
//! the concurrency guarantees of the dispatcher: a claim is one conditional
//! update only one caller can win, and an outcome is only written for an item
//! that is still in flight.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::automation::conversation::{Conversation, ConversationKey};
use crate::automation::rules::{AutoReplyRule, RuleDraft};
use crate::dispatch::model::{Job, JobItem, Outcome};
use crate::error::DatabaseError;

/// Backend-agnostic database trait covering jobs, rules and conversations.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a queued job and one pending item per recipient, atomically.
    async fn create_job(&self, job: &Job, recipients: &[String]) -> Result<(), DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Most recent jobs for a device, newest first.
    async fn list_jobs(&self, device_id: &str, limit: usize) -> Result<Vec<Job>, DatabaseError>;

    /// Delete a job; its items go with it.
    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Job items ───────────────────────────────────────────────────

    async fn list_job_items(&self, job_id: Uuid) -> Result<Vec<JobItem>, DatabaseError>;

    /// Claim up to `limit` claimable items of a device and mark them in flight.
    ///
    /// Items come back in FIFO order: job creation order, then item id.
    /// Jobs that get their first claim move from queued to processing.
    async fn claim_next_batch(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<JobItem>, DatabaseError>;

    /// Finalize an in-flight item and bump its job's counters.
    ///
    /// Returns the updated job, or `None` when the item was not in flight
    /// (already finalized, cancelled, or never claimed).
    async fn record_outcome(
        &self,
        item_id: i64,
        outcome: &Outcome,
    ) -> Result<Option<Job>, DatabaseError>;

    /// Return an in-flight item to pending, claimable again from `available_at`.
    async fn release_for_retry(
        &self,
        item_id: i64,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Cancel a queued or processing job and its pending items.
    ///
    /// Returns the cancelled job, or `None` if it was already terminal or unknown.
    async fn cancel_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Fail a job as a whole; pending items are finalized as failed with `reason`.
    async fn fail_job(&self, id: Uuid, reason: &str) -> Result<Option<Job>, DatabaseError>;

    /// Return items stranded in flight by a previous process to pending.
    async fn recover_in_flight(&self) -> Result<u64, DatabaseError>;

    /// Settle a device's in-flight items after its worker lost track of them.
    ///
    /// Items of active jobs go back to pending, immediately claimable, with
    /// `error` noted. Items of cancelled or failed jobs are finalized as
    /// failed. Only safe while no worker holds claims for the device.
    /// Returns how many items went back to pending.
    async fn release_in_flight(&self, device_id: &str, error: &str) -> Result<u64, DatabaseError>;

    /// Devices that have at least one pending item in an active job.
    async fn devices_with_pending_work(&self) -> Result<Vec<String>, DatabaseError>;

    // ── Auto-reply rules ────────────────────────────────────────────

    async fn create_rule(
        &self,
        device_id: &str,
        draft: &RuleDraft,
    ) -> Result<AutoReplyRule, DatabaseError>;

    async fn update_rule(
        &self,
        id: i64,
        draft: &RuleDraft,
    ) -> Result<Option<AutoReplyRule>, DatabaseError>;

    /// Delete a rule, returning it if it existed.
    async fn delete_rule(&self, id: i64) -> Result<Option<AutoReplyRule>, DatabaseError>;

    async fn get_rule(&self, id: i64) -> Result<Option<AutoReplyRule>, DatabaseError>;

    /// All rules of a device (active or not), in evaluation order.
    async fn list_rules(&self, device_id: &str) -> Result<Vec<AutoReplyRule>, DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    async fn get_conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Insert or fully replace a conversation record.
    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError>;

    /// Conversations of a device, most recently active first.
    async fn list_conversations(&self, device_id: &str)
    -> Result<Vec<Conversation>, DatabaseError>;
}
