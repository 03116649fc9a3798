//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is shared
//! by all callers and every operation, reads included, holds `gate`. An open
//! transaction belongs to the connection, so an ungated read issued while
//! another task is mid-transaction would run inside it and see uncommitted
//! rows.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::automation::conversation::{Conversation, ConversationKey};
use crate::automation::rules::{AutoReplyRule, RuleDraft};
use crate::dispatch::model::{Job, JobItem, JobKind, JobProgress, JobStatus, Outcome};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    gate: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            gate: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Job lookup for callers already holding `gate`.
    async fn fetch_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_job"))?;

        match rows.next().await.map_err(query_err("get_job"))? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    /// Rule lookup for callers already holding `gate`.
    async fn fetch_rule(&self, id: i64) -> Result<Option<AutoReplyRule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM auto_reply_rules WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err("get_rule"))?;

        match rows.next().await.map_err(query_err("get_rule"))? {
            Some(row) => Ok(Some(row_to_rule(&row)?)),
            None => Ok(None),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: RFC 3339, UTC, fixed microsecond precision.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

/// Map a libsql Row to a Job.
///
/// Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let map = query_err("job row");
    let id_str: String = row.get(0).map_err(&map)?;
    let status_str: String = row.get(3).map_err(&map)?;
    let payload_str: String = row.get(7).map_err(&map)?;
    let created_str: String = row.get(9).map_err(&map)?;

    Ok(Job {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("job id {id_str}: {e}")))?,
        kind: JobKind::BulkSend,
        device_id: row.get(2).map_err(&map)?,
        status: status_str
            .parse::<JobStatus>()
            .map_err(DatabaseError::Serialization)?,
        progress: JobProgress {
            total: row.get::<i64>(4).map_err(&map)? as u32,
            completed: row.get::<i64>(5).map_err(&map)? as u32,
            failed: row.get::<i64>(6).map_err(&map)? as u32,
        },
        payload: serde_json::from_str(&payload_str)
            .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?,
        error: row.get(8).ok(),
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&row.get(10).ok()),
        completed_at: parse_optional_datetime(&row.get(11).ok()),
    })
}

/// Map a libsql Row to a JobItem. Column order matches ITEM_COLUMNS.
fn row_to_item(row: &libsql::Row) -> Result<JobItem, DatabaseError> {
    let map = query_err("job item row");
    let job_id_str: String = row.get(1).map_err(&map)?;
    let status_str: String = row.get(3).map_err(&map)?;

    Ok(JobItem {
        id: row.get(0).map_err(&map)?,
        job_id: Uuid::parse_str(&job_id_str)
            .map_err(|e| DatabaseError::Serialization(format!("job id {job_id_str}: {e}")))?,
        recipient: row.get(2).map_err(&map)?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        message_id: row.get(4).ok(),
        error: row.get(5).ok(),
        attempts: row.get::<i64>(6).map_err(&map)? as u32,
        processed_at: parse_optional_datetime(&row.get(7).ok()),
    })
}

/// Map a libsql Row to an AutoReplyRule. Column order matches RULE_COLUMNS.
fn row_to_rule(row: &libsql::Row) -> Result<AutoReplyRule, DatabaseError> {
    let map = query_err("rule row");
    let match_type_str: String = row.get(3).map_err(&map)?;
    let created_str: String = row.get(8).map_err(&map)?;
    let updated_str: String = row.get(9).map_err(&map)?;

    Ok(AutoReplyRule {
        id: row.get(0).map_err(&map)?,
        device_id: row.get(1).map_err(&map)?,
        name: row.get(2).map_err(&map)?,
        match_type: match_type_str
            .parse()
            .map_err(DatabaseError::Serialization)?,
        trigger: row.get(4).map_err(&map)?,
        response: row.get(5).map_err(&map)?,
        priority: row.get(6).map_err(&map)?,
        is_active: row.get::<i64>(7).map_err(&map)? != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a Conversation. Column order matches CONVERSATION_COLUMNS.
fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let map = query_err("conversation row");
    let state_str: String = row.get(2).map_err(&map)?;
    let created_str: String = row.get(7).map_err(&map)?;

    Ok(Conversation {
        device_id: row.get(0).map_err(&map)?,
        counterpart_id: row.get(1).map_err(&map)?,
        state: state_str.parse().map_err(DatabaseError::Serialization)?,
        last_bot_activity_at: parse_optional_datetime(&row.get(3).ok()),
        last_handoff_requested_at: parse_optional_datetime(&row.get(4).ok()),
        last_message_at: parse_optional_datetime(&row.get(5).ok()),
        handoff_reason: row.get(6).ok(),
        created_at: parse_datetime(&created_str),
    })
}

/// Drain a result set through a row mapper.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    op: &'static str,
    map_row: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        out.push(map_row(&row)?);
    }
    Ok(out)
}

// ── Trait implementation ────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, kind, device_id, status, total, completed, failed, payload, error, created_at, started_at, completed_at";

const ITEM_COLUMNS: &str =
    "id, job_id, recipient, status, message_id, error, attempts, processed_at";

const RULE_COLUMNS: &str = "id, device_id, name, match_type, trigger_text, response, priority, is_active, created_at, updated_at";

const CONVERSATION_COLUMNS: &str = "device_id, counterpart_id, state, last_bot_activity_at, last_handoff_requested_at, last_message_at, handoff_reason, created_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let _guard = self.gate.lock().await;
        self.conn()
            .execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn create_job(&self, job: &Job, recipients: &[String]) -> Result<(), DatabaseError> {
        let _guard = self.gate.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("create_job begin"))?;

        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?;

        tx.execute(
            "INSERT INTO jobs (id, kind, device_id, status, total, completed, failed, payload, created_at) VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?7)",
            params![
                job.id.to_string(),
                job.kind.as_str(),
                job.device_id.as_str(),
                job.status.as_str(),
                recipients.len() as i64,
                payload,
                fmt_ts(job.created_at),
            ],
        )
        .await
        .map_err(query_err("create_job"))?;

        let job_id = job.id.to_string();
        for recipient in recipients {
            tx.execute(
                "INSERT INTO job_items (job_id, recipient, status, attempts, available_at) VALUES (?1, ?2, 'pending', 0, 0)",
                params![job_id.as_str(), recipient.as_str()],
            )
            .await
            .map_err(query_err("create_job item"))?;
        }

        tx.commit().await.map_err(query_err("create_job commit"))?;

        debug!(job_id = %job.id, device_id = %job.device_id, total = recipients.len(), "Job inserted into DB");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let _guard = self.gate.lock().await;
        self.fetch_job(id).await
    }

    async fn list_jobs(&self, device_id: &str, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE device_id = ?1 ORDER BY rowid DESC LIMIT ?2"
                ),
                params![device_id, limit as i64],
            )
            .await
            .map_err(query_err("list_jobs"))?;

        collect_rows(rows, "list_jobs", row_to_job).await
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.gate.lock().await;
        let count = self
            .conn()
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(query_err("delete_job"))?;
        Ok(count > 0)
    }

    // ── Job items ───────────────────────────────────────────────────

    async fn list_job_items(&self, job_id: Uuid) -> Result<Vec<JobItem>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM job_items WHERE job_id = ?1 ORDER BY id"),
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("list_job_items"))?;

        collect_rows(rows, "list_job_items", row_to_item).await
    }

    async fn claim_next_batch(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<JobItem>, DatabaseError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let _guard = self.gate.lock().await;
        let now = Utc::now();
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("claim begin"))?;

        let rows = tx
            .query(
                &format!(
                    "UPDATE job_items
                     SET status = 'in_flight', attempts = attempts + 1, claimed_at = ?1
                     WHERE id IN (
                         SELECT ji.id FROM job_items ji
                         JOIN jobs j ON j.id = ji.job_id
                         WHERE j.device_id = ?2
                           AND j.status IN ('queued', 'processing')
                           AND ji.status = 'pending'
                           AND ji.available_at <= ?3
                         ORDER BY j.rowid, ji.id
                         LIMIT ?4
                     )
                     RETURNING {ITEM_COLUMNS}"
                ),
                params![fmt_ts(now), device_id, now.timestamp_millis(), limit as i64],
            )
            .await
            .map_err(query_err("claim_next_batch"))?;

        let mut items = collect_rows(rows, "claim_next_batch", row_to_item).await?;
        // RETURNING order is unspecified; ids grow with enqueue order.
        items.sort_by_key(|item| item.id);

        let mut started: Vec<Uuid> = items.iter().map(|item| item.job_id).collect();
        started.dedup();
        for job_id in &started {
            tx.execute(
                "UPDATE jobs SET status = 'processing', started_at = ?1 WHERE id = ?2 AND status = 'queued'",
                params![fmt_ts(now), job_id.to_string()],
            )
            .await
            .map_err(query_err("claim start job"))?;
        }

        tx.commit().await.map_err(query_err("claim commit"))?;

        if !items.is_empty() {
            debug!(device_id, claimed = items.len(), "Claimed job items");
        }
        Ok(items)
    }

    async fn record_outcome(
        &self,
        item_id: i64,
        outcome: &Outcome,
    ) -> Result<Option<Job>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let now = fmt_ts(Utc::now());
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("record_outcome begin"))?;

        let (message_id, error) = match outcome {
            Outcome::Sent { message_id } => (Some(message_id.as_str()), None),
            Outcome::Failed { error } => (None, Some(error.as_str())),
        };

        let changed = tx
            .execute(
                "UPDATE job_items SET status = ?1, message_id = COALESCE(?2, message_id), error = ?3, processed_at = ?4
                 WHERE id = ?5 AND status = 'in_flight'",
                params![
                    outcome.status().as_str(),
                    opt_text(message_id),
                    opt_text(error),
                    now.as_str(),
                    item_id,
                ],
            )
            .await
            .map_err(query_err("record_outcome"))?;

        if changed == 0 {
            tx.rollback()
                .await
                .map_err(query_err("record_outcome rollback"))?;
            debug!(item_id, "Outcome ignored, item not in flight");
            return Ok(None);
        }

        let mut rows = tx
            .query("SELECT job_id FROM job_items WHERE id = ?1", params![item_id])
            .await
            .map_err(query_err("record_outcome job lookup"))?;
        let job_id: String = match rows.next().await.map_err(query_err("record_outcome"))? {
            Some(row) => row.get(0).map_err(query_err("record_outcome job id"))?,
            None => {
                return Err(DatabaseError::NotFound {
                    entity: "job_item".into(),
                    id: item_id.to_string(),
                });
            }
        };
        drop(rows);

        let (completed, failed) = match outcome {
            Outcome::Sent { .. } => (1_i64, 0_i64),
            Outcome::Failed { .. } => (0, 1),
        };
        tx.execute(
            "UPDATE jobs SET completed = completed + ?1, failed = failed + ?2 WHERE id = ?3",
            params![completed, failed, job_id.as_str()],
        )
        .await
        .map_err(query_err("record_outcome counters"))?;

        tx.execute(
            "UPDATE jobs SET status = 'completed', completed_at = ?1
             WHERE id = ?2 AND status = 'processing' AND completed + failed >= total",
            params![now.as_str(), job_id.as_str()],
        )
        .await
        .map_err(query_err("record_outcome complete"))?;

        tx.commit()
            .await
            .map_err(query_err("record_outcome commit"))?;

        let job_uuid = Uuid::parse_str(&job_id)
            .map_err(|e| DatabaseError::Serialization(format!("job id {job_id}: {e}")))?;
        self.fetch_job(job_uuid).await
    }

    async fn release_for_retry(
        &self,
        item_id: i64,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.gate.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE job_items SET status = 'pending', error = ?1, available_at = ?2
                 WHERE id = ?3 AND status = 'in_flight'
                   AND job_id IN (SELECT id FROM jobs WHERE status IN ('queued', 'processing'))",
                params![error, available_at.timestamp_millis(), item_id],
            )
            .await
            .map_err(query_err("release_for_retry"))?;
        Ok(changed > 0)
    }

    async fn cancel_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let now = fmt_ts(Utc::now());
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("cancel_job begin"))?;

        let changed = tx
            .execute(
                "UPDATE jobs SET status = 'cancelled', completed_at = ?1
                 WHERE id = ?2 AND status IN ('queued', 'processing')",
                params![now.as_str(), id.to_string()],
            )
            .await
            .map_err(query_err("cancel_job"))?;

        if changed == 0 {
            tx.rollback()
                .await
                .map_err(query_err("cancel_job rollback"))?;
            return Ok(None);
        }

        let dropped = tx
            .execute(
                "UPDATE job_items SET status = 'cancelled', processed_at = ?1
                 WHERE job_id = ?2 AND status = 'pending'",
                params![now.as_str(), id.to_string()],
            )
            .await
            .map_err(query_err("cancel_job items"))?;

        tx.commit().await.map_err(query_err("cancel_job commit"))?;

        debug!(job_id = %id, cancelled_items = dropped, "Job cancelled in DB");
        self.fetch_job(id).await
    }

    async fn fail_job(&self, id: Uuid, reason: &str) -> Result<Option<Job>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let now = fmt_ts(Utc::now());
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("fail_job begin"))?;

        let changed = tx
            .execute(
                "UPDATE jobs SET status = 'failed', error = ?1, completed_at = ?2
                 WHERE id = ?3 AND status IN ('queued', 'processing')",
                params![reason, now.as_str(), id.to_string()],
            )
            .await
            .map_err(query_err("fail_job"))?;

        if changed == 0 {
            tx.rollback().await.map_err(query_err("fail_job rollback"))?;
            return Ok(None);
        }

        let failed_items = tx
            .execute(
                "UPDATE job_items SET status = 'failed', error = ?1, processed_at = ?2
                 WHERE job_id = ?3 AND status = 'pending'",
                params![reason, now.as_str(), id.to_string()],
            )
            .await
            .map_err(query_err("fail_job items"))?;

        tx.execute(
            "UPDATE jobs SET failed = failed + ?1 WHERE id = ?2",
            params![failed_items as i64, id.to_string()],
        )
        .await
        .map_err(query_err("fail_job counters"))?;

        tx.commit().await.map_err(query_err("fail_job commit"))?;

        self.fetch_job(id).await
    }

    async fn recover_in_flight(&self) -> Result<u64, DatabaseError> {
        let _guard = self.gate.lock().await;
        self.conn()
            .execute(
                "UPDATE job_items SET status = 'pending', available_at = 0 WHERE status = 'in_flight'",
                (),
            )
            .await
            .map_err(query_err("recover_in_flight"))
    }

    async fn release_in_flight(&self, device_id: &str, error: &str) -> Result<u64, DatabaseError> {
        let _guard = self.gate.lock().await;
        let now = fmt_ts(Utc::now());
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("release_in_flight begin"))?;

        let released = tx
            .execute(
                "UPDATE job_items SET status = 'pending', error = ?1, available_at = 0
                 WHERE status = 'in_flight'
                   AND job_id IN (SELECT id FROM jobs WHERE device_id = ?2 AND status IN ('queued', 'processing'))",
                params![error, device_id],
            )
            .await
            .map_err(query_err("release_in_flight"))?;

        // Inactive jobs never re-queue: their stranded items count as failed
        tx.execute(
            "UPDATE jobs SET failed = failed + (
                 SELECT COUNT(*) FROM job_items ji WHERE ji.job_id = jobs.id AND ji.status = 'in_flight'
             )
             WHERE device_id = ?1 AND status IN ('cancelled', 'failed')",
            params![device_id],
        )
        .await
        .map_err(query_err("release_in_flight counters"))?;

        let finalized = tx
            .execute(
                "UPDATE job_items SET status = 'failed', error = ?1, processed_at = ?2
                 WHERE status = 'in_flight'
                   AND job_id IN (SELECT id FROM jobs WHERE device_id = ?3 AND status IN ('cancelled', 'failed'))",
                params![error, now.as_str(), device_id],
            )
            .await
            .map_err(query_err("release_in_flight finalize"))?;

        tx.commit()
            .await
            .map_err(query_err("release_in_flight commit"))?;

        if released + finalized > 0 {
            debug!(device_id, released, finalized, "Stranded in-flight items settled");
        }
        Ok(released)
    }

    async fn devices_with_pending_work(&self) -> Result<Vec<String>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT j.device_id FROM jobs j
                 JOIN job_items ji ON ji.job_id = j.id
                 WHERE j.status IN ('queued', 'processing') AND ji.status = 'pending'
                 ORDER BY j.device_id",
                (),
            )
            .await
            .map_err(query_err("devices_with_pending_work"))?;

        let mut devices = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(query_err("devices_with_pending_work"))?
        {
            devices.push(
                row.get::<String>(0)
                    .map_err(query_err("devices_with_pending_work"))?,
            );
        }
        Ok(devices)
    }

    // ── Auto-reply rules ────────────────────────────────────────────

    async fn create_rule(
        &self,
        device_id: &str,
        draft: &RuleDraft,
    ) -> Result<AutoReplyRule, DatabaseError> {
        let _guard = self.gate.lock().await;
        let now = fmt_ts(Utc::now());
        self.conn()
            .execute(
                "INSERT INTO auto_reply_rules (device_id, name, match_type, trigger_text, response, priority, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    device_id,
                    draft.name.as_str(),
                    draft.match_type.as_str(),
                    draft.trigger.as_str(),
                    draft.response.as_str(),
                    draft.priority,
                    draft.is_active as i64,
                    now,
                ],
            )
            .await
            .map_err(query_err("create_rule"))?;
        let id = self.conn().last_insert_rowid();

        self.fetch_rule(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "auto_reply_rule".into(),
            id: id.to_string(),
        })
    }

    async fn update_rule(
        &self,
        id: i64,
        draft: &RuleDraft,
    ) -> Result<Option<AutoReplyRule>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE auto_reply_rules
                 SET name = ?1, match_type = ?2, trigger_text = ?3, response = ?4, priority = ?5, is_active = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    draft.name.as_str(),
                    draft.match_type.as_str(),
                    draft.trigger.as_str(),
                    draft.response.as_str(),
                    draft.priority,
                    draft.is_active as i64,
                    fmt_ts(Utc::now()),
                    id,
                ],
            )
            .await
            .map_err(query_err("update_rule"))?;

        if changed == 0 {
            return Ok(None);
        }
        self.fetch_rule(id).await
    }

    async fn delete_rule(&self, id: i64) -> Result<Option<AutoReplyRule>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let Some(rule) = self.fetch_rule(id).await? else {
            return Ok(None);
        };
        self.conn()
            .execute("DELETE FROM auto_reply_rules WHERE id = ?1", params![id])
            .await
            .map_err(query_err("delete_rule"))?;
        Ok(Some(rule))
    }

    async fn get_rule(&self, id: i64) -> Result<Option<AutoReplyRule>, DatabaseError> {
        let _guard = self.gate.lock().await;
        self.fetch_rule(id).await
    }

    async fn list_rules(&self, device_id: &str) -> Result<Vec<AutoReplyRule>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM auto_reply_rules WHERE device_id = ?1 ORDER BY priority ASC, id ASC"
                ),
                params![device_id],
            )
            .await
            .map_err(query_err("list_rules"))?;

        collect_rows(rows, "list_rules", row_to_rule).await
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn get_conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE device_id = ?1 AND counterpart_id = ?2"
                ),
                params![key.device_id.as_str(), key.counterpart_id.as_str()],
            )
            .await
            .map_err(query_err("get_conversation"))?;

        match rows.next().await.map_err(query_err("get_conversation"))? {
            Some(row) => Ok(Some(row_to_conversation(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError> {
        let _guard = self.gate.lock().await;
        self.conn()
            .execute(
                "INSERT INTO conversations (device_id, counterpart_id, state, last_bot_activity_at, last_handoff_requested_at, last_message_at, handoff_reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(device_id, counterpart_id) DO UPDATE SET
                     state = excluded.state,
                     last_bot_activity_at = excluded.last_bot_activity_at,
                     last_handoff_requested_at = excluded.last_handoff_requested_at,
                     last_message_at = excluded.last_message_at,
                     handoff_reason = excluded.handoff_reason",
                params![
                    conversation.device_id.as_str(),
                    conversation.counterpart_id.as_str(),
                    conversation.state.as_str(),
                    opt_ts(conversation.last_bot_activity_at),
                    opt_ts(conversation.last_handoff_requested_at),
                    opt_ts(conversation.last_message_at),
                    opt_text(conversation.handoff_reason.as_deref()),
                    fmt_ts(conversation.created_at),
                ],
            )
            .await
            .map_err(query_err("upsert_conversation"))?;
        Ok(())
    }

    async fn list_conversations(
        &self,
        device_id: &str,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE device_id = ?1
                     ORDER BY COALESCE(last_message_at, created_at) DESC"
                ),
                params![device_id],
            )
            .await
            .map_err(query_err("list_conversations"))?;

        collect_rows(rows, "list_conversations", row_to_conversation).await
    }
}
