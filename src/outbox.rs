use serde_json::json;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::Sqlite;
use sqlx::SqlitePool;
use sqlx::Transaction;
use uuid::Uuid;

use crate::utils::now_ms;

pub const SCHEMA_VERSION: &str = "1.0";

/// Known event types on the bus. Plain strings on the wire; the constants
/// keep producers and consumers from drifting apart.
pub mod event_types {
    pub const INBOX_ITEM_VALIDATED: &str = "InboxItemValidated";
    pub const INBOX_ITEM_PARSED: &str = "InboxItemParsed";
    pub const INBOX_ITEM_PARSE_FAILED: &str = "InboxItemParseFailed";
    pub const INBOX_ITEM_ANALYSIS_READY: &str = "InboxItemAnalysisReady";
}

/// Lifecycle of an outbox row. `Processing` is owned by exactly one worker;
/// the only way back to `Pending` is a scheduled retry; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One durable event. `payload_json` stays serialized at rest; consumers
/// deserialize at the edge.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub schema_version: String,
    pub idempotency_key: Option<String>,
    pub trace_id: Option<String>,
    pub payload_json: String,
    pub status: EventStatus,
    pub attempt_count: i64,
    pub next_attempt_at: Option<i64>,
    pub created_at: i64,
}

impl OutboxEvent {
    pub fn payload(&self) -> Value {
        serde_json::from_str(&self.payload_json).unwrap_or(Value::Null)
    }

    /// The wire envelope delivered to external sinks.
    pub fn envelope(&self) -> Value {
        let mut envelope = json!({
            "id": &self.id,
            "tenant_id": &self.tenant_id,
            "event_type": &self.event_type,
            "schema_version": &self.schema_version,
            "payload": self.payload(),
        });
        if let Some(key) = &self.idempotency_key {
            envelope["idempotency_key"] = json!(key);
        }
        if let Some(trace) = &self.trace_id {
            envelope["trace_id"] = json!(trace);
        }
        envelope
    }

    /// Queue delay observed at lease time.
    pub fn lag_ms(&self, now: i64) -> i64 { (now - self.created_at).max(0) }
}

/// A to-be-enqueued event; id and timestamps are minted inside `enqueue` so
/// producers cannot disagree about them.
pub struct NewEvent<'a> {
    pub tenant_id: &'a str,
    pub event_type: &'a str,
    pub idempotency_key: Option<&'a str>,
    pub trace_id: Option<&'a str>,
    pub payload: &'a Value,
    pub delay_ms: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(String),
    /// The `(tenant, event_type, idempotency_key)` guard fired: an identical
    /// event is already on the bus.
    AlreadyEnqueued,
}

/// Append an event inside the caller's transaction, so the event exists iff
/// the business mutation commits.
pub async fn enqueue(
    txn: &mut Transaction<'_, Sqlite>,
    event: NewEvent<'_>,
) -> Result<EnqueueOutcome, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    let now = now_ms();
    let next_attempt_at = if event.delay_ms > 0 { Some(now + event.delay_ms) } else { None };
    let result = sqlx::query(
        r#"
        INSERT INTO event_outbox
            (id, tenant_id, event_type, schema_version, idempotency_key,
             trace_id, payload_json, status, attempt_count, next_attempt_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(event.tenant_id)
    .bind(event.event_type)
    .bind(SCHEMA_VERSION)
    .bind(event.idempotency_key)
    .bind(event.trace_id)
    .bind(event.payload.to_string())
    .bind(next_attempt_at)
    .bind(now)
    .execute(&mut **txn)
    .await;

    match result {
        Ok(_) => Ok(EnqueueOutcome::Enqueued(id)),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Ok(EnqueueOutcome::AlreadyEnqueued)
        }
        Err(e) => Err(e),
    }
}

/// Pending events whose retry time has come, oldest first. `event_type`
/// restricts the poll to one topic; `None` sees everything.
pub async fn due_events(
    pool: &SqlitePool,
    event_type: Option<&str>,
    limit: i64,
    now: i64,
) -> Result<Vec<OutboxEvent>, sqlx::Error> {
    let rows = match event_type {
        Some(event_type) => {
            sqlx::query(
                r#"
                SELECT id, tenant_id, event_type, schema_version, idempotency_key,
                       trace_id, payload_json, status, attempt_count, next_attempt_at, created_at
                FROM event_outbox
                WHERE event_type = ?
                  AND status = 'pending'
                  AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
                ORDER BY created_at, id
                LIMIT ?
                "#,
            )
            .bind(event_type)
            .bind(now)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                SELECT id, tenant_id, event_type, schema_version, idempotency_key,
                       trace_id, payload_json, status, attempt_count, next_attempt_at, created_at
                FROM event_outbox
                WHERE status = 'pending'
                  AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
                ORDER BY created_at, id
                LIMIT ?
                "#,
            )
            .bind(now)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    rows.into_iter().map(row_to_event).collect()
}

/// Claim an event: the conditional update from `pending` to `processing`.
/// Exactly one of any number of concurrent callers sees `true`.
pub async fn try_lease(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE event_outbox SET status = 'processing' WHERE id = ? AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(updated.rows_affected() > 0)
}

pub async fn mark_sent(pool: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE event_outbox SET status = 'sent' WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Put a leased event back on the bus with its retry bookkeeping.
pub async fn schedule_retry(
    pool: &SqlitePool,
    id: &str,
    attempt_count: i64,
    next_attempt_at: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE event_outbox
        SET status = 'pending', attempt_count = ?, next_attempt_at = ?
        WHERE id = ?
        "#,
    )
    .bind(attempt_count)
    .bind(next_attempt_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal routing: one dead letter, the source row marked `failed`, one
/// transaction.
pub async fn fail_with_dead_letter(
    pool: &SqlitePool,
    event: &OutboxEvent,
    reason: &str,
) -> Result<(), sqlx::Error> {
    let mut txn = pool.begin().await?;
    insert_dead_letter(&mut txn, &event.tenant_id, &event.event_type, reason, &event.payload_json)
        .await?;
    sqlx::query("UPDATE event_outbox SET status = 'failed' WHERE id = ?")
        .bind(&event.id)
        .execute(&mut *txn)
        .await?;
    txn.commit().await
}

pub async fn insert_dead_letter(
    txn: &mut Transaction<'_, Sqlite>,
    tenant_id: &str,
    event_type: &str,
    reason: &str,
    payload_json: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO dead_letters (id, tenant_id, event_type, reason, payload_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(tenant_id)
    .bind(event_type)
    .bind(reason)
    .bind(payload_json)
    .bind(now_ms())
    .execute(&mut **txn)
    .await?;
    Ok(())
}

/// Result of the first-class idempotency insert: handlers branch on this
/// value instead of catching constraint errors.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessedInsert {
    Inserted,
    AlreadyApplied,
}

/// Record `(tenant, event_type, idempotency_key)` in the processed ledger.
/// Once this row commits, the handler's side effects are sealed; a second
/// invocation sees `AlreadyApplied` and must do nothing.
pub async fn insert_processed_or_report(
    txn: &mut Transaction<'_, Sqlite>,
    tenant_id: &str,
    event_type: &str,
    idempotency_key: &str,
) -> Result<ProcessedInsert, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO processed_events (tenant_id, event_type, idempotency_key, created_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(tenant_id)
    .bind(event_type)
    .bind(idempotency_key)
    .bind(now_ms())
    .execute(&mut **txn)
    .await;

    match result {
        Ok(_) => Ok(ProcessedInsert::Inserted),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Ok(ProcessedInsert::AlreadyApplied)
        }
        Err(e) => Err(e),
    }
}

pub async fn get_event(pool: &SqlitePool, id: &str) -> Result<Option<OutboxEvent>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, tenant_id, event_type, schema_version, idempotency_key,
               trace_id, payload_json, status, attempt_count, next_attempt_at, created_at
        FROM event_outbox
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.map(row_to_event).transpose()
}

/// Per-status row counts, optionally scoped to one tenant (ops surface).
pub async fn status_counts(
    pool: &SqlitePool,
    tenant_id: Option<&str>,
) -> Result<Vec<(String, i64)>, sqlx::Error> {
    let rows = match tenant_id {
        Some(tenant) => {
            sqlx::query(
                "SELECT status, COUNT(*) AS cnt FROM event_outbox WHERE tenant_id = ? GROUP BY status",
            )
            .bind(tenant)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query("SELECT status, COUNT(*) AS cnt FROM event_outbox GROUP BY status")
                .fetch_all(pool)
                .await?
        }
    };
    rows.into_iter()
        .map(|row| Ok((row.try_get::<String, _>("status")?, row.try_get::<i64, _>("cnt")?)))
        .collect()
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub reason: String,
    pub payload_json: String,
    pub created_at: i64,
}

pub async fn list_dead_letters(
    pool: &SqlitePool,
    tenant_id: Option<&str>,
    limit: i64,
) -> Result<Vec<DeadLetter>, sqlx::Error> {
    let rows = match tenant_id {
        Some(tenant) => {
            sqlx::query(
                r#"
                SELECT id, tenant_id, event_type, reason, payload_json, created_at
                FROM dead_letters
                WHERE tenant_id = ?
                ORDER BY created_at DESC, id DESC
                LIMIT ?
                "#,
            )
            .bind(tenant)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                SELECT id, tenant_id, event_type, reason, payload_json, created_at
                FROM dead_letters
                ORDER BY created_at DESC, id DESC
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    rows.into_iter().map(row_to_dead_letter).collect()
}

#[derive(Debug, serde::Serialize, PartialEq, Eq)]
pub struct ReplayReport {
    pub selected: usize,
    pub committed: usize,
}

/// Operator replay: re-enqueue dead letters as fresh pending events (new id,
/// new trace, no idempotency key) and drop the dead-letter rows. `dry_run`
/// reports the selection and commits nothing.
pub async fn replay_dead_letters(
    pool: &SqlitePool,
    tenant_id: Option<&str>,
    ids: Option<&[String]>,
    limit: i64,
    dry_run: bool,
) -> Result<ReplayReport, sqlx::Error> {
    let mut candidates = list_dead_letters_for_replay(pool, tenant_id, limit).await?;
    if let Some(wanted) = ids {
        candidates.retain(|dl| wanted.contains(&dl.id));
    }
    let selected = candidates.len();
    if dry_run {
        return Ok(ReplayReport { selected, committed: 0 });
    }

    let mut committed = 0;
    let mut txn = pool.begin().await?;
    for dl in &candidates {
        let payload: Value = serde_json::from_str(&dl.payload_json).unwrap_or(Value::Null);
        enqueue(
            &mut txn,
            NewEvent {
                tenant_id: &dl.tenant_id,
                event_type: &dl.event_type,
                idempotency_key: None,
                trace_id: Some(&Uuid::new_v4().to_string()),
                payload: &payload,
                delay_ms: 0,
            },
        )
        .await?;
        sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(&dl.id)
            .execute(&mut *txn)
            .await?;
        committed += 1;
    }
    txn.commit().await?;
    Ok(ReplayReport { selected, committed })
}

async fn list_dead_letters_for_replay(
    pool: &SqlitePool,
    tenant_id: Option<&str>,
    limit: i64,
) -> Result<Vec<DeadLetter>, sqlx::Error> {
    // replay walks oldest-first, unlike the operator listing
    let rows = match tenant_id {
        Some(tenant) => {
            sqlx::query(
                r#"
                SELECT id, tenant_id, event_type, reason, payload_json, created_at
                FROM dead_letters
                WHERE tenant_id = ?
                ORDER BY created_at, id
                LIMIT ?
                "#,
            )
            .bind(tenant)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                SELECT id, tenant_id, event_type, reason, payload_json, created_at
                FROM dead_letters
                ORDER BY created_at, id
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    rows.into_iter().map(row_to_dead_letter).collect()
}

fn row_to_event(row: SqliteRow) -> Result<OutboxEvent, sqlx::Error> {
    let raw_status: String = row.try_get("status")?;
    let status = EventStatus::parse(&raw_status).ok_or_else(|| {
        sqlx::Error::Decode(format!("unknown outbox status {raw_status:?}").into())
    })?;
    Ok(OutboxEvent {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        event_type: row.try_get("event_type")?,
        schema_version: row.try_get("schema_version")?,
        idempotency_key: row.try_get("idempotency_key")?,
        trace_id: row.try_get("trace_id")?,
        payload_json: row.try_get("payload_json")?,
        status,
        attempt_count: row.try_get("attempt_count")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_dead_letter(row: SqliteRow) -> Result<DeadLetter, sqlx::Error> {
    Ok(DeadLetter {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        event_type: row.try_get("event_type")?,
        reason: row.try_get("reason")?,
        payload_json: row.try_get("payload_json")?,
        created_at: row.try_get("created_at")?,
    })
}
