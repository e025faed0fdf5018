use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::configuration::parse_backoff_steps;
use crate::configuration::Settings;
use crate::domain::DocKind;
use crate::metrics;
use crate::outbox;
use crate::outbox::event_types;
use crate::outbox::NewEvent;
use crate::outbox::OutboxEvent;
use crate::outbox::ProcessedInsert;
use crate::parsers;
use crate::parsers::ParseFault;
use crate::parsers::ParsedPayload;
use crate::startup::get_connection_pool;
use crate::startup::migrate;
use crate::storage::ContentStore;
use crate::tenant::TenantValidator;
use crate::utils::now_ms;
use crate::utils::parse_csv_list;
use crate::worker::EventHandler;
use crate::worker::FailureKind;
use crate::worker::HandlerOutcome;
use crate::worker::Worker;
use crate::worker::WorkerTuning;

/// Consumes `InboxItemValidated`: resolves the stored bytes, runs the routed
/// parser, persists `parsed_items` (+ chunks), advances the inbox item and
/// emits the follow-on event, all in one transaction sealed by the
/// processed-events ledger.
pub struct ParseHandler {
    pool: SqlitePool,
    max_bytes: usize,
    chunk_threshold: usize,
    mime_allowlist: Vec<String>,
}

/// The payload shape of `InboxItemValidated`.
#[derive(Deserialize)]
struct ValidatedPayload {
    inbox_item_id: String,
    #[serde(default)]
    content_hash: Option<String>,
    uri: String,
    #[serde(default)]
    mime: Option<String>,
}

impl ParseHandler {
    pub fn new(pool: SqlitePool, settings: &Settings) -> Self {
        Self {
            pool,
            max_bytes: settings.parser.max_bytes,
            chunk_threshold: settings.parser.chunk_threshold_bytes,
            mime_allowlist: parse_csv_list(&settings.ingest.mime_allowlist),
        }
    }

    async fn try_handle(&self, event: &OutboxEvent) -> HandlerOutcome {
        let payload: ValidatedPayload = match serde_json::from_str(&event.payload_json) {
            Ok(p) => p,
            Err(e) => {
                return HandlerOutcome::Terminal {
                    kind: FailureKind::ValidationError,
                    cause: format!("malformed event payload: {e}"),
                }
            }
        };
        // first available: explicit key, content hash, item id
        let idem_key = event
            .idempotency_key
            .clone()
            .or_else(|| payload.content_hash.clone())
            .unwrap_or_else(|| payload.inbox_item_id.clone());

        let mime = payload.mime.clone().unwrap_or_default();
        if !self.mime_allowlist.iter().any(|m| *m == mime) {
            return self
                .reject(event, &payload, &idem_key, FailureKind::UnsupportedMime)
                .await;
        }

        let data = match ContentStore::read_uri(&payload.uri).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error.cause_chain = ?e, uri = %payload.uri, "content read failed");
                return HandlerOutcome::Retriable { cause: FailureKind::IoError.as_str().into() };
            }
        };

        let kind = DocKind::from_mime(&mime);
        let started = Instant::now();
        let parsed = match parsers::parse_content(kind, &data, self.max_bytes) {
            Ok(parsed) => parsed,
            Err(ParseFault::TooLarge) => {
                return self
                    .reject(event, &payload, &idem_key, FailureKind::ValidationError)
                    .await;
            }
        };
        let parse_ms = started.elapsed().as_millis() as u64;

        match self.persist(event, &payload, &idem_key, kind, &parsed).await {
            Ok(outcome) => {
                metrics::global().parse_duration.record(parse_ms);
                metrics::global().incr_parsed_total();
                outcome
            }
            Err(e) => {
                tracing::warn!(error.cause_chain = ?e, "parse persistence failed");
                HandlerOutcome::Retriable { cause: FailureKind::IoError.as_str().into() }
            }
        }
    }

    /// Success path bookkeeping. Everything here commits together; the
    /// ledger insert runs first so a replay rolls back to a no-op.
    async fn persist(
        &self,
        event: &OutboxEvent,
        payload: &ValidatedPayload,
        idem_key: &str,
        kind: DocKind,
        parsed: &ParsedPayload,
    ) -> Result<HandlerOutcome, anyhow::Error> {
        let mut txn = self.pool.begin().await?;

        let inserted = outbox::insert_processed_or_report(
            &mut txn,
            &event.tenant_id,
            &event.event_type,
            idem_key,
        )
        .await?;
        if inserted == ProcessedInsert::AlreadyApplied {
            txn.rollback().await?;
            tracing::info!(idempotency_key = idem_key, "event already applied, skipping");
            return Ok(HandlerOutcome::Success);
        }

        let now = now_ms();
        let parsed_item_id = Uuid::new_v4().to_string();
        let serialized = serde_json::to_string(parsed)?;

        sqlx::query(
            r#"
            INSERT INTO parsed_items (id, tenant_id, inbox_item_id, payload_json, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&parsed_item_id)
        .bind(&event.tenant_id)
        .bind(&payload.inbox_item_id)
        .bind(&serialized)
        .bind(now)
        .execute(&mut *txn)
        .await?;

        let chunks = chunk_text(&serialized, self.chunk_threshold);
        let has_chunks = chunks.is_some();
        if let Some(chunks) = &chunks {
            for (i, text) in chunks.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO chunks
                        (id, tenant_id, parsed_item_id, inbox_item_id, seq_no, text, token_count, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&event.tenant_id)
                .bind(&parsed_item_id)
                .bind(&payload.inbox_item_id)
                .bind((i + 1) as i64)
                .bind(text)
                .bind(text.split_whitespace().count() as i64)
                .bind(now)
                .execute(&mut *txn)
                .await?;
            }
        }

        sqlx::query(
            "UPDATE inbox_items SET status = 'parsed', updated_at = ? WHERE id = ? AND tenant_id = ?",
        )
        .bind(now)
        .bind(&payload.inbox_item_id)
        .bind(&event.tenant_id)
        .execute(&mut *txn)
        .await?;

        let parsed_event = json!({
            "inbox_item_id": &payload.inbox_item_id,
            "parsed_item_id": &parsed_item_id,
            "doc_type": kind.as_str(),
            "has_chunks": has_chunks,
            "summary_fields": parsed.summary_fields(),
        });
        // duplicate guard may fire on replays; both outcomes are fine
        outbox::enqueue(
            &mut txn,
            NewEvent {
                tenant_id: &event.tenant_id,
                event_type: event_types::INBOX_ITEM_PARSED,
                idempotency_key: Some(idem_key),
                trace_id: event.trace_id.as_deref(),
                payload: &parsed_event,
                delay_ms: 0,
            },
        )
        .await?;

        txn.commit().await?;
        tracing::info!(
            inbox_item_id = %payload.inbox_item_id,
            parsed_item_id = %parsed_item_id,
            doc_type = kind.as_str(),
            has_chunks,
            "document parsed"
        );
        Ok(HandlerOutcome::Success)
    }

    /// Non-retriable content faults still advance the inbox item to `error`
    /// and announce the failure before the loop dead-letters the event.
    async fn reject(
        &self,
        event: &OutboxEvent,
        payload: &ValidatedPayload,
        idem_key: &str,
        kind: FailureKind,
    ) -> HandlerOutcome {
        let result: Result<(), anyhow::Error> = async {
            let mut txn = self.pool.begin().await?;
            // status only moves forward; a parsed item never regresses to error
            sqlx::query(
                "UPDATE inbox_items SET status = 'error', updated_at = ? \
                 WHERE id = ? AND tenant_id = ? AND status != 'parsed'",
            )
            .bind(now_ms())
            .bind(&payload.inbox_item_id)
            .bind(&event.tenant_id)
            .execute(&mut *txn)
            .await?;
            let failure_event = json!({
                "inbox_item_id": &payload.inbox_item_id,
                "reason": kind.as_str(),
                "error_class": "validation_error",
                "retriable": false,
            });
            outbox::enqueue(
                &mut txn,
                NewEvent {
                    tenant_id: &event.tenant_id,
                    event_type: event_types::INBOX_ITEM_PARSE_FAILED,
                    idempotency_key: Some(idem_key),
                    trace_id: event.trace_id.as_deref(),
                    payload: &failure_event,
                    delay_ms: 0,
                },
            )
            .await?;
            txn.commit().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(error.cause_chain = ?e, "parse-failure bookkeeping failed");
            return HandlerOutcome::Retriable { cause: FailureKind::IoError.as_str().into() };
        }
        metrics::global().incr_parse_failures();
        HandlerOutcome::Terminal { kind, cause: kind.as_str().into() }
    }
}

impl EventHandler for ParseHandler {
    fn name(&self) -> &'static str { "inbox-worker" }

    fn event_filter(&self) -> Option<&'static str> { Some(event_types::INBOX_ITEM_VALIDATED) }

    async fn handle(&self, event: &OutboxEvent) -> HandlerOutcome {
        self.try_handle(event).await
    }
}

/// Fixed-byte chunking of an oversized serialized payload. `None` when the
/// text fits the threshold. Chunks never split a UTF-8 scalar; a single
/// scalar wider than the threshold gets its own chunk.
pub fn chunk_text(text: &str, threshold: usize) -> Option<Vec<String>> {
    if threshold == 0 || text.len() <= threshold {
        return None;
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    for (idx, ch) in text.char_indices() {
        if idx + ch.len_utf8() - start > threshold && idx > start {
            chunks.push(text[start..idx].to_owned());
            start = idx;
        }
    }
    chunks.push(text[start..].to_owned());
    Some(chunks)
}

pub fn worker_tuning(settings: &Settings) -> WorkerTuning {
    WorkerTuning {
        batch_size: settings.parser.batch_size,
        poll_interval: std::time::Duration::from_millis(settings.parser.poll_interval_ms),
        backoff_steps: parse_backoff_steps(&settings.parser.backoff_steps),
        retry_max: settings.parser.retry_max,
    }
}

pub fn build_worker(
    pool: SqlitePool,
    tenants: Arc<TenantValidator>,
    settings: &Settings,
) -> Worker<ParseHandler> {
    let handler = ParseHandler::new(pool.clone(), settings);
    Worker::new(pool, tenants, worker_tuning(settings), handler)
}

/// Fatal configuration checks; the binary exits 1 when these fail.
pub fn preflight(settings: &Settings) -> Result<(), anyhow::Error> {
    if settings.database.path.trim().is_empty() {
        anyhow::bail!("database path is not configured");
    }
    Ok(())
}

/// Entry point of the `inbox-worker` binary and the combined process.
pub async fn run_until_stopped(settings: Settings, service_mode: bool) -> Result<(), anyhow::Error> {
    let pool = get_connection_pool(&settings.database);
    migrate(&pool).await?;
    let tenants = Arc::new(TenantValidator::new(
        settings.tenants.clone(),
        settings.application.env.is_development(),
    ));
    build_worker(pool, tenants, &settings).run(service_mode).await
}
