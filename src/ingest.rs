use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use sha2::Digest;
use sha2::Sha256;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::Sqlite;
use sqlx::SqlitePool;
use sqlx::Transaction;
use uuid::Uuid;

use crate::configuration::IngestSettings;
use crate::domain::detect_mime;
use crate::domain::DocKind;
use crate::domain::TenantId;
use crate::fetch::FetchError;
use crate::metrics;
use crate::outbox;
use crate::outbox::event_types;
use crate::outbox::NewEvent;
use crate::storage::ContentStore;
use crate::storage::StorageError;
use crate::utils::now_ms;

/// An accepted document as persisted. `mime` is always the server-detected
/// value; the client's claim never reaches this record.
#[derive(Debug, Clone, Serialize)]
pub struct InboxItem {
    pub id: String,
    pub tenant_id: String,
    pub status: String,
    pub content_hash: String,
    pub uri: String,
    pub source: Option<String>,
    pub filename: Option<String>,
    pub mime: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug)]
pub struct IngestedItem {
    pub item: InboxItem,
    pub duplicate: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("payload exceeds the configured upload cap")]
    SizeLimit,
    #[error("detected MIME is not allowed by server policy")]
    UnsupportedMime,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("failed to persist content to storage")]
    Storage(#[source] StorageError),
    #[error("database error while persisting inbox item")]
    Database(#[from] sqlx::Error),
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SizeLimit => "size_limit",
            Self::UnsupportedMime => "unsupported_mime",
            Self::Fetch(e) => e.code(),
            Self::Storage(_) => "io_error",
            Self::Database(_) => "io_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::SizeLimit | Self::UnsupportedMime => 400,
            Self::Fetch(e) => e.http_status(),
            Self::Storage(_) | Self::Database(_) => 500,
        }
    }
}

/// One submission, whichever door it came through.
pub struct IngestSubmission {
    pub tenant: TenantId,
    pub data: Vec<u8>,
    pub source: String,
    pub filename: Option<String>,
    pub idempotency_key: Option<String>,
    pub trace_id: String,
}

/// The ingest pipeline: cap, detect, hash, store, then one transaction that
/// creates the item (received → validated) and enqueues
/// `InboxItemValidated`. Resubmitting identical bytes returns the existing
/// item flagged as a duplicate.
#[tracing::instrument(
    skip_all,
    fields(
        tenant_id = %submission.tenant,
        trace_id = %submission.trace_id,
        size = submission.data.len(),
        ingest_source = %submission.source,
    )
)]
pub async fn ingest_document(
    pool: &SqlitePool,
    store: &ContentStore,
    settings: &IngestSettings,
    submission: IngestSubmission,
) -> Result<IngestedItem, IngestError> {
    let started = Instant::now();
    metrics::global().incr_inbox_received();

    if submission.data.len() > settings.max_upload_bytes() {
        return Err(IngestError::SizeLimit);
    }

    let mime = detect_mime(&submission.data).filter(|m| settings.mime_allowed(m));
    let Some(mime) = mime else {
        return Err(IngestError::UnsupportedMime);
    };

    let content_hash = sha256_hex(&submission.data);
    let uri = store
        .put_bytes(
            &submission.tenant,
            &content_hash,
            DocKind::from_mime(mime).file_ext(),
            &submission.data,
        )
        .await
        .map_err(IngestError::Storage)?;

    let tenant_id = submission.tenant.to_string();
    let now = now_ms();
    let item = InboxItem {
        id: Uuid::new_v4().to_string(),
        tenant_id: tenant_id.clone(),
        status: "received".into(),
        content_hash: content_hash.clone(),
        uri: uri.clone(),
        source: Some(submission.source.clone()),
        filename: submission.filename.clone(),
        mime: Some(mime.to_owned()),
        created_at: now,
        updated_at: now,
    };

    let mut txn = pool.begin().await?;
    match insert_item(&mut txn, &item).await {
        Ok(()) => {}
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            // identical bytes already ingested for this tenant
            txn.rollback().await?;
            metrics::global().incr_dedupe_hits();
            let existing = get_item_by_hash(pool, &tenant_id, &content_hash)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
            tracing::info!(
                inbox_item_id = %existing.id,
                content_hash = %content_hash,
                "dedupe hit"
            );
            metrics::global().ingest_duration.record(started.elapsed().as_millis() as u64);
            return Ok(IngestedItem { item: existing, duplicate: true });
        }
        Err(e) => return Err(e.into()),
    }

    // received → validated before the event leaves the same transaction
    sqlx::query("UPDATE inbox_items SET status = 'validated', updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(&item.id)
        .execute(&mut *txn)
        .await?;

    let payload = json!({
        "inbox_item_id": &item.id,
        "content_hash": &content_hash,
        "uri": &uri,
        "source": &submission.source,
        "filename": &submission.filename,
        "mime": mime,
    });
    let idem_key = submission.idempotency_key.as_deref().unwrap_or(&content_hash);
    let enqueued = outbox::enqueue(
        &mut txn,
        NewEvent {
            tenant_id: &tenant_id,
            event_type: event_types::INBOX_ITEM_VALIDATED,
            idempotency_key: Some(idem_key),
            trace_id: Some(&submission.trace_id),
            payload: &payload,
            delay_ms: 0,
        },
    )
    .await?;
    txn.commit().await?;

    if enqueued == outbox::EnqueueOutcome::AlreadyEnqueued {
        tracing::info!(idempotency_key = idem_key, "event already enqueued, guard hit");
    }
    metrics::global().incr_inbox_validated();
    metrics::global().ingest_duration.record(started.elapsed().as_millis() as u64);

    let mut item = item;
    item.status = "validated".into();
    tracing::info!(inbox_item_id = %item.id, mime, "document validated");
    Ok(IngestedItem { item, duplicate: false })
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

async fn insert_item(
    txn: &mut Transaction<'_, Sqlite>,
    item: &InboxItem,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO inbox_items
            (id, tenant_id, status, content_hash, uri, source, filename, mime, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&item.id)
    .bind(&item.tenant_id)
    .bind(&item.status)
    .bind(&item.content_hash)
    .bind(&item.uri)
    .bind(&item.source)
    .bind(&item.filename)
    .bind(&item.mime)
    .bind(item.created_at)
    .bind(item.updated_at)
    .execute(&mut **txn)
    .await?;
    Ok(())
}

pub async fn get_item_by_hash(
    pool: &SqlitePool,
    tenant_id: &str,
    content_hash: &str,
) -> Result<Option<InboxItem>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, tenant_id, status, content_hash, uri, source, filename, mime,
               created_at, updated_at
        FROM inbox_items
        WHERE tenant_id = ? AND content_hash = ?
        "#,
    )
    .bind(tenant_id)
    .bind(content_hash)
    .fetch_optional(pool)
    .await?;
    row.map(row_to_item).transpose()
}

pub async fn get_item(
    pool: &SqlitePool,
    tenant_id: &str,
    id: &str,
) -> Result<Option<InboxItem>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, tenant_id, status, content_hash, uri, source, filename, mime,
               created_at, updated_at
        FROM inbox_items
        WHERE tenant_id = ? AND id = ?
        "#,
    )
    .bind(tenant_id)
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.map(row_to_item).transpose()
}

pub(crate) fn row_to_item(row: SqliteRow) -> Result<InboxItem, sqlx::Error> {
    Ok(InboxItem {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        status: row.try_get("status")?,
        content_hash: row.try_get("content_hash")?,
        uri: row.try_get("uri")?,
        source: row.try_get("source")?,
        filename: row.try_get("filename")?,
        mime: row.try_get("mime")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
