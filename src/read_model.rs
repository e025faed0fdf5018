use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::Hmac;
use hmac::Mac;
use serde::Deserialize;
use serde::Serialize;
use sha2::Sha256;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::SqlitePool;

use crate::ingest::row_to_item;
use crate::ingest::InboxItem;

type HmacSha256 = Hmac<Sha256>;

/// Keyset-pagination position over `(created_at, id)`, handed to clients as
/// an HMAC-signed opaque token so it cannot be forged or replayed across
/// deployments with different keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: i64,
    pub id: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor signature invalid")]
    BadSignature,
    #[error("cursor malformed")]
    Malformed,
}

/// Token layout: JSON payload followed by its 32-byte HMAC-SHA256 tag,
/// base64url-encoded. The tag length is fixed, so no separator is needed
/// (raw tag bytes could collide with any separator byte).
pub fn sign_cursor(key: &[u8], cursor: &Cursor) -> String {
    let payload = serde_json::to_vec(cursor).expect("cursor serialization cannot fail");
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&payload);
    let sig = mac.finalize().into_bytes();
    let mut raw = payload;
    raw.extend_from_slice(&sig);
    URL_SAFE_NO_PAD.encode(raw)
}

const SIG_LEN: usize = 32;

pub fn verify_cursor(key: &[u8], token: &str) -> Result<Cursor, CursorError> {
    let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| CursorError::Malformed)?;
    let split = raw.len().checked_sub(SIG_LEN).ok_or(CursorError::Malformed)?;
    let (payload, sig) = raw.split_at(split);
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(payload);
    mac.verify_slice(sig).map_err(|_| CursorError::BadSignature)?;
    serde_json::from_slice(payload).map_err(|_| CursorError::Malformed)
}

/// One page of inbox items, newest first, with the cursor for the next page
/// when the page was full.
pub async fn list_inbox_items(
    pool: &SqlitePool,
    tenant_id: &str,
    limit: i64,
    after: Option<&Cursor>,
) -> Result<(Vec<InboxItem>, Option<Cursor>), sqlx::Error> {
    let rows = match after {
        Some(cursor) => {
            sqlx::query(
                r#"
                SELECT id, tenant_id, status, content_hash, uri, source, filename, mime,
                       created_at, updated_at
                FROM inbox_items
                WHERE tenant_id = ?
                  AND (created_at < ? OR (created_at = ? AND id < ?))
                ORDER BY created_at DESC, id DESC
                LIMIT ?
                "#,
            )
            .bind(tenant_id)
            .bind(cursor.created_at)
            .bind(cursor.created_at)
            .bind(&cursor.id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                SELECT id, tenant_id, status, content_hash, uri, source, filename, mime,
                       created_at, updated_at
                FROM inbox_items
                WHERE tenant_id = ?
                ORDER BY created_at DESC, id DESC
                LIMIT ?
                "#,
            )
            .bind(tenant_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    let items: Vec<InboxItem> =
        rows.into_iter().map(row_to_item).collect::<Result<_, _>>()?;
    let next = (items.len() as i64 == limit)
        .then(|| items.last())
        .flatten()
        .map(|last| Cursor { created_at: last.created_at, id: last.id.clone() });
    Ok((items, next))
}

/// Latest parsed item per `(tenant, content_hash)`, projected from the
/// read-model view.
#[derive(Debug, Clone, Serialize)]
pub struct ParsedLatestRow {
    pub id: String,
    pub tenant_id: String,
    pub inbox_item_id: String,
    pub content_hash: String,
    pub doc_type: Option<String>,
    pub invoice_no: Option<String>,
    pub amount: Option<String>,
    pub due_date: Option<String>,
    pub created_at: i64,
}

pub async fn latest_parsed(
    pool: &SqlitePool,
    tenant_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<ParsedLatestRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, tenant_id, inbox_item_id, content_hash, doc_type, invoice_no,
               amount, due_date, created_at
        FROM v_parsed_latest
        WHERE tenant_id = ?
        ORDER BY created_at DESC, id DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(tenant_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(row_to_parsed).collect()
}

pub async fn items_needing_review(
    pool: &SqlitePool,
    tenant_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<ParsedLatestRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, tenant_id, inbox_item_id, content_hash, doc_type, invoice_no,
               amount, due_date, created_at
        FROM v_items_needing_review
        WHERE tenant_id = ?
        ORDER BY created_at DESC, id DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(tenant_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(row_to_parsed).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantSummary {
    pub tenant_id: String,
    pub cnt_items: i64,
    pub cnt_parsed: i64,
    pub cnt_invoices: i64,
    pub cnt_needing_review: i64,
}

pub async fn tenant_summary(
    pool: &SqlitePool,
    tenant_id: &str,
) -> Result<Option<TenantSummary>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT tenant_id, cnt_items, cnt_parsed, cnt_invoices, cnt_needing_review
        FROM v_tenant_summary
        WHERE tenant_id = ?
        "#,
    )
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;
    row.map(|row| {
        Ok(TenantSummary {
            tenant_id: row.try_get("tenant_id")?,
            cnt_items: row.try_get("cnt_items")?,
            cnt_parsed: row.try_get("cnt_parsed")?,
            cnt_invoices: row.try_get("cnt_invoices")?,
            cnt_needing_review: row.try_get("cnt_needing_review")?,
        })
    })
    .transpose()
}

fn row_to_parsed(row: SqliteRow) -> Result<ParsedLatestRow, sqlx::Error> {
    Ok(ParsedLatestRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        inbox_item_id: row.try_get("inbox_item_id")?,
        content_hash: row.try_get("content_hash")?,
        doc_type: row.try_get("doc_type")?,
        invoice_no: row.try_get("invoice_no")?,
        amount: row.try_get("amount")?,
        due_date: row.try_get("due_date")?,
        created_at: row.try_get("created_at")?,
    })
}
