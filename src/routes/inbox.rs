use actix_web::web;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::authentication::require_service_token;
use crate::authentication::RequestTenant;
use crate::configuration::Settings;
use crate::domain::ClientFilename;
use crate::domain::SourceTag;
use crate::fetch::RemoteFetcher;
use crate::ingest;
use crate::ingest::IngestSubmission;
use crate::metrics;
use crate::read_model;
use crate::routes::chain_to_string;
use crate::routes::ApiError;
use crate::storage::ContentStore;
use secrecy::ExposeSecret;
use sqlx::SqlitePool;

#[derive(Serialize)]
pub struct UploadResponse {
    pub id: String,
    pub status: String,
    pub tenant_id: String,
    pub content_hash: String,
    pub uri: String,
    pub source: Option<String>,
    pub filename: Option<String>,
    pub mime: Option<String>,
    pub duplicate: bool,
}

impl UploadResponse {
    fn from_ingested(ingested: ingest::IngestedItem) -> Self {
        let item = ingested.item;
        Self {
            id: item.id,
            status: item.status,
            tenant_id: item.tenant_id,
            content_hash: item.content_hash,
            uri: item.uri,
            source: item.source,
            filename: item.filename,
            mime: item.mime,
            duplicate: ingested.duplicate,
        }
    }
}

fn header<'r>(req: &'r HttpRequest, name: &str) -> Option<&'r str> {
    req.headers().get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
}

fn trace_id(req: &HttpRequest) -> String {
    header(req, "X-Trace-ID").map(str::to_owned).unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// `POST /api/v1/inbox/items/upload` — raw-body upload. Filename and source
/// ride in headers; the body is the document.
pub async fn upload_item(
    req: HttpRequest,
    body: web::Bytes,
    pool: web::Data<SqlitePool>,
    store: web::Data<ContentStore>,
    settings: web::Data<Settings>,
    tenant: web::ReqData<RequestTenant>,
) -> Result<HttpResponse, ApiError> {
    require_service_token(&req, &settings.auth)?;
    let RequestTenant(tenant) = tenant.into_inner();

    let filename = match header(&req, "X-Filename") {
        Some(raw) => Some(
            ClientFilename::parse(raw.to_owned())
                .map_err(|e| ApiError::bad_request("validation_error", e))?,
        ),
        None => None,
    };
    let submission = IngestSubmission {
        tenant,
        data: body.to_vec(),
        source: SourceTag::parse(header(&req, "X-Source"), "upload").into(),
        filename: filename.map(Into::into),
        idempotency_key: header(&req, "Idempotency-Key").map(str::to_owned),
        trace_id: trace_id(&req),
    };

    let ingested = ingest::ingest_document(&pool, &store, &settings.ingest, submission).await?;
    Ok(HttpResponse::Ok().json(UploadResponse::from_ingested(ingested)))
}

#[derive(Deserialize)]
pub struct RemoteIngestRequest {
    pub remote_url: String,
    #[serde(default)]
    pub source: Option<String>,
}

/// `POST /api/v1/inbox/items` — programmatic ingest: pull a remote document
/// through the fetch policy, then run the same pipeline as an upload.
pub async fn ingest_remote(
    req: HttpRequest,
    body: web::Json<RemoteIngestRequest>,
    pool: web::Data<SqlitePool>,
    store: web::Data<ContentStore>,
    fetcher: web::Data<RemoteFetcher>,
    settings: web::Data<Settings>,
    tenant: web::ReqData<RequestTenant>,
) -> Result<HttpResponse, ApiError> {
    require_service_token(&req, &settings.auth)?;
    let RequestTenant(tenant) = tenant.into_inner();
    let trace = trace_id(&req);

    let started = std::time::Instant::now();
    let fetched = fetcher.fetch(&body.remote_url).await.map_err(|e| {
        tracing::warn!(
            trace_id = %trace,
            code = e.code(),
            error.cause_chain = %chain_to_string(&e),
            "remote fetch rejected"
        );
        ApiError::from(ingest::IngestError::Fetch(e))
    })?;
    metrics::global().fetch_duration.record(started.elapsed().as_millis() as u64);

    let submission = IngestSubmission {
        tenant,
        data: fetched.bytes,
        source: SourceTag::parse(body.source.as_deref(), "api").into(),
        filename: fetched
            .filename
            .and_then(|name| ClientFilename::parse(name).ok())
            .map(Into::into),
        idempotency_key: header(&req, "Idempotency-Key").map(str::to_owned),
        trace_id: trace,
    };

    let ingested = ingest::ingest_document(&pool, &store, &settings.ingest, submission).await?;
    Ok(HttpResponse::Ok().json(UploadResponse::from_ingested(ingested)))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Serialize)]
struct ListResponse {
    items: Vec<ingest::InboxItem>,
    next_cursor: Option<String>,
}

/// `GET /api/v1/inbox/items` — newest first, keyset-paginated behind a
/// signed cursor.
pub async fn list_items(
    query: web::Query<ListQuery>,
    pool: web::Data<SqlitePool>,
    settings: web::Data<Settings>,
    tenant: web::ReqData<RequestTenant>,
) -> Result<HttpResponse, ApiError> {
    let RequestTenant(tenant) = tenant.into_inner();
    let key = settings.read.cursor_hmac_key.expose_secret().as_bytes().to_vec();
    let limit = query.limit.unwrap_or(50).clamp(1, settings.read.max_limit);
    let after = query
        .cursor
        .as_deref()
        .map(|token| read_model::verify_cursor(&key, token))
        .transpose()?;

    let (items, next) =
        read_model::list_inbox_items(&pool, &tenant.to_string(), limit, after.as_ref()).await?;
    let next_cursor = next.map(|c| read_model::sign_cursor(&key, &c));
    Ok(HttpResponse::Ok().json(ListResponse { items, next_cursor }))
}
