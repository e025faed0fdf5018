use actix_web::web;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use serde::Deserialize;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::authentication::require_admin_token;
use crate::configuration::Settings;
use crate::metrics;
use crate::outbox;
use crate::routes::ApiError;
use crate::tenant::TenantValidator;
use crate::utils::rfc3339_from_ms;

fn tenant_scope(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("X-Tenant")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != "*")
        .map(str::to_owned)
}

/// `GET /api/v1/ops/outbox` — per-status event counts, optionally scoped to
/// the `X-Tenant` header.
pub async fn outbox_status(
    req: HttpRequest,
    pool: web::Data<SqlitePool>,
    settings: web::Data<Settings>,
) -> Result<HttpResponse, ApiError> {
    let actor = require_admin_token(&req, &settings.auth)?;
    let scope = tenant_scope(&req);
    let counts = outbox::status_counts(&pool, scope.as_deref()).await?;
    let mut by_status = Map::new();
    for (status, count) in counts {
        by_status.insert(status, Value::from(count));
    }
    tracing::info!(actor_token_hash = %actor, tenant_id = scope.as_deref().unwrap_or("*"), "outbox status read");
    Ok(HttpResponse::Ok().json(json!({ "outbox": by_status })))
}

/// `GET /api/v1/ops/dlq` — most recent dead letters.
pub async fn dlq_list(
    req: HttpRequest,
    query: web::Query<DlqQuery>,
    pool: web::Data<SqlitePool>,
    settings: web::Data<Settings>,
) -> Result<HttpResponse, ApiError> {
    let actor = require_admin_token(&req, &settings.auth)?;
    let scope = tenant_scope(&req);
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);
    let letters = outbox::list_dead_letters(&pool, scope.as_deref(), limit).await?;
    let items: Vec<Value> = letters
        .iter()
        .map(|dl| {
            json!({
                "id": &dl.id,
                "tenant_id": &dl.tenant_id,
                "event_type": &dl.event_type,
                "reason": &dl.reason,
                "created_at": rfc3339_from_ms(dl.created_at),
            })
        })
        .collect();
    tracing::info!(
        actor_token_hash = %actor,
        tenant_id = scope.as_deref().unwrap_or("*"),
        result_count = items.len(),
        "dead letters listed"
    );
    Ok(HttpResponse::Ok().json(json!({ "items": items })))
}

#[derive(Deserialize)]
pub struct DlqQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct ReplayRequest {
    #[serde(default)]
    pub ids: Option<Vec<String>>,
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    #[serde(default)]
    pub limit: Option<i64>,
}

fn default_dry_run() -> bool { true }

/// `POST /api/v1/ops/dlq/replay` — re-enqueue dead letters. Defaults to a
/// dry run, which selects and commits nothing.
pub async fn dlq_replay(
    req: HttpRequest,
    body: web::Json<ReplayRequest>,
    pool: web::Data<SqlitePool>,
    settings: web::Data<Settings>,
) -> Result<HttpResponse, ApiError> {
    let actor = require_admin_token(&req, &settings.auth)?;
    let scope = tenant_scope(&req);
    let limit = body.limit.unwrap_or(50).clamp(1, 1000);

    let report = outbox::replay_dead_letters(
        &pool,
        scope.as_deref(),
        body.ids.as_deref(),
        limit,
        body.dry_run,
    )
    .await?;

    metrics::global().incr_ops_replay_attempts(report.selected as u64);
    metrics::global().incr_ops_replay_committed(report.committed as u64);
    tracing::info!(
        actor_token_hash = %actor,
        tenant_id = scope.as_deref().unwrap_or("*"),
        selected = report.selected,
        committed = report.committed,
        dry_run = body.dry_run,
        "dead-letter replay"
    );
    Ok(HttpResponse::Ok().json(report))
}

/// `GET /api/v1/ops/tenants` — allowlist source, version and membership.
pub async fn tenants_info(
    req: HttpRequest,
    validator: web::Data<TenantValidator>,
    settings: web::Data<Settings>,
) -> Result<HttpResponse, ApiError> {
    let actor = require_admin_token(&req, &settings.auth)?;
    let info = validator.info();
    tracing::info!(actor_token_hash = %actor, count = info.count, source = info.source, "tenant allowlist read");
    Ok(HttpResponse::Ok().json(json!({
        "source": info.source,
        "version": info.version,
        "count": info.count,
        "tenants": info.tenants,
    })))
}

/// `GET /api/v1/ops/metrics` — counter snapshot.
pub async fn metrics_snapshot(
    req: HttpRequest,
    settings: web::Data<Settings>,
) -> Result<HttpResponse, ApiError> {
    require_admin_token(&req, &settings.auth)?;
    Ok(HttpResponse::Ok().json(metrics::global().snapshot()))
}
