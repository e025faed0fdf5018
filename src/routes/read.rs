use actix_web::web;
use actix_web::HttpResponse;
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;

use crate::authentication::RequestTenant;
use crate::configuration::Settings;
use crate::read_model;
use crate::routes::ApiError;

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl PageQuery {
    fn bounds(&self, max_limit: i64) -> (i64, i64) {
        (self.limit.unwrap_or(50).clamp(1, max_limit), self.offset.unwrap_or(0).max(0))
    }
}

/// `GET /api/v1/read/parsed` — latest parsed item per content hash.
pub async fn parsed_latest(
    query: web::Query<PageQuery>,
    pool: web::Data<SqlitePool>,
    settings: web::Data<Settings>,
    tenant: web::ReqData<RequestTenant>,
) -> Result<HttpResponse, ApiError> {
    let RequestTenant(tenant) = tenant.into_inner();
    let (limit, offset) = query.bounds(settings.read.max_limit);
    let items = read_model::latest_parsed(&pool, &tenant.to_string(), limit, offset).await?;
    Ok(HttpResponse::Ok().json(json!({ "items": items })))
}

/// `GET /api/v1/read/review` — parsed items with nothing usable extracted.
pub async fn parsed_review(
    query: web::Query<PageQuery>,
    pool: web::Data<SqlitePool>,
    settings: web::Data<Settings>,
    tenant: web::ReqData<RequestTenant>,
) -> Result<HttpResponse, ApiError> {
    let RequestTenant(tenant) = tenant.into_inner();
    let (limit, offset) = query.bounds(settings.read.max_limit);
    let items =
        read_model::items_needing_review(&pool, &tenant.to_string(), limit, offset).await?;
    Ok(HttpResponse::Ok().json(json!({ "items": items })))
}

/// `GET /api/v1/read/summary` — per-tenant counts.
pub async fn tenant_summary(
    pool: web::Data<SqlitePool>,
    tenant: web::ReqData<RequestTenant>,
) -> Result<HttpResponse, ApiError> {
    let RequestTenant(tenant) = tenant.into_inner();
    let summary = read_model::tenant_summary(&pool, &tenant.to_string()).await?;
    Ok(HttpResponse::Ok().json(json!({ "summary": summary })))
}
