use actix_web::body::MessageBody;
use actix_web::dev::ServiceRequest;
use actix_web::dev::ServiceResponse;
use actix_web::web;
use actix_web::HttpMessage;
use actix_web::HttpRequest;
use actix_web_lab::middleware::Next;
use sha2::Digest;
use sha2::Sha256;

use crate::configuration::AuthSettings;
use crate::domain::TenantId;
use crate::domain::TenantRejection;
use crate::routes::ApiError;
use crate::tenant::TenantValidation;
use crate::tenant::TenantValidator;

/// The tenant a request acts for, parked in request extensions by the tenant
/// gate so handlers extract a validated id instead of a raw header.
#[derive(Clone, Copy)]
pub struct RequestTenant(pub TenantId);

const TENANT_HEADER: &str = "X-Tenant";

/// Tenant gate middleware: every request crossing it carries a well-formed,
/// allowlisted `X-Tenant` or is turned away (401 missing/malformed, 403
/// unknown).
pub async fn reject_invalid_tenants(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    let validator = req
        .app_data::<web::Data<TenantValidator>>()
        .ok_or_else(|| ApiError::internal("tenant validator not configured"))?;

    let header = req
        .headers()
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok());

    match validator.validate(header) {
        TenantValidation::Ok(tenant) => {
            req.extensions_mut().insert(RequestTenant(tenant));
            next.call(req).await
        }
        TenantValidation::Rejected(reason) => Err(ApiError::from(reason).into()),
    }
}

/// Bearer-token check for the write endpoints. The header must always be
/// present and well-formed; the token itself is only matched when a service
/// token list is configured.
pub fn require_service_token(req: &HttpRequest, auth: &AuthSettings) -> Result<(), ApiError> {
    let token = bearer_token(req)?;
    if !auth.service_token_accepted(token) {
        return Err(ApiError::unauthorized("invalid service token"));
    }
    Ok(())
}

/// Admin gate for the ops surface. Returns a hash of the acting token for
/// audit logs; raw tokens never reach a log line.
pub fn require_admin_token(req: &HttpRequest, auth: &AuthSettings) -> Result<String, ApiError> {
    let token = bearer_token(req)?;
    if !auth.admin_token_accepted(token) {
        return Err(ApiError::forbidden("forbidden", "admin token required"));
    }
    Ok(hash_actor_token(token))
}

fn bearer_token(req: &HttpRequest) -> Result<&str, ApiError> {
    let header = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing or invalid Authorization header"))?;
    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| ApiError::unauthorized("missing or invalid Authorization header"))?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(ApiError::unauthorized("missing or invalid Authorization header"));
    }
    Ok(token.trim())
}

pub fn hash_actor_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)[..12].to_owned()
}

impl From<TenantRejection> for ApiError {
    fn from(rejection: TenantRejection) -> Self {
        match rejection {
            TenantRejection::Missing => ApiError::unauthorized("missing X-Tenant header"),
            TenantRejection::Malformed => ApiError::unauthorized("X-Tenant is not a UUID"),
            TenantRejection::Unknown => {
                ApiError::forbidden("tenant_unknown", "tenant is not on the allowlist")
            }
        }
    }
}
