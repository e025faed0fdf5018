mod health_check;
mod inbox;
mod ops;
mod read;

pub use health_check::health_check;
pub use inbox::ingest_remote;
pub use inbox::list_items;
pub use inbox::upload_item;
pub use ops::dlq_list;
pub use ops::dlq_replay;
pub use ops::metrics_snapshot;
pub use ops::outbox_status;
pub use ops::tenants_info;
pub use read::parsed_latest;
pub use read::parsed_review;
pub use read::tenant_summary;

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde_json::json;

use crate::ingest::IngestError;
use crate::read_model::CursorError;
use crate::utils::error_chain_fmt;

/// API-facing error: a stable machine code plus a human detail, rendered as
/// `{"error": code, "detail": ...}` with the matching status.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self { status, code, detail: detail.into() }
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", detail)
    }

    pub fn forbidden(code: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, code, detail)
    }

    pub fn bad_request(code: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "io_error", detail)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}

impl std::fmt::Debug for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ApiError({} {}): {}", self.status, self.code, self.detail)
    }
}

impl std::error::Error for ApiError {}

impl actix_web::ResponseError for ApiError {
    fn status_code(&self) -> StatusCode { self.status }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status)
            .json(json!({ "error": self.code, "detail": self.detail }))
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        let status = StatusCode::from_u16(e.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, e.code(), e.to_string())
    }
}

impl From<CursorError> for ApiError {
    fn from(e: CursorError) -> Self { Self::bad_request("invalid_cursor", e.to_string()) }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!(error.message = %e, "database error");
        Self::internal("database error")
    }
}

/// Debug-render an error chain into a string for log fields.
pub(crate) fn chain_to_string(e: &impl std::error::Error) -> String {
    struct Wrapper<'a, E: std::error::Error>(&'a E);
    impl<E: std::error::Error> std::fmt::Display for Wrapper<'_, E> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            error_chain_fmt(self.0, f)
        }
    }
    Wrapper(e).to_string()
}
