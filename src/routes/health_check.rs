use actix_web::HttpResponse;

/// Liveness probe; no dependencies touched.
pub async fn health_check() -> HttpResponse { HttpResponse::Ok().finish() }
