use serde_json::json;
use serde_json::Value;
use wiremock::matchers::header;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

use crate::helpers::invoice_pdf;
use crate::helpers::spawn_app;
use crate::helpers::spawn_app_with;
use crate::helpers::TestApp;
use docflow::configuration::Settings;
use docflow::configuration::TransportKind;

fn use_webhook(cfg: &mut Settings, url: &str) {
    cfg.publish.transport = TransportKind::Webhook;
    cfg.webhook.url = url.to_owned();
    // the mock server speaks plain http on loopback
    cfg.webhook.allow_http = true;
    cfg.publish.retry_max = 2;
    cfg.publish.backoff_steps = "0,0,0".into();
}

async fn seed_simple_event(app: &TestApp) -> String {
    app.seed_event(
        &app.tenant.clone(),
        "InboxItemParsed",
        Some("pub-idem-1"),
        json!({ "inbox_item_id": "i-1", "parsed_item_id": "p-1", "doc_type": "pdf" }),
    )
    .await
}

#[tokio::test]
async fn stdout_transport_marks_the_whole_chain_sent() {
    let app = spawn_app().await;
    app.post_upload(invoice_pdf()).await;

    app.parse_worker().run_once().await.unwrap();
    let parsed_event = app.pending_event_of_type("InboxItemParsed").await;

    let processed = app.publish_worker().run_once().await.unwrap();
    assert_eq!(processed, 1);

    assert_eq!(app.event_status(&parsed_event.id).await, "sent");
    // nothing pending, nothing failed
    let (pending,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM event_outbox WHERE status != 'sent'")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(pending, 0);
    assert_eq!(app.count("dead_letters").await, 0);
}

#[tokio::test]
async fn webhook_delivers_the_event_envelope() {
    let server = MockServer::start().await;
    let uri = format!("{}/hook", server.uri());
    let app = spawn_app_with(move |cfg| {
        use_webhook(cfg, &uri);
        cfg.webhook.headers_allowlist =
            "X-Env=test, Authorization=Bearer leaked, Cookie=session=1".into();
    })
    .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("X-Env", "test"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let event_id = seed_simple_event(&app).await;
    app.publish_worker().run_once().await.unwrap();

    assert_eq!(app.event_status(&event_id).await, "sent");
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    // forbidden headers never ride along
    assert!(requests[0].headers.get("Authorization").is_none());
    assert!(requests[0].headers.get("Cookie").is_none());
    let envelope: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(envelope["id"], Value::String(event_id));
    assert_eq!(envelope["event_type"], "InboxItemParsed");
    assert_eq!(envelope["schema_version"], "1.0");
    assert_eq!(envelope["idempotency_key"], "pub-idem-1");
    assert_eq!(envelope["payload"]["parsed_item_id"], "p-1");
    assert_eq!(envelope["tenant_id"], Value::String(app.tenant.clone()));
}

#[tokio::test]
async fn http_500_retries_until_the_dead_letter_queue() {
    let server = MockServer::start().await;
    let uri = format!("{}/hook", server.uri());
    let app = spawn_app_with(move |cfg| use_webhook(cfg, &uri)).await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let event_id = seed_simple_event(&app).await;
    let worker = app.publish_worker();

    // first failure: back on the bus with attempt 1
    worker.run_once().await.unwrap();
    assert_eq!(app.event_status(&event_id).await, "pending");

    // second failure exhausts retry_max = 2: failed plus a dead letter
    worker.run_once().await.unwrap();
    assert_eq!(app.event_status(&event_id).await, "failed");
    let (reason, event_type): (String, String) =
        sqlx::query_as("SELECT reason, event_type FROM dead_letters")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(reason, "http_500");
    assert_eq!(event_type, "InboxItemParsed");
}

#[tokio::test]
async fn status_codes_outside_the_success_set_fail() {
    let server = MockServer::start().await;
    let uri = format!("{}/hook", server.uri());
    let app = spawn_app_with(move |cfg| {
        use_webhook(cfg, &uri);
        // 299 is in, 300 is out
        cfg.webhook.success_codes = "200-299".into();
    })
    .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(300))
        .mount(&server)
        .await;

    let event_id = seed_simple_event(&app).await;
    app.publish_worker().run_once().await.unwrap();

    assert_eq!(app.event_status(&event_id).await, "pending");
    let (attempts,): (i64,) =
        sqlx::query_as("SELECT attempt_count FROM event_outbox WHERE id = ?")
            .bind(&event_id)
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn webhook_timeouts_are_retriable() {
    let server = MockServer::start().await;
    let uri = format!("{}/hook", server.uri());
    let app = spawn_app_with(move |cfg| {
        use_webhook(cfg, &uri);
        cfg.webhook.timeout_ms = 100;
    })
    .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(500)))
        .mount(&server)
        .await;

    let event_id = seed_simple_event(&app).await;
    app.publish_worker().run_once().await.unwrap();

    // timed out, scheduled again rather than dead-lettered
    assert_eq!(app.event_status(&event_id).await, "pending");
    assert_eq!(app.count("dead_letters").await, 0);
}

#[tokio::test]
async fn non_https_webhook_is_terminal_without_any_request() {
    let app = spawn_app_with(|cfg| {
        cfg.publish.transport = TransportKind::Webhook;
        cfg.webhook.url = "http://internal.host/hook".into();
        // allow_http stays false: plain http is a policy violation
    })
    .await;

    let event_id = seed_simple_event(&app).await;
    app.publish_worker().run_once().await.unwrap();

    assert_eq!(app.event_status(&event_id).await, "failed");
    let (reason,): (String,) = sqlx::query_as("SELECT reason FROM dead_letters")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(reason, "unsupported_scheme");
}

#[tokio::test]
async fn unknown_tenants_are_dead_lettered_before_delivery() {
    let server = MockServer::start().await;
    let uri = format!("{}/hook", server.uri());
    let app = spawn_app_with(move |cfg| use_webhook(cfg, &uri)).await;
    // no mock mounted: any request to the server would 404 and fail the test
    let stranger = uuid::Uuid::new_v4().to_string();
    let event_id = app
        .seed_event(&stranger, "InboxItemParsed", Some("x"), json!({}))
        .await;

    app.publish_worker().run_once().await.unwrap();

    assert_eq!(app.event_status(&event_id).await, "failed");
    let (reason,): (String,) = sqlx::query_as("SELECT reason FROM dead_letters")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(reason, "tenant_unknown");
    assert!(server.received_requests().await.unwrap().is_empty());
}
