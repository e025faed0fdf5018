use serde_json::json;
use serde_json::Value;

use crate::helpers::invoice_pdf;
use crate::helpers::spawn_app;

#[tokio::test]
async fn ops_surface_requires_an_admin_token() {
    let app = spawn_app().await;

    let resp = reqwest::Client::new()
        .get(format!("{}/api/v1/ops/outbox", app.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let resp = reqwest::Client::new()
        .get(format!("{}/api/v1/ops/outbox", app.addr))
        .bearer_auth("not-the-admin-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);
}

#[tokio::test]
async fn outbox_status_reports_per_status_counts() {
    let app = spawn_app().await;
    app.post_upload(invoice_pdf()).await;

    let resp = app.ops_get("outbox").await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["outbox"]["pending"], 1);

    app.parse_worker().run_once().await.unwrap();
    let body: Value = app.ops_get("outbox").await.json().await.unwrap();
    assert_eq!(body["outbox"]["sent"], 1);
    assert_eq!(body["outbox"]["pending"], 1); // the follow-on event
}

#[tokio::test]
async fn dlq_listing_shows_reasons() {
    let app = spawn_app().await;
    let stranger = uuid::Uuid::new_v4().to_string();
    app.seed_event(&stranger, "InboxItemValidated", Some("k"), json!({})).await;
    app.parse_worker().run_once().await.unwrap();

    let body: Value = app.ops_get("dlq").await.json().await.unwrap();
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["reason"], "tenant_unknown");
    assert_eq!(items[0]["event_type"], "InboxItemValidated");
}

#[tokio::test]
async fn dry_run_replay_selects_but_commits_nothing() {
    let app = spawn_app().await;
    let stranger = uuid::Uuid::new_v4().to_string();
    app.seed_event(&stranger, "InboxItemValidated", Some("k"), json!({"a": 1})).await;
    app.parse_worker().run_once().await.unwrap();
    assert_eq!(app.count("dead_letters").await, 1);
    assert_eq!(app.count("event_outbox").await, 1); // the failed source row

    let body: Value = app
        .ops_post("dlq/replay", json!({ "dry_run": true }))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["selected"], 1);
    assert_eq!(body["committed"], 0);

    // nothing moved
    assert_eq!(app.count("dead_letters").await, 1);
    assert_eq!(app.count("event_outbox").await, 1);
}

#[tokio::test]
async fn committed_replay_reenqueues_and_drains_the_dlq() {
    let app = spawn_app().await;
    let stranger = uuid::Uuid::new_v4().to_string();
    app.seed_event(&stranger, "InboxItemValidated", Some("k"), json!({"a": 1})).await;
    app.parse_worker().run_once().await.unwrap();

    let body: Value = app
        .ops_post("dlq/replay", json!({ "dry_run": false }))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["selected"], 1);
    assert_eq!(body["committed"], 1);

    assert_eq!(app.count("dead_letters").await, 0);
    // the original failed row plus the replayed pending one
    let (pending,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM event_outbox WHERE status = 'pending'")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(pending, 1);
    let (payload_json,): (String,) = sqlx::query_as(
        "SELECT payload_json FROM event_outbox WHERE status = 'pending'",
    )
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(serde_json::from_str::<Value>(&payload_json).unwrap(), json!({"a": 1}));
}

#[tokio::test]
async fn replay_defaults_to_dry_run() {
    let app = spawn_app().await;
    let stranger = uuid::Uuid::new_v4().to_string();
    app.seed_event(&stranger, "InboxItemValidated", Some("k"), json!({})).await;
    app.parse_worker().run_once().await.unwrap();

    let body: Value = app.ops_post("dlq/replay", json!({})).await.json().await.unwrap();
    assert_eq!(body["committed"], 0);
    assert_eq!(app.count("dead_letters").await, 1);
}

#[tokio::test]
async fn tenants_info_lists_the_allowlist() {
    let app = spawn_app().await;

    let body: Value = app.ops_get("tenants").await.json().await.unwrap();
    assert_eq!(body["source"], "inline");
    assert_eq!(body["count"], 1);
    assert_eq!(body["tenants"][0], Value::String(app.tenant.clone()));
}

#[tokio::test]
async fn metrics_snapshot_counts_ingest_activity() {
    let app = spawn_app().await;
    app.post_upload(invoice_pdf()).await;
    app.post_upload(invoice_pdf()).await; // dedupe hit

    let body: Value = app.ops_get("metrics").await.json().await.unwrap();
    // counters are process-global, so other tests may add to them; these can
    // only grow
    assert!(body["counters"]["inbox_received_total"].as_u64().unwrap() >= 2);
    assert!(body["counters"]["dedupe_hits_total"].as_u64().unwrap() >= 1);
}
