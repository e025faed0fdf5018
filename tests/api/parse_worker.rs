use serde_json::json;
use serde_json::Value;
use uuid::Uuid;

use crate::helpers::invoice_pdf;
use crate::helpers::spawn_app;
use crate::helpers::spawn_app_with;

#[tokio::test]
async fn validated_documents_are_parsed_end_to_end() {
    let app = spawn_app().await;
    let upload: Value = app.post_upload(invoice_pdf()).await.json().await.unwrap();
    let source_event = app.pending_event_of_type("InboxItemValidated").await;

    let processed = app.parse_worker().run_once().await.unwrap();
    assert_eq!(processed, 1);

    // business rows
    assert_eq!(app.count("parsed_items").await, 1);
    assert_eq!(app.count("processed_events").await, 1);
    let (status, payload_json): (String, String) = sqlx::query_as(
        "SELECT i.status, p.payload_json FROM inbox_items i JOIN parsed_items p ON p.inbox_item_id = i.id",
    )
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(status, "parsed");
    let payload: Value = serde_json::from_str(&payload_json).unwrap();
    assert_eq!(payload["doc_type"], "pdf");
    assert_eq!(payload["invoice_no"], "INV-2024-001");
    assert_eq!(payload["amount"], "1.234,56");

    // source event sealed, follow-on enqueued
    assert_eq!(app.event_status(&source_event.id).await, "sent");
    let parsed_event = app.pending_event_of_type("InboxItemParsed").await;
    assert_eq!(parsed_event.payload()["inbox_item_id"], upload["id"]);
    assert_eq!(parsed_event.payload()["doc_type"], "pdf");
    assert_eq!(parsed_event.payload()["has_chunks"], false);
    assert_eq!(parsed_event.payload()["summary_fields"]["invoice_no"], "INV-2024-001");
}

#[tokio::test]
async fn oversized_payloads_are_chunked_in_order() {
    // a chunk threshold smaller than the serialized payload forces chunking
    let app = spawn_app_with(|cfg| cfg.parser.chunk_threshold_bytes = 16).await;
    app.post_upload(invoice_pdf()).await;

    app.parse_worker().run_once().await.unwrap();

    let chunks: Vec<(i64, String)> =
        sqlx::query_as("SELECT seq_no, text FROM chunks ORDER BY seq_no")
            .fetch_all(&app.pool)
            .await
            .unwrap();
    assert!(chunks.len() > 1);
    for (i, (seq_no, text)) in chunks.iter().enumerate() {
        assert_eq!(*seq_no, (i + 1) as i64);
        assert!(text.len() <= 16);
    }
    let reassembled: String = chunks.iter().map(|(_, t)| t.as_str()).collect();
    let (payload_json,): (String,) = sqlx::query_as("SELECT payload_json FROM parsed_items")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(reassembled, payload_json);

    let parsed_event = app.pending_event_of_type("InboxItemParsed").await;
    assert_eq!(parsed_event.payload()["has_chunks"], true);
}

#[tokio::test]
async fn unknown_tenants_are_dead_lettered_at_lease_time() {
    let app = spawn_app().await;
    let stranger = Uuid::new_v4().to_string();
    let event_id = app
        .seed_event(
            &stranger,
            "InboxItemValidated",
            Some("idem-1"),
            json!({ "inbox_item_id": "i-1", "uri": "file:///nowhere", "mime": "application/pdf" }),
        )
        .await;

    let processed = app.parse_worker().run_once().await.unwrap();
    assert_eq!(processed, 1);

    assert_eq!(app.event_status(&event_id).await, "failed");
    let (reason, tenant_id): (String, String) =
        sqlx::query_as("SELECT reason, tenant_id FROM dead_letters")
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(reason, "tenant_unknown");
    assert_eq!(tenant_id, stranger);
    assert_eq!(app.count("parsed_items").await, 0);
    assert_eq!(app.count("processed_events").await, 0);
}

#[tokio::test]
async fn replayed_idempotency_keys_apply_side_effects_once() {
    let app = spawn_app().await;
    let upload: Value = app.post_upload(invoice_pdf()).await.json().await.unwrap();
    let first = app.pending_event_of_type("InboxItemValidated").await;

    // a second event for the same document: no explicit key, so the worker
    // derives the same one from the content hash
    let second_id = app
        .seed_event(
            &app.tenant.clone(),
            "InboxItemValidated",
            None,
            json!({
                "inbox_item_id": upload["id"],
                "content_hash": upload["content_hash"],
                "uri": upload["uri"],
                "mime": "application/pdf",
            }),
        )
        .await;

    let processed = app.parse_worker().run_once().await.unwrap();
    assert_eq!(processed, 2);

    // both sealed, side effects applied exactly once
    assert_eq!(app.event_status(&first.id).await, "sent");
    assert_eq!(app.event_status(&second_id).await, "sent");
    assert_eq!(app.count("parsed_items").await, 1);
    assert_eq!(app.count("processed_events").await, 1);
}

#[tokio::test]
async fn disallowed_mime_at_parse_time_is_terminal() {
    let app = spawn_app().await;
    let upload: Value = app.post_upload(invoice_pdf()).await.json().await.unwrap();
    // drop the genuine event; seed one claiming a mime outside the allowlist
    sqlx::query("DELETE FROM event_outbox").execute(&app.pool).await.unwrap();
    let event_id = app
        .seed_event(
            &app.tenant.clone(),
            "InboxItemValidated",
            Some("idem-mime"),
            json!({
                "inbox_item_id": upload["id"],
                "uri": upload["uri"],
                "mime": "text/plain",
            }),
        )
        .await;

    app.parse_worker().run_once().await.unwrap();

    assert_eq!(app.event_status(&event_id).await, "failed");
    let (reason,): (String,) = sqlx::query_as("SELECT reason FROM dead_letters")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(reason, "unsupported_mime");

    // the item is in error and the failure was announced
    let (status,): (String,) = sqlx::query_as("SELECT status FROM inbox_items")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(status, "error");
    let failed_event = app.pending_event_of_type("InboxItemParseFailed").await;
    assert_eq!(failed_event.payload()["reason"], "unsupported_mime");
    assert_eq!(failed_event.payload()["retriable"], false);
    assert_eq!(app.count("parsed_items").await, 0);
}

#[tokio::test]
async fn unreadable_content_retries_then_dead_letters() {
    let app = spawn_app_with(|cfg| {
        cfg.parser.retry_max = 2;
        cfg.parser.backoff_steps = "0,0,0".into();
    })
    .await;
    let event_id = app
        .seed_event(
            &app.tenant.clone(),
            "InboxItemValidated",
            Some("idem-io"),
            json!({
                "inbox_item_id": "i-io",
                "uri": "file:///definitely/not/there.pdf",
                "mime": "application/pdf",
            }),
        )
        .await;
    let worker = app.parse_worker();

    // first failure schedules an immediate retry
    worker.run_once().await.unwrap();
    assert_eq!(app.event_status(&event_id).await, "pending");
    let (attempts,): (i64,) =
        sqlx::query_as("SELECT attempt_count FROM event_outbox WHERE id = ?")
            .bind(&event_id)
            .fetch_one(&app.pool)
            .await
            .unwrap();
    assert_eq!(attempts, 1);

    // second failure exhausts retry_max = 2
    worker.run_once().await.unwrap();
    assert_eq!(app.event_status(&event_id).await, "failed");
    let (reason,): (String,) = sqlx::query_as("SELECT reason FROM dead_letters")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(reason, "io_error");
    assert_eq!(app.count("processed_events").await, 0);
}
