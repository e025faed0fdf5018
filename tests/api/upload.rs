use docflow::storage::ContentStore;
use serde_json::Value;
use uuid::Uuid;

use crate::helpers::invoice_pdf;
use crate::helpers::spawn_app;
use crate::helpers::spawn_app_with;
use crate::helpers::SERVICE_TOKEN;

#[tokio::test]
async fn upload_returns_a_validated_item_and_enqueues_the_event() {
    let app = spawn_app().await;

    let resp = app.post_upload(invoice_pdf()).await;

    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "validated");
    assert_eq!(body["duplicate"], false);
    assert_eq!(body["tenant_id"], Value::String(app.tenant.clone()));
    assert_eq!(body["mime"], "application/pdf");
    assert_eq!(body["content_hash"].as_str().unwrap().len(), 64);

    assert_eq!(app.count("inbox_items").await, 1);
    assert_eq!(app.count("event_outbox").await, 1);
    let event = app.pending_event_of_type("InboxItemValidated").await;
    assert_eq!(event.tenant_id, app.tenant);
    assert_eq!(event.payload()["inbox_item_id"], body["id"]);
    assert_eq!(event.payload()["mime"], "application/pdf");

    // the uri resolves back to the uploaded bytes
    let stored = ContentStore::read_uri(body["uri"].as_str().unwrap()).await.unwrap();
    assert_eq!(stored, invoice_pdf());
}

#[tokio::test]
async fn duplicate_upload_returns_the_existing_item() {
    let app = spawn_app().await;

    let first: Value = app.post_upload(invoice_pdf()).await.json().await.unwrap();
    let second_resp = app.post_upload(invoice_pdf()).await;

    assert_eq!(second_resp.status().as_u16(), 200);
    let second: Value = second_resp.json().await.unwrap();
    assert_eq!(second["duplicate"], true);
    assert_eq!(second["id"], first["id"]);

    // no extra row, no extra event
    assert_eq!(app.count("inbox_items").await, 1);
    assert_eq!(app.count("event_outbox").await, 1);
}

#[tokio::test]
async fn upload_filename_and_source_headers_are_persisted() {
    let app = spawn_app().await;

    let resp = app
        .upload_request()
        .bearer_auth(SERVICE_TOKEN)
        .header("X-Tenant", &app.tenant)
        .header("X-Filename", "rechnung-042.pdf")
        .header("X-Source", "scanner")
        .body(invoice_pdf())
        .send()
        .await
        .unwrap();

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["filename"], "rechnung-042.pdf");
    assert_eq!(body["source"], "scanner");
}

#[tokio::test]
async fn path_traversal_filenames_are_rejected() {
    let app = spawn_app().await;

    let resp = app
        .upload_request()
        .bearer_auth(SERVICE_TOKEN)
        .header("X-Tenant", &app.tenant)
        .header("X-Filename", "../../etc/passwd")
        .body(invoice_pdf())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
    assert_eq!(app.count("inbox_items").await, 0);
}

#[tokio::test]
async fn the_size_cap_is_exact() {
    let app = spawn_app_with(|cfg| cfg.ingest.max_upload_mb = 1).await;
    let cap = 1024 * 1024;

    // exactly at the cap: accepted
    let mut at_cap = invoice_pdf();
    at_cap.resize(cap, b' ');
    let resp = app.post_upload(at_cap).await;
    assert_eq!(resp.status().as_u16(), 200);

    // one byte over: rejected with the stable code
    let mut over = invoice_pdf();
    over.resize(cap + 1, b' ');
    let resp = app.post_upload(over).await;
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "size_limit");
    assert_eq!(app.count("inbox_items").await, 1);
}

#[tokio::test]
async fn undetectable_content_is_unsupported_mime() {
    let app = spawn_app().await;

    let resp = app.post_upload(b"no structure at all".to_vec()).await;

    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "unsupported_mime");
    assert_eq!(app.count("inbox_items").await, 0);
    assert_eq!(app.count("event_outbox").await, 0);
}

#[tokio::test]
async fn mime_is_detected_from_content_not_the_claim() {
    let app = spawn_app().await;

    // declared as pdf, actually csv
    let resp = app
        .upload_request()
        .bearer_auth(SERVICE_TOKEN)
        .header("X-Tenant", &app.tenant)
        .header("Content-Type", "application/pdf")
        .body(b"a,b\n1,2\n".to_vec())
        .send()
        .await
        .unwrap();

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["mime"], "text/csv");
}

#[tokio::test]
async fn missing_tenant_header_is_401() {
    let app = spawn_app().await;

    let resp = app
        .upload_request()
        .bearer_auth(SERVICE_TOKEN)
        .body(invoice_pdf())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 401);
}

#[tokio::test]
async fn malformed_tenant_header_is_401() {
    let app = spawn_app().await;

    let resp = app
        .upload_request()
        .bearer_auth(SERVICE_TOKEN)
        .header("X-Tenant", "not-a-uuid")
        .body(invoice_pdf())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 401);
}

#[tokio::test]
async fn unknown_tenant_is_403() {
    let app = spawn_app().await;

    let resp = app
        .upload_request()
        .bearer_auth(SERVICE_TOKEN)
        .header("X-Tenant", Uuid::new_v4().to_string())
        .body(invoice_pdf())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "tenant_unknown");
}

#[tokio::test]
async fn missing_or_wrong_bearer_token_is_401() {
    let app = spawn_app().await;

    let resp = app
        .upload_request()
        .header("X-Tenant", &app.tenant)
        .body(invoice_pdf())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let resp = app
        .upload_request()
        .bearer_auth("wrong-token")
        .header("X-Tenant", &app.tenant)
        .body(invoice_pdf())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
}
