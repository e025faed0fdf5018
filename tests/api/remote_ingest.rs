use serde_json::Value;

use crate::helpers::spawn_app;

#[tokio::test]
async fn private_addresses_are_forbidden_without_any_fetch() {
    let app = spawn_app().await;

    let resp = app.post_remote_ingest("https://10.0.0.1/x.pdf").await;

    assert_eq!(resp.status().as_u16(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "forbidden_address");
    // the rejection happens before ingest: nothing was created
    assert_eq!(app.count("inbox_items").await, 0);
    assert_eq!(app.count("event_outbox").await, 0);
}

#[tokio::test]
async fn loopback_addresses_are_forbidden() {
    let app = spawn_app().await;

    let resp = app.post_remote_ingest("https://127.0.0.1/x.pdf").await;

    assert_eq!(resp.status().as_u16(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "forbidden_address");
}

#[tokio::test]
async fn plain_http_urls_are_unsupported() {
    let app = spawn_app().await;

    let resp = app.post_remote_ingest("http://example.com/x.pdf").await;

    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "unsupported_scheme");
    assert_eq!(app.count("inbox_items").await, 0);
}

#[tokio::test]
async fn denylisted_hosts_are_forbidden() {
    let app = spawn_app_with_denylist("example.com").await;

    let resp = app.post_remote_ingest("https://docs.example.com/x.pdf").await;

    assert_eq!(resp.status().as_u16(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "forbidden_address");
}

async fn spawn_app_with_denylist(denylist: &str) -> crate::helpers::TestApp {
    let denylist = denylist.to_owned();
    crate::helpers::spawn_app_with(move |cfg| cfg.ingest.url_denylist = denylist).await
}
