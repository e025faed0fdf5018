use std::sync::Arc;

use docflow::configuration::get_configuration;
use docflow::configuration::AppEnv;
use docflow::configuration::Settings;
use docflow::outbox;
use docflow::outbox::EnqueueOutcome;
use docflow::outbox::NewEvent;
use docflow::parsing;
use docflow::parsing::ParseHandler;
use docflow::publishing;
use docflow::publishing::PublishHandler;
use docflow::startup::get_connection_pool;
use docflow::startup::Application;
use docflow::telemetry::get_subscriber;
use docflow::telemetry::init_subscriber;
use docflow::tenant::TenantValidator;
use docflow::worker::Worker;
use once_cell::sync::Lazy;
use secrecy::Secret;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

pub const SERVICE_TOKEN: &str = "test-service-token";
pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Initialise the tracing stack once for the whole suite. Opt into output
/// with `TEST_LOG=true cargo test | bunyan`.
static TRACING: Lazy<()> = Lazy::new(|| {
    match std::env::var("TEST_LOG") {
        Ok(_) => {
            let subscriber = get_subscriber("test", "debug", std::io::stdout);
            init_subscriber(subscriber);
        }
        Err(_) => {
            let subscriber = get_subscriber("test", "debug", std::io::sink);
            init_subscriber(subscriber);
        }
    };
});

pub struct TestApp {
    pub addr: String,
    pub pool: SqlitePool,
    pub tenant: String,
    pub cfg: Settings,
    // temp dirs are dropped (and deleted) with the TestApp
    _db_dir: tempfile::TempDir,
    _storage_dir: tempfile::TempDir,
}

pub async fn spawn_app() -> TestApp { spawn_app_with(|_| {}).await }

/// Spawn a fully wired app on a random port with its own database file,
/// storage root and allowlisted tenant. `customize` runs last, so tests can
/// override any setting.
pub async fn spawn_app_with(customize: impl FnOnce(&mut Settings)) -> TestApp {
    Lazy::force(&TRACING);

    let db_dir = tempfile::tempdir().expect("failed to create db dir");
    let storage_dir = tempfile::tempdir().expect("failed to create storage dir");
    let tenant = Uuid::new_v4().to_string();

    let mut cfg = get_configuration().expect("failed to read configuration");
    cfg.application.port = 0;
    cfg.application.env = AppEnv::Production;
    cfg.database.path = db_dir.path().join("docflow.db").display().to_string();
    cfg.storage.base_uri = format!("file://{}", storage_dir.path().display());
    cfg.tenants.allowlist = tenant.clone();
    cfg.auth.service_tokens = Secret::new(SERVICE_TOKEN.to_owned());
    cfg.auth.admin_tokens = Secret::new(ADMIN_TOKEN.to_owned());
    customize(&mut cfg);

    let app = Application::build(cfg.clone()).await.expect("failed to build application");
    let addr = format!("http://127.0.0.1:{}", app.get_port());
    let pool = get_connection_pool(&cfg.database);
    tokio::spawn(app.run_until_stopped());

    TestApp {
        addr,
        pool,
        tenant,
        cfg,
        _db_dir: db_dir,
        _storage_dir: storage_dir,
    }
}

impl TestApp {
    fn client(&self) -> reqwest::Client { reqwest::Client::new() }

    /// `POST /api/v1/inbox/items/upload` with the standard auth headers.
    pub async fn post_upload(&self, body: Vec<u8>) -> reqwest::Response {
        self.client()
            .post(format!("{}/api/v1/inbox/items/upload", self.addr))
            .bearer_auth(SERVICE_TOKEN)
            .header("X-Tenant", &self.tenant)
            .body(body)
            .send()
            .await
            .expect("upload request failed")
    }

    pub fn upload_request(&self) -> reqwest::RequestBuilder {
        self.client().post(format!("{}/api/v1/inbox/items/upload", self.addr))
    }

    pub async fn post_remote_ingest(&self, remote_url: &str) -> reqwest::Response {
        self.client()
            .post(format!("{}/api/v1/inbox/items", self.addr))
            .bearer_auth(SERVICE_TOKEN)
            .header("X-Tenant", &self.tenant)
            .json(&serde_json::json!({ "remote_url": remote_url }))
            .send()
            .await
            .expect("remote ingest request failed")
    }

    pub async fn get_items(&self, query: &str) -> reqwest::Response {
        self.client()
            .get(format!("{}/api/v1/inbox/items{query}", self.addr))
            .bearer_auth(SERVICE_TOKEN)
            .header("X-Tenant", &self.tenant)
            .send()
            .await
            .expect("list request failed")
    }

    pub async fn get_read(&self, path: &str) -> reqwest::Response {
        self.client()
            .get(format!("{}/api/v1/read/{path}", self.addr))
            .bearer_auth(SERVICE_TOKEN)
            .header("X-Tenant", &self.tenant)
            .send()
            .await
            .expect("read request failed")
    }

    pub async fn ops_get(&self, path: &str) -> reqwest::Response {
        self.client()
            .get(format!("{}/api/v1/ops/{path}", self.addr))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .expect("ops request failed")
    }

    pub async fn ops_post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client()
            .post(format!("{}/api/v1/ops/{path}", self.addr))
            .bearer_auth(ADMIN_TOKEN)
            .json(&body)
            .send()
            .await
            .expect("ops request failed")
    }

    fn tenant_validator(&self) -> Arc<TenantValidator> {
        Arc::new(TenantValidator::new(
            self.cfg.tenants.clone(),
            self.cfg.application.env.is_development(),
        ))
    }

    pub fn parse_worker(&self) -> Worker<ParseHandler> {
        parsing::build_worker(self.pool.clone(), self.tenant_validator(), &self.cfg)
    }

    pub fn publish_worker(&self) -> Worker<PublishHandler> {
        publishing::build_worker(self.pool.clone(), self.tenant_validator(), &self.cfg)
            .expect("failed to build publish worker")
    }

    /// Put an event on the bus directly, bypassing ingest.
    pub async fn seed_event(
        &self,
        tenant: &str,
        event_type: &str,
        idempotency_key: Option<&str>,
        payload: Value,
    ) -> String {
        let mut txn = self.pool.begin().await.expect("begin failed");
        let outcome = outbox::enqueue(
            &mut txn,
            NewEvent {
                tenant_id: tenant,
                event_type,
                idempotency_key,
                trace_id: None,
                payload: &payload,
                delay_ms: 0,
            },
        )
        .await
        .expect("enqueue failed");
        txn.commit().await.expect("commit failed");
        match outcome {
            EnqueueOutcome::Enqueued(id) => id,
            EnqueueOutcome::AlreadyEnqueued => panic!("seed event collided with existing row"),
        }
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .expect("count query failed")
    }

    pub async fn event_status(&self, id: &str) -> String {
        outbox::get_event(&self.pool, id)
            .await
            .expect("event lookup failed")
            .expect("event not found")
            .status
            .as_str()
            .to_owned()
    }

    /// The single pending event of a given type, for follow-on assertions.
    pub async fn pending_event_of_type(&self, event_type: &str) -> docflow::outbox::OutboxEvent {
        let events = outbox::due_events(&self.pool, Some(event_type), 10, i64::MAX)
            .await
            .expect("due_events failed");
        assert_eq!(events.len(), 1, "expected exactly one pending {event_type} event");
        events.into_iter().next().unwrap()
    }
}

/// A small PDF-looking document with extractable invoice fields.
pub fn invoice_pdf() -> Vec<u8> {
    b"%PDF-1.4\nInvoice No. INV-2024-001\nAmount: 1.234,56\nDue Date: 2024-12-01\n".to_vec()
}

/// A CSV document with no extractable fields; lands in the review queue.
pub fn plain_csv() -> Vec<u8> { b"col_a,col_b\n1,2\n3,4\n".to_vec() }
