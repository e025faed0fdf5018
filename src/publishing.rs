use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde_json::json;
use sqlx::SqlitePool;
use url::Url;

use crate::configuration::parse_backoff_steps;
use crate::configuration::Settings;
use crate::configuration::TransportKind;
use crate::configuration::WebhookSettings;
use crate::fetch::host_matches;
use crate::metrics;
use crate::outbox::OutboxEvent;
use crate::startup::get_connection_pool;
use crate::startup::migrate;
use crate::tenant::TenantValidator;
use crate::utils::now_ms;
use crate::utils::parse_csv_list;
use crate::worker::EventHandler;
use crate::worker::FailureKind;
use crate::worker::HandlerOutcome;
use crate::worker::Worker;
use crate::worker::WorkerTuning;

/// One delivery attempt, as seen by the publish loop. `error` carries the
/// stable cause string that ends up as the dead-letter reason on exhaustion.
#[derive(Debug, PartialEq, Eq)]
pub struct PublishResult {
    pub ok: bool,
    pub status_code: u16,
    pub error: Option<String>,
}

impl PublishResult {
    fn ok() -> Self { Self { ok: true, status_code: 0, error: None } }

    fn rejected(error: &str) -> Self {
        Self { ok: false, status_code: 0, error: Some(error.to_owned()) }
    }
}

/// Where events go. `Stdout` writes an audit line (and never the raw
/// payload); `Webhook` POSTs the envelope over HTTPS.
pub enum Transport {
    Stdout,
    Webhook(WebhookTransport),
}

impl Transport {
    pub fn from_settings(
        kind: TransportKind,
        webhook: &WebhookSettings,
    ) -> Result<Self, anyhow::Error> {
        Ok(match kind {
            TransportKind::Stdout => Self::Stdout,
            TransportKind::Webhook => Self::Webhook(WebhookTransport::new(webhook)?),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Webhook(_) => "webhook",
        }
    }

    pub async fn deliver(&self, event: &OutboxEvent) -> PublishResult {
        match self {
            Self::Stdout => {
                // audit line only; payloads stay in the database
                println!(
                    "{}",
                    json!({
                        "tenant_id": &event.tenant_id,
                        "event_type": &event.event_type,
                        "trace_id": &event.trace_id,
                        "transport": "stdout",
                    })
                );
                PublishResult::ok()
            }
            Self::Webhook(webhook) => webhook.deliver(event).await,
        }
    }
}

pub struct WebhookTransport {
    url: String,
    client: reqwest::Client,
    success_codes: SuccessCodes,
    headers: Vec<(String, String)>,
    domain_allow: Vec<String>,
    allow_http: bool,
}

impl WebhookTransport {
    pub fn new(settings: &WebhookSettings) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(settings.timeout_ms))
            .timeout(Duration::from_millis(settings.timeout_ms))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            url: settings.url.clone(),
            client,
            success_codes: SuccessCodes::parse(&settings.success_codes),
            headers: sanitize_headers(parse_header_pairs(&settings.headers_allowlist)),
            domain_allow: parse_csv_list(&settings.domain_allowlist)
                .into_iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
            allow_http: settings.allow_http,
        })
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.domain_allow.is_empty()
            || self.domain_allow.iter().any(|d| host_matches(&host.to_ascii_lowercase(), d))
    }

    async fn deliver(&self, event: &OutboxEvent) -> PublishResult {
        // policy rejections never produce an outbound request
        let Ok(url) = Url::parse(&self.url) else {
            return PublishResult::rejected(FailureKind::UnsupportedScheme.as_str());
        };
        let https = url.scheme() == "https";
        let loopback_http = self.allow_http && url.scheme() == "http";
        if !https && !loopback_http {
            return PublishResult::rejected(FailureKind::UnsupportedScheme.as_str());
        }
        if !self.host_allowed(url.host_str().unwrap_or("")) {
            return PublishResult::rejected(FailureKind::ForbiddenAddress.as_str());
        }

        let mut request = self.client.post(url.as_str()).json(&event.envelope());
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        match request.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if self.success_codes.contains(status) {
                    PublishResult { ok: true, status_code: status, error: None }
                } else {
                    PublishResult {
                        ok: false,
                        status_code: status,
                        error: Some(format!("http_{status}")),
                    }
                }
            }
            Err(e) if e.is_timeout() => PublishResult::rejected("remote_timeout"),
            Err(_) => PublishResult::rejected(FailureKind::IoError.as_str()),
        }
    }
}

/// The configured set of response codes that count as delivered, e.g.
/// `200-299` or `200,201,410`. Empty or unparsable specs fall back to 2xx.
#[derive(Debug, Clone)]
pub struct SuccessCodes(Vec<(u16, u16)>);

impl SuccessCodes {
    pub fn parse(spec: &str) -> Self {
        let mut ranges = Vec::new();
        for token in parse_csv_list(spec) {
            if let Some((lo, hi)) = token.split_once('-') {
                if let (Ok(lo), Ok(hi)) = (lo.trim().parse(), hi.trim().parse()) {
                    ranges.push((lo, hi));
                }
            } else if let Ok(code) = token.parse::<u16>() {
                ranges.push((code, code));
            }
        }
        if ranges.is_empty() {
            ranges.push((200, 299));
        }
        Self(ranges)
    }

    pub fn contains(&self, code: u16) -> bool {
        self.0.iter().any(|(lo, hi)| (*lo..=*hi).contains(&code))
    }
}

pub fn parse_header_pairs(csv: &str) -> Vec<(String, String)> {
    parse_csv_list(csv)
        .iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        })
        .collect()
}

/// Credentials never ride along on deliveries, whatever the operator put in
/// the header allowlist.
pub fn sanitize_headers(pairs: Vec<(String, String)>) -> Vec<(String, String)> {
    const FORBIDDEN: [&str; 3] = ["authorization", "cookie", "set-cookie"];
    pairs
        .into_iter()
        .filter(|(name, _)| !FORBIDDEN.contains(&name.to_ascii_lowercase().as_str()))
        .collect()
}

/// Consumes any pending event and hands it to the configured transport.
/// Publication is at-least-once; receivers deduplicate on the envelope's
/// idempotency key, so this handler does not consult the processed ledger.
pub struct PublishHandler {
    transport: Transport,
}

impl PublishHandler {
    pub fn new(transport: Transport) -> Self { Self { transport } }
}

impl EventHandler for PublishHandler {
    fn name(&self) -> &'static str { "outbox-publisher" }

    async fn handle(&self, event: &OutboxEvent) -> HandlerOutcome {
        metrics::global().incr_publisher_attempts();
        metrics::global().publisher_lag.record(event.lag_ms(now_ms()) as u64);

        let started = Instant::now();
        let result = self.transport.deliver(event).await;
        metrics::global().publish_duration.record(started.elapsed().as_millis() as u64);

        if result.ok {
            metrics::global().incr_publisher_sent();
            tracing::info!(
                transport = self.transport.name(),
                status_code = result.status_code,
                attempt = event.attempt_count + 1,
                "event published"
            );
            return HandlerOutcome::Success;
        }

        metrics::global().incr_publisher_failures();
        let cause = result.error.unwrap_or_else(|| "publish_failed".to_owned());
        tracing::warn!(
            transport = self.transport.name(),
            status_code = result.status_code,
            attempt = event.attempt_count + 1,
            reason = %cause,
            "delivery failed"
        );
        if cause == "unsupported_scheme" {
            HandlerOutcome::Terminal { kind: FailureKind::UnsupportedScheme, cause }
        } else if cause == "forbidden_address" {
            HandlerOutcome::Terminal { kind: FailureKind::ForbiddenAddress, cause }
        } else {
            HandlerOutcome::Retriable { cause }
        }
    }
}

pub fn worker_tuning(settings: &Settings) -> WorkerTuning {
    WorkerTuning {
        batch_size: settings.publish.batch_size,
        poll_interval: Duration::from_millis(settings.publish.poll_interval_ms),
        backoff_steps: parse_backoff_steps(&settings.publish.backoff_steps),
        retry_max: settings.publish.retry_max,
    }
}

pub fn build_worker(
    pool: SqlitePool,
    tenants: Arc<TenantValidator>,
    settings: &Settings,
) -> Result<Worker<PublishHandler>, anyhow::Error> {
    let transport = Transport::from_settings(settings.publish.transport, &settings.webhook)?;
    Ok(Worker::new(pool, tenants, worker_tuning(settings), PublishHandler::new(transport)))
}

/// Fatal configuration checks; the binary exits 1 when these fail.
pub fn preflight(settings: &Settings) -> Result<(), anyhow::Error> {
    if settings.database.path.trim().is_empty() {
        anyhow::bail!("database path is not configured");
    }
    if settings.publish.transport == TransportKind::Webhook && settings.webhook.url.trim().is_empty()
    {
        anyhow::bail!("webhook transport configured without a webhook URL");
    }
    Ok(())
}

/// Entry point of the `outbox-publisher` binary and the combined process.
pub async fn run_until_stopped(settings: Settings, service_mode: bool) -> Result<(), anyhow::Error> {
    let pool = get_connection_pool(&settings.database);
    migrate(&pool).await?;
    let tenants = Arc::new(TenantValidator::new(
        settings.tenants.clone(),
        settings.application.env.is_development(),
    ));
    build_worker(pool, tenants, &settings)?.run(service_mode).await
}
