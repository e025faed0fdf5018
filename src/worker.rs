use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use sqlx::SqlitePool;
use tokio::sync::watch;

use crate::metrics;
use crate::outbox;
use crate::outbox::OutboxEvent;
use crate::tenant::TenantValidator;
use crate::utils::now_ms;

/// Failure classes a handler can surface. The loop turns these into status
/// transitions; handlers never write `event_outbox.status` themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ValidationError,
    UnsupportedMime,
    UnsupportedScheme,
    ForbiddenAddress,
    ParseError,
    IoError,
    TenantUnknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::UnsupportedMime => "unsupported_mime",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::ForbiddenAddress => "forbidden_address",
            Self::ParseError => "parse_error",
            Self::IoError => "io_error",
            Self::TenantUnknown => "tenant_unknown",
        }
    }
}

/// What a handler invocation came to. The loop is a single match over this
/// value; exceptions never cross the loop boundary.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Business effects are committed (or were already applied); mark `sent`.
    Success,
    /// Nothing was committed; schedule a retry, dead-letter on exhaustion.
    /// The cause becomes the dead-letter reason if retries run out.
    Retriable { cause: String },
    /// Policy or content says this can never succeed; dead-letter now.
    Terminal { kind: FailureKind, cause: String },
}

/// A typed consumer of outbox events. Handlers own their business
/// transactions (rows, processed-events ledger, follow-on enqueues commit
/// together); the surrounding loop owns leasing, retries and dead-lettering.
pub trait EventHandler {
    fn name(&self) -> &'static str;

    /// Restrict the poll to one event type; `None` consumes any pending
    /// event.
    fn event_filter(&self) -> Option<&'static str> { None }

    fn handle(&self, event: &OutboxEvent) -> impl Future<Output = HandlerOutcome> + Send;
}

/// Loop tuning, one set per worker kind.
#[derive(Debug, Clone)]
pub struct WorkerTuning {
    pub batch_size: i64,
    pub poll_interval: Duration,
    /// Ordered backoff schedule in seconds; the last step repeats.
    pub backoff_steps: Vec<u64>,
    pub retry_max: i64,
}

impl WorkerTuning {
    /// Backoff for the n-th attempt (1-based). An empty schedule falls back
    /// to 30 seconds.
    pub fn backoff_secs(&self, attempt: i64) -> u64 {
        if self.backoff_steps.is_empty() {
            return 30;
        }
        let idx = attempt.saturating_sub(1).max(0) as usize;
        self.backoff_steps[idx.min(self.backoff_steps.len() - 1)]
    }
}

/// The generic lease loop: poll due events, win the `pending → processing`
/// race, gate on the tenant allowlist, dispatch the handler, and author
/// exactly one status transition per event.
pub struct Worker<H> {
    pool: SqlitePool,
    tenants: Arc<TenantValidator>,
    tuning: WorkerTuning,
    handler: H,
}

impl<H: EventHandler> Worker<H> {
    pub fn new(
        pool: SqlitePool,
        tenants: Arc<TenantValidator>,
        tuning: WorkerTuning,
        handler: H,
    ) -> Self {
        Self { pool, tenants, tuning, handler }
    }

    /// Process one batch. Returns how many events reached a status
    /// transition (sent, retried or failed).
    pub async fn run_once(&self) -> Result<usize, anyhow::Error> {
        self.process_batch(None).await
    }

    async fn process_batch(
        &self,
        stop: Option<&watch::Receiver<bool>>,
    ) -> Result<usize, anyhow::Error> {
        let due = outbox::due_events(
            &self.pool,
            self.handler.event_filter(),
            self.tuning.batch_size,
            now_ms(),
        )
        .await?;

        let mut processed = 0;
        for event in due {
            // shutdown lands between events, never mid-transaction
            if stop.map(|rx| *rx.borrow()).unwrap_or(false) {
                break;
            }
            if !outbox::try_lease(&self.pool, &event.id).await? {
                // lost the race to another worker
                continue;
            }
            self.dispatch(&event).await?;
            processed += 1;
        }
        Ok(processed)
    }

    #[tracing::instrument(
        skip_all,
        fields(
            worker = self.handler.name(),
            event_id = %event.id,
            event_type = %event.event_type,
            tenant_id = %event.tenant_id,
            trace_id = event.trace_id.as_deref().unwrap_or(""),
        )
    )]
    async fn dispatch(&self, event: &OutboxEvent) -> Result<(), anyhow::Error> {
        // tenants discovered invalid at lease time go straight to the DLQ
        if !self.tenants.validate(Some(&event.tenant_id)).is_ok() {
            metrics::global().incr_tenant_unknown_dropped();
            outbox::fail_with_dead_letter(&self.pool, event, FailureKind::TenantUnknown.as_str())
                .await?;
            tracing::warn!(reason = "tenant_unknown", "event dead-lettered");
            return Ok(());
        }

        let started = Instant::now();
        let outcome = self.handler.handle(event).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            HandlerOutcome::Success => {
                outbox::mark_sent(&self.pool, &event.id).await?;
                tracing::info!(elapsed_ms, status = "sent", "event handled");
            }
            HandlerOutcome::Retriable { cause } => {
                let attempts = event.attempt_count + 1;
                if attempts >= self.tuning.retry_max {
                    outbox::fail_with_dead_letter(&self.pool, event, &cause).await?;
                    tracing::warn!(
                        elapsed_ms,
                        attempts,
                        reason = %cause,
                        status = "failed",
                        "retries exhausted, event dead-lettered"
                    );
                } else {
                    let delay = self.tuning.backoff_secs(attempts);
                    let next_attempt_at = now_ms() + (delay as i64) * 1_000;
                    outbox::schedule_retry(&self.pool, &event.id, attempts, next_attempt_at)
                        .await?;
                    tracing::info!(
                        elapsed_ms,
                        attempts,
                        backoff_secs = delay,
                        reason = %cause,
                        status = "pending",
                        "event scheduled for retry"
                    );
                }
            }
            HandlerOutcome::Terminal { kind, cause } => {
                outbox::fail_with_dead_letter(&self.pool, event, kind.as_str()).await?;
                tracing::warn!(
                    elapsed_ms,
                    reason = kind.as_str(),
                    cause = %cause,
                    status = "failed",
                    "event dead-lettered"
                );
            }
        }
        Ok(())
    }

    /// The long-running entry point. Service mode sleeps the poll interval
    /// when idle; timer mode returns after the first idle batch. SIGINT and
    /// SIGTERM finish the current batch and stop leasing.
    pub async fn run(&self, service_mode: bool) -> Result<(), anyhow::Error> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        spawn_signal_listener(stop_tx);

        while !*stop_rx.borrow() {
            let processed = match self.process_batch(Some(&stop_rx)).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error.cause_chain = ?e, "worker batch failed");
                    0
                }
            };
            if processed == 0 {
                if !service_mode {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.tuning.poll_interval) => {}
                    _ = stop_rx.changed() => {}
                }
            }
        }
        tracing::info!(worker = self.handler.name(), "worker stopped");
        Ok(())
    }
}

fn spawn_signal_listener(stop_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(error.message = %e, "failed to install SIGTERM handler");
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        let _ = stop_tx.send(true);
    });
}
