use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use once_cell::sync::Lazy;
use serde_json::json;
use serde_json::Value;

/// Process-local counters and duration accumulators, surfaced through the ops
/// endpoint. Plain atomics; anything fancier (export, histogram buckets)
/// belongs to the collector scraping this snapshot.
#[derive(Default)]
pub struct Metrics {
    pub inbox_received: AtomicU64,
    pub inbox_validated: AtomicU64,
    pub dedupe_hits: AtomicU64,
    pub parsed_total: AtomicU64,
    pub parse_failures: AtomicU64,
    pub tenant_unknown_dropped: AtomicU64,
    pub publisher_attempts: AtomicU64,
    pub publisher_sent: AtomicU64,
    pub publisher_failures: AtomicU64,
    pub ops_replay_attempts: AtomicU64,
    pub ops_replay_committed: AtomicU64,
    pub ingest_duration: DurationStat,
    pub fetch_duration: DurationStat,
    pub parse_duration: DurationStat,
    pub publish_duration: DurationStat,
    pub publisher_lag: DurationStat,
}

/// Sum + count, enough to derive an average without holding samples.
#[derive(Default)]
pub struct DurationStat {
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl DurationStat {
    pub fn record(&self, ms: u64) {
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Value {
        let sum = self.sum_ms.load(Ordering::Relaxed);
        let count = self.count.load(Ordering::Relaxed);
        let avg = if count == 0 { 0.0 } else { sum as f64 / count as f64 };
        json!({ "sum_ms": sum, "count": count, "avg_ms": avg })
    }
}

static GLOBAL: Lazy<Metrics> = Lazy::new(Metrics::default);

pub fn global() -> &'static Metrics { &GLOBAL }

fn add(counter: &AtomicU64, n: u64) { counter.fetch_add(n, Ordering::Relaxed); }

impl Metrics {
    pub fn incr_inbox_received(&self) { add(&self.inbox_received, 1) }
    pub fn incr_inbox_validated(&self) { add(&self.inbox_validated, 1) }
    pub fn incr_dedupe_hits(&self) { add(&self.dedupe_hits, 1) }
    pub fn incr_parsed_total(&self) { add(&self.parsed_total, 1) }
    pub fn incr_parse_failures(&self) { add(&self.parse_failures, 1) }
    pub fn incr_tenant_unknown_dropped(&self) { add(&self.tenant_unknown_dropped, 1) }
    pub fn incr_publisher_attempts(&self) { add(&self.publisher_attempts, 1) }
    pub fn incr_publisher_sent(&self) { add(&self.publisher_sent, 1) }
    pub fn incr_publisher_failures(&self) { add(&self.publisher_failures, 1) }
    pub fn incr_ops_replay_attempts(&self, n: u64) { add(&self.ops_replay_attempts, n) }
    pub fn incr_ops_replay_committed(&self, n: u64) { add(&self.ops_replay_committed, n) }

    pub fn snapshot(&self) -> Value {
        json!({
            "counters": {
                "inbox_received_total": self.inbox_received.load(Ordering::Relaxed),
                "inbox_validated_total": self.inbox_validated.load(Ordering::Relaxed),
                "dedupe_hits_total": self.dedupe_hits.load(Ordering::Relaxed),
                "parsed_total": self.parsed_total.load(Ordering::Relaxed),
                "parse_failures_total": self.parse_failures.load(Ordering::Relaxed),
                "tenant_unknown_dropped_total": self.tenant_unknown_dropped.load(Ordering::Relaxed),
                "publisher_attempts_total": self.publisher_attempts.load(Ordering::Relaxed),
                "publisher_sent_total": self.publisher_sent.load(Ordering::Relaxed),
                "publisher_failures_total": self.publisher_failures.load(Ordering::Relaxed),
                "ops_replay_attempts_total": self.ops_replay_attempts.load(Ordering::Relaxed),
                "ops_replay_committed_total": self.ops_replay_committed.load(Ordering::Relaxed),
            },
            "durations": {
                "ingest_ms": self.ingest_duration.snapshot(),
                "fetch_ms": self.fetch_duration.snapshot(),
                "parse_ms": self.parse_duration.snapshot(),
                "publish_ms": self.publish_duration.snapshot(),
                "publisher_lag_ms": self.publisher_lag.snapshot(),
            },
        })
    }
}
