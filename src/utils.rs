use chrono::DateTime;
use chrono::Utc;

/// Walk the source chain of an error when rendering `Debug`, so log lines show
/// the full causal story instead of only the outermost message.
pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{e}\n")?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{cause}")?;
        current = cause.source();
    }
    Ok(())
}

/// Milliseconds since the Unix epoch. All persisted timestamps use this
/// representation so `next_attempt_at <= now` comparisons stay exact.
pub fn now_ms() -> i64 { Utc::now().timestamp_millis() }

pub fn datetime_from_ms(ms: i64) -> Option<DateTime<Utc>> { DateTime::from_timestamp_millis(ms) }

/// Render a stored millisecond timestamp for API responses.
pub fn rfc3339_from_ms(ms: i64) -> String {
    datetime_from_ms(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Split a comma-separated configuration value, dropping empty entries.
pub fn parse_csv_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
