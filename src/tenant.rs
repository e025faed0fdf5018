use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Instant;
use std::time::SystemTime;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::configuration::TenantSettings;
use crate::domain::TenantId;
use crate::domain::TenantRejection;
use crate::utils::parse_csv_list;

static UUID_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("invalid uuid token pattern")
});

/// Outcome of a tenant check. `Ok` carries the parsed id so callers never
/// re-parse the raw header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantValidation {
    Ok(TenantId),
    Rejected(TenantRejection),
}

impl TenantValidation {
    pub fn is_ok(&self) -> bool { matches!(self, TenantValidation::Ok(_)) }
}

/// Read-mostly allowlist with bounded-staleness reload. The source is either
/// the inline CSV from configuration or a file (JSON list, `{"tenants": []}`
/// object, or a YAML-ish file scanned for UUID tokens). On each call past the
/// refresh interval, a changed file modification time swaps the set
/// atomically.
pub struct TenantValidator {
    settings: TenantSettings,
    dev_mode: bool,
    source: Source,
    state: RwLock<AllowlistState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Inline,
    File(PathBuf),
}

struct AllowlistState {
    allow: HashSet<String>,
    mtime: Option<SystemTime>,
    loaded_at: Instant,
}

/// Ops-facing description of the loaded allowlist.
pub struct AllowlistInfo {
    pub source: &'static str,
    pub version: String,
    pub count: usize,
    pub tenants: Vec<String>,
}

impl TenantValidator {
    pub fn new(settings: TenantSettings, dev_mode: bool) -> Self {
        let source = if settings.allowlist_path.trim().is_empty() {
            Source::Inline
        } else {
            Source::File(PathBuf::from(settings.allowlist_path.trim()))
        };
        let state = RwLock::new(load(&source, &settings));
        Self { settings, dev_mode, source, state }
    }

    /// Classify a candidate identifier as ok / missing / malformed / unknown.
    pub fn validate(&self, candidate: Option<&str>) -> TenantValidation {
        self.maybe_reload();

        let tenant = match TenantId::parse_header(candidate) {
            Ok(t) => t,
            Err(reason) => return TenantValidation::Rejected(reason),
        };

        let state = self.state.read().expect("tenant allowlist lock poisoned");
        if state.allow.is_empty() && self.dev_mode {
            return TenantValidation::Ok(tenant);
        }
        if state.allow.contains(&tenant.to_string()) {
            TenantValidation::Ok(tenant)
        } else {
            TenantValidation::Rejected(TenantRejection::Unknown)
        }
    }

    pub fn info(&self) -> AllowlistInfo {
        self.maybe_reload();
        let state = self.state.read().expect("tenant allowlist lock poisoned");
        let mut tenants: Vec<String> = state.allow.iter().cloned().collect();
        tenants.sort();
        let (source, version) = match &self.source {
            Source::Inline => ("inline", "inline".to_owned()),
            Source::File(_) => (
                "file",
                state
                    .mtime
                    .and_then(|m| m.duration_since(SystemTime::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs().to_string())
                    .unwrap_or_else(|| "0".to_owned()),
            ),
        };
        AllowlistInfo { source, version, count: tenants.len(), tenants }
    }

    fn maybe_reload(&self) {
        if self.settings.refresh_sec == 0 {
            return;
        }
        {
            let state = self.state.read().expect("tenant allowlist lock poisoned");
            if state.loaded_at.elapsed().as_secs() < self.settings.refresh_sec {
                return;
            }
            if let Source::File(path) = &self.source {
                let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
                if mtime.is_some() && mtime == state.mtime {
                    return;
                }
            }
        }
        let fresh = load(&self.source, &self.settings);
        *self.state.write().expect("tenant allowlist lock poisoned") = fresh;
    }
}

fn load(source: &Source, settings: &TenantSettings) -> AllowlistState {
    let (raw, mtime) = match source {
        Source::Inline => (settings.allowlist.clone(), None),
        Source::File(path) => {
            let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
            (std::fs::read_to_string(path).unwrap_or_default(), mtime)
        }
    };
    let tokens = match source {
        Source::Inline => parse_csv_list(&raw),
        Source::File(_) => file_tokens(&raw),
    };
    let allow = tokens
        .iter()
        .filter_map(|t| TenantId::parse(t).ok())
        .map(|t| t.to_string())
        .collect();
    AllowlistState { allow, mtime, loaded_at: Instant::now() }
}

/// JSON first (array or `{"tenants": [...]}`), then a naive token scan for
/// YAML-ish lists.
fn file_tokens(text: &str) -> Vec<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        let list = match &value {
            serde_json::Value::Array(items) => Some(items),
            serde_json::Value::Object(map) => map.get("tenants").and_then(|v| v.as_array()),
            _ => None,
        };
        if let Some(items) = list {
            return items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_owned())
                .collect();
        }
    }
    UUID_TOKEN.find_iter(text).map(|m| m.as_str().to_owned()).collect()
}
