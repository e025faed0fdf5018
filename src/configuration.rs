use std::time::Duration;

use config::Config;
use config::ConfigError;
use config::FileFormat;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_bool_from_anything;
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;

use crate::utils::parse_csv_list;

/// The immutable configuration record for the whole process. Built once at
/// start (from `configuration.yaml` plus `APP_`-prefixed environment
/// overrides) and passed explicitly; never mutated afterwards outside tests.
#[derive(Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub auth: AuthSettings,
    pub storage: StorageSettings,
    pub ingest: IngestSettings,
    pub parser: ParserSettings,
    pub publish: PublishSettings,
    pub webhook: WebhookSettings,
    pub read: ReadSettings,
    pub tenants: TenantSettings,
}

#[derive(Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub base_url: String,
    pub env: AppEnv,
}

/// Development mode relaxes exactly one policy: an empty tenant allowlist
/// admits any well-formed tenant. Production never does.
#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    pub fn is_development(&self) -> bool { matches!(self, AppEnv::Development) }
}

#[derive(Deserialize, Clone)]
pub struct DatabaseSettings {
    /// Path of the SQLite database file. Empty is a fatal configuration error.
    pub path: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_connections: u32,
}

impl DatabaseSettings {
    pub fn connection(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true)
    }
}

#[derive(Deserialize, Clone)]
pub struct AuthSettings {
    /// CSV of accepted service tokens. Empty means any well-formed bearer
    /// token is accepted (the header itself stays mandatory).
    pub service_tokens: Secret<String>,
    /// CSV of admin tokens for the ops surface. Empty locks the surface.
    pub admin_tokens: Secret<String>,
}

impl AuthSettings {
    pub fn service_token_accepted(&self, token: &str) -> bool {
        let allowed = parse_csv_list(self.service_tokens.expose_secret());
        allowed.is_empty() || allowed.iter().any(|t| t == token)
    }

    pub fn admin_token_accepted(&self, token: &str) -> bool {
        parse_csv_list(self.admin_tokens.expose_secret())
            .iter()
            .any(|t| t == token)
    }
}

#[derive(Deserialize, Clone)]
pub struct StorageSettings {
    /// Only `file` is implemented.
    pub backend: String,
    /// `file://` absolute base, e.g. `file:///var/docflow/uploads`.
    pub base_uri: String,
}

#[derive(Deserialize, Clone)]
pub struct IngestSettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_upload_mb: u64,
    /// CSV of admissible detected MIME types.
    pub mime_allowlist: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub timeout_connect_ms: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub timeout_read_ms: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub redirect_limit: u32,
    /// CSV of allowed remote domains (suffix match). Empty allows any public
    /// host.
    pub url_allowlist: String,
    /// CSV of denied remote domains. Deny wins over allow.
    pub url_denylist: String,
}

impl IngestSettings {
    pub fn max_upload_bytes(&self) -> usize { (self.max_upload_mb as usize) * 1024 * 1024 }

    pub fn mime_allowed(&self, mime: &str) -> bool {
        parse_csv_list(&self.mime_allowlist).iter().any(|m| m == mime)
    }
}

#[derive(Deserialize, Clone)]
pub struct ParserSettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_bytes: usize,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub chunk_threshold_bytes: usize,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub batch_size: i64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub poll_interval_ms: u64,
    /// CSV of backoff steps in seconds, e.g. `5,30,300`.
    pub backoff_steps: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub retry_max: i64,
}

#[derive(Deserialize, Clone)]
pub struct PublishSettings {
    pub transport: TransportKind,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub batch_size: i64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub poll_interval_ms: u64,
    pub backoff_steps: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub retry_max: i64,
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdout,
    Webhook,
}

#[derive(Deserialize, Clone)]
pub struct WebhookSettings {
    pub url: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub timeout_ms: u64,
    /// Ranges and single codes, e.g. `200-299` or `200,201,204`.
    pub success_codes: String,
    /// CSV of `key=value` pairs added to every delivery. Forbidden keys
    /// (`Authorization`, `Cookie`, `Set-Cookie`) are stripped.
    pub headers_allowlist: String,
    /// CSV of allowed webhook domains (suffix match). Empty allows any.
    pub domain_allowlist: String,
    /// Dev/test seam: lets the transport target a plain-http loopback
    /// endpoint. Leave false in any real deployment.
    #[serde(deserialize_with = "deserialize_bool_from_anything")]
    pub allow_http: bool,
}

#[derive(Deserialize, Clone)]
pub struct ReadSettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_limit: i64,
    pub cursor_hmac_key: Secret<String>,
}

#[derive(Deserialize, Clone)]
pub struct TenantSettings {
    /// CSV of tenant UUIDs, used when no file path is configured.
    pub allowlist: String,
    /// Path to a JSON list / `{"tenants": [...]}` object / YAML-ish token
    /// file. Takes precedence over the inline list when non-empty.
    pub allowlist_path: String,
    /// Reload interval in seconds; 0 disables hot reload.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub refresh_sec: u64,
}

/// Parse an ordered backoff schedule from its CSV form. Unparsable entries are
/// dropped rather than failing the whole schedule.
pub fn parse_backoff_steps(raw: &str) -> Vec<u64> {
    parse_csv_list(raw)
        .iter()
        .filter_map(|s| s.parse::<u64>().ok())
        .collect()
}

/// Load `configuration.yaml` from the working directory, then apply
/// environment overrides of the form `APP_SECTION__FIELD` (e.g.
/// `APP_INGEST__MAX_UPLOAD_MB=50`). All fields must resolve or startup fails.
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let settings = Config::builder()
        .add_source(config::File::new("configuration.yaml", FileFormat::Yaml))
        .add_source(config::Environment::with_prefix("APP").separator("__"))
        .build()?;
    settings.try_deserialize()
}
