//! TOML-based configuration system for crmsync.
//!
//! Credentials are never stored in the file: `[source]` and `[target]` carry a
//! `token_env` field naming the environment variable that holds the API
//! token. The actual secrets are resolved at startup via
//! [`AppConfig::resolve_env_vars`]. The resolved config is read-only
//! afterwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::mapping::{FieldMapping, FieldRule};
use crate::watermark::WatermarkDefault;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon process settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Poll frequency and start delay.
    #[serde(default)]
    pub poll: PollConfig,

    /// Batch job sizing and timeouts.
    #[serde(default)]
    pub batch: BatchConfig,

    /// The synchronized stream.
    #[serde(default)]
    pub stream: StreamConfig,

    /// System records are read from.
    pub source: EndpointConfig,

    /// System records are written to.
    pub target: EndpointConfig,

    /// Field mapping rules. Empty means the built-in contact mapping.
    #[serde(default, rename = "mapping")]
    pub mapping: Vec<FieldRule>,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (the SQLite database).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// When set, logs are also written to a daily rolling file here.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/crmsync")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            log_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Poll
// ---------------------------------------------------------------------------

/// Poller timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Milliseconds between ticks (default 30000).
    #[serde(default = "default_frequency_ms")]
    pub frequency_ms: u64,

    /// Milliseconds before the first tick (default 8000).
    #[serde(default = "default_start_delay_ms")]
    pub start_delay_ms: u64,
}

fn default_frequency_ms() -> u64 {
    30_000
}
fn default_start_delay_ms() -> u64 {
    8_000
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            frequency_ms: default_frequency_ms(),
            start_delay_ms: default_start_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Batch job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Records requested per source page (default 100).
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Concurrent target writes (default 4).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Upper bound on waiting for a batch job (default 300000).
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,

    /// Progress logging cadence while waiting (default 500).
    #[serde(default = "default_await_poll_interval_ms")]
    pub await_poll_interval_ms: u64,
}

fn default_page_size() -> usize {
    100
}
fn default_workers() -> usize {
    4
}
fn default_job_timeout_ms() -> u64 {
    300_000
}
fn default_await_poll_interval_ms() -> u64 {
    500
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            workers: default_workers(),
            job_timeout_ms: default_job_timeout_ms(),
            await_poll_interval_ms: default_await_poll_interval_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// Stream identity and watermark settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Watermark key (default `contacts`).
    #[serde(default = "default_stream_id")]
    pub id: String,

    /// Watermark used before the first successful cycle: `now`,
    /// `now-<n><ms|s|m|h|d>` or an RFC 3339 timestamp (default `now-100s`).
    #[serde(default = "default_watermark_expr")]
    pub default_watermark: String,

    /// Target field used to find an existing record before writing
    /// (default `lastname`).
    #[serde(default = "default_natural_key")]
    pub natural_key: String,

    /// Target fields the target system rejects records without.
    #[serde(default = "default_required_target_fields")]
    pub required_target_fields: Vec<String>,
}

fn default_stream_id() -> String {
    "contacts".into()
}
fn default_watermark_expr() -> String {
    "now-100s".into()
}
fn default_natural_key() -> String {
    "lastname".into()
}
fn default_required_target_fields() -> Vec<String> {
    vec!["lastname".into()]
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            id: default_stream_id(),
            default_watermark: default_watermark_expr(),
            natural_key: default_natural_key(),
            required_target_fields: default_required_target_fields(),
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// One CRM REST endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// API root, e.g. `https://crm.example.com/api`.
    pub base_url: String,

    /// Object collection under the root (default `contacts`).
    #[serde(default = "default_object")]
    pub object: String,

    /// Environment variable holding the bearer token.
    #[serde(default)]
    pub token_env: Option<String>,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_object() -> String {
    "contacts".into()
}

/// Upper bound for every millisecond setting.
pub const MAX_DURATION_MS: u64 = 7 * 24 * 60 * 60 * 1000;

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `token_env` references for both endpoints.
    ///
    /// A configured variable that is unset is an error; an endpoint without
    /// `token_env` simply sends no credentials.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");
        self.source.token = resolve_token(&self.source, "source.token_env")?;
        self.target.token = resolve_token(&self.target, "target.token_env")?;
        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll.frequency_ms == 0 {
            return Err(invalid("poll.frequency_ms", "poll frequency must be > 0"));
        }
        if self.batch.page_size == 0 {
            return Err(invalid("batch.page_size", "page size must be > 0"));
        }
        if self.batch.workers == 0 {
            return Err(invalid("batch.workers", "worker count must be > 0"));
        }
        if self.batch.job_timeout_ms == 0 {
            return Err(invalid("batch.job_timeout_ms", "job timeout must be > 0"));
        }
        for (field, ms) in [
            ("poll.frequency_ms", self.poll.frequency_ms),
            ("poll.start_delay_ms", self.poll.start_delay_ms),
            ("batch.job_timeout_ms", self.batch.job_timeout_ms),
            ("batch.await_poll_interval_ms", self.batch.await_poll_interval_ms),
        ] {
            if ms > MAX_DURATION_MS {
                return Err(invalid(field, &format!("must be at most {MAX_DURATION_MS}ms (7 days)")));
            }
        }
        if self.stream.id.trim().is_empty() {
            return Err(invalid("stream.id", "stream id must not be empty"));
        }
        self.watermark_default()?;

        for (field, endpoint) in [("source.base_url", &self.source), ("target.base_url", &self.target)] {
            if !(endpoint.base_url.starts_with("http://") || endpoint.base_url.starts_with("https://")) {
                return Err(invalid(field, "base URL must start with http:// or https://"));
            }
        }

        let mapping = self.field_mapping()?;
        mapping
            .validate_required(self.stream.required_target_fields.as_slice())
            .map_err(|e| invalid("mapping", &e.to_string()))?;
        if mapping.source_for(&self.stream.natural_key).is_none() {
            return Err(invalid(
                "stream.natural_key",
                &format!("'{}' is not a mapped target field", self.stream.natural_key),
            ));
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// The configured mapping table, or the contact mapping when none is
    /// given.
    pub fn field_mapping(&self) -> Result<FieldMapping, ConfigError> {
        if self.mapping.is_empty() {
            return Ok(FieldMapping::contacts());
        }
        FieldMapping::new(self.mapping.clone()).map_err(|e| invalid("mapping", &e.to_string()))
    }

    pub fn watermark_default(&self) -> Result<WatermarkDefault, ConfigError> {
        self.stream
            .default_watermark
            .parse::<WatermarkDefault>()
            .map_err(|e| invalid("stream.default_watermark", &e.to_string()))
    }

    pub fn database_path(&self) -> PathBuf {
        self.daemon.data_dir.join("crmsync.db")
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

fn resolve_token(endpoint: &EndpointConfig, field: &str) -> Result<Option<String>, ConfigError> {
    let Some(env_name) = endpoint.token_env.as_deref() else {
        return Ok(None);
    };
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Ok(Some(val))
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            Err(ConfigError::EnvVarMissing {
                var: env_name.into(),
                field: field.into(),
            })
        }
        Err(_) => Err(ConfigError::EnvVarMissing {
            var: env_name.into(),
            field: field.into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Transform;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[daemon]
log_level = "debug"
data_dir = "/tmp/crmsync"
log_dir = "/tmp/crmsync/logs"

[poll]
frequency_ms = 15000
start_delay_ms = 1000

[batch]
page_size = 50
workers = 8
job_timeout_ms = 60000
await_poll_interval_ms = 250

[stream]
id = "contacts"
default_watermark = "now-5m"
natural_key = "lastname"
required_target_fields = ["lastname"]

[source]
base_url = "https://sfdc.example.com/api"
object = "Contact"
token_env = "CRMSYNC_TEST_SOURCE_TOKEN"

[target]
base_url = "https://dynamics.example.com/api/data"

[[mapping]]
source = "LastName"
target = "lastname"
required = true

[[mapping]]
source = "Email"
target = "emailaddress1"
transform = "lowercase"

[[mapping]]
source = "Phone"
target = "telephone1"
default = "n/a"
"#
    }

    fn minimal_toml() -> &'static str {
        r#"
[source]
base_url = "https://sfdc.example.com/api"
[target]
base_url = "https://dynamics.example.com/api"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.poll.frequency_ms, 15_000);
        assert_eq!(config.batch.workers, 8);
        assert_eq!(config.source.object, "Contact");
        assert_eq!(config.target.object, "contacts");
        assert_eq!(config.daemon.log_dir, Some(PathBuf::from("/tmp/crmsync/logs")));
        assert_eq!(config.mapping.len(), 3);
        assert_eq!(config.mapping[1].transform, Some(Transform::Lowercase));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/crmsync/crmsync.db"));
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.poll.frequency_ms, 30_000);
        assert_eq!(config.poll.start_delay_ms, 8_000);
        assert_eq!(config.batch.page_size, 100);
        assert_eq!(config.batch.workers, 4);
        assert_eq!(config.batch.job_timeout_ms, 300_000);
        assert_eq!(config.stream.id, "contacts");
        assert_eq!(config.stream.default_watermark, "now-100s");
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.field_mapping().unwrap(), FieldMapping::contacts());
        assert_eq!(
            config.watermark_default().unwrap(),
            WatermarkDefault::NowMinus(chrono::Duration::seconds(100))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_frequency() {
        let mut config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.poll.frequency_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "poll.frequency_ms"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_watermark_expression() {
        let mut config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.stream.default_watermark = "last tuesday".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "stream.default_watermark"
        ));
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.stream.default_watermark = "now-9999999999999d".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "stream.default_watermark"
        ));

        let mut config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.batch.job_timeout_ms = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "batch.job_timeout_ms"
        ));

        let mut config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.poll.start_delay_ms = MAX_DURATION_MS + 1;
        assert!(config.validate().is_err());
        config.poll.start_delay_ms = MAX_DURATION_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unmapped_required_field() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.mapping.remove(0);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "mapping"));
    }

    #[test]
    fn test_validate_rejects_duplicate_targets() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.mapping.push(FieldRule::new("MobilePhone", "telephone1"));
        assert!(config.field_mapping().is_err());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_url() {
        let mut config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.target.base_url = "dynamics.example.com".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "target.base_url"
        ));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("CRMSYNC_TEST_SOURCE_TOKEN", "tok_abc");

        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.resolve_env_vars().unwrap();
        assert_eq!(config.source.token.as_deref(), Some("tok_abc"));
        assert_eq!(config.target.token, None);

        // Clean up
        std::env::remove_var("CRMSYNC_TEST_SOURCE_TOKEN");
    }

    #[test]
    fn test_missing_token_env_is_an_error() {
        let mut config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.target.token_env = Some("CRMSYNC_TEST_UNSET_TOKEN".into());
        assert!(matches!(
            config.resolve_env_vars(),
            Err(ConfigError::EnvVarMissing { ref var, .. }) if var == "CRMSYNC_TEST_UNSET_TOKEN"
        ));
    }
}
