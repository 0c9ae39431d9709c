// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Engine configuration is TOML with `PULSE_` environment overrides
// (`PULSE_SERVER__BIND_ADDR=...`). Every field has a default so an empty file
// is a valid configuration.
// ============================================================================

use std::fmt::{self, Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::aggregation::TimeRange;
use crate::error::ConfigError;
use crate::metric_types;
use crate::types::TimePeriod;
use crate::{
    DEFAULT_API_ADDR, DEFAULT_API_CALL_THRESHOLD_MS, DEFAULT_ERROR_RATE_THRESHOLD,
    DEFAULT_FLUSH_INTERVAL_SECS, DEFAULT_PAGE_LOAD_THRESHOLD_MS, DEFAULT_PENDING_CAPACITY,
    DEFAULT_PERCENTILE_WINDOW, DEFAULT_QUERY_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_SAMPLE_INTERVAL_SECS, SHUTDOWN_GRACE_PERIOD_SECS,
};

// ----------------------------------------------------------------------------
// Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: GeneralConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub aggregation: AggregationConfig,

    #[serde(default)]
    pub report: ReportThresholds,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub access: AccessConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PULSE_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::invalid_value(
                "server.bind_addr",
                format!("'{}' is not a socket address", self.server.bind_addr),
            ));
        }

        if self.collector.percentile_window == 0 {
            return Err(ConfigError::invalid_value(
                "collector.percentile_window",
                "must be at least 1",
            ));
        }

        if self.collector.pending_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "collector.pending_capacity",
                "must be at least 1",
            ));
        }

        if self.collector.flush_interval_secs == 0 || self.collector.sample_interval_secs == 0 {
            return Err(ConfigError::invalid_value(
                "collector",
                "flush and sample intervals must be non-zero",
            ));
        }

        if !(0.0..=1.0).contains(&self.collector.error_rate_threshold) {
            return Err(ConfigError::invalid_value(
                "collector.error_rate_threshold",
                "must be between 0 and 1",
            ));
        }

        if self.aggregation.query_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "aggregation.query_timeout_ms",
                "must be non-zero",
            ));
        }

        if self.aggregation.trend_threshold <= 0.0 {
            return Err(ConfigError::invalid_value(
                "aggregation.trend_threshold",
                "must be positive",
            ));
        }

        if self.store.backend == StoreBackend::Jsonl && self.store.path.is_none() {
            return Err(ConfigError::invalid_value(
                "store.path",
                "the jsonl backend needs a directory",
            ));
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// General Engine Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Environment name (prod, staging, dev)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Graceful shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            environment: default_environment(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    "pulse-engine".into()
}

fn default_environment() -> String {
    "production".into()
}

fn default_shutdown_timeout() -> u64 {
    SHUTDOWN_GRACE_PERIOD_SECS
}

// ----------------------------------------------------------------------------
// HTTP Server Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_api_addr")]
    pub bind_addr: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_api_addr(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_api_addr() -> String {
    DEFAULT_API_ADDR.into()
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

// ----------------------------------------------------------------------------
// Collector Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_page_load_threshold")]
    pub page_load_threshold_ms: f64,

    #[serde(default = "default_api_call_threshold")]
    pub api_call_threshold_ms: f64,

    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Recent values kept per key for the percentile estimate
    #[serde(default = "default_percentile_window")]
    pub percentile_window: usize,

    /// Samples queued between flushes before the oldest are dropped
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            page_load_threshold_ms: default_page_load_threshold(),
            api_call_threshold_ms: default_api_call_threshold(),
            error_rate_threshold: default_error_rate_threshold(),
            percentile_window: default_percentile_window(),
            pending_capacity: default_pending_capacity(),
            flush_interval_secs: default_flush_interval(),
            sample_interval_secs: default_sample_interval(),
        }
    }
}

fn default_page_load_threshold() -> f64 {
    DEFAULT_PAGE_LOAD_THRESHOLD_MS
}

fn default_api_call_threshold() -> f64 {
    DEFAULT_API_CALL_THRESHOLD_MS
}

fn default_error_rate_threshold() -> f64 {
    DEFAULT_ERROR_RATE_THRESHOLD
}

fn default_percentile_window() -> usize {
    DEFAULT_PERCENTILE_WINDOW
}

fn default_pending_capacity() -> usize {
    DEFAULT_PENDING_CAPACITY
}

fn default_flush_interval() -> u64 {
    DEFAULT_FLUSH_INTERVAL_SECS
}

fn default_sample_interval() -> u64 {
    DEFAULT_SAMPLE_INTERVAL_SECS
}

// ----------------------------------------------------------------------------
// Aggregation Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Deadline for each per-type store query
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    /// Relative change needed to leave `stable` (0.10 = 10%)
    #[serde(default = "default_trend_threshold")]
    pub trend_threshold: f64,

    /// Average API response time above which the performance score is penalized
    #[serde(default = "default_response_time_threshold")]
    pub response_time_threshold_ms: f64,

    /// API calls per minute below which the performance score is penalized
    #[serde(default = "default_min_throughput")]
    pub min_throughput_per_min: f64,

    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    #[serde(default = "default_response_time_penalty")]
    pub response_time_penalty: f64,

    #[serde(default = "default_throughput_penalty")]
    pub throughput_penalty: f64,

    #[serde(default = "default_error_rate_penalty")]
    pub error_rate_penalty: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout(),
            trend_threshold: default_trend_threshold(),
            response_time_threshold_ms: default_response_time_threshold(),
            min_throughput_per_min: default_min_throughput(),
            error_rate_threshold: default_error_rate_threshold(),
            response_time_penalty: default_response_time_penalty(),
            throughput_penalty: default_throughput_penalty(),
            error_rate_penalty: default_error_rate_penalty(),
        }
    }
}

fn default_query_timeout() -> u64 {
    DEFAULT_QUERY_TIMEOUT_MS
}

fn default_trend_threshold() -> f64 {
    0.10
}

fn default_response_time_threshold() -> f64 {
    1000.0
}

fn default_min_throughput() -> f64 {
    1.0
}

fn default_response_time_penalty() -> f64 {
    20.0
}

fn default_throughput_penalty() -> f64 {
    10.0
}

fn default_error_rate_penalty() -> f64 {
    30.0
}

// ----------------------------------------------------------------------------
// Report Thresholds
// ----------------------------------------------------------------------------

/// Thresholds the report generator compares aggregated values against.
/// Every comparison is strict: a value equal to its threshold never alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportThresholds {
    #[serde(default = "default_page_load_threshold")]
    pub page_load_ms: f64,

    #[serde(default = "default_response_time_threshold")]
    pub api_response_ms: f64,

    #[serde(default = "default_error_rate_threshold")]
    pub error_rate: f64,

    #[serde(default = "default_health_warning")]
    pub health_warning: f64,

    #[serde(default = "default_health_critical")]
    pub health_critical: f64,

    #[serde(default = "default_layout_shift")]
    pub layout_shift: f64,

    #[serde(default = "default_first_input_delay")]
    pub first_input_delay_ms: f64,
}

impl Default for ReportThresholds {
    fn default() -> Self {
        Self {
            page_load_ms: default_page_load_threshold(),
            api_response_ms: default_response_time_threshold(),
            error_rate: default_error_rate_threshold(),
            health_warning: default_health_warning(),
            health_critical: default_health_critical(),
            layout_shift: default_layout_shift(),
            first_input_delay_ms: default_first_input_delay(),
        }
    }
}

fn default_health_warning() -> f64 {
    90.0
}

fn default_health_critical() -> f64 {
    70.0
}

fn default_layout_shift() -> f64 {
    0.1
}

fn default_first_input_delay() -> f64 {
    100.0
}

// ----------------------------------------------------------------------------
// Store Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Jsonl,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the jsonl backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

// ----------------------------------------------------------------------------
// Access Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Bearer tokens the identity provider issued to administrators
    #[serde(default)]
    pub admin_tokens: Vec<String>,

    /// Serve reports without credentials (development only)
    #[serde(default)]
    pub allow_anonymous: bool,
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// Configuration Hot-Swap
// ----------------------------------------------------------------------------

/// Holds the live configuration; readers never block writers.
pub struct ConfigManager {
    config: ArcSwap<EngineConfig>,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            config_path: None,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = EngineConfig::load(&path)?;
        let mut manager = Self::new(config);
        manager.config_path = Some(path.as_ref().to_path_buf());
        Ok(manager)
    }

    /// Get current configuration
    pub fn get(&self) -> Arc<EngineConfig> {
        self.config.load_full()
    }

    /// Replace the configuration after validating it
    pub fn update(&self, config: EngineConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Reload from file (no-op when built from a value)
    pub fn reload(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.config_path {
            let config = EngineConfig::load(path)?;
            self.update(config)?;
        }
        Ok(())
    }
}

impl Debug for ConfigManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigManager")
            .field("config", &*self.config.load())
            .field("config_path", &self.config_path)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Per-Request Report Options
// ----------------------------------------------------------------------------

/// Options a dashboard sends in the `data` object of an action request.
/// Parsing is lenient: unknown or malformed values fall back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportOptions {
    pub time_range: TimeRange,
    pub metric_types: Vec<String>,
    pub granularity: TimePeriod,
    pub include_charts: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            time_range: TimeRange::default(),
            metric_types: metric_types::ALL.iter().map(|s| s.to_string()).collect(),
            granularity: TimePeriod::default(),
            include_charts: false,
        }
    }
}

impl ReportOptions {
    /// Parse options out of a request's `data` value.
    pub fn from_json(data: &JsonValue) -> Self {
        let mut options = Self::default();

        if let Some(range) = data.get("time_range").and_then(JsonValue::as_str) {
            options.time_range = TimeRange::parse_or_default(range);
        }

        if let Some(requested) = data.get("metric_types").and_then(JsonValue::as_array) {
            let (known, unknown): (Vec<String>, Vec<String>) = requested
                .iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_string)
                .partition(|t| metric_types::is_known(t));

            if !unknown.is_empty() {
                warn!(target: "pulse::config", unknown = ?unknown, "Ignoring unknown metric types");
            }
            if !known.is_empty() {
                options.metric_types = known;
            }
        }

        if let Some(granularity) = data.get("granularity").and_then(JsonValue::as_str) {
            match granularity.parse() {
                Ok(period) => options.granularity = period,
                Err(e) => warn!(target: "pulse::config", error = %e, "Using default granularity"),
            }
        }

        if let Some(charts) = data.get("include_charts").and_then(JsonValue::as_bool) {
            options.include_charts = charts;
        }

        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();

        assert_eq!(config.collector.page_load_threshold_ms, 3000.0);
        assert_eq!(config.collector.api_call_threshold_ms, 2000.0);
        assert_eq!(config.collector.percentile_window, 100);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generated_config_round_trips() {
        let generated = EngineConfig::generate_default_config();
        let parsed = EngineConfig::from_toml_str(&generated).unwrap();
        assert_eq!(parsed, EngineConfig::default());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [collector]
            page_load_threshold_ms = 2500.0

            [access]
            admin_tokens = ["secret"]
            "#,
        )
        .unwrap();

        assert_eq!(config.collector.page_load_threshold_ms, 2500.0);
        assert_eq!(config.collector.api_call_threshold_ms, 2000.0);
        assert_eq!(config.access.admin_tokens, vec!["secret".to_string()]);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.server.bind_addr = "not-an-address".into();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.store.backend = StoreBackend::Jsonl;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.collector.error_rate_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\ninstance_name = \"edge-01\"").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.engine.instance_name, "edge-01");

        let missing = EngineConfig::load("/definitely/not/here.toml");
        assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_config_manager_update_validates() {
        let manager = ConfigManager::new(EngineConfig::default());
        let mut bad = EngineConfig::default();
        bad.aggregation.query_timeout_ms = 0;

        assert!(manager.update(bad).is_err());
        assert_eq!(manager.get().aggregation.query_timeout_ms, 5000);
    }

    #[test]
    fn test_report_options_parsing() {
        let options = ReportOptions::from_json(&json!({
            "time_range": "7d",
            "metric_types": ["page_load_time", "bogus"],
            "granularity": "hourly",
            "include_charts": true
        }));

        assert_eq!(options.time_range, TimeRange::Days7);
        assert_eq!(options.metric_types, vec!["page_load_time".to_string()]);
        assert_eq!(options.granularity, TimePeriod::Hourly);
        assert!(options.include_charts);
    }

    #[test]
    fn test_report_options_fall_back_to_defaults() {
        let options = ReportOptions::from_json(&json!({
            "time_range": "forever",
            "metric_types": ["bogus"],
            "granularity": "monthly"
        }));

        assert_eq!(options, ReportOptions::default());
    }
}
