//! # Pulse Engine - Telemetry Pipeline
//!
//! In-process metric collection with online statistics, paired with a
//! server-side aggregation engine that turns stored samples into
//! time-windowed scores, trend classifications and reports.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              PULSE ENGINE                                    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  COLLECTOR/VITALS → FLUSH TASK → STORE → AGGREGATION → REPORT → HTTP API    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`collector::MetricCollector`] records page loads, API calls and
//!   interactions synchronously, keeps a running mean and an approximate
//!   percentile per key, and raises threshold alerts.
//! - [`vitals::VitalsObserver`] tracks three runtime performance signals
//!   through explicit, cancellable subscriptions.
//! - [`flush`] moves queued samples into a [`store::MetricStore`] from a
//!   cancellable background task.
//! - [`aggregation::AggregationEngine`] reads a window of samples and derives
//!   performance, security and health scores plus per-metric trends.
//! - [`report::ReportGenerator`] turns aggregation output into alerts,
//!   recommendations and a one-line summary.
//! - [`api`] exposes the action-dispatch HTTP endpoint.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod access;
pub mod aggregation;
pub mod alert;
pub mod api;
pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod flush;
pub mod logging;
pub mod report;
pub mod scores;
pub mod stats;
pub mod store;
pub mod types;
pub mod vitals;

pub use access::{AccessDecision, AccessPolicy, AllowAll, StaticTokenPolicy};
pub use aggregation::{AggregationEngine, AggregationReport, AggregationRequest, MetricGroup};
pub use alert::{AlertSink, ChannelAlertSink, TracingAlertSink};
pub use collector::{CollectorSnapshot, MetricCollector};
pub use config::{EngineConfig, ReportOptions};
pub use engine::Engine;
pub use error::{PulseError, PulseResult, StoreError, StoreResult};
pub use report::{Report, ReportAction, ReportGenerator};
pub use scores::{ScoreCard, ScoreStatus, TrendDirection};
pub use stats::RunningStat;
pub use store::{JsonlStore, MemoryStore, MetricStore};
pub use types::{AlertEvent, AnalyticsSnapshot, MetricSample, Severity, TimePeriod, Timestamp};
pub use vitals::{VitalSignal, VitalsBus, VitalsObserver, VitalsSource};

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "pulse-engine";
pub const ENGINE_FULL_NAME: &str = "Pulse Telemetry Engine";

// ----------------------------------------------------------------------------
// Collector Thresholds
// ----------------------------------------------------------------------------

/// Page loads slower than this raise a warning (milliseconds)
pub const DEFAULT_PAGE_LOAD_THRESHOLD_MS: f64 = 3000.0;

/// API calls slower than this raise a warning (milliseconds)
pub const DEFAULT_API_CALL_THRESHOLD_MS: f64 = 2000.0;

/// Per-endpoint error rate above which a critical alert fires
pub const DEFAULT_ERROR_RATE_THRESHOLD: f64 = 0.05;

/// Number of recent values kept per key for percentile estimation
pub const DEFAULT_PERCENTILE_WINDOW: usize = 100;

/// Maximum samples queued between flushes before the oldest are dropped
pub const DEFAULT_PENDING_CAPACITY: usize = 10_000;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Interval between flushes of queued samples to the store (seconds)
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 10;

/// Interval for periodic engagement sampling (seconds)
pub const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 30;

/// Deadline for a single store query during aggregation (milliseconds)
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5000;

/// Maximum samples inserted per flush cycle
pub const FLUSH_BATCH_SIZE: usize = 1024;

/// Grace period for shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

// ----------------------------------------------------------------------------
// Network
// ----------------------------------------------------------------------------

/// Default HTTP API bind address
pub const DEFAULT_API_ADDR: &str = "0.0.0.0:8080";

/// Deadline for building one report over HTTP (seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum accepted request body (bytes)
pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

// ----------------------------------------------------------------------------
// Known Metric Types
// ----------------------------------------------------------------------------

/// Metric type keys understood by the aggregation and report layers.
pub mod metric_types {
    pub const PAGE_LOAD_TIME: &str = "page_load_time";
    pub const API_RESPONSE_TIME: &str = "api_response_time";
    pub const INTERACTION: &str = "interaction";
    pub const SESSION_DURATION: &str = "session_duration";
    pub const SECURITY_CRITICAL_EVENT: &str = "security.critical_event";
    pub const SECURITY_FAILED_ACTION: &str = "security.failed_action";
    pub const UPTIME_DATABASE: &str = "uptime.database";
    pub const UPTIME_API: &str = "uptime.api";
    pub const UPTIME_STORAGE: &str = "uptime.storage";
    pub const UPTIME_CACHE: &str = "uptime.cache";
    pub const UPTIME_BACKGROUND_JOBS: &str = "uptime.background_jobs";
    pub const CUMULATIVE_LAYOUT_SHIFT: &str = "vitals.cumulative_layout_shift";
    pub const LOAD_COMPLETE: &str = "vitals.load_complete";
    pub const FIRST_INPUT_DELAY: &str = "vitals.first_input_delay";

    /// Derived during aggregation from API samples; never stored directly.
    pub const ERROR_RATE: &str = "error_rate";

    /// Latency of the report server's own requests. Stored for operators,
    /// never read by any score.
    pub const SERVER_REQUEST_TIME: &str = "server.request_time";

    /// Every storable metric type, in reporting order.
    pub const ALL: [&str; 14] = [
        PAGE_LOAD_TIME,
        API_RESPONSE_TIME,
        INTERACTION,
        SESSION_DURATION,
        SECURITY_CRITICAL_EVENT,
        SECURITY_FAILED_ACTION,
        UPTIME_DATABASE,
        UPTIME_API,
        UPTIME_STORAGE,
        UPTIME_CACHE,
        UPTIME_BACKGROUND_JOBS,
        CUMULATIVE_LAYOUT_SHIFT,
        LOAD_COMPLETE,
        FIRST_INPUT_DELAY,
    ];

    /// Check whether a metric type is one the engine knows how to aggregate.
    pub fn is_known(metric_type: &str) -> bool {
        ALL.contains(&metric_type)
    }
}
