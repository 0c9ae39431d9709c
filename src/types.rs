// ============================================================================
// CORE TYPE SYSTEM
// ============================================================================
// The data that flows through the pipeline: raw samples written by the
// collector, alert events handed to sinks, and analytics snapshots written
// back by the aggregation engine.
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregation::{AggregationReport, MetricGroup};
use crate::error::StoreError;
use crate::report::ReportAction;
use crate::scores::{ScoreCard, TrendDirection};

// ----------------------------------------------------------------------------
// Timestamp - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// High-precision timestamp in nanoseconds since Unix epoch.
/// Serialized as an RFC 3339 string so dashboards can read it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "DateTime<Utc>", from = "DateTime<Utc>")]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a new timestamp from nanoseconds since Unix epoch
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a new timestamp from milliseconds since Unix epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Create a new timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Get the current timestamp with nanosecond precision
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Calculate duration between two timestamps (zero if `earlier` is later)
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as i64))
    }

    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_nanos() as i64))
    }

    /// Half-open range check: `start <= self < end`
    #[inline]
    pub fn is_within(&self, start: Timestamp, end: Timestamp) -> bool {
        self.0 >= start.0 && self.0 < end.0
    }

    /// Midpoint between two timestamps
    #[inline]
    pub fn midpoint(start: Timestamp, end: Timestamp) -> Self {
        Self(start.0 + (end.0 - start.0) / 2)
    }

    /// Round down to nearest interval (for chart bucketing)
    #[inline]
    pub fn floor_to_interval(&self, interval_secs: u64) -> Self {
        let interval_nanos = interval_secs as i64 * 1_000_000_000;
        Self(self.0.div_euclid(interval_nanos) * interval_nanos)
    }

    /// Convert to chrono DateTime<Utc>
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Create from chrono DateTime<Utc>
    #[inline]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(ts: Timestamp) -> Self {
        ts.to_datetime()
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

// ----------------------------------------------------------------------------
// Metric Sample - The Unit Written To The Store
// ----------------------------------------------------------------------------

/// A single observed value. Immutable once handed to a store: the builder
/// methods consume the sample and nothing exposes `&mut` access afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric_type: CompactString,
    pub value: f64,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl MetricSample {
    /// Create a sample stamped with the current time
    pub fn new(metric_type: impl Into<CompactString>, value: f64) -> Self {
        Self::at(metric_type, value, Timestamp::now())
    }

    /// Create a sample with an explicit timestamp
    pub fn at(metric_type: impl Into<CompactString>, value: f64, timestamp: Timestamp) -> Self {
        Self {
            metric_type: metric_type.into(),
            value,
            timestamp,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// HTTP status carried by API samples, if any
    pub fn status_code(&self) -> Option<u16> {
        self.label("status").and_then(|s| s.parse().ok())
    }
}

// ----------------------------------------------------------------------------
// Severity & Alert Events
// ----------------------------------------------------------------------------

/// Severity level for alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised synchronously when a recorded value crosses a fixed threshold.
/// Handed to an [`AlertSink`](crate::alert::AlertSink) and not retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub metric_type: CompactString,
    /// Page, endpoint or other key the value was recorded against
    pub key: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub message: String,
    pub timestamp: Timestamp,
}

impl AlertEvent {
    pub fn new(
        metric_type: impl Into<CompactString>,
        key: impl Into<String>,
        value: f64,
        threshold: f64,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            metric_type: metric_type.into(),
            key: key.into(),
            value,
            threshold,
            severity,
            message: message.into(),
            timestamp: Timestamp::now(),
        }
    }
}

// ----------------------------------------------------------------------------
// Time Period (Aggregation Granularity)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimePeriod {
    Hourly,
    #[default]
    Daily,
    Weekly,
}

impl TimePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimePeriod::Hourly => "hourly",
            TimePeriod::Daily => "daily",
            TimePeriod::Weekly => "weekly",
        }
    }

    /// Chart bucket width in seconds
    pub fn bucket_secs(&self) -> u64 {
        match self {
            TimePeriod::Hourly => 3600,
            TimePeriod::Daily => 86_400,
            TimePeriod::Weekly => 7 * 86_400,
        }
    }
}

impl FromStr for TimePeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" => Ok(TimePeriod::Hourly),
            "daily" => Ok(TimePeriod::Daily),
            "weekly" => Ok(TimePeriod::Weekly),
            other => Err(format!("unknown granularity '{other}'")),
        }
    }
}

// ----------------------------------------------------------------------------
// Analytics Snapshot - Durable Record Of An Aggregation
// ----------------------------------------------------------------------------

/// Current schema version of [`SnapshotMetadata`].
pub const SNAPSHOT_SCHEMA_VERSION: u16 = 1;

/// Written once per aggregation call; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub id: Uuid,
    pub metric_type: CompactString,
    /// Top-level score of the report the snapshot was taken for
    pub value: f64,
    pub metadata: SnapshotMetadata,
    pub time_period: TimePeriod,
    pub period_start: Timestamp,
    pub period_end: Timestamp,
    pub aggregation_level: CompactString,
    pub created_at: Timestamp,
}

/// Versioned snapshot payload. Readers call [`SnapshotMetadata::validate`]
/// before trusting the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub schema_version: u16,
    pub payload: SnapshotPayload,
}

impl SnapshotMetadata {
    pub fn new(payload: SnapshotPayload) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            payload,
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(StoreError::Serialization {
                message: format!(
                    "unsupported snapshot schema version {} (expected {})",
                    self.schema_version, SNAPSHOT_SCHEMA_VERSION
                ),
            });
        }
        Ok(())
    }
}

/// One variant per report kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotPayload {
    SystemOverview {
        health: ScoreCard,
        performance: ScoreCard,
        security: ScoreCard,
        partial: bool,
    },
    Performance {
        performance: ScoreCard,
        groups: BTreeMap<String, MetricGroup>,
        trends: BTreeMap<String, TrendDirection>,
        partial: bool,
    },
    Security {
        security: ScoreCard,
        critical_events: u64,
        failed_actions: u64,
        partial: bool,
    },
    AdminReport {
        aggregation: Box<AggregationReport>,
    },
}

impl SnapshotPayload {
    /// Build the payload matching `action` from a finished aggregation.
    pub fn from_report(action: ReportAction, report: &AggregationReport) -> Self {
        match action {
            ReportAction::SystemOverview => SnapshotPayload::SystemOverview {
                health: report.health.clone(),
                performance: report.performance.clone(),
                security: report.security.clone(),
                partial: report.partial,
            },
            ReportAction::PerformanceMetrics => SnapshotPayload::Performance {
                performance: report.performance.clone(),
                groups: report.groups.clone(),
                trends: report.trends.clone(),
                partial: report.partial,
            },
            ReportAction::SecurityDashboard => SnapshotPayload::Security {
                security: report.security.clone(),
                critical_events: report.critical_events,
                failed_actions: report.failed_actions,
                partial: report.partial,
            },
            ReportAction::AdminReport => SnapshotPayload::AdminReport {
                aggregation: Box::new(report.clone()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_operations() {
        let ts1 = Timestamp::from_secs(1_000);
        let ts2 = ts1.add_duration(Duration::from_millis(1500));

        assert!(ts2 > ts1);
        assert_eq!(ts2.duration_since(ts1).as_millis(), 1500);
        assert_eq!(ts1.duration_since(ts2), Duration::ZERO);
        assert_eq!(ts2.sub_duration(Duration::from_millis(1500)), ts1);
    }

    #[test]
    fn test_timestamp_window_is_half_open() {
        let start = Timestamp::from_secs(10);
        let end = Timestamp::from_secs(20);

        assert!(start.is_within(start, end));
        assert!(!end.is_within(start, end));
        assert_eq!(Timestamp::midpoint(start, end), Timestamp::from_secs(15));
    }

    #[test]
    fn test_timestamp_serializes_as_rfc3339() {
        let ts = Timestamp::from_secs(0);
        let json = serde_json::to_string(&ts).unwrap();
        assert!(json.starts_with("\"1970-01-01T00:00:00"));

        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn test_floor_to_interval() {
        let ts = Timestamp::from_secs(3600 * 5 + 42);
        assert_eq!(ts.floor_to_interval(3600), Timestamp::from_secs(3600 * 5));
    }

    #[test]
    fn test_sample_labels() {
        let sample = MetricSample::new("api_response_time", 120.0)
            .with_label("endpoint", "/users")
            .with_label("status", "503");

        assert_eq!(sample.label("endpoint"), Some("/users"));
        assert_eq!(sample.status_code(), Some(503));
        assert_eq!(sample.label("missing"), None);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert_eq!(Severity::Warning.to_string(), "warning");
    }

    #[test]
    fn test_time_period_parsing() {
        assert_eq!("Hourly".parse::<TimePeriod>(), Ok(TimePeriod::Hourly));
        assert_eq!("weekly".parse::<TimePeriod>(), Ok(TimePeriod::Weekly));
        assert!("monthly".parse::<TimePeriod>().is_err());
        assert_eq!(TimePeriod::default(), TimePeriod::Daily);
    }

    #[test]
    fn test_snapshot_metadata_rejects_unknown_version() {
        let mut metadata = SnapshotMetadata::new(SnapshotPayload::Security {
            security: ScoreCard::measured(100.0, Vec::new()),
            critical_events: 0,
            failed_actions: 0,
            partial: false,
        });
        assert!(metadata.validate().is_ok());

        metadata.schema_version = 99;
        assert!(metadata.validate().is_err());
    }
}
