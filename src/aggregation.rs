// ============================================================================
// AGGREGATION ENGINE
// ============================================================================
// Stateless per call: resolve a window, query the store once per metric type
// under a deadline, group and score the samples, classify trends, and write
// one analytics snapshot back. A failing metric type degrades the report to
// `partial`; it never fails the request.
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::{AccessDecision, AccessPolicy};
use crate::config::{AggregationConfig, ReportOptions};
use crate::error::{PulseError, PulseResult, StoreError};
use crate::metric_types;
use crate::report::ReportAction;
use crate::scores::{
    classify_trend, half_averages, health_score, performance_score, security_score, PerformanceInputs,
    Polarity, ScoreCard, TrendDirection, HEALTH_COMPONENTS,
};
use crate::store::MetricStore;
use crate::types::{AnalyticsSnapshot, MetricSample, SnapshotMetadata, SnapshotPayload, TimePeriod, Timestamp};

// ----------------------------------------------------------------------------
// Time Range
// ----------------------------------------------------------------------------

/// Report window ending now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    Hour1,
    #[default]
    #[serde(rename = "24h")]
    Hours24,
    #[serde(rename = "7d")]
    Days7,
    #[serde(rename = "30d")]
    Days30,
    #[serde(rename = "90d")]
    Days90,
}

impl TimeRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::Hour1 => "1h",
            TimeRange::Hours24 => "24h",
            TimeRange::Days7 => "7d",
            TimeRange::Days30 => "30d",
            TimeRange::Days90 => "90d",
        }
    }

    pub fn duration(&self) -> Duration {
        const HOUR: u64 = 3600;
        const DAY: u64 = 24 * HOUR;
        Duration::from_secs(match self {
            TimeRange::Hour1 => HOUR,
            TimeRange::Hours24 => DAY,
            TimeRange::Days7 => 7 * DAY,
            TimeRange::Days30 => 30 * DAY,
            TimeRange::Days90 => 90 * DAY,
        })
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1h" => Some(TimeRange::Hour1),
            "24h" => Some(TimeRange::Hours24),
            "7d" => Some(TimeRange::Days7),
            "30d" => Some(TimeRange::Days30),
            "90d" => Some(TimeRange::Days90),
            _ => None,
        }
    }

    /// Parse a range, falling back to 24h for anything unrecognized.
    pub fn parse_or_default(value: &str) -> Self {
        Self::parse(value).unwrap_or_else(|| {
            warn!(target: "pulse::aggregation", time_range = value, "Unknown time range, using 24h");
            TimeRange::default()
        })
    }

    /// `[now - duration, now)`
    pub fn window_ending(&self, now: Timestamp) -> (Timestamp, Timestamp) {
        (now.sub_duration(self.duration()), now)
    }
}

// ----------------------------------------------------------------------------
// Request & Report Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationRequest {
    pub action: ReportAction,
    pub options: ReportOptions,
    /// Bearer credential from the caller, checked before any work
    pub credentials: Option<String>,
}

impl AggregationRequest {
    pub fn new(action: ReportAction) -> Self {
        Self {
            action,
            options: ReportOptions::default(),
            credentials: None,
        }
    }

    pub fn with_options(mut self, options: ReportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_credentials(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }
}

/// Bucket average for chart rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub bucket_start: Timestamp,
    pub average: f64,
    pub count: u64,
}

/// Summary of one metric type over the window. Empty groups are all zeros.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricGroup {
    pub metric_type: String,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
    /// Set when the store query for this type failed or timed out
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<Vec<ChartPoint>>,
}

impl MetricGroup {
    pub fn empty(metric_type: impl Into<String>, partial: bool) -> Self {
        Self {
            metric_type: metric_type.into(),
            average: 0.0,
            min: 0.0,
            max: 0.0,
            count: 0,
            partial,
            series: None,
        }
    }

    pub fn from_samples(metric_type: impl Into<String>, samples: &[MetricSample]) -> Self {
        let mut group = Self::empty(metric_type, false);
        if samples.is_empty() {
            return group;
        }

        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for sample in samples {
            sum += sample.value;
            min = min.min(sample.value);
            max = max.max(sample.value);
        }

        group.count = samples.len() as u64;
        group.average = sum / samples.len() as f64;
        group.min = min;
        group.max = max;
        group
    }

    pub fn has_data(&self) -> bool {
        self.count > 0
    }
}

/// Everything one aggregation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationReport {
    pub action: ReportAction,
    pub since: Timestamp,
    pub until: Timestamp,
    pub granularity: TimePeriod,
    pub groups: BTreeMap<String, MetricGroup>,
    pub trends: BTreeMap<String, TrendDirection>,
    pub performance: ScoreCard,
    pub security: ScoreCard,
    pub health: ScoreCard,
    /// Share of API samples with status >= 400
    pub error_rate: f64,
    pub throughput_per_min: f64,
    /// Mean of completed sessions; periodic in-progress samples are excluded
    pub session_average_ms: f64,
    pub critical_events: u64,
    pub failed_actions: u64,
    pub partial: bool,
    pub failed_types: Vec<String>,
    pub snapshot_persisted: bool,
    pub generated_at: Timestamp,
}

impl AggregationReport {
    /// Group for `metric_type`, if it was queried
    pub fn group(&self, metric_type: &str) -> Option<&MetricGroup> {
        self.groups.get(metric_type)
    }

    /// Average of a group, 0 when absent or empty
    pub fn average(&self, metric_type: &str) -> f64 {
        self.group(metric_type).map_or(0.0, |g| g.average)
    }

    /// Score stored as the snapshot's top-level value
    pub fn headline_score(&self) -> f64 {
        match self.action {
            ReportAction::SystemOverview => self.health.score,
            ReportAction::PerformanceMetrics => self.performance.score,
            ReportAction::SecurityDashboard => self.security.score,
            ReportAction::AdminReport => {
                (self.health.score + self.performance.score + self.security.score) / 3.0
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Aggregation Engine
// ----------------------------------------------------------------------------

/// Types always queried because the scores depend on them.
const SCORE_INPUT_TYPES: [&str; 9] = [
    metric_types::PAGE_LOAD_TIME,
    metric_types::API_RESPONSE_TIME,
    metric_types::SECURITY_CRITICAL_EVENT,
    metric_types::SECURITY_FAILED_ACTION,
    metric_types::UPTIME_DATABASE,
    metric_types::UPTIME_API,
    metric_types::UPTIME_STORAGE,
    metric_types::UPTIME_CACHE,
    metric_types::UPTIME_BACKGROUND_JOBS,
];

enum TypeOutcome {
    Samples(Vec<MetricSample>),
    Failed(StoreError),
}

#[derive(Debug, Clone)]
pub struct AggregationEngine {
    store: Arc<dyn MetricStore>,
    policy: Arc<dyn AccessPolicy>,
    config: AggregationConfig,
}

impl AggregationEngine {
    pub fn new(
        store: Arc<dyn MetricStore>,
        policy: Arc<dyn AccessPolicy>,
        config: AggregationConfig,
    ) -> Self {
        Self {
            store,
            policy,
            config,
        }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Check access, then aggregate the requested window ending now.
    pub async fn aggregate(&self, request: &AggregationRequest) -> PulseResult<AggregationReport> {
        if let AccessDecision::Deny { reason } =
            self.policy.authorize(request.credentials.as_deref()).await
        {
            warn!(target: "pulse::aggregation", action = %request.action, %reason, "Report request denied");
            return Err(PulseError::forbidden(reason));
        }

        let (since, until) = request.options.time_range.window_ending(Timestamp::now());
        Ok(self
            .aggregate_window(request.action, &request.options, since, until)
            .await)
    }

    /// Aggregate an explicit `[since, until)` window. Never fails: store
    /// problems surface as `partial` groups.
    pub async fn aggregate_window(
        &self,
        action: ReportAction,
        options: &ReportOptions,
        since: Timestamp,
        until: Timestamp,
    ) -> AggregationReport {
        let started = std::time::Instant::now();
        let types = Self::types_to_query(options);
        let outcomes = self.query_all(&types, since, until).await;

        let mut groups = BTreeMap::new();
        let mut trends = BTreeMap::new();
        let mut failed_types = Vec::new();
        let mut samples_by_type: BTreeMap<&str, Vec<MetricSample>> = BTreeMap::new();

        for (metric_type, outcome) in types.iter().zip(outcomes) {
            match outcome {
                TypeOutcome::Samples(samples) => {
                    let mut group = MetricGroup::from_samples(metric_type.as_str(), &samples);
                    if options.include_charts {
                        group.series = Some(bucket_series(&samples, options.granularity));
                    }
                    if group.has_data() {
                        let (prior, recent) = half_averages(&samples, since, until);
                        let trend = classify_trend(
                            prior,
                            recent,
                            Polarity::of(metric_type),
                            self.config.trend_threshold,
                        );
                        trends.insert(metric_type.clone(), trend);
                    }
                    groups.insert(metric_type.clone(), group);
                    samples_by_type.insert(metric_type.as_str(), samples);
                }
                TypeOutcome::Failed(e) => {
                    warn!(
                        target: "pulse::aggregation",
                        metric_type = %metric_type,
                        error = %e,
                        "Metric query failed, reporting partial results"
                    );
                    groups.insert(metric_type.clone(), MetricGroup::empty(metric_type.as_str(), true));
                    failed_types.push(metric_type.clone());
                }
            }
        }

        let api_samples = samples_by_type
            .get(metric_types::API_RESPONSE_TIME)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let api_errors = api_samples
            .iter()
            .filter(|s| s.status_code().is_some_and(|code| code >= 400))
            .count();
        let error_rate = if api_samples.is_empty() {
            0.0
        } else {
            api_errors as f64 / api_samples.len() as f64
        };

        let window_minutes = until.duration_since(since).as_secs_f64() / 60.0;
        let throughput_per_min = if window_minutes > 0.0 {
            api_samples.len() as f64 / window_minutes
        } else {
            0.0
        };

        let session_average_ms = completed_session_average(
            samples_by_type
                .get(metric_types::SESSION_DURATION)
                .map(Vec::as_slice)
                .unwrap_or_default(),
        );

        let count_of = |metric_type: &str| groups.get(metric_type).map_or(0, |g: &MetricGroup| g.count);

        let performance = performance_score(
            &PerformanceInputs {
                api_samples: api_samples.len() as u64,
                page_samples: count_of(metric_types::PAGE_LOAD_TIME),
                api_average_ms: groups
                    .get(metric_types::API_RESPONSE_TIME)
                    .map_or(0.0, |g| g.average),
                throughput_per_min,
                error_rate,
            },
            &self.config,
        );

        let critical_events = count_of(metric_types::SECURITY_CRITICAL_EVENT);
        let failed_actions = count_of(metric_types::SECURITY_FAILED_ACTION);
        let security = security_score(
            critical_events,
            failed_actions,
            critical_events + failed_actions > 0,
        );

        let availability: Vec<(&str, Option<f64>)> = HEALTH_COMPONENTS
            .iter()
            .map(|(name, metric_type)| {
                let mean = groups
                    .get(*metric_type)
                    .filter(|g| g.has_data())
                    .map(|g| g.average);
                (*name, mean)
            })
            .collect();
        let health = health_score(&availability);

        let mut report = AggregationReport {
            action,
            since,
            until,
            granularity: options.granularity,
            groups,
            trends,
            performance,
            security,
            health,
            error_rate,
            throughput_per_min,
            session_average_ms,
            critical_events,
            failed_actions,
            partial: !failed_types.is_empty(),
            failed_types,
            snapshot_persisted: false,
            generated_at: Timestamp::now(),
        };

        report.snapshot_persisted = self.persist_snapshot(&report, options.granularity).await;

        info!(
            target: "pulse::aggregation",
            action = %action,
            types = types.len(),
            partial = report.partial,
            performance = report.performance.score,
            security = report.security.score,
            health = report.health.score,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Aggregation complete"
        );

        report
    }

    fn types_to_query(options: &ReportOptions) -> Vec<String> {
        let mut types: BTreeSet<String> = options
            .metric_types
            .iter()
            .filter(|t| metric_types::is_known(t))
            .cloned()
            .collect();
        types.extend(SCORE_INPUT_TYPES.iter().map(|t| t.to_string()));
        types.into_iter().collect()
    }

    async fn query_all(&self, types: &[String], since: Timestamp, until: Timestamp) -> Vec<TypeOutcome> {
        let deadline = Duration::from_millis(self.config.query_timeout_ms);

        let queries = types.iter().map(|metric_type| {
            let store = Arc::clone(&self.store);
            async move {
                let query = store.query_range(std::slice::from_ref(metric_type), since, until);
                match timeout(deadline, query).await {
                    Ok(Ok(samples)) => TypeOutcome::Samples(samples),
                    Ok(Err(e)) => TypeOutcome::Failed(e),
                    Err(_) => TypeOutcome::Failed(StoreError::Timeout {
                        operation: format!("query_range({metric_type})"),
                        timeout_ms: deadline.as_millis() as u64,
                    }),
                }
            }
        });

        join_all(queries).await
    }

    async fn persist_snapshot(&self, report: &AggregationReport, granularity: TimePeriod) -> bool {
        let snapshot = AnalyticsSnapshot {
            id: Uuid::new_v4(),
            metric_type: report.action.as_str().into(),
            value: report.headline_score(),
            metadata: SnapshotMetadata::new(SnapshotPayload::from_report(report.action, report)),
            time_period: granularity,
            period_start: report.since,
            period_end: report.until,
            aggregation_level: granularity.as_str().into(),
            created_at: report.generated_at,
        };
        let id = snapshot.id;

        let deadline = Duration::from_millis(self.config.query_timeout_ms);
        match timeout(deadline, self.store.insert_snapshot(snapshot)).await {
            Ok(Ok(())) => {
                debug!(target: "pulse::aggregation", %id, "Snapshot written");
                true
            }
            Ok(Err(e)) => {
                warn!(target: "pulse::aggregation", %id, error = %e, "Snapshot write failed");
                false
            }
            Err(_) => {
                warn!(target: "pulse::aggregation", %id, timeout_ms = deadline.as_millis() as u64, "Snapshot write timed out");
                false
            }
        }
    }
}

/// Average of `session_duration` samples written at session end. Samples
/// labelled `sampled=true` are snapshots of sessions still in progress.
fn completed_session_average(samples: &[MetricSample]) -> f64 {
    let (sum, count) = samples
        .iter()
        .filter(|s| s.label("sampled") != Some("true"))
        .fold((0.0, 0u64), |(sum, count), s| (sum + s.value, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Average per granularity bucket, oldest bucket first.
fn bucket_series(samples: &[MetricSample], granularity: TimePeriod) -> Vec<ChartPoint> {
    let mut buckets: BTreeMap<Timestamp, (f64, u64)> = BTreeMap::new();
    for sample in samples {
        let bucket = buckets
            .entry(sample.timestamp.floor_to_interval(granularity.bucket_secs()))
            .or_insert((0.0, 0));
        bucket.0 += sample.value;
        bucket.1 += 1;
    }

    buckets
        .into_iter()
        .map(|(bucket_start, (sum, count))| ChartPoint {
            bucket_start,
            average: sum / count as f64,
            count,
        })
        .collect()
}
