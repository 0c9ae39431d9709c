// ============================================================================
// METRIC COLLECTOR
// ============================================================================
// Synchronous, non-blocking recording API for the producing process:
// - Running mean and approximate percentile per page / endpoint
// - Threshold alerts handed to an `AlertSink` (fire-and-forget)
// - A bounded queue of samples for the flush task to move into the store
//
// Construct one collector per process or session and pass the `Arc` to
// whatever needs to record.
// ============================================================================

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::alert::{AlertSink, TracingAlertSink};
use crate::config::CollectorConfig;
use crate::metric_types;
use crate::stats::{RunningStat, StatSummary};
use crate::types::{AlertEvent, MetricSample, Severity, Timestamp};

// ----------------------------------------------------------------------------
// Internal State
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct ApiCallStats {
    stat: RunningStat,
    total_calls: u64,
    error_count: u64,
    /// Set while the error rate sits above the threshold; the critical alert
    /// fires on the transition only.
    error_alert_active: bool,
}

impl ApiCallStats {
    fn new(window: usize) -> Self {
        Self {
            stat: RunningStat::with_window(window),
            total_calls: 0,
            error_count: 0,
            error_alert_active: false,
        }
    }

    fn error_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.error_count as f64 / self.total_calls as f64
        }
    }
}

#[derive(Debug, Default)]
struct CollectorState {
    page_loads: HashMap<String, RunningStat>,
    api_calls: HashMap<String, ApiCallStats>,
    interactions: HashMap<String, u64>,
    pages_visited: HashSet<String>,
    pending: VecDeque<MetricSample>,
}

// ----------------------------------------------------------------------------
// Snapshot Types
// ----------------------------------------------------------------------------

/// Owned copy of the collector's state at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorSnapshot {
    pub taken_at: Timestamp,
    pub page_loads: BTreeMap<String, StatSummary>,
    pub api_calls: BTreeMap<String, ApiCallSummary>,
    pub interactions: BTreeMap<String, u64>,
    pub engagement: Engagement,
    pub pending_samples: usize,
    pub dropped_samples: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallSummary {
    pub stats: StatSummary,
    pub total_calls: u64,
    pub error_count: u64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Engagement {
    pub session_duration_ms: u64,
    pub distinct_pages: usize,
    /// True while at most one distinct page has been loaded
    pub bounced: bool,
}

// ----------------------------------------------------------------------------
// Metric Collector
// ----------------------------------------------------------------------------

/// In-process metric collector.
#[derive(Debug)]
pub struct MetricCollector {
    config: CollectorConfig,
    sink: Arc<dyn AlertSink>,
    started_at: Instant,
    state: Mutex<CollectorState>,
    dropped_samples: AtomicU64,
    alerts_emitted: AtomicU64,
    sink_failures: AtomicU64,
}

impl MetricCollector {
    pub fn new(config: CollectorConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            config,
            sink,
            started_at: Instant::now(),
            state: Mutex::new(CollectorState::default()),
            dropped_samples: AtomicU64::new(0),
            alerts_emitted: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
        }
    }

    /// Collector with default thresholds that logs its alerts
    pub fn with_defaults() -> Self {
        Self::new(CollectorConfig::default(), Arc::new(TracingAlertSink))
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Record a page load for `key`.
    pub fn record_load(&self, key: &str, duration_ms: f64) {
        if !Self::valid_duration(key, duration_ms) {
            return;
        }

        let threshold = self.config.page_load_threshold_ms;
        {
            let mut state = self.state.lock();
            state
                .page_loads
                .entry(key.to_string())
                .or_insert_with(|| RunningStat::with_window(self.config.percentile_window))
                .record(duration_ms);
            state.pages_visited.insert(key.to_string());

            let sample = MetricSample::new(metric_types::PAGE_LOAD_TIME, duration_ms)
                .with_label("page", key);
            self.enqueue(&mut state, sample);
        }

        trace!(target: "pulse::collector", page = key, duration_ms, "Page load recorded");

        if duration_ms > threshold {
            self.dispatch(AlertEvent::new(
                metric_types::PAGE_LOAD_TIME,
                key,
                duration_ms,
                threshold,
                Severity::Warning,
                format!("Slow page load on '{}': {:.0}ms (threshold {:.0}ms)", key, duration_ms, threshold),
            ));
        }
    }

    /// Record an API call for `key`, optionally with its HTTP status.
    pub fn record_call(&self, key: &str, duration_ms: f64, status_code: Option<u16>) {
        if !Self::valid_duration(key, duration_ms) {
            return;
        }

        let slow_threshold = self.config.api_call_threshold_ms;
        let rate_threshold = self.config.error_rate_threshold;
        let mut error_alert = None;

        {
            let mut state = self.state.lock();
            let calls = state
                .api_calls
                .entry(key.to_string())
                .or_insert_with(|| ApiCallStats::new(self.config.percentile_window));

            calls.stat.record(duration_ms);
            calls.total_calls += 1;
            if status_code.is_some_and(|s| s >= 400) {
                calls.error_count += 1;
            }

            let rate = calls.error_rate();
            if rate > rate_threshold {
                if !calls.error_alert_active {
                    calls.error_alert_active = true;
                    error_alert = Some((rate, calls.error_count, calls.total_calls));
                }
            } else {
                calls.error_alert_active = false;
            }

            let mut sample = MetricSample::new(metric_types::API_RESPONSE_TIME, duration_ms)
                .with_label("endpoint", key);
            if let Some(status) = status_code {
                sample = sample.with_label("status", status.to_string());
            }
            self.enqueue(&mut state, sample);
        }

        trace!(target: "pulse::collector", endpoint = key, duration_ms, status = ?status_code, "API call recorded");

        if duration_ms > slow_threshold {
            self.dispatch(AlertEvent::new(
                metric_types::API_RESPONSE_TIME,
                key,
                duration_ms,
                slow_threshold,
                Severity::Warning,
                format!("Slow API call to '{}': {:.0}ms (threshold {:.0}ms)", key, duration_ms, slow_threshold),
            ));
        }

        if let Some((rate, errors, total)) = error_alert {
            self.dispatch(AlertEvent::new(
                metric_types::ERROR_RATE,
                key,
                rate,
                rate_threshold,
                Severity::Critical,
                format!(
                    "High error rate on '{}': {:.1}% ({} of {} calls failed)",
                    key,
                    rate * 100.0,
                    errors,
                    total
                ),
            ));
        }
    }

    /// Count a user interaction of `kind`. Never alerts.
    pub fn record_interaction(&self, kind: &str) {
        let mut state = self.state.lock();
        *state.interactions.entry(kind.to_string()).or_insert(0) += 1;
        let sample = MetricSample::new(metric_types::INTERACTION, 1.0).with_label("kind", kind);
        self.enqueue(&mut state, sample);
    }

    /// Queue an externally built sample (vitals, periodic samplers).
    pub fn record_sample(&self, sample: MetricSample) {
        let mut state = self.state.lock();
        self.enqueue(&mut state, sample);
    }

    /// Queue the session duration so the server can average it.
    pub fn end_session(&self) {
        let duration_ms = self.session_duration().as_millis() as f64;
        self.record_sample(MetricSample::new(metric_types::SESSION_DURATION, duration_ms));
        debug!(target: "pulse::collector", duration_ms, "Session ended");
    }

    /// Time since the collector was created
    pub fn session_duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Current error rate for an endpoint, if it has seen any calls
    pub fn error_rate(&self, key: &str) -> Option<f64> {
        self.state.lock().api_calls.get(key).map(ApiCallStats::error_rate)
    }

    /// Point-in-time copy of everything the collector knows.
    pub fn snapshot(&self) -> CollectorSnapshot {
        let state = self.state.lock();
        let distinct_pages = state.pages_visited.len();

        CollectorSnapshot {
            taken_at: Timestamp::now(),
            page_loads: state
                .page_loads
                .iter()
                .map(|(k, s)| (k.clone(), s.summary()))
                .collect(),
            api_calls: state
                .api_calls
                .iter()
                .map(|(k, c)| {
                    let summary = ApiCallSummary {
                        stats: c.stat.summary(),
                        total_calls: c.total_calls,
                        error_count: c.error_count,
                        error_rate: c.error_rate(),
                    };
                    (k.clone(), summary)
                })
                .collect(),
            interactions: state.interactions.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            engagement: Engagement {
                session_duration_ms: self.session_duration().as_millis() as u64,
                distinct_pages,
                bounced: distinct_pages <= 1,
            },
            pending_samples: state.pending.len(),
            dropped_samples: self.dropped_samples.load(AtomicOrdering::Relaxed),
        }
    }

    /// Take up to `max` queued samples, oldest first.
    pub fn drain_pending(&self, max: usize) -> Vec<MetricSample> {
        let mut state = self.state.lock();
        let n = max.min(state.pending.len());
        state.pending.drain(..n).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(AtomicOrdering::Relaxed)
    }

    pub fn alerts_emitted(&self) -> u64 {
        self.alerts_emitted.load(AtomicOrdering::Relaxed)
    }

    // ------------------------------------------------------------------------

    fn valid_duration(key: &str, duration_ms: f64) -> bool {
        if duration_ms.is_finite() && duration_ms >= 0.0 {
            true
        } else {
            warn!(target: "pulse::collector", key, duration_ms, "Ignoring invalid duration");
            false
        }
    }

    /// Queue a sample, dropping the oldest one when the queue is full.
    fn enqueue(&self, state: &mut CollectorState, sample: MetricSample) {
        if state.pending.len() >= self.config.pending_capacity {
            state.pending.pop_front();
            let dropped = self.dropped_samples.fetch_add(1, AtomicOrdering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(target: "pulse::collector", dropped, "Pending sample queue full, dropping oldest");
            }
        }
        state.pending.push_back(sample);
    }

    fn dispatch(&self, event: AlertEvent) {
        self.alerts_emitted.fetch_add(1, AtomicOrdering::Relaxed);
        if let Err(e) = self.sink.emit(event) {
            self.sink_failures.fetch_add(1, AtomicOrdering::Relaxed);
            warn!(target: "pulse::collector", error = %e, "Alert sink rejected event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::ChannelAlertSink;
    use tokio::sync::mpsc::Receiver;

    fn collector() -> (MetricCollector, Receiver<AlertEvent>) {
        let (sink, rx) = ChannelAlertSink::new(64);
        (MetricCollector::new(CollectorConfig::default(), Arc::new(sink)), rx)
    }

    fn drain(rx: &mut Receiver<AlertEvent>) -> Vec<AlertEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_slow_home_page_alerts_once() {
        let (collector, mut rx) = collector();
        for ms in [1000.0, 4000.0, 500.0] {
            collector.record_load("home", ms);
        }

        let alerts = drain(&mut rx);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(alerts[0].value, 4000.0);
        assert_eq!(alerts[0].key, "home");

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.page_loads["home"].count, 3);
        assert!((snapshot.page_loads["home"].mean - 5500.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_boundary_does_not_fire() {
        let (collector, mut rx) = collector();
        collector.record_load("home", 3000.0);
        collector.record_call("/api", 2000.0, Some(200));
        assert!(drain(&mut rx).is_empty());

        collector.record_load("home", 3000.5);
        collector.record_call("/api", 2000.5, Some(200));
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn test_error_rate_scenario() {
        let (collector, mut rx) = collector();
        for i in 0..20 {
            let status = if i == 7 || i == 13 { 500 } else { 200 };
            collector.record_call("/api/orders", 120.0, Some(status));
        }

        assert!((collector.error_rate("/api/orders").unwrap() - 0.10).abs() < 1e-12);

        let alerts = drain(&mut rx);
        let critical: Vec<_> = alerts.iter().filter(|a| a.severity == Severity::Critical).collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].metric_type.as_str(), metric_types::ERROR_RATE);
    }

    #[test]
    fn test_error_rate_non_decreasing_in_failure_burst() {
        let (collector, _rx) = collector();
        for _ in 0..10 {
            collector.record_call("/api", 50.0, Some(200));
        }

        let mut previous = 0.0;
        for i in 1..=10u64 {
            collector.record_call("/api", 50.0, Some(503));
            let rate = collector.error_rate("/api").unwrap();
            assert!((rate - i as f64 / (10 + i) as f64).abs() < 1e-12);
            assert!(rate >= previous);
            previous = rate;
        }
    }

    #[test]
    fn test_error_alert_rearms_after_recovery() {
        let (collector, mut rx) = collector();
        collector.record_call("/api", 10.0, Some(500)); // 1/1 -> fires
        collector.record_call("/api", 10.0, Some(500)); // still above, silent
        for _ in 0..40 {
            collector.record_call("/api", 10.0, Some(200)); // drops to 2/42
        }
        collector.record_call("/api", 10.0, Some(500)); // 3/43 ~ 0.0698 -> fires again

        let critical = drain(&mut rx)
            .into_iter()
            .filter(|a| a.severity == Severity::Critical)
            .count();
        assert_eq!(critical, 2);
    }

    #[test]
    fn test_call_without_status_is_not_an_error() {
        let (collector, _rx) = collector();
        collector.record_call("/api", 10.0, None);
        assert_eq!(collector.error_rate("/api"), Some(0.0));
    }

    #[test]
    fn test_interactions_and_engagement() {
        let (collector, mut rx) = collector();
        collector.record_interaction("click");
        collector.record_interaction("click");
        collector.record_interaction("scroll");
        collector.record_load("home", 100.0);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.interactions["click"], 2);
        assert_eq!(snapshot.interactions["scroll"], 1);
        assert_eq!(snapshot.engagement.distinct_pages, 1);
        assert!(snapshot.engagement.bounced);
        assert!(drain(&mut rx).is_empty());

        collector.record_load("pricing", 100.0);
        collector.record_load("home", 100.0);
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.engagement.distinct_pages, 2);
        assert!(!snapshot.engagement.bounced);
    }

    #[test]
    fn test_snapshot_is_detached_from_collector() {
        let (collector, _rx) = collector();
        collector.record_load("home", 100.0);

        let mut snapshot = collector.snapshot();
        snapshot.page_loads.clear();
        snapshot.interactions.insert("forged".into(), 99);

        let fresh = collector.snapshot();
        assert_eq!(fresh.page_loads["home"].count, 1);
        assert!(!fresh.interactions.contains_key("forged"));
    }

    #[test]
    fn test_pending_queue_drops_oldest_when_full() {
        let config = CollectorConfig {
            pending_capacity: 3,
            ..CollectorConfig::default()
        };
        let collector = MetricCollector::new(config, Arc::new(TracingAlertSink));
        for ms in [1.0, 2.0, 3.0, 4.0, 5.0] {
            collector.record_load("home", ms);
        }

        assert_eq!(collector.dropped_samples(), 2);
        let drained = collector.drain_pending(10);
        let values: Vec<f64> = drained.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![3.0, 4.0, 5.0]);
        assert_eq!(collector.pending_len(), 0);
    }

    #[test]
    fn test_samples_carry_labels() {
        let (collector, _rx) = collector();
        collector.record_call("/users", 80.0, Some(404));
        collector.record_load("home", 900.0);

        let samples = collector.drain_pending(10);
        assert_eq!(samples[0].metric_type.as_str(), metric_types::API_RESPONSE_TIME);
        assert_eq!(samples[0].label("endpoint"), Some("/users"));
        assert_eq!(samples[0].status_code(), Some(404));
        assert_eq!(samples[1].label("page"), Some("home"));
    }

    #[test]
    fn test_sink_failure_is_swallowed() {
        let (sink, rx) = ChannelAlertSink::new(1);
        drop(rx);
        let collector = MetricCollector::new(CollectorConfig::default(), Arc::new(sink));

        collector.record_load("home", 10_000.0);
        assert_eq!(collector.alerts_emitted(), 1);
        assert_eq!(collector.snapshot().page_loads["home"].count, 1);
    }

    #[test]
    fn test_invalid_durations_are_ignored() {
        let (collector, _rx) = collector();
        collector.record_load("home", f64::NAN);
        collector.record_call("/api", -5.0, Some(200));
        let snapshot = collector.snapshot();
        assert!(snapshot.page_loads.is_empty());
        assert!(snapshot.api_calls.is_empty());
    }

    #[test]
    fn test_end_session_queues_duration() {
        let collector = MetricCollector::with_defaults();
        collector.end_session();
        let samples = collector.drain_pending(1);
        assert_eq!(samples[0].metric_type.as_str(), metric_types::SESSION_DURATION);
    }
}
