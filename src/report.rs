// ============================================================================
// REPORT GENERATION
// ============================================================================
// Turns an aggregation into what a dashboard shows: threshold alerts ranked
// by severity, one recommendation per alert, a one-line summary, and a
// report body per action.
// ============================================================================

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregation::{AggregationReport, MetricGroup};
use crate::collector::CollectorSnapshot;
use crate::config::ReportThresholds;
use crate::error::PulseError;
use crate::metric_types;
use crate::scores::{ScoreCard, ScoreStatus, TrendDirection};
use crate::stats::StatSummary;
use crate::types::{Severity, TimePeriod, Timestamp};

// ----------------------------------------------------------------------------
// Actions
// ----------------------------------------------------------------------------

/// The four report actions the API dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportAction {
    #[serde(rename = "get_system_overview")]
    SystemOverview,
    #[serde(rename = "get_performance_metrics")]
    PerformanceMetrics,
    #[serde(rename = "get_security_dashboard")]
    SecurityDashboard,
    #[serde(rename = "generate_admin_report")]
    AdminReport,
}

impl ReportAction {
    pub const ALL: [ReportAction; 4] = [
        ReportAction::SystemOverview,
        ReportAction::PerformanceMetrics,
        ReportAction::SecurityDashboard,
        ReportAction::AdminReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportAction::SystemOverview => "get_system_overview",
            ReportAction::PerformanceMetrics => "get_performance_metrics",
            ReportAction::SecurityDashboard => "get_security_dashboard",
            ReportAction::AdminReport => "generate_admin_report",
        }
    }
}

impl Display for ReportAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportAction {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| PulseError::UnknownAction {
                action: s.to_string(),
            })
    }
}

// ----------------------------------------------------------------------------
// Alerts & Recommendations
// ----------------------------------------------------------------------------

/// A threshold breach found in aggregated data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportAlert {
    pub metric_type: String,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
}

impl ReportAlert {
    fn new(metric_type: &str, severity: Severity, value: f64, threshold: f64, message: String) -> Self {
        Self {
            metric_type: metric_type.to_string(),
            severity,
            value,
            threshold,
            message,
        }
    }

    /// How far past its threshold the value is; larger is worse.
    pub fn breach_ratio(&self) -> f64 {
        if self.metric_type == HEALTH_SCORE {
            // lower is worse for health
            if self.value <= 0.0 {
                f64::MAX
            } else {
                self.threshold / self.value
            }
        } else if self.threshold > 0.0 {
            self.value / self.threshold
        } else {
            self.value
        }
    }
}

/// Pseudo metric type for health-score alerts
pub const HEALTH_SCORE: &str = "health_score";

fn recommendation_for(metric_type: &str) -> &'static str {
    match metric_type {
        metric_types::PAGE_LOAD_TIME => {
            "Reduce page weight: compress and lazy-load images, split large bundles and cache static assets."
        }
        metric_types::API_RESPONSE_TIME => {
            "Profile slow endpoints, add indexes for frequent queries and cache expensive responses."
        }
        metric_types::ERROR_RATE => {
            "Inspect server logs for the failing endpoints and add retries or fallbacks for transient faults."
        }
        HEALTH_SCORE => {
            "Check the degraded components' availability history and restore failing services first."
        }
        metric_types::SECURITY_CRITICAL_EVENT => {
            "Review the critical security events now and rotate any credentials that may be exposed."
        }
        metric_types::CUMULATIVE_LAYOUT_SHIFT => {
            "Reserve space for images and embeds so content does not move while the page loads."
        }
        metric_types::FIRST_INPUT_DELAY => {
            "Break up long main-thread tasks and defer non-critical scripts to improve input responsiveness."
        }
        _ => "Investigate the metric's recent history for the cause of the change.",
    }
}

// ----------------------------------------------------------------------------
// Report Bodies
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportWindow {
    pub since: Timestamp,
    pub until: Timestamp,
    pub granularity: TimePeriod,
    pub generated_at: Timestamp,
}

impl ReportWindow {
    fn of(report: &AggregationReport) -> Self {
        Self {
            since: report.since,
            until: report.until,
            granularity: report.granularity,
            generated_at: report.generated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemOverview {
    pub window: ReportWindow,
    pub health: ScoreCard,
    pub performance: ScoreCard,
    pub security: ScoreCard,
    pub summary: String,
    pub alert_count: usize,
    pub critical_alerts: usize,
    pub partial: bool,
    pub failed_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub window: ReportWindow,
    pub performance: ScoreCard,
    pub groups: BTreeMap<String, MetricGroup>,
    pub trends: BTreeMap<String, TrendDirection>,
    pub error_rate: f64,
    pub throughput_per_min: f64,
    pub alerts: Vec<ReportAlert>,
    pub partial: bool,
    pub failed_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityReport {
    pub window: ReportWindow,
    pub security: ScoreCard,
    pub critical_events: u64,
    pub failed_actions: u64,
    pub trends: BTreeMap<String, TrendDirection>,
    pub alerts: Vec<ReportAlert>,
    pub partial: bool,
    pub failed_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminReport {
    pub window: ReportWindow,
    pub executive_summary: String,
    pub summary: String,
    pub health: ScoreCard,
    pub performance: ScoreCard,
    pub security: ScoreCard,
    pub alerts: Vec<ReportAlert>,
    pub recommendations: Vec<String>,
    pub groups: BTreeMap<String, MetricGroup>,
    pub trends: BTreeMap<String, TrendDirection>,
    pub partial: bool,
    pub failed_types: Vec<String>,
    pub snapshot_persisted: bool,
}

/// Report body returned for an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Report {
    SystemOverview(SystemOverview),
    PerformanceMetrics(PerformanceReport),
    SecurityDashboard(SecurityReport),
    AdminReport(AdminReport),
}

impl Report {
    pub fn action(&self) -> ReportAction {
        match self {
            Report::SystemOverview(_) => ReportAction::SystemOverview,
            Report::PerformanceMetrics(_) => ReportAction::PerformanceMetrics,
            Report::SecurityDashboard(_) => ReportAction::SecurityDashboard,
            Report::AdminReport(_) => ReportAction::AdminReport,
        }
    }
}

// ----------------------------------------------------------------------------
// Report Generator
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ReportGenerator {
    thresholds: ReportThresholds,
}

impl ReportGenerator {
    pub fn new(thresholds: ReportThresholds) -> Self {
        Self { thresholds }
    }

    /// Every breached threshold, most severe first.
    pub fn alerts(&self, report: &AggregationReport) -> Vec<ReportAlert> {
        let t = &self.thresholds;
        let mut alerts = Vec::new();
        let group = |metric_type: &str| report.group(metric_type).filter(|g| g.has_data());

        if let Some(pages) = group(metric_types::PAGE_LOAD_TIME) {
            if pages.average > t.page_load_ms {
                let severity = escalate(pages.average, t.page_load_ms);
                alerts.push(ReportAlert::new(
                    metric_types::PAGE_LOAD_TIME,
                    severity,
                    pages.average,
                    t.page_load_ms,
                    format!(
                        "Average page load time is {:.0}ms (threshold {:.0}ms)",
                        pages.average, t.page_load_ms
                    ),
                ));
            }
        }

        if let Some(api) = group(metric_types::API_RESPONSE_TIME) {
            if api.average > t.api_response_ms {
                let severity = escalate(api.average, t.api_response_ms);
                alerts.push(ReportAlert::new(
                    metric_types::API_RESPONSE_TIME,
                    severity,
                    api.average,
                    t.api_response_ms,
                    format!(
                        "Average API response time is {:.0}ms (threshold {:.0}ms)",
                        api.average, t.api_response_ms
                    ),
                ));
            }

            if report.error_rate > t.error_rate {
                alerts.push(ReportAlert::new(
                    metric_types::ERROR_RATE,
                    Severity::Critical,
                    report.error_rate,
                    t.error_rate,
                    format!(
                        "API error rate is {:.1}% (threshold {:.1}%)",
                        report.error_rate * 100.0,
                        t.error_rate * 100.0
                    ),
                ));
            }
        }

        if report.health.status == ScoreStatus::Measured && report.health.score < t.health_warning {
            let (severity, threshold) = if report.health.score < t.health_critical {
                (Severity::Critical, t.health_critical)
            } else {
                (Severity::Warning, t.health_warning)
            };
            alerts.push(ReportAlert::new(
                HEALTH_SCORE,
                severity,
                report.health.score,
                threshold,
                format!(
                    "System health score is {:.1} (threshold {:.0})",
                    report.health.score, threshold
                ),
            ));
        }

        if report.critical_events > 0 {
            alerts.push(ReportAlert::new(
                metric_types::SECURITY_CRITICAL_EVENT,
                Severity::Critical,
                report.critical_events as f64,
                0.0,
                format!("{} critical security event(s) recorded", report.critical_events),
            ));
        }

        if let Some(cls) = group(metric_types::CUMULATIVE_LAYOUT_SHIFT) {
            if cls.average > t.layout_shift {
                alerts.push(ReportAlert::new(
                    metric_types::CUMULATIVE_LAYOUT_SHIFT,
                    Severity::Warning,
                    cls.average,
                    t.layout_shift,
                    format!(
                        "Cumulative layout shift is {:.3} (threshold {:.2})",
                        cls.average, t.layout_shift
                    ),
                ));
            }
        }

        if let Some(fid) = group(metric_types::FIRST_INPUT_DELAY) {
            if fid.average > t.first_input_delay_ms {
                alerts.push(ReportAlert::new(
                    metric_types::FIRST_INPUT_DELAY,
                    Severity::Warning,
                    fid.average,
                    t.first_input_delay_ms,
                    format!(
                        "First input delay is {:.0}ms (threshold {:.0}ms)",
                        fid.average, t.first_input_delay_ms
                    ),
                ));
            }
        }

        rank(&mut alerts);
        alerts
    }

    /// One recommendation per alert, in alert order.
    pub fn recommendations(&self, alerts: &[ReportAlert]) -> Vec<String> {
        alerts
            .iter()
            .map(|alert| recommendation_for(&alert.metric_type).to_string())
            .collect()
    }

    /// Summary line from an aggregation window.
    pub fn summary(&self, report: &AggregationReport) -> String {
        summary_line(
            report.average(metric_types::PAGE_LOAD_TIME),
            report.average(metric_types::API_RESPONSE_TIME),
            report.session_average_ms,
        )
    }

    /// Summary line from an in-process collector snapshot.
    pub fn client_summary(&self, snapshot: &CollectorSnapshot) -> String {
        let api: Vec<&StatSummary> = snapshot.api_calls.values().map(|c| &c.stats).collect();
        summary_line(
            weighted_mean(snapshot.page_loads.values()),
            weighted_mean(api.into_iter()),
            snapshot.engagement.session_duration_ms as f64,
        )
    }

    pub fn executive_summary(&self, report: &AggregationReport, alerts: &[ReportAlert]) -> String {
        let critical = alerts.iter().filter(|a| a.severity == Severity::Critical).count();
        let mut text = format!(
            "System health is {}, performance is {} and security is {}.",
            describe(&report.health),
            describe(&report.performance),
            describe(&report.security)
        );

        if alerts.is_empty() {
            text.push_str(" No thresholds were breached in this period.");
        } else {
            text.push_str(&format!(
                " {} alert(s) need attention, {} of them critical.",
                alerts.len(),
                critical
            ));
        }
        if report.partial {
            text.push_str(&format!(
                " Some data could not be read ({}); figures may be incomplete.",
                report.failed_types.join(", ")
            ));
        }
        text
    }

    pub fn system_overview(&self, report: &AggregationReport) -> SystemOverview {
        let alerts = self.alerts(report);
        SystemOverview {
            window: ReportWindow::of(report),
            health: report.health.clone(),
            performance: report.performance.clone(),
            security: report.security.clone(),
            summary: self.summary(report),
            alert_count: alerts.len(),
            critical_alerts: alerts.iter().filter(|a| a.severity == Severity::Critical).count(),
            partial: report.partial,
            failed_types: report.failed_types.clone(),
        }
    }

    pub fn performance_metrics(&self, report: &AggregationReport) -> PerformanceReport {
        let alerts = self
            .alerts(report)
            .into_iter()
            .filter(|a| a.metric_type != metric_types::SECURITY_CRITICAL_EVENT)
            .collect();
        PerformanceReport {
            window: ReportWindow::of(report),
            performance: report.performance.clone(),
            groups: report.groups.clone(),
            trends: report.trends.clone(),
            error_rate: report.error_rate,
            throughput_per_min: report.throughput_per_min,
            alerts,
            partial: report.partial,
            failed_types: report.failed_types.clone(),
        }
    }

    pub fn security_dashboard(&self, report: &AggregationReport) -> SecurityReport {
        let is_security = |metric_type: &str| metric_type.starts_with("security.");
        SecurityReport {
            window: ReportWindow::of(report),
            security: report.security.clone(),
            critical_events: report.critical_events,
            failed_actions: report.failed_actions,
            trends: report
                .trends
                .iter()
                .filter(|(k, _)| is_security(k.as_str()))
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            alerts: self
                .alerts(report)
                .into_iter()
                .filter(|a| is_security(a.metric_type.as_str()))
                .collect(),
            partial: report.partial,
            failed_types: report.failed_types.clone(),
        }
    }

    pub fn admin_report(&self, report: &AggregationReport) -> AdminReport {
        let alerts = self.alerts(report);
        AdminReport {
            window: ReportWindow::of(report),
            executive_summary: self.executive_summary(report, &alerts),
            summary: self.summary(report),
            health: report.health.clone(),
            performance: report.performance.clone(),
            security: report.security.clone(),
            recommendations: self.recommendations(&alerts),
            alerts,
            groups: report.groups.clone(),
            trends: report.trends.clone(),
            partial: report.partial,
            failed_types: report.failed_types.clone(),
            snapshot_persisted: report.snapshot_persisted,
        }
    }

    /// Build the body matching the report's action.
    pub fn build(&self, report: &AggregationReport) -> Report {
        debug!(target: "pulse::report", action = %report.action, "Building report");
        match report.action {
            ReportAction::SystemOverview => Report::SystemOverview(self.system_overview(report)),
            ReportAction::PerformanceMetrics => Report::PerformanceMetrics(self.performance_metrics(report)),
            ReportAction::SecurityDashboard => Report::SecurityDashboard(self.security_dashboard(report)),
            ReportAction::AdminReport => Report::AdminReport(self.admin_report(report)),
        }
    }
}

fn escalate(value: f64, threshold: f64) -> Severity {
    if value > threshold * 2.0 {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

/// Severity descending, then breach ratio descending.
fn rank(alerts: &mut [ReportAlert]) {
    alerts.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.breach_ratio().partial_cmp(&a.breach_ratio()).unwrap_or(Ordering::Equal))
    });
}

fn describe(card: &ScoreCard) -> String {
    match card.status {
        ScoreStatus::Measured => format!("{:.0}/100", card.score),
        ScoreStatus::NoData => "not yet measured".to_string(),
    }
}

fn guard(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

/// Mean across several summaries, weighted by their counts.
fn weighted_mean<'a>(summaries: impl Iterator<Item = &'a StatSummary>) -> f64 {
    let (sum, count) = summaries.fold((0.0, 0u64), |(sum, count), s| {
        (sum + s.mean * s.count as f64, count + s.count)
    });
    if count == 0 { 0.0 } else { sum / count as f64 }
}

/// One sentence for the dashboard header. Empty categories read as 0.
pub fn summary_line(page_load_ms: f64, api_response_ms: f64, session_ms: f64) -> String {
    format!(
        "Pages load in {:.0}ms on average, API calls respond in {:.0}ms, and sessions last {:.1} minutes.",
        guard(page_load_ms),
        guard(api_response_ms),
        guard(session_ms) / 60_000.0
    )
}
