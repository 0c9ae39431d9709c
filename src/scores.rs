// ============================================================================
// COMPOSITE SCORES & TREND CLASSIFICATION
// ============================================================================
// Pure functions over aggregated inputs. Scores are recomputed on every
// aggregation and never cached; "no data" is a status, not an error.
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::config::AggregationConfig;
use crate::metric_types;
use crate::types::{MetricSample, Timestamp};

// ----------------------------------------------------------------------------
// Score Card
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreStatus {
    Measured,
    /// Nothing in the window to score; `score` holds the documented default
    NoData,
}

/// One input that contributed to a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponent {
    pub name: String,
    /// Observed value; `None` when the component had no data
    pub value: Option<f64>,
    /// Points added to (positive) or removed from (negative) the score
    pub impact: f64,
}

impl ScoreComponent {
    pub fn new(name: impl Into<String>, value: Option<f64>, impact: f64) -> Self {
        Self {
            name: name.into(),
            value,
            impact,
        }
    }
}

/// A 0-100 score with how it was reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreCard {
    pub score: f64,
    pub status: ScoreStatus,
    pub components: Vec<ScoreComponent>,
}

impl ScoreCard {
    pub fn measured(score: f64, components: Vec<ScoreComponent>) -> Self {
        Self {
            score: score.clamp(0.0, 100.0),
            status: ScoreStatus::Measured,
            components,
        }
    }

    pub fn no_data(default_score: f64) -> Self {
        Self {
            score: default_score,
            status: ScoreStatus::NoData,
            components: Vec::new(),
        }
    }

    pub fn has_data(&self) -> bool {
        self.status == ScoreStatus::Measured
    }
}

// ----------------------------------------------------------------------------
// Performance
// ----------------------------------------------------------------------------

/// Window figures the performance score is computed from.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerformanceInputs {
    pub api_samples: u64,
    pub page_samples: u64,
    pub api_average_ms: f64,
    pub throughput_per_min: f64,
    pub error_rate: f64,
}

/// Start at 100 and subtract a fixed penalty per breached rule.
pub fn performance_score(inputs: &PerformanceInputs, config: &AggregationConfig) -> ScoreCard {
    if inputs.api_samples == 0 && inputs.page_samples == 0 {
        return ScoreCard::no_data(0.0);
    }

    let penalty = |breached: bool, points: f64| if breached { -points } else { 0.0 };

    let components = vec![
        ScoreComponent::new(
            metric_types::API_RESPONSE_TIME,
            (inputs.api_samples > 0).then_some(inputs.api_average_ms),
            penalty(
                inputs.api_average_ms > config.response_time_threshold_ms,
                config.response_time_penalty,
            ),
        ),
        ScoreComponent::new(
            "throughput_per_min",
            Some(inputs.throughput_per_min),
            penalty(
                inputs.throughput_per_min < config.min_throughput_per_min,
                config.throughput_penalty,
            ),
        ),
        ScoreComponent::new(
            metric_types::ERROR_RATE,
            Some(inputs.error_rate),
            penalty(inputs.error_rate > config.error_rate_threshold, config.error_rate_penalty),
        ),
    ];

    let score = 100.0 + components.iter().map(|c| c.impact).sum::<f64>();
    ScoreCard::measured(score.max(0.0), components)
}

// ----------------------------------------------------------------------------
// Security
// ----------------------------------------------------------------------------

const CRITICAL_EVENT_PENALTY: f64 = 10.0;
const FAILED_ACTION_PENALTY: f64 = 5.0;

/// `100 - 10 * critical - 5 * failed`, floored at zero. A window with no
/// security samples at all scores a neutral 100.
pub fn security_score(critical_events: u64, failed_actions: u64, has_data: bool) -> ScoreCard {
    if !has_data {
        return ScoreCard::no_data(100.0);
    }

    let components = vec![
        ScoreComponent::new(
            metric_types::SECURITY_CRITICAL_EVENT,
            Some(critical_events as f64),
            -(critical_events as f64 * CRITICAL_EVENT_PENALTY),
        ),
        ScoreComponent::new(
            metric_types::SECURITY_FAILED_ACTION,
            Some(failed_actions as f64),
            -(failed_actions as f64 * FAILED_ACTION_PENALTY),
        ),
    ];

    let score = 100.0 + components.iter().map(|c| c.impact).sum::<f64>();
    ScoreCard::measured(score.max(0.0), components)
}

// ----------------------------------------------------------------------------
// Health
// ----------------------------------------------------------------------------

/// Components the health score averages over, with their metric types.
pub const HEALTH_COMPONENTS: [(&str, &str); 5] = [
    ("database", metric_types::UPTIME_DATABASE),
    ("api", metric_types::UPTIME_API),
    ("storage", metric_types::UPTIME_STORAGE),
    ("cache", metric_types::UPTIME_CACHE),
    ("background_jobs", metric_types::UPTIME_BACKGROUND_JOBS),
];

/// Mean uptime percentage over the components that reported.
///
/// `availability` holds each component's mean availability in `[0, 1]`,
/// or `None` when it had no samples; those are listed but not averaged.
pub fn health_score(availability: &[(&str, Option<f64>)]) -> ScoreCard {
    let components: Vec<ScoreComponent> = availability
        .iter()
        .map(|(name, mean)| {
            let pct = mean.map(|m| (m * 100.0).clamp(0.0, 100.0));
            ScoreComponent::new(*name, pct, 0.0)
        })
        .collect();

    let present: Vec<f64> = components.iter().filter_map(|c| c.value).collect();
    if present.is_empty() {
        return ScoreCard::no_data(0.0);
    }

    let score = present.iter().sum::<f64>() / present.len() as f64;
    ScoreCard::measured(score, components)
}

// ----------------------------------------------------------------------------
// Trends
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Declining,
}

/// Whether a rising value is good news for a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    LowerIsBetter,
    HigherIsBetter,
}

impl Polarity {
    pub fn of(metric_type: &str) -> Self {
        if metric_type == metric_types::PAGE_LOAD_TIME
            || metric_type == metric_types::API_RESPONSE_TIME
            || metric_type == metric_types::ERROR_RATE
            || metric_type.starts_with("security.")
            || metric_type.starts_with("vitals.")
        {
            Polarity::LowerIsBetter
        } else {
            Polarity::HigherIsBetter
        }
    }
}

/// Classify the change from `prior` to `recent`. A relative change must be
/// strictly beyond `threshold` to leave `Stable`; a missing half or a zero
/// prior average is always `Stable`.
pub fn classify_trend(
    prior: Option<f64>,
    recent: Option<f64>,
    polarity: Polarity,
    threshold: f64,
) -> TrendDirection {
    let (Some(prior), Some(recent)) = (prior, recent) else {
        return TrendDirection::Stable;
    };
    if prior == 0.0 {
        return TrendDirection::Stable;
    }

    let change = (recent - prior) / prior.abs();
    if change.abs() <= threshold {
        return TrendDirection::Stable;
    }

    match (polarity, change > 0.0) {
        (Polarity::LowerIsBetter, true) | (Polarity::HigherIsBetter, false) => TrendDirection::Declining,
        (Polarity::LowerIsBetter, false) | (Polarity::HigherIsBetter, true) => TrendDirection::Improving,
    }
}

/// Averages of the halves of `[since, until)` split at the midpoint.
pub fn half_averages(
    samples: &[MetricSample],
    since: Timestamp,
    until: Timestamp,
) -> (Option<f64>, Option<f64>) {
    let mid = Timestamp::midpoint(since, until);
    let (mut prior_sum, mut prior_n) = (0.0, 0u64);
    let (mut recent_sum, mut recent_n) = (0.0, 0u64);

    for sample in samples {
        if sample.timestamp.is_within(since, mid) {
            prior_sum += sample.value;
            prior_n += 1;
        } else if sample.timestamp.is_within(mid, until) {
            recent_sum += sample.value;
            recent_n += 1;
        }
    }

    let avg = |sum: f64, n: u64| (n > 0).then(|| sum / n as f64);
    (avg(prior_sum, prior_n), avg(recent_sum, recent_n))
}
