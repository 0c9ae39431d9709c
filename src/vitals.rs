// ============================================================================
// RUNTIME VITALS
// ============================================================================
// Tracks three runtime performance signals through explicit subscriptions.
// A source that cannot provide a signal rejects that subscription only; the
// observer keeps tracking whatever else subscribed.
// ============================================================================

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::VitalsError;
use crate::metric_types;
use crate::types::MetricSample;

// ----------------------------------------------------------------------------
// Signals
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VitalSignal {
    /// Sum of layout shift entries for the session
    CumulativeLayoutShift,
    /// Timestamp (ms) of the most recent load-complete event
    LoadComplete,
    /// Latency (ms) of the first user input; later inputs are ignored
    FirstInputDelay,
}

impl VitalSignal {
    pub const ALL: [VitalSignal; 3] = [
        VitalSignal::CumulativeLayoutShift,
        VitalSignal::LoadComplete,
        VitalSignal::FirstInputDelay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VitalSignal::CumulativeLayoutShift => "cumulative_layout_shift",
            VitalSignal::LoadComplete => "load_complete",
            VitalSignal::FirstInputDelay => "first_input_delay",
        }
    }

    /// Metric type the signal is stored under
    pub fn metric_type(&self) -> &'static str {
        match self {
            VitalSignal::CumulativeLayoutShift => metric_types::CUMULATIVE_LAYOUT_SHIFT,
            VitalSignal::LoadComplete => metric_types::LOAD_COMPLETE,
            VitalSignal::FirstInputDelay => metric_types::FIRST_INPUT_DELAY,
        }
    }
}

impl Display for VitalSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Source & Subscription
// ----------------------------------------------------------------------------

pub type VitalCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Anything that can deliver vital signal entries.
pub trait VitalsSource: Send + Sync {
    /// Register `callback` for `signal`. Dropping or cancelling the returned
    /// handle unregisters it.
    fn subscribe(
        &self,
        signal: VitalSignal,
        callback: VitalCallback,
    ) -> Result<Subscription, VitalsError>;
}

/// Cancellation handle for one registered callback.
pub struct Subscription {
    signal: VitalSignal,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(signal: VitalSignal, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            signal,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn signal(&self) -> VitalSignal {
        self.signal
    }

    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("signal", &self.signal)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// In-Process Bus
// ----------------------------------------------------------------------------

type SubscriberMap = DashMap<u64, (VitalSignal, VitalCallback)>;

/// In-process [`VitalsSource`]: the host pushes entries with [`emit`](Self::emit).
pub struct VitalsBus {
    supported: HashSet<VitalSignal>,
    subscribers: Arc<SubscriberMap>,
    next_id: AtomicU64,
}

impl VitalsBus {
    /// Bus supporting every signal
    pub fn new() -> Self {
        Self::with_supported(VitalSignal::ALL)
    }

    pub fn with_supported(signals: impl IntoIterator<Item = VitalSignal>) -> Self {
        Self {
            supported: signals.into_iter().collect(),
            subscribers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Deliver an entry to every subscriber of `signal`; returns how many
    /// callbacks ran.
    pub fn emit(&self, signal: VitalSignal, value: f64) -> usize {
        // Collect first so callbacks run without holding shard locks.
        let callbacks: Vec<VitalCallback> = self
            .subscribers
            .iter()
            .filter(|entry| entry.value().0 == signal)
            .map(|entry| Arc::clone(&entry.value().1))
            .collect();

        for callback in &callbacks {
            callback(value);
        }
        callbacks.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for VitalsBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for VitalsBus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("VitalsBus")
            .field("supported", &self.supported)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl VitalsSource for VitalsBus {
    fn subscribe(
        &self,
        signal: VitalSignal,
        callback: VitalCallback,
    ) -> Result<Subscription, VitalsError> {
        if !self.supported.contains(&signal) {
            return Err(VitalsError::Unsupported {
                signal: signal.to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        self.subscribers.insert(id, (signal, callback));

        let registry: Weak<SubscriberMap> = Arc::downgrade(&self.subscribers);
        Ok(Subscription::new(signal, move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&id);
            }
        }))
    }
}

// ----------------------------------------------------------------------------
// Observer
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
struct VitalsState {
    layout_shift: Option<f64>,
    load_complete: Option<f64>,
    first_input_delay: Option<f64>,
}

impl VitalsState {
    fn apply(&mut self, signal: VitalSignal, value: f64) {
        if !value.is_finite() || value < 0.0 {
            return;
        }
        match signal {
            VitalSignal::CumulativeLayoutShift => {
                *self.layout_shift.get_or_insert(0.0) += value;
            }
            VitalSignal::LoadComplete => self.load_complete = Some(value),
            VitalSignal::FirstInputDelay => {
                self.first_input_delay.get_or_insert(value);
            }
        }
    }
}

/// Session-scoped view of the runtime vitals.
#[derive(Debug, Default)]
pub struct VitalsObserver {
    state: Arc<Mutex<VitalsState>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl VitalsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every signal on `source`. Signals the source rejects
    /// are logged and skipped. Returns the signals now being tracked.
    pub fn observe(&self, source: &dyn VitalsSource) -> BTreeSet<VitalSignal> {
        let mut subscribed = BTreeSet::new();

        for signal in VitalSignal::ALL {
            let state = Arc::clone(&self.state);
            let callback: VitalCallback = Arc::new(move |value: f64| state.lock().apply(signal, value));

            match source.subscribe(signal, callback) {
                Ok(subscription) => {
                    self.subscriptions.lock().push(subscription);
                    subscribed.insert(signal);
                }
                Err(e) => {
                    warn!(target: "pulse::vitals", signal = %signal, error = %e, "Vital signal unavailable");
                }
            }
        }

        debug!(target: "pulse::vitals", count = subscribed.len(), "Observing vitals");
        subscribed
    }

    /// Current values; signals with no entries yet are absent.
    pub fn get_vitals(&self) -> BTreeMap<VitalSignal, f64> {
        let state = *self.state.lock();
        [
            (VitalSignal::CumulativeLayoutShift, state.layout_shift),
            (VitalSignal::LoadComplete, state.load_complete),
            (VitalSignal::FirstInputDelay, state.first_input_delay),
        ]
        .into_iter()
        .filter_map(|(signal, value)| value.map(|v| (signal, v)))
        .collect()
    }

    /// Start a new session: every value is cleared.
    pub fn reset_session(&self) {
        *self.state.lock() = VitalsState::default();
    }

    /// Cancel every subscription. Values recorded so far are kept.
    pub fn stop(&self) {
        let subscriptions: Vec<Subscription> = self.subscriptions.lock().drain(..).collect();
        let count = subscriptions.len();
        for subscription in subscriptions {
            subscription.cancel();
        }
        if count > 0 {
            debug!(target: "pulse::vitals", count, "Vitals subscriptions cancelled");
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Current vitals as samples ready for the flush queue.
    pub fn to_samples(&self) -> Vec<MetricSample> {
        self.get_vitals()
            .into_iter()
            .map(|(signal, value)| MetricSample::new(signal.metric_type(), value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_shift_accumulates_and_ignores_bad_entries() {
        let bus = VitalsBus::new();
        let observer = VitalsObserver::new();
        observer.observe(&bus);

        bus.emit(VitalSignal::CumulativeLayoutShift, 0.05);
        bus.emit(VitalSignal::CumulativeLayoutShift, 0.02);
        bus.emit(VitalSignal::CumulativeLayoutShift, -0.5);
        bus.emit(VitalSignal::CumulativeLayoutShift, f64::NAN);

        let vitals = observer.get_vitals();
        assert!((vitals[&VitalSignal::CumulativeLayoutShift] - 0.07).abs() < 1e-12);
    }

    #[test]
    fn test_first_input_delay_keeps_first_value() {
        let bus = VitalsBus::new();
        let observer = VitalsObserver::new();
        observer.observe(&bus);

        bus.emit(VitalSignal::FirstInputDelay, 42.0);
        bus.emit(VitalSignal::FirstInputDelay, 300.0);
        bus.emit(VitalSignal::LoadComplete, 1000.0);
        bus.emit(VitalSignal::LoadComplete, 1800.0);

        let vitals = observer.get_vitals();
        assert_eq!(vitals[&VitalSignal::FirstInputDelay], 42.0);
        assert_eq!(vitals[&VitalSignal::LoadComplete], 1800.0);
    }

    #[test]
    fn test_unsupported_signal_does_not_block_others() {
        let bus = VitalsBus::with_supported([VitalSignal::LoadComplete]);
        let observer = VitalsObserver::new();

        let subscribed = observer.observe(&bus);
        assert_eq!(subscribed, BTreeSet::from([VitalSignal::LoadComplete]));

        bus.emit(VitalSignal::LoadComplete, 900.0);
        assert_eq!(observer.get_vitals().len(), 1);
    }

    #[test]
    fn test_unset_signals_are_absent() {
        let bus = VitalsBus::new();
        let observer = VitalsObserver::new();
        observer.observe(&bus);
        assert!(observer.get_vitals().is_empty());
        assert!(observer.to_samples().is_empty());
    }

    #[test]
    fn test_stop_cancels_subscriptions() {
        let bus = VitalsBus::new();
        let observer = VitalsObserver::new();
        observer.observe(&bus);
        assert_eq!(bus.subscriber_count(), 3);

        observer.stop();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(observer.active_subscriptions(), 0);
        assert_eq!(bus.emit(VitalSignal::FirstInputDelay, 10.0), 0);
        assert!(observer.get_vitals().is_empty());
    }

    #[test]
    fn test_dropping_subscription_unregisters() {
        let bus = VitalsBus::new();
        let subscription = bus
            .subscribe(VitalSignal::LoadComplete, Arc::new(|_: f64| {}))
            .unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_reset_session_and_samples() {
        let bus = VitalsBus::new();
        let observer = VitalsObserver::new();
        observer.observe(&bus);
        bus.emit(VitalSignal::CumulativeLayoutShift, 0.2);
        bus.emit(VitalSignal::FirstInputDelay, 150.0);

        let samples = observer.to_samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].metric_type.as_str(), metric_types::CUMULATIVE_LAYOUT_SHIFT);
        assert_eq!(samples[1].metric_type.as_str(), metric_types::FIRST_INPUT_DELAY);

        observer.reset_session();
        assert!(observer.get_vitals().is_empty());

        bus.emit(VitalSignal::FirstInputDelay, 75.0);
        assert_eq!(observer.get_vitals()[&VitalSignal::FirstInputDelay], 75.0);
    }
}
