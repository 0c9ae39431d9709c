// ============================================================================
// FLUSH & SAMPLING TASKS
// ============================================================================
// Background tasks that own their own cancellation token. Each one is a
// single tokio task ticking on an interval, so at most one flush per
// collector is ever in flight. Shutdown cancels the token and joins the task.
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::MetricCollector;
use crate::error::StoreError;
use crate::metric_types;
use crate::store::MetricStore;
use crate::types::MetricSample;
use crate::FLUSH_BATCH_SIZE;

// ----------------------------------------------------------------------------
// Flush Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FlushCounters {
    cycles: AtomicU64,
    samples_flushed: AtomicU64,
    samples_lost: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time view of a flush task's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushStats {
    pub cycles: u64,
    pub samples_flushed: u64,
    /// Samples dropped because the store rejected their batch
    pub samples_lost: u64,
    pub failures: u64,
}

impl FlushCounters {
    fn snapshot(&self) -> FlushStats {
        FlushStats {
            cycles: self.cycles.load(AtomicOrdering::Relaxed),
            samples_flushed: self.samples_flushed.load(AtomicOrdering::Relaxed),
            samples_lost: self.samples_lost.load(AtomicOrdering::Relaxed),
            failures: self.failures.load(AtomicOrdering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Flush Once
// ----------------------------------------------------------------------------

/// What one [`flush_once`] call did.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    /// Samples the store accepted
    pub written: usize,
    /// Samples in the batch the store rejected
    pub lost: usize,
    /// Set when a batch failed; batches after it stay queued
    pub error: Option<StoreError>,
}

impl FlushOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Move everything queued in `collector` into `store`, one batch at a time.
///
/// Stops at the first failed batch. That batch is dropped, not requeued.
pub async fn flush_once(collector: &MetricCollector, store: &dyn MetricStore) -> FlushOutcome {
    let mut outcome = FlushOutcome::default();
    loop {
        let batch = collector.drain_pending(FLUSH_BATCH_SIZE);
        if batch.is_empty() {
            return outcome;
        }

        let size = batch.len();
        match store.insert_samples(batch).await {
            Ok(written) => outcome.written += written,
            Err(e) => {
                warn!(
                    target: "pulse::flush",
                    store = store.name(),
                    written = outcome.written,
                    lost = size,
                    error = %e,
                    "Flush failed, dropping batch"
                );
                outcome.lost = size;
                outcome.error = Some(e);
                return outcome;
            }
        }
    }
}

async fn flush_cycle(collector: &MetricCollector, store: &dyn MetricStore, counters: &FlushCounters) {
    counters.cycles.fetch_add(1, AtomicOrdering::Relaxed);

    let outcome = flush_once(collector, store).await;
    counters
        .samples_flushed
        .fetch_add(outcome.written as u64, AtomicOrdering::Relaxed);
    counters
        .samples_lost
        .fetch_add(outcome.lost as u64, AtomicOrdering::Relaxed);

    if outcome.is_ok() {
        if outcome.written > 0 {
            debug!(target: "pulse::flush", written = outcome.written, "Flushed samples");
        }
    } else {
        counters.failures.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

// ----------------------------------------------------------------------------
// Flush Task
// ----------------------------------------------------------------------------

/// Handle to a running flush task.
#[derive(Debug)]
pub struct FlushHandle {
    cancel: CancellationToken,
    counters: Arc<FlushCounters>,
    handle: JoinHandle<()>,
}

impl FlushHandle {
    pub fn stats(&self) -> FlushStats {
        self.counters.snapshot()
    }

    /// Token the task watches; cancel it to stop without waiting.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the task after one final flush and wait for it to exit.
    pub async fn shutdown(self) -> FlushStats {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(target: "pulse::flush", error = %e, "Flush task ended abnormally");
        }
        self.counters.snapshot()
    }
}

/// Spawn the periodic flush task. The first flush happens one full
/// `period` after spawning.
pub fn spawn_flush_task(
    collector: Arc<MetricCollector>,
    store: Arc<dyn MetricStore>,
    period: Duration,
    cancel: CancellationToken,
) -> FlushHandle {
    let counters = Arc::new(FlushCounters::default());
    let task_counters = Arc::clone(&counters);
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        info!(target: "pulse::flush", store = store.name(), period_ms = period.as_millis() as u64, "Flush task started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    flush_cycle(&collector, store.as_ref(), &task_counters).await;
                }
                _ = token.cancelled() => {
                    flush_cycle(&collector, store.as_ref(), &task_counters).await;
                    break;
                }
            }
        }

        let stats = task_counters.snapshot();
        info!(
            target: "pulse::flush",
            cycles = stats.cycles,
            flushed = stats.samples_flushed,
            lost = stats.samples_lost,
            "Flush task stopped"
        );
    });

    FlushHandle {
        cancel,
        counters,
        handle,
    }
}

// ----------------------------------------------------------------------------
// Engagement Sampler
// ----------------------------------------------------------------------------

/// Handle to a running engagement sampler.
#[derive(Debug)]
pub struct SamplerHandle {
    cancel: CancellationToken,
    samples: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl SamplerHandle {
    pub fn samples_taken(&self) -> u64 {
        self.samples.load(AtomicOrdering::Relaxed)
    }

    pub async fn shutdown(self) -> u64 {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(target: "pulse::flush", error = %e, "Engagement sampler ended abnormally");
        }
        self.samples.load(AtomicOrdering::Relaxed)
    }
}

/// Periodically queue the current session duration (label `sampled=true`
/// distinguishes these from the sample `end_session` writes).
pub fn spawn_engagement_sampler(
    collector: Arc<MetricCollector>,
    period: Duration,
    cancel: CancellationToken,
) -> SamplerHandle {
    let samples = Arc::new(AtomicU64::new(0));
    let task_samples = Arc::clone(&samples);
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let duration_ms = collector.session_duration().as_millis() as f64;
                    collector.record_sample(
                        MetricSample::new(metric_types::SESSION_DURATION, duration_ms)
                            .with_label("sampled", "true"),
                    );
                    task_samples.fetch_add(1, AtomicOrdering::Relaxed);
                }
                _ = token.cancelled() => break,
            }
        }

        debug!(target: "pulse::flush", "Engagement sampler stopped");
    });

    SamplerHandle {
        cancel,
        samples,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreResult;
    use crate::store::MemoryStore;
    use crate::types::{AnalyticsSnapshot, Timestamp};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct RejectingStore;

    #[async_trait]
    impl MetricStore for RejectingStore {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn insert_sample(&self, _sample: MetricSample) -> StoreResult<()> {
            Err(StoreError::unavailable("offline"))
        }

        async fn query_range(
            &self,
            _metric_types: &[String],
            _since: Timestamp,
            _until: Timestamp,
        ) -> StoreResult<Vec<MetricSample>> {
            Ok(Vec::new())
        }

        async fn insert_snapshot(&self, _snapshot: AnalyticsSnapshot) -> StoreResult<()> {
            Err(StoreError::unavailable("offline"))
        }

        async fn query_snapshots(
            &self,
            _since: Timestamp,
            _until: Timestamp,
        ) -> StoreResult<Vec<AnalyticsSnapshot>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_flush_once_moves_everything() {
        let collector = MetricCollector::with_defaults();
        let store = MemoryStore::new();
        collector.record_load("home", 100.0);
        collector.record_call("/api", 20.0, Some(200));
        collector.record_interaction("click");

        let outcome = flush_once(&collector, &store).await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.written, 3);
        assert_eq!(outcome.lost, 0);
        assert_eq!(store.sample_count(), 3);
        assert_eq!(collector.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_drops_batch() {
        let collector = MetricCollector::with_defaults();
        collector.record_load("home", 100.0);

        let outcome = flush_once(&collector, &RejectingStore).await;
        assert!(!outcome.is_ok());
        assert_eq!(outcome.lost, 1);
        assert_eq!(collector.pending_len(), 0);
    }

    /// Accepts the first batch, rejects every later one.
    #[derive(Debug, Default)]
    struct SecondBatchFails {
        inner: MemoryStore,
        batches: AtomicU64,
    }

    #[async_trait]
    impl MetricStore for SecondBatchFails {
        fn name(&self) -> &str {
            "second-batch-fails"
        }

        async fn insert_sample(&self, sample: MetricSample) -> StoreResult<()> {
            self.inner.insert_sample(sample).await
        }

        async fn insert_samples(&self, samples: Vec<MetricSample>) -> StoreResult<usize> {
            if self.batches.fetch_add(1, AtomicOrdering::Relaxed) > 0 {
                return Err(StoreError::unavailable("disk full"));
            }
            self.inner.insert_samples(samples).await
        }

        async fn query_range(
            &self,
            metric_types: &[String],
            since: Timestamp,
            until: Timestamp,
        ) -> StoreResult<Vec<MetricSample>> {
            self.inner.query_range(metric_types, since, until).await
        }

        async fn insert_snapshot(&self, snapshot: AnalyticsSnapshot) -> StoreResult<()> {
            self.inner.insert_snapshot(snapshot).await
        }

        async fn query_snapshots(
            &self,
            since: Timestamp,
            until: Timestamp,
        ) -> StoreResult<Vec<AnalyticsSnapshot>> {
            self.inner.query_snapshots(since, until).await
        }
    }

    #[tokio::test]
    async fn test_partial_flush_counts_written_and_lost() {
        let collector = MetricCollector::with_defaults();
        let store = SecondBatchFails::default();
        let queued = FLUSH_BATCH_SIZE + 200;
        for _ in 0..queued {
            collector.record_load("home", 100.0);
        }

        let counters = FlushCounters::default();
        flush_cycle(&collector, &store, &counters).await;

        let stats = counters.snapshot();
        assert_eq!(stats.samples_flushed, FLUSH_BATCH_SIZE as u64);
        assert_eq!(stats.samples_lost, 200);
        assert_eq!(stats.failures, 1);
        assert_eq!(store.inner.sample_count(), FLUSH_BATCH_SIZE);
        assert_eq!(collector.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_task_ticks_and_final_flush() {
        let collector = Arc::new(MetricCollector::with_defaults());
        let store = Arc::new(MemoryStore::new());
        let handle = spawn_flush_task(
            Arc::clone(&collector),
            store.clone(),
            Duration::from_secs(10),
            CancellationToken::new(),
        );

        collector.record_load("home", 100.0);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(store.sample_count(), 1);

        collector.record_load("home", 200.0);
        let stats = handle.shutdown().await;
        assert_eq!(store.sample_count(), 2);
        assert_eq!(stats.samples_flushed, 2);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_task_counts_failures() {
        let collector = Arc::new(MetricCollector::with_defaults());
        let handle = spawn_flush_task(
            Arc::clone(&collector),
            Arc::new(RejectingStore),
            Duration::from_secs(1),
            CancellationToken::new(),
        );

        collector.record_load("home", 100.0);
        collector.record_load("home", 100.0);
        let stats = handle.shutdown().await;
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.samples_lost, 2);
        assert_eq!(collector.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_token_stops_sampler() {
        let collector = Arc::new(MetricCollector::with_defaults());
        let parent = CancellationToken::new();
        let sampler = spawn_engagement_sampler(
            Arc::clone(&collector),
            Duration::from_secs(30),
            parent.child_token(),
        );

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(sampler.samples_taken(), 3);

        parent.cancel();
        let taken = sampler.shutdown().await;
        assert_eq!(taken, 3);

        let samples = collector.drain_pending(10);
        assert_eq!(samples.len(), 3);
        assert!(samples
            .iter()
            .all(|s| s.metric_type.as_str() == metric_types::SESSION_DURATION));
    }
}
