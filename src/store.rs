// ============================================================================
// METRIC STORE
// ============================================================================
// Durable home for raw samples and analytics snapshots. The engine only
// needs insert and time-range queries, so backends stay small:
// - MemoryStore: sharded in-process map, used by tests and single-node runs
// - JsonlStore: append-only JSON-lines files in one directory
// ============================================================================

use std::fmt::Debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use compact_str::CompactString;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::types::{AnalyticsSnapshot, MetricSample, Timestamp};

// ----------------------------------------------------------------------------
// Store Trait
// ----------------------------------------------------------------------------

/// Persistence boundary between the collector side and the aggregation side.
///
/// Ranges are half-open: `since <= timestamp < until`. Results come back in
/// timestamp order.
#[async_trait]
pub trait MetricStore: Send + Sync + Debug {
    /// Backend name for logs
    fn name(&self) -> &str;

    async fn insert_sample(&self, sample: MetricSample) -> StoreResult<()>;

    /// Insert a batch, returning how many samples were written.
    async fn insert_samples(&self, samples: Vec<MetricSample>) -> StoreResult<usize> {
        let count = samples.len();
        for sample in samples {
            self.insert_sample(sample).await?;
        }
        Ok(count)
    }

    /// Samples of any of `metric_types` inside the range
    async fn query_range(
        &self,
        metric_types: &[String],
        since: Timestamp,
        until: Timestamp,
    ) -> StoreResult<Vec<MetricSample>>;

    async fn insert_snapshot(&self, snapshot: AnalyticsSnapshot) -> StoreResult<()>;

    /// Snapshots whose `created_at` falls in the range
    async fn query_snapshots(
        &self,
        since: Timestamp,
        until: Timestamp,
    ) -> StoreResult<Vec<AnalyticsSnapshot>>;
}

// ----------------------------------------------------------------------------
// In-Memory Store
// ----------------------------------------------------------------------------

/// Samples sharded by metric type so concurrent per-type queries do not
/// contend with each other.
#[derive(Debug, Default)]
pub struct MemoryStore {
    samples: DashMap<CompactString, Vec<MetricSample>>,
    snapshots: RwLock<Vec<AnalyticsSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total samples held across all types
    pub fn sample_count(&self) -> usize {
        self.samples.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().len()
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert_sample(&self, sample: MetricSample) -> StoreResult<()> {
        self.samples
            .entry(sample.metric_type.clone())
            .or_default()
            .push(sample);
        Ok(())
    }

    async fn insert_samples(&self, samples: Vec<MetricSample>) -> StoreResult<usize> {
        let count = samples.len();
        for sample in samples {
            self.samples
                .entry(sample.metric_type.clone())
                .or_default()
                .push(sample);
        }
        Ok(count)
    }

    async fn query_range(
        &self,
        metric_types: &[String],
        since: Timestamp,
        until: Timestamp,
    ) -> StoreResult<Vec<MetricSample>> {
        let mut found = Vec::new();
        for metric_type in metric_types {
            if let Some(entry) = self.samples.get(metric_type.as_str()) {
                found.extend(
                    entry
                        .iter()
                        .filter(|s| s.timestamp.is_within(since, until))
                        .cloned(),
                );
            }
        }
        found.sort_by_key(|s| s.timestamp);
        Ok(found)
    }

    async fn insert_snapshot(&self, snapshot: AnalyticsSnapshot) -> StoreResult<()> {
        self.snapshots.write().push(snapshot);
        Ok(())
    }

    async fn query_snapshots(
        &self,
        since: Timestamp,
        until: Timestamp,
    ) -> StoreResult<Vec<AnalyticsSnapshot>> {
        let mut found: Vec<AnalyticsSnapshot> = self
            .snapshots
            .read()
            .iter()
            .filter(|s| s.created_at.is_within(since, until))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }
}

// ----------------------------------------------------------------------------
// JSON-Lines File Store
// ----------------------------------------------------------------------------

const SAMPLES_FILE: &str = "samples.jsonl";
const SNAPSHOTS_FILE: &str = "snapshots.jsonl";

/// Append-only store: one JSON document per line, one file per record kind.
/// Queries scan the whole file; malformed lines are skipped and counted.
#[derive(Debug)]
pub struct JsonlStore {
    dir: PathBuf,
    write_lock: AsyncMutex<()>,
    skipped_lines: AtomicU64,
}

impl JsonlStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        info!(target: "pulse::store", path = %dir.display(), "Opened jsonl store");

        Ok(Self {
            dir,
            write_lock: AsyncMutex::new(()),
            skipped_lines: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lines ignored while reading because they failed to parse or validate
    pub fn skipped_lines(&self) -> u64 {
        self.skipped_lines.load(AtomicOrdering::Relaxed)
    }

    async fn append<T: Serialize>(&self, file: &str, records: &[T]) -> StoreResult<()> {
        let mut buf = Vec::with_capacity(records.len() * 128);
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .await?;
        handle.write_all(&buf).await?;
        handle.flush().await?;
        Ok(())
    }

    async fn scan<T, F>(&self, file: &str, mut keep: F) -> StoreResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: FnMut(&T) -> bool,
    {
        let handle = match File::open(self.dir.join(file)).await {
            Ok(handle) => handle,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(handle).lines();
        let mut out = Vec::new();
        let mut line_no = 0u64;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) if keep(&record) => out.push(record),
                Ok(_) => {}
                Err(e) => {
                    self.skipped_lines.fetch_add(1, AtomicOrdering::Relaxed);
                    warn!(target: "pulse::store", file, line = line_no, error = %e, "Skipping malformed record");
                }
            }
        }

        Ok(out)
    }
}

#[async_trait]
impl MetricStore for JsonlStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn insert_sample(&self, sample: MetricSample) -> StoreResult<()> {
        self.append(SAMPLES_FILE, std::slice::from_ref(&sample)).await
    }

    async fn insert_samples(&self, samples: Vec<MetricSample>) -> StoreResult<usize> {
        if samples.is_empty() {
            return Ok(0);
        }
        self.append(SAMPLES_FILE, &samples).await?;
        debug!(target: "pulse::store", count = samples.len(), "Appended samples");
        Ok(samples.len())
    }

    async fn query_range(
        &self,
        metric_types: &[String],
        since: Timestamp,
        until: Timestamp,
    ) -> StoreResult<Vec<MetricSample>> {
        let mut found = self
            .scan(SAMPLES_FILE, |s: &MetricSample| {
                s.timestamp.is_within(since, until)
                    && metric_types.iter().any(|t| s.metric_type == t.as_str())
            })
            .await?;
        found.sort_by_key(|s| s.timestamp);
        Ok(found)
    }

    async fn insert_snapshot(&self, snapshot: AnalyticsSnapshot) -> StoreResult<()> {
        snapshot.metadata.validate()?;
        self.append(SNAPSHOTS_FILE, std::slice::from_ref(&snapshot)).await
    }

    async fn query_snapshots(
        &self,
        since: Timestamp,
        until: Timestamp,
    ) -> StoreResult<Vec<AnalyticsSnapshot>> {
        let in_range = self
            .scan(SNAPSHOTS_FILE, |s: &AnalyticsSnapshot| {
                s.created_at.is_within(since, until)
            })
            .await?;

        let mut found = Vec::with_capacity(in_range.len());
        for snapshot in in_range {
            match snapshot.metadata.validate() {
                Ok(()) => found.push(snapshot),
                Err(e) => {
                    self.skipped_lines.fetch_add(1, AtomicOrdering::Relaxed);
                    warn!(target: "pulse::store", id = %snapshot.id, error = %e, "Skipping snapshot");
                }
            }
        }
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scores::ScoreCard;
    use crate::types::{SnapshotMetadata, SnapshotPayload, TimePeriod};
    use uuid::Uuid;

    fn sample(metric_type: &str, value: f64, secs: i64) -> MetricSample {
        MetricSample::at(metric_type, value, Timestamp::from_secs(secs))
    }

    fn types(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn snapshot(created_secs: i64) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            id: Uuid::new_v4(),
            metric_type: "security_dashboard".into(),
            value: 95.0,
            metadata: SnapshotMetadata::new(SnapshotPayload::Security {
                security: ScoreCard::measured(95.0, Vec::new()),
                critical_events: 0,
                failed_actions: 1,
                partial: false,
            }),
            time_period: TimePeriod::Daily,
            period_start: Timestamp::from_secs(0),
            period_end: Timestamp::from_secs(100),
            aggregation_level: "daily".into(),
            created_at: Timestamp::from_secs(created_secs),
        }
    }

    #[tokio::test]
    async fn test_memory_store_filters_by_type_and_half_open_range() {
        let store = MemoryStore::new();
        store
            .insert_samples(vec![
                sample("page_load_time", 1.0, 30),
                sample("page_load_time", 2.0, 10),
                sample("page_load_time", 3.0, 20),
                sample("api_response_time", 4.0, 15),
            ])
            .await
            .unwrap();

        let found = store
            .query_range(&types(&["page_load_time"]), Timestamp::from_secs(10), Timestamp::from_secs(30))
            .await
            .unwrap();
        let values: Vec<f64> = found.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0]);
        assert_eq!(store.sample_count(), 4);

        let none = store
            .query_range(&types(&["uptime.cache"]), Timestamp::EPOCH, Timestamp::from_secs(100))
            .await
            .unwrap();
        assert!(none.is_empty());

        let mixed = store
            .query_range(
                &types(&["api_response_time", "page_load_time"]),
                Timestamp::EPOCH,
                Timestamp::from_secs(100),
            )
            .await
            .unwrap();
        assert_eq!(mixed.len(), 4);
        assert_eq!(mixed[0].timestamp, Timestamp::from_secs(10));
    }

    #[tokio::test]
    async fn test_memory_store_snapshots() {
        let store = MemoryStore::new();
        store.insert_snapshot(snapshot(50)).await.unwrap();
        store.insert_snapshot(snapshot(150)).await.unwrap();

        let found = store
            .query_snapshots(Timestamp::from_secs(0), Timestamp::from_secs(100))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(store.snapshot_count(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonlStore::open(dir.path()).await.unwrap();
            store
                .insert_samples(vec![
                    sample("page_load_time", 1200.0, 10).with_label("page", "home"),
                    sample("api_response_time", 80.0, 11).with_label("status", "500"),
                ])
                .await
                .unwrap();
            store.insert_snapshot(snapshot(12)).await.unwrap();
        }

        let store = JsonlStore::open(dir.path()).await.unwrap();
        let loads = store
            .query_range(&types(&["page_load_time"]), Timestamp::EPOCH, Timestamp::from_secs(100))
            .await
            .unwrap();
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].label("page"), Some("home"));
        assert_eq!(loads[0].timestamp, Timestamp::from_secs(10));

        let snapshots = store
            .query_snapshots(Timestamp::EPOCH, Timestamp::from_secs(100))
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(matches!(
            snapshots[0].metadata.payload,
            SnapshotPayload::Security { failed_actions: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_jsonl_store_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();
        store.insert_sample(sample("interaction", 1.0, 5)).await.unwrap();

        let path = dir.path().join(SAMPLES_FILE);
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{not json\n");
        std::fs::write(&path, contents).unwrap();
        store.insert_sample(sample("interaction", 1.0, 6)).await.unwrap();

        let found = store
            .query_range(&types(&["interaction"]), Timestamp::EPOCH, Timestamp::from_secs(100))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(store.skipped_lines(), 1);
    }

    #[tokio::test]
    async fn test_jsonl_store_rejects_unknown_snapshot_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();

        let mut bad = snapshot(10);
        bad.metadata.schema_version = 42;
        assert!(store.insert_snapshot(bad).await.is_err());
    }

    #[tokio::test]
    async fn test_jsonl_store_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path().join("nested")).await.unwrap();
        let found = store
            .query_range(&types(&["page_load_time"]), Timestamp::EPOCH, Timestamp::now())
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
