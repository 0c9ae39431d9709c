// ============================================================================
// ENGINE
// ============================================================================
// Wires configuration into a running server: store backend, access policy,
// aggregation engine, report generator and the HTTP API. The server records
// its own request telemetry through a collector that a flush task drains into
// the same store.
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::access::StaticTokenPolicy;
use crate::aggregation::AggregationEngine;
use crate::alert::TracingAlertSink;
use crate::api::{create_router, ApiState};
use crate::collector::MetricCollector;
use crate::config::{ConfigManager, EngineConfig, StoreBackend};
use crate::error::{ConfigError, PulseError, PulseResult};
use crate::flush::{spawn_flush_task, FlushStats};
use crate::report::ReportGenerator;
use crate::store::{JsonlStore, MemoryStore, MetricStore};
use crate::types::Timestamp;
use crate::ENGINE_VERSION;

/// The assembled server.
#[derive(Debug)]
pub struct Engine {
    config: Arc<ConfigManager>,
    store: Arc<dyn MetricStore>,
    aggregation: AggregationEngine,
    collector: Arc<MetricCollector>,
    shutdown: CancellationToken,
    running: AtomicBool,
    start_time: Timestamp,
}

impl Engine {
    /// Build an engine, opening the configured store.
    pub async fn new(config: EngineConfig) -> PulseResult<Self> {
        config.validate()?;

        let store = open_store(&config).await?;
        let policy = Arc::new(StaticTokenPolicy::from_config(&config.access));
        let aggregation =
            AggregationEngine::new(Arc::clone(&store), policy, config.aggregation.clone());
        let collector = Arc::new(MetricCollector::new(
            config.collector.clone(),
            Arc::new(TracingAlertSink),
        ));

        Ok(Self {
            config: Arc::new(ConfigManager::new(config)),
            store,
            aggregation,
            collector,
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            start_time: Timestamp::now(),
        })
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.get()
    }

    pub fn store(&self) -> Arc<dyn MetricStore> {
        Arc::clone(&self.store)
    }

    pub fn aggregation_engine(&self) -> &AggregationEngine {
        &self.aggregation
    }

    pub fn collector(&self) -> Arc<MetricCollector> {
        Arc::clone(&self.collector)
    }

    pub fn report_generator(&self) -> ReportGenerator {
        ReportGenerator::new(self.config.get().report.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        Timestamp::now().duration_since(self.start_time)
    }

    /// Stop a running engine. Safe to call more than once.
    pub fn shutdown(&self) {
        info!(target: "pulse::engine", "Shutdown requested");
        self.shutdown.cancel();
    }

    /// Serve the HTTP API until a shutdown signal or [`Engine::shutdown`].
    pub async fn run(&self) -> PulseResult<()> {
        let config = self.config.get();

        info!(
            target: "pulse::engine",
            version = ENGINE_VERSION,
            instance = %config.engine.instance_name,
            environment = %config.engine.environment,
            store = self.store.name(),
            "Starting Pulse Engine"
        );

        let listener = TcpListener::bind(&config.server.bind_addr).await?;
        self.running.store(true, AtomicOrdering::Release);
        info!(target: "pulse::engine", addr = %config.server.bind_addr, "HTTP API listening");

        let flush = spawn_flush_task(
            Arc::clone(&self.collector),
            Arc::clone(&self.store),
            Duration::from_secs(config.collector.flush_interval_secs),
            self.shutdown.child_token(),
        );

        let state = ApiState::new(self.aggregation.clone(), self.report_generator())
            .with_collector(Arc::clone(&self.collector));
        let router = create_router(
            state,
            Duration::from_secs(config.server.request_timeout_secs),
        );

        let token = self.shutdown.clone();
        tokio::spawn(watch_signals(token.clone()));

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;

        info!(target: "pulse::engine", "Starting graceful shutdown");
        self.shutdown.cancel();
        let started = Instant::now();
        let grace = Duration::from_secs(config.engine.shutdown_timeout_secs);

        match tokio::time::timeout(grace, flush.shutdown()).await {
            Ok(FlushStats {
                samples_flushed,
                samples_lost,
                ..
            }) => info!(
                target: "pulse::engine",
                samples_flushed,
                samples_lost,
                "Final flush complete"
            ),
            Err(_) => warn!(
                target: "pulse::engine",
                grace_secs = grace.as_secs(),
                "Flush task did not stop within the grace period"
            ),
        }

        self.running.store(false, AtomicOrdering::Release);
        info!(
            target: "pulse::engine",
            duration_ms = started.elapsed().as_millis() as u64,
            uptime_secs = self.uptime().as_secs(),
            "Engine shutdown complete"
        );

        served.map_err(PulseError::Io)
    }
}

async fn open_store(config: &EngineConfig) -> PulseResult<Arc<dyn MetricStore>> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Jsonl => {
            let path = config.store.path.as_ref().ok_or_else(|| {
                ConfigError::invalid_value("store.path", "the jsonl backend needs a directory")
            })?;
            Ok(Arc::new(JsonlStore::open(path).await?))
        }
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn watch_signals(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(target: "pulse::engine", error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(target: "pulse::engine", error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "pulse::engine", "Received SIGINT"),
        _ = terminate => info!(target: "pulse::engine", "Received SIGTERM"),
        _ = token.cancelled() => return,
    }
    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationRequest;
    use crate::report::ReportAction;

    fn local_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.server.bind_addr = "127.0.0.1:0".into();
        config.access.admin_tokens = vec!["t0ken".into()];
        config
    }

    #[tokio::test]
    async fn test_memory_engine_aggregates() {
        let engine = Engine::new(local_config()).await.unwrap();
        assert_eq!(engine.store().name(), "memory");
        assert!(!engine.is_running());

        let request = AggregationRequest::new(ReportAction::SystemOverview).with_credentials("t0ken");
        let report = engine.aggregation_engine().aggregate(&request).await.unwrap();
        assert!(report.groups.values().all(|g| !g.has_data()));
    }

    #[tokio::test]
    async fn test_jsonl_engine_opens_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = local_config();
        config.store.backend = StoreBackend::Jsonl;
        config.store.path = Some(dir.path().join("data"));

        let engine = Engine::new(config).await.unwrap();
        assert_eq!(engine.store().name(), "jsonl");
        assert!(dir.path().join("data").is_dir());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = local_config();
        config.store.backend = StoreBackend::Jsonl;
        config.store.path = None;

        let err = Engine::new(config).await.unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let engine = Arc::new(Engine::new(local_config()).await.unwrap());
        engine.collector().record_call("/get_system_overview", 12.0, Some(200));

        let runner = Arc::clone(&engine);
        let task = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(!engine.is_running());
        assert_eq!(engine.collector().pending_len(), 0);
    }
}
