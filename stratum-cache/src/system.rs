//! Fully wired cache system: tiers built from configuration, the coordinator,
//! and the background analysis, tuning and monitoring loops.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use stratum_core::{
    ConfigError, DataType, StratumConfig, StratumResult, TIER_COMPUTE, TIER_DISTRIBUTED, TIER_EDGE,
    TIER_MEMORY,
};

use crate::codec::EntryCodec;
use crate::coordinator::{MultiLevelCacheCoordinator, TierFilter};
use crate::loader::Loader;
use crate::monitor::PerformanceMonitor;
use crate::strategy::StrategyManager;
use crate::tier::{
    CacheTier, ComputeFallbackTier, InMemoryRemoteStore, LoaderRegistry, MemoryTier, RemoteStore,
    RemoteTier,
};

/// Builder for [`CacheSystem`].
///
/// Remote stores default to in-process stores, which is what tests and
/// single-node deployments want.
pub struct CacheSystemBuilder {
    config: StratumConfig,
    distributed_store: Option<Arc<dyn RemoteStore>>,
    edge_store: Option<Arc<dyn RemoteStore>>,
    loaders: Vec<(String, Arc<dyn Loader>)>,
    tiers: Option<Vec<Arc<dyn CacheTier>>>,
}

impl CacheSystemBuilder {
    pub fn distributed_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.distributed_store = Some(store);
        self
    }

    pub fn edge_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.edge_store = Some(store);
        self
    }

    /// Register a compute-tier loader for keys starting with `prefix`.
    pub fn loader(mut self, prefix: impl Into<String>, loader: Arc<dyn Loader>) -> Self {
        self.loaders.push((prefix.into(), loader));
        self
    }

    /// Use these tiers instead of building them from `tiers.order`.
    pub fn with_tiers(mut self, tiers: Vec<Arc<dyn CacheTier>>) -> Self {
        self.tiers = Some(tiers);
        self
    }

    /// Validate the configuration and assemble the system.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> StratumResult<CacheSystem> {
        let config = self.config;
        config.validate()?;

        let tiers = match self.tiers {
            Some(tiers) => tiers,
            None => {
                let codec = Arc::new(EntryCodec::new(config.encryption_key_bytes()?));
                let registry = Arc::new(LoaderRegistry::new());
                for (prefix, loader) in self.loaders {
                    registry.register(prefix, loader);
                }
                let stores = Stores {
                    distributed: self.distributed_store,
                    edge: self.edge_store,
                };
                build_tiers(&config, codec, registry, stores)?
            }
        };

        let strategy = Arc::new(StrategyManager::from_config(&config));
        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone()));
        let coordinator = MultiLevelCacheCoordinator::new(
            tiers,
            config.coordinator.clone(),
            &config.workers,
            Arc::clone(&strategy),
            Arc::clone(&monitor),
        )?;

        let (shutdown_tx, _) = watch::channel(false);
        Ok(CacheSystem {
            config,
            coordinator,
            strategy,
            monitor,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

struct Stores {
    distributed: Option<Arc<dyn RemoteStore>>,
    edge: Option<Arc<dyn RemoteStore>>,
}

fn build_tiers(
    config: &StratumConfig,
    codec: Arc<EntryCodec>,
    registry: Arc<LoaderRegistry>,
    stores: Stores,
) -> StratumResult<Vec<Arc<dyn CacheTier>>> {
    let tiers = &config.tiers;
    let window = tiers.stats_window();
    let default_ttl = config.strategy_for(&DataType::default()).base_ttl();
    let in_process = || -> Arc<dyn RemoteStore> { Arc::new(InMemoryRemoteStore::new()) };

    let mut built: Vec<Arc<dyn CacheTier>> = Vec::with_capacity(tiers.order.len());
    for name in &tiers.order {
        let tier: Arc<dyn CacheTier> = match name.as_str() {
            TIER_MEMORY => Arc::new(MemoryTier::new(
                &tiers.memory,
                config.coordinator.stale_grace(),
                window,
            )),
            TIER_DISTRIBUTED => Arc::new(RemoteTier::distributed(
                stores.distributed.clone().unwrap_or_else(in_process),
                Arc::clone(&codec),
                &tiers.distributed,
                window,
            )),
            TIER_EDGE => Arc::new(RemoteTier::edge(
                stores.edge.clone().unwrap_or_else(in_process),
                Arc::clone(&codec),
                &tiers.edge,
                window,
            )),
            TIER_COMPUTE => Arc::new(ComputeFallbackTier::new(
                Arc::clone(&registry),
                default_ttl,
                window,
            )),
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "tiers.order".to_string(),
                    value: other.to_string(),
                    reason: "unknown tier".to_string(),
                }
                .into())
            }
        };
        built.push(tier);
    }
    Ok(built)
}

/// The assembled cache: coordinator, strategy manager, performance monitor
/// and their background loops.
pub struct CacheSystem {
    config: StratumConfig,
    coordinator: MultiLevelCacheCoordinator,
    strategy: Arc<StrategyManager>,
    monitor: Arc<PerformanceMonitor>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheSystem {
    pub fn builder(config: StratumConfig) -> CacheSystemBuilder {
        CacheSystemBuilder {
            config,
            distributed_store: None,
            edge_store: None,
            loaders: Vec::new(),
            tiers: None,
        }
    }

    pub fn config(&self) -> &StratumConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &MultiLevelCacheCoordinator {
        &self.coordinator
    }

    pub fn strategy(&self) -> &Arc<StrategyManager> {
        &self.strategy
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Spawn the background loops. Calling it again is a no-op.
    pub fn start(&self) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        if !tasks.is_empty() || *self.shutdown_tx.borrow() {
            return;
        }

        tasks.push(tokio::spawn(analysis_loop(
            self.coordinator.clone(),
            self.strategy.config().analysis_interval(),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(tuning_loop(
            self.coordinator.clone(),
            self.strategy.config().tuning_interval(),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(monitor_loop(
            self.coordinator.clone(),
            self.monitor.config().check_interval(),
            self.shutdown_tx.subscribe(),
        )));
        tracing::info!(loops = tasks.len(), "Cache background loops started");
    }

    /// Stop the loops, then drain queued background writes.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background loop ended abnormally");
            }
        }
        self.coordinator.shutdown().await;
    }
}

impl std::fmt::Debug for CacheSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSystem")
            .field("coordinator", &self.coordinator)
            .field("running", &!*self.shutdown_tx.borrow())
            .finish()
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn analysis_loop(
    coordinator: MultiLevelCacheCoordinator,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticks = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticks.tick() => {
                let strategy = Arc::clone(coordinator.strategy());
                strategy.run_analysis(&coordinator).await;
            }
        }
    }
    tracing::debug!("Analysis loop stopped");
}

async fn tuning_loop(
    coordinator: MultiLevelCacheCoordinator,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticks = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticks.tick() => {
                coordinator.collect_evictions();
                coordinator.strategy().optimize_strategies();
                if let Err(e) = coordinator.cleanup(&TierFilter::All).await {
                    tracing::debug!(error = %e, "Expiry sweep skipped");
                }
            }
        }
    }
    tracing::debug!("Tuning loop stopped");
}

async fn monitor_loop(
    coordinator: MultiLevelCacheCoordinator,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticks = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticks.tick() => {
                coordinator.collect_evictions();
                let check = coordinator.monitor().check_alerts();
                for alert in &check.opened {
                    tracing::warn!(
                        alert_id = %alert.id,
                        metric = %alert.metric,
                        level = ?alert.level,
                        observed = alert.observed_value,
                        "{}",
                        alert.message
                    );
                }
                coordinator.capture_snapshot().await;
            }
        }
    }
    tracing::debug!("Monitor loop stopped");
}
