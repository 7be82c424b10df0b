//! Strategy manager
//!
//! Owns the per-data-type [`Strategy`] table and every piece of adaptive
//! policy: access-pattern classification, adaptive TTL, prefetch and
//! invalidation prediction, and the self-tuning loop.
//!
//! The request path only appends to histories and reads the last published
//! pattern snapshot. Analysis and tuning run on their own schedule and never
//! hold a lock the request path waits on for longer than a map shard access.

pub mod history;
pub mod prediction;
pub mod ttl;
pub mod tuning;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use stratum_core::{AccessClass, AccessPattern, DataType, Strategy, StrategyManagerConfig, StratumConfig};

pub use history::AccessHistory;
pub use prediction::{should_prefetch, UpdateRate};
pub use ttl::{adaptive_ttl, tier_ttl};
pub use tuning::{tune, TuningChange, TuningInput, TuningReason};

/// Something that can load keys ahead of demand.
#[async_trait]
pub trait WarmupTarget: Send + Sync {
    /// Warm `keys`, returning how many were loaded successfully.
    async fn warmup_keys(&self, keys: Vec<String>) -> usize;
}

/// Class counts from one analysis pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PatternSummary {
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    pub bursty: usize,
}

impl PatternSummary {
    fn count(&mut self, class: AccessClass) {
        match class {
            AccessClass::Hot => self.hot += 1,
            AccessClass::Warm => self.warm += 1,
            AccessClass::Cold => self.cold += 1,
            AccessClass::Bursty => self.bursty += 1,
        }
    }
}

/// Decisions from one analysis pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisOutcome {
    pub summary: PatternSummary,
    /// Keys predicted to be accessed within the lookahead.
    pub prefetch: Vec<String>,
    /// Keys likely stale before their TTL.
    pub refresh: Vec<String>,
    /// Keys due from configured warmup schedules.
    pub scheduled: Vec<String>,
    pub pruned: usize,
}

impl AnalysisOutcome {
    /// Every key to warm, deduplicated, in decision order.
    pub fn warmup_keys(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.prefetch
            .iter()
            .chain(&self.refresh)
            .chain(&self.scheduled)
            .filter(|k| seen.insert(k.as_str()))
            .cloned()
            .collect()
    }
}

pub struct StrategyManager {
    config: StrategyManagerConfig,
    strategies: RwLock<HashMap<DataType, Strategy>>,
    histories: DashMap<String, AccessHistory>,
    patterns: RwLock<Arc<HashMap<String, AccessPattern>>>,
    outcomes: DashMap<DataType, TuningInput>,
    updates: DashMap<DataType, UpdateRate>,
    schedule_runs: Mutex<HashMap<DataType, Instant>>,
}

impl StrategyManager {
    pub fn new(config: StrategyManagerConfig, strategies: &BTreeMap<String, Strategy>) -> Self {
        let table = strategies
            .iter()
            .map(|(name, s)| (DataType::new(name.as_str()), s.clone()))
            .collect();
        Self {
            config,
            strategies: RwLock::new(table),
            histories: DashMap::new(),
            patterns: RwLock::new(Arc::new(HashMap::new())),
            outcomes: DashMap::new(),
            updates: DashMap::new(),
            schedule_runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &StratumConfig) -> Self {
        Self::new(config.strategy.clone(), &config.strategies)
    }

    pub fn config(&self) -> &StrategyManagerConfig {
        &self.config
    }

    // ========================================================================
    // Request-path reads
    // ========================================================================

    /// Strategy for a data type. Unknown types use the `default` entry, then
    /// the built-in default.
    pub fn strategy_for(&self, data_type: &DataType) -> Strategy {
        let Ok(table) = self.strategies.read() else {
            return Strategy::default();
        };
        table
            .get(data_type)
            .or_else(|| table.get(&DataType::default()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn strategies(&self) -> BTreeMap<String, Strategy> {
        self.strategies
            .read()
            .map(|t| t.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Adaptive TTL for a key from its last published classification.
    pub fn ttl_for(&self, key: &str, data_type: &DataType) -> Duration {
        let base = self.strategy_for(data_type).base_ttl();
        let class = self.pattern_for(key).map(|p| p.class);
        adaptive_ttl(base, class, self.config.min_ttl(), self.config.max_ttl_multiplier)
    }

    pub fn tier_ttl(&self, ttl: Duration, scale: f64) -> Duration {
        tier_ttl(ttl, scale, self.config.min_ttl())
    }

    pub fn pattern_for(&self, key: &str) -> Option<AccessPattern> {
        self.patterns.read().ok()?.get(key).cloned()
    }

    /// Last published pattern snapshot.
    pub fn patterns(&self) -> Arc<HashMap<String, AccessPattern>> {
        self.patterns
            .read()
            .map(|p| Arc::clone(&p))
            .unwrap_or_default()
    }

    pub fn data_type_of(&self, key: &str) -> Option<DataType> {
        self.histories.get(key).map(|h| h.data_type.clone())
    }

    pub fn tracked_keys(&self) -> usize {
        self.histories.len()
    }

    /// Probability that a value of `data_type` filled `age` ago is stale.
    pub fn stale_probability(&self, data_type: &DataType, age: Duration) -> f64 {
        self.updates
            .get(data_type)
            .map(|u| u.stale_probability(age))
            .unwrap_or(0.0)
    }

    // ========================================================================
    // Request-path observations
    // ========================================================================

    pub fn record_access(&self, key: &str, data_type: &DataType, hit: bool, now: Instant) {
        self.history_mut(key, data_type).record(now);
        let mut outcome = self.outcomes.entry(data_type.clone()).or_default();
        outcome.lookups += 1;
        if hit {
            outcome.hits += 1;
        }
    }

    /// A fresh value for `key` was written from the source of truth.
    pub fn record_fill(&self, key: &str, data_type: &DataType, now: Instant) {
        self.history_mut(key, data_type).filled_at = Some(now);
        self.outcomes.entry(data_type.clone()).or_default().fills += 1;
    }

    /// A caller changed `key` (set or delete).
    pub fn record_update(&self, data_type: &DataType, now: Instant) {
        self.updates
            .entry(data_type.clone())
            .or_default()
            .observe(now, self.config.ema_alpha);
    }

    pub fn record_delete(&self, key: &str, now: Instant) {
        let data_type = self.data_type_of(key).unwrap_or_default();
        if let Some(mut history) = self.histories.get_mut(key) {
            history.filled_at = None;
        }
        self.record_update(&data_type, now);
    }

    pub fn record_evictions(&self, data_type: &DataType, count: u64) {
        if count > 0 {
            self.outcomes.entry(data_type.clone()).or_default().evictions += count;
        }
    }

    fn history_mut(
        &self,
        key: &str,
        data_type: &DataType,
    ) -> dashmap::mapref::one::RefMut<'_, String, AccessHistory> {
        let capacity = self.config.history_capacity;
        let mut history = self
            .histories
            .entry(key.to_string())
            .or_insert_with(|| AccessHistory::new(data_type.clone(), capacity));
        if history.data_type != *data_type {
            history.data_type = data_type.clone();
        }
        history
    }

    // ========================================================================
    // Analysis loop
    // ========================================================================

    /// Classify every tracked key, publish the snapshot and decide what to warm.
    pub fn analyze(&self, now: Instant) -> AnalysisOutcome {
        let mut outcome = AnalysisOutcome {
            pruned: self.prune(),
            ..AnalysisOutcome::default()
        };

        struct Observed {
            key: String,
            data_type: DataType,
            pattern: AccessPattern,
            filled_at: Option<Instant>,
            prefetched_for: Option<Instant>,
        }

        let observed: Vec<Observed> = self
            .histories
            .iter()
            .filter_map(|h| {
                h.analyze(now, &self.config).map(|pattern| Observed {
                    key: h.key().clone(),
                    data_type: h.data_type.clone(),
                    pattern,
                    filled_at: h.filled_at,
                    prefetched_for: h.prefetched_for,
                })
            })
            .collect();

        let mut patterns = HashMap::with_capacity(observed.len());
        for o in observed {
            outcome.summary.count(o.pattern.class);
            let strategy = self.strategy_for(&o.data_type);

            if should_prefetch(
                &o.pattern,
                now,
                self.config.lookahead(),
                strategy.prefetch_threshold,
                o.prefetched_for,
            ) {
                if let Some(mut h) = self.histories.get_mut(&o.key) {
                    h.prefetched_for = o.pattern.predicted_next_access();
                }
                outcome.prefetch.push(o.key.clone());
            } else if matches!(o.pattern.class, AccessClass::Hot | AccessClass::Warm) {
                if let Some(filled_at) = o.filled_at {
                    let age = now.saturating_duration_since(filled_at);
                    let p = self.stale_probability(&o.data_type, age);
                    if p >= self.config.stale_probability_threshold {
                        tracing::debug!(key = %o.key, probability = p, "Refreshing likely stale key");
                        outcome.refresh.push(o.key.clone());
                    }
                }
            }
            patterns.insert(o.key, o.pattern);
        }

        outcome.scheduled = self.due_scheduled_keys(now);

        if let Ok(mut published) = self.patterns.write() {
            *published = Arc::new(patterns);
        }

        tracing::debug!(
            hot = outcome.summary.hot,
            warm = outcome.summary.warm,
            cold = outcome.summary.cold,
            bursty = outcome.summary.bursty,
            prefetch = outcome.prefetch.len(),
            refresh = outcome.refresh.len(),
            "Access patterns analyzed"
        );
        outcome
    }

    /// Run one analysis pass and warm whatever it selected.
    pub async fn run_analysis(&self, target: &dyn WarmupTarget) -> AnalysisOutcome {
        let outcome = self.analyze(crate::now());
        let keys = outcome.warmup_keys();
        if !keys.is_empty() {
            let requested = keys.len();
            let warmed = target.warmup_keys(keys).await;
            tracing::debug!(requested, warmed, "Warmup issued by analysis");
        }
        outcome
    }

    /// Drop the least recently accessed histories beyond `max_tracked_keys`.
    fn prune(&self) -> usize {
        let excess = self.histories.len().saturating_sub(self.config.max_tracked_keys);
        if excess == 0 {
            return 0;
        }
        let mut by_age: Vec<(Option<Instant>, String)> = self
            .histories
            .iter()
            .map(|h| (h.last_access(), h.key().clone()))
            .collect();
        by_age.sort();
        for (_, key) in by_age.iter().take(excess) {
            self.histories.remove(key);
        }
        excess
    }

    fn due_scheduled_keys(&self, now: Instant) -> Vec<String> {
        let schedules: Vec<(DataType, Duration, Vec<String>)> = match self.strategies.read() {
            Ok(table) => table
                .iter()
                .filter_map(|(dt, s)| {
                    s.warmup
                        .as_ref()
                        .map(|w| (dt.clone(), Duration::from_secs(w.interval_secs), w.keys.clone()))
                })
                .collect(),
            Err(_) => return Vec::new(),
        };
        let Ok(mut runs) = self.schedule_runs.lock() else {
            return Vec::new();
        };
        let mut due = Vec::new();
        for (dt, interval, keys) in schedules {
            let ready = runs
                .get(&dt)
                .map_or(true, |last| now.saturating_duration_since(*last) >= interval);
            if ready {
                runs.insert(dt, now);
                due.extend(keys);
            }
        }
        due
    }

    // ========================================================================
    // Tuning loop
    // ========================================================================

    /// One round of bounded feedback control over every observed data type.
    ///
    /// Inputs are swapped out shard by shard first, so no map guard is held
    /// while strategies are tuned and published.
    pub fn optimize_strategies(&self) -> Vec<TuningChange> {
        let min_samples = self.config.tuning_min_samples;
        let mut inputs: Vec<(DataType, TuningInput)> = Vec::new();
        for mut entry in self.outcomes.iter_mut() {
            if entry.value().lookups >= min_samples {
                let input = std::mem::take(entry.value_mut());
                inputs.push((entry.key().clone(), input));
            }
        }

        let mut changes = Vec::new();
        for (data_type, input) in inputs {
            let mut strategy = self.strategy_for(&data_type);
            let Some(change) = tune(&data_type, &mut strategy, input, &self.config) else {
                continue;
            };
            if let Ok(mut table) = self.strategies.write() {
                table.insert(data_type, strategy);
            }
            tracing::info!(
                data_type = %change.data_type,
                reason = ?change.reason,
                old_ttl = change.old_base_ttl_secs,
                new_ttl = change.new_base_ttl_secs,
                prefetch_threshold = change.new_prefetch_threshold,
                "Strategy tuned"
            );
            changes.push(change);
        }
        changes
    }
}

impl std::fmt::Debug for StrategyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyManager")
            .field("tracked_keys", &self.histories.len())
            .field("strategies", &self.strategies())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::WarmupSchedule;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingTarget {
        keys: AsyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl WarmupTarget for RecordingTarget {
        async fn warmup_keys(&self, keys: Vec<String>) -> usize {
            let n = keys.len();
            self.keys.lock().await.extend(keys);
            n
        }
    }

    fn manager(strategies: BTreeMap<String, Strategy>) -> StrategyManager {
        StrategyManager::new(StrategyManagerConfig::default(), &strategies)
    }

    fn eager(ttl: u64) -> Strategy {
        Strategy {
            base_ttl_secs: ttl,
            prefetch_threshold: 0.1,
            ..Strategy::default()
        }
    }

    fn secs(start: Instant, s: u64) -> Instant {
        start + Duration::from_secs(s)
    }

    #[test]
    fn test_strategy_fallbacks() {
        let mut table = BTreeMap::new();
        table.insert("note".to_string(), eager(60));
        let m = manager(table.clone());
        assert_eq!(m.strategy_for(&DataType::new("note")).base_ttl_secs, 60);
        assert_eq!(m.strategy_for(&DataType::new("other")), Strategy::default());

        table.insert("default".to_string(), eager(90));
        let m = manager(table);
        assert_eq!(m.strategy_for(&DataType::new("other")).base_ttl_secs, 90);
    }

    #[test]
    fn test_ttl_follows_published_class() {
        let mut table = BTreeMap::new();
        table.insert("note".to_string(), eager(100));
        let m = manager(table);
        let dt = DataType::new("note");
        let start = Instant::now();

        // unseen key uses the base
        assert_eq!(m.ttl_for("n:1", &dt), Duration::from_secs(100));

        for s in [0, 2, 4, 6, 8] {
            m.record_access("n:1", &dt, true, secs(start, s));
        }
        // not yet analyzed
        assert_eq!(m.ttl_for("n:1", &dt), Duration::from_secs(100));

        let outcome = m.analyze(secs(start, 9));
        assert_eq!(outcome.summary.hot, 1);
        assert_eq!(m.pattern_for("n:1").unwrap().class, AccessClass::Hot);
        assert_eq!(m.ttl_for("n:1", &dt), Duration::from_secs(200));
        assert_eq!(m.tier_ttl(Duration::from_secs(200), 0.5), Duration::from_secs(100));
    }

    #[tokio::test]
    async fn test_prefetch_issued_once_per_prediction() {
        let mut table = BTreeMap::new();
        table.insert("feed".to_string(), eager(100));
        let m = manager(table);
        let dt = DataType::new("feed");
        let start = Instant::now();
        for s in [0, 2, 4, 6, 8] {
            m.record_access("feed:home", &dt, true, secs(start, s));
        }

        let first = m.analyze(secs(start, 9));
        assert_eq!(first.prefetch, vec!["feed:home".to_string()]);

        let second = m.analyze(secs(start, 9));
        assert!(second.prefetch.is_empty());

        let target = RecordingTarget::default();
        m.record_access("feed:home", &dt, true, secs(start, 10));
        let outcome = m.run_analysis(&target).await;
        // run_analysis uses the runtime clock, far from the recorded instants
        assert!(outcome.prefetch.len() <= 1);
        assert_eq!(target.keys.lock().await.len(), outcome.warmup_keys().len());
    }

    #[test]
    fn test_refresh_on_likely_stale() {
        let m = manager(BTreeMap::new());
        let dt = DataType::new("price");
        let start = Instant::now();

        m.record_update(&dt, secs(start, 0));
        m.record_update(&dt, secs(start, 60));
        m.record_fill("price:1", &dt, secs(start, 60));
        for s in [60, 90, 120] {
            m.record_access("price:1", &dt, true, secs(start, s));
        }

        let early = m.analyze(secs(start, 61));
        assert!(early.refresh.is_empty());

        // one mean update interval after the fill
        let late = m.analyze(secs(start, 120));
        assert_eq!(late.refresh, vec!["price:1".to_string()]);

        // a delete clears the fill marker
        m.record_delete("price:1", secs(start, 121));
        assert!(m.analyze(secs(start, 125)).refresh.is_empty());
    }

    #[test]
    fn test_scheduled_warmup() {
        let mut table = BTreeMap::new();
        table.insert(
            "config".to_string(),
            Strategy {
                warmup: Some(WarmupSchedule {
                    interval_secs: 60,
                    keys: vec!["config:a".into(), "config:b".into()],
                }),
                ..Strategy::default()
            },
        );
        let m = manager(table);
        let start = Instant::now();

        assert_eq!(m.analyze(start).scheduled.len(), 2);
        assert!(m.analyze(secs(start, 30)).scheduled.is_empty());
        assert_eq!(m.analyze(secs(start, 60)).scheduled.len(), 2);
    }

    #[test]
    fn test_prune_keeps_recent_keys() {
        let config = StrategyManagerConfig {
            max_tracked_keys: 2,
            ..StrategyManagerConfig::default()
        };
        let m = StrategyManager::new(config, &BTreeMap::new());
        let dt = DataType::default();
        let start = Instant::now();
        m.record_access("a", &dt, false, secs(start, 1));
        m.record_access("b", &dt, false, secs(start, 2));
        m.record_access("c", &dt, false, secs(start, 3));

        let outcome = m.analyze(secs(start, 4));
        assert_eq!(outcome.pruned, 1);
        assert_eq!(m.tracked_keys(), 2);
        assert!(m.data_type_of("a").is_none());
        assert!(m.data_type_of("c").is_some());
    }

    #[test]
    fn test_optimize_lengthens_ttl_on_low_hit_rate() {
        let config = StrategyManagerConfig {
            tuning_min_samples: 10,
            ..StrategyManagerConfig::default()
        };
        let m = StrategyManager::new(config, &BTreeMap::new());
        let dt = DataType::new("note");
        let start = Instant::now();
        for i in 0..20 {
            m.record_access(&format!("n:{i}"), &dt, i % 4 == 0, secs(start, i));
        }

        let changes = m.optimize_strategies();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].reason, TuningReason::LowHitRate);
        assert_eq!(m.strategy_for(&dt).base_ttl_secs, 330);

        // counters were consumed by the round
        assert!(m.optimize_strategies().is_empty());
    }

    #[test]
    fn test_optimize_runs_alongside_request_path() {
        let config = StrategyManagerConfig {
            tuning_min_samples: 10,
            ..StrategyManagerConfig::default()
        };
        let m = StrategyManager::new(config, &BTreeMap::new());
        let types: Vec<DataType> = (0..8).map(|i| DataType::new(format!("t{i}"))).collect();
        let start = Instant::now();

        let changes = std::thread::scope(|scope| {
            for (n, dt) in types.iter().enumerate() {
                let m = &m;
                scope.spawn(move || {
                    for i in 0..500u64 {
                        m.record_access(&format!("{n}:{i}"), dt, false, secs(start, i));
                        assert!(m.strategy_for(dt).base_ttl_secs > 0);
                    }
                });
            }
            let mut changes = Vec::new();
            for _ in 0..50 {
                changes.extend(m.optimize_strategies());
            }
            changes
        });
        let changes: Vec<TuningChange> = changes.into_iter().chain(m.optimize_strategies()).collect();

        assert!(!changes.is_empty());
        assert!(changes.iter().all(|c| c.reason == TuningReason::LowHitRate));
        let default_ttl = Strategy::default().base_ttl_secs;
        for dt in &types {
            assert!(m.strategy_for(dt).base_ttl_secs >= default_ttl);
        }
    }

    #[test]
    fn test_optimize_waits_for_samples() {
        let m = manager(BTreeMap::new());
        let dt = DataType::new("note");
        m.record_access("n:1", &dt, false, Instant::now());
        assert!(m.optimize_strategies().is_empty());
        m.record_evictions(&dt, 3);
        assert!(m.optimize_strategies().is_empty());
    }
}
