//! Bounded in-process tier with strict LRU eviction.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use stratum_core::{
    CacheEntry, CacheStats, DataType, MemoryTierConfig, TierError, TierResult, TIER_MEMORY,
};

use super::{CacheTier, TierCounters};

struct Slot {
    entry: CacheEntry,
    last_tick: u64,
    created_tick: u64,
}

/// Recency order key: least recently accessed first, ties by earliest creation.
type OrderKey = (u64, u64);

#[derive(Default)]
struct LruState {
    slots: HashMap<String, Slot>,
    order: BTreeMap<OrderKey, String>,
    tick: u64,
    total_bytes: u64,
    evicted: HashMap<DataType, u64>,
}

impl LruState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.next_tick();
        if let Some(slot) = self.slots.get_mut(key) {
            self.order.remove(&(slot.last_tick, slot.created_tick));
            slot.last_tick = tick;
            self.order.insert((tick, slot.created_tick), key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&(slot.last_tick, slot.created_tick));
        self.total_bytes = self.total_bytes.saturating_sub(slot.entry.size_bytes as u64);
        Some(slot.entry)
    }

    fn evict_lru(&mut self) -> Option<CacheEntry> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.slots.remove(&key)?;
        self.total_bytes = self.total_bytes.saturating_sub(slot.entry.size_bytes as u64);
        *self.evicted.entry(slot.entry.data_type.clone()).or_default() += 1;
        Some(slot.entry)
    }

    fn insert(&mut self, entry: CacheEntry) {
        let tick = self.next_tick();
        self.total_bytes += entry.size_bytes as u64;
        self.order.insert((tick, tick), entry.key.clone());
        self.slots.insert(
            entry.key.clone(),
            Slot {
                entry,
                last_tick: tick,
                created_tick: tick,
            },
        );
    }
}

/// Local memory tier.
///
/// Holds at most `capacity` entries. Inserting a new key at capacity evicts
/// the least recently accessed entry. Expired entries are not served as fresh
/// but are kept for `stale_grace` so the coordinator can fall back to them
/// when the loader fails.
pub struct MemoryTier {
    name: String,
    capacity: usize,
    ttl_scale: f64,
    stale_grace: Duration,
    state: Mutex<LruState>,
    counters: TierCounters,
}

impl MemoryTier {
    pub fn new(config: &MemoryTierConfig, stale_grace: Duration, stats_window: Duration) -> Self {
        Self::named(TIER_MEMORY, config, stale_grace, stats_window)
    }

    pub fn named(
        name: impl Into<String>,
        config: &MemoryTierConfig,
        stale_grace: Duration,
        stats_window: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            capacity: config.capacity.max(1),
            ttl_scale: config.ttl_scale,
            stale_grace,
            state: Mutex::new(LruState::default()),
            counters: TierCounters::new(stats_window),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of resident entries, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resident keys from least to most recently accessed.
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.order.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> TierResult<MutexGuard<'_, LruState>> {
        self.state.lock().map_err(|_| TierError::LockPoisoned {
            tier: self.name.clone(),
        })
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn ttl_scale(&self) -> f64 {
        self.ttl_scale
    }

    async fn get(&self, key: &str) -> TierResult<Option<CacheEntry>> {
        let now = crate::now();
        let mut state = self.lock()?;

        let expired = match state.slots.get(key) {
            None => {
                self.counters.miss();
                return Ok(None);
            }
            Some(slot) => slot.entry.is_expired(now),
        };

        if expired {
            let dead = state
                .slots
                .get(key)
                .is_some_and(|slot| !slot.entry.is_stale_servable(now, self.stale_grace));
            if dead {
                state.remove(key);
            }
            self.counters.miss();
            return Ok(None);
        }

        state.touch(key);
        let entry = state.slots.get_mut(key).map(|slot| {
            slot.entry.touch(now);
            slot.entry.clone()
        });
        self.counters.hit();
        Ok(entry)
    }

    async fn get_stale(&self, key: &str) -> TierResult<Option<CacheEntry>> {
        let now = crate::now();
        let state = self.lock()?;
        Ok(state
            .slots
            .get(key)
            .filter(|slot| slot.entry.is_stale_servable(now, self.stale_grace))
            .map(|slot| slot.entry.clone()))
    }

    async fn set(&self, mut entry: CacheEntry) -> TierResult<()> {
        entry.size_bytes = entry.value.len();
        if entry.origin_tier.is_empty() {
            entry.origin_tier = self.name.clone();
        }

        let mut state = self.lock()?;
        let replaced = state.remove(&entry.key).is_some();

        let mut evicted = 0u64;
        if !replaced {
            while state.slots.len() >= self.capacity {
                match state.evict_lru() {
                    Some(victim) => {
                        evicted += 1;
                        tracing::trace!(tier = %self.name, key = %victim.key, "Evicted LRU entry");
                    }
                    None => break,
                }
            }
        }
        state.insert(entry);
        drop(state);

        if evicted > 0 {
            self.counters.evicted(evicted);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> TierResult<bool> {
        Ok(self.lock()?.remove(key).is_some())
    }

    async fn clear(&self, tags: &[String]) -> TierResult<u64> {
        let mut state = self.lock()?;
        if tags.is_empty() {
            let removed = state.slots.len() as u64;
            state.slots.clear();
            state.order.clear();
            state.total_bytes = 0;
            return Ok(removed);
        }

        let doomed: Vec<String> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.has_any_tag(tags))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            state.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn stats(&self) -> CacheStats {
        let (count, bytes) = self
            .lock()
            .map(|s| (s.slots.len() as u64, s.total_bytes))
            .unwrap_or((0, 0));
        self.counters.snapshot(count, bytes)
    }

    async fn export(&self) -> TierResult<Vec<CacheEntry>> {
        let now = crate::now();
        let state = self.lock()?;
        Ok(state
            .order
            .values()
            .filter_map(|key| state.slots.get(key))
            .filter(|slot| !slot.entry.is_expired(now))
            .map(|slot| slot.entry.clone())
            .collect())
    }

    async fn purge_expired(&self) -> TierResult<u64> {
        let now = crate::now();
        let mut state = self.lock()?;
        let expired: Vec<String> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        Ok(expired.len() as u64)
    }

    fn take_evictions(&self) -> Vec<(DataType, u64)> {
        self.lock()
            .map(|mut s| s.evicted.drain().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tier(capacity: usize) -> MemoryTier {
        MemoryTier::new(
            &MemoryTierConfig {
                capacity,
                ttl_scale: 1.0,
            },
            Duration::from_secs(30),
            Duration::from_secs(3600),
        )
    }

    fn entry(key: &str, ttl_secs: u64) -> CacheEntry {
        CacheEntry::new(
            key,
            key.as_bytes().to_vec(),
            DataType::default(),
            Duration::from_secs(ttl_secs),
            crate::now(),
        )
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let tier = tier(4);
        tier.set(entry("a", 60)).await.unwrap();
        let got = tier.get("a").await.unwrap().unwrap();
        assert_eq!(got.value, b"a");
        assert_eq!(got.origin_tier, "memory");
        assert_eq!(got.access_count, 1);
        assert!(tier.get("b").await.unwrap().is_none());

        let stats = tier.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_size_bytes, 1);
    }

    #[tokio::test]
    async fn test_evicts_least_recently_accessed() {
        let tier = tier(3);
        for key in ["a", "b", "c"] {
            tier.set(entry(key, 60)).await.unwrap();
        }
        // touch a, making b the LRU entry
        tier.get("a").await.unwrap();
        tier.set(entry("d", 60)).await.unwrap();

        assert!(tier.get("b").await.unwrap().is_none());
        assert!(tier.get("a").await.unwrap().is_some());
        assert!(tier.get("c").await.unwrap().is_some());
        assert!(tier.get("d").await.unwrap().is_some());
        assert_eq!(tier.stats().await.evictions, 1);

        let evictions = tier.take_evictions();
        assert_eq!(evictions, vec![(DataType::default(), 1)]);
        assert!(tier.take_evictions().is_empty());
    }

    #[tokio::test]
    async fn test_replace_does_not_evict() {
        let tier = tier(2);
        tier.set(entry("a", 60)).await.unwrap();
        tier.set(entry("b", 60)).await.unwrap();
        tier.set(entry("a", 60)).await.unwrap();
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.stats().await.evictions, 0);
        assert_eq!(tier.keys_by_recency(), vec!["b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_miss_but_stale_servable() {
        let tier = tier(4);
        tier.set(entry("a", 10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(tier.get("a").await.unwrap().is_none());
        let stale = tier.get_stale("a").await.unwrap();
        assert_eq!(stale.unwrap().value, b"a");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(tier.get_stale("a").await.unwrap().is_none());
        assert!(tier.get("a").await.unwrap().is_none());
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_clear_by_tag() {
        let tier = tier(8);
        tier.set(entry("a", 60).with_tags(["user:1"])).await.unwrap();
        tier.set(entry("b", 60).with_tags(["user:2"])).await.unwrap();
        tier.set(entry("c", 60).with_tags(["user:1", "team:9"])).await.unwrap();
        tier.set(entry("d", 60)).await.unwrap();

        let removed = tier.clear(&["user:1".to_string()]).await.unwrap();
        assert_eq!(removed, 2);
        assert!(tier.get("a").await.unwrap().is_none());
        assert!(tier.get("c").await.unwrap().is_none());
        assert!(tier.get("b").await.unwrap().is_some());
        assert!(tier.get("d").await.unwrap().is_some());

        assert_eq!(tier.clear(&[]).await.unwrap(), 2);
        assert!(tier.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_and_export_skip_expired() {
        let tier = tier(8);
        tier.set(entry("short", 5)).await.unwrap();
        tier.set(entry("long", 500)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let exported = tier.export().await.unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].key, "long");

        assert_eq!(tier.purge_expired().await.unwrap(), 1);
        assert_eq!(tier.len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let tier = tier(2);
        tier.set(entry("a", 60)).await.unwrap();
        assert!(tier.delete("a").await.unwrap());
        assert!(!tier.delete("a").await.unwrap());
        assert_eq!(tier.stats().await.total_size_bytes, 0);
    }

    /// Reference model: the victim is always the key whose last access is oldest.
    fn model_victim(recency: &[String]) -> Option<String> {
        recency.first().cloned()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_eviction_follows_access_order(
            capacity in 2usize..6,
            accesses in proptest::collection::vec(0usize..8, 1..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let tier = tier(capacity);
                let mut recency: Vec<String> = Vec::new();

                for idx in accesses {
                    let key = format!("k{idx}");
                    if recency.contains(&key) {
                        tier.get(&key).await.unwrap();
                        recency.retain(|k| k != &key);
                        recency.push(key);
                        continue;
                    }
                    if recency.len() >= capacity {
                        let victim = model_victim(&recency).unwrap();
                        recency.retain(|k| k != &victim);
                    }
                    tier.set(entry(&key, 600)).await.unwrap();
                    recency.push(key);
                    prop_assert_eq!(tier.keys_by_recency(), recency.clone());
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
