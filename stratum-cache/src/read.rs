//! Result of a coordinator read.

use serde::Serialize;

use stratum_core::{CacheEntry, DataType};

/// Where a read was answered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "tier")]
pub enum ReadSource {
    /// A storage tier held a copy.
    Tier(String),
    /// The source of truth was called.
    Loader,
}

/// A value returned by `get`, with provenance.
///
/// A stale read is an expired copy served because the loader failed and
/// stale serving was enabled. It is never counted as a hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead {
    value: Vec<u8>,
    source: ReadSource,
    stale: bool,
    data_type: DataType,
    version: u64,
}

impl CacheRead {
    pub(crate) fn hit(entry: CacheEntry, tier: &str) -> Self {
        Self::from_entry(entry, ReadSource::Tier(tier.to_string()), false)
    }

    pub(crate) fn loaded(entry: CacheEntry) -> Self {
        Self::from_entry(entry, ReadSource::Loader, false)
    }

    pub(crate) fn stale(entry: CacheEntry, tier: &str) -> Self {
        Self::from_entry(entry, ReadSource::Tier(tier.to_string()), true)
    }

    fn from_entry(entry: CacheEntry, source: ReadSource, stale: bool) -> Self {
        Self {
            value: entry.value,
            source,
            stale,
            data_type: entry.data_type,
            version: entry.version,
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    pub fn source(&self) -> &ReadSource {
        &self.source
    }

    /// Tier that served the value, `None` when it came from the loader.
    pub fn served_by(&self) -> Option<&str> {
        match &self.source {
            ReadSource::Tier(name) => Some(name),
            ReadSource::Loader => None,
        }
    }

    /// Fresh value from a cache tier.
    pub fn is_hit(&self) -> bool {
        !self.stale && matches!(self.source, ReadSource::Tier(_))
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn entry() -> CacheEntry {
        CacheEntry::new("k", b"v".to_vec(), DataType::new("note"), Duration::from_secs(5), Instant::now())
            .with_version(7)
    }

    #[test]
    fn test_provenance() {
        let hit = CacheRead::hit(entry(), "memory");
        assert!(hit.is_hit());
        assert_eq!(hit.served_by(), Some("memory"));
        assert_eq!(hit.version(), 7);
        assert_eq!(hit.data_type().as_str(), "note");

        let loaded = CacheRead::loaded(entry());
        assert!(!loaded.is_hit());
        assert_eq!(loaded.served_by(), None);
        assert_eq!(loaded.source(), &ReadSource::Loader);

        let stale = CacheRead::stale(entry(), "distributed");
        assert!(stale.is_stale());
        assert!(!stale.is_hit());
        assert_eq!(stale.into_value(), b"v");
    }
}
