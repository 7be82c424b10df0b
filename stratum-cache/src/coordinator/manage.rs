//! Administrative operations: per-tier stats and clearing, expiry sweeps,
//! export and import.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use stratum_core::{
    validate_key, CacheEntry, CacheStats, DataType, SerializationError, StratumResult,
    ValidationError,
};

use super::MultiLevelCacheCoordinator;
use crate::monitor::TierOutcome;

/// Selects the tiers an administrative call applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TierFilter {
    #[default]
    All,
    Only(Vec<String>),
}

impl TierFilter {
    pub fn only<I, S>(tiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(tiers.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, tier: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.iter().any(|n| n == tier),
        }
    }
}

/// One exported entry. The value is base64 in serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub key: String,
    #[serde(with = "b64")]
    pub value: Vec<u8>,
    pub tier: String,
    /// Remaining lifetime at export, rounded up.
    pub ttl_secs: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportFailure {
    pub index: usize,
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub failed: Vec<ImportFailure>,
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

impl MultiLevelCacheCoordinator {
    /// Stats for one tier by name.
    pub async fn stats_for(&self, tier: &str) -> StratumResult<CacheStats> {
        let found = self
            .inner
            .tiers
            .iter()
            .find(|t| t.name() == tier)
            .ok_or_else(|| ValidationError::UnknownTier {
                tier: tier.to_string(),
            })?;
        Ok(found.stats().await)
    }

    /// Clear entries tagged with any of `tags` from the selected tiers only.
    pub async fn clear_tier(&self, filter: &TierFilter, tags: &[String]) -> StratumResult<u64> {
        self.ensure_running()?;
        self.inner.clear_tiers(filter, tags).await
    }

    /// Sweep expired entries from the selected tiers. Returns the number removed.
    pub async fn cleanup(&self, filter: &TierFilter) -> StratumResult<u64> {
        self.ensure_running()?;
        self.inner.validate_filter(filter)?;

        let mut removed = 0;
        for (idx, tier) in self.inner.storage() {
            if !filter.matches(tier.name()) {
                continue;
            }
            match tier.purge_expired().await {
                Ok(n) => removed += n,
                Err(e) => self.inner.absorb(idx, "*", "purge_expired", &e),
            }
        }
        tracing::debug!(removed, "Expired entries purged");
        Ok(removed)
    }

    /// Live entries of the selected tiers.
    pub async fn export(&self, filter: &TierFilter) -> StratumResult<Vec<ExportRecord>> {
        self.ensure_running()?;
        self.inner.validate_filter(filter)?;

        let now = crate::now();
        let mut records = Vec::new();
        for (idx, tier) in self.inner.storage() {
            if !filter.matches(tier.name()) {
                continue;
            }
            let entries = match tier.export().await {
                Ok(entries) => entries,
                Err(e) => {
                    self.inner.absorb(idx, "*", "export", &e);
                    continue;
                }
            };
            records.extend(entries.into_iter().filter(|e| !e.is_expired(now)).map(|e| {
                let remaining = e.remaining_ttl(now);
                let ttl_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                ExportRecord {
                    key: e.key,
                    value: e.value,
                    tier: tier.name().to_string(),
                    ttl_secs: ttl_secs.max(1),
                    tags: e.tags.into_iter().collect(),
                    data_type: e.data_type,
                }
            }));
        }
        Ok(records)
    }

    /// Write records straight into their tiers with their TTL as given.
    /// Invalid records are reported and skipped.
    pub async fn import(&self, records: Vec<ExportRecord>) -> StratumResult<ImportReport> {
        self.ensure_running()?;

        let inner = &self.inner;
        let mut report = ImportReport::default();
        for (index, record) in records.into_iter().enumerate() {
            let fail = |reason: String| ImportFailure {
                index,
                key: record.key.clone(),
                reason,
            };
            if let Err(e) = validate_key(&record.key) {
                report.failed.push(fail(e.to_string()));
                continue;
            }
            if record.ttl_secs == 0 {
                report.failed.push(fail("ttl_secs must be positive".to_string()));
                continue;
            }
            let Some((idx, tier)) = inner.storage().find(|(_, t)| t.name() == record.tier) else {
                report.failed.push(fail(
                    ValidationError::UnknownTier {
                        tier: record.tier.clone(),
                    }
                    .to_string(),
                ));
                continue;
            };

            let now = crate::now();
            let entry = CacheEntry::new(
                record.key.clone(),
                record.value,
                record.data_type.clone(),
                Duration::from_secs(record.ttl_secs),
                now,
            )
            .with_tags(record.tags)
            .with_version(inner.next_version());

            let started = crate::now();
            match tier.set(entry).await {
                Ok(()) => {
                    inner.observe(idx, TierOutcome::Write, started);
                    inner.strategy.record_fill(&record.key, &record.data_type, now);
                    report.imported += 1;
                }
                Err(e) => {
                    inner.observe(idx, TierOutcome::Error, started);
                    report.failed.push(ImportFailure {
                        index,
                        key: record.key,
                        reason: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            imported = report.imported,
            failed = report.failed.len(),
            "Cache import finished"
        );
        Ok(report)
    }

    pub async fn export_json(&self, filter: &TierFilter) -> StratumResult<String> {
        let records = self.export(filter).await?;
        serde_json::to_string(&records).map_err(|e| {
            SerializationError::Encode {
                key: "export".to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub async fn import_json(&self, json: &str) -> StratumResult<ImportReport> {
        let records: Vec<ExportRecord> =
            serde_json::from_str(json).map_err(|e| SerializationError::Decode {
                key: "import".to_string(),
                reason: e.to_string(),
            })?;
        self.import(records).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches() {
        assert!(TierFilter::All.matches("edge"));
        let only = TierFilter::only(["memory"]);
        assert!(only.matches("memory"));
        assert!(!only.matches("edge"));
    }

    #[test]
    fn test_record_value_is_base64() {
        let record = ExportRecord {
            key: "k".into(),
            value: b"hello".to_vec(),
            tier: "memory".into(),
            ttl_secs: 5,
            tags: vec!["t".into()],
            data_type: DataType::new("note"),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["value"], "aGVsbG8=");
        assert_eq!(json["data_type"], "note");

        let back: ExportRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_record_defaults() {
        let back: ExportRecord =
            serde_json::from_str(r#"{"key":"k","value":"","tier":"edge","ttl_secs":1}"#).unwrap();
        assert!(back.tags.is_empty());
        assert_eq!(back.data_type, DataType::default());
    }
}
