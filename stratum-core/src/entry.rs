//! Cache entry and data type tag

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use crate::constants::{DEFAULT_DATA_TYPE, MAX_KEY_LENGTH};
use crate::error::ValidationError;

/// Data type tag used to select a caching strategy (e.g. `note`, `user_profile`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataType(String);

impl DataType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DataType {
    fn default() -> Self {
        Self(DEFAULT_DATA_TYPE.to_string())
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DataType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Validate a caller-supplied cache key.
pub fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::EmptyKey);
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(ValidationError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LENGTH,
        });
    }
    Ok(())
}

/// Validate a caller-supplied TTL.
pub fn validate_ttl(ttl: Duration) -> Result<(), ValidationError> {
    if ttl.is_zero() {
        return Err(ValidationError::InvalidTtl {
            reason: "ttl must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// A single cached value as held by one tier.
///
/// Entries are exclusively owned by the tier that stores them; the
/// coordinator only passes clones between tiers.
///
/// # Invariants
///
/// - `expires_at >= created_at`
/// - `size_bytes == value.len()` as stored by the owning tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    /// Opaque serialized payload.
    pub value: Vec<u8>,
    /// Name of the tier (or `loader`) that produced this entry.
    pub origin_tier: String,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub last_accessed_at: Instant,
    pub access_count: u64,
    pub size_bytes: usize,
    /// Whether the payload is stored compressed by serializing tiers.
    pub compressed: bool,
    /// Whether the payload is stored encrypted by serializing tiers.
    pub encrypted: bool,
    pub data_type: DataType,
    /// Group invalidation tags.
    pub tags: BTreeSet<String>,
    pub version: u64,
}

impl CacheEntry {
    /// Create an entry that expires `ttl` after `now`.
    pub fn new(
        key: impl Into<String>,
        value: Vec<u8>,
        data_type: DataType,
        ttl: Duration,
        now: Instant,
    ) -> Self {
        let size_bytes = value.len();
        Self {
            key: key.into(),
            value,
            origin_tier: String::new(),
            created_at: now,
            expires_at: now + ttl,
            last_accessed_at: now,
            access_count: 0,
            size_bytes,
            compressed: false,
            encrypted: false,
            data_type,
            tags: BTreeSet::new(),
            version: 0,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_origin(mut self, tier: impl Into<String>) -> Self {
        self.origin_tier = tier.into();
        self
    }

    /// Set the payload transforms requested by the data type's strategy.
    pub fn with_transforms(mut self, compressed: bool, encrypted: bool) -> Self {
        self.compressed = compressed;
        self.encrypted = encrypted;
        self
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Total lifetime the entry was created with.
    pub fn ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(self.created_at)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// True when expired but still inside the stale-serving grace period.
    pub fn is_stale_servable(&self, now: Instant, grace: Duration) -> bool {
        self.is_expired(now) && now < self.expires_at + grace
    }

    /// Record an access.
    pub fn touch(&mut self, now: Instant) {
        self.last_accessed_at = now;
        self.access_count = self.access_count.saturating_add(1);
    }

    /// Copy of this entry re-timed with a new TTL starting at `now`.
    pub fn retimed(&self, ttl: Duration, now: Instant) -> Self {
        let mut entry = self.clone();
        entry.created_at = now;
        entry.expires_at = now + ttl;
        entry.last_accessed_at = now;
        entry.access_count = 0;
        entry
    }

    /// True when the entry carries any of the given tags.
    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|t| self.tags.contains(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiry_invariant() {
        let now = Instant::now();
        let entry = CacheEntry::new("k", b"v".to_vec(), DataType::default(), Duration::from_secs(60), now);
        assert!(entry.expires_at >= entry.created_at);
        assert_eq!(entry.ttl(), Duration::from_secs(60));
        assert_eq!(entry.size_bytes, 1);
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_stale_servable_window() {
        let now = Instant::now();
        let entry = CacheEntry::new("k", vec![], DataType::default(), Duration::from_secs(10), now);
        let grace = Duration::from_secs(5);
        assert!(!entry.is_stale_servable(now, grace));
        assert!(entry.is_stale_servable(now + Duration::from_secs(12), grace));
        assert!(!entry.is_stale_servable(now + Duration::from_secs(16), grace));
    }

    #[test]
    fn test_tags_intersection() {
        let entry = CacheEntry::new("k", vec![], DataType::from("note"), Duration::from_secs(1), Instant::now())
            .with_tags(["user:1", "notebook:7"]);
        assert!(entry.has_any_tag(&["notebook:7".to_string()]));
        assert!(!entry.has_any_tag(&["user:2".to_string()]));
        assert!(!entry.has_any_tag(&[]));
    }

    #[test]
    fn test_retimed_resets_lifetime() {
        let now = Instant::now();
        let mut entry = CacheEntry::new("k", vec![1, 2], DataType::default(), Duration::from_secs(100), now);
        entry.touch(now);
        let later = now + Duration::from_secs(30);
        let copy = entry.retimed(Duration::from_secs(20), later);
        assert_eq!(copy.created_at, later);
        assert_eq!(copy.remaining_ttl(later), Duration::from_secs(20));
        assert_eq!(copy.access_count, 0);
    }

    #[test]
    fn test_validate_key() {
        assert_eq!(validate_key(""), Err(ValidationError::EmptyKey));
        assert!(validate_key("note:1").is_ok());
        let long = "x".repeat(MAX_KEY_LENGTH + 1);
        assert!(matches!(
            validate_key(&long),
            Err(ValidationError::KeyTooLong { .. })
        ));
    }

    #[test]
    fn test_validate_ttl_rejects_zero() {
        assert!(validate_ttl(Duration::ZERO).is_err());
        assert!(validate_ttl(Duration::from_millis(1)).is_ok());
    }
}
