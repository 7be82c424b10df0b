//! Error types for stratum cache operations

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a single cache tier.
///
/// These are absorbed by the coordinator: a failing tier is treated as a
/// miss for that tier only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TierError {
    #[error("Tier {tier} unavailable: {reason}")]
    Unavailable { tier: String, reason: String },

    #[error("Tier {tier} timed out after {timeout:?}")]
    Timeout { tier: String, timeout: Duration },

    #[error("Circuit open for tier {tier}")]
    CircuitOpen { tier: String },

    #[error("Tier {tier} lock poisoned")]
    LockPoisoned { tier: String },
}

impl TierError {
    /// Name of the tier that raised this error.
    pub fn tier(&self) -> &str {
        match self {
            Self::Unavailable { tier, .. }
            | Self::Timeout { tier, .. }
            | Self::CircuitOpen { tier }
            | Self::LockPoisoned { tier } => tier,
        }
    }
}

/// Errors raised by a caller-supplied source-of-truth loader.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoaderError {
    #[error("Loader failed for key {key}: {reason}")]
    Failed { key: String, reason: String },

    #[error("Loader for key {key} timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    #[error("No loader registered for key {key}")]
    NoLoader { key: String },

    #[error("Load for key {key} was cancelled")]
    Cancelled { key: String },
}

impl LoaderError {
    /// Convenience constructor used by loader implementations.
    pub fn failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Errors decoding or encoding a stored payload.
///
/// A payload that fails to decode is evicted and treated as a miss.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SerializationError {
    #[error("Failed to encode entry {key}: {reason}")]
    Encode { key: String, reason: String },

    #[error("Failed to decode entry {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("Failed to decrypt entry {key}")]
    Decrypt { key: String },

    #[error("Failed to decompress entry {key}: {reason}")]
    Decompress { key: String, reason: String },

    #[error("Unsupported envelope version {version} for entry {key}")]
    VersionMismatch { key: String, version: u8 },
}

/// Invalid caller input or lifecycle transitions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Cache key must not be empty")]
    EmptyKey,

    #[error("Cache key exceeds {max} bytes (got {len})")]
    KeyTooLong { len: usize, max: usize },

    #[error("Invalid TTL: {reason}")]
    InvalidTtl { reason: String },

    #[error("Unknown tier: {tier}")]
    UnknownTier { tier: String },

    #[error("Alert not found: {id}")]
    AlertNotFound { id: Uuid },

    #[error("Invalid alert transition for {id}: {from} -> {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },
}

/// Configuration errors. Fatal at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },

    #[error("Failed to read configuration file {path}: {reason}")]
    Io { path: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(
        field: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Master error type for all stratum errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StratumError {
    #[error("Tier error: {0}")]
    Tier(#[from] TierError),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache system is shut down")]
    ShutDown,
}

impl StratumError {
    /// True when the error came from the source-of-truth loader.
    pub fn is_loader_failure(&self) -> bool {
        matches!(self, Self::Loader(_))
    }

    /// True when the error is a loader timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Loader(LoaderError::Timeout { .. }))
    }
}

/// Result type alias for stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;

/// Result type alias for tier-level operations.
pub type TierResult<T> = Result<T, TierError>;

// =============================================================================
// TESTS
// =============================================================================
