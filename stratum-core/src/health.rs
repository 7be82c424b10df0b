//! Tier health and circuit breaker state

use serde::{Deserialize, Serialize};
use std::fmt;

/// Health status for a tier or for the cache subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Tier is fully operational
    Healthy,
    /// Tier is operational but failing often or short-circuited
    Degraded,
    /// Tier is not operational
    Unhealthy,
}

impl HealthStatus {
    pub fn is_degraded(&self) -> bool {
        !matches!(self, Self::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, calls flow normally
    Closed = 0,
    /// Circuit is open, calls are short-circuited
    Open = 1,
    /// Circuit is half-open, probing whether the tier recovered
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Health implied by the breaker alone.
    pub fn health(&self) -> HealthStatus {
        match self {
            Self::Closed => HealthStatus::Healthy,
            Self::HalfOpen => HealthStatus::Degraded,
            Self::Open => HealthStatus::Unhealthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_state_from_u8() {
        assert_eq!(CircuitState::from(0), CircuitState::Closed);
        assert_eq!(CircuitState::from(1), CircuitState::Open);
        assert_eq!(CircuitState::from(2), CircuitState::HalfOpen);
        assert_eq!(CircuitState::from(255), CircuitState::HalfOpen);
    }

    #[test]
    fn test_circuit_health_mapping() {
        assert!(!CircuitState::Closed.health().is_degraded());
        assert!(CircuitState::HalfOpen.health().is_degraded());
        assert_eq!(CircuitState::Open.health(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_health_status_serde_lowercase() {
        let json = serde_json::to_string(&HealthStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }
}
