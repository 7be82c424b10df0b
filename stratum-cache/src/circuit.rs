//! Circuit breaker for network tiers.
//!
//! `Closed` lets calls through. `failure_threshold` consecutive failures open
//! the circuit and every call is short-circuited until `cooldown` has elapsed,
//! at which point a call is let through in `HalfOpen`. `success_threshold`
//! successes close it again; any failure while half-open re-opens it.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

use stratum_core::{BreakerConfig, CircuitState};

pub struct CircuitBreaker {
    tier: String,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    failure_threshold: u32,
    success_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(tier: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            tier: tier.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            cooldown: config.cooldown(),
        }
    }

    /// Current state without side effects.
    ///
    /// An open circuit whose cooldown has elapsed still reports `Open` here;
    /// the transition to `HalfOpen` happens on the next [`Self::is_allowed`].
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn is_allowed(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = match self.opened_at.read() {
                    Ok(guard) => (*guard).is_some_and(|at| at.elapsed() >= self.cooldown),
                    Err(_) => false,
                };
                if cooled_down
                    && self
                        .state
                        .compare_exchange(
                            CircuitState::Open as u8,
                            CircuitState::HalfOpen as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                {
                    self.success_count.store(0, Ordering::SeqCst);
                    tracing::info!(tier = %self.tier, "Circuit half-open, probing tier");
                }
                cooled_down
            }
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);

        if self.state() == CircuitState::HalfOpen {
            let count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= self.success_threshold {
                self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
                self.success_count.store(0, Ordering::SeqCst);
                tracing::info!(tier = %self.tier, "Circuit closed, tier recovered");
            }
        }
    }

    pub fn record_failure(&self) {
        self.success_count.store(0, Ordering::SeqCst);
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;

        let reopen = self.state() == CircuitState::HalfOpen;
        if reopen || (self.state() == CircuitState::Closed && count >= self.failure_threshold) {
            if let Ok(mut guard) = self.opened_at.write() {
                *guard = Some(Instant::now());
            }
            self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
            tracing::warn!(
                tier = %self.tier,
                consecutive_failures = count,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit opened"
            );
        }
    }

    pub fn reset(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        if let Ok(mut guard) = self.opened_at.write() {
            *guard = None;
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("tier", &self.tier)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count.load(Ordering::Relaxed))
            .field("success_count", &self.success_count.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "distributed",
            &BreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                cooldown_secs: 10,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_streak() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown_then_closes() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cb.is_allowed());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cb.is_allowed());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_allowed());
    }
}
