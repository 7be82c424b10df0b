//! Rolling per-tier health derived from call outcomes and circuit state.

use std::collections::VecDeque;
use std::sync::Mutex;

use stratum_core::{CircuitState, HealthStatus};

/// Outcomes needed before an error rate can mark a tier degraded.
const MIN_SAMPLES: usize = 5;

#[derive(Debug)]
struct Outcomes {
    recent: VecDeque<bool>,
    errors: usize,
    last: HealthStatus,
}

#[derive(Debug)]
pub struct TierHealthTracker {
    window: usize,
    degraded_rate: f64,
    state: Mutex<Outcomes>,
}

impl TierHealthTracker {
    pub fn new(window: usize, degraded_rate: f64) -> Self {
        Self {
            window: window.max(1),
            degraded_rate,
            state: Mutex::new(Outcomes {
                recent: VecDeque::new(),
                errors: 0,
                last: HealthStatus::Healthy,
            }),
        }
    }

    /// Record one call. Returns the new status when it changed.
    pub fn observe(&self, ok: bool, circuit: CircuitState) -> Option<HealthStatus> {
        let mut s = self.state.lock().ok()?;
        if s.recent.len() == self.window && s.recent.pop_front() == Some(false) {
            s.errors -= 1;
        }
        s.recent.push_back(ok);
        if !ok {
            s.errors += 1;
        }
        let status = self.derive(&s, circuit);
        if status == s.last {
            return None;
        }
        s.last = status;
        Some(status)
    }

    pub fn status(&self, circuit: CircuitState) -> HealthStatus {
        match self.state.lock() {
            Ok(s) => self.derive(&s, circuit),
            Err(_) => HealthStatus::Unhealthy,
        }
    }

    pub fn error_rate(&self) -> f64 {
        self.state
            .lock()
            .map(|s| match s.recent.len() {
                0 => 0.0,
                n => s.errors as f64 / n as f64,
            })
            .unwrap_or(1.0)
    }

    fn derive(&self, s: &Outcomes, circuit: CircuitState) -> HealthStatus {
        match circuit {
            CircuitState::Open => HealthStatus::Unhealthy,
            CircuitState::HalfOpen => HealthStatus::Degraded,
            CircuitState::Closed => {
                let samples = s.recent.len();
                let enough = samples >= MIN_SAMPLES.min(self.window);
                if enough && s.errors as f64 / samples as f64 >= self.degraded_rate {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rate_degrades_and_recovers() {
        let t = TierHealthTracker::new(10, 0.5);
        for _ in 0..4 {
            assert_eq!(t.observe(false, CircuitState::Closed), None);
        }
        // fifth error reaches the sample minimum
        assert_eq!(t.observe(false, CircuitState::Closed), Some(HealthStatus::Degraded));
        assert_eq!(t.observe(false, CircuitState::Closed), None);

        let mut changed = None;
        for _ in 0..10 {
            if let Some(s) = t.observe(true, CircuitState::Closed) {
                changed = Some(s);
            }
        }
        assert_eq!(changed, Some(HealthStatus::Healthy));
        assert_eq!(t.error_rate(), 0.0);
    }

    #[test]
    fn test_circuit_state_dominates() {
        let t = TierHealthTracker::new(10, 0.5);
        assert_eq!(t.observe(true, CircuitState::Open), Some(HealthStatus::Unhealthy));
        assert_eq!(t.status(CircuitState::HalfOpen), HealthStatus::Degraded);
        assert_eq!(t.observe(true, CircuitState::Closed), Some(HealthStatus::Healthy));
    }

    #[test]
    fn test_window_is_bounded() {
        let t = TierHealthTracker::new(4, 0.5);
        for _ in 0..4 {
            t.observe(false, CircuitState::Closed);
        }
        for _ in 0..4 {
            t.observe(true, CircuitState::Closed);
        }
        assert_eq!(t.error_rate(), 0.0);
        assert_eq!(t.status(CircuitState::Closed), HealthStatus::Healthy);
    }
}
