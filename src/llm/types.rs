//! LLM transport value types.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::types::LlmConfig;

/// Per-call timeout profile. Sub-timeouts are clamped to the remaining total
/// deadline at call time; `disable_total_deadline` exists for long-running
/// authoring flows and is never set on the per-step path.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmTimeoutProfile {
    pub disable_total_deadline: bool,
    pub call_timeout: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub pool_timeout: Duration,
}

impl LlmTimeoutProfile {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            disable_total_deadline: false,
            call_timeout: config.call_timeout,
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            pool_timeout: config.pool_timeout,
        }
    }
}

/// Per-provider circuit breaker state: a rolling window of network failure
/// instants plus an open-until deadline.
#[derive(Debug, Default)]
pub struct CircuitState {
    pub failure_instants: VecDeque<Instant>,
    pub open_until: Option<Instant>,
}

impl CircuitState {
    /// Drop failures older than the rolling window.
    pub fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(first) = self.failure_instants.front() {
            if now.duration_since(*first) > window {
                self.failure_instants.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn is_open(&mut self, now: Instant, window: Duration) -> bool {
        self.prune(now, window);
        matches!(self.open_until, Some(until) if until > now)
    }

    /// Record a network failure; opens the breaker once the threshold is hit.
    pub fn record_failure(
        &mut self,
        now: Instant,
        window: Duration,
        threshold: u32,
        open_for: Duration,
    ) {
        self.failure_instants.push_back(now);
        self.prune(now, window);
        if self.failure_instants.len() >= threshold.max(1) as usize {
            self.open_until = Some(now + open_for);
        }
    }

    /// Any success clears the failure window and closes the breaker.
    pub fn record_success(&mut self) {
        self.failure_instants.clear();
        self.open_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_at_threshold() {
        let mut circuit = CircuitState::default();
        let now = Instant::now();
        let window = Duration::from_secs(60);
        let open_for = Duration::from_secs(30);

        circuit.record_failure(now, window, 3, open_for);
        circuit.record_failure(now, window, 3, open_for);
        assert!(!circuit.is_open(now, window));

        circuit.record_failure(now, window, 3, open_for);
        assert!(circuit.is_open(now, window));
    }

    #[test]
    fn test_success_clears_window_and_closes() {
        let mut circuit = CircuitState::default();
        let now = Instant::now();
        let window = Duration::from_secs(60);
        circuit.record_failure(now, window, 1, Duration::from_secs(30));
        assert!(circuit.is_open(now, window));

        circuit.record_success();
        assert!(!circuit.is_open(now, window));
        assert!(circuit.failure_instants.is_empty());
    }

    #[test]
    fn test_old_failures_are_pruned() {
        let mut circuit = CircuitState::default();
        let window = Duration::from_secs(10);
        let old = Instant::now();
        circuit.record_failure(old, window, 5, Duration::from_secs(30));

        let later = old + Duration::from_secs(11);
        circuit.prune(later, window);
        assert!(circuit.failure_instants.is_empty());
    }
}
