use crate::fanout::config::{CircuitBreakerAction, FanoutConfig};

/// Breaker verdict for one dependency's candidate set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Proceed,
    Tripped(CircuitBreakerAction),
}

/// Fanout size guard
///
/// Exactly `max_fanout` candidates pass; `max_fanout + 1` trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreaker {
    pub max_fanout: usize,
    pub action: CircuitBreakerAction,
}

impl CircuitBreaker {
    pub fn new(max_fanout: usize, action: CircuitBreakerAction) -> Self {
        Self { max_fanout, action }
    }

    pub fn from_config(config: &FanoutConfig) -> Self {
        Self::new(config.max_fanout, config.circuit_breaker_action)
    }

    pub fn should_trip(&self, candidate_count: usize) -> bool {
        candidate_count > self.max_fanout
    }

    pub fn evaluate(&self, candidate_count: usize) -> BreakerDecision {
        if self.should_trip(candidate_count) {
            BreakerDecision::Tripped(self.action)
        } else {
            BreakerDecision::Proceed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary() {
        let breaker = CircuitBreaker::new(10_000, CircuitBreakerAction::Skip);
        assert!(!breaker.should_trip(0));
        assert!(!breaker.should_trip(10_000));
        assert!(breaker.should_trip(10_001));
    }

    #[test]
    fn test_evaluate_reports_configured_action() {
        let breaker = CircuitBreaker::from_config(&FanoutConfig {
            max_fanout: 5,
            circuit_breaker_action: CircuitBreakerAction::Async,
            ..FanoutConfig::default()
        });
        assert_eq!(breaker.evaluate(5), BreakerDecision::Proceed);
        assert_eq!(
            breaker.evaluate(6),
            BreakerDecision::Tripped(CircuitBreakerAction::Async)
        );
    }
}
