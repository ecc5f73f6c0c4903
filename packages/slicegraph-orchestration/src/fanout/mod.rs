//! Fanout: re-slice downstream entities when an upstream entity changes
//!
//! Dependency inference, the circuit breaker and batching are pure units;
//! `engine` holds the I/O orchestration around them.

pub mod batching;
pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod dependency;
pub mod engine;
pub mod job;
pub mod queue;
pub mod window;

pub use batching::{batch_count, plan_batches};
pub use circuit_breaker::{BreakerDecision, CircuitBreaker};
pub use config::{
    CircuitBreakerAction, FanoutConfig, FanoutOverrides, FanoutPreset, FanoutPriority, RetryConfig,
};
pub use dedup::{DedupKey, DeduplicationCache};
pub use dependency::{infer_dependencies, DependencyGraph, FanoutDependency};
pub use engine::{
    CandidateFailure, DependencyResult, FanoutEngine, FanoutMetrics, FanoutResult, FanoutStatus,
    DUPLICATE_MESSAGE,
};
pub use job::{FanoutCandidate, FanoutJob, FanoutJobStatus};
pub use queue::{FanoutQueue, InMemoryFanoutQueue};
pub use window::{ShipRequest, ShipWindow, WindowConfig, WindowFlushTarget};
