/*
 * Slicegraph Orchestration - incremental slice materialization
 *
 * Raw entity versions become typed, content-hashed slices that are
 * shipped to sinks and re-derived when upstream entities change.
 *
 * Architecture:
 * - Outbox polling worker (claim / dispatch / mark, stale-claim recovery)
 * - Slicing engine (FULL and INCREMENTAL via impact map)
 * - Fanout engine (inverted index, circuit breaker, batching, dedup)
 * - Deploy state machine (QUEUED → ... → DONE | FAILED)
 * - Ship / view assembly, ingest, YAML settings, tracing setup
 */

// Public modules
pub mod contract;
pub mod deploy;
pub mod error;
pub mod fanout;
pub mod ingest;
pub mod outbox;
pub mod settings;
pub mod ship;
pub mod slicing;
pub mod telemetry;

// Re-exports
pub use contract::{
    ContractRegistry, ImpactMap, InMemoryContractRegistry, IndexRule, JoinSpec, MissingPolicy,
    RuleSet, RuleSetRef, SinkRule, SliceBuildRule, ViewDefinition, ViewRef,
};
pub use deploy::{transition, DeployEvent, DeployRecord, DeployState, DeployTracker, InvalidTransition};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use fanout::{
    CircuitBreakerAction, FanoutConfig, FanoutEngine, FanoutJob, FanoutJobStatus, FanoutMetrics,
    FanoutPreset, FanoutPriority, FanoutResult, FanoutStatus, InMemoryFanoutQueue, RetryConfig,
    ShipWindow, WindowConfig,
};
pub use ingest::{IngestReceipt, IngestService};
pub use outbox::{
    OutboxDispatcher, OutboxEventHandler, OutboxPayload, OutboxWorker, OutboxWorkerConfig,
    WorkerMetrics,
};
pub use settings::{ConfigError, Settings};
pub use ship::{ShipRequestHandler, SliceEventRouter, ViewAssembler};
pub use slicing::{
    ChangeSet, SliceExecutor, SlicingEngine, SlicingMode, SlicingResult, UpstreamChange,
};
