//! Transactional-outbox consumption
//!
//! - `payload`: versioned JSON envelope shared by every outbox event
//! - `dispatch`: aggregate/event routing table
//! - `worker`: claim/dispatch/mark polling loop

pub mod config;
pub mod dispatch;
pub mod payload;
pub mod worker;

pub use config::OutboxWorkerConfig;
pub use dispatch::{NoopEventHandler, OutboxDispatcher, OutboxEventHandler};
pub use payload::{fields, OutboxPayload, PAYLOAD_VERSION};
pub use worker::{OutboxWorker, WorkerMetrics};
