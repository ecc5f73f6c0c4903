//! Outbox polling worker
//!
//! Loop: claim → dispatch (bounded concurrency) → mark PROCESSED/FAILED →
//! sleep. A handler failure only fails its own entry; a loop-level error
//! (claim or mark) backs off exponentially with jitter.

use crate::error::{OrchestratorError, Result};
use crate::fanout::ShipWindow;
use crate::outbox::config::OutboxWorkerConfig;
use crate::outbox::dispatch::OutboxDispatcher;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use slicegraph_storage::domain::{OutboxEntry, OutboxRepository};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Point-in-time worker counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub processed: u64,
    pub failed: u64,
    pub polls: u64,
    pub current_backoff_ms: u64,
    pub running: bool,
}

struct WorkerInner {
    config: OutboxWorkerConfig,
    outbox: Arc<dyn OutboxRepository>,
    dispatcher: Arc<OutboxDispatcher>,
    processed: AtomicU64,
    failed: AtomicU64,
    polls: AtomicU64,
    current_backoff_ms: AtomicU64,
    running: AtomicBool,
}

pub struct OutboxWorker {
    inner: Arc<WorkerInner>,
    window: Option<Arc<ShipWindow>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl OutboxWorker {
    pub fn new(
        config: OutboxWorkerConfig,
        outbox: Arc<dyn OutboxRepository>,
        dispatcher: Arc<OutboxDispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                config,
                outbox,
                dispatcher,
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                polls: AtomicU64::new(0),
                current_backoff_ms: AtomicU64::new(0),
                running: AtomicBool::new(false),
            }),
            window: None,
            task: Mutex::new(None),
        }
    }

    /// Ship window whose timers are cancelled (and contents flushed) on stop
    pub fn with_window(mut self, window: Arc<ShipWindow>) -> Self {
        self.window = Some(window);
        self
    }

    pub fn config(&self) -> &OutboxWorkerConfig {
        &self.inner.config
    }

    /// Spawn the polling loop; false if disabled or already running
    pub fn start(&self) -> bool {
        if !self.inner.config.enabled {
            info!("Outbox worker {} is disabled", self.inner.config.worker_id);
            return false;
        }

        let mut task = self.task.lock();
        if task.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        self.inner.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(run_loop(Arc::clone(&self.inner), cancel.clone()));
        *task = Some((cancel, handle));

        info!(
            "Outbox worker {} started (batch_size={}, concurrency={})",
            self.inner.config.worker_id,
            self.inner.config.batch_size,
            self.inner.config.handler_concurrency
        );
        true
    }

    /// Request shutdown and wait up to `timeout` for the in-flight batch
    ///
    /// Past the timeout the loop is aborted; its claimed entries stay
    /// PROCESSING until another poll reclaims them as stale. Returns false
    /// when the worker was not running.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let task = self.task.lock().take();
        let Some((cancel, mut handle)) = task else {
            return false;
        };

        cancel.cancel();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Outbox worker task ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    "Outbox worker {} did not stop within {:?}, aborting",
                    self.inner.config.worker_id, timeout
                );
                handle.abort();
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);

        if let Some(window) = &self.window {
            if let Err(e) = window.shutdown().await {
                warn!("Ship window flush on shutdown failed: {}", e);
            }
        }

        info!("Outbox worker {} stopped", self.inner.config.worker_id);
        true
    }

    /// Stop with the configured shutdown timeout
    pub async fn shutdown(&self) -> bool {
        self.stop(self.inner.config.shutdown_timeout()).await
    }

    /// One claim/dispatch/mark cycle; returns the number of claimed entries
    pub async fn poll_once(&self) -> Result<usize> {
        self.inner.poll_once().await
    }

    pub fn metrics(&self) -> WorkerMetrics {
        WorkerMetrics {
            processed: self.inner.processed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            polls: self.inner.polls.load(Ordering::Relaxed),
            current_backoff_ms: self.inner.current_backoff_ms.load(Ordering::Relaxed),
            running: self.inner.running.load(Ordering::SeqCst),
        }
    }
}

impl WorkerInner {
    async fn poll_once(&self) -> Result<usize> {
        self.polls.fetch_add(1, Ordering::Relaxed);

        let entries = self
            .outbox
            .claim_batch(
                self.config.batch_size,
                &self.config.worker_id,
                self.config.stale_claim_after(),
            )
            .await?;
        if entries.is_empty() {
            return Ok(0);
        }
        debug!("Worker {} claimed {} entries", self.config.worker_id, entries.len());

        let dispatches: Vec<_> = entries
            .iter()
            .map(|entry| self.dispatcher.dispatch(entry))
            .collect();
        let outcomes: Vec<anyhow::Result<()>> = stream::iter(dispatches)
            .buffered(self.config.handler_concurrency.max(1))
            .collect()
            .await;

        let mut succeeded: Vec<Uuid> = Vec::with_capacity(outcomes.len());
        let mut failures: Vec<(Uuid, String)> = Vec::new();
        for (entry, outcome) in entries.iter().zip(outcomes) {
            match outcome {
                Ok(()) => succeeded.push(entry.id),
                Err(e) => {
                    let category = e
                        .downcast_ref::<OrchestratorError>()
                        .map(|err| err.category().as_str())
                        .unwrap_or("handler");
                    warn!(
                        "Outbox entry {} ({}/{} {}) failed [{}]: {:#}",
                        entry.id,
                        entry.aggregate_type,
                        entry.event_type,
                        entry.aggregate_id,
                        category,
                        e
                    );
                    failures.push((entry.id, format!("{:#}", e)));
                }
            }
        }

        if !succeeded.is_empty() {
            self.outbox.mark_processed(&succeeded).await?;
        }
        for (id, reason) in &failures {
            self.outbox.mark_failed(*id, reason).await?;
        }

        self.processed
            .fetch_add(succeeded.len() as u64, Ordering::Relaxed);
        self.failed.fetch_add(failures.len() as u64, Ordering::Relaxed);

        info!(
            "Outbox poll: {} processed, {} failed",
            succeeded.len(),
            failures.len()
        );
        Ok(entries.len())
    }
}

async fn run_loop(inner: Arc<WorkerInner>, cancel: CancellationToken) {
    let mut consecutive_failures: u32 = 0;

    while !cancel.is_cancelled() {
        let delay = match inner.poll_once().await {
            Ok(claimed) => {
                consecutive_failures = 0;
                inner.current_backoff_ms.store(0, Ordering::Relaxed);
                if claimed == 0 {
                    inner.config.idle_poll_interval()
                } else {
                    inner.config.poll_interval()
                }
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                let sample: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
                let backoff = inner.config.backoff_delay(consecutive_failures, sample);
                inner
                    .current_backoff_ms
                    .store(backoff.as_millis() as u64, Ordering::Relaxed);
                error!(
                    "Outbox poll failed ({} in a row), backing off {:?}: {}",
                    consecutive_failures, backoff, e
                );
                backoff
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    inner.running.store(false, Ordering::SeqCst);
    debug!("Outbox worker {} loop exited", inner.config.worker_id);
}
