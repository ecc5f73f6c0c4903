//! Ship-request windowing
//!
//! Requests for the same sink are coalesced for `window_ms`; within a
//! window each (tenant, entity) keeps only its highest version. A window
//! flushes when its timer fires or when it reaches `max_batch_size`,
//! whichever comes first.

use crate::contract::{RuleSetRef, ViewRef};
use crate::error::{ErrorCategory, OrchestratorError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowConfig {
    pub window_ms: u64,
    pub max_batch_size: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_ms: 500,
            max_batch_size: 100,
        }
    }
}

impl WindowConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipRequest {
    pub sink_id: String,
    pub tenant_id: String,
    pub entity_key: String,
    pub version: u64,
    pub view: Option<ViewRef>,
    /// Rule set whose joins are assembled; the entity type's default if absent
    pub rule_set: Option<RuleSetRef>,
}

/// Receives one coalesced batch per flush
#[async_trait]
pub trait WindowFlushTarget: Send + Sync {
    async fn flush(&self, sink_id: &str, requests: Vec<ShipRequest>) -> Result<()>;
}

struct PendingWindow {
    generation: u64,
    items: BTreeMap<(String, String), ShipRequest>,
}

pub struct ShipWindow {
    config: WindowConfig,
    target: Arc<dyn WindowFlushTarget>,
    windows: Mutex<HashMap<String, PendingWindow>>,
    next_generation: AtomicU64,
    cancel: CancellationToken,
}

impl ShipWindow {
    pub fn new(config: WindowConfig, target: Arc<dyn WindowFlushTarget>) -> Arc<Self> {
        Arc::new(Self {
            config,
            target,
            windows: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Add a request; flushes inline when the window fills up
    ///
    /// A failed inline flush is not reported here: its requests are
    /// requeued (transient failures) or dropped with a warning.
    pub async fn submit(self: &Arc<Self>, request: ShipRequest) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::validation("ship window is shut down"));
        }

        let sink_id = request.sink_id.clone();
        let (full, new_generation) = {
            let mut windows = self.windows.lock();
            let (window, created) = self.window_for(&mut windows, &sink_id);
            Self::merge(&sink_id, window, request);

            if window.items.len() >= self.config.max_batch_size.max(1) {
                (windows.remove(&sink_id), None)
            } else {
                (None, created)
            }
        };

        if let Some(generation) = new_generation {
            self.spawn_timer(sink_id.clone(), generation);
        }
        if let Some(window) = full {
            if let Err(e) = self.deliver(&sink_id, window).await {
                warn!("Inline flush to sink {} failed: {}", sink_id, e);
            }
        }
        Ok(())
    }

    /// Pending window of `sink_id`, opened if needed; the generation is
    /// returned when a window was opened
    fn window_for<'a>(
        &self,
        windows: &'a mut HashMap<String, PendingWindow>,
        sink_id: &str,
    ) -> (&'a mut PendingWindow, Option<u64>) {
        let mut created = None;
        let window = windows.entry(sink_id.to_string()).or_insert_with(|| {
            let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
            created = Some(generation);
            PendingWindow {
                generation,
                items: BTreeMap::new(),
            }
        });
        (window, created)
    }

    /// Latest version per (tenant, entity) wins
    fn merge(sink_id: &str, window: &mut PendingWindow, request: ShipRequest) {
        let key = (request.tenant_id.clone(), request.entity_key.clone());
        let superseded = window
            .items
            .get(&key)
            .map(|existing| existing.version >= request.version)
            .unwrap_or(false);
        if superseded {
            debug!(
                "Window {}: dropping v{} of {}, newer version pending",
                sink_id, request.version, request.entity_key
            );
        } else {
            window.items.insert(key, request);
        }
    }

    /// Put the requests of a failed flush back; a new window gets a timer
    /// unless the window is shut down
    fn requeue(self: &Arc<Self>, sink_id: &str, requests: Vec<ShipRequest>) {
        let created = {
            let mut windows = self.windows.lock();
            let (window, created) = self.window_for(&mut windows, sink_id);
            for request in requests {
                Self::merge(sink_id, window, request);
            }
            created
        };
        if let Some(generation) = created {
            if !self.cancel.is_cancelled() {
                self.spawn_timer(sink_id.to_string(), generation);
            }
        }
    }

    fn spawn_timer(self: &Arc<Self>, sink_id: String, generation: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                _ = tokio::time::sleep(this.config.window()) => {
                    if let Err(e) = this.flush_generation(&sink_id, generation).await {
                        warn!("Window flush for sink {} failed: {}", sink_id, e);
                    }
                }
            }
        });
    }

    async fn flush_generation(self: &Arc<Self>, sink_id: &str, generation: u64) -> Result<()> {
        let window = {
            let mut windows = self.windows.lock();
            match windows.get(sink_id) {
                Some(w) if w.generation == generation => windows.remove(sink_id),
                _ => None,
            }
        };
        match window {
            Some(w) => self.deliver(sink_id, w).await,
            None => Ok(()),
        }
    }

    /// Flush one window; on a transient failure its requests are requeued
    async fn deliver(self: &Arc<Self>, sink_id: &str, window: PendingWindow) -> Result<()> {
        let requests: Vec<ShipRequest> = window.items.into_values().collect();
        info!("Flushing {} ship requests to sink {}", requests.len(), sink_id);
        match self.target.flush(sink_id, requests.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if e.category() == ErrorCategory::Transient => {
                warn!(
                    "Requeueing {} ship requests for sink {}: {}",
                    requests.len(),
                    sink_id,
                    e
                );
                self.requeue(sink_id, requests);
                Err(e)
            }
            Err(e) => {
                warn!(
                    "Dropping {} ship requests for sink {}: {}",
                    requests.len(),
                    sink_id,
                    e
                );
                Err(e)
            }
        }
    }

    /// Flush every pending window now; returns the number of requests sent
    ///
    /// On error, transiently failed requests stay pending for the next call.
    pub async fn flush_all(self: &Arc<Self>) -> Result<usize> {
        let drained: Vec<(String, PendingWindow)> = self.windows.lock().drain().collect();

        let mut sent = 0;
        let mut first_error = None;
        for (sink_id, window) in drained {
            let count = window.items.len();
            match self.deliver(&sink_id, window).await {
                Ok(()) => sent += count,
                Err(e) => {
                    warn!("Flush to sink {} failed: {}", sink_id, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(sent),
        }
    }

    /// Cancel timers and flush what is pending
    pub async fn shutdown(self: &Arc<Self>) -> Result<usize> {
        self.cancel.cancel();
        self.flush_all().await
    }

    pub fn pending_count(&self) -> usize {
        self.windows.lock().values().map(|w| w.items.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectingTarget {
        batches: Mutex<Vec<(String, Vec<ShipRequest>)>>,
    }

    #[async_trait]
    impl WindowFlushTarget for CollectingTarget {
        async fn flush(&self, sink_id: &str, requests: Vec<ShipRequest>) -> Result<()> {
            self.batches.lock().push((sink_id.to_string(), requests));
            Ok(())
        }
    }

    /// Fails the first `failures` flushes with `error`
    struct FlakyTarget {
        inner: CollectingTarget,
        failures: Mutex<u32>,
        error: fn() -> OrchestratorError,
    }

    impl FlakyTarget {
        fn new(failures: u32, error: fn() -> OrchestratorError) -> Self {
            Self {
                inner: CollectingTarget::default(),
                failures: Mutex::new(failures),
                error,
            }
        }

        fn transient(failures: u32) -> Self {
            Self::new(failures, || OrchestratorError::Timeout("sink timed out".to_string()))
        }
    }

    #[async_trait]
    impl WindowFlushTarget for FlakyTarget {
        async fn flush(&self, sink_id: &str, requests: Vec<ShipRequest>) -> Result<()> {
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err((self.error)());
                }
            }
            self.inner.flush(sink_id, requests).await
        }
    }

    fn request(sink: &str, entity: &str, version: u64) -> ShipRequest {
        ShipRequest {
            sink_id: sink.to_string(),
            tenant_id: "t1".to_string(),
            entity_key: entity.to_string(),
            version,
            view: None,
            rule_set: None,
        }
    }

    fn config(window_ms: u64, max_batch_size: usize) -> WindowConfig {
        WindowConfig {
            window_ms,
            max_batch_size,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_version_wins_and_timer_flushes() {
        let target = Arc::new(CollectingTarget::default());
        let window = ShipWindow::new(config(100, 10), target.clone());

        window.submit(request("search", "PRODUCT#t1#p1", 2)).await.unwrap();
        window.submit(request("search", "PRODUCT#t1#p1", 1)).await.unwrap();
        window.submit(request("search", "PRODUCT#t1#p1", 3)).await.unwrap();
        window.submit(request("search", "PRODUCT#t1#p2", 1)).await.unwrap();
        assert_eq!(window.pending_count(), 2);
        assert!(target.batches.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;

        let batches = target.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        let versions: Vec<(String, u64)> = batches[0]
            .1
            .iter()
            .map(|r| (r.entity_key.clone(), r.version))
            .collect();
        assert_eq!(
            versions,
            vec![("PRODUCT#t1#p1".to_string(), 3), ("PRODUCT#t1#p2".to_string(), 1)]
        );
        assert_eq!(window.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_batch_size_flushes_early() {
        let target = Arc::new(CollectingTarget::default());
        let window = ShipWindow::new(config(10_000, 2), target.clone());

        window.submit(request("search", "PRODUCT#t1#p1", 1)).await.unwrap();
        window.submit(request("search", "PRODUCT#t1#p2", 1)).await.unwrap();
        assert_eq!(target.batches.lock().len(), 1);

        // The stale timer of the flushed window must not flush the next one
        window.submit(request("search", "PRODUCT#t1#p3", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10_001)).await;
        let batches = target.batches.lock().clone();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].1.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sinks_are_windowed_separately_and_flush_all() {
        let target = Arc::new(CollectingTarget::default());
        let window = ShipWindow::new(config(10_000, 10), target.clone());

        window.submit(request("search", "PRODUCT#t1#p1", 1)).await.unwrap();
        window.submit(request("feed", "PRODUCT#t1#p1", 1)).await.unwrap();

        assert_eq!(window.flush_all().await.unwrap(), 2);
        let mut sinks: Vec<String> = target.batches.lock().iter().map(|(s, _)| s.clone()).collect();
        sinks.sort();
        assert_eq!(sinks, vec!["feed", "search"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_and_rejects_new_requests() {
        let target = Arc::new(CollectingTarget::default());
        let window = ShipWindow::new(config(10_000, 10), target.clone());

        window.submit(request("search", "PRODUCT#t1#p1", 1)).await.unwrap();
        assert_eq!(window.shutdown().await.unwrap(), 1);
        assert!(window.submit(request("search", "PRODUCT#t1#p2", 1)).await.is_err());

        tokio::time::sleep(Duration::from_millis(20_000)).await;
        assert_eq!(target.batches.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_timer_flush_is_retried_next_window() {
        let target = Arc::new(FlakyTarget::transient(1));
        let window = ShipWindow::new(config(100, 10), target.clone());

        window.submit(request("search", "PRODUCT#t1#p1", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(target.inner.batches.lock().is_empty());
        assert_eq!(window.pending_count(), 1);

        // A newer version submitted meanwhile replaces the requeued one
        window.submit(request("search", "PRODUCT#t1#p1", 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let batches = target.inner.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 1);
        assert_eq!(batches[0].1[0].version, 2);
        assert_eq!(window.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_all_keeps_requests_pending() {
        let target = Arc::new(FlakyTarget::transient(1));
        let window = ShipWindow::new(config(10_000, 10), target.clone());

        window.submit(request("search", "PRODUCT#t1#p1", 1)).await.unwrap();
        assert!(window.flush_all().await.is_err());
        assert_eq!(window.pending_count(), 1);

        assert_eq!(window.flush_all().await.unwrap(), 1);
        assert_eq!(target.inner.batches.lock().len(), 1);
        assert_eq!(window.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_inline_flush_is_requeued() {
        let target = Arc::new(FlakyTarget::transient(1));
        let window = ShipWindow::new(config(100, 2), target.clone());

        window.submit(request("search", "PRODUCT#t1#p1", 1)).await.unwrap();
        window.submit(request("search", "PRODUCT#t1#p2", 1)).await.unwrap();
        assert_eq!(window.pending_count(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let batches = target.inner.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_flush_failure_drops_requests() {
        let target = Arc::new(FlakyTarget::new(1, || {
            OrchestratorError::NotFound("sink search".to_string())
        }));
        let window = ShipWindow::new(config(10_000, 10), target.clone());

        window.submit(request("search", "PRODUCT#t1#p1", 1)).await.unwrap();
        assert!(window.flush_all().await.is_err());
        assert_eq!(window.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_failure_keeps_requests_for_a_later_flush() {
        let target = Arc::new(FlakyTarget::transient(1));
        let window = ShipWindow::new(config(100, 10), target.clone());

        window.submit(request("search", "PRODUCT#t1#p1", 1)).await.unwrap();
        assert!(window.shutdown().await.is_err());
        assert_eq!(window.pending_count(), 1);

        // No timer after shutdown
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(target.inner.batches.lock().is_empty());

        assert_eq!(window.flush_all().await.unwrap(), 1);
        assert_eq!(target.inner.batches.lock().len(), 1);
    }
}
