//! Fanout engine
//!
//! When an upstream entity changes, find every downstream entity whose
//! slices reference it (inverted index) and re-slice each one.
//!
//! Flow per call:
//! 1. validate, honour `enabled`, deduplicate within the window
//! 2. infer dependencies from the registered joins
//! 3. collect candidates per dependency (tombstones excluded, one per
//!    target)
//! 4. circuit breaker per dependency (SKIP / ERROR / ASYNC)
//! 5. batches of `batch_size`, `batch_delay` apart, bounded concurrency
//! 6. each candidate is re-sliced at its latest raw version, unless that
//!    version no longer references the upstream entity through the join
//! 7. per-candidate failures are recorded, never abort the batch

use crate::contract::ContractRegistry;
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::fanout::batching::plan_batches;
use crate::fanout::circuit_breaker::{BreakerDecision, CircuitBreaker};
use crate::fanout::config::{CircuitBreakerAction, FanoutConfig};
use crate::fanout::dedup::{DedupKey, DeduplicationCache};
use crate::fanout::dependency::{infer_dependencies, DependencyGraph, FanoutDependency};
use crate::fanout::job::{FanoutCandidate, FanoutJob, FanoutJobStatus};
use crate::fanout::queue::FanoutQueue;
use crate::slicing::{SliceExecutor, UpstreamChange};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use slicegraph_storage::domain::{entity_id_of, InvertedIndexRepository, RawDataRepository};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Index page size used while collecting candidates
const INDEX_PAGE_SIZE: usize = 1_000;

pub const DUPLICATE_MESSAGE: &str = "duplicate within deduplication window";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FanoutStatus {
    Success,
    PartialFailure,
    Skipped,
}

impl FanoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanoutStatus::Success => "SUCCESS",
            FanoutStatus::PartialFailure => "PARTIAL_FAILURE",
            FanoutStatus::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub entity_key: String,
    pub version: u64,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DependencyResult {
    /// `PRODUCT via product_by_brand`
    pub dependency: String,
    pub job: FanoutJob,
    pub batches: usize,
    /// Candidates whose latest version dropped the reference
    pub stale: usize,
    pub failures: Vec<CandidateFailure>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FanoutResult {
    pub status: FanoutStatus,
    pub total_affected: usize,
    /// Candidates handled without error (re-sliced or stale)
    pub processed_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    /// Of `processed_count`, candidates left alone because their latest
    /// version no longer references the upstream entity
    pub stale_count: usize,
    pub dependency_results: Vec<DependencyResult>,
    pub message: String,
}

impl FanoutResult {
    fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: FanoutStatus::Skipped,
            total_affected: 0,
            processed_count: 0,
            skipped_count: 0,
            failed_count: 0,
            stale_count: 0,
            dependency_results: Vec::new(),
            message: message.into(),
        }
    }
}

/// Cumulative counters; never reset implicitly
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanoutMetrics {
    pub total_calls: u64,
    pub success_calls: u64,
    pub failure_calls: u64,
    pub skipped_calls: u64,
    pub recomputations: u64,
    pub circuit_breaker_trips: u64,
    pub deduplicated: u64,
}

#[derive(Default)]
struct FanoutCounters {
    total_calls: AtomicU64,
    success_calls: AtomicU64,
    failure_calls: AtomicU64,
    skipped_calls: AtomicU64,
    recomputations: AtomicU64,
    circuit_breaker_trips: AtomicU64,
    deduplicated: AtomicU64,
}

impl FanoutCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn record_status(&self, status: FanoutStatus) {
        let counter = match status {
            FanoutStatus::Success => &self.success_calls,
            FanoutStatus::PartialFailure => &self.failure_calls,
            FanoutStatus::Skipped => &self.skipped_calls,
        };
        Self::bump(counter, 1);
    }

    fn snapshot(&self) -> FanoutMetrics {
        FanoutMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            success_calls: self.success_calls.load(Ordering::Relaxed),
            failure_calls: self.failure_calls.load(Ordering::Relaxed),
            skipped_calls: self.skipped_calls.load(Ordering::Relaxed),
            recomputations: self.recomputations.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
        }
    }
}

/// What happens to one dependency after the breaker
enum Disposition {
    Process,
    Skip,
    Defer,
}

struct Plan {
    dependency: FanoutDependency,
    config: FanoutConfig,
    candidates: Vec<FanoutCandidate>,
    disposition: Disposition,
}

#[derive(Default)]
struct BatchOutcome {
    /// Re-sliced candidates
    succeeded: usize,
    stale: usize,
    failures: Vec<CandidateFailure>,
    batches: usize,
}

impl BatchOutcome {
    fn handled(&self) -> usize {
        self.succeeded + self.stale
    }
}

/// What happened to one candidate
enum Recomputed {
    Resliced,
    /// Latest version no longer references the upstream entity
    Stale,
}

/// The upstream side of one fanout call
struct Upstream<'a> {
    tenant_id: &'a str,
    entity_type: &'a str,
    entity_key: &'a str,
    version: u64,
}

impl Upstream<'_> {
    /// Value the downstream join path must hold (`BR001`)
    fn id(&self) -> &str {
        entity_id_of(self.entity_key).unwrap_or(self.entity_key)
    }

    fn job(
        &self,
        dependency: &FanoutDependency,
        total_affected: usize,
        config: &FanoutConfig,
    ) -> FanoutJob {
        FanoutJob::new(
            self.tenant_id,
            self.entity_type,
            self.entity_key,
            self.version,
            &dependency.downstream_entity_type,
            &dependency.index_type,
            dependency.rule_set.clone(),
            total_affected,
            config.priority,
        )
    }
}

pub struct FanoutEngine {
    config: FanoutConfig,
    registry: Arc<dyn ContractRegistry>,
    index: Arc<dyn InvertedIndexRepository>,
    raw: Arc<dyn RawDataRepository>,
    executor: Arc<dyn SliceExecutor>,
    queue: Option<Arc<dyn FanoutQueue>>,
    dedup: DeduplicationCache,
    counters: FanoutCounters,
    /// Engine-wide in-flight slicing calls
    limiter: Semaphore,
}

impl FanoutEngine {
    pub fn new(
        config: FanoutConfig,
        registry: Arc<dyn ContractRegistry>,
        index: Arc<dyn InvertedIndexRepository>,
        raw: Arc<dyn RawDataRepository>,
        executor: Arc<dyn SliceExecutor>,
    ) -> Self {
        let permits = config.max_concurrent_fanouts.max(1);
        Self {
            config,
            registry,
            index,
            raw,
            executor,
            queue: None,
            dedup: DeduplicationCache::new(),
            counters: FanoutCounters::default(),
            limiter: Semaphore::new(permits),
        }
    }

    /// Queue receiving jobs deferred by an ASYNC breaker
    pub fn with_queue(mut self, queue: Arc<dyn FanoutQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    pub fn metrics(&self) -> FanoutMetrics {
        self.counters.snapshot()
    }

    pub fn clear_dedup_cache(&self) {
        self.dedup.clear();
    }

    pub async fn on_entity_change(
        &self,
        tenant_id: &str,
        upstream_entity_type: &str,
        upstream_entity_key: &str,
        upstream_version: u64,
        override_config: Option<&FanoutConfig>,
    ) -> Result<FanoutResult> {
        if tenant_id.trim().is_empty() {
            return Err(OrchestratorError::validation("tenant_id must not be blank"));
        }
        if upstream_entity_type.trim().is_empty() {
            return Err(OrchestratorError::validation("upstream entity type must not be blank"));
        }
        if upstream_entity_key.trim().is_empty() {
            return Err(OrchestratorError::validation("upstream entity key must not be blank"));
        }

        let config = override_config.unwrap_or(&self.config);
        FanoutCounters::bump(&self.counters.total_calls, 1);

        if !config.enabled {
            debug!("Fanout disabled, skipping {}", upstream_entity_key);
            self.counters.record_status(FanoutStatus::Skipped);
            return Ok(FanoutResult::skipped("fanout disabled"));
        }

        let dedup_key = DedupKey::new(tenant_id, upstream_entity_type, upstream_entity_key);
        if self
            .dedup
            .check_and_record(dedup_key.clone(), config.deduplication_window())
        {
            debug!("Fanout for {} deduplicated", upstream_entity_key);
            FanoutCounters::bump(&self.counters.deduplicated, 1);
            self.counters.record_status(FanoutStatus::Skipped);
            return Ok(FanoutResult::skipped(DUPLICATE_MESSAGE));
        }

        let upstream = Upstream {
            tenant_id,
            entity_type: upstream_entity_type,
            entity_key: upstream_entity_key,
            version: upstream_version,
        };
        let result = self.fan_out(&upstream, override_config, config).await;

        match &result {
            Ok(r) => {
                self.counters.record_status(r.status);
                FanoutCounters::bump(
                    &self.counters.recomputations,
                    (r.processed_count - r.stale_count) as u64,
                );
            }
            Err(e) => {
                // A failed call must not suppress its retry
                debug!("Fanout for {} failed, releasing dedup key: {}", upstream_entity_key, e);
                self.dedup.forget(&dedup_key);
                FanoutCounters::bump(&self.counters.failure_calls, 1);
            }
        }
        result
    }

    async fn fan_out(
        &self,
        upstream: &Upstream<'_>,
        override_config: Option<&FanoutConfig>,
        config: &FanoutConfig,
    ) -> Result<FanoutResult> {
        let rule_sets = self.registry.rule_sets().await?;
        if DependencyGraph::from_rule_sets(&rule_sets).is_on_cycle(upstream.entity_type) {
            warn!(
                "Entity type {} is on a dependency cycle; cascades rely on idempotent skips to stop",
                upstream.entity_type
            );
        }

        let dependencies = infer_dependencies(&rule_sets, upstream.entity_type);
        if dependencies.is_empty() {
            return Ok(FanoutResult {
                status: FanoutStatus::Success,
                message: format!("no dependents of {}", upstream.entity_type),
                ..FanoutResult::skipped("")
            });
        }

        // Candidates and breaker verdicts for every dependency first, so an
        // ERROR verdict recomputes nothing at all.
        let mut plans = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            let dep_config = override_config
                .or(dependency.config.as_ref())
                .unwrap_or(config)
                .clone();
            let candidates = self
                .collect_candidates(upstream.tenant_id, &dependency.index_type, upstream.id())
                .await?;

            let breaker = CircuitBreaker::from_config(&dep_config);
            let disposition = match breaker.evaluate(candidates.len()) {
                BreakerDecision::Proceed => Disposition::Process,
                BreakerDecision::Tripped(action) => {
                    FanoutCounters::bump(&self.counters.circuit_breaker_trips, 1);
                    warn!(
                        "Circuit breaker tripped for {} ({}): {} candidates > {} ({})",
                        upstream.entity_key,
                        dependency.label(),
                        candidates.len(),
                        breaker.max_fanout,
                        action
                    );
                    match action {
                        CircuitBreakerAction::Skip => Disposition::Skip,
                        CircuitBreakerAction::Async if self.queue.is_some() => Disposition::Defer,
                        CircuitBreakerAction::Async => {
                            warn!("No fanout queue configured, skipping deferred job");
                            Disposition::Skip
                        }
                        CircuitBreakerAction::Error => {
                            let mut job = upstream.job(&dependency, candidates.len(), &dep_config);
                            job.status = FanoutJobStatus::Failed;
                            return Err(OrchestratorError::FanoutLimitExceeded {
                                candidates: candidates.len(),
                                max_fanout: breaker.max_fanout,
                                job: Box::new(job),
                            });
                        }
                    }
                }
            };
            plans.push(Plan {
                dependency,
                config: dep_config,
                candidates,
                disposition,
            });
        }

        let deadline = Instant::now() + config.timeout();
        let mut results = Vec::with_capacity(plans.len());
        let (mut total, mut processed, mut skipped, mut failed, mut stale) = (0, 0, 0, 0, 0);

        for plan in plans {
            let count = plan.candidates.len();
            total += count;
            let mut job = upstream.job(&plan.dependency, count, &plan.config);

            let (outcome, message) = match plan.disposition {
                Disposition::Skip => {
                    job.status = FanoutJobStatus::Skipped;
                    skipped += count;
                    (BatchOutcome::default(), Some("circuit breaker tripped".to_string()))
                }
                Disposition::Defer => {
                    job.status = FanoutJobStatus::AsyncQueued;
                    skipped += count;
                    if let Some(queue) = &self.queue {
                        queue.enqueue(job.clone()).await?;
                    }
                    (BatchOutcome::default(), Some("deferred to async queue".to_string()))
                }
                Disposition::Process => {
                    job.status = FanoutJobStatus::InProgress;
                    let outcome = self
                        .process_candidates(
                            upstream,
                            &plan.dependency,
                            plan.candidates,
                            &plan.config,
                            deadline,
                        )
                        .await;
                    job.processed_count = outcome.handled();
                    job.status = if outcome.failures.is_empty() {
                        FanoutJobStatus::Completed
                    } else {
                        FanoutJobStatus::Failed
                    };
                    processed += outcome.handled();
                    stale += outcome.stale;
                    failed += outcome.failures.len();
                    (outcome, None)
                }
            };

            results.push(DependencyResult {
                dependency: plan.dependency.label(),
                job,
                batches: outcome.batches,
                stale: outcome.stale,
                failures: outcome.failures,
                message,
            });
        }

        let status = if failed > 0 {
            FanoutStatus::PartialFailure
        } else if processed == 0 && skipped > 0 {
            FanoutStatus::Skipped
        } else {
            FanoutStatus::Success
        };
        let message = format!(
            "{}: {} affected, {} processed ({} stale), {} skipped, {} failed",
            upstream.entity_key, total, processed, stale, skipped, failed
        );
        info!("Fanout {} ({})", message, status.as_str());

        Ok(FanoutResult {
            status,
            total_affected: total,
            processed_count: processed,
            skipped_count: skipped,
            failed_count: failed,
            stale_count: stale,
            dependency_results: results,
            message,
        })
    }

    /// Run a job deferred by an ASYNC breaker; the breaker is not applied
    ///
    /// The dependency is resolved again from the active rule sets, so a
    /// job queued before a rule set upgrade runs with the new one.
    pub async fn process_queued(&self, mut job: FanoutJob) -> Result<FanoutJob> {
        let rule_sets = self.registry.rule_sets().await?;
        let active = infer_dependencies(&rule_sets, &job.upstream_entity_type)
            .into_iter()
            .find(|d| {
                d.downstream_entity_type == job.downstream_entity_type
                    && d.index_type == job.index_type
            });
        let Some(dependency) = active else {
            warn!(
                "Queued fanout job {}: no active join {} via {}",
                job.id, job.downstream_entity_type, job.index_type
            );
            job.status = FanoutJobStatus::Failed;
            return Ok(job);
        };

        let upstream = Upstream {
            tenant_id: &job.tenant_id,
            entity_type: &job.upstream_entity_type,
            entity_key: &job.upstream_entity_key,
            version: job.upstream_version,
        };
        let candidates = self
            .collect_candidates(upstream.tenant_id, &dependency.index_type, upstream.id())
            .await?;
        let total_affected = candidates.len();

        let deadline = Instant::now() + self.config.timeout();
        let outcome = self
            .process_candidates(&upstream, &dependency, candidates, &self.config, deadline)
            .await;

        FanoutCounters::bump(&self.counters.recomputations, outcome.succeeded as u64);
        job.rule_set = dependency.rule_set.clone();
        job.total_affected = total_affected;
        job.processed_count = outcome.handled();
        job.status = if outcome.failures.is_empty() {
            FanoutJobStatus::Completed
        } else {
            FanoutJobStatus::Failed
        };
        info!(
            "Queued fanout job {} finished: {}/{} ({})",
            job.id, job.processed_count, job.total_affected, job.status
        );
        Ok(job)
    }

    /// Live index hits for `index_value`, one per target at its highest
    /// indexed version, ordered by target key
    async fn collect_candidates(
        &self,
        tenant_id: &str,
        index_type: &str,
        index_value: &str,
    ) -> Result<Vec<FanoutCandidate>> {
        let mut latest: BTreeMap<String, u64> = BTreeMap::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .index
                .query_by_index_type(
                    tenant_id,
                    index_type,
                    index_value,
                    INDEX_PAGE_SIZE,
                    cursor.as_deref(),
                )
                .await?;
            for entry in page.entries.into_iter().filter(|e| !e.tombstone) {
                let version = latest.entry(entry.target_entity_key).or_insert(0);
                *version = (*version).max(entry.target_version);
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(latest
            .into_iter()
            .map(|(entity_key, version)| FanoutCandidate {
                entity_key,
                version,
            })
            .collect())
    }

    async fn process_candidates(
        &self,
        upstream: &Upstream<'_>,
        dependency: &FanoutDependency,
        candidates: Vec<FanoutCandidate>,
        config: &FanoutConfig,
        deadline: Instant,
    ) -> BatchOutcome {
        let batches = plan_batches(&candidates, config.batch_size);
        let mut outcome = BatchOutcome {
            batches: batches.len(),
            ..BatchOutcome::default()
        };
        let change = UpstreamChange {
            entity_key: upstream.entity_key.to_string(),
            version: upstream.version,
            affected_slice_types: dependency.affected_slice_types.clone(),
        };

        for (i, batch) in batches.iter().enumerate() {
            if i > 0 && !config.batch_delay().is_zero() {
                tokio::time::sleep(config.batch_delay()).await;
            }
            if Instant::now() >= deadline {
                let remaining: Vec<&FanoutCandidate> = batches[i..].iter().flatten().collect();
                warn!(
                    "Fanout deadline passed, {} candidates not started",
                    remaining.len()
                );
                outcome.failures.extend(remaining.into_iter().map(|c| CandidateFailure {
                    entity_key: c.entity_key.clone(),
                    version: c.version,
                    error: "fanout timed out before start".to_string(),
                }));
                break;
            }

            let work: Vec<_> = batch
                .iter()
                .map(|candidate| {
                    self.recompute(upstream, dependency, &change, candidate, config, deadline)
                })
                .collect();
            let results: Vec<Result<Recomputed>> = stream::iter(work)
                .buffered(config.max_concurrent_fanouts.max(1))
                .collect()
                .await;

            for (candidate, result) in batch.iter().zip(results) {
                match result {
                    Ok(Recomputed::Resliced) => outcome.succeeded += 1,
                    Ok(Recomputed::Stale) => outcome.stale += 1,
                    Err(e) => {
                        debug!("Fanout recompute of {} failed: {}", candidate.entity_key, e);
                        outcome.failures.push(CandidateFailure {
                            entity_key: candidate.entity_key.clone(),
                            version: candidate.version,
                            error: e.to_string(),
                        });
                    }
                }
            }
            debug!(
                "Fanout batch {}/{} done ({} ok so far)",
                i + 1,
                batches.len(),
                outcome.handled()
            );
        }
        outcome
    }

    /// Re-slice one candidate, bounded by the call deadline
    async fn recompute(
        &self,
        upstream: &Upstream<'_>,
        dependency: &FanoutDependency,
        change: &UpstreamChange,
        candidate: &FanoutCandidate,
        config: &FanoutConfig,
        deadline: Instant,
    ) -> Result<Recomputed> {
        let work = self.recompute_with_retry(upstream, dependency, change, candidate, config);
        match tokio::time::timeout_at(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Timeout(format!(
                "fanout deadline passed while re-slicing {}",
                candidate.entity_key
            ))),
        }
    }

    /// Latest raw version of the candidate, if it still references the
    /// upstream entity through the dependency's join path
    async fn resolve_version(
        &self,
        upstream: &Upstream<'_>,
        dependency: &FanoutDependency,
        candidate: &FanoutCandidate,
    ) -> Result<Option<u64>> {
        let tenant_id = upstream.tenant_id;
        let Some(latest) = self.raw.latest_version(tenant_id, &candidate.entity_key).await? else {
            return Err(OrchestratorError::NotFound(format!(
                "raw data of fanout candidate {}",
                candidate.entity_key
            )));
        };
        let record = self
            .raw
            .get(tenant_id, &candidate.entity_key, latest)
            .await?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "raw record {} v{}",
                    candidate.entity_key, latest
                ))
            })?;

        if !dependency.references(&record.payload, upstream.id()) {
            debug!(
                "{} v{} no longer references {} at {}",
                candidate.entity_key, latest, upstream.entity_key, dependency.join_path
            );
            return Ok(None);
        }
        Ok(Some(latest))
    }

    /// Transient errors are retried up to `retry.max_attempts`
    async fn recompute_with_retry(
        &self,
        upstream: &Upstream<'_>,
        dependency: &FanoutDependency,
        change: &UpstreamChange,
        candidate: &FanoutCandidate,
        config: &FanoutConfig,
    ) -> Result<Recomputed> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|e| OrchestratorError::Other(e.into()))?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = match self.resolve_version(upstream, dependency, candidate).await {
                Ok(Some(version)) => self
                    .executor
                    .execute_for_upstream(
                        upstream.tenant_id,
                        &candidate.entity_key,
                        version,
                        Some(&dependency.rule_set),
                        change,
                    )
                    .await
                    .map(|_| Recomputed::Resliced),
                Ok(None) => Ok(Recomputed::Stale),
                Err(e) => Err(e),
            };
            match outcome {
                Err(e)
                    if e.category() == ErrorCategory::Transient
                        && attempt < config.retry.max_attempts =>
                {
                    debug!(
                        "Retrying {} after attempt {}: {}",
                        candidate.entity_key, attempt, e
                    );
                    tokio::time::sleep(config.retry.delay_for(attempt)).await;
                }
                other => return other,
            }
        }
    }
}
