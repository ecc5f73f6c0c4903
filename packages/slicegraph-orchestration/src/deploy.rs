//! Deploy lifecycle state machine
//!
//! One instance per ingestion-to-ship job:
//!
//! ```text
//! QUEUED ──StartRunning──▶ RUNNING ──CompileComplete──▶ READY ──StartSinking──▶ SINKING ──Complete──▶ DONE
//!    │                        │                           │                        │
//!    └────────────────────────┴────────── Failed ─────────┴────────────────────────┴──▶ FAILED
//! ```
//!
//! `transition` is pure; `DeployTracker` keeps the current state per job.

use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployState {
    Queued,
    Running,
    Ready,
    Sinking,
    Done,
    Failed,
}

impl DeployState {
    pub const ALL: [DeployState; 6] = [
        DeployState::Queued,
        DeployState::Running,
        DeployState::Ready,
        DeployState::Sinking,
        DeployState::Done,
        DeployState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployState::Queued => "QUEUED",
            DeployState::Running => "RUNNING",
            DeployState::Ready => "READY",
            DeployState::Sinking => "SINKING",
            DeployState::Done => "DONE",
            DeployState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployState::Done | DeployState::Failed)
    }
}

impl std::fmt::Display for DeployState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeployEvent {
    StartRunning,
    CompileComplete,
    StartSinking,
    Complete,
    Failed,
}

impl DeployEvent {
    pub const ALL: [DeployEvent; 5] = [
        DeployEvent::StartRunning,
        DeployEvent::CompileComplete,
        DeployEvent::StartSinking,
        DeployEvent::Complete,
        DeployEvent::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployEvent::StartRunning => "StartRunning",
            DeployEvent::CompileComplete => "CompileComplete",
            DeployEvent::StartSinking => "StartSinking",
            DeployEvent::Complete => "Complete",
            DeployEvent::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for DeployEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rejected (state, event) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub state: DeployState,
    pub event: DeployEvent,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} does not accept {}", self.state, self.event)
    }
}

impl std::error::Error for InvalidTransition {}

impl From<InvalidTransition> for OrchestratorError {
    fn from(err: InvalidTransition) -> Self {
        OrchestratorError::InvalidTransition {
            state: err.state.to_string(),
            event: err.event.to_string(),
        }
    }
}

/// Pure transition function (no hidden state)
pub fn transition(
    state: DeployState,
    event: DeployEvent,
) -> std::result::Result<DeployState, InvalidTransition> {
    use DeployEvent as E;
    use DeployState as S;

    match (state, event) {
        (S::Queued, E::StartRunning) => Ok(S::Running),
        (S::Running, E::CompileComplete) => Ok(S::Ready),
        (S::Ready, E::StartSinking) => Ok(S::Sinking),
        (S::Sinking, E::Complete) => Ok(S::Done),
        (S::Queued | S::Running | S::Ready | S::Sinking, E::Failed) => Ok(S::Failed),
        _ => Err(InvalidTransition { state, event }),
    }
}

/// Snapshot of one tracked job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRecord {
    pub job_id: Uuid,
    pub state: DeployState,
    pub updated_at: DateTime<Utc>,
    pub failure: Option<String>,
}

/// Current deploy state per job
#[derive(Default)]
pub struct DeployTracker {
    jobs: DashMap<Uuid, DeployRecord>,
}

impl DeployTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job in QUEUED
    pub fn enqueue(&self) -> Uuid {
        let job_id = Uuid::new_v4();
        self.jobs.insert(
            job_id,
            DeployRecord {
                job_id,
                state: DeployState::Queued,
                updated_at: Utc::now(),
                failure: None,
            },
        );
        job_id
    }

    /// Apply `event` to a tracked job
    pub fn apply(&self, job_id: Uuid, event: DeployEvent) -> Result<DeployState> {
        let mut record = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("deploy job {}", job_id)))?;

        let next = transition(record.state, event)?;
        debug!("Deploy job {}: {} --{}--> {}", job_id, record.state, event, next);
        record.state = next;
        record.updated_at = Utc::now();
        Ok(next)
    }

    /// Apply `Failed` and record the reason
    pub fn fail(&self, job_id: Uuid, reason: impl Into<String>) -> Result<DeployState> {
        let state = self.apply(job_id, DeployEvent::Failed)?;
        if let Some(mut record) = self.jobs.get_mut(&job_id) {
            record.failure = Some(reason.into());
        }
        Ok(state)
    }

    pub fn get(&self, job_id: Uuid) -> Option<DeployRecord> {
        self.jobs.get(&job_id).map(|r| r.clone())
    }

    pub fn list_all(&self) -> Vec<DeployRecord> {
        self.jobs.iter().map(|r| r.value().clone()).collect()
    }

    pub fn clear(&self) {
        self.jobs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = DeployState::Queued;
        for event in [
            DeployEvent::StartRunning,
            DeployEvent::CompileComplete,
            DeployEvent::StartSinking,
            DeployEvent::Complete,
        ] {
            state = transition(state, event).unwrap();
        }
        assert_eq!(state, DeployState::Done);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_all_thirty_combinations() {
        let valid = [
            (DeployState::Queued, DeployEvent::StartRunning, DeployState::Running),
            (DeployState::Running, DeployEvent::CompileComplete, DeployState::Ready),
            (DeployState::Ready, DeployEvent::StartSinking, DeployState::Sinking),
            (DeployState::Sinking, DeployEvent::Complete, DeployState::Done),
            (DeployState::Queued, DeployEvent::Failed, DeployState::Failed),
            (DeployState::Running, DeployEvent::Failed, DeployState::Failed),
            (DeployState::Ready, DeployEvent::Failed, DeployState::Failed),
            (DeployState::Sinking, DeployEvent::Failed, DeployState::Failed),
        ];

        let mut successes = 0;
        for state in DeployState::ALL {
            for event in DeployEvent::ALL {
                let expected = valid
                    .iter()
                    .find(|(s, e, _)| *s == state && *e == event)
                    .map(|(_, _, to)| *to);
                match (transition(state, event), expected) {
                    (Ok(next), Some(to)) => {
                        assert_eq!(next, to);
                        successes += 1;
                    }
                    (Err(err), None) => {
                        assert_eq!(err.state, state);
                        assert_eq!(err.event, event);
                    }
                    (got, want) => panic!("{:?} + {:?}: got {:?}, want {:?}", state, event, got, want),
                }
            }
        }
        assert_eq!(successes, 8);
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for state in [DeployState::Done, DeployState::Failed] {
            for event in DeployEvent::ALL {
                assert!(transition(state, event).is_err());
            }
        }
    }

    #[test]
    fn test_invalid_transition_converts_to_orchestrator_error() {
        let err: OrchestratorError = transition(DeployState::Done, DeployEvent::Failed)
            .unwrap_err()
            .into();
        match err {
            OrchestratorError::InvalidTransition { state, event } => {
                assert_eq!(state, "DONE");
                assert_eq!(event, "Failed");
            }
            other => panic!("Expected InvalidTransition, got {:?}", other),
        }
    }

    #[test]
    fn test_tracker_lifecycle() {
        let tracker = DeployTracker::new();
        let job = tracker.enqueue();

        tracker.apply(job, DeployEvent::StartRunning).unwrap();
        tracker.fail(job, "compile blew up").unwrap();

        let record = tracker.get(job).unwrap();
        assert_eq!(record.state, DeployState::Failed);
        assert_eq!(record.failure.as_deref(), Some("compile blew up"));

        // FAILED is terminal
        assert!(tracker.apply(job, DeployEvent::StartRunning).is_err());
        assert!(tracker.apply(Uuid::new_v4(), DeployEvent::StartRunning).is_err());
        assert_eq!(tracker.list_all().len(), 1);
    }
}
