use serde::{Deserialize, Serialize};
use std::fmt;

use crate::operations::RequestId;

/// Position in the remote event stream. Strictly increasing, starts at 1.
pub type EventId = u64;

/// Remote experiment identifier
pub type ExperimentId = u64;

/// Why a trial stopped before the search method closed it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitedReason {
    Errored,
    UserCanceled,
    InvalidHp,
    InitInvalidHp,
}

/// Lifecycle state of the remote experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentState {
    Active,
    Paused,
    Completed,
    Canceled,
    Errored,
}

impl ExperimentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExperimentState::Completed | ExperimentState::Canceled | ExperimentState::Errored
        )
    }
}

/// Payload of a searcher event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    InitialOperations,
    TrialCreated {
        request_id: RequestId,
    },
    ValidationCompleted {
        request_id: RequestId,
        metric: f64,
        length: u64,
    },
    TrialProgress {
        request_id: RequestId,
        partial_units: f64,
    },
    TrialClosed {
        request_id: RequestId,
    },
    TrialExitedEarly {
        request_id: RequestId,
        reason: ExitedReason,
    },
    ExperimentInactive {
        state: ExperimentState,
    },
}

/// An immutable, ordered fact emitted by the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearcherEvent {
    pub id: EventId,
    pub kind: EventKind,
}

impl SearcherEvent {
    pub fn new(id: EventId, kind: EventKind) -> Self {
        Self { id, kind }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match &self.kind {
            EventKind::TrialCreated { request_id }
            | EventKind::ValidationCompleted { request_id, .. }
            | EventKind::TrialProgress { request_id, .. }
            | EventKind::TrialClosed { request_id }
            | EventKind::TrialExitedEarly { request_id, .. } => Some(*request_id),
            EventKind::InitialOperations | EventKind::ExperimentInactive { .. } => None,
        }
    }
}

impl fmt::Display for SearcherEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match &self.kind {
            EventKind::InitialOperations => "initial_operations",
            EventKind::TrialCreated { .. } => "trial_created",
            EventKind::ValidationCompleted { .. } => "validation_completed",
            EventKind::TrialProgress { .. } => "trial_progress",
            EventKind::TrialClosed { .. } => "trial_closed",
            EventKind::TrialExitedEarly { .. } => "trial_exited_early",
            EventKind::ExperimentInactive { .. } => "experiment_inactive",
        };
        write!(f, "#{} {}", self.id, name)
    }
}
