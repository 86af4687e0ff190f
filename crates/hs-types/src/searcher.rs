use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::errors::{HsError, HsResult};
use crate::events::{EventId, ExperimentId};
use crate::operations::RequestId;

/// Schema version of the persisted searcher state
pub const SEARCHER_STATE_VERSION: u32 = 1;

/// Progress record owned by the runner. Mutated only at commit points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearcherState {
    pub experiment_id: ExperimentId,
    /// Resumption cursor. Never moves backwards.
    pub last_event_id: EventId,
    pub trials_created: BTreeSet<RequestId>,
    /// Always a subset of `trials_created`.
    pub trials_closed: BTreeSet<RequestId>,
    /// Trials that exited early. Also counted in `trials_closed`.
    pub failures: BTreeSet<RequestId>,
    /// Latest reported partial units per trial.
    pub trial_progress: BTreeMap<RequestId, f64>,
    pub initial_operations_submitted: bool,
    pub experiment_completed: bool,
}

impl SearcherState {
    pub fn new(experiment_id: ExperimentId) -> Self {
        Self {
            experiment_id,
            last_event_id: 0,
            trials_created: BTreeSet::new(),
            trials_closed: BTreeSet::new(),
            failures: BTreeSet::new(),
            trial_progress: BTreeMap::new(),
            initial_operations_submitted: false,
            experiment_completed: false,
        }
    }

    /// Trials created and not yet closed.
    pub fn open_trials(&self) -> usize {
        self.trials_created.len() - self.trials_closed.len()
    }

    pub fn record_created(&mut self, request_id: RequestId) {
        self.trials_created.insert(request_id);
    }

    pub fn record_closed(&mut self, request_id: RequestId) {
        // A trial can fail before its creation is reported.
        self.trials_created.insert(request_id);
        self.trials_closed.insert(request_id);
        self.trial_progress.remove(&request_id);
    }

    pub fn record_failure(&mut self, request_id: RequestId) {
        self.failures.insert(request_id);
        self.record_closed(request_id);
    }

    pub fn record_progress(&mut self, request_id: RequestId, partial_units: f64) {
        if !self.trials_closed.contains(&request_id) {
            self.trial_progress.insert(request_id, partial_units);
        }
    }

    /// Move the cursor to `event_id`. Fails if that would move it backwards.
    pub fn advance_cursor(&mut self, event_id: EventId) -> HsResult<()> {
        if event_id < self.last_event_id {
            return Err(crate::internal_error!(
                "cursor regression: event {event_id} is behind committed event {}",
                self.last_event_id
            ));
        }
        self.last_event_id = event_id;
        Ok(())
    }
}

/// Versioned on-disk form of [`SearcherState`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSearcherState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    /// Name of the search method that wrote the paired method state.
    pub method: String,
    pub state: SearcherState,
}

impl PersistedSearcherState {
    pub fn new(method: impl Into<String>, state: SearcherState) -> Self {
        Self {
            version: SEARCHER_STATE_VERSION,
            saved_at: Utc::now(),
            method: method.into(),
            state,
        }
    }

    pub fn to_json_bytes(&self) -> HsResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decode and reject any schema version this build does not understand.
    pub fn from_json_bytes(bytes: &[u8]) -> HsResult<Self> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)?;
        let found = raw
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| crate::validation_error!("searcher state has no version field"))?
            as u32;
        if found != SEARCHER_STATE_VERSION {
            return Err(HsError::StateVersion {
                what: "searcher".to_string(),
                expected: SEARCHER_STATE_VERSION,
                found,
            });
        }
        Ok(serde_json::from_value(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_cursor_is_monotonic() {
        let mut state = SearcherState::new(1);
        state.advance_cursor(3).unwrap();
        state.advance_cursor(3).unwrap();
        state.advance_cursor(9).unwrap();
        assert!(matches!(state.advance_cursor(4), Err(HsError::Internal(_))));
        assert_eq!(state.last_event_id, 9);
    }

    #[test]
    fn test_closed_is_subset_of_created() {
        let mut state = SearcherState::new(1);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        state.record_created(a);
        state.record_closed(a);
        // b exits before its creation event was seen
        state.record_failure(b);

        assert!(state.trials_closed.is_subset(&state.trials_created));
        assert!(state.failures.contains(&b));
        assert_eq!(state.open_trials(), 0);
    }

    #[test]
    fn test_progress_ignored_after_close() {
        let mut state = SearcherState::new(1);
        let a = Uuid::new_v4();
        state.record_created(a);
        state.record_progress(a, 10.0);
        state.record_closed(a);
        state.record_progress(a, 20.0);
        assert!(state.trial_progress.is_empty());
    }

    #[test]
    fn test_persisted_state_rejects_other_versions() {
        let persisted = PersistedSearcherState::new("asha", SearcherState::new(5));
        let bytes = persisted.to_json_bytes().unwrap();
        let decoded = PersistedSearcherState::from_json_bytes(&bytes).unwrap();
        assert_eq!(decoded.state, persisted.state);

        let mut raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        raw["version"] = serde_json::json!(99);
        let err = PersistedSearcherState::from_json_bytes(&serde_json::to_vec(&raw).unwrap())
            .unwrap_err();
        match err {
            HsError::StateVersion { found, .. } => assert_eq!(found, 99),
            other => panic!("expected version error, got {other:?}"),
        }

        raw.as_object_mut().unwrap().remove("version");
        let err = PersistedSearcherState::from_json_bytes(&serde_json::to_vec(&raw).unwrap())
            .unwrap_err();
        assert!(matches!(err, HsError::Validation(_)), "got {err:?}");
    }
}
