//! In-process experiment service for sandbox runs and tests.
//!
//! Applies operations locally with no external dependencies. Trials "train"
//! instantly: a `ValidateAfter` immediately yields a validation metric computed
//! by a configurable objective function. The service honors the same
//! deduplication contract as a real deployment, so it can stand in for one
//! while exercising crash and resume paths.

use async_trait::async_trait;
use hs_types::{
    EventId, EventKind, ExitedReason, ExperimentId, ExperimentState, Hparams, HparamValue,
    Operation, RequestId, SearcherEvent, ServiceError, ServiceResult,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::service::{ExperimentConfig, ExperimentService};

/// Metric reported for a trial after `length` units of training.
pub type ObjectiveFn = Arc<dyn Fn(&Hparams, u64) -> f64 + Send + Sync>;

/// Faults injected into the simulated service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultPlan {
    /// Number of upcoming `fetch_events` calls that fail with a transport error.
    pub fetch_failures: u32,
    /// Number of upcoming `submit_operations` calls that fail with a transport error.
    pub submit_failures: u32,
    /// Rate-limit the next `submit_operations` call for this many milliseconds.
    pub rate_limit_ms: Option<u64>,
    /// Reject any operation batch triggered by this event.
    pub reject_event: Option<EventId>,
    /// Creation indexes of trials that error out on their first validation.
    pub failing_trials: BTreeSet<u64>,
}

/// Per-trial bookkeeping on the simulated service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedTrial {
    pub request_id: RequestId,
    pub creation_index: u64,
    pub hparams: Hparams,
    pub total_batches_processed: u64,
    pub validated_lengths: BTreeSet<u64>,
    pub closed: bool,
    pub exited_early: bool,
}

#[derive(Debug, Default)]
struct SimulatedInner {
    experiment_id: Option<ExperimentId>,
    experiment_name: String,
    state: Option<ExperimentState>,
    events: Vec<SearcherEvent>,
    trials: BTreeMap<RequestId, SimulatedTrial>,
    faults: FaultPlan,
    searcher_progress: f64,
    shutdown: Option<bool>,
    submissions: u64,
    duplicate_operations: u64,
    peak_open_trials: usize,
    page_size: usize,
}

impl SimulatedInner {
    fn push_event(&mut self, kind: EventKind) {
        let id = self.events.len() as EventId + 1;
        self.events.push(SearcherEvent::new(id, kind));
    }

    fn check_experiment(&self, experiment_id: ExperimentId) -> ServiceResult<()> {
        match self.experiment_id {
            Some(id) if id == experiment_id => Ok(()),
            _ => Err(ServiceError::ExperimentNotFound { experiment_id }),
        }
    }

    fn trial_mut(
        &mut self,
        request_id: RequestId,
        triggered_by: EventId,
    ) -> ServiceResult<&mut SimulatedTrial> {
        self.trials
            .get_mut(&request_id)
            .ok_or_else(|| ServiceError::Rejected {
                event_id: triggered_by,
                reason: format!("unknown request id {request_id}"),
            })
    }

    fn apply(
        &mut self,
        op: &Operation,
        triggered_by: EventId,
        objective: &ObjectiveFn,
    ) -> ServiceResult<()> {
        match op {
            Operation::Create {
                request_id,
                hparams,
                ..
            } => {
                if self.trials.contains_key(request_id) {
                    self.duplicate_operations += 1;
                    return Ok(());
                }
                let creation_index = self.trials.len() as u64;
                self.trials.insert(
                    *request_id,
                    SimulatedTrial {
                        request_id: *request_id,
                        creation_index,
                        hparams: hparams.clone(),
                        total_batches_processed: 0,
                        validated_lengths: BTreeSet::new(),
                        closed: false,
                        exited_early: false,
                    },
                );
                let open = self.trials.values().filter(|t| !t.closed).count();
                self.peak_open_trials = self.peak_open_trials.max(open);
                self.push_event(EventKind::TrialCreated {
                    request_id: *request_id,
                });
            }
            Operation::ValidateAfter {
                request_id, length, ..
            } => {
                let failing = self.faults.failing_trials.clone();
                let trial = self.trial_mut(*request_id, triggered_by)?;
                if trial.closed || !trial.validated_lengths.insert(*length) {
                    self.duplicate_operations += 1;
                    return Ok(());
                }
                if failing.contains(&trial.creation_index) {
                    trial.closed = true;
                    trial.exited_early = true;
                    let request_id = *request_id;
                    debug!(%request_id, "simulated trial errored");
                    self.push_event(EventKind::TrialExitedEarly {
                        request_id,
                        reason: ExitedReason::Errored,
                    });
                    self.push_event(EventKind::TrialClosed { request_id });
                    return Ok(());
                }
                trial.total_batches_processed = trial.total_batches_processed.max(*length);
                let metric = objective(&trial.hparams, *length);
                self.push_event(EventKind::TrialProgress {
                    request_id: *request_id,
                    partial_units: *length as f64,
                });
                self.push_event(EventKind::ValidationCompleted {
                    request_id: *request_id,
                    metric,
                    length: *length,
                });
            }
            Operation::SetSearcherProgress { progress } => {
                self.searcher_progress = *progress;
            }
            Operation::Close { request_id } => {
                let trial = self.trial_mut(*request_id, triggered_by)?;
                if trial.closed {
                    self.duplicate_operations += 1;
                    return Ok(());
                }
                trial.closed = true;
                self.push_event(EventKind::TrialClosed {
                    request_id: *request_id,
                });
            }
            Operation::Shutdown { failed } => {
                if self.shutdown.is_some() {
                    self.duplicate_operations += 1;
                    return Ok(());
                }
                self.shutdown = Some(*failed);
                let state = if *failed {
                    ExperimentState::Errored
                } else {
                    ExperimentState::Completed
                };
                self.state = Some(state);
                self.push_event(EventKind::ExperimentInactive { state });
            }
        }
        Ok(())
    }
}

/// A fully in-process experiment service.
///
/// Cloning yields another handle to the same experiment, which lets tests
/// inspect the service after handing it to a runner.
#[derive(Clone)]
pub struct SimulatedExperimentService {
    inner: Arc<Mutex<SimulatedInner>>,
    objective: ObjectiveFn,
}

impl fmt::Debug for SimulatedExperimentService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SimulatedExperimentService")
            .field("experiment_id", &inner.experiment_id)
            .field("events", &inner.events.len())
            .field("trials", &inner.trials.len())
            .finish_non_exhaustive()
    }
}

impl Default for SimulatedExperimentService {
    fn default() -> Self {
        Self::new(Arc::new(default_objective))
    }
}

/// Lower is better: a smooth bowl around `learning_rate = 0.01` that improves
/// with training length.
pub fn default_objective(hparams: &Hparams, length: u64) -> f64 {
    let lr = match hparams.get("learning_rate") {
        Some(HparamValue::Double(v)) => *v,
        Some(HparamValue::Int(v)) => *v as f64,
        _ => 0.01,
    };
    let distance = (lr.max(f64::MIN_POSITIVE).log10() + 2.0).abs();
    distance + 1.0 / (1.0 + length as f64).ln_1p()
}

impl SimulatedExperimentService {
    pub fn new(objective: ObjectiveFn) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimulatedInner {
                page_size: 64,
                ..SimulatedInner::default()
            })),
            objective,
        }
    }

    pub fn with_faults(self, faults: FaultPlan) -> Self {
        self.inner.lock().faults = faults;
        self
    }

    /// Maximum number of events returned by one fetch.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.inner.lock().page_size = page_size.max(1);
        self
    }

    pub fn inject_fetch_failures(&self, count: u32) {
        self.inner.lock().faults.fetch_failures = count;
    }

    pub fn inject_submit_failures(&self, count: u32) {
        self.inner.lock().faults.submit_failures = count;
    }

    pub fn reject_operations_for(&self, event_id: EventId) {
        self.inner.lock().faults.reject_event = Some(event_id);
    }

    /// Mark an experiment as cancelled from outside, as a user would.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        if inner.state.map_or(true, |s| !s.is_terminal()) {
            inner.state = Some(ExperimentState::Canceled);
            inner.push_event(EventKind::ExperimentInactive {
                state: ExperimentState::Canceled,
            });
        }
    }

    /// Pause an active experiment. Its searcher sees `ExperimentInactive { Paused }`.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.state == Some(ExperimentState::Active) {
            inner.state = Some(ExperimentState::Paused);
            inner.push_event(EventKind::ExperimentInactive {
                state: ExperimentState::Paused,
            });
        }
    }

    /// Resume a paused experiment.
    pub fn activate(&self) {
        let mut inner = self.inner.lock();
        if inner.state == Some(ExperimentState::Paused) {
            inner.state = Some(ExperimentState::Active);
        }
    }

    pub fn experiment_id(&self) -> Option<ExperimentId> {
        self.inner.lock().experiment_id
    }

    pub fn experiment_name(&self) -> String {
        self.inner.lock().experiment_name.clone()
    }

    pub fn experiment_state(&self) -> Option<ExperimentState> {
        self.inner.lock().state
    }

    pub fn events(&self) -> Vec<SearcherEvent> {
        self.inner.lock().events.clone()
    }

    pub fn trials(&self) -> Vec<SimulatedTrial> {
        let inner = self.inner.lock();
        let mut trials: Vec<SimulatedTrial> = inner.trials.values().cloned().collect();
        trials.sort_by_key(|t| t.creation_index);
        trials
    }

    pub fn trial_count(&self) -> usize {
        self.inner.lock().trials.len()
    }

    pub fn closed_trials(&self) -> usize {
        self.inner.lock().trials.values().filter(|t| t.closed).count()
    }

    /// Trials currently created and not closed.
    pub fn open_trials(&self) -> usize {
        self.inner.lock().trials.values().filter(|t| !t.closed).count()
    }

    /// Highest number of simultaneously open trials seen so far.
    pub fn peak_open_trials(&self) -> usize {
        self.inner.lock().peak_open_trials
    }

    pub fn max_batches_processed(&self) -> u64 {
        self.inner
            .lock()
            .trials
            .values()
            .map(|t| t.total_batches_processed)
            .max()
            .unwrap_or(0)
    }

    pub fn shutdown(&self) -> Option<bool> {
        self.inner.lock().shutdown
    }

    pub fn searcher_progress(&self) -> f64 {
        self.inner.lock().searcher_progress
    }

    pub fn submissions(&self) -> u64 {
        self.inner.lock().submissions
    }

    pub fn duplicate_operations(&self) -> u64 {
        self.inner.lock().duplicate_operations
    }
}

#[async_trait]
impl ExperimentService for SimulatedExperimentService {
    async fn create_experiment(
        &mut self,
        config: &ExperimentConfig,
    ) -> ServiceResult<ExperimentId> {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.experiment_id {
            return Err(ServiceError::Internal {
                message: format!("simulated service already hosts experiment {id}"),
            });
        }
        let id: ExperimentId = 1;
        inner.experiment_id = Some(id);
        inner.experiment_name = config.name.clone();
        inner.state = Some(ExperimentState::Active);
        inner.push_event(EventKind::InitialOperations);
        info!(experiment_id = id, name = %config.name, "simulated experiment created");
        Ok(id)
    }

    async fn fetch_events(
        &mut self,
        experiment_id: ExperimentId,
        after_id: EventId,
    ) -> ServiceResult<Vec<SearcherEvent>> {
        let mut inner = self.inner.lock();
        inner.check_experiment(experiment_id)?;
        if inner.faults.fetch_failures > 0 {
            inner.faults.fetch_failures -= 1;
            return Err(ServiceError::Transport {
                message: "simulated connection reset while fetching events".into(),
            });
        }
        let start = (after_id as usize).min(inner.events.len());
        let end = (start + inner.page_size).min(inner.events.len());
        Ok(inner.events[start..end].to_vec())
    }

    async fn submit_operations(
        &mut self,
        experiment_id: ExperimentId,
        triggered_by: EventId,
        operations: &[Operation],
    ) -> ServiceResult<()> {
        let mut inner = self.inner.lock();
        inner.check_experiment(experiment_id)?;
        if let Some(retry_after_ms) = inner.faults.rate_limit_ms.take() {
            return Err(ServiceError::RateLimited { retry_after_ms });
        }
        if inner.faults.submit_failures > 0 {
            inner.faults.submit_failures -= 1;
            return Err(ServiceError::Transport {
                message: "simulated timeout while submitting operations".into(),
            });
        }
        if inner.faults.reject_event == Some(triggered_by) {
            warn!(event_id = triggered_by, "simulated service rejecting operations");
            return Err(ServiceError::Rejected {
                event_id: triggered_by,
                reason: "operations refused by simulated service".into(),
            });
        }

        inner.submissions += 1;
        for op in operations {
            inner.apply(op, triggered_by, &self.objective)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_types::ValidationUnit;
    use uuid::Uuid;

    fn create(request_id: RequestId) -> Operation {
        let mut hparams = Hparams::new();
        hparams.insert("learning_rate".into(), HparamValue::Double(0.01));
        Operation::Create {
            request_id,
            trial_seed: 7,
            hparams,
            checkpoint: None,
        }
    }

    fn validate(request_id: RequestId, length: u64) -> Operation {
        Operation::ValidateAfter {
            request_id,
            length,
            unit: ValidationUnit::Batches,
        }
    }

    #[tokio::test]
    async fn test_events_follow_operations_in_order() {
        let mut service = SimulatedExperimentService::default();
        let id = service
            .create_experiment(&ExperimentConfig::default())
            .await
            .unwrap();
        let trial = Uuid::new_v4();
        service
            .submit_operations(id, 0, &[create(trial), validate(trial, 100)])
            .await
            .unwrap();

        let events = service.fetch_events(id, 0).await.unwrap();
        let ids: Vec<EventId> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(events[0].kind, EventKind::InitialOperations);
        assert!(matches!(events[3].kind, EventKind::ValidationCompleted { length: 100, .. }));

        let tail = service.fetch_events(id, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(service.max_batches_processed(), 100);
    }

    #[tokio::test]
    async fn test_resubmission_is_a_no_op() {
        let mut service = SimulatedExperimentService::default();
        let id = service
            .create_experiment(&ExperimentConfig::default())
            .await
            .unwrap();
        let trial = Uuid::new_v4();
        let batch = vec![create(trial), validate(trial, 50), Operation::Close { request_id: trial }];
        service.submit_operations(id, 0, &batch).await.unwrap();
        let events_before = service.events().len();

        service.submit_operations(id, 0, &batch).await.unwrap();
        assert_eq!(service.events().len(), events_before);
        assert_eq!(service.trial_count(), 1);
        assert_eq!(service.duplicate_operations(), 3);
    }

    #[tokio::test]
    async fn test_unknown_trial_is_rejected() {
        let mut service = SimulatedExperimentService::default();
        let id = service
            .create_experiment(&ExperimentConfig::default())
            .await
            .unwrap();
        let err = service
            .submit_operations(id, 3, &[Operation::Close { request_id: Uuid::new_v4() }])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Rejected { event_id: 3, .. }));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let mut faults = FaultPlan::default();
        faults.failing_trials.insert(0);
        let mut service = SimulatedExperimentService::default()
            .with_faults(faults)
            .with_page_size(2);
        let id = service
            .create_experiment(&ExperimentConfig::default())
            .await
            .unwrap();

        service.inject_fetch_failures(1);
        assert!(service.fetch_events(id, 0).await.unwrap_err().is_transient());
        assert_eq!(service.fetch_events(id, 0).await.unwrap().len(), 1);

        let trial = Uuid::new_v4();
        service.inject_submit_failures(1);
        assert!(service
            .submit_operations(id, 1, &[create(trial)])
            .await
            .unwrap_err()
            .is_transient());
        service
            .submit_operations(id, 1, &[create(trial), validate(trial, 10)])
            .await
            .unwrap();

        let kinds: Vec<EventKind> = service.events().into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::TrialExitedEarly {
            request_id: trial,
            reason: ExitedReason::Errored,
        }));
        assert_eq!(service.fetch_events(id, 0).await.unwrap().len(), 2);
        assert_eq!(service.closed_trials(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_marks_experiment_inactive() {
        let mut service = SimulatedExperimentService::default();
        let id = service
            .create_experiment(&ExperimentConfig::default())
            .await
            .unwrap();
        service
            .submit_operations(id, 1, &[Operation::Shutdown { failed: false }])
            .await
            .unwrap();
        assert_eq!(service.shutdown(), Some(false));
        assert_eq!(service.experiment_state(), Some(ExperimentState::Completed));
        assert!(service.fetch_events(7, 0).await.is_err());
    }
}
