//! The search runner: drives a [`SearchMethod`] against an
//! [`ExperimentService`] and commits progress to a [`SnapshotStore`].
//!
//! Every processed event goes through the same cycle: dispatch to the method,
//! submit the resulting operations, then advance the cursor and persist the
//! searcher and method state together. A crash anywhere before the persist
//! replays the event on restart; the replayed operations carry the same
//! request ids and the service ignores the ones it already applied.

use hs_optimizer::SearchMethod;
use hs_types::{
    config_error, AlgorithmError, EventId, EventKind, ExperimentId, ExperimentState, HsError,
    HsResult, Operation, SearcherEvent, SearcherState, ServiceError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::retry::RetryPolicy;
use crate::service::{ExperimentConfig, ExperimentService};
use crate::store::{RunnerSnapshot, SnapshotStore};

/// Configuration for the search runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Wait between polls that returned no events.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Experiment created on a fresh start.
    pub experiment: ExperimentConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            experiment: ExperimentConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_experiment(mut self, experiment: ExperimentConfig) -> Self {
        self.experiment = experiment;
        self
    }

    /// Defaults overridden by `HS_POLL_INTERVAL_MS`, `HS_MAX_RETRIES` and
    /// `HS_RETRY_BASE_MS` when set.
    pub fn from_env() -> HsResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> HsResult<Self> {
        fn parse(key: &str, value: String) -> HsResult<u64> {
            value
                .trim()
                .parse()
                .map_err(|_| config_error!("{key} must be a non-negative integer, got '{value}'"))
        }

        let mut config = Self::default();
        if let Some(value) = lookup("HS_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse("HS_POLL_INTERVAL_MS", value)?);
        }
        if let Some(value) = lookup("HS_MAX_RETRIES") {
            config.retry.max_attempts = parse("HS_MAX_RETRIES", value)?
                .try_into()
                .map_err(|_| config_error!("HS_MAX_RETRIES is out of range"))?;
        }
        if let Some(value) = lookup("HS_RETRY_BASE_MS") {
            config.retry.base_delay = Duration::from_millis(parse("HS_RETRY_BASE_MS", value)?);
        }
        Ok(config)
    }
}

/// Lifecycle phase of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerPhase {
    Starting,
    Running,
    Draining,
    Terminated,
}

/// Why the polling loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The search method emitted `Shutdown`.
    Shutdown { failed: bool },
    /// The service reported the experiment inactive.
    ExperimentInactive { state: ExperimentState },
    /// The external stop signal fired.
    StopRequested,
    /// The persisted state shows a search that already drained.
    AlreadyCompleted,
}

/// Summary returned by [`SearchRunner::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub experiment_id: ExperimentId,
    pub resumed: bool,
    pub stop_reason: StopReason,
    pub last_event_id: EventId,
    pub events_processed: u64,
    pub operations_submitted: u64,
    pub trials_created: usize,
    pub trials_closed: usize,
    pub failures: usize,
}

/// Event-sourced control loop around a search method.
pub struct SearchRunner<S, M, P>
where
    S: ExperimentService,
    M: SearchMethod,
    P: SnapshotStore,
{
    service: S,
    method: M,
    store: P,
    config: RunnerConfig,
    phase: RunnerPhase,
    state: SearcherState,
    committed: Option<RunnerSnapshot>,
    stop: Option<watch::Receiver<bool>>,
    events_processed: u64,
    operations_submitted: u64,
}

impl<S, M, P> SearchRunner<S, M, P>
where
    S: ExperimentService,
    M: SearchMethod,
    P: SnapshotStore,
{
    pub fn new(service: S, method: M, store: P, config: RunnerConfig) -> Self {
        Self {
            service,
            method,
            store,
            config,
            phase: RunnerPhase::Starting,
            state: SearcherState::new(0),
            committed: None,
            stop: None,
            events_processed: 0,
            operations_submitted: 0,
        }
    }

    /// Drain and exit once `stop` turns `true`.
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn phase(&self) -> RunnerPhase {
        self.phase
    }

    pub fn state(&self) -> &SearcherState {
        &self.state
    }

    pub fn method(&self) -> &M {
        &self.method
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn store(&self) -> &P {
        &self.store
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run until the search shuts down, the experiment goes inactive, or the
    /// stop signal fires.
    pub async fn run(&mut self) -> HsResult<RunOutcome> {
        let result = self.drive().await;
        if let Err(err) = &result {
            if err.is_algorithm() {
                self.save_committed_best_effort().await;
            }
            error!(
                phase = ?self.phase,
                last_event_id = self.state.last_event_id,
                error = %err,
                "search runner failed"
            );
        }
        result
    }

    async fn drive(&mut self) -> HsResult<RunOutcome> {
        self.phase = RunnerPhase::Starting;
        let (resumed, completed) = self.start().await?;

        let reason = if completed {
            StopReason::AlreadyCompleted
        } else {
            self.phase = RunnerPhase::Running;
            self.poll_loop().await?
        };

        self.phase = RunnerPhase::Draining;
        self.drain(reason).await?;
        self.phase = RunnerPhase::Terminated;

        Ok(RunOutcome {
            experiment_id: self.state.experiment_id,
            resumed,
            stop_reason: reason,
            last_event_id: self.state.last_event_id,
            events_processed: self.events_processed,
            operations_submitted: self.operations_submitted,
            trials_created: self.state.trials_created.len(),
            trials_closed: self.state.trials_closed.len(),
            failures: self.state.failures.len(),
        })
    }

    /// Load the last committed snapshot or start a new experiment. Returns
    /// `(resumed, already_completed)`.
    async fn start(&mut self) -> HsResult<(bool, bool)> {
        if let Some(snapshot) = self.store.load_latest().await? {
            if snapshot.searcher.method != self.method.name() {
                return Err(config_error!(
                    "persisted state was written by search method '{}', not '{}'",
                    snapshot.searcher.method,
                    self.method.name()
                ));
            }
            self.method
                .load_state(&mut snapshot.method_state.as_slice())?;
            self.state = snapshot.state().clone();
            self.committed = Some(snapshot);

            info!(
                experiment_id = self.state.experiment_id,
                last_event_id = self.state.last_event_id,
                trials_created = self.state.trials_created.len(),
                trials_closed = self.state.trials_closed.len(),
                "resuming search"
            );

            if self.state.experiment_completed {
                return Ok((true, true));
            }
            if !self.state.initial_operations_submitted {
                self.submit_initial_operations().await?;
            }
            return Ok((true, false));
        }

        let experiment = self.config.experiment.clone();
        let mut attempt = 0;
        let experiment_id = loop {
            match self.service.create_experiment(&experiment).await {
                Ok(id) => break id,
                Err(err) => {
                    attempt += 1;
                    let delay = self.backoff("create_experiment", attempt, err)?;
                    tokio::time::sleep(delay).await;
                }
            }
        };
        info!(
            experiment_id,
            name = %experiment.name,
            method = self.method.name(),
            "created experiment"
        );

        self.state = SearcherState::new(experiment_id);
        self.persist().await?;
        self.submit_initial_operations().await?;
        Ok((false, false))
    }

    async fn submit_initial_operations(&mut self) -> HsResult<()> {
        let ops = self.method.initial_operations(&self.state)?;
        validate_operations(0, &ops)?;
        self.submit(0, &ops).await?;
        self.state.initial_operations_submitted = true;
        self.persist().await?;
        info!(operations = ops.len(), "submitted initial operations");
        Ok(())
    }

    async fn poll_loop(&mut self) -> HsResult<StopReason> {
        loop {
            if self.stop_requested() {
                return Ok(StopReason::StopRequested);
            }

            let events = self.fetch_events().await?;
            if events.is_empty() {
                if self.wait_for_next_poll().await {
                    return Ok(StopReason::StopRequested);
                }
                continue;
            }

            for event in events {
                if event.id <= self.state.last_event_id {
                    warn!(
                        event_id = event.id,
                        last_event_id = self.state.last_event_id,
                        "skipping event at or behind the cursor"
                    );
                    continue;
                }
                if let Some(reason) = self.process_event(event).await? {
                    return Ok(reason);
                }
            }
        }
    }

    /// Sleep for the poll interval. Returns `true` if the stop signal fired.
    async fn wait_for_next_poll(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.config.poll_interval);
        let Some(stop) = self.stop.as_mut() else {
            sleep.await;
            return false;
        };

        let mut sender_gone = false;
        let stopped = tokio::select! {
            _ = sleep => false,
            changed = stop.changed() => match changed {
                Ok(()) => *stop.borrow(),
                Err(_) => {
                    sender_gone = true;
                    false
                }
            },
        };
        if sender_gone {
            debug!("stop signal sender dropped");
            self.stop = None;
        }
        stopped
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().map_or(false, |stop| *stop.borrow())
    }

    async fn process_event(&mut self, event: SearcherEvent) -> HsResult<Option<StopReason>> {
        debug!(event = %event, request_id = ?event.request_id(), "dispatching event");
        let event_id = event.id;
        let (ops, inactive) = self.dispatch(&event)?;
        validate_operations(event_id, &ops)?;

        if !ops.is_empty() {
            self.submit(event_id, &ops).await?;
        }
        self.state.advance_cursor(event_id)?;
        self.persist().await?;
        self.events_processed += 1;

        if let Some(&Operation::Shutdown { failed }) = ops.iter().find(|op| op.is_shutdown()) {
            info!(event_id, failed, "search method requested shutdown");
            return Ok(Some(StopReason::Shutdown { failed }));
        }
        Ok(inactive.map(|state| StopReason::ExperimentInactive { state }))
    }

    /// Apply `event` to the searcher state and hand it to the method.
    fn dispatch(
        &mut self,
        event: &SearcherEvent,
    ) -> HsResult<(Vec<Operation>, Option<ExperimentState>)> {
        let ops = match &event.kind {
            EventKind::InitialOperations => {
                if self.state.initial_operations_submitted {
                    Vec::new()
                } else {
                    self.state.initial_operations_submitted = true;
                    self.method.initial_operations(&self.state)?
                }
            }
            EventKind::TrialCreated { request_id } => {
                self.state.record_created(*request_id);
                self.method.on_trial_created(&self.state, *request_id)?
            }
            EventKind::ValidationCompleted {
                request_id,
                metric,
                length,
            } => self
                .method
                .on_validation_completed(&self.state, *request_id, *metric, *length)?,
            EventKind::TrialProgress {
                request_id,
                partial_units,
            } => {
                self.state.record_progress(*request_id, *partial_units);
                vec![Operation::SetSearcherProgress {
                    progress: self.method.progress(&self.state),
                }]
            }
            EventKind::TrialClosed { request_id } => {
                self.state.record_closed(*request_id);
                self.method.on_trial_closed(&self.state, *request_id)?
            }
            EventKind::TrialExitedEarly { request_id, reason } => {
                warn!(%request_id, ?reason, "trial exited early");
                self.state.record_failure(*request_id);
                self.method
                    .on_trial_exited_early(&self.state, *request_id, *reason)?
            }
            EventKind::ExperimentInactive { state } => {
                info!(event_id = event.id, ?state, "experiment is no longer active");
                return Ok((Vec::new(), Some(*state)));
            }
        };
        Ok((ops, None))
    }

    async fn fetch_events(&mut self) -> HsResult<Vec<SearcherEvent>> {
        let experiment_id = self.state.experiment_id;
        let after_id = self.state.last_event_id;
        let mut attempt = 0;
        loop {
            match self.service.fetch_events(experiment_id, after_id).await {
                Ok(events) => return Ok(events),
                Err(err) => {
                    attempt += 1;
                    let delay = self.backoff("fetch_events", attempt, err)?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn submit(&mut self, event_id: EventId, ops: &[Operation]) -> HsResult<()> {
        let experiment_id = self.state.experiment_id;
        let mut attempt = 0;
        loop {
            match self
                .service
                .submit_operations(experiment_id, event_id, ops)
                .await
            {
                Ok(()) => {
                    self.operations_submitted += ops.len() as u64;
                    let kinds: Vec<&str> = ops.iter().map(Operation::kind).collect();
                    debug!(event_id, operations = ?kinds, "submitted operations");
                    return Ok(());
                }
                Err(err @ ServiceError::Rejected { .. }) => {
                    let operations: Vec<String> = ops.iter().map(ToString::to_string).collect();
                    error!(
                        event_id,
                        operations = ?operations,
                        error = %err,
                        "remote service rejected operations"
                    );
                    return Err(err.into());
                }
                Err(err) => {
                    attempt += 1;
                    let delay = self.backoff("submit_operations", attempt, err)?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Delay before retrying `call`, or the error itself once it is permanent
    /// or the retry budget is spent.
    fn backoff(&self, call: &'static str, attempt: u32, err: ServiceError) -> HsResult<Duration> {
        match self.config.retry.delay_for(attempt, &err) {
            Some(delay) => {
                warn!(
                    call,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient service failure, retrying"
                );
                Ok(delay)
            }
            None => Err(err.into()),
        }
    }

    async fn persist(&mut self) -> HsResult<()> {
        let mut method_state = Vec::new();
        self.method.save_state(&mut method_state)?;
        let snapshot = RunnerSnapshot::new(self.method.name(), self.state.clone(), method_state);
        let handle = self.store.save(&snapshot).await?;
        debug!(
            handle = %handle,
            last_event_id = self.state.last_event_id,
            "committed snapshot"
        );
        self.committed = Some(snapshot);
        Ok(())
    }

    async fn drain(&mut self, reason: StopReason) -> HsResult<()> {
        let finished = match &reason {
            StopReason::Shutdown { .. } => true,
            StopReason::ExperimentInactive { state } => state.is_terminal(),
            StopReason::StopRequested | StopReason::AlreadyCompleted => false,
        };
        if finished {
            self.state.experiment_completed = true;
        }
        if reason != StopReason::AlreadyCompleted {
            self.persist().await?;
        }
        info!(
            experiment_id = self.state.experiment_id,
            last_event_id = self.state.last_event_id,
            reason = ?reason,
            trials_closed = self.state.trials_closed.len(),
            "search runner drained"
        );
        Ok(())
    }

    async fn save_committed_best_effort(&mut self) {
        let Some(snapshot) = self.committed.clone() else {
            return;
        };
        match self.store.save(&snapshot).await {
            Ok(handle) => info!(handle = %handle, "saved last committed state after algorithm error"),
            Err(err) => warn!(error = %err, "could not save state after algorithm error"),
        }
    }
}

/// Reject operations the service could never apply.
fn validate_operations(event_id: EventId, ops: &[Operation]) -> HsResult<()> {
    for op in ops {
        op.validate().map_err(|message| {
            HsError::from(AlgorithmError::InvalidOperation {
                message: format!("{message} (while handling event {event_id})"),
            })
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{FaultPlan, SimulatedExperimentService};
    use crate::store::LocalSnapshotStore;
    use async_trait::async_trait;
    use hs_optimizer::{AshaConfig, AshaSearchMethod, SearchSpace};
    use hs_types::{
        AlgorithmResult, ExitedReason, Hparams, RequestId, ServiceResult, StoreError,
        ValidationUnit,
    };
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn asha() -> AshaSearchMethod {
        let space = SearchSpace::new()
            .add_log_uniform("learning_rate", 1e-4, 1e-1)
            .add_int("layers", 1, 4);
        AshaSearchMethod::new(
            AshaConfig::new(2400, space)
                .with_max_trials(16)
                .with_max_concurrent_trials(4)
                .with_rungs(3, 4)
                .with_seed(5),
        )
        .unwrap()
    }

    /// Every validation scores better than all earlier ones, so the newest
    /// reports at a rung always rank first.
    fn improving_service() -> SimulatedExperimentService {
        let reports = Arc::new(AtomicU64::new(0));
        SimulatedExperimentService::new(Arc::new(move |_: &Hparams, _: u64| {
            -(reports.fetch_add(1, Ordering::SeqCst) as f64)
        }))
    }

    fn fast_config() -> RunnerConfig {
        RunnerConfig::default()
            .with_poll_interval(Duration::from_millis(1))
            .with_retry(RetryPolicy::new(5, Duration::from_millis(1)))
    }

    /// Wraps a store and fails every save after a budget is spent.
    struct CrashingStore<P> {
        inner: P,
        saves_left: usize,
    }

    #[async_trait]
    impl<P: SnapshotStore> SnapshotStore for CrashingStore<P> {
        async fn save(&mut self, snapshot: &RunnerSnapshot) -> HsResult<String> {
            if self.saves_left == 0 {
                return Err(StoreError::Backend {
                    message: "simulated crash".into(),
                }
                .into());
            }
            self.saves_left -= 1;
            self.inner.save(snapshot).await
        }

        async fn load(&self, handle: &String) -> HsResult<RunnerSnapshot> {
            self.inner.load(handle).await
        }

        async fn latest(&self) -> HsResult<Option<String>> {
            self.inner.latest().await
        }
    }

    /// A service that never produces events.
    struct IdleService;

    #[async_trait]
    impl ExperimentService for IdleService {
        async fn create_experiment(&mut self, _config: &ExperimentConfig) -> ServiceResult<u64> {
            Ok(42)
        }

        async fn fetch_events(&mut self, _id: u64, _after: u64) -> ServiceResult<Vec<SearcherEvent>> {
            Ok(Vec::new())
        }

        async fn submit_operations(
            &mut self,
            _id: u64,
            _triggered_by: u64,
            _ops: &[Operation],
        ) -> ServiceResult<()> {
            Ok(())
        }
    }

    /// Creates one trial and fails on its first validation.
    struct BrokenMethod {
        trial: RequestId,
    }

    impl SearchMethod for BrokenMethod {
        fn name(&self) -> &str {
            "broken"
        }

        fn initial_operations(&mut self, _state: &SearcherState) -> AlgorithmResult<Vec<Operation>> {
            Ok(vec![
                Operation::Create {
                    request_id: self.trial,
                    trial_seed: 1,
                    hparams: Default::default(),
                    checkpoint: None,
                },
                Operation::ValidateAfter {
                    request_id: self.trial,
                    length: 10,
                    unit: ValidationUnit::Batches,
                },
            ])
        }

        fn on_validation_completed(
            &mut self,
            _state: &SearcherState,
            _request_id: RequestId,
            _metric: f64,
            _length: u64,
        ) -> AlgorithmResult<Vec<Operation>> {
            Err(AlgorithmError::State {
                message: "metric rejected".into(),
            })
        }

        fn on_trial_closed(
            &mut self,
            _state: &SearcherState,
            _request_id: RequestId,
        ) -> AlgorithmResult<Vec<Operation>> {
            Ok(Vec::new())
        }

        fn on_trial_exited_early(
            &mut self,
            _state: &SearcherState,
            _request_id: RequestId,
            _reason: ExitedReason,
        ) -> AlgorithmResult<Vec<Operation>> {
            Ok(Vec::new())
        }

        fn progress(&self, _state: &SearcherState) -> f64 {
            0.0
        }

        fn save_state(&self, writer: &mut dyn Write) -> AlgorithmResult<()> {
            writer.write_all(b"{}").map_err(|e| AlgorithmError::State {
                message: e.to_string(),
            })
        }

        fn load_state(&mut self, _reader: &mut dyn Read) -> AlgorithmResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fresh_run_reaches_single_shutdown() {
        let dir = tempdir().unwrap();
        let service = improving_service();
        let store = LocalSnapshotStore::open(dir.path()).unwrap();
        let mut runner = SearchRunner::new(service.clone(), asha(), store, fast_config());

        let outcome = runner.run().await.unwrap();

        assert_eq!(outcome.stop_reason, StopReason::Shutdown { failed: false });
        assert!(!outcome.resumed);
        assert_eq!(outcome.trials_created, 16);
        assert_eq!(outcome.trials_closed, 16);
        assert_eq!(runner.phase(), RunnerPhase::Terminated);

        assert_eq!(service.shutdown(), Some(false));
        assert_eq!(service.trial_count(), 16);
        assert!(service.peak_open_trials() <= 4);
        assert_eq!(service.max_batches_processed(), 2400);
        assert_eq!(service.duplicate_operations(), 0);
        assert_eq!(service.experiment_name(), "custom-search");
        let progress = service.searcher_progress();
        assert!(progress > 0.0 && progress <= 1.0, "progress was {progress}");

        let rungs = runner.method().rungs();
        assert_eq!(rungs[0].promoted, 4);
        assert_eq!(rungs[1].promoted, 1);

        let stored = runner.store().load_latest().await.unwrap().unwrap();
        assert!(stored.state().experiment_completed);
        assert_eq!(stored.state().last_event_id, outcome.last_event_id);
    }

    #[tokio::test]
    async fn test_crash_resume_cycles_keep_cursor_monotonic() {
        let dir = tempdir().unwrap();
        let service = SimulatedExperimentService::default();
        let mut cursors = Vec::new();
        let mut crashes = 0;

        let outcome = loop {
            let store = CrashingStore {
                inner: LocalSnapshotStore::open(dir.path()).unwrap(),
                saves_left: 9,
            };
            let mut runner = SearchRunner::new(service.clone(), asha(), store, fast_config());
            match runner.run().await {
                Ok(outcome) => break outcome,
                Err(HsError::Store(StoreError::Backend { .. })) => {
                    crashes += 1;
                    let committed = LocalSnapshotStore::open(dir.path())
                        .unwrap()
                        .load_latest()
                        .await
                        .unwrap()
                        .unwrap();
                    cursors.push(committed.state().last_event_id);
                }
                Err(other) => panic!("unexpected failure: {other}"),
            }
            assert!(crashes < 200, "search never finished");
        };

        assert!(crashes > 0);
        assert!(cursors.windows(2).all(|w| w[0] <= w[1]));
        assert!(outcome.resumed);
        assert!(outcome.last_event_id >= *cursors.last().unwrap());

        assert_eq!(service.shutdown(), Some(false));
        assert_eq!(service.trial_count(), 16);
        assert_eq!(service.closed_trials(), 16);
        assert!(service.peak_open_trials() <= 4);
    }

    #[tokio::test]
    async fn test_resumed_run_matches_uninterrupted_run() {
        let reference = SimulatedExperimentService::default();
        let dir = tempdir().unwrap();
        SearchRunner::new(
            reference.clone(),
            asha(),
            LocalSnapshotStore::open(dir.path()).unwrap(),
            fast_config(),
        )
        .run()
        .await
        .unwrap();

        let crashed = SimulatedExperimentService::default();
        let dir = tempdir().unwrap();
        let store = CrashingStore {
            inner: LocalSnapshotStore::open(dir.path()).unwrap(),
            saves_left: 40,
        };
        assert!(SearchRunner::new(crashed.clone(), asha(), store, fast_config())
            .run()
            .await
            .is_err());
        SearchRunner::new(
            crashed.clone(),
            asha(),
            LocalSnapshotStore::open(dir.path()).unwrap(),
            fast_config(),
        )
        .run()
        .await
        .unwrap();

        let ids = |service: &SimulatedExperimentService| -> Vec<RequestId> {
            service.trials().into_iter().map(|t| t.request_id).collect()
        };
        assert_eq!(ids(&reference), ids(&crashed));
        assert_eq!(reference.events(), crashed.events());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = tempdir().unwrap();
        let service = SimulatedExperimentService::default().with_faults(FaultPlan {
            fetch_failures: 3,
            submit_failures: 2,
            rate_limit_ms: Some(2),
            ..FaultPlan::default()
        });
        let mut runner = SearchRunner::new(
            service.clone(),
            asha(),
            LocalSnapshotStore::open(dir.path()).unwrap(),
            fast_config(),
        );

        let outcome = runner.run().await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Shutdown { failed: false });
        assert_eq!(service.trial_count(), 16);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_fatal() {
        let dir = tempdir().unwrap();
        let service = SimulatedExperimentService::default();
        let mut runner = SearchRunner::new(
            service.clone(),
            asha(),
            LocalSnapshotStore::open(dir.path()).unwrap(),
            fast_config().with_retry(RetryPolicy::new(2, Duration::from_millis(1))),
        );
        service.inject_submit_failures(10);

        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, HsError::Service(ServiceError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_rejection_is_fatal_and_keeps_last_commit() {
        let dir = tempdir().unwrap();
        let service = SimulatedExperimentService::default();
        // #1 initial operations, #2 trial created, #3 trial progress
        service.reject_operations_for(3);
        let mut runner = SearchRunner::new(
            service.clone(),
            asha(),
            LocalSnapshotStore::open(dir.path()).unwrap(),
            fast_config(),
        );

        match runner.run().await {
            Err(HsError::Service(ServiceError::Rejected { event_id, .. })) => {
                assert_eq!(event_id, 3)
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        let committed = runner.store().load_latest().await.unwrap().unwrap();
        assert_eq!(committed.state().last_event_id, 2);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_fatal_at_start() {
        let dir = tempdir().unwrap();
        let mut store = LocalSnapshotStore::open(dir.path()).unwrap();
        let handle = store
            .save(&RunnerSnapshot::new("asha", SearcherState::new(1), b"{}".to_vec()))
            .await
            .unwrap();

        let path = store
            .snapshot_dir(&handle)
            .join(crate::store::SEARCHER_STATE_FILE);
        let mut raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        raw["version"] = serde_json::json!(2);
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        let service = SimulatedExperimentService::default();
        let mut runner = SearchRunner::new(service.clone(), asha(), store, fast_config());
        match runner.run().await {
            Err(HsError::StateVersion { expected, found, .. }) => {
                assert_eq!((expected, found), (1, 2))
            }
            other => panic!("expected version error, got {other:?}"),
        }
        assert_eq!(runner.phase(), RunnerPhase::Starting);
        assert!(service.experiment_id().is_none());
    }

    #[tokio::test]
    async fn test_stop_signal_interrupts_poll_wait() {
        let dir = tempdir().unwrap();
        let (tx, rx) = watch::channel(false);
        let mut runner = SearchRunner::new(
            IdleService,
            asha(),
            LocalSnapshotStore::open(dir.path()).unwrap(),
            fast_config().with_poll_interval(Duration::from_secs(3600)),
        )
        .with_stop_signal(rx);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        });
        let outcome = runner.run().await.unwrap();
        stopper.await.unwrap();

        assert_eq!(outcome.stop_reason, StopReason::StopRequested);
        assert_eq!(outcome.experiment_id, 42);
        let stored = runner.store().load_latest().await.unwrap().unwrap();
        assert!(stored.state().initial_operations_submitted);
        assert!(!stored.state().experiment_completed);
    }

    #[tokio::test]
    async fn test_completed_search_is_not_restarted() {
        let dir = tempdir().unwrap();
        let service = SimulatedExperimentService::default();
        SearchRunner::new(
            service.clone(),
            asha(),
            LocalSnapshotStore::open(dir.path()).unwrap(),
            fast_config(),
        )
        .run()
        .await
        .unwrap();
        let submissions = service.submissions();

        let outcome = SearchRunner::new(
            service.clone(),
            asha(),
            LocalSnapshotStore::open(dir.path()).unwrap(),
            fast_config(),
        )
        .run()
        .await
        .unwrap();
        assert_eq!(outcome.stop_reason, StopReason::AlreadyCompleted);
        assert_eq!(service.submissions(), submissions);
    }

    #[tokio::test]
    async fn test_cancelled_experiment_drains() {
        let dir = tempdir().unwrap();
        let service = SimulatedExperimentService::default();
        let store = CrashingStore {
            inner: LocalSnapshotStore::open(dir.path()).unwrap(),
            saves_left: 6,
        };
        assert!(SearchRunner::new(service.clone(), asha(), store, fast_config())
            .run()
            .await
            .is_err());

        service.cancel();
        let mut runner = SearchRunner::new(
            service.clone(),
            asha(),
            LocalSnapshotStore::open(dir.path()).unwrap(),
            fast_config(),
        );
        let outcome = runner.run().await.unwrap();

        assert_eq!(
            outcome.stop_reason,
            StopReason::ExperimentInactive {
                state: ExperimentState::Canceled
            }
        );
        assert!(outcome.trials_closed < 16);
        assert_eq!(service.shutdown(), None);
        let stored = runner.store().load_latest().await.unwrap().unwrap();
        assert!(stored.state().experiment_completed);
    }

    #[tokio::test]
    async fn test_paused_experiment_resumes_later() {
        let dir = tempdir().unwrap();
        let service = SimulatedExperimentService::default();
        let store = CrashingStore {
            inner: LocalSnapshotStore::open(dir.path()).unwrap(),
            saves_left: 6,
        };
        assert!(SearchRunner::new(service.clone(), asha(), store, fast_config())
            .run()
            .await
            .is_err());

        service.pause();
        let mut paused = SearchRunner::new(
            service.clone(),
            asha(),
            LocalSnapshotStore::open(dir.path()).unwrap(),
            fast_config(),
        );
        let outcome = paused.run().await.unwrap();
        assert_eq!(
            outcome.stop_reason,
            StopReason::ExperimentInactive {
                state: ExperimentState::Paused
            }
        );
        let stored = paused.store().load_latest().await.unwrap().unwrap();
        assert!(!stored.state().experiment_completed);

        service.activate();
        let mut resumed = SearchRunner::new(
            service.clone(),
            asha(),
            LocalSnapshotStore::open(dir.path()).unwrap(),
            fast_config(),
        );
        let outcome = resumed.run().await.unwrap();
        assert!(outcome.resumed);
        assert_eq!(outcome.stop_reason, StopReason::Shutdown { failed: false });
        assert_eq!(outcome.trials_closed, 16);
        assert_eq!(service.shutdown(), Some(false));
    }

    #[tokio::test]
    async fn test_exited_trials_are_replaced() {
        let dir = tempdir().unwrap();
        let mut faults = FaultPlan::default();
        faults.failing_trials.extend([1, 6]);
        let service = SimulatedExperimentService::default().with_faults(faults);
        let mut runner = SearchRunner::new(
            service.clone(),
            asha(),
            LocalSnapshotStore::open(dir.path()).unwrap(),
            fast_config(),
        );

        let outcome = runner.run().await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Shutdown { failed: false });
        assert_eq!(outcome.failures, 2);
        assert_eq!(service.trial_count(), 16);
        assert_eq!(service.closed_trials(), 16);
    }

    #[tokio::test]
    async fn test_algorithm_error_saves_last_commit() {
        let dir = tempdir().unwrap();
        let service = SimulatedExperimentService::default();
        let method = BrokenMethod {
            trial: uuid::Uuid::new_v4(),
        };
        let mut runner = SearchRunner::new(
            service.clone(),
            method,
            LocalSnapshotStore::open(dir.path()).unwrap(),
            fast_config(),
        );

        let err = runner.run().await.unwrap_err();
        assert!(err.is_algorithm());
        let latest = runner.store().latest().await.unwrap().unwrap();
        let committed = runner.store().load(&latest).await.unwrap();
        // #4 is the validation the method choked on
        assert_eq!(committed.state().last_event_id, 3);
        assert_eq!(runner.state().last_event_id, 3);
    }

    #[test]
    fn test_config_from_env_lookup() {
        let config = RunnerConfig::from_lookup(|key| match key {
            "HS_POLL_INTERVAL_MS" => Some("250".into()),
            "HS_MAX_RETRIES" => Some("3".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, RetryPolicy::default().base_delay);

        let err = RunnerConfig::from_lookup(|key| {
            (key == "HS_RETRY_BASE_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("HS_RETRY_BASE_MS"));
    }

    #[test]
    fn test_invalid_operations_are_algorithm_errors() {
        let err = validate_operations(
            9,
            &[Operation::SetSearcherProgress { progress: 1.5 }],
        )
        .unwrap_err();
        assert!(err.is_algorithm());
        assert!(err.to_string().contains("event 9"));
    }
}
