//! Deployment variants of the search runner.
//!
//! Both run the same engine; they differ in where committed snapshots live
//! and in how the outer experiment is labelled when it is created.

use hs_optimizer::SearchMethod;
use hs_types::HsResult;
use std::path::Path;
use tracing::info;

use crate::runner::{RunnerConfig, SearchRunner};
use crate::service::ExperimentService;
use crate::store::{CheckpointStorage, LocalSnapshotStore, RemoteSnapshotStore};

/// Runner persisting snapshots under a local directory.
pub type LocalSearchRunner<S, M> = SearchRunner<S, M, LocalSnapshotStore>;

/// Runner persisting snapshots as remote checkpoints.
pub type RemoteSearchRunner<S, M, C> = SearchRunner<S, M, RemoteSnapshotStore<C>>;

/// Label recording which variant created an experiment.
pub const RUNNER_LABEL: &str = "search_runner";

/// Build a runner whose state lives in `state_dir`.
pub fn local_runner<S, M>(
    service: S,
    method: M,
    state_dir: impl AsRef<Path>,
    mut config: RunnerConfig,
) -> HsResult<LocalSearchRunner<S, M>>
where
    S: ExperimentService,
    M: SearchMethod,
{
    let store = LocalSnapshotStore::open(state_dir.as_ref())?;
    info!(state_dir = %state_dir.as_ref().display(), "using local searcher state");
    config
        .experiment
        .labels
        .insert(RUNNER_LABEL.to_string(), "local".to_string());
    Ok(SearchRunner::new(service, method, store, config))
}

/// Build a runner whose state is uploaded through `storage`.
pub fn remote_runner<S, M, C>(
    service: S,
    method: M,
    storage: C,
    mut config: RunnerConfig,
) -> RemoteSearchRunner<S, M, C>
where
    S: ExperimentService,
    M: SearchMethod,
    C: CheckpointStorage,
{
    config
        .experiment
        .labels
        .insert(RUNNER_LABEL.to_string(), "remote".to_string());
    if config.experiment.description.is_none() {
        config.experiment.description =
            Some(format!("{} (searcher state kept in remote checkpoints)", config.experiment.name));
    }
    SearchRunner::new(service, method, RemoteSnapshotStore::new(storage), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::StopReason;
    use crate::simulated::SimulatedExperimentService;
    use crate::store::{InMemoryCheckpointStorage, SnapshotStore};
    use hs_optimizer::{RandomConfig, RandomSearchMethod, SearchSpace};
    use std::time::Duration;
    use tempfile::tempdir;

    fn random_search() -> RandomSearchMethod {
        let space = SearchSpace::new().add_log_uniform("learning_rate", 1e-4, 1e-1);
        RandomSearchMethod::new(
            RandomConfig::new(500, space)
                .with_max_trials(6)
                .with_max_concurrent_trials(2)
                .with_seed(3),
        )
        .unwrap()
    }

    fn config() -> RunnerConfig {
        RunnerConfig::default().with_poll_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_local_runner_labels_and_persists() {
        let dir = tempdir().unwrap();
        let service = SimulatedExperimentService::default();
        let mut runner = local_runner(service.clone(), random_search(), dir.path(), config()).unwrap();

        let outcome = runner.run().await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Shutdown { failed: false });
        assert_eq!(service.trial_count(), 6);
        assert_eq!(service.max_batches_processed(), 500);
        assert_eq!(
            runner.config().experiment.labels.get(RUNNER_LABEL).map(String::as_str),
            Some("local")
        );
        assert!(dir.path().join("latest").exists());
    }

    #[tokio::test]
    async fn test_remote_runner_resumes_from_latest_checkpoint() {
        let storage = InMemoryCheckpointStorage::new();
        let service = SimulatedExperimentService::default();

        let mut first = remote_runner(service.clone(), random_search(), storage.clone(), config());
        first.run().await.unwrap();
        let uploads = storage.uploads();
        assert!(uploads > 0);
        assert!(first.config().experiment.description.is_some());

        let mut second = remote_runner(service.clone(), random_search(), storage.clone(), config());
        let outcome = second.run().await.unwrap();
        assert!(outcome.resumed);
        assert_eq!(outcome.stop_reason, StopReason::AlreadyCompleted);
        assert_eq!(storage.uploads(), uploads);

        let latest = second.store().load_latest().await.unwrap().unwrap();
        assert!(latest.state().experiment_completed);
        assert_eq!(latest.state().trials_closed.len(), 6);
    }
}
