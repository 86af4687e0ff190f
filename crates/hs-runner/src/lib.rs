//! Crash-resumable search runner.
//!
//! Drives a [`hs_optimizer::SearchMethod`] against a remote experiment
//! service, committing searcher and method state after every event so a
//! restarted process picks up exactly where the last commit left off.

pub mod retry;
pub mod runner;
pub mod service;
pub mod simulated;
pub mod store;
pub mod variants;

pub use retry::RetryPolicy;
pub use runner::{RunOutcome, RunnerConfig, RunnerPhase, SearchRunner, StopReason};
pub use service::{ExperimentConfig, ExperimentService};
pub use simulated::{FaultPlan, ObjectiveFn, SimulatedExperimentService, SimulatedTrial};
pub use store::{
    CheckpointStorage, InMemoryCheckpointStorage, LocalSnapshotStore, RemoteSnapshotStore,
    RunnerSnapshot, SnapshotHandle, SnapshotStore,
};
pub use variants::{local_runner, remote_runner, LocalSearchRunner, RemoteSearchRunner};
