//! Remote experiment service abstraction.

use async_trait::async_trait;
use hs_types::{EventId, ExperimentId, Operation, SearcherEvent, ServiceResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Describes the outer experiment the runner creates on a fresh start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub description: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "custom-search".to_string(),
            description: None,
            labels: BTreeMap::new(),
        }
    }
}

impl ExperimentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// The remote distributed training service.
///
/// Implementations may wrap a real experiment-management API or simulate one
/// in process (see [`crate::simulated::SimulatedExperimentService`]). The
/// service must treat a resubmitted operation whose `request_id` it already
/// applied as a no-op.
#[async_trait]
pub trait ExperimentService: Send + Sync {
    /// Create the outer experiment and return its id.
    async fn create_experiment(&mut self, config: &ExperimentConfig)
        -> ServiceResult<ExperimentId>;

    /// All events with `id > after_id`, in ascending id order.
    async fn fetch_events(
        &mut self,
        experiment_id: ExperimentId,
        after_id: EventId,
    ) -> ServiceResult<Vec<SearcherEvent>>;

    /// Apply the operations produced while handling `triggered_by`.
    async fn submit_operations(
        &mut self,
        experiment_id: ExperimentId,
        triggered_by: EventId,
        operations: &[Operation],
    ) -> ServiceResult<()>;
}
