//! The pluggable search method interface.

use hs_types::{
    AlgorithmError, AlgorithmResult, ExitedReason, Operation, RequestId, SearcherState,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io::{Read, Write};

/// Whether we are maximizing or minimizing the searcher metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Minimize
    }
}

impl ObjectiveDirection {
    /// Order two metrics so that the better one sorts first. NaN sorts last.
    pub fn compare(&self, a: f64, b: f64) -> Ordering {
        match (a.is_nan(), b.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => match self {
                ObjectiveDirection::Minimize => a.total_cmp(&b),
                ObjectiveDirection::Maximize => b.total_cmp(&a),
            },
        }
    }
}

/// A custom hyperparameter search algorithm driven by the search runner.
///
/// Every callback receives the runner's [`SearcherState`] after the triggering
/// event has been applied to it. Callbacks must be deterministic functions of
/// the event and the method's own state and must not perform I/O: after a
/// crash the runner replays uncommitted events against the last persisted
/// method state and expects the exact same operations back.
pub trait SearchMethod: Send {
    /// Human-readable method name, recorded next to persisted state.
    fn name(&self) -> &str;

    /// Operations that start a fresh search. Called once per experiment.
    fn initial_operations(&mut self, state: &SearcherState) -> AlgorithmResult<Vec<Operation>>;

    fn on_trial_created(
        &mut self,
        _state: &SearcherState,
        _request_id: RequestId,
    ) -> AlgorithmResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn on_validation_completed(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
        metric: f64,
        length: u64,
    ) -> AlgorithmResult<Vec<Operation>>;

    fn on_trial_closed(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
    ) -> AlgorithmResult<Vec<Operation>>;

    fn on_trial_exited_early(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> AlgorithmResult<Vec<Operation>>;

    /// Overall search progress in [0, 1].
    fn progress(&self, state: &SearcherState) -> f64;

    /// Serialize every mutable field needed to reproduce future decisions.
    fn save_state(&self, writer: &mut dyn Write) -> AlgorithmResult<()>;

    /// Restore state written by [`SearchMethod::save_state`].
    fn load_state(&mut self, reader: &mut dyn Read) -> AlgorithmResult<()>;
}

impl<M: SearchMethod + ?Sized> SearchMethod for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn initial_operations(&mut self, state: &SearcherState) -> AlgorithmResult<Vec<Operation>> {
        (**self).initial_operations(state)
    }

    fn on_trial_created(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
    ) -> AlgorithmResult<Vec<Operation>> {
        (**self).on_trial_created(state, request_id)
    }

    fn on_validation_completed(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
        metric: f64,
        length: u64,
    ) -> AlgorithmResult<Vec<Operation>> {
        (**self).on_validation_completed(state, request_id, metric, length)
    }

    fn on_trial_closed(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
    ) -> AlgorithmResult<Vec<Operation>> {
        (**self).on_trial_closed(state, request_id)
    }

    fn on_trial_exited_early(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> AlgorithmResult<Vec<Operation>> {
        (**self).on_trial_exited_early(state, request_id, reason)
    }

    fn progress(&self, state: &SearcherState) -> f64 {
        (**self).progress(state)
    }

    fn save_state(&self, writer: &mut dyn Write) -> AlgorithmResult<()> {
        (**self).save_state(writer)
    }

    fn load_state(&mut self, reader: &mut dyn Read) -> AlgorithmResult<()> {
        (**self).load_state(reader)
    }
}

#[derive(Serialize, Deserialize)]
struct VersionedState<T> {
    method: String,
    version: u32,
    state: T,
}

/// Write `state` wrapped with the method name and schema version.
pub fn write_versioned<T: Serialize>(
    writer: &mut dyn Write,
    method: &str,
    version: u32,
    state: &T,
) -> AlgorithmResult<()> {
    let envelope = VersionedState {
        method: method.to_string(),
        version,
        state,
    };
    serde_json::to_writer(writer, &envelope).map_err(|e| AlgorithmError::State {
        message: format!("failed to serialize {method} state: {e}"),
    })
}

/// Read state written by [`write_versioned`], rejecting other methods and versions.
pub fn read_versioned<T: DeserializeOwned>(
    reader: &mut dyn Read,
    method: &str,
    version: u32,
) -> AlgorithmResult<T> {
    let envelope: VersionedState<serde_json::Value> =
        serde_json::from_reader(reader).map_err(|e| AlgorithmError::State {
            message: format!("failed to read {method} state: {e}"),
        })?;
    if envelope.method != method {
        return Err(AlgorithmError::State {
            message: format!(
                "state was written by search method '{}', not '{method}'",
                envelope.method
            ),
        });
    }
    if envelope.version != version {
        return Err(AlgorithmError::StateVersion {
            expected: version,
            found: envelope.version,
        });
    }
    serde_json::from_value(envelope.state).map_err(|e| AlgorithmError::State {
        message: format!("failed to decode {method} state: {e}"),
    })
}

/// Serde form for validation metrics in saved state.
///
/// JSON has no NaN or infinity, so non-finite metrics are written as the
/// strings `"NaN"`, `"inf"` and `"-inf"`; finite metrics stay plain numbers.
pub mod metric_format {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Finite(f64),
        NonFinite(String),
    }

    pub fn serialize<S: Serializer>(metric: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if metric.is_finite() {
            serializer.serialize_f64(*metric)
        } else if metric.is_nan() {
            serializer.serialize_str("NaN")
        } else if metric.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Finite(metric) => Ok(metric),
            Repr::NonFinite(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid metric {other:?}"))),
            },
        }
    }
}
