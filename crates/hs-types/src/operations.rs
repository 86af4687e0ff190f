use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifies one trial's lifecycle across resubmissions
pub type RequestId = Uuid;

/// Sampled hyperparameters keyed by name. Ordered so serialized state is stable.
pub type Hparams = BTreeMap<String, HparamValue>;

/// A sampled hyperparameter assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum HparamValue {
    Int(i64),
    Double(f64),
    Categorical(serde_json::Value),
}

impl fmt::Display for HparamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HparamValue::Int(v) => write!(f, "{v}"),
            HparamValue::Double(v) => write!(f, "{v}"),
            HparamValue::Categorical(v) => write!(f, "{v}"),
        }
    }
}

/// Unit in which training length is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationUnit {
    Batches,
    Records,
    Epochs,
}

impl fmt::Display for ValidationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationUnit::Batches => "batches",
            ValidationUnit::Records => "records",
            ValidationUnit::Epochs => "epochs",
        };
        f.write_str(s)
    }
}

/// Reference to a stored checkpoint a new trial warm-starts from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub uuid: Uuid,
}

/// Command emitted by a search method and applied by the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Create {
        request_id: RequestId,
        trial_seed: u32,
        hparams: Hparams,
        checkpoint: Option<CheckpointRef>,
    },
    ValidateAfter {
        request_id: RequestId,
        length: u64,
        unit: ValidationUnit,
    },
    SetSearcherProgress {
        progress: f64,
    },
    Close {
        request_id: RequestId,
    },
    Shutdown {
        failed: bool,
    },
}

impl Operation {
    /// Request id the operation targets, if it is trial-scoped.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Operation::Create { request_id, .. }
            | Operation::ValidateAfter { request_id, .. }
            | Operation::Close { request_id } => Some(*request_id),
            Operation::SetSearcherProgress { .. } | Operation::Shutdown { .. } => None,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Operation::Shutdown { .. })
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::ValidateAfter { .. } => "validate_after",
            Operation::SetSearcherProgress { .. } => "set_searcher_progress",
            Operation::Close { .. } => "close",
            Operation::Shutdown { .. } => "shutdown",
        }
    }

    /// Reject operations no remote service would accept.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Operation::SetSearcherProgress { progress } => {
                if !(0.0..=1.0).contains(progress) {
                    return Err(format!("searcher progress {progress} outside [0, 1]"));
                }
            }
            Operation::ValidateAfter {
                request_id, length, ..
            } => {
                if *length == 0 {
                    return Err(format!("validate_after for {request_id} has zero length"));
                }
            }
            Operation::Create { .. } | Operation::Close { .. } | Operation::Shutdown { .. } => {}
        }
        Ok(())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create { request_id, .. } => write!(f, "Create({request_id})"),
            Operation::ValidateAfter {
                request_id,
                length,
                unit,
            } => write!(f, "ValidateAfter({request_id}, {length} {unit})"),
            Operation::SetSearcherProgress { progress } => {
                write!(f, "SetSearcherProgress({progress:.3})")
            }
            Operation::Close { request_id } => write!(f, "Close({request_id})"),
            Operation::Shutdown { failed } => write!(f, "Shutdown(failed={failed})"),
        }
    }
}
