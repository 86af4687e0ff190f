//! Search space definitions and deterministic per-trial sampling.

use hs_types::{AlgorithmError, AlgorithmResult, HparamValue, Hparams, RequestId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Human-readable parameter name (e.g. "learning_rate").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

/// The full set of tunable parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    /// Check every range can actually be sampled.
    pub fn validate(&self) -> AlgorithmResult<()> {
        for param in &self.parameters {
            let ok = match &param.kind {
                ParameterKind::FloatRange { low, high } => low.is_finite() && high.is_finite() && low <= high,
                ParameterKind::IntRange { low, high } => low <= high,
                ParameterKind::LogUniform { low, high } => *low > 0.0 && low <= high && high.is_finite(),
                ParameterKind::Choice { values } => !values.is_empty(),
            };
            if !ok {
                return Err(AlgorithmError::InvalidConfig {
                    message: format!("parameter '{}' has an empty or invalid range", param.name),
                });
            }
        }
        Ok(())
    }

    /// Draw one assignment for every parameter.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Hparams {
        let mut params = Hparams::new();

        for param in &self.parameters {
            let value = match &param.kind {
                ParameterKind::FloatRange { low, high } => {
                    HparamValue::Double(rng.gen_range(*low..=*high))
                }
                ParameterKind::IntRange { low, high } => {
                    HparamValue::Int(rng.gen_range(*low..=*high))
                }
                ParameterKind::LogUniform { low, high } => {
                    let log_low = low.ln();
                    let log_high = high.ln();
                    let log_val: f64 = rng.gen_range(log_low..=log_high);
                    HparamValue::Double(log_val.exp().clamp(*low, *high))
                }
                ParameterKind::Choice { values } => {
                    let idx = rng.gen_range(0..values.len());
                    HparamValue::Categorical(values[idx].clone())
                }
            };
            params.insert(param.name.clone(), value);
        }

        params
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a `Create` operation needs for one trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialDraw {
    pub request_id: RequestId,
    pub trial_seed: u32,
    pub hparams: Hparams,
}

/// Samples trials as a pure function of `(seed, trial_index)`.
///
/// Replaying a search method from the same persisted state therefore yields
/// the same request ids and hyperparameters, which is what lets the remote
/// service deduplicate resubmitted operations.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialSampler {
    space: SearchSpace,
    seed: u64,
}

impl TrialSampler {
    pub fn new(space: SearchSpace, seed: u64) -> Self {
        Self { space, seed }
    }

    pub fn draw(&self, trial_index: u64) -> TrialDraw {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(trial_index));
        let request_id = uuid::Builder::from_random_bytes(rng.gen::<[u8; 16]>()).into_uuid();
        let trial_seed = rng.gen_range(0..i32::MAX as u32);
        let hparams = self.space.sample(&mut rng);
        TrialDraw {
            request_id,
            trial_seed,
            hparams,
        }
    }
}
