//! # hs-optimizer
//!
//! Search methods for the hyperparameter search runner.
//!
//! Provides search space definitions with deterministic per-trial sampling, the
//! [`SearchMethod`] trait the runner drives, and two implementations:
//! asynchronous successive halving ([`AshaSearchMethod`]) and plain random
//! search ([`RandomSearchMethod`]).

mod asha;
mod method;
mod random;
mod space;

pub use asha::{AshaConfig, AshaSearchMethod, Rung, RungEntry, TrialPhase, TrialRecord};
pub use method::{read_versioned, write_versioned, ObjectiveDirection, SearchMethod};
pub use random::{RandomConfig, RandomSearchMethod};
pub use space::{ParameterDef, ParameterKind, SearchSpace, TrialDraw, TrialSampler};
