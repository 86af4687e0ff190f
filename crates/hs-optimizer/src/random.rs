//! Random search: every trial trains straight to `max_length`.

use hs_types::{
    AlgorithmError, AlgorithmResult, ExitedReason, Operation, RequestId, SearcherState,
    ValidationUnit,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::{Read, Write};

use crate::method::{read_versioned, write_versioned, SearchMethod};
use crate::space::{SearchSpace, TrialSampler};

const METHOD_NAME: &str = "random";
const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomConfig {
    pub max_length: u64,
    pub unit: ValidationUnit,
    pub max_trials: usize,
    pub max_concurrent_trials: usize,
    pub seed: u64,
    pub search_space: SearchSpace,
}

impl RandomConfig {
    pub fn new(max_length: u64, search_space: SearchSpace) -> Self {
        Self {
            max_length,
            unit: ValidationUnit::Batches,
            max_trials: 16,
            max_concurrent_trials: 4,
            seed: 0,
            search_space,
        }
    }

    pub fn with_max_trials(mut self, n: usize) -> Self {
        self.max_trials = n;
        self
    }

    pub fn with_max_concurrent_trials(mut self, n: usize) -> Self {
        self.max_concurrent_trials = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RandomState {
    trials_issued: u64,
    open: BTreeSet<RequestId>,
    released: BTreeSet<RequestId>,
    initialized: bool,
    shutdown_emitted: bool,
}

/// Independent random sampling with a fixed training budget per trial.
#[derive(Debug, Clone)]
pub struct RandomSearchMethod {
    config: RandomConfig,
    sampler: TrialSampler,
    state: RandomState,
}

impl RandomSearchMethod {
    pub fn new(config: RandomConfig) -> AlgorithmResult<Self> {
        if config.max_length == 0 || config.max_trials == 0 || config.max_concurrent_trials == 0 {
            return Err(AlgorithmError::InvalidConfig {
                message: "max_length, max_trials and max_concurrent_trials must be positive"
                    .into(),
            });
        }
        config.search_space.validate()?;
        let sampler = TrialSampler::new(config.search_space.clone(), config.seed);
        Ok(Self {
            config,
            sampler,
            state: RandomState::default(),
        })
    }

    fn create_trial(&mut self, ops: &mut Vec<Operation>) {
        let draw = self.sampler.draw(self.state.trials_issued);
        self.state.trials_issued += 1;
        self.state.open.insert(draw.request_id);
        ops.push(Operation::Create {
            request_id: draw.request_id,
            trial_seed: draw.trial_seed,
            hparams: draw.hparams,
            checkpoint: None,
        });
        ops.push(Operation::ValidateAfter {
            request_id: draw.request_id,
            length: self.config.max_length,
            unit: self.config.unit,
        });
    }

    fn release_slot(&mut self, state: &SearcherState, request_id: RequestId) -> Vec<Operation> {
        self.state.open.remove(&request_id);
        let mut ops = Vec::new();
        if self.state.released.insert(request_id)
            && (self.state.trials_issued as usize) < self.config.max_trials
        {
            self.create_trial(&mut ops);
        }
        if !self.state.shutdown_emitted && state.trials_closed.len() >= self.config.max_trials {
            self.state.shutdown_emitted = true;
            ops.push(Operation::Shutdown {
                failed: state.failures.len() >= self.config.max_trials,
            });
        }
        ops
    }
}

impl SearchMethod for RandomSearchMethod {
    fn name(&self) -> &str {
        METHOD_NAME
    }

    fn initial_operations(&mut self, _state: &SearcherState) -> AlgorithmResult<Vec<Operation>> {
        if self.state.initialized {
            return Err(AlgorithmError::State {
                message: "initial operations requested twice".into(),
            });
        }
        self.state.initialized = true;
        let mut ops = Vec::new();
        for _ in 0..self.config.max_concurrent_trials.min(self.config.max_trials) {
            self.create_trial(&mut ops);
        }
        Ok(ops)
    }

    fn on_validation_completed(
        &mut self,
        _state: &SearcherState,
        request_id: RequestId,
        _metric: f64,
        length: u64,
    ) -> AlgorithmResult<Vec<Operation>> {
        if length >= self.config.max_length && self.state.open.contains(&request_id) {
            return Ok(vec![Operation::Close { request_id }]);
        }
        Ok(Vec::new())
    }

    fn on_trial_closed(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
    ) -> AlgorithmResult<Vec<Operation>> {
        Ok(self.release_slot(state, request_id))
    }

    fn on_trial_exited_early(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
        _reason: ExitedReason,
    ) -> AlgorithmResult<Vec<Operation>> {
        Ok(self.release_slot(state, request_id))
    }

    fn progress(&self, state: &SearcherState) -> f64 {
        (state.trials_closed.len() as f64 / self.config.max_trials as f64).clamp(0.0, 1.0)
    }

    fn save_state(&self, writer: &mut dyn Write) -> AlgorithmResult<()> {
        write_versioned(writer, METHOD_NAME, STATE_VERSION, &self.state)
    }

    fn load_state(&mut self, reader: &mut dyn Read) -> AlgorithmResult<()> {
        self.state = read_versioned(reader, METHOD_NAME, STATE_VERSION)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(max_trials: usize) -> RandomSearchMethod {
        let space = SearchSpace::new().add_float("dropout", 0.0, 0.5);
        RandomSearchMethod::new(
            RandomConfig::new(100, space)
                .with_max_trials(max_trials)
                .with_max_concurrent_trials(2),
        )
        .unwrap()
    }

    #[test]
    fn trials_train_to_max_length_then_close() {
        let mut m = method(3);
        let state = SearcherState::new(1);
        let ops = m.initial_operations(&state).unwrap();
        assert_eq!(ops.len(), 4);
        let first = ops[0].request_id().unwrap();

        assert!(m.on_validation_completed(&state, first, 0.3, 50).unwrap().is_empty());
        assert_eq!(
            m.on_validation_completed(&state, first, 0.3, 100).unwrap(),
            vec![Operation::Close { request_id: first }]
        );
    }

    #[test]
    fn replacements_stop_at_max_trials_and_shutdown_once() {
        let mut m = method(3);
        let mut state = SearcherState::new(1);
        let ids: Vec<RequestId> = m
            .initial_operations(&state)
            .unwrap()
            .iter()
            .filter_map(|op| match op {
                Operation::Create { request_id, .. } => Some(*request_id),
                _ => None,
            })
            .collect();

        state.record_created(ids[0]);
        state.record_closed(ids[0]);
        let ops = m.on_trial_closed(&state, ids[0]).unwrap();
        let third = ops[0].request_id().unwrap();
        assert!(matches!(ops[0], Operation::Create { .. }));

        state.record_created(ids[1]);
        state.record_closed(ids[1]);
        assert!(m.on_trial_closed(&state, ids[1]).unwrap().is_empty());

        state.record_created(third);
        state.record_failure(third);
        let ops = m
            .on_trial_exited_early(&state, third, ExitedReason::Errored)
            .unwrap();
        assert_eq!(ops, vec![Operation::Shutdown { failed: false }]);

        assert!(m.on_trial_closed(&state, third).unwrap().is_empty());
    }

    #[test]
    fn state_round_trips_through_save_and_load() {
        let mut m = method(5);
        let state = SearcherState::new(1);
        m.initial_operations(&state).unwrap();

        let mut buf = Vec::new();
        m.save_state(&mut buf).unwrap();
        let mut restored = method(5);
        restored.load_state(&mut buf.as_slice()).unwrap();
        assert_eq!(restored.state, m.state);
    }
}
