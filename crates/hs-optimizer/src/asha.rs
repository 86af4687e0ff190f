//! Asynchronous successive halving.
//!
//! Trials climb a ladder of rungs with geometrically increasing training
//! lengths. At every rung roughly one in `divisor` trials is promoted to the
//! next rung and the rest are closed, so compute concentrates on the most
//! promising hyperparameters while at most `max_concurrent_trials` trials are
//! open at any time.
//!
//! Promotion decisions at a rung are taken in batches: once `divisor` trials
//! are waiting at a rung, the number of promotions owed is recomputed from the
//! cumulative count of reports (`reports / divisor` minus promotions already
//! made). A waiting trial takes one of those slots only if its metric ranks in
//! the top `1/divisor` of every report at the rung so far. When no open trial is
//! training anymore every waiting trial would otherwise wait forever, so all
//! waiting trials are decided immediately with whatever reports exist.

use hs_types::{
    AlgorithmError, AlgorithmResult, ExitedReason, Hparams, Operation, RequestId, SearcherState,
    ValidationUnit,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use tracing::debug;

use crate::method::{
    metric_format, read_versioned, write_versioned, ObjectiveDirection, SearchMethod,
};
use crate::space::{SearchSpace, TrialSampler};

const METHOD_NAME: &str = "asha";
const STATE_VERSION: u32 = 1;

/// Configuration for an ASHA search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AshaConfig {
    /// Training length of the last rung.
    pub max_length: u64,
    pub unit: ValidationUnit,
    pub max_trials: usize,
    pub max_concurrent_trials: usize,
    pub num_rungs: usize,
    pub divisor: u64,
    pub direction: ObjectiveDirection,
    /// Base seed for trial sampling.
    pub seed: u64,
    pub search_space: SearchSpace,
}

impl AshaConfig {
    pub fn new(max_length: u64, search_space: SearchSpace) -> Self {
        Self {
            max_length,
            unit: ValidationUnit::Batches,
            max_trials: 16,
            max_concurrent_trials: 4,
            num_rungs: 3,
            divisor: 4,
            direction: ObjectiveDirection::Minimize,
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

    pub fn with_rungs(mut self, num_rungs: usize, divisor: u64) -> Self {
        self.num_rungs = num_rungs;
        self.divisor = divisor;
        self
    }

    pub fn with_unit(mut self, unit: ValidationUnit) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Training length of every rung, shortest first. The last always equals
    /// `max_length`.
    pub fn rung_lengths(&self) -> AlgorithmResult<Vec<u64>> {
        let invalid = |message: String| AlgorithmError::InvalidConfig { message };
        if self.num_rungs == 0 {
            return Err(invalid("num_rungs must be at least 1".into()));
        }
        if self.divisor < 2 {
            return Err(invalid(format!("divisor must be at least 2, got {}", self.divisor)));
        }

        (0..self.num_rungs)
            .map(|i| {
                let exponent = (self.num_rungs - 1 - i) as u32;
                let scale = self.divisor.checked_pow(exponent).ok_or_else(|| {
                    invalid(format!("divisor^{exponent} overflows"))
                })?;
                let length = self.max_length / scale;
                if length == 0 {
                    return Err(invalid(format!(
                        "max_length {} is too short for {} rungs with divisor {}",
                        self.max_length, self.num_rungs, self.divisor
                    )));
                }
                Ok(length)
            })
            .collect()
    }

    pub fn validate(&self) -> AlgorithmResult<()> {
        if self.max_trials == 0 || self.max_concurrent_trials == 0 {
            return Err(AlgorithmError::InvalidConfig {
                message: "max_trials and max_concurrent_trials must be positive".into(),
            });
        }
        self.search_space.validate()?;
        self.rung_lengths().map(|_| ())
    }
}

/// One report at a rung.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RungEntry {
    #[serde(with = "metric_format")]
    pub metric: f64,
    pub request_id: RequestId,
}

/// One training-length checkpoint in the halving ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rung {
    pub index: usize,
    pub length: u64,
    /// Append-only, in arrival order.
    pub reported: Vec<RungEntry>,
    /// Trials that reported here and still await a promotion decision.
    pub waiting: Vec<RequestId>,
    pub promoted: usize,
}

impl Rung {
    fn new(index: usize, length: u64) -> Self {
        Self {
            index,
            length,
            reported: Vec::new(),
            waiting: Vec::new(),
            promoted: 0,
        }
    }

    /// Promotions owed by the cumulative report count.
    fn promotions_owed(&self, divisor: u64) -> usize {
        (self.reported.len() / divisor as usize).saturating_sub(self.promoted)
    }

    /// Latest report of `request_id` at this rung, as (arrival position, metric).
    fn report_of(&self, request_id: RequestId) -> Option<(usize, f64)> {
        self.reported
            .iter()
            .enumerate()
            .rev()
            .find(|(_, entry)| entry.request_id == request_id)
            .map(|(pos, entry)| (pos, entry.metric))
    }

    /// Arrival positions of the reports ranking in the top `1/divisor` of
    /// everything reported here so far. Ties go to the earlier arrival.
    fn top_positions(&self, divisor: u64, direction: ObjectiveDirection) -> BTreeSet<usize> {
        let mut order: Vec<usize> = (0..self.reported.len()).collect();
        order.sort_by(|&a, &b| {
            direction
                .compare(self.reported[a].metric, self.reported[b].metric)
                .then(a.cmp(&b))
        });
        order.truncate(self.reported.len() / divisor as usize);
        order.into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialPhase {
    /// Has an outstanding `ValidateAfter`.
    Training,
    /// Reported at its rung, decision pending.
    Waiting,
    Closed,
}

/// Bookkeeping for one trial, kept until the search ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub request_id: RequestId,
    pub trial_index: u64,
    pub hparams: Hparams,
    pub current_rung: usize,
    pub phase: TrialPhase,
    /// Whether a replacement trial has been started for this one.
    pub slot_released: bool,
}

impl TrialRecord {
    pub fn closed(&self) -> bool {
        self.phase == TrialPhase::Closed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AshaState {
    rungs: Vec<Rung>,
    trials: BTreeMap<RequestId, TrialRecord>,
    trials_issued: u64,
    initialized: bool,
    shutdown_emitted: bool,
}

/// Asynchronous successive halving search method.
#[derive(Debug, Clone)]
pub struct AshaSearchMethod {
    config: AshaConfig,
    sampler: TrialSampler,
    state: AshaState,
}

impl AshaSearchMethod {
    pub fn new(config: AshaConfig) -> AlgorithmResult<Self> {
        config.validate()?;
        let rungs = config
            .rung_lengths()?
            .into_iter()
            .enumerate()
            .map(|(index, length)| Rung::new(index, length))
            .collect();
        let sampler = TrialSampler::new(config.search_space.clone(), config.seed);

        Ok(Self {
            config,
            sampler,
            state: AshaState {
                rungs,
                trials: BTreeMap::new(),
                trials_issued: 0,
                initialized: false,
                shutdown_emitted: false,
            },
        })
    }

    pub fn config(&self) -> &AshaConfig {
        &self.config
    }

    pub fn rungs(&self) -> &[Rung] {
        &self.state.rungs
    }

    pub fn trial(&self, request_id: &RequestId) -> Option<&TrialRecord> {
        self.state.trials.get(request_id)
    }

    pub fn trials_issued(&self) -> u64 {
        self.state.trials_issued
    }

    fn last_rung(&self) -> usize {
        self.state.rungs.len() - 1
    }

    fn validate_after(&self, request_id: RequestId, rung: usize) -> Operation {
        Operation::ValidateAfter {
            request_id,
            length: self.state.rungs[rung].length,
            unit: self.config.unit,
        }
    }

    fn create_trial(&mut self, ops: &mut Vec<Operation>) {
        let trial_index = self.state.trials_issued;
        let draw = self.sampler.draw(trial_index);
        self.state.trials_issued += 1;

        debug!(request_id = %draw.request_id, trial_index, "creating trial");
        self.state.trials.insert(
            draw.request_id,
            TrialRecord {
                request_id: draw.request_id,
                trial_index,
                hparams: draw.hparams.clone(),
                current_rung: 0,
                phase: TrialPhase::Training,
                slot_released: false,
            },
        );
        ops.push(Operation::Create {
            request_id: draw.request_id,
            trial_seed: draw.trial_seed,
            hparams: draw.hparams,
            checkpoint: None,
        });
        ops.push(self.validate_after(draw.request_id, 0));
    }

    fn close_trial(&mut self, request_id: RequestId, ops: &mut Vec<Operation>) {
        if let Some(record) = self.state.trials.get_mut(&request_id) {
            record.phase = TrialPhase::Closed;
        }
        ops.push(Operation::Close { request_id });
    }

    /// Promote waiting trials that rank in the top `1/divisor` of the rung, up
    /// to the promotions owed, and close the rest.
    fn decide_rung(&mut self, rung_idx: usize, ops: &mut Vec<Operation>) {
        let direction = self.config.direction;
        let divisor = self.config.divisor;
        let rung = &mut self.state.rungs[rung_idx];
        let owed = rung.promotions_owed(divisor);
        let top = rung.top_positions(divisor, direction);

        let waiting = std::mem::take(&mut rung.waiting);
        let mut candidates: Vec<(usize, f64, RequestId)> = waiting
            .into_iter()
            .filter_map(|id| rung.report_of(id).map(|(pos, metric)| (pos, metric, id)))
            .collect();
        candidates.sort_by(|a, b| direction.compare(a.1, b.1).then(a.0.cmp(&b.0)));

        let mut promote_count = 0;
        let decisions: Vec<(f64, RequestId, bool)> = candidates
            .into_iter()
            .map(|(pos, metric, request_id)| {
                let promote = promote_count < owed && top.contains(&pos);
                if promote {
                    promote_count += 1;
                }
                (metric, request_id, promote)
            })
            .collect();
        rung.promoted += promote_count;

        for (metric, request_id, promote) in decisions {
            if promote {
                let next = rung_idx + 1;
                if let Some(record) = self.state.trials.get_mut(&request_id) {
                    record.current_rung = next;
                    record.phase = TrialPhase::Training;
                }
                debug!(%request_id, metric, rung = next, "promoting trial");
                ops.push(self.validate_after(request_id, next));
            } else {
                debug!(%request_id, metric, rung = rung_idx, "stopping trial");
                self.close_trial(request_id, ops);
            }
        }
    }

    /// Decide every waiting trial once no training trial or pending replacement
    /// can add reports anymore.
    fn flush_if_stalled(&mut self, ops: &mut Vec<Operation>) {
        let can_create = (self.state.trials_issued as usize) < self.config.max_trials;
        let in_flight = self.state.trials.values().any(|t| {
            t.phase == TrialPhase::Training || (can_create && t.closed() && !t.slot_released)
        });
        if in_flight {
            return;
        }
        for rung_idx in 0..self.state.rungs.len() {
            if !self.state.rungs[rung_idx].waiting.is_empty() {
                debug!(rung = rung_idx, "no trial in flight, deciding waiting trials");
                self.decide_rung(rung_idx, ops);
            }
        }
    }

    /// Start a replacement for a finished trial and detect the end of the search.
    fn release_slot(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
    ) -> AlgorithmResult<Vec<Operation>> {
        let record = self
            .state
            .trials
            .get_mut(&request_id)
            .ok_or(AlgorithmError::UnknownTrial { request_id })?;
        record.phase = TrialPhase::Closed;
        let already_released = std::mem::replace(&mut record.slot_released, true);

        let mut ops = Vec::new();
        if !already_released && (self.state.trials_issued as usize) < self.config.max_trials {
            self.create_trial(&mut ops);
        }

        if !self.state.shutdown_emitted && state.trials_closed.len() >= self.config.max_trials {
            self.state.shutdown_emitted = true;
            let failed = state.failures.len() >= self.config.max_trials;
            ops.push(Operation::Shutdown { failed });
        } else {
            self.flush_if_stalled(&mut ops);
        }
        Ok(ops)
    }
}

impl SearchMethod for AshaSearchMethod {
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

        let count = self.config.max_concurrent_trials.min(self.config.max_trials);
        let mut ops = Vec::with_capacity(count * 2);
        for _ in 0..count {
            self.create_trial(&mut ops);
        }
        Ok(ops)
    }

    fn on_validation_completed(
        &mut self,
        _state: &SearcherState,
        request_id: RequestId,
        metric: f64,
        length: u64,
    ) -> AlgorithmResult<Vec<Operation>> {
        let record = self
            .state
            .trials
            .get_mut(&request_id)
            .ok_or(AlgorithmError::UnknownTrial { request_id })?;
        if record.phase != TrialPhase::Training {
            debug!(%request_id, length, "ignoring validation for trial not in training");
            return Ok(Vec::new());
        }
        let rung_idx = record.current_rung;
        record.phase = TrialPhase::Waiting;

        let last_rung = self.last_rung();
        let rung = &mut self.state.rungs[rung_idx];
        rung.reported.push(RungEntry { metric, request_id });

        let mut ops = Vec::new();
        if rung_idx == last_rung {
            self.close_trial(request_id, &mut ops);
        } else {
            rung.waiting.push(request_id);
            if rung.waiting.len() as u64 >= self.config.divisor {
                self.decide_rung(rung_idx, &mut ops);
            }
        }
        self.flush_if_stalled(&mut ops);
        Ok(ops)
    }

    fn on_trial_closed(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
    ) -> AlgorithmResult<Vec<Operation>> {
        self.release_slot(state, request_id)
    }

    fn on_trial_exited_early(
        &mut self,
        state: &SearcherState,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> AlgorithmResult<Vec<Operation>> {
        debug!(%request_id, ?reason, "trial exited early");
        for rung in &mut self.state.rungs {
            rung.waiting.retain(|id| *id != request_id);
        }
        self.release_slot(state, request_id)
    }

    fn progress(&self, state: &SearcherState) -> f64 {
        let max_length = self.config.max_length as f64;
        let partial: f64 = state
            .trial_progress
            .values()
            .map(|units| (units / max_length).clamp(0.0, 1.0))
            .sum();
        let done = state.trials_closed.len() as f64 + partial;
        (done / self.config.max_trials as f64).clamp(0.0, 1.0)
    }

    fn save_state(&self, writer: &mut dyn Write) -> AlgorithmResult<()> {
        write_versioned(writer, METHOD_NAME, STATE_VERSION, &self.state)
    }

    fn load_state(&mut self, reader: &mut dyn Read) -> AlgorithmResult<()> {
        let state: AshaState = read_versioned(reader, METHOD_NAME, STATE_VERSION)?;
        let saved: Vec<u64> = state.rungs.iter().map(|r| r.length).collect();
        let configured: Vec<u64> = self.state.rungs.iter().map(|r| r.length).collect();
        if saved != configured {
            return Err(AlgorithmError::State {
                message: format!(
                    "saved rung lengths {saved:?} do not match configured {configured:?}"
                ),
            });
        }
        self.state = state;
        Ok(())
    }
}
