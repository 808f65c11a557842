//! Early-stopping policies.

use hs_types::{config_error, Direction, HsResult};

use crate::trial::{TrialRecord, TrialState};

/// Decides whether a running trial should be stopped early, given its own
/// intermediate reports and the rest of the study.
pub trait Pruner: Send + Sync {
    fn prune(&self, trial: &TrialRecord, history: &[TrialRecord], direction: Direction) -> bool;

    fn name(&self) -> &str;
}

/// Never prunes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn prune(&self, _trial: &TrialRecord, _history: &[TrialRecord], _direction: Direction) -> bool {
        false
    }

    fn name(&self) -> &str {
        "nop"
    }
}

/// Prunes a trial whose latest report is worse than the given percentile of
/// completed trials' reports at the same step.
#[derive(Debug, Clone)]
pub struct PercentilePruner {
    percentile: f64,
    /// Completed trials required before anything is pruned.
    n_startup_trials: usize,
    /// Reports before this step are never pruned.
    n_warmup_steps: u64,
}

impl PercentilePruner {
    pub fn new(percentile: f64) -> HsResult<Self> {
        if !(0.0..=100.0).contains(&percentile) {
            return Err(config_error!(
                "group.pruner",
                "percentile must be within [0, 100], got {percentile}"
            ));
        }
        Ok(Self {
            percentile,
            n_startup_trials: 5,
            n_warmup_steps: 0,
        })
    }

    pub fn with_startup_trials(mut self, n: usize) -> Self {
        self.n_startup_trials = n;
        self
    }

    pub fn with_warmup_steps(mut self, n: u64) -> Self {
        self.n_warmup_steps = n;
        self
    }
}

impl Pruner for PercentilePruner {
    fn prune(&self, trial: &TrialRecord, history: &[TrialRecord], direction: Direction) -> bool {
        let Some((step, value)) = trial.last_report() else {
            return false;
        };
        if value.is_nan() {
            return true;
        }
        if step < self.n_warmup_steps {
            return false;
        }

        let completed: Vec<&TrialRecord> = history
            .iter()
            .filter(|t| t.state == TrialState::Completed && t.number != trial.number)
            .collect();
        if completed.len() < self.n_startup_trials {
            return false;
        }

        let mut at_step: Vec<f64> = completed
            .iter()
            .filter_map(|t| t.intermediate.get(&step).copied())
            .filter(|v| !v.is_nan())
            .collect();
        if at_step.is_empty() {
            return false;
        }
        at_step.sort_by(|a, b| a.total_cmp(b));

        match direction {
            Direction::Minimize => value > percentile(&at_step, self.percentile),
            Direction::Maximize => value < percentile(&at_step, 100.0 - self.percentile),
        }
    }

    fn name(&self) -> &str {
        "percentile"
    }
}

/// Percentile pruner fixed at the median.
#[derive(Debug, Clone)]
pub struct MedianPruner(PercentilePruner);

impl MedianPruner {
    pub fn new() -> Self {
        Self(PercentilePruner {
            percentile: 50.0,
            n_startup_trials: 5,
            n_warmup_steps: 0,
        })
    }

    pub fn with_startup_trials(self, n: usize) -> Self {
        Self(self.0.with_startup_trials(n))
    }
}

impl Default for MedianPruner {
    fn default() -> Self {
        Self::new()
    }
}

impl Pruner for MedianPruner {
    fn prune(&self, trial: &TrialRecord, history: &[TrialRecord], direction: Direction) -> bool {
        self.0.prune(trial, history, direction)
    }

    fn name(&self) -> &str {
        "median"
    }
}

/// Linear interpolation between closest ranks; `sorted` must be non-empty.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}
