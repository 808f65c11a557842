//! The study coordinator.

use hs_types::{
    config_error, Direction, HsResult, ParamSpace, ParamSpec, ParamValue, Params, StudyError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::pruner::Pruner;
use crate::sampler::Sampler;
use crate::storage::StudyStorage;
use crate::trial::{FinishedTrial, Trial, TrialError, TrialNumber, TrialRecord, TrialState};

/// Handle to a persisted study.
///
/// Cloning is cheap and every clone talks to the same storage, which is what
/// workers share. No state lives in the handle beyond configuration.
#[derive(Clone)]
pub struct Study {
    name: Arc<str>,
    direction: Direction,
    storage: Arc<dyn StudyStorage>,
    sampler: Arc<dyn Sampler>,
    pruner: Arc<dyn Pruner>,
}

impl std::fmt::Debug for Study {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Study")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("sampler", &self.sampler.name())
            .field("pruner", &self.pruner.name())
            .finish()
    }
}

/// Tally of one worker's optimization loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub trials_run: usize,
    pub completed: usize,
    pub pruned: usize,
    pub failed: usize,
    /// The loop stopped before its budget because time ran out.
    pub timed_out: bool,
}

impl OptimizeReport {
    fn record(&mut self, state: TrialState) {
        self.trials_run += 1;
        match state {
            TrialState::Completed => self.completed += 1,
            TrialState::Pruned => self.pruned += 1,
            _ => self.failed += 1,
        }
    }
}

/// Aggregate view of a study's trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySummary {
    pub study: String,
    pub direction: Direction,
    pub n_trials: usize,
    pub completed: usize,
    pub pruned: usize,
    pub failed: usize,
    pub best_trial: Option<TrialNumber>,
    pub best_value: Option<f64>,
    pub best_params: Params,
}

impl Study {
    /// Create the study, replacing any study with the same name, or attach to
    /// it when `resume` is set.
    pub fn create_or_attach(
        name: &str,
        sampler: Arc<dyn Sampler>,
        pruner: Arc<dyn Pruner>,
        direction: Direction,
        storage: Arc<dyn StudyStorage>,
        resume: bool,
    ) -> HsResult<Self> {
        if resume {
            match storage.study_direction(name) {
                Ok(existing) if existing != direction => {
                    return Err(config_error!(
                        "group.metric.direction",
                        "cannot resume study `{name}` created to {existing} with direction {direction}"
                    ));
                }
                Ok(_) => {
                    let n_trials = storage.get_trials(name)?.len();
                    info!(study = name, n_trials, "Resuming existing study");
                    return Ok(Self::from_parts(name, direction, storage, sampler, pruner));
                }
                Err(hs_types::HsError::Study(StudyError::NotFound { .. })) => {}
                Err(e) => return Err(e),
            }
        } else if storage.delete_study(name)? {
            debug!(study = name, "Deleted previous study");
        }

        match storage.create_study(name, direction) {
            Ok(()) => {}
            // Another process created it in between; attach like it was ours.
            Err(hs_types::HsError::Study(StudyError::AlreadyExists { .. })) => {}
            Err(e) => return Err(e),
        }
        info!(study = name, %direction, sampler = sampler.name(), pruner = pruner.name(), "Study ready");
        Ok(Self::from_parts(name, direction, storage, sampler, pruner))
    }

    /// Attach to an existing study. Workers use this with the name the driver
    /// created.
    pub fn attach(
        name: &str,
        sampler: Arc<dyn Sampler>,
        pruner: Arc<dyn Pruner>,
        storage: Arc<dyn StudyStorage>,
    ) -> HsResult<Self> {
        let direction = storage.study_direction(name)?;
        Ok(Self::from_parts(name, direction, storage, sampler, pruner))
    }

    fn from_parts(
        name: &str,
        direction: Direction,
        storage: Arc<dyn StudyStorage>,
        sampler: Arc<dyn Sampler>,
        pruner: Arc<dyn Pruner>,
    ) -> Self {
        Self {
            name: Arc::from(name),
            direction,
            storage,
            sampler,
            pruner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn storage(&self) -> &dyn StudyStorage {
        self.storage.as_ref()
    }

    pub(crate) fn sampler(&self) -> &dyn Sampler {
        self.sampler.as_ref()
    }

    pub(crate) fn pruner(&self) -> &dyn Pruner {
        self.pruner.as_ref()
    }

    pub fn trials(&self) -> HsResult<Vec<TrialRecord>> {
        self.storage.get_trials(&self.name)
    }

    pub fn trial(&self, number: TrialNumber) -> HsResult<TrialRecord> {
        self.storage.get_trial(&self.name, number)
    }

    /// Allocate the next trial. The trial starts in `Sampling`.
    pub fn ask(&self, timeout: Option<Duration>) -> HsResult<Trial> {
        let number = self.storage.create_trial(&self.name)?;
        Ok(Trial::new(self.clone(), number, timeout))
    }

    /// Draw every parameter of `space` for `trial`. List-valued entries are
    /// drawn element by element as `<name>_<i>`.
    pub fn sample_space(&self, trial: &Trial, space: &ParamSpace) -> HsResult<Params> {
        let mut params = Params::new();
        for (name, spec) in space {
            let value = match spec {
                ParamSpec::Single(dist) => trial.suggest(name, dist)?,
                ParamSpec::List(dists) => ParamValue::List(
                    dists
                        .iter()
                        .enumerate()
                        .map(|(i, dist)| trial.suggest(&format!("{name}_{i}"), dist))
                        .collect::<HsResult<Vec<_>>>()?,
                ),
            };
            params.insert(name.clone(), value);
        }
        Ok(params)
    }

    /// Record the outcome of a trial.
    ///
    /// A NaN value fails the trial; a pruned trial keeps its last reported
    /// value, which never counts toward the best trial.
    pub fn tell(
        &self,
        number: TrialNumber,
        result: Result<f64, &TrialError>,
    ) -> HsResult<TrialRecord> {
        let outcome = match result {
            Ok(value) if value.is_nan() => FinishedTrial::Failed {
                error: "objective returned NaN".to_string(),
            },
            Ok(value) => FinishedTrial::Completed { value },
            Err(TrialError::Pruned { .. }) => FinishedTrial::Pruned,
            Err(err) => FinishedTrial::Failed {
                error: err.to_string(),
            },
        };
        self.storage.finish_trial(&self.name, number, outcome)
    }

    /// Run up to `n_trials` trials through `objective`, one after another.
    ///
    /// Each trial gets `timeout` as its own wall-clock budget. Once the loop
    /// has spent `n_trials * timeout` it stops taking new trials; the trial in
    /// flight always finishes. Failed and pruned trials count against the
    /// budget and are never retried. A [`TrialError::Contract`] failure is
    /// recorded on the trial and then returned.
    pub fn optimize<F>(
        &self,
        mut objective: F,
        n_trials: usize,
        timeout: Option<Duration>,
    ) -> HsResult<OptimizeReport>
    where
        F: FnMut(&Trial) -> Result<f64, TrialError>,
    {
        let started = Instant::now();
        let loop_budget = timeout.map(|t| t.saturating_mul(n_trials.min(u32::MAX as usize) as u32));
        let mut report = OptimizeReport::default();

        for _ in 0..n_trials {
            if let Some(budget) = loop_budget {
                if started.elapsed() >= budget {
                    info!(study = %self.name, ?budget, "Time budget spent, not starting new trials");
                    report.timed_out = true;
                    break;
                }
            }

            let trial = self.ask(timeout)?;
            let number = trial.number();
            let result = objective(&trial).and_then(|value| {
                trial.check_deadline()?;
                Ok(value)
            });

            let record = self.tell(number, result.as_ref().copied())?;
            report.record(record.state);

            match result {
                Ok(_) => debug!(study = %self.name, trial = number, value = ?record.value, "Trial completed"),
                Err(TrialError::Pruned { step }) => {
                    info!(study = %self.name, trial = number, step, "Trial pruned")
                }
                Err(TrialError::Contract(err)) => return Err(err),
                Err(err) => warn!(study = %self.name, trial = number, error = %err, "Trial failed"),
            }
        }

        Ok(report)
    }

    /// The first completed trial holding the best value. Later trials with an
    /// equal value never displace it.
    pub fn best_trial(&self) -> HsResult<Option<TrialRecord>> {
        let mut best: Option<TrialRecord> = None;
        for trial in self.trials()? {
            if trial.state != TrialState::Completed {
                continue;
            }
            let Some(value) = trial.value else { continue };
            let better = match best.as_ref().and_then(|b| b.value) {
                None => true,
                Some(incumbent) => self.direction.is_better(value, incumbent),
            };
            if better {
                best = Some(trial);
            }
        }
        Ok(best)
    }

    pub fn best_value(&self) -> HsResult<f64> {
        self.best_trial()?
            .and_then(|t| t.value)
            .ok_or_else(|| {
                StudyError::NoCompletedTrials {
                    study: self.name.to_string(),
                }
                .into()
            })
    }

    pub fn summary(&self) -> HsResult<StudySummary> {
        let trials = self.trials()?;
        let count = |state: TrialState| trials.iter().filter(|t| t.state == state).count();
        let best = self.best_trial()?;

        Ok(StudySummary {
            study: self.name.to_string(),
            direction: self.direction,
            n_trials: trials.len(),
            completed: count(TrialState::Completed),
            pruned: count(TrialState::Pruned),
            failed: count(TrialState::Failed),
            best_trial: best.as_ref().map(|t| t.number),
            best_value: best.as_ref().and_then(|t| t.value),
            best_params: best.map(|t| t.params).unwrap_or_default(),
        })
    }
}
