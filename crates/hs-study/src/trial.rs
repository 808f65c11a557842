//! Trial records, lifecycle states and the live trial handle.

use chrono::{DateTime, Utc};
use hs_types::{Distribution, HsError, HsResult, ParamValue, Params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::study::Study;

/// Trial numbers are assigned by the study storage: strictly increasing,
/// never reused, unique across workers.
pub type TrialNumber = u64;

/// Lifecycle state of a trial.
///
/// `Sampling -> Running -> {Completed | Pruned | Failed}`. A trial that fails
/// while its parameters are drawn goes straight from `Sampling` to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialState {
    Sampling,
    Running,
    Completed,
    Pruned,
    Failed,
}

impl TrialState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Pruned | Self::Failed)
    }
}

/// Persisted record of a single trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub number: TrialNumber,
    pub state: TrialState,
    pub params: Params,
    pub distributions: BTreeMap<String, Distribution>,
    /// Reported progress, keyed by step.
    #[serde(with = "nan_as_null")]
    pub intermediate: BTreeMap<u64, f64>,
    /// Objective value for completed trials; last reported value for pruned ones.
    pub value: Option<f64>,
    pub user_attrs: BTreeMap<String, String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrialRecord {
    pub fn new(number: TrialNumber) -> Self {
        Self {
            number,
            state: TrialState::Sampling,
            params: Params::new(),
            distributions: BTreeMap::new(),
            intermediate: BTreeMap::new(),
            value: None,
            user_attrs: BTreeMap::new(),
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Most recent `(step, value)` progress report.
    pub fn last_report(&self) -> Option<(u64, f64)> {
        self.intermediate.iter().next_back().map(|(s, v)| (*s, *v))
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.created_at)
    }
}

/// JSON has no NaN; reports that diverged are stored as `null`.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(map: &BTreeMap<u64, f64>, s: S) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(step, v)| (*step, (!v.is_nan()).then_some(*v)))
            .collect::<BTreeMap<u64, Option<f64>>>()
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<u64, f64>, D::Error> {
        let raw = BTreeMap::<u64, Option<f64>>::deserialize(d)?;
        Ok(raw
            .into_iter()
            .map(|(step, v)| (step, v.unwrap_or(f64::NAN)))
            .collect())
    }
}

/// Terminal outcome handed to the storage when a trial is finalized.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishedTrial {
    Completed { value: f64 },
    Pruned,
    Failed { error: String },
}

impl FinishedTrial {
    pub fn state(&self) -> TrialState {
        match self {
            Self::Completed { .. } => TrialState::Completed,
            Self::Pruned => TrialState::Pruned,
            Self::Failed { .. } => TrialState::Failed,
        }
    }
}

/// Why a trial did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum TrialError {
    /// The pruner cut the trial short. A terminal state, not a failure.
    #[error("trial pruned at step {step}")]
    Pruned { step: u64 },

    #[error("trial exceeded its {budget:?} time budget (ran for {elapsed:?})")]
    TimedOut { elapsed: Duration, budget: Duration },

    /// The objective raised an error or panicked.
    #[error("objective failed: {0:#}")]
    Runtime(anyhow::Error),

    /// A lifecycle observer failed while the trial was running.
    #[error("observer failed: {0:#}")]
    Observer(anyhow::Error),

    /// Contract or configuration violation: fails the trial, then aborts the
    /// worker loop.
    #[error(transparent)]
    Contract(HsError),
}

impl TrialError {
    pub fn terminal_state(&self) -> TrialState {
        match self {
            Self::Pruned { .. } => TrialState::Pruned,
            _ => TrialState::Failed,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Contract(_))
    }
}

impl From<HsError> for TrialError {
    fn from(err: HsError) -> Self {
        if err.is_config() {
            Self::Contract(err)
        } else {
            Self::Runtime(err.into())
        }
    }
}

/// Live handle to a trial, owned by the worker evaluating it.
///
/// Every mutation goes straight to the study storage; the handle itself only
/// carries the trial number and the wall-clock budget.
#[derive(Clone)]
pub struct Trial {
    study: Study,
    number: TrialNumber,
    started: Instant,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Trial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trial")
            .field("study", &self.study.name())
            .field("number", &self.number)
            .finish()
    }
}

impl Trial {
    pub(crate) fn new(study: Study, number: TrialNumber, timeout: Option<Duration>) -> Self {
        Self {
            study,
            number,
            started: Instant::now(),
            timeout,
        }
    }

    pub fn number(&self) -> TrialNumber {
        self.number
    }

    pub fn study(&self) -> &Study {
        &self.study
    }

    /// Draw (or re-read) the value of a named parameter.
    ///
    /// Suggesting the same name twice returns the value drawn the first time.
    pub fn suggest(&self, name: &str, distribution: &Distribution) -> HsResult<ParamValue> {
        let record = self.record()?;
        if let Some(existing) = record.params.get(name) {
            return Ok(existing.clone());
        }

        let history = self.study.trials()?;
        let value = self.study.sampler().sample(&history, name, distribution)?;
        self.study.storage().set_trial_param(
            self.study.name(),
            self.number,
            name,
            value.clone(),
            distribution.clone(),
        )?;
        Ok(value)
    }

    pub fn suggest_float(&self, name: &str, low: f64, high: f64) -> HsResult<f64> {
        let value = self.suggest(name, &Distribution::Uniform { low, high })?;
        value
            .as_f64()
            .ok_or_else(|| hs_types::internal_error!("parameter {name} is not a float"))
    }

    pub fn suggest_int(&self, name: &str, low: i64, high: i64) -> HsResult<i64> {
        let value = self.suggest(name, &Distribution::RandInt { low, high })?;
        value
            .as_i64()
            .ok_or_else(|| hs_types::internal_error!("parameter {name} is not an integer"))
    }

    pub fn suggest_categorical(
        &self,
        name: &str,
        choices: Vec<serde_json::Value>,
    ) -> HsResult<ParamValue> {
        self.suggest(name, &Distribution::Choice { choices })
    }

    /// Parameters drawn so far.
    pub fn params(&self) -> HsResult<Params> {
        Ok(self.record()?.params)
    }

    pub fn set_user_attr(&self, key: &str, value: &str) -> HsResult<()> {
        self.study
            .storage()
            .set_trial_user_attr(self.study.name(), self.number, key, value)
    }

    pub fn user_attr(&self, key: &str) -> HsResult<Option<String>> {
        Ok(self.record()?.user_attrs.get(key).cloned())
    }

    /// `Sampling -> Running`, once the parameter draw succeeded.
    pub fn mark_running(&self) -> HsResult<()> {
        self.study
            .storage()
            .set_trial_state(self.study.name(), self.number, TrialState::Running)
    }

    /// Record intermediate progress at `step`.
    pub fn report(&self, value: f64, step: u64) -> HsResult<()> {
        self.study
            .storage()
            .report_intermediate(self.study.name(), self.number, step, value)
    }

    /// Ask the study's pruner whether this trial should stop now.
    pub fn should_prune(&self) -> HsResult<bool> {
        let trials = self.study.trials()?;
        let Some(current) = trials.iter().find(|t| t.number == self.number) else {
            return Err(hs_types::StudyError::TrialNotFound {
                study: self.study.name().to_string(),
                number: self.number,
            }
            .into());
        };
        Ok(self
            .study
            .pruner()
            .prune(current, &trials, self.study.direction()))
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Fails with [`TrialError::TimedOut`] once the per-trial budget is spent.
    pub fn check_deadline(&self) -> Result<(), TrialError> {
        match self.timeout {
            Some(budget) if self.elapsed() > budget => Err(TrialError::TimedOut {
                elapsed: self.elapsed(),
                budget,
            }),
            _ => Ok(()),
        }
    }

    fn record(&self) -> HsResult<TrialRecord> {
        self.study.storage().get_trial(self.study.name(), self.number)
    }
}
