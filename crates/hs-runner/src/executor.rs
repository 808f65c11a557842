//! Trial executor: wraps the user objective for one trial or one job.

use hs_study::{Trial, TrialError};
use hs_types::{merge_params, ConfigError, GroupSpec, HsResult, JobSpec, Metric, Params};
use std::sync::Arc;
use tracing::{debug, info};

use crate::dataset::DataSource;
use crate::guard::RunGuard;
use crate::instrument::{SeedRecorder, SystemInfo};
use crate::notify::CallbackHandler;
use crate::objective::{Objective, ObjectiveOutput, StepResult, TrialContext};
use crate::tracking::Tracker;

/// Driver knobs shared by every execution path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Delete the run of a failed job or trial instead of attaching a
    /// traceback to it.
    pub delete_if_failed: bool,
    /// Tag runs with host, os, arch and cpu count.
    pub log_system_info: bool,
    /// Tag runs with the first seed of each RNG source.
    pub log_seeds: bool,
    /// Log failing observers and keep going instead of failing the trial.
    pub isolate_observer_errors: bool,
}

/// Runs the objective for trials of one group worker.
pub struct TrialExecutor {
    group: GroupSpec,
    metric: Metric,
    objective: Arc<dyn Objective>,
    tracker: Arc<dyn Tracker>,
    callbacks: CallbackHandler,
    data: DataSource,
    options: RunOptions,
}

impl std::fmt::Debug for TrialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialExecutor")
            .field("group", &self.group.name())
            .field("metric", &self.metric)
            .field("options", &self.options)
            .finish()
    }
}

impl TrialExecutor {
    pub fn new(
        group: GroupSpec,
        objective: Arc<dyn Objective>,
        tracker: Arc<dyn Tracker>,
        callbacks: CallbackHandler,
        data: DataSource,
        options: RunOptions,
    ) -> HsResult<Self> {
        let metric = group.require_metric()?.clone();
        Ok(Self {
            group,
            metric,
            objective,
            tracker,
            callbacks,
            data,
            options,
        })
    }

    /// Evaluate one trial inside its own tracking run and return the value
    /// of the optimization metric.
    pub fn evaluate(&self, trial: &Trial) -> Result<f64, TrialError> {
        let run_name = format!("Trial {}", trial.number());
        let guard = RunGuard::open(
            Arc::clone(&self.tracker),
            self.group.name(),
            Some(&run_name),
            self.options.delete_if_failed,
        )?;
        guard.run_trial(&self.callbacks, trial, |run| self.run_trial(trial, run))
    }

    fn run_trial(&self, trial: &Trial, run: &RunGuard) -> Result<f64, TrialError> {
        let number = trial.number();
        let tracker = run.tracker();
        tracker.set_tag(run.run_id(), "trial_number", &number.to_string())?;
        trial.set_user_attr("tracking_run_id", run.run_id())?;
        info!(trial = number, "======== Starting trial {number} ========");

        if self.options.log_system_info {
            SystemInfo::collect().tag_run(tracker, run.run_id())?;
        }

        let sampled = trial
            .study()
            .sample_space(trial, &self.group.param_space)?;
        trial.mark_running()?;
        self.callbacks
            .on_trial_start(trial, &sampled)
            .map_err(TrialError::Observer)?;

        let params = merge_params(&self.group.base.params, &sampled);
        log_params(tracker, run.run_id(), &params)?;

        let mut ctx = TrialContext::new(params, self.data.clone()).with_trial(trial.clone());
        if self.options.log_seeds {
            ctx = ctx.with_seed_recorder(Arc::new(SeedRecorder::new(
                run.shared_tracker(),
                run.run_id(),
            )));
        }

        let output = self.objective.call(&ctx).map_err(TrialError::Runtime)?;
        let last = match output {
            ObjectiveOutput::Empty => {
                return Err(TrialError::Contract(ConfigError::EmptyObjectiveResult.into()))
            }
            ObjectiveOutput::Single(result) => {
                self.log_step(run, &result, 0)?;
                result
            }
            ObjectiveOutput::Sequence(steps) => {
                let mut last = None;
                for (step, item) in steps.enumerate() {
                    let step = step as u64;
                    let result = item.map_err(TrialError::Runtime)?;
                    let value = self.metric_value(&result)?;
                    trial.report(value, step)?;
                    self.log_step(run, &result, step)?;
                    trial.check_deadline()?;
                    if trial.should_prune()? {
                        info!(trial = number, step, value, "Pruning trial");
                        return Err(TrialError::Pruned { step });
                    }
                    last = Some(result);
                }
                last.ok_or_else(|| TrialError::Contract(ConfigError::EmptyObjectiveResult.into()))?
            }
        };

        let value = self.metric_value(&last)?;
        info!(trial = number, value, "======== Finished trial {number} ========");
        Ok(value)
    }

    /// The optimization metric of a result. Its absence breaks the
    /// objective's contract.
    fn metric_value(&self, result: &StepResult) -> Result<f64, TrialError> {
        result.metrics.get(&self.metric.name).copied().ok_or_else(|| {
            TrialError::Contract(
                ConfigError::MetricNotReturned {
                    metric: self.metric.name.clone(),
                    returned: result
                        .metrics
                        .keys()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", "),
                }
                .into(),
            )
        })
    }

    fn log_step(&self, run: &RunGuard, result: &StepResult, step: u64) -> Result<(), TrialError> {
        log_result(run.tracker(), run.run_id(), result, step)?;
        self.callbacks
            .on_info_logged(&result.metrics, &result.artifacts)
            .map_err(TrialError::Observer)
    }
}

fn log_params(tracker: &dyn Tracker, run_id: &str, params: &Params) -> HsResult<()> {
    for (name, value) in params {
        tracker.log_param(run_id, name, &value.to_string())?;
    }
    Ok(())
}

fn log_result(tracker: &dyn Tracker, run_id: &str, result: &StepResult, step: u64) -> HsResult<()> {
    for (name, value) in &result.metrics {
        tracker.log_metric(run_id, name, *value, step)?;
    }
    for (name, path) in &result.artifacts {
        tracker.log_artifact(run_id, name, path)?;
    }
    debug!(run_id, step, metrics = result.metrics.len(), "Logged results");
    Ok(())
}

/// Run a plain job or experiment once with its fixed parameters inside a
/// job-scoped run. Returns the run id.
///
/// An empty result is accepted here; every element of a sequence is logged.
pub fn execute_job(
    job: &JobSpec,
    objective: &dyn Objective,
    tracker: Arc<dyn Tracker>,
    callbacks: &CallbackHandler,
    data: DataSource,
    options: &RunOptions,
) -> HsResult<String> {
    let guard = RunGuard::open(tracker, job.name(), None, options.delete_if_failed)?;
    let run_id = guard.run_id().to_string();

    guard.run_job(callbacks, |run| {
        let tracker = run.tracker();
        if options.log_system_info {
            SystemInfo::collect().tag_run(tracker, run.run_id())?;
        }
        log_params(tracker, run.run_id(), job.params())?;

        let mut ctx = TrialContext::new(job.params().clone(), data);
        if options.log_seeds {
            ctx = ctx.with_seed_recorder(Arc::new(SeedRecorder::new(
                run.shared_tracker(),
                run.run_id(),
            )));
        }

        let log = |result: &StepResult, step: u64| -> Result<(), TrialError> {
            log_result(tracker, run.run_id(), result, step)?;
            callbacks
                .on_info_logged(&result.metrics, &result.artifacts)
                .map_err(TrialError::Observer)
        };

        match objective.call(&ctx).map_err(TrialError::Runtime)? {
            ObjectiveOutput::Empty => {}
            ObjectiveOutput::Single(result) => log(&result, 0)?,
            ObjectiveOutput::Sequence(steps) => {
                for (step, item) in steps.enumerate() {
                    log(&item.map_err(TrialError::Runtime)?, step as u64)?;
                }
            }
        }
        Ok(())
    })?;

    Ok(run_id)
}
