//! Run-tracking guard.
//!
//! A [`RunGuard`] owns one open tracking run and closes it exactly once:
//! finished, pruned or failed. Dropping an open guard closes the run as
//! failed, so no exit path leaves a run dangling.

use hs_study::{Trial, TrialError, TrialState};
use hs_types::{HsError, HsResult};
use std::error::Error as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::cluster::panic_message;
use crate::notify::CallbackHandler;
use crate::tracking::{RunStatus, Tracker};

pub const TRACEBACK_ARTIFACT: &str = "traceback.txt";

/// Scoped ownership of an open tracking run.
pub struct RunGuard {
    tracker: Arc<dyn Tracker>,
    run_id: String,
    delete_if_failed: bool,
    closed: bool,
}

impl std::fmt::Debug for RunGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunGuard")
            .field("run_id", &self.run_id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl RunGuard {
    pub fn open(
        tracker: Arc<dyn Tracker>,
        experiment: &str,
        run_name: Option<&str>,
        delete_if_failed: bool,
    ) -> HsResult<Self> {
        let run_id = tracker.start_run(experiment, run_name)?;
        Ok(Self {
            tracker,
            run_id,
            delete_if_failed,
            closed: false,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn tracker(&self) -> &dyn Tracker {
        self.tracker.as_ref()
    }

    pub fn shared_tracker(&self) -> Arc<dyn Tracker> {
        Arc::clone(&self.tracker)
    }

    pub fn finish(mut self) -> HsResult<()> {
        self.close(RunStatus::Finished)
    }

    /// Close as pruned: no traceback, not a failure.
    pub fn prune(mut self) -> HsResult<()> {
        self.close(RunStatus::Pruned)
    }

    /// Tag the run as failed and attach the traceback, or delete the run when
    /// failed runs are not kept.
    pub fn fail(mut self, traceback: &str) -> HsResult<()> {
        self.tracker.set_tag(&self.run_id, "status", "failed")?;
        if self.delete_if_failed {
            self.close(RunStatus::Failed)?;
            self.tracker.delete_run(&self.run_id)?;
            debug!(run_id = %self.run_id, "Deleted failed run");
            Ok(())
        } else {
            self.tracker
                .log_text(&self.run_id, TRACEBACK_ARTIFACT, traceback)?;
            self.close(RunStatus::Failed)
        }
    }

    fn close(&mut self, status: RunStatus) -> HsResult<()> {
        self.closed = true;
        self.tracker.end_run(&self.run_id, status)
    }

    /// Run a trial body inside this run.
    ///
    /// Panics become runtime failures. `on_trial_end` fires before the run is
    /// closed; if it fails, a trial that would have completed or been pruned
    /// fails with [`TrialError::Observer`] instead.
    pub fn run_trial<F>(
        self,
        callbacks: &CallbackHandler,
        trial: &Trial,
        body: F,
    ) -> Result<f64, TrialError>
    where
        F: FnOnce(&RunGuard) -> Result<f64, TrialError>,
    {
        let mut result = catch_panic(|| body(&self));

        let (state, metric, reported) = match &result {
            Ok(value) => (TrialState::Completed, Some(*value), None),
            Err(err) => (err.terminal_state(), None, Some(err)),
        };
        let hook_error = reported.filter(|e| !matches!(e, TrialError::Pruned { .. }));
        if let Err(e) = callbacks.on_trial_end(trial, state, metric, hook_error) {
            result = absorb_observer_error(result, e);
        }

        self.close_with(&result).map_err(TrialError::from)?;
        result
    }

    /// Run a job body inside this run, bracketed by `on_job_start` and
    /// `on_job_end`. Failures surface as [`HsError::JobFailed`] unless they
    /// are configuration errors.
    pub fn run_job<T, F>(self, callbacks: &CallbackHandler, body: F) -> HsResult<T>
    where
        F: FnOnce(&RunGuard) -> Result<T, TrialError>,
    {
        let mut result = match callbacks.on_job_start(Some(&self.run_id)) {
            Ok(()) => catch_panic(|| body(&self)),
            Err(e) => Err(TrialError::Observer(e)),
        };

        let job = callbacks.job().name().to_string();
        let end_result = match &result {
            Ok(_) => callbacks.on_job_end(None),
            Err(err) => {
                let reported = job_error(&job, err);
                error!(job = %job, error = %reported, "Job failed");
                callbacks.on_job_end(Some(&reported))
            }
        };
        if let Err(e) = end_result {
            result = absorb_observer_error(result, e);
        }

        self.close_with(&result)?;
        result.map_err(|err| into_job_error(&job, err))
    }

    fn close_with<T>(self, result: &Result<T, TrialError>) -> HsResult<()> {
        match result {
            Ok(_) => self.finish(),
            Err(TrialError::Pruned { .. }) => self.prune(),
            Err(err) => {
                let run_id = self.run_id.clone();
                if let Err(close_err) = self.fail(&render_traceback(err)) {
                    warn!(run_id = %run_id, error = %close_err, "Could not record failure on run");
                }
                Ok(())
            }
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.tracker.end_run(&self.run_id, RunStatus::Failed) {
                warn!(run_id = %self.run_id, error = %e, "Could not close abandoned run");
            }
        }
    }
}

fn catch_panic<T, F>(body: F) -> Result<T, TrialError>
where
    F: FnOnce() -> Result<T, TrialError>,
{
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(payload) => Err(TrialError::Runtime(anyhow::anyhow!(
            "panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

/// A failing observer only changes outcomes that were not failures already.
fn absorb_observer_error<T>(
    result: Result<T, TrialError>,
    observer: anyhow::Error,
) -> Result<T, TrialError> {
    match result {
        Ok(_) | Err(TrialError::Pruned { .. }) => Err(TrialError::Observer(observer)),
        Err(err) => {
            warn!(error = %format!("{observer:#}"), "Observer failed after the run had already failed");
            Err(err)
        }
    }
}

/// What observers see for a failed job body.
fn job_error(job: &str, err: &TrialError) -> HsError {
    match err {
        TrialError::Contract(HsError::Config(config)) => HsError::Config(config.clone()),
        other => HsError::JobFailed {
            job: job.to_string(),
            message: other.to_string(),
        },
    }
}

/// What the caller gets back for a failed job body.
fn into_job_error(job: &str, err: TrialError) -> HsError {
    match err {
        TrialError::Contract(inner) => inner,
        other => HsError::JobFailed {
            job: job.to_string(),
            message: other.to_string(),
        },
    }
}

/// Text attached to a failed run: the error, its cause chain and, for user
/// failures, the captured backtrace when one was recorded.
pub fn render_traceback(err: &TrialError) -> String {
    match err {
        TrialError::Runtime(e) | TrialError::Observer(e) => format!("{err}\n\n{e:?}"),
        other => {
            let mut out = other.to_string();
            let mut source = other.source();
            while let Some(cause) = source {
                out.push_str("\nCaused by: ");
                out.push_str(&cause.to_string());
                source = cause.source();
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{Callback, ChannelObserver, LifecycleEvent};
    use crate::tracking::{Artifact, InMemoryTracker};
    use hs_study::{InMemoryStorage, NopPruner, RandomSampler, Study};
    use hs_types::{Direction, GroupSpec, JobBase, JobSpec, Metric};

    struct Sulky;

    impl Callback for Sulky {
        fn on_trial_end(
            &self,
            _job: &JobSpec,
            _trial: &Trial,
            _state: TrialState,
            _metric: Option<f64>,
            _error: Option<&TrialError>,
        ) -> anyhow::Result<()> {
            anyhow::bail!("dashboard offline")
        }
    }

    fn group_job() -> Arc<JobSpec> {
        Arc::new(JobSpec::Group(
            GroupSpec::new("search", 4).with_metric(Metric::minimize("loss")),
        ))
    }

    fn trial() -> Trial {
        let study = Study::create_or_attach(
            "search",
            Arc::new(RandomSampler::seeded(9)),
            Arc::new(NopPruner),
            Direction::Minimize,
            Arc::new(InMemoryStorage::new()),
            false,
        )
        .unwrap();
        study.ask(None).unwrap()
    }

    fn open(tracker: &Arc<InMemoryTracker>, delete_if_failed: bool) -> RunGuard {
        RunGuard::open(tracker.clone(), "search", Some("Trial 0"), delete_if_failed).unwrap()
    }

    #[test]
    fn failed_trials_attach_a_traceback() {
        let tracker = Arc::new(InMemoryTracker::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let callbacks =
            CallbackHandler::new(vec![Arc::new(ChannelObserver::new(tx))], group_job(), false);

        let guard = open(&tracker, false);
        let run_id = guard.run_id().to_string();
        let err = guard
            .run_trial(&callbacks, &trial(), |_| {
                Err(TrialError::Runtime(
                    anyhow::anyhow!("cuda out of memory").context("training step 3"),
                ))
            })
            .unwrap_err();
        assert!(matches!(err, TrialError::Runtime(_)));

        let run = tracker.get_run(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.tags["status"], "failed");
        let Artifact::Text(traceback) = &run.artifacts[TRACEBACK_ARTIFACT] else {
            panic!("expected a text traceback");
        };
        assert!(traceback.contains("training step 3"));
        assert!(traceback.contains("cuda out of memory"));

        match rx.try_recv().unwrap() {
            LifecycleEvent::TrialEnded { state, error, .. } => {
                assert_eq!(state, TrialState::Failed);
                assert!(error.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn pruned_trials_close_as_pruned() {
        let tracker = Arc::new(InMemoryTracker::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let callbacks =
            CallbackHandler::new(vec![Arc::new(ChannelObserver::new(tx))], group_job(), false);

        let guard = open(&tracker, false);
        let run_id = guard.run_id().to_string();
        let err = guard
            .run_trial(&callbacks, &trial(), |_| Err(TrialError::Pruned { step: 0 }))
            .unwrap_err();
        assert!(matches!(err, TrialError::Pruned { step: 0 }));

        let run = tracker.get_run(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Pruned);
        assert!(run.artifacts.is_empty());
        assert!(!run.tags.contains_key("status"));

        match rx.try_recv().unwrap() {
            LifecycleEvent::TrialEnded { state, error, .. } => {
                assert_eq!(state, TrialState::Pruned);
                assert_eq!(error, None);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn panics_are_runtime_failures() {
        let tracker = Arc::new(InMemoryTracker::new());
        let callbacks = CallbackHandler::new(Vec::new(), group_job(), false);
        let guard = open(&tracker, false);
        let run_id = guard.run_id().to_string();

        let err = guard
            .run_trial(&callbacks, &trial(), |_| panic!("index out of bounds"))
            .unwrap_err();
        assert!(err.to_string().contains("index out of bounds"));
        assert_eq!(tracker.get_run(&run_id).unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn observer_failure_fails_a_completed_trial() {
        let tracker = Arc::new(InMemoryTracker::new());
        let guard = open(&tracker, false);
        let run_id = guard.run_id().to_string();

        let strict = CallbackHandler::new(vec![Arc::new(Sulky)], group_job(), false);
        let err = guard.run_trial(&strict, &trial(), |_| Ok(0.3)).unwrap_err();
        assert!(matches!(err, TrialError::Observer(_)));
        assert_eq!(tracker.get_run(&run_id).unwrap().status, RunStatus::Failed);

        let guard = open(&tracker, false);
        let isolated = CallbackHandler::new(vec![Arc::new(Sulky)], group_job(), true);
        assert_eq!(guard.run_trial(&isolated, &trial(), |_| Ok(0.3)).unwrap(), 0.3);
    }

    #[test]
    fn failed_runs_can_be_deleted() {
        let tracker = Arc::new(InMemoryTracker::new());
        let callbacks = CallbackHandler::new(Vec::new(), group_job(), false);
        let guard = open(&tracker, true);
        let run_id = guard.run_id().to_string();

        guard
            .run_trial(&callbacks, &trial(), |_| {
                Err(TrialError::Runtime(anyhow::anyhow!("nan loss")))
            })
            .unwrap_err();
        assert!(tracker.get_run(&run_id).is_err());
    }

    #[test]
    fn job_runs_are_bracketed_by_job_hooks() {
        let tracker = Arc::new(InMemoryTracker::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let job = Arc::new(JobSpec::Job(JobBase::new("etl")));
        let callbacks = CallbackHandler::new(vec![Arc::new(ChannelObserver::new(tx))], job, false);

        let guard = RunGuard::open(tracker.clone(), "etl", None, false).unwrap();
        let run_id = guard.run_id().to_string();
        let err = guard
            .run_job(&callbacks, |_| -> Result<(), TrialError> {
                Err(TrialError::Runtime(anyhow::anyhow!("bad input")))
            })
            .unwrap_err();
        assert!(matches!(err, HsError::JobFailed { .. }));

        assert_eq!(
            rx.try_recv().unwrap(),
            LifecycleEvent::JobStarted {
                job: "etl".into(),
                run_id: Some(run_id.clone())
            }
        );
        match rx.try_recv().unwrap() {
            LifecycleEvent::JobEnded { error, .. } => {
                assert!(error.unwrap().contains("bad input"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(tracker.get_run(&run_id).unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn dropped_guards_close_their_run() {
        let tracker = Arc::new(InMemoryTracker::new());
        let run_id = {
            let guard = open(&tracker, false);
            guard.run_id().to_string()
        };
        assert_eq!(tracker.get_run(&run_id).unwrap().status, RunStatus::Failed);

        let guard = open(&tracker, false);
        let run_id = guard.run_id().to_string();
        guard.finish().unwrap();
        assert_eq!(tracker.get_run(&run_id).unwrap().status, RunStatus::Finished);
    }
}
