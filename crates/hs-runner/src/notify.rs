//! Lifecycle notifier: fans job and trial events out to observers.
//!
//! Observer errors propagate to the caller unless the handler was built with
//! `isolate = true`, in which case they are logged and skipped.

use chrono::{DateTime, Local};
use crossbeam_channel::Sender;
use dashmap::DashMap;
use hs_study::{Study, Trial, TrialError, TrialNumber, TrialState};
use hs_types::{HsError, JobSpec, Params};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::instrument::hostname;
use crate::objective::{Artifacts, Metrics};

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// An observer of job and trial lifecycle events. Every hook is optional.
#[allow(unused_variables)]
pub trait Callback: Send + Sync {
    /// `run_id` is the job's tracking run, absent for group jobs.
    fn on_job_start(&self, job: &JobSpec, run_id: Option<&str>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_job_end(&self, job: &JobSpec, error: Option<&HsError>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_trial_start(&self, job: &JobSpec, trial: &Trial, sampled: &Params) -> anyhow::Result<()> {
        Ok(())
    }

    /// `error` is `None` for completed and pruned trials.
    fn on_trial_end(
        &self,
        job: &JobSpec,
        trial: &Trial,
        state: TrialState,
        metric: Option<f64>,
        error: Option<&TrialError>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_info_logged(
        &self,
        job: &JobSpec,
        metrics: &Metrics,
        artifacts: &Artifacts,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Invokes every registered observer, always passing the current job.
#[derive(Clone)]
pub struct CallbackHandler {
    callbacks: Vec<Arc<dyn Callback>>,
    job: Arc<JobSpec>,
    isolate: bool,
}

impl std::fmt::Debug for CallbackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandler")
            .field("callbacks", &self.callbacks.len())
            .field("job", &self.job.name())
            .field("isolate", &self.isolate)
            .finish()
    }
}

impl CallbackHandler {
    pub fn new(callbacks: Vec<Arc<dyn Callback>>, job: Arc<JobSpec>, isolate: bool) -> Self {
        Self {
            callbacks,
            job,
            isolate,
        }
    }

    pub fn job(&self) -> &JobSpec {
        &self.job
    }

    fn notify<F>(&self, hook: &str, mut call: F) -> anyhow::Result<()>
    where
        F: FnMut(&dyn Callback, &JobSpec) -> anyhow::Result<()>,
    {
        for callback in &self.callbacks {
            if let Err(e) = call(callback.as_ref(), &self.job) {
                if self.isolate {
                    warn!(hook, error = %format!("{e:#}"), "Observer failed, continuing");
                } else {
                    return Err(e.context(format!("{hook} observer failed")));
                }
            }
        }
        Ok(())
    }

    pub fn on_job_start(&self, run_id: Option<&str>) -> anyhow::Result<()> {
        self.notify("on_job_start", |cb, job| cb.on_job_start(job, run_id))
    }

    pub fn on_job_end(&self, error: Option<&HsError>) -> anyhow::Result<()> {
        self.notify("on_job_end", |cb, job| cb.on_job_end(job, error))
    }

    pub fn on_trial_start(&self, trial: &Trial, sampled: &Params) -> anyhow::Result<()> {
        self.notify("on_trial_start", |cb, job| cb.on_trial_start(job, trial, sampled))
    }

    pub fn on_trial_end(
        &self,
        trial: &Trial,
        state: TrialState,
        metric: Option<f64>,
        error: Option<&TrialError>,
    ) -> anyhow::Result<()> {
        self.notify("on_trial_end", |cb, job| {
            cb.on_trial_end(job, trial, state, metric, error)
        })
    }

    pub fn on_info_logged(&self, metrics: &Metrics, artifacts: &Artifacts) -> anyhow::Result<()> {
        self.notify("on_info_logged", |cb, job| cb.on_info_logged(job, metrics, artifacts))
    }
}

/// Owned snapshot of a lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    JobStarted {
        job: String,
        run_id: Option<String>,
    },
    JobEnded {
        job: String,
        error: Option<String>,
    },
    TrialStarted {
        job: String,
        trial: TrialNumber,
        sampled: Params,
    },
    TrialEnded {
        job: String,
        trial: TrialNumber,
        state: TrialState,
        metric: Option<f64>,
        error: Option<String>,
    },
    InfoLogged {
        job: String,
        metrics: Metrics,
    },
}

/// Forwards every event over a channel. Sending on a channel whose receiver
/// is gone is an observer error.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: Sender<LifecycleEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<LifecycleEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: LifecycleEvent) -> anyhow::Result<()> {
        self.tx
            .send(event)
            .map_err(|e| anyhow::anyhow!("lifecycle channel closed: {e}"))
    }
}

impl Callback for ChannelObserver {
    fn on_job_start(&self, job: &JobSpec, run_id: Option<&str>) -> anyhow::Result<()> {
        self.send(LifecycleEvent::JobStarted {
            job: job.name().to_string(),
            run_id: run_id.map(str::to_string),
        })
    }

    fn on_job_end(&self, job: &JobSpec, error: Option<&HsError>) -> anyhow::Result<()> {
        self.send(LifecycleEvent::JobEnded {
            job: job.name().to_string(),
            error: error.map(ToString::to_string),
        })
    }

    fn on_trial_start(&self, job: &JobSpec, trial: &Trial, sampled: &Params) -> anyhow::Result<()> {
        self.send(LifecycleEvent::TrialStarted {
            job: job.name().to_string(),
            trial: trial.number(),
            sampled: sampled.clone(),
        })
    }

    fn on_trial_end(
        &self,
        job: &JobSpec,
        trial: &Trial,
        state: TrialState,
        metric: Option<f64>,
        error: Option<&TrialError>,
    ) -> anyhow::Result<()> {
        self.send(LifecycleEvent::TrialEnded {
            job: job.name().to_string(),
            trial: trial.number(),
            state,
            metric,
            error: error.map(ToString::to_string),
        })
    }

    fn on_info_logged(
        &self,
        job: &JobSpec,
        metrics: &Metrics,
        _artifacts: &Artifacts,
    ) -> anyhow::Result<()> {
        self.send(LifecycleEvent::InfoLogged {
            job: job.name().to_string(),
            metrics: metrics.clone(),
        })
    }
}

/// Destination of human-readable notifications.
pub trait MessageSink: Send + Sync {
    fn send_message(&self, message: &str) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn send_message(&self, message: &str) -> anyhow::Result<()> {
        info!(target: "hypersweep::notify", "{message}");
        Ok(())
    }
}

struct TrialTiming {
    started: Instant,
    sampled: Params,
}

/// Formats job and trial messages and hands them to a [`MessageSink`].
pub struct MessageNotifier<S> {
    sink: S,
    host: String,
    job_started: Mutex<Option<Instant>>,
    trials: DashMap<TrialNumber, TrialTiming>,
    study: Mutex<Option<Study>>,
}

impl<S: MessageSink> MessageNotifier<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            host: hostname(),
            job_started: Mutex::new(None),
            trials: DashMap::new(),
            study: Mutex::new(None),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn now() -> String {
        Local::now().format(DATE_FORMAT).to_string()
    }
}

fn format_params(params: &Params) -> String {
    if params.is_empty() {
        return "{}".to_string();
    }
    let body: Vec<String> = params.iter().map(|(k, v)| format!("{k}: {v}")).collect();
    format!("{{{}}}", body.join(", "))
}

fn format_duration(elapsed: std::time::Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        elapsed.subsec_millis()
    )
}

fn format_date(date: DateTime<Local>) -> String {
    date.format(DATE_FORMAT).to_string()
}

impl<S: MessageSink> Callback for MessageNotifier<S> {
    fn on_job_start(&self, job: &JobSpec, run_id: Option<&str>) -> anyhow::Result<()> {
        *self.job_started.lock() = Some(Instant::now());

        let mut msg = format!("Starting job {}", job.name());
        if let Some(run_id) = run_id {
            write!(msg, "\nRun id: {run_id}")?;
        }
        write!(msg, "\nMachine name: {}", self.host)?;
        write!(msg, "\nStarting date: {}", Self::now())?;
        write!(msg, "\nParameters: {}", format_params(job.params()))?;
        if let Some(group) = job.as_group() {
            let space: Vec<String> = group
                .param_space
                .iter()
                .map(|(name, spec)| format!("{name}: {spec}"))
                .collect();
            write!(msg, "\nHyperparameter space: {{{}}}", space.join(", "))?;
        }
        self.sink.send_message(&msg)
    }

    fn on_job_end(&self, job: &JobSpec, error: Option<&HsError>) -> anyhow::Result<()> {
        let elapsed = self
            .job_started
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default();

        let mut msg = match error {
            Some(_) => format!("Crashed job - {}", job.name()),
            None => format!("Finished job - {}", job.name()),
        };
        write!(msg, "\nMachine name: {}", self.host)?;
        write!(msg, "\nFinish date: {}", format_date(Local::now()))?;
        write!(msg, "\nDuration: {}", format_duration(elapsed))?;

        if let Some(study) = self.study.lock().as_ref() {
            if let Ok(Some(best)) = study.best_trial() {
                write!(msg, "\nBest trial: {}", best.number)?;
                write!(msg, "\nBest params: {}", format_params(&best.params))?;
            }
        }
        if let Some(error) = error {
            write!(msg, "\nError: {error}")?;
        }
        self.sink.send_message(&msg)
    }

    fn on_trial_start(&self, job: &JobSpec, trial: &Trial, sampled: &Params) -> anyhow::Result<()> {
        {
            let mut study = self.study.lock();
            if study.is_none() {
                *study = Some(trial.study().clone());
            }
        }
        self.trials.insert(
            trial.number(),
            TrialTiming {
                started: Instant::now(),
                sampled: sampled.clone(),
            },
        );

        let run_id = trial.user_attr("tracking_run_id")?.unwrap_or_default();
        let mut msg = format!("Starting trial {} for {}", trial.number(), job.name());
        write!(msg, "\nRun id: {run_id}")?;
        write!(msg, "\nStarting date: {}", Self::now())?;
        write!(msg, "\nFixed parameters: {}", format_params(job.params()))?;
        write!(msg, "\nSampled parameters: {}", format_params(sampled))?;
        self.sink.send_message(&msg)
    }

    fn on_trial_end(
        &self,
        job: &JobSpec,
        trial: &Trial,
        state: TrialState,
        metric: Option<f64>,
        error: Option<&TrialError>,
    ) -> anyhow::Result<()> {
        let (elapsed, sampled) = match self.trials.remove(&trial.number()) {
            Some((_, timing)) => (timing.started.elapsed(), timing.sampled),
            None => (trial.elapsed(), Params::new()),
        };

        let title = match (state, error) {
            (_, Some(_)) => "Crashed",
            (TrialState::Pruned, None) => "Pruned",
            _ => "Finished",
        };
        let run_id = trial.user_attr("tracking_run_id")?.unwrap_or_default();
        let mut msg = format!("{title} trial {} for {}", trial.number(), job.name());
        write!(msg, "\nRun id: {run_id}")?;
        write!(msg, "\nFinish date: {}", Self::now())?;
        write!(msg, "\nDuration: {}", format_duration(elapsed))?;
        write!(msg, "\nFixed parameters: {}", format_params(job.params()))?;
        write!(msg, "\nSampled parameters: {}", format_params(&sampled))?;
        match (error, metric) {
            (Some(error), _) => write!(msg, "\nError: {error}")?,
            (None, Some(metric)) => write!(msg, "\nMetric: {metric}")?,
            (None, None) => {}
        }
        self.sink.send_message(&msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_study::{InMemoryStorage, NopPruner, RandomSampler};
    use hs_types::{Direction, GroupSpec, JobBase, Metric};

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl MessageSink for Arc<Recording> {
        fn send_message(&self, message: &str) -> anyhow::Result<()> {
            self.0.lock().push(message.to_string());
            Ok(())
        }
    }

    struct Failing;

    impl Callback for Failing {
        fn on_job_start(&self, _job: &JobSpec, _run_id: Option<&str>) -> anyhow::Result<()> {
            anyhow::bail!("webhook unreachable")
        }
    }

    fn job() -> Arc<JobSpec> {
        Arc::new(JobSpec::Job(JobBase::new("etl").with_param("epochs", 3i64)))
    }

    fn study() -> Study {
        Study::create_or_attach(
            "notify",
            Arc::new(RandomSampler::seeded(3)),
            Arc::new(NopPruner),
            Direction::Minimize,
            Arc::new(InMemoryStorage::new()),
            false,
        )
        .unwrap()
    }

    #[test]
    fn observer_errors_propagate_unless_isolated() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let observers: Vec<Arc<dyn Callback>> =
            vec![Arc::new(Failing), Arc::new(ChannelObserver::new(tx))];

        let strict = CallbackHandler::new(observers.clone(), job(), false);
        let err = strict.on_job_start(Some("run")).unwrap_err();
        assert!(format!("{err:#}").contains("webhook unreachable"));
        assert!(rx.try_recv().is_err());

        let isolated = CallbackHandler::new(observers, job(), true);
        isolated.on_job_start(Some("run")).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            LifecycleEvent::JobStarted {
                job: "etl".to_string(),
                run_id: Some("run".to_string())
            }
        );
    }

    #[test]
    fn closed_channel_is_an_error() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let handler = CallbackHandler::new(vec![Arc::new(ChannelObserver::new(tx))], job(), false);
        assert!(handler.on_job_end(None).is_err());
    }

    #[test]
    fn notifier_formats_trial_messages() {
        let recording = Arc::new(Recording::default());
        let notifier = MessageNotifier::new(Arc::clone(&recording));
        let group = JobSpec::Group(
            GroupSpec::new("search", 2)
                .with_metric(Metric::minimize("loss"))
                .with_param("epochs", 5i64),
        );

        let study = study();
        let trial = study.ask(None).unwrap();
        trial.set_user_attr("tracking_run_id", "abc123").unwrap();
        let mut sampled = Params::new();
        sampled.insert("lr".into(), 0.01.into());

        notifier.on_job_start(&group, None).unwrap();
        notifier.on_trial_start(&group, &trial, &sampled).unwrap();
        notifier
            .on_trial_end(&group, &trial, TrialState::Completed, Some(0.42), None)
            .unwrap();
        notifier.on_job_end(&group, None).unwrap();

        let messages = recording.0.lock();
        assert_eq!(messages.len(), 4);
        assert!(messages[0].starts_with("Starting job search"));
        assert!(messages[0].contains("Hyperparameter space"));
        assert!(messages[1].contains("Run id: abc123"));
        assert!(messages[1].contains("Sampled parameters: {lr: 0.01}"));
        assert!(messages[2].starts_with("Finished trial 0 for search"));
        assert!(messages[2].contains("Metric: 0.42"));
        assert!(messages[2].contains("Fixed parameters: {epochs: 5}"));
        assert!(messages[3].starts_with("Finished job - search"));
    }

    #[test]
    fn crashed_job_message_names_the_error() {
        let recording = Arc::new(Recording::default());
        let notifier = MessageNotifier::new(Arc::clone(&recording));
        let job = job();
        let error = HsError::Internal("disk full".into());
        notifier.on_job_start(&job, Some("r1")).unwrap();
        notifier.on_job_end(&job, Some(&error)).unwrap();

        let messages = recording.0.lock();
        assert!(messages[0].contains("Run id: r1"));
        assert!(messages[1].starts_with("Crashed job - etl"));
        assert!(messages[1].contains("disk full"));
    }

    #[test]
    fn durations_render_as_clock_time() {
        assert_eq!(
            format_duration(std::time::Duration::from_millis(3_723_045)),
            "1:02:03.045"
        );
    }
}
