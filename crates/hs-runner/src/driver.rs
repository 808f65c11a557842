//! The job runner: classifies a job and drives it to completion.

use hs_study::{
    pruner_from_id, sampler_from_id, storage_from_uri, validate_ids, OptimizeReport, Study,
    StudyStorage, StudySummary,
};
use hs_types::{
    ClusterConfig, ClusterError, ConfigError, GroupSpec, HsError, HsResult,
    JobKind, JobSpec, Settings, WorkerResources,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::allocation::WorkerAllocation;
use crate::cluster::{dispatch, Cluster, LocalCluster};
use crate::dataset::{self, DataLoader, DataSource};
use crate::executor::{execute_job, RunOptions, TrialExecutor};
use crate::notify::{Callback, CallbackHandler};
use crate::objective::Objective;
use crate::tracking::{tracker_from_uri, Tracker};

/// Outcome of one group worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker: usize,
    /// Trials this worker was asked to run.
    pub assigned: usize,
    pub report: OptimizeReport,
}

/// What a finished job hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job: String,
    pub kind: JobKind,
    pub elapsed: Duration,
    /// Tracking run of a plain job or experiment.
    pub run_id: Option<String>,
    /// Study summary of a group job.
    pub study: Option<StudySummary>,
    pub workers: Vec<WorkerReport>,
}

/// Runs jobs against a tracker, a study storage and a cluster.
///
/// Collaborators that are not injected are built from [`Settings`] on first
/// use and then reused, so `memory://` backends live as long as the runner.
pub struct JobRunner {
    settings: Settings,
    options: RunOptions,
    callbacks: Vec<Arc<dyn Callback>>,
    cluster: Option<Arc<dyn Cluster>>,
    tracker: Mutex<Option<Arc<dyn Tracker>>>,
    storage: Mutex<Option<Arc<dyn StudyStorage>>>,
    storage_injected: bool,
    data_loader: Option<DataLoader>,
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("settings", &self.settings)
            .field("options", &self.options)
            .field("callbacks", &self.callbacks.len())
            .field("data_loader", &self.data_loader.is_some())
            .finish()
    }
}

impl JobRunner {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            options: RunOptions::default(),
            callbacks: Vec::new(),
            cluster: None,
            tracker: Mutex::new(None),
            storage: Mutex::new(None),
            storage_injected: false,
            data_loader: None,
        }
    }

    pub fn from_env() -> Self {
        Self::new(Settings::from_env())
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn Cluster>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_tracker(self, tracker: Arc<dyn Tracker>) -> Self {
        *self.tracker.lock() = Some(tracker);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StudyStorage>) -> Self {
        *self.storage.lock() = Some(storage);
        self.storage_injected = true;
        self
    }

    pub fn with_data_loader(mut self, loader: DataLoader) -> Self {
        self.data_loader = Some(loader);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The tracker runs are written to.
    pub fn tracker(&self) -> HsResult<Arc<dyn Tracker>> {
        let mut slot = self.tracker.lock();
        if let Some(tracker) = slot.as_ref() {
            return Ok(Arc::clone(tracker));
        }
        let tracker = tracker_from_uri(&self.settings.tracking_uri)?;
        *slot = Some(Arc::clone(&tracker));
        Ok(tracker)
    }

    /// The study storage group jobs persist to.
    pub fn storage(&self) -> HsResult<Arc<dyn StudyStorage>> {
        let mut slot = self.storage.lock();
        if let Some(storage) = slot.as_ref() {
            return Ok(Arc::clone(storage));
        }
        let uri = self
            .settings
            .study_storage_uri
            .as_deref()
            .ok_or(ConfigError::MissingStorageUri)?;
        let storage = storage_from_uri(uri)?;
        *slot = Some(Arc::clone(&storage));
        Ok(storage)
    }

    fn cluster(&self, config: Option<&ClusterConfig>) -> HsResult<Arc<dyn Cluster>> {
        if let Some(cluster) = &self.cluster {
            return Ok(Arc::clone(cluster));
        }
        match config {
            Some(c) if !c.is_local() => Err(ClusterError::ResourceQuery {
                message: format!(
                    "no cluster client configured for address {}",
                    c.address.as_deref().unwrap_or_default()
                ),
            }
            .into()),
            _ => Ok(Arc::new(LocalCluster::from_config(config)?)),
        }
    }

    /// Everything that must hold before any trial or job body runs.
    fn validate(&self, job: &JobSpec) -> HsResult<()> {
        job.validate()?;
        match self.settings.validate_for(job) {
            Err(HsError::Config(ConfigError::MissingStorageUri)) if self.storage_injected => {}
            other => other?,
        }
        if let Some(group) = job.as_group() {
            validate_ids(group)?;
        }
        Ok(())
    }

    /// Run `job` to completion.
    pub async fn run<O: Objective + 'static>(&self, job: JobSpec, objective: O) -> HsResult<JobReport> {
        let started = Instant::now();
        self.validate(&job)?;

        let tracker = self.tracker()?;
        if tracker.create_experiment(job.name())? {
            info!(experiment = job.name(), "Created new experiment");
        } else {
            info!(experiment = job.name(), "Experiment already exists, writing to the same store");
        }

        let job = Arc::new(job);
        let objective: Arc<dyn Objective> = Arc::new(objective);
        let callbacks = CallbackHandler::new(
            self.callbacks.clone(),
            Arc::clone(&job),
            self.options.isolate_observer_errors,
        );
        info!(job = job.name(), kind = %job.kind(), "Running job");

        let mut report = JobReport {
            job: job.name().to_string(),
            kind: job.kind(),
            elapsed: Duration::ZERO,
            run_id: None,
            study: None,
            workers: Vec::new(),
        };

        match job.as_ref() {
            JobSpec::Group(group) => {
                let (summary, workers) = self.run_group(group, objective, tracker, callbacks).await?;
                report.study = Some(summary);
                report.workers = workers;
            }
            JobSpec::Experiment(base) if base.cluster_config.is_some() => {
                let cluster = self.cluster(base.cluster_config.as_ref())?;
                let task = self.job_task(Arc::clone(&job), objective, tracker, callbacks);
                let handle = dispatch(cluster.as_ref(), 0, &WorkerResources::default(), task)?;
                report.run_id = Some(handle.join().await??);
            }
            JobSpec::Job(_) | JobSpec::Experiment(_) => {
                let task = self.job_task(Arc::clone(&job), objective, tracker, callbacks);
                report.run_id = Some(blocking(task).await?);
            }
        }

        report.elapsed = started.elapsed();
        info!(job = %report.job, elapsed = ?report.elapsed, "Job finished");
        Ok(report)
    }

    fn job_task(
        &self,
        job: Arc<JobSpec>,
        objective: Arc<dyn Objective>,
        tracker: Arc<dyn Tracker>,
        callbacks: CallbackHandler,
    ) -> impl FnOnce() -> HsResult<String> + Send + 'static {
        let data = match &self.data_loader {
            Some(loader) => DataSource::Loader(loader.clone()),
            None => DataSource::None,
        };
        let options = self.options.clone();
        move || execute_job(&job, objective.as_ref(), tracker, &callbacks, data, &options)
    }

    async fn run_group(
        &self,
        group: &GroupSpec,
        objective: Arc<dyn Objective>,
        tracker: Arc<dyn Tracker>,
        callbacks: CallbackHandler,
    ) -> HsResult<(StudySummary, Vec<WorkerReport>)> {
        let cluster_config = group.base.cluster_config.as_ref();
        let cluster = self.cluster(cluster_config)?;
        let available = cluster.available_resources().await?;
        let plan = WorkerAllocation::plan(
            &group.resources_per_worker,
            &available,
            cluster_config,
            group.num_trials,
        );
        info!(
            workers = plan.worker_count,
            shares = ?plan.trial_shares,
            cpu = plan.available_cpu,
            gpu = plan.available_gpu,
            "Allocated workers"
        );

        let observer_failed = |e: anyhow::Error| HsError::JobFailed {
            job: group.name().to_string(),
            message: format!("observer failed: {e:#}"),
        };
        callbacks.on_job_start(None).map_err(observer_failed)?;

        let outcome = self
            .dispatch_group(group, &plan, cluster, objective, tracker, callbacks.clone())
            .await;
        if let Err(e) = &outcome {
            error!(job = group.name(), error = %e, "Group job failed");
        }

        let ended = callbacks.on_job_end(outcome.as_ref().err());
        match (outcome, ended) {
            (Err(e), Err(hook)) => {
                warn!(error = %format!("{hook:#}"), "on_job_end observer failed after the job had failed");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(hook)) => Err(observer_failed(hook)),
            (Ok(result), Ok(())) => Ok(result),
        }
    }

    async fn dispatch_group(
        &self,
        group: &GroupSpec,
        plan: &WorkerAllocation,
        cluster: Arc<dyn Cluster>,
        objective: Arc<dyn Objective>,
        tracker: Arc<dyn Tracker>,
        callbacks: CallbackHandler,
    ) -> HsResult<(StudySummary, Vec<WorkerReport>)> {
        let dataset = match self.data_loader.clone() {
            Some(loader) => {
                let cluster = Arc::clone(&cluster);
                Some(blocking(move || dataset::publish(cluster.as_ref(), &loader)).await?)
            }
            None => None,
        };

        let name = group.name().to_string();
        let sampler = sampler_from_id(group.sampler.as_deref())?;
        let pruner = pruner_from_id(group.pruner.as_deref())?;
        let direction = group.require_metric()?.direction;
        let storage = self.storage()?;
        let resume = group.resume;
        let study = blocking(move || {
            Study::create_or_attach(&name, sampler, pruner, direction, storage, resume)
        })
        .await?;

        let mut handles = Vec::with_capacity(plan.worker_count);
        let mut dispatch_error = None;
        for (worker, &share) in plan.trial_shares.iter().enumerate() {
            let spec = group.with_num_trials(share);
            let study = study.clone();
            let cluster_ref = Arc::clone(&cluster);
            let dataset = dataset.clone();
            let objective = Arc::clone(&objective);
            let tracker = Arc::clone(&tracker);
            let callbacks = callbacks.clone();
            let options = self.options.clone();

            let dispatched = dispatch(cluster.as_ref(), worker, &plan.resources, move || {
                let data = match dataset {
                    Some(handle) => handle.resolve(cluster_ref.as_ref())?,
                    None => DataSource::None,
                };
                let timeout = spec.timeout();
                let executor = TrialExecutor::new(spec, objective, tracker, callbacks, data, options)?;
                info!(worker, trials = share, "Worker starting");
                let report = study.optimize(|trial| executor.evaluate(trial), share, timeout)?;
                info!(worker, completed = report.completed, pruned = report.pruned, failed = report.failed, "Worker done");
                Ok::<_, HsError>(report)
            });
            match dispatched {
                Ok(handle) => handles.push((share, handle)),
                Err(e) => {
                    error!(worker, error = %e, "Dispatch failed, waiting for dispatched workers");
                    dispatch_error = Some(e);
                    break;
                }
            }
        }

        let mut workers = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for (share, handle) in handles {
            let worker = handle.worker();
            match handle.join().await.and_then(|result| result) {
                Ok(report) => workers.push(WorkerReport {
                    worker,
                    assigned: share,
                    report,
                }),
                Err(e) => {
                    error!(worker, error = %e, "Worker failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = dispatch_error.or(first_error) {
            return Err(e);
        }

        let summary = blocking(move || study.summary()).await?;
        info!(
            study = %summary.study,
            trials = summary.n_trials,
            best_trial = ?summary.best_trial,
            best_value = ?summary.best_value,
            "Study finished"
        );
        Ok((summary, workers))
    }
}

/// Run blocking work (user loaders, file-backed storage, job bodies) off the
/// async executor.
async fn blocking<T, F>(task: F) -> HsResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> HsResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| ClusterError::Dispatch {
            message: format!("blocking task did not complete: {e}"),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::TRACEBACK_ARTIFACT;
    use crate::notify::{ChannelObserver, LifecycleEvent};
    use crate::objective::{ObjectiveOutput, StepResult, TrialContext};
    use crate::tracking::{Artifact, InMemoryTracker, RunStatus};
    use hs_study::{InMemoryStorage, Trial, TrialError, TrialState};
    use hs_types::{JobBase, Metric};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn memory_settings() -> Settings {
        Settings::default().with_study_storage("memory://")
    }

    fn search(num_trials: usize, cpus: u32) -> GroupSpec {
        GroupSpec::new("search", num_trials)
            .with_metric(Metric::minimize("loss"))
            .with_cluster(ClusterConfig {
                num_cpus: Some(cpus),
                ..Default::default()
            })
            .with_distribution("lr", "uniform(0.001, 0.1)")
            .unwrap()
    }

    fn loss(ctx: &TrialContext) -> anyhow::Result<ObjectiveOutput> {
        let lr = ctx.param("lr").and_then(|v| v.as_f64()).unwrap_or(1.0);
        Ok(StepResult::new().metric("loss", lr).into())
    }

    struct FailingTrialEnd;

    impl Callback for FailingTrialEnd {
        fn on_trial_end(
            &self,
            _job: &JobSpec,
            _trial: &Trial,
            _state: TrialState,
            _metric: Option<f64>,
            _error: Option<&TrialError>,
        ) -> anyhow::Result<()> {
            anyhow::bail!("notification service unreachable")
        }
    }

    #[tokio::test]
    async fn group_runs_every_trial_across_workers() {
        let tracker = Arc::new(InMemoryTracker::new());
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let runner = JobRunner::new(memory_settings())
            .with_tracker(tracker.clone())
            .with_data_loader(DataLoader::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![1.0f64, 2.0, 3.0])
            }));

        let objective = |ctx: &TrialContext| -> anyhow::Result<ObjectiveOutput> {
            let data = ctx.load_data::<Vec<f64>>()?;
            let lr = ctx.param("lr").and_then(|v| v.as_f64()).unwrap_or(1.0);
            Ok(StepResult::new().metric("loss", lr * data.len() as f64).into())
        };
        let report = runner
            .run(JobSpec::Group(search(10, 4)), objective)
            .await
            .unwrap();

        assert_eq!(report.kind, JobKind::Group);
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let assigned: Vec<usize> = report.workers.iter().map(|w| w.assigned).collect();
        assert_eq!(assigned, vec![4, 2, 2, 2]);
        let run: usize = report.workers.iter().map(|w| w.report.trials_run).sum();
        assert_eq!(run, 10);

        let summary = report.study.unwrap();
        assert_eq!(summary.n_trials, 10);
        assert_eq!(summary.completed, 10);
        assert!(summary.best_trial.is_some());
        assert_eq!(tracker.list_runs("search").unwrap().len(), 10);
    }

    #[tokio::test]
    async fn failed_trials_keep_a_traceback_and_the_group_continues() {
        let tracker = Arc::new(InMemoryTracker::new());
        let runner = JobRunner::new(memory_settings()).with_tracker(tracker.clone());

        let objective = |ctx: &TrialContext| -> anyhow::Result<ObjectiveOutput> {
            if ctx.trial()?.number() == 1 {
                anyhow::bail!("diverged");
            }
            loss(ctx)
        };
        let report = runner
            .run(JobSpec::Group(search(4, 2)), objective)
            .await
            .unwrap();

        let summary = report.study.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.completed, 3);

        let failed: Vec<_> = tracker
            .list_runs("search")
            .unwrap()
            .into_iter()
            .filter(|r| r.status == RunStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].tags["status"], "failed");
        match &failed[0].artifacts[TRACEBACK_ARTIFACT] {
            Artifact::Text(text) => assert!(text.contains("diverged")),
            other => panic!("unexpected artifact {other:?}"),
        }
    }

    #[tokio::test]
    async fn contract_violations_fail_the_group() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let runner = JobRunner::new(memory_settings())
            .with_callback(Arc::new(ChannelObserver::new(tx)));

        let objective = |_: &TrialContext| -> anyhow::Result<ObjectiveOutput> {
            Ok(StepResult::new().metric("accuracy", 0.9).into())
        };
        let err = runner
            .run(JobSpec::Group(search(4, 1)), objective)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HsError::Config(ConfigError::MetricNotReturned { .. })
        ));

        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(
            events.first(),
            Some(LifecycleEvent::JobStarted { run_id: None, .. })
        ));
        match events.last() {
            Some(LifecycleEvent::JobEnded { error: Some(message), .. }) => {
                assert!(message.contains("loss"))
            }
            other => panic!("unexpected last event {other:?}"),
        }

        // Only the first trial ran: the violation stops the single worker.
        let storage = runner.storage().unwrap();
        assert_eq!(storage.get_trials("search").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn observer_errors_fail_trials_unless_isolated() {
        let runner = JobRunner::new(memory_settings()).with_callback(Arc::new(FailingTrialEnd));
        let report = runner
            .run(JobSpec::Group(search(3, 1)), loss)
            .await
            .unwrap();
        assert_eq!(report.study.unwrap().failed, 3);

        let runner = JobRunner::new(memory_settings())
            .with_callback(Arc::new(FailingTrialEnd))
            .with_options(RunOptions {
                isolate_observer_errors: true,
                ..Default::default()
            });
        let report = runner
            .run(JobSpec::Group(search(3, 1)), loss)
            .await
            .unwrap();
        assert_eq!(report.study.unwrap().completed, 3);
    }

    #[tokio::test]
    async fn groups_need_a_study_storage() {
        let runner = JobRunner::new(Settings::default());
        let err = runner
            .run(JobSpec::Group(search(2, 1)), loss)
            .await
            .unwrap_err();
        assert!(matches!(err, HsError::Config(ConfigError::MissingStorageUri)));

        let runner = JobRunner::new(Settings::default()).with_storage(Arc::new(InMemoryStorage::new()));
        assert!(runner.run(JobSpec::Group(search(2, 1)), loss).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_sampler_is_rejected_before_any_trial() {
        let tracker = Arc::new(InMemoryTracker::new());
        let runner = JobRunner::new(memory_settings()).with_tracker(tracker.clone());
        let err = runner
            .run(JobSpec::Group(search(2, 1).with_sampler("annealing")), loss)
            .await
            .unwrap_err();
        assert!(matches!(err, HsError::Config(ConfigError::UnknownSampler { .. })));
        assert!(tracker.list_runs("search").unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_clusters_need_a_client() {
        let group = search(2, 1).with_cluster(ClusterConfig {
            address: Some("ray://head:10001".to_string()),
            ..Default::default()
        });
        let err = JobRunner::new(memory_settings())
            .run(JobSpec::Group(group), loss)
            .await
            .unwrap_err();
        assert!(matches!(err, HsError::Cluster(ClusterError::ResourceQuery { .. })));
    }

    #[tokio::test]
    async fn resumed_groups_continue_the_study() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default()
            .with_study_storage(format!("file://{}", dir.path().join("studies.json").display()));

        JobRunner::new(settings.clone())
            .run(JobSpec::Group(search(3, 1)), loss)
            .await
            .unwrap();
        let report = JobRunner::new(settings)
            .run(JobSpec::Group(search(2, 1).resuming()), loss)
            .await
            .unwrap();
        assert_eq!(report.study.unwrap().n_trials, 5);
    }

    #[tokio::test]
    async fn plain_jobs_run_once_with_a_tracked_run() {
        let tracker = Arc::new(InMemoryTracker::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let runner = JobRunner::new(Settings::default())
            .with_tracker(tracker.clone())
            .with_callback(Arc::new(ChannelObserver::new(tx)));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let objective = move |ctx: &TrialContext| -> anyhow::Result<ObjectiveOutput> {
            counter.fetch_add(1, Ordering::SeqCst);
            let epochs = ctx.param("epochs").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(StepResult::new().metric("epochs", epochs as f64).into())
        };
        let job = JobSpec::Job(JobBase::new("train").with_param("epochs", 5i64));
        let report = runner.run(job, objective).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let run_id = report.run_id.unwrap();
        let run = tracker.get_run(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Finished);
        assert_eq!(run.params["epochs"], "5");
        assert_eq!(run.last_metric("epochs"), Some(5.0));

        match rx.try_iter().next() {
            Some(LifecycleEvent::JobStarted { run_id: Some(id), .. }) => assert_eq!(id, run_id),
            other => panic!("unexpected first event {other:?}"),
        }
    }

    #[tokio::test]
    async fn jobs_cannot_target_a_cluster() {
        let job = JobSpec::Job(JobBase::new("train").with_cluster(ClusterConfig::default()));
        let err = JobRunner::new(Settings::default()).run(job, loss).await.unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn experiments_with_a_cluster_are_dispatched() {
        let tracker = Arc::new(InMemoryTracker::new());
        let runner = JobRunner::new(Settings::default()).with_tracker(tracker.clone());
        let job = JobSpec::Experiment(
            JobBase::new("baseline")
                .with_param("lr", 0.05)
                .with_cluster(ClusterConfig {
                    num_cpus: Some(1),
                    ..Default::default()
                }),
        );
        let report = runner.run(job, loss).await.unwrap();

        let run = tracker.get_run(&report.run_id.unwrap()).unwrap();
        assert_eq!(run.experiment, "baseline");
        assert_eq!(run.last_metric("loss"), Some(0.05));
    }

    #[tokio::test]
    async fn failing_jobs_report_job_failed() {
        let tracker = Arc::new(InMemoryTracker::new());
        let runner = JobRunner::new(Settings::default()).with_tracker(tracker.clone());
        let objective = |_: &TrialContext| -> anyhow::Result<ObjectiveOutput> {
            anyhow::bail!("out of memory")
        };
        let err = runner
            .run(JobSpec::Experiment(JobBase::new("baseline")), objective)
            .await
            .unwrap_err();
        assert!(matches!(err, HsError::JobFailed { ref job, .. } if job == "baseline"));

        let runs = tracker.list_runs("baseline").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].artifacts.contains_key(TRACEBACK_ARTIFACT));
    }

    /// Local cluster that refuses every submission after the first `limit`.
    struct RefusingCluster {
        inner: LocalCluster,
        limit: usize,
        submitted: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Cluster for RefusingCluster {
        async fn available_resources(&self) -> HsResult<crate::cluster::ClusterResources> {
            self.inner.available_resources().await
        }

        fn submit(&self, resources: &WorkerResources, task: crate::cluster::RemoteTask) -> HsResult<()> {
            if self.submitted.fetch_add(1, Ordering::SeqCst) >= self.limit {
                return Err(ClusterError::Dispatch {
                    message: "worker pool is full".to_string(),
                }
                .into());
            }
            self.inner.submit(resources, task)
        }

        fn put(&self, object: crate::cluster::SharedObject) -> HsResult<crate::cluster::ObjectId> {
            self.inner.put(object)
        }

        fn get(&self, id: &crate::cluster::ObjectId) -> HsResult<crate::cluster::SharedObject> {
            self.inner.get(id)
        }
    }

    #[tokio::test]
    async fn dispatch_failures_wait_for_dispatched_workers() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let cluster = Arc::new(RefusingCluster {
            inner: LocalCluster::new(2, 0).unwrap(),
            limit: 1,
            submitted: AtomicUsize::new(0),
        });
        let runner = JobRunner::new(memory_settings())
            .with_cluster(cluster)
            .with_callback(Arc::new(ChannelObserver::new(tx)));

        let slow = |ctx: &TrialContext| -> anyhow::Result<ObjectiveOutput> {
            std::thread::sleep(Duration::from_millis(30));
            loss(ctx)
        };
        let err = runner
            .run(JobSpec::Group(search(4, 2)), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, HsError::Cluster(ClusterError::Dispatch { .. })), "{err}");

        // Worker 0 finished its whole share before the job was reported.
        let trials = runner.storage().unwrap().get_trials("search").unwrap();
        assert_eq!(trials.len(), 2);
        assert!(trials.iter().all(|t| t.state == TrialState::Completed));

        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(events.last(), Some(LifecycleEvent::JobEnded { error: Some(_), .. })));
    }

    #[tokio::test]
    async fn dataset_loader_runs_off_the_async_thread() {
        let async_thread = std::thread::current().id();
        let loader_thread = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&loader_thread);
        let runner = JobRunner::new(memory_settings()).with_data_loader(DataLoader::new(move || {
            *slot.lock() = Some(std::thread::current().id());
            Ok(vec![0.5f64])
        }));

        runner.run(JobSpec::Group(search(2, 1)), loss).await.unwrap();
        let loaded_on = (*loader_thread.lock()).expect("loader ran");
        assert_ne!(loaded_on, async_thread);
    }
}
