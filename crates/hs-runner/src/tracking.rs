//! Tracking collaborator: runs with params, metrics, artifacts and tags.

use chrono::{DateTime, Utc};
use hs_types::{BackendUri, HsResult, TrackingError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Terminal status of a tracking run. `Pruned` is deliberately distinct from
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Pruned,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// A single metric data point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    #[serde(with = "nan_as_null")]
    pub value: f64,
    pub step: u64,
}

mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            s.serialize_f64(*value)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
    }
}

/// An artifact attached to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Artifact {
    Path(PathBuf),
    Text(String),
}

/// Snapshot of a tracking run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub run_name: Option<String>,
    pub experiment: String,
    pub status: RunStatus,
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, Vec<MetricPoint>>,
    pub artifacts: BTreeMap<String, Artifact>,
    pub tags: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    fn new(experiment: &str, run_name: Option<&str>) -> Self {
        Self {
            run_id: Uuid::new_v4().simple().to_string(),
            run_name: run_name.map(str::to_string),
            experiment: experiment.to_string(),
            status: RunStatus::Running,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            tags: BTreeMap::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Most recent value of a metric.
    pub fn last_metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key)?.last().map(|p| p.value)
    }
}

/// The tracking transport. Every mutation of a closed run fails with
/// [`TrackingError::RunClosed`].
pub trait Tracker: Send + Sync {
    /// Returns `true` if the experiment did not exist yet.
    fn create_experiment(&self, name: &str) -> HsResult<bool>;

    /// Open a run and return its id.
    fn start_run(&self, experiment: &str, run_name: Option<&str>) -> HsResult<String>;

    fn end_run(&self, run_id: &str, status: RunStatus) -> HsResult<()>;

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> HsResult<()>;

    fn log_metric(&self, run_id: &str, key: &str, value: f64, step: u64) -> HsResult<()>;

    /// Attach a file produced by the run.
    fn log_artifact(&self, run_id: &str, name: &str, path: &Path) -> HsResult<()>;

    /// Attach a text artifact, such as a traceback.
    fn log_text(&self, run_id: &str, name: &str, text: &str) -> HsResult<()>;

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> HsResult<()>;

    fn delete_run(&self, run_id: &str) -> HsResult<()>;

    fn get_run(&self, run_id: &str) -> HsResult<RunRecord>;

    /// Runs of an experiment in start order.
    fn list_runs(&self, experiment: &str) -> HsResult<Vec<RunRecord>>;
}

/// Build the tracker a URI points at.
pub fn tracker_from_uri(uri: &str) -> HsResult<Arc<dyn Tracker>> {
    match uri.parse::<BackendUri>()? {
        BackendUri::Memory => Ok(Arc::new(InMemoryTracker::new())),
        BackendUri::File(root) => Ok(Arc::new(FileTracker::open(root)?)),
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    experiments: BTreeSet<String>,
    runs: HashMap<String, RunRecord>,
}

/// Process-local tracker.
#[derive(Debug, Default)]
pub struct InMemoryTracker {
    state: RwLock<TrackerState>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, record: RunRecord) {
        let mut state = self.state.write();
        state.experiments.insert(record.experiment.clone());
        state.runs.insert(record.run_id.clone(), record);
    }

    /// Apply `f` to an open run and return the updated record.
    fn update<F>(&self, run_id: &str, f: F) -> HsResult<RunRecord>
    where
        F: FnOnce(&mut RunRecord),
    {
        let mut state = self.state.write();
        let run = state.runs.get_mut(run_id).ok_or_else(|| TrackingError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        if run.status.is_terminal() {
            return Err(TrackingError::RunClosed {
                run_id: run_id.to_string(),
            }
            .into());
        }
        f(run);
        Ok(run.clone())
    }

    fn start(&self, experiment: &str, run_name: Option<&str>) -> RunRecord {
        let record = RunRecord::new(experiment, run_name);
        self.insert(record.clone());
        debug!(run_id = %record.run_id, experiment, "Started tracking run");
        record
    }

    fn end(&self, run_id: &str, status: RunStatus) -> HsResult<RunRecord> {
        self.update(run_id, |run| {
            run.status = status;
            run.ended_at = Some(Utc::now());
        })
    }

    fn remove(&self, run_id: &str) -> HsResult<RunRecord> {
        self.state
            .write()
            .runs
            .remove(run_id)
            .ok_or_else(|| {
                TrackingError::RunNotFound {
                    run_id: run_id.to_string(),
                }
                .into()
            })
    }
}

impl Tracker for InMemoryTracker {
    fn create_experiment(&self, name: &str) -> HsResult<bool> {
        Ok(self.state.write().experiments.insert(name.to_string()))
    }

    fn start_run(&self, experiment: &str, run_name: Option<&str>) -> HsResult<String> {
        Ok(self.start(experiment, run_name).run_id)
    }

    fn end_run(&self, run_id: &str, status: RunStatus) -> HsResult<()> {
        self.end(run_id, status).map(|_| ())
    }

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> HsResult<()> {
        self.update(run_id, |run| {
            run.params.insert(key.to_string(), value.to_string());
        })
        .map(|_| ())
    }

    fn log_metric(&self, run_id: &str, key: &str, value: f64, step: u64) -> HsResult<()> {
        self.update(run_id, |run| {
            run.metrics
                .entry(key.to_string())
                .or_default()
                .push(MetricPoint { value, step });
        })
        .map(|_| ())
    }

    fn log_artifact(&self, run_id: &str, name: &str, path: &Path) -> HsResult<()> {
        self.update(run_id, |run| {
            run.artifacts
                .insert(name.to_string(), Artifact::Path(path.to_path_buf()));
        })
        .map(|_| ())
    }

    fn log_text(&self, run_id: &str, name: &str, text: &str) -> HsResult<()> {
        self.update(run_id, |run| {
            run.artifacts
                .insert(name.to_string(), Artifact::Text(text.to_string()));
        })
        .map(|_| ())
    }

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> HsResult<()> {
        self.update(run_id, |run| {
            run.tags.insert(key.to_string(), value.to_string());
        })
        .map(|_| ())
    }

    fn delete_run(&self, run_id: &str) -> HsResult<()> {
        self.remove(run_id).map(|_| ())
    }

    fn get_run(&self, run_id: &str) -> HsResult<RunRecord> {
        self.state.read().runs.get(run_id).cloned().ok_or_else(|| {
            TrackingError::RunNotFound {
                run_id: run_id.to_string(),
            }
            .into()
        })
    }

    fn list_runs(&self, experiment: &str) -> HsResult<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self
            .state
            .read()
            .runs
            .values()
            .filter(|r| r.experiment == experiment)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.run_id.cmp(&b.run_id)));
        Ok(runs)
    }
}

/// Tracker persisting each run as `<root>/runs/<run_id>.json`, with artifacts
/// copied under `<root>/artifacts/<run_id>/`.
#[derive(Debug)]
pub struct FileTracker {
    root: PathBuf,
    inner: InMemoryTracker,
}

impl FileTracker {
    pub fn open(root: impl Into<PathBuf>) -> HsResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("runs"))?;
        fs::create_dir_all(root.join("artifacts"))?;

        let inner = InMemoryTracker::new();
        for entry in fs::read_dir(root.join("runs"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                let record: RunRecord = serde_json::from_str(&fs::read_to_string(&path)?)
                    .map_err(|e| corrupt(&path, e))?;
                inner.insert(record);
            }
        }
        let experiments = root.join("experiments.json");
        if experiments.exists() {
            let names: Vec<String> = serde_json::from_str(&fs::read_to_string(&experiments)?)
                .map_err(|e| corrupt(&experiments, e))?;
            inner.state.write().experiments.extend(names);
        }

        debug!(root = %root.display(), runs = inner.state.read().runs.len(), "Opened file tracker");
        Ok(Self { root, inner })
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(format!("{run_id}.json"))
    }

    fn artifact_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("artifacts").join(run_id)
    }

    fn persist(&self, record: &RunRecord) -> HsResult<()> {
        fs::write(self.run_path(&record.run_id), serde_json::to_string_pretty(record)?)?;
        Ok(())
    }

    fn persist_experiments(&self) -> HsResult<()> {
        let names: Vec<String> = self.inner.state.read().experiments.iter().cloned().collect();
        fs::write(self.root.join("experiments.json"), serde_json::to_string(&names)?)?;
        Ok(())
    }

    /// Reject closed runs before touching the filesystem.
    fn ensure_open(&self, run_id: &str) -> HsResult<()> {
        self.inner.update(run_id, |_| {}).map(|_| ())
    }
}

impl Tracker for FileTracker {
    fn create_experiment(&self, name: &str) -> HsResult<bool> {
        let created = self.inner.create_experiment(name)?;
        if created {
            self.persist_experiments()?;
        }
        Ok(created)
    }

    fn start_run(&self, experiment: &str, run_name: Option<&str>) -> HsResult<String> {
        let record = self.inner.start(experiment, run_name);
        self.persist(&record)?;
        self.persist_experiments()?;
        Ok(record.run_id)
    }

    fn end_run(&self, run_id: &str, status: RunStatus) -> HsResult<()> {
        let record = self.inner.end(run_id, status)?;
        self.persist(&record)
    }

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> HsResult<()> {
        let record = self.inner.update(run_id, |run| {
            run.params.insert(key.to_string(), value.to_string());
        })?;
        self.persist(&record)
    }

    fn log_metric(&self, run_id: &str, key: &str, value: f64, step: u64) -> HsResult<()> {
        let record = self.inner.update(run_id, |run| {
            run.metrics
                .entry(key.to_string())
                .or_default()
                .push(MetricPoint { value, step });
        })?;
        self.persist(&record)
    }

    fn log_artifact(&self, run_id: &str, name: &str, path: &Path) -> HsResult<()> {
        self.ensure_open(run_id)?;
        let dir = self.artifact_dir(run_id);
        fs::create_dir_all(&dir)?;
        let target = dir.join(name);
        fs::copy(path, &target)?;

        let record = self.inner.update(run_id, |run| {
            run.artifacts.insert(name.to_string(), Artifact::Path(target));
        })?;
        self.persist(&record)
    }

    fn log_text(&self, run_id: &str, name: &str, text: &str) -> HsResult<()> {
        self.ensure_open(run_id)?;
        let dir = self.artifact_dir(run_id);
        fs::create_dir_all(&dir)?;
        let target = dir.join(name);
        fs::write(&target, text)?;

        let record = self.inner.update(run_id, |run| {
            run.artifacts.insert(name.to_string(), Artifact::Path(target));
        })?;
        self.persist(&record)
    }

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> HsResult<()> {
        let record = self.inner.update(run_id, |run| {
            run.tags.insert(key.to_string(), value.to_string());
        })?;
        self.persist(&record)
    }

    fn delete_run(&self, run_id: &str) -> HsResult<()> {
        self.inner.remove(run_id)?;
        let path = self.run_path(run_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        let artifacts = self.artifact_dir(run_id);
        if artifacts.exists() {
            fs::remove_dir_all(artifacts)?;
        }
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> HsResult<RunRecord> {
        self.inner.get_run(run_id)
    }

    fn list_runs(&self, experiment: &str) -> HsResult<Vec<RunRecord>> {
        self.inner.list_runs(experiment)
    }
}

fn corrupt(path: &Path, err: serde_json::Error) -> TrackingError {
    TrackingError::Storage {
        message: format!("unreadable tracking file {}: {err}", path.display()),
    }
}
