//! Job specifications: a closed tagged variant over plain jobs, tracked
//! experiments and hyperparameter-search groups.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::config_error;
use crate::distribution::ParamSpace;
use crate::errors::{ConfigError, HsResult};
use crate::params::Params;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Minimize,
    Maximize,
}

impl Default for Direction {
    fn default() -> Self {
        Self::Minimize
    }
}

impl Direction {
    /// Strict improvement: equal values never count as better.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Minimize => candidate < incumbent,
            Self::Maximize => candidate > incumbent,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minimize => write!(f, "minimize"),
            Self::Maximize => write!(f, "maximize"),
        }
    }
}

/// The metric a group job optimizes. Its name must be one of the keys the
/// objective function returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub direction: Direction,
}

impl Metric {
    pub fn new(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            direction,
        }
    }

    pub fn minimize(name: impl Into<String>) -> Self {
        Self::new(name, Direction::Minimize)
    }

    pub fn maximize(name: impl Into<String>) -> Self {
        Self::new(name, Direction::Maximize)
    }
}

/// Resource requirements for a single worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResources {
    /// Number of CPUs per worker (fractional ok, must be positive).
    #[serde(default = "default_cpu")]
    pub cpu: f64,
    /// Number of GPUs per worker (0 = no GPU).
    #[serde(default)]
    pub gpu: f64,
}

fn default_cpu() -> f64 {
    1.0
}

impl Default for WorkerResources {
    fn default() -> Self {
        Self { cpu: 1.0, gpu: 0.0 }
    }
}

/// Connection and capacity hints for the execution cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster head address; `None` or `"localhost"` means an in-process cluster.
    #[serde(default)]
    pub address: Option<String>,
    /// Overrides the cluster-reported CPU capacity.
    #[serde(default)]
    pub num_cpus: Option<u32>,
    /// Overrides the cluster-reported GPU capacity.
    #[serde(default)]
    pub num_gpus: Option<u32>,
}

impl ClusterConfig {
    pub fn is_local(&self) -> bool {
        match self.address.as_deref().map(str::trim) {
            None | Some("") | Some("localhost") => true,
            Some(_) => false,
        }
    }
}

/// Container execution settings. Image building and execution happen outside
/// this crate; only the shape is validated here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub context: Option<PathBuf>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

/// One executable command or script of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RunTargetRepr")]
pub struct RunTarget {
    pub command: String,
    pub template: bool,
}

impl RunTarget {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            template: false,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RunTargetRepr {
    Command(String),
    Full {
        command: String,
        #[serde(default)]
        template: bool,
    },
}

impl From<RunTargetRepr> for RunTarget {
    fn from(repr: RunTargetRepr) -> Self {
        match repr {
            RunTargetRepr::Command(command) => Self {
                command,
                template: false,
            },
            RunTargetRepr::Full { command, template } => Self { command, template },
        }
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<RunTarget>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(RunTarget),
        Many(Vec<RunTarget>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(target) => vec![target],
        OneOrMany::Many(targets) => targets,
    })
}

/// Fields shared by every job kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobBase {
    pub name: String,
    #[serde(default, alias = "run", deserialize_with = "one_or_many")]
    pub run_targets: Vec<RunTarget>,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub cluster_config: Option<ClusterConfig>,
    #[serde(default)]
    pub container_config: Option<ContainerConfig>,
}

impl JobBase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run_targets: Vec::new(),
            params: Params::new(),
            cluster_config: None,
            container_config: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<crate::ParamValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster_config = Some(cluster);
        self
    }

    pub fn with_container(mut self, container: ContainerConfig) -> Self {
        self.container_config = Some(container);
        self
    }

    fn validate(&self, kind: JobKind) -> HsResult<()> {
        let prefix = kind.to_string();

        if self.name.trim().is_empty() {
            return Err(config_error!(format!("{prefix}.name"), "must not be empty"));
        }

        for (i, target) in self.run_targets.iter().enumerate() {
            if target.command.trim().is_empty() {
                return Err(config_error!(
                    format!("{prefix}.run_targets[{i}]"),
                    "command must not be empty"
                ));
            }
        }

        if self.cluster_config.is_some() && self.container_config.is_some() {
            return Err(config_error!(
                format!("{prefix}.cluster_config"),
                "executing on a cluster and in a container are incompatible; select just one"
            ));
        }

        if kind == JobKind::Job && self.cluster_config.is_some() {
            return Err(config_error!(
                "job.cluster_config",
                "cluster execution is only supported for experiments and groups"
            ));
        }

        if let Some(cluster) = &self.cluster_config {
            if cluster.num_cpus == Some(0) {
                return Err(config_error!(
                    format!("{prefix}.cluster_config.num_cpus"),
                    "must be positive"
                ));
            }
        }

        if let Some(container) = &self.container_config {
            if container.image.is_some() && container.dockerfile.is_some() {
                return Err(config_error!(
                    format!("{prefix}.container_config"),
                    "image and dockerfile cannot be used simultaneously; use one of them"
                ));
            }
        }

        Ok(())
    }
}

/// A hyperparameter-search campaign over many trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    #[serde(flatten)]
    pub base: JobBase,
    pub num_trials: usize,
    #[serde(default)]
    pub param_space: ParamSpace,
    #[serde(default)]
    pub sampler: Option<String>,
    #[serde(default)]
    pub pruner: Option<String>,
    #[serde(default)]
    pub resources_per_worker: WorkerResources,
    /// Wall-clock budget of a single trial, in seconds.
    #[serde(default)]
    pub timeout_per_trial: Option<f64>,
    #[serde(default)]
    pub metric: Option<Metric>,
    /// Attach to an existing study of the same name instead of recreating it.
    #[serde(default)]
    pub resume: bool,
}

impl GroupSpec {
    pub fn new(name: impl Into<String>, num_trials: usize) -> Self {
        Self {
            base: JobBase::new(name),
            num_trials,
            param_space: ParamSpace::new(),
            sampler: None,
            pruner: None,
            resources_per_worker: WorkerResources::default(),
            timeout_per_trial: None,
            metric: None,
            resume: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.base.name
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<crate::ParamValue>) -> Self {
        self.base.params.insert(name.into(), value.into());
        self
    }

    /// Add a parameter distribution written in the distribution grammar.
    pub fn with_distribution(mut self, name: impl Into<String>, spec: &str) -> HsResult<Self> {
        let dist: crate::Distribution = spec.parse()?;
        self.param_space
            .insert(name.into(), crate::ParamSpec::Single(dist));
        Ok(self)
    }

    pub fn with_sampler(mut self, id: impl Into<String>) -> Self {
        self.sampler = Some(id.into());
        self
    }

    pub fn with_pruner(mut self, id: impl Into<String>) -> Self {
        self.pruner = Some(id.into());
        self
    }

    pub fn with_resources(mut self, cpu: f64, gpu: f64) -> Self {
        self.resources_per_worker = WorkerResources { cpu, gpu };
        self
    }

    pub fn with_timeout_per_trial(mut self, seconds: f64) -> Self {
        self.timeout_per_trial = Some(seconds);
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.base.cluster_config = Some(cluster);
        self
    }

    pub fn resuming(mut self) -> Self {
        self.resume = true;
        self
    }

    /// The per-trial budget as a `Duration`. Validation guarantees the
    /// conversion succeeds; an unrepresentable budget reads as no budget.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_per_trial
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// The optimization metric, or a configuration error if it is missing.
    pub fn require_metric(&self) -> HsResult<&Metric> {
        self.metric.as_ref().ok_or_else(|| ConfigError::MissingMetric.into())
    }

    /// Copy of this spec restricted to a worker's share of the trial budget.
    pub fn with_num_trials(&self, num_trials: usize) -> Self {
        let mut spec = self.clone();
        spec.num_trials = num_trials;
        spec
    }

    fn validate(&self) -> HsResult<()> {
        self.base.validate(JobKind::Group)?;

        if self.num_trials == 0 {
            return Err(config_error!("group.num_trials", "must be a positive integer"));
        }

        let resources = &self.resources_per_worker;
        if !(resources.cpu > 0.0) {
            return Err(config_error!(
                "group.resources_per_worker.cpu",
                "must be greater than 0, got {}",
                resources.cpu
            ));
        }
        if !(resources.gpu >= 0.0) {
            return Err(config_error!(
                "group.resources_per_worker.gpu",
                "must not be negative, got {}",
                resources.gpu
            ));
        }

        if let Some(timeout) = self.timeout_per_trial {
            let representable = Duration::try_from_secs_f64(timeout).is_ok();
            if !(timeout > 0.0 && timeout.is_finite() && representable) {
                return Err(config_error!(
                    "group.timeout_per_trial",
                    "must be a positive, finite number of seconds, got {}",
                    timeout
                ));
            }
        }

        let metric = self.require_metric()?;
        if metric.name.trim().is_empty() {
            return Err(config_error!("group.metric.name", "must not be empty"));
        }

        Ok(())
    }
}

/// Kind discriminant of a [`JobSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Job,
    Experiment,
    Group,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Job => write!(f, "job"),
            Self::Experiment => write!(f, "experiment"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// Controlled overrides applied once, before execution begins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOverrides {
    /// Optimization metric; ignored for non-group jobs.
    pub metric: Option<Metric>,
    /// Parameters merged over the configured fixed parameters.
    pub params: Params,
    /// Trial budget; ignored for non-group jobs.
    pub num_trials: Option<usize>,
}

/// A validated unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobSpec {
    Job(JobBase),
    Experiment(JobBase),
    Group(GroupSpec),
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Job(_) => JobKind::Job,
            Self::Experiment(_) => JobKind::Experiment,
            Self::Group(_) => JobKind::Group,
        }
    }

    pub fn base(&self) -> &JobBase {
        match self {
            Self::Job(base) | Self::Experiment(base) => base,
            Self::Group(group) => &group.base,
        }
    }

    pub fn name(&self) -> &str {
        &self.base().name
    }

    pub fn params(&self) -> &Params {
        &self.base().params
    }

    pub fn as_group(&self) -> Option<&GroupSpec> {
        match self {
            Self::Group(group) => Some(group),
            _ => None,
        }
    }

    /// Check every data-model invariant. Runs before any trial executes.
    pub fn validate(&self) -> HsResult<()> {
        match self {
            Self::Job(base) => base.validate(JobKind::Job),
            Self::Experiment(base) => base.validate(JobKind::Experiment),
            Self::Group(group) => group.validate(),
        }
    }

    /// Apply overrides and hand back the (now immutable) spec.
    pub fn with_overrides(self, overrides: JobOverrides) -> Self {
        let JobOverrides {
            metric,
            params,
            num_trials,
        } = overrides;

        match self {
            Self::Job(mut base) => {
                base.params.extend(params);
                Self::Job(base)
            }
            Self::Experiment(mut base) => {
                base.params.extend(params);
                Self::Experiment(base)
            }
            Self::Group(mut group) => {
                group.base.params.extend(params);
                if let Some(metric) = metric {
                    group.metric = Some(metric);
                }
                if let Some(n) = num_trials {
                    group.num_trials = n;
                }
                Self::Group(group)
            }
        }
    }
}
