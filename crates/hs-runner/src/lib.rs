//! # hs-runner
//!
//! Drives Hypersweep jobs. A [`JobRunner`] validates a [`hs_types::JobSpec`],
//! then either runs the objective once under a tracked run (jobs and
//! experiments) or plans workers against the cluster, publishes the shared
//! dataset and lets every worker pull trials from one study (groups).
//!
//! Each trial gets its own tracking run, closed by a [`RunGuard`] whatever
//! the outcome, and lifecycle hooks reach every registered [`Callback`].

pub mod allocation;
pub mod cluster;
pub mod dataset;
pub mod driver;
pub mod executor;
pub mod guard;
pub mod instrument;
pub mod notify;
pub mod objective;
pub mod telemetry;
pub mod tracking;

pub use allocation::WorkerAllocation;
pub use cluster::{dispatch, Cluster, ClusterResources, LocalCluster, TaskHandle};
pub use dataset::{DataLoader, DataSource, DatasetHandle};
pub use driver::{JobReport, JobRunner, WorkerReport};
pub use executor::{execute_job, RunOptions, TrialExecutor};
pub use guard::{RunGuard, TRACEBACK_ARTIFACT};
pub use instrument::{SeedRecorder, SystemInfo};
pub use notify::{
    Callback, CallbackHandler, ChannelObserver, LifecycleEvent, MessageNotifier, MessageSink,
    TracingSink,
};
pub use objective::{Artifacts, Metrics, Objective, ObjectiveOutput, StepResult, TrialContext};
pub use telemetry::init_logging;
pub use tracking::{tracker_from_uri, FileTracker, InMemoryTracker, RunRecord, RunStatus, Tracker};
