use thiserror::Error;

/// Main error type for the Hypersweep system
#[derive(Error, Debug)]
pub enum HsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Study error: {0}")]
    Study(#[from] StudyError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Tracking error: {0}")]
    Tracking(#[from] TrackingError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    /// The objective (or an observer) of a job failed at runtime.
    #[error("Job {job} failed: {message}")]
    JobFailed { job: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HsError {
    /// Configuration errors are raised before (or instead of) running trials
    /// and are never retried.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Errors in a job specification or in the contract between the runner and
/// the user's objective function.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("group.metric: optimization metric must be specified for group jobs")]
    MissingMetric,

    #[error("{field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("value must be of the form {expected} but `{got}` was received")]
    InvalidDistribution { expected: String, got: String },

    #[error("group.sampler: unknown sampler `{id}` (known: {known})")]
    UnknownSampler { id: String, known: String },

    #[error("group.pruner: unknown pruner `{id}` (known: {known})")]
    UnknownPruner { id: String, known: String },

    #[error("study storage URI not specified; set HYPERSWEEP_STUDY_STORAGE_URI")]
    MissingStorageUri,

    #[error("unsupported URI `{uri}` (expected memory:// or file://<path>)")]
    UnsupportedUri { uri: String },

    #[error("objective did not return the optimization metric `{metric}` (returned: [{returned}])")]
    MetricNotReturned { metric: String, returned: String },

    #[error("group objective functions must always return metrics and/or artifacts")]
    EmptyObjectiveResult,

    #[error("the current trial is only available inside group jobs")]
    TrialNotAvailable,
}

/// Study storage and trial bookkeeping errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StudyError {
    #[error("Study not found: {study}")]
    NotFound { study: String },

    #[error("Study already exists: {study}")]
    AlreadyExists { study: String },

    #[error("Trial {number} not found in study {study}")]
    TrialNotFound { study: String, number: u64 },

    #[error("Trial {number} is already finished")]
    TrialFinished { number: u64 },

    #[error("No completed trials in study {study}")]
    NoCompletedTrials { study: String },

    #[error("Storage backend failure: {message}")]
    Storage { message: String },
}

/// Resource query, dispatch and shared-object errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("Cannot query available resources: {message}")]
    ResourceQuery { message: String },

    #[error("Cannot dispatch task: {message}")]
    Dispatch { message: String },

    #[error(
        "Insufficient resources: task requires {requested_cpu} cpu / {requested_gpu} gpu, \
         cluster capacity is {capacity_cpu} cpu / {capacity_gpu} gpu"
    )]
    InsufficientResources {
        requested_cpu: f64,
        requested_gpu: f64,
        capacity_cpu: f64,
        capacity_gpu: f64,
    },

    #[error("Shared object not found: {object_id}")]
    ObjectNotFound { object_id: String },

    #[error("Worker {worker} panicked: {message}")]
    WorkerPanicked { worker: usize, message: String },

    #[error("Worker {worker} was lost before reporting a result")]
    WorkerLost { worker: usize },
}

/// Tracking transport errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackingError {
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Run already closed: {run_id}")]
    RunClosed { run_id: String },

    #[error("Tracking storage failure: {message}")]
    Storage { message: String },
}

/// Shared dataset errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Trying to access data that was never loaded; supply a data loader to the job runner")]
    NotLoaded,

    #[error("Shared dataset is not of the requested type {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("Data loader failed: {message}")]
    LoaderFailed { message: String },
}

/// Result type alias for Hypersweep operations
pub type HsResult<T> = Result<T, HsError>;

/// Macro for creating field-level configuration errors
#[macro_export]
macro_rules! config_error {
    ($field:expr, $($arg:tt)*) => {
        $crate::HsError::Config($crate::ConfigError::InvalidField {
            field: ($field).to_string(),
            message: format!($($arg)*),
        })
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HsError::Internal(format!($($arg)*))
    };
}
