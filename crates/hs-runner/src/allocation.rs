//! Worker allocation for group jobs.

use hs_types::{ClusterConfig, WorkerResources};
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterResources;

/// Allocation plan handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAllocation {
    /// Number of workers to dispatch.
    pub worker_count: usize,

    /// Trials each worker runs; `trial_shares[0]` carries the remainder.
    pub trial_shares: Vec<usize>,

    /// Per-worker resource reservation.
    pub resources: WorkerResources,

    /// Capacity the plan was computed against.
    pub available_cpu: f64,
    pub available_gpu: f64,
}

impl WorkerAllocation {
    /// Plan a group of `num_trials` trials against the reported capacity.
    /// Configured cluster hints take precedence over what the cluster reports.
    pub fn plan(
        resources: &WorkerResources,
        reported: &ClusterResources,
        hints: Option<&ClusterConfig>,
        num_trials: usize,
    ) -> Self {
        let available_cpu = hints
            .and_then(|c| c.num_cpus)
            .map(f64::from)
            .or(reported.cpu)
            .unwrap_or(1.0);
        let available_gpu = hints
            .and_then(|c| c.num_gpus)
            .map(f64::from)
            .or(reported.gpu)
            .unwrap_or(0.0);

        let worker_count = compute_worker_count(resources, available_cpu, available_gpu, num_trials);
        Self {
            worker_count,
            trial_shares: partition_trials(num_trials, worker_count),
            resources: resources.clone(),
            available_cpu,
            available_gpu,
        }
    }
}

/// How many workers fit at once: bounded by cpu, by gpu when workers need
/// one, and by the number of trials. Never less than one.
pub fn compute_worker_count(
    resources: &WorkerResources,
    available_cpu: f64,
    available_gpu: f64,
    num_trials: usize,
) -> usize {
    let by_cpu = if resources.cpu > 0.0 {
        available_cpu / resources.cpu
    } else {
        f64::INFINITY
    };
    let by_gpu = if resources.gpu > 0.0 {
        available_gpu / resources.gpu
    } else {
        f64::INFINITY
    };

    let workers = by_cpu.min(by_gpu).min(num_trials as f64).floor();
    if workers.is_finite() && workers >= 1.0 {
        workers as usize
    } else {
        1
    }
}

/// Split `num_trials` across `workers`: everyone gets the quotient and worker
/// 0 also takes the remainder.
pub fn partition_trials(num_trials: usize, workers: usize) -> Vec<usize> {
    let workers = workers.max(1);
    let mut shares = vec![num_trials / workers; workers];
    shares[0] += num_trials % workers;
    shares
}
