//! Execution cluster interface and the in-process implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use hs_types::{ClusterConfig, ClusterError, HsResult, WorkerResources};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

/// A value published to the cluster's object store.
pub type SharedObject = Arc<dyn Any + Send + Sync>;

/// Work shipped to a cluster worker.
pub type RemoteTask = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of an object in the cluster's object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Currently available capacity as reported by a cluster. A cluster may not
/// report a resource at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterResources {
    pub cpu: Option<f64>,
    pub gpu: Option<f64>,
}

/// The execution cluster collaborator.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Query currently available capacity.
    async fn available_resources(&self) -> HsResult<ClusterResources>;

    /// Run `task` on a worker holding `resources` until it returns.
    fn submit(&self, resources: &WorkerResources, task: RemoteTask) -> HsResult<()>;

    /// Publish an immutable object every worker can read.
    fn put(&self, object: SharedObject) -> HsResult<ObjectId>;

    fn get(&self, id: &ObjectId) -> HsResult<SharedObject>;
}

/// Pending result of a dispatched task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    worker: usize,
    rx: oneshot::Receiver<Result<T, String>>,
}

impl<T> TaskHandle<T> {
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Wait for the task. A panic inside the task surfaces as
    /// [`ClusterError::WorkerPanicked`].
    pub async fn join(self) -> HsResult<T> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(ClusterError::WorkerPanicked {
                worker: self.worker,
                message,
            }
            .into()),
            Err(_) => Err(ClusterError::WorkerLost {
                worker: self.worker,
            }
            .into()),
        }
    }
}

/// Dispatch a typed task to `cluster` with a resource reservation.
pub fn dispatch<T, F>(
    cluster: &dyn Cluster,
    worker: usize,
    resources: &WorkerResources,
    task: F,
) -> HsResult<TaskHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    cluster.submit(
        resources,
        Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(task)).map_err(|p| panic_message(p.as_ref()));
            let _ = tx.send(outcome);
        }),
    )?;
    debug!(worker, cpu = resources.cpu, gpu = resources.gpu, "Dispatched task");
    Ok(TaskHandle { worker, rx })
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[derive(Debug, Default)]
struct Reserved {
    cpu: f64,
    gpu: f64,
}

/// In-process cluster: a rayon thread pool with one thread per CPU unit and a
/// concurrent object store.
pub struct LocalCluster {
    pool: rayon::ThreadPool,
    cpu_capacity: f64,
    gpu_capacity: f64,
    reserved: Arc<Mutex<Reserved>>,
    objects: DashMap<ObjectId, SharedObject>,
}

impl fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCluster")
            .field("cpu_capacity", &self.cpu_capacity)
            .field("gpu_capacity", &self.gpu_capacity)
            .field("objects", &self.objects.len())
            .finish()
    }
}

impl LocalCluster {
    pub fn new(cpus: u32, gpus: u32) -> HsResult<Self> {
        let threads = cpus.max(1) as usize;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("hs-worker-{i}"))
            .build()
            .map_err(|e| ClusterError::ResourceQuery {
                message: format!("cannot start local worker pool: {e}"),
            })?;

        info!("Started local cluster with {} cpu / {} gpu", cpus, gpus);
        Ok(Self {
            pool,
            cpu_capacity: f64::from(cpus.max(1)),
            gpu_capacity: f64::from(gpus),
            reserved: Arc::new(Mutex::new(Reserved::default())),
            objects: DashMap::new(),
        })
    }

    /// Size the cluster from the machine, or from configured hints.
    pub fn from_config(config: Option<&ClusterConfig>) -> HsResult<Self> {
        let detected = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let cpus = config.and_then(|c| c.num_cpus).unwrap_or(detected);
        let gpus = config.and_then(|c| c.num_gpus).unwrap_or(0);
        Self::new(cpus, gpus)
    }
}

#[async_trait]
impl Cluster for LocalCluster {
    async fn available_resources(&self) -> HsResult<ClusterResources> {
        let reserved = self.reserved.lock();
        Ok(ClusterResources {
            cpu: Some((self.cpu_capacity - reserved.cpu).max(0.0)),
            gpu: Some((self.gpu_capacity - reserved.gpu).max(0.0)),
        })
    }

    fn submit(&self, resources: &WorkerResources, task: RemoteTask) -> HsResult<()> {
        if resources.cpu > self.cpu_capacity || resources.gpu > self.gpu_capacity {
            return Err(ClusterError::InsufficientResources {
                requested_cpu: resources.cpu,
                requested_gpu: resources.gpu,
                capacity_cpu: self.cpu_capacity,
                capacity_gpu: self.gpu_capacity,
            }
            .into());
        }

        let reserved = Arc::clone(&self.reserved);
        let (cpu, gpu) = (resources.cpu, resources.gpu);
        self.pool.spawn(move || {
            {
                let mut r = reserved.lock();
                r.cpu += cpu;
                r.gpu += gpu;
            }
            task();
            let mut r = reserved.lock();
            r.cpu -= cpu;
            r.gpu -= gpu;
        });
        Ok(())
    }

    fn put(&self, object: SharedObject) -> HsResult<ObjectId> {
        let id = ObjectId::new();
        self.objects.insert(id.clone(), object);
        debug!(object = %id, "Published shared object");
        Ok(id)
    }

    fn get(&self, id: &ObjectId) -> HsResult<SharedObject> {
        self.objects
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ClusterError::ObjectNotFound {
                    object_id: id.to_string(),
                }
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_types::HsError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn reports_capacity() {
        let cluster = LocalCluster::new(4, 1).unwrap();
        let resources = cluster.available_resources().await.unwrap();
        assert_eq!(resources.cpu, Some(4.0));
        assert_eq!(resources.gpu, Some(1.0));
    }

    #[tokio::test]
    async fn dispatched_tasks_return_values() {
        let cluster = LocalCluster::new(2, 0).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let counter = Arc::clone(&counter);
                dispatch(&cluster, i, &WorkerResources::default(), move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    i * 10
                })
                .unwrap()
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.join().await.unwrap());
        }
        assert_eq!(results, vec![0, 10, 20, 30]);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn panics_surface_as_worker_errors() {
        let cluster = LocalCluster::new(1, 0).unwrap();
        let handle = dispatch(&cluster, 3, &WorkerResources::default(), || -> usize {
            panic!("worker exploded")
        })
        .unwrap();

        match handle.join().await.unwrap_err() {
            HsError::Cluster(ClusterError::WorkerPanicked { worker, message }) => {
                assert_eq!(worker, 3);
                assert!(message.contains("worker exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn oversized_reservations_are_rejected() {
        let cluster = LocalCluster::new(2, 0).unwrap();
        let gpu_task = WorkerResources { cpu: 1.0, gpu: 1.0 };
        let err = cluster.submit(&gpu_task, Box::new(|| {})).unwrap_err();
        assert!(matches!(
            err,
            HsError::Cluster(ClusterError::InsufficientResources { .. })
        ));
    }

    #[test]
    fn object_store_round_trip() {
        let cluster = LocalCluster::new(1, 0).unwrap();
        let id = cluster.put(Arc::new(vec![1u8, 2, 3])).unwrap();
        let object = cluster.get(&id).unwrap();
        assert_eq!(object.downcast_ref::<Vec<u8>>(), Some(&vec![1u8, 2, 3]));
        assert!(cluster.get(&ObjectId::new()).is_err());
    }
}
