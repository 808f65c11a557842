//! Shared dataset broker.
//!
//! The driver runs the user's loader once, publishes the value to the
//! cluster's object store and hands workers a [`DatasetHandle`]. Objective
//! code reads it through [`DataSource::load`] and never knows whether the value
//! was broadcast or loaded locally.

use hs_types::{DataError, HsResult};
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::cluster::{Cluster, ObjectId, SharedObject};

/// A user-supplied dataset loader.
#[derive(Clone)]
pub struct DataLoader(Arc<dyn Fn() -> anyhow::Result<SharedObject> + Send + Sync>);

impl DataLoader {
    pub fn new<T, F>(load: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self(Arc::new(move || Ok(Arc::new(load()?) as SharedObject)))
    }

    pub fn load(&self) -> HsResult<SharedObject> {
        (self.0)().map_err(|e| {
            DataError::LoaderFailed {
                message: format!("{e:#}"),
            }
            .into()
        })
    }
}

impl fmt::Debug for DataLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataLoader")
    }
}

/// Reference to a published dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetHandle {
    id: ObjectId,
}

impl DatasetHandle {
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Fetch the published value. Workers call this once at startup.
    pub fn resolve(&self, cluster: &dyn Cluster) -> HsResult<DataSource> {
        Ok(DataSource::Shared(cluster.get(&self.id)?))
    }
}

/// Run the loader and publish its result. This is the only place a loader
/// runs for group jobs.
pub fn publish(cluster: &dyn Cluster, loader: &DataLoader) -> HsResult<DatasetHandle> {
    let data = loader.load()?;
    let id = cluster.put(data)?;
    info!(object = %id, "Published shared dataset");
    Ok(DatasetHandle { id })
}

/// Where objective code gets its data from.
#[derive(Clone, Default)]
pub enum DataSource {
    /// No loader was configured.
    #[default]
    None,
    /// An already-loaded value shared by every worker.
    Shared(SharedObject),
    /// Load on demand, for single jobs running in-process.
    Loader(DataLoader),
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("DataSource::None"),
            Self::Shared(_) => f.write_str("DataSource::Shared"),
            Self::Loader(_) => f.write_str("DataSource::Loader"),
        }
    }
}

impl DataSource {
    /// The dataset, downcast to the type the loader produced.
    pub fn load<T: Any + Send + Sync>(&self) -> HsResult<Arc<T>> {
        let object = match self {
            Self::None => return Err(DataError::NotLoaded.into()),
            Self::Shared(object) => Arc::clone(object),
            Self::Loader(loader) => loader.load()?,
        };
        object.downcast::<T>().map_err(|_| {
            DataError::TypeMismatch {
                expected: type_name::<T>(),
            }
            .into()
        })
    }
}
