//! Study storage backends.
//!
//! Storage is the single source of truth for trial numbering: every worker
//! allocates trials through [`StudyStorage::create_trial`], which is atomic
//! per study.

use chrono::Utc;
use dashmap::DashMap;
use hs_types::{BackendUri, Direction, Distribution, HsResult, ParamValue, StudyError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::trial::{FinishedTrial, TrialNumber, TrialRecord, TrialState};

/// Persistent study state shared by every worker of a group job.
pub trait StudyStorage: Send + Sync {
    /// Fails with [`StudyError::AlreadyExists`] if the name is taken.
    fn create_study(&self, name: &str, direction: Direction) -> HsResult<()>;

    /// Returns whether a study was removed.
    fn delete_study(&self, name: &str) -> HsResult<bool>;

    fn study_direction(&self, name: &str) -> HsResult<Direction>;

    fn study_names(&self) -> HsResult<Vec<String>>;

    /// Allocate the next trial number and register the trial in `Sampling`.
    fn create_trial(&self, study: &str) -> HsResult<TrialNumber>;

    fn set_trial_param(
        &self,
        study: &str,
        number: TrialNumber,
        name: &str,
        value: ParamValue,
        distribution: Distribution,
    ) -> HsResult<()>;

    fn set_trial_state(&self, study: &str, number: TrialNumber, state: TrialState)
        -> HsResult<()>;

    fn set_trial_user_attr(
        &self,
        study: &str,
        number: TrialNumber,
        key: &str,
        value: &str,
    ) -> HsResult<()>;

    fn report_intermediate(
        &self,
        study: &str,
        number: TrialNumber,
        step: u64,
        value: f64,
    ) -> HsResult<()>;

    /// Move a trial to its terminal state. Fails with
    /// [`StudyError::TrialFinished`] if it already has one.
    fn finish_trial(
        &self,
        study: &str,
        number: TrialNumber,
        outcome: FinishedTrial,
    ) -> HsResult<TrialRecord>;

    fn get_trial(&self, study: &str, number: TrialNumber) -> HsResult<TrialRecord>;

    /// All trials of a study, ordered by number.
    fn get_trials(&self, study: &str) -> HsResult<Vec<TrialRecord>>;
}

/// Open the backend named by a storage URI.
pub fn storage_from_uri(uri: &str) -> HsResult<Arc<dyn StudyStorage>> {
    match uri.parse::<BackendUri>()? {
        BackendUri::Memory => Ok(Arc::new(InMemoryStorage::new())),
        BackendUri::File(path) => Ok(Arc::new(FileStorage::open(path)?)),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StudyData {
    direction: Direction,
    /// Indexed by trial number.
    trials: Vec<TrialRecord>,
}

impl StudyData {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            trials: Vec::new(),
        }
    }

    fn trial(&self, study: &str, number: TrialNumber) -> HsResult<&TrialRecord> {
        self.trials
            .get(number as usize)
            .ok_or_else(|| not_found(study, number))
    }

    fn trial_mut(&mut self, study: &str, number: TrialNumber) -> HsResult<&mut TrialRecord> {
        self.trials
            .get_mut(number as usize)
            .ok_or_else(|| not_found(study, number))
    }

    /// A trial that is still open for writes.
    fn open_trial(&mut self, study: &str, number: TrialNumber) -> HsResult<&mut TrialRecord> {
        let trial = self.trial_mut(study, number)?;
        if trial.state.is_finished() {
            return Err(StudyError::TrialFinished { number }.into());
        }
        Ok(trial)
    }

    fn create_trial(&mut self) -> TrialNumber {
        let number = self.trials.len() as TrialNumber;
        self.trials.push(TrialRecord::new(number));
        number
    }

    fn finish(
        &mut self,
        study: &str,
        number: TrialNumber,
        outcome: FinishedTrial,
    ) -> HsResult<TrialRecord> {
        let trial = self.open_trial(study, number)?;
        trial.state = outcome.state();
        trial.finished_at = Some(Utc::now());
        match outcome {
            FinishedTrial::Completed { value } => trial.value = Some(value),
            FinishedTrial::Pruned => trial.value = trial.last_report().map(|(_, v)| v),
            FinishedTrial::Failed { error } => trial.error = Some(error),
        }
        Ok(trial.clone())
    }
}

fn not_found(study: &str, number: TrialNumber) -> hs_types::HsError {
    StudyError::TrialNotFound {
        study: study.to_string(),
        number,
    }
    .into()
}

fn study_not_found(study: &str) -> hs_types::HsError {
    StudyError::NotFound {
        study: study.to_string(),
    }
    .into()
}

/// Process-local storage. Each study sits behind its own lock so workers of
/// different studies never contend.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    studies: DashMap<String, Arc<Mutex<StudyData>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_snapshot(snapshot: BTreeMap<String, StudyData>) -> Self {
        let studies = DashMap::new();
        for (name, data) in snapshot {
            studies.insert(name, Arc::new(Mutex::new(data)));
        }
        Self { studies }
    }

    fn snapshot(&self) -> BTreeMap<String, StudyData> {
        self.studies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().clone()))
            .collect()
    }

    fn study(&self, name: &str) -> HsResult<Arc<Mutex<StudyData>>> {
        self.studies
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| study_not_found(name))
    }

    fn update<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut StudyData) -> HsResult<R>,
    ) -> HsResult<R> {
        let study = self.study(name)?;
        let mut data = study.lock();
        f(&mut data)
    }
}

impl StudyStorage for InMemoryStorage {
    fn create_study(&self, name: &str, direction: Direction) -> HsResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.studies.entry(name.to_string()) {
            Entry::Occupied(_) => Err(StudyError::AlreadyExists {
                study: name.to_string(),
            }
            .into()),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(StudyData::new(direction))));
                debug!(study = name, %direction, "Created study");
                Ok(())
            }
        }
    }

    fn delete_study(&self, name: &str) -> HsResult<bool> {
        Ok(self.studies.remove(name).is_some())
    }

    fn study_direction(&self, name: &str) -> HsResult<Direction> {
        Ok(self.study(name)?.lock().direction)
    }

    fn study_names(&self) -> HsResult<Vec<String>> {
        let mut names: Vec<String> = self.studies.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    fn create_trial(&self, study: &str) -> HsResult<TrialNumber> {
        self.update(study, |data| Ok(data.create_trial()))
    }

    fn set_trial_param(
        &self,
        study: &str,
        number: TrialNumber,
        name: &str,
        value: ParamValue,
        distribution: Distribution,
    ) -> HsResult<()> {
        self.update(study, |data| {
            let trial = data.open_trial(study, number)?;
            trial.params.insert(name.to_string(), value);
            trial.distributions.insert(name.to_string(), distribution);
            Ok(())
        })
    }

    fn set_trial_state(
        &self,
        study: &str,
        number: TrialNumber,
        state: TrialState,
    ) -> HsResult<()> {
        self.update(study, |data| {
            data.open_trial(study, number)?.state = state;
            Ok(())
        })
    }

    fn set_trial_user_attr(
        &self,
        study: &str,
        number: TrialNumber,
        key: &str,
        value: &str,
    ) -> HsResult<()> {
        self.update(study, |data| {
            data.trial_mut(study, number)?
                .user_attrs
                .insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn report_intermediate(
        &self,
        study: &str,
        number: TrialNumber,
        step: u64,
        value: f64,
    ) -> HsResult<()> {
        self.update(study, |data| {
            data.open_trial(study, number)?.intermediate.insert(step, value);
            Ok(())
        })
    }

    fn finish_trial(
        &self,
        study: &str,
        number: TrialNumber,
        outcome: FinishedTrial,
    ) -> HsResult<TrialRecord> {
        self.update(study, |data| data.finish(study, number, outcome))
    }

    fn get_trial(&self, study: &str, number: TrialNumber) -> HsResult<TrialRecord> {
        self.update(study, |data| data.trial(study, number).cloned())
    }

    fn get_trials(&self, study: &str) -> HsResult<Vec<TrialRecord>> {
        self.update(study, |data| Ok(data.trials.clone()))
    }
}

/// JSON-file storage for studies that outlive the process.
///
/// Mutations are applied in memory and the whole file is rewritten (via a
/// temporary file and rename) before the call returns.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    inner: InMemoryStorage,
    write_lock: Mutex<()>,
}

#[derive(Serialize, Deserialize, Default)]
struct StudyFile {
    studies: BTreeMap<String, StudyData>,
}

impl FileStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> HsResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str::<StudyFile>(&raw).map_err(|e| StudyError::Storage {
                message: format!("unreadable study file {}: {e}", path.display()),
            })?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            StudyFile::default()
        };

        debug!(path = %path.display(), studies = file.studies.len(), "Opened study file");
        Ok(Self {
            path,
            inner: InMemoryStorage::from_snapshot(file.studies),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist<R>(&self, result: HsResult<R>) -> HsResult<R> {
        let value = result?;
        let _guard = self.write_lock.lock();
        let file = StudyFile {
            studies: self.inner.snapshot(),
        };
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(value)
    }
}

impl StudyStorage for FileStorage {
    fn create_study(&self, name: &str, direction: Direction) -> HsResult<()> {
        self.persist(self.inner.create_study(name, direction))
    }

    fn delete_study(&self, name: &str) -> HsResult<bool> {
        self.persist(self.inner.delete_study(name))
    }

    fn study_direction(&self, name: &str) -> HsResult<Direction> {
        self.inner.study_direction(name)
    }

    fn study_names(&self) -> HsResult<Vec<String>> {
        self.inner.study_names()
    }

    fn create_trial(&self, study: &str) -> HsResult<TrialNumber> {
        self.persist(self.inner.create_trial(study))
    }

    fn set_trial_param(
        &self,
        study: &str,
        number: TrialNumber,
        name: &str,
        value: ParamValue,
        distribution: Distribution,
    ) -> HsResult<()> {
        self.persist(
            self.inner
                .set_trial_param(study, number, name, value, distribution),
        )
    }

    fn set_trial_state(
        &self,
        study: &str,
        number: TrialNumber,
        state: TrialState,
    ) -> HsResult<()> {
        self.persist(self.inner.set_trial_state(study, number, state))
    }

    fn set_trial_user_attr(
        &self,
        study: &str,
        number: TrialNumber,
        key: &str,
        value: &str,
    ) -> HsResult<()> {
        self.persist(self.inner.set_trial_user_attr(study, number, key, value))
    }

    fn report_intermediate(
        &self,
        study: &str,
        number: TrialNumber,
        step: u64,
        value: f64,
    ) -> HsResult<()> {
        self.persist(self.inner.report_intermediate(study, number, step, value))
    }

    fn finish_trial(
        &self,
        study: &str,
        number: TrialNumber,
        outcome: FinishedTrial,
    ) -> HsResult<TrialRecord> {
        self.persist(self.inner.finish_trial(study, number, outcome))
    }

    fn get_trial(&self, study: &str, number: TrialNumber) -> HsResult<TrialRecord> {
        self.inner.get_trial(study, number)
    }

    fn get_trials(&self, study: &str) -> HsResult<Vec<TrialRecord>> {
        self.inner.get_trials(study)
    }
}
