//! # hs-study
//!
//! Study coordination for Hypersweep group jobs.
//!
//! A study is the persisted record of every trial of one group job. Workers
//! share it only through a [`StudyStorage`] backend, which hands out trial
//! numbers atomically. Samplers draw parameters, pruners stop unpromising
//! trials early, and [`Study::optimize`] drives a worker's trial loop.

mod pruner;
mod registry;
mod sampler;
mod storage;
mod study;
mod trial;

pub use pruner::{MedianPruner, NopPruner, PercentilePruner, Pruner};
pub use registry::{pruner_from_id, sampler_from_id, validate_ids, KNOWN_PRUNERS, KNOWN_SAMPLERS};
pub use sampler::{RandomSampler, Sampler};
pub use storage::{storage_from_uri, FileStorage, InMemoryStorage, StudyStorage};
pub use study::{OptimizeReport, Study, StudySummary};
pub use trial::{FinishedTrial, Trial, TrialError, TrialNumber, TrialRecord, TrialState};
