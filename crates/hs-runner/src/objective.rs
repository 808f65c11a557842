//! The user's objective function and what it can see.

use hs_study::Trial;
use hs_types::{ConfigError, HsResult, ParamValue, Params};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::dataset::DataSource;
use crate::instrument::SeedRecorder;

/// Named metric values of one result.
pub type Metrics = BTreeMap<String, f64>;

/// Named artifact files of one result.
pub type Artifacts = BTreeMap<String, PathBuf>;

/// One `(metrics, artifacts)` pair produced by an objective.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    pub metrics: Metrics,
    pub artifacts: Artifacts,
}

impl StepResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn artifact(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.artifacts.insert(name.into(), path.into());
        self
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for StepResult {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self {
            metrics: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            artifacts: Artifacts::new(),
        }
    }
}

/// Shape of an objective's return value.
pub enum ObjectiveOutput {
    /// Nothing at all. Only valid for plain jobs and experiments.
    Empty,
    /// A single terminal result.
    Single(StepResult),
    /// A finite, non-restartable sequence of intermediate results, pulled one
    /// step at a time. Dropping it stops the computation.
    Sequence(Box<dyn Iterator<Item = anyhow::Result<StepResult>> + Send>),
}

impl ObjectiveOutput {
    pub fn sequence<I>(steps: I) -> Self
    where
        I: IntoIterator<Item = anyhow::Result<StepResult>>,
        I::IntoIter: Send + 'static,
    {
        Self::Sequence(Box::new(steps.into_iter()))
    }
}

impl From<StepResult> for ObjectiveOutput {
    fn from(result: StepResult) -> Self {
        Self::Single(result)
    }
}

impl fmt::Debug for ObjectiveOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Single(result) => f.debug_tuple("Single").field(result).finish(),
            Self::Sequence(_) => f.write_str("Sequence(..)"),
        }
    }
}

/// A user objective. Any `Fn(&TrialContext) -> anyhow::Result<ObjectiveOutput>`
/// qualifies.
pub trait Objective: Send + Sync {
    fn call(&self, ctx: &TrialContext) -> anyhow::Result<ObjectiveOutput>;
}

impl<F> Objective for F
where
    F: Fn(&TrialContext) -> anyhow::Result<ObjectiveOutput> + Send + Sync,
{
    fn call(&self, ctx: &TrialContext) -> anyhow::Result<ObjectiveOutput> {
        self(ctx)
    }
}

/// Everything an objective invocation can reach: merged parameters, the
/// shared dataset and, inside group jobs, the live trial.
#[derive(Debug, Clone)]
pub struct TrialContext {
    params: Params,
    data: DataSource,
    trial: Option<Trial>,
    seeds: Option<Arc<SeedRecorder>>,
}

impl TrialContext {
    pub fn new(params: Params, data: DataSource) -> Self {
        Self {
            params,
            data,
            trial: None,
            seeds: None,
        }
    }

    pub(crate) fn with_trial(mut self, trial: Trial) -> Self {
        self.trial = Some(trial);
        self
    }

    pub(crate) fn with_seed_recorder(mut self, seeds: Arc<SeedRecorder>) -> Self {
        self.seeds = Some(seeds);
        self
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    /// The shared dataset, downcast to the loader's type.
    pub fn load_data<T: Any + Send + Sync>(&self) -> HsResult<Arc<T>> {
        self.data.load()
    }

    /// The live trial, for suggesting parameters beyond the configured
    /// space.
    pub fn trial(&self) -> HsResult<&Trial> {
        self.trial
            .as_ref()
            .ok_or_else(|| ConfigError::TrialNotAvailable.into())
    }

    /// A deterministic RNG for `source`. With seed logging enabled, the first
    /// seed of each source is tagged on the tracking run.
    pub fn seeded_rng(&self, source: &str, seed: u64) -> HsResult<StdRng> {
        if let Some(seeds) = &self.seeds {
            seeds.record(source, seed)?;
        }
        Ok(StdRng::seed_from_u64(seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DataLoader;
    use rand::Rng;

    #[test]
    fn closures_are_objectives() {
        let objective = |ctx: &TrialContext| -> anyhow::Result<ObjectiveOutput> {
            let lr = ctx.param("lr").and_then(ParamValue::as_f64).unwrap_or(0.0);
            Ok(StepResult::new().metric("loss", lr * 2.0).into())
        };

        let mut params = Params::new();
        params.insert("lr".into(), ParamValue::Float(0.25));
        let ctx = TrialContext::new(params, DataSource::None);

        match objective.call(&ctx).unwrap() {
            ObjectiveOutput::Single(result) => assert_eq!(result.metrics["loss"], 0.5),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn trial_is_unavailable_outside_groups() {
        let ctx = TrialContext::new(Params::new(), DataSource::None);
        let err = ctx.trial().unwrap_err();
        assert!(matches!(
            err,
            hs_types::HsError::Config(ConfigError::TrialNotAvailable)
        ));
    }

    #[test]
    fn data_and_seeds_without_recorder() {
        let data = DataSource::Loader(DataLoader::new(|| Ok(String::from("corpus"))));
        let ctx = TrialContext::new(Params::new(), data);
        assert_eq!(ctx.load_data::<String>().unwrap().as_str(), "corpus");

        let a: u64 = ctx.seeded_rng("numpy", 7).unwrap().random();
        let b: u64 = ctx.seeded_rng("numpy", 7).unwrap().random();
        assert_eq!(a, b);
    }

    #[test]
    fn step_results_collect_from_pairs() {
        let result: StepResult = [("loss", 0.1), ("accuracy", 0.9)].into_iter().collect();
        assert_eq!(result.metrics.len(), 2);
        assert!(result.artifacts.is_empty());

        let seq = ObjectiveOutput::sequence((0..3).map(|i| Ok(StepResult::new().metric("step", i as f64))));
        let ObjectiveOutput::Sequence(steps) = seq else {
            panic!("expected a sequence");
        };
        assert_eq!(steps.count(), 3);
    }
}
