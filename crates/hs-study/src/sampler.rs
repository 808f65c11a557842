//! Parameter samplers.

use hs_types::{config_error, Distribution, HsError, HsResult, ParamValue};
use parking_lot::Mutex;
use rand::distr::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::trial::TrialRecord;

/// Draws parameter values for new trials.
///
/// Samplers see the history of the study so model-based strategies can bias
/// toward promising regions; the random sampler ignores it.
pub trait Sampler: Send + Sync {
    fn sample(
        &self,
        history: &[TrialRecord],
        name: &str,
        distribution: &Distribution,
    ) -> HsResult<ParamValue>;

    /// Registry identifier.
    fn name(&self) -> &str;
}

/// Independent uniform sampling from each distribution.
pub struct RandomSampler {
    rng: Mutex<StdRng>,
}

impl RandomSampler {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Reproducible draws, for tests and seeded studies.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RandomSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomSampler").finish_non_exhaustive()
    }
}

impl Sampler for RandomSampler {
    fn sample(
        &self,
        _history: &[TrialRecord],
        name: &str,
        distribution: &Distribution,
    ) -> HsResult<ParamValue> {
        let mut rng = self.rng.lock();
        let value = match distribution {
            Distribution::Uniform { low, high } => {
                let uniform = Uniform::new_inclusive(*low, *high)
                    .map_err(|_| unusable(name, distribution))?;
                ParamValue::Float(rng.sample(uniform))
            }
            Distribution::LogUniform { low, high } => {
                check_bounds(name, *low > 0.0 && *low <= *high, distribution)?;
                let uniform = Uniform::new_inclusive(low.ln(), high.ln())
                    .map_err(|_| unusable(name, distribution))?;
                let log_val: f64 = rng.sample(uniform);
                ParamValue::Float(log_val.exp().clamp(*low, *high))
            }
            Distribution::RandInt { low, high } => {
                check_bounds(name, low <= high, distribution)?;
                ParamValue::Int(rng.random_range(*low..=*high))
            }
            Distribution::Range { .. } => {
                let len = distribution.range_len().unwrap_or(0);
                check_bounds(name, len > 0, distribution)?;
                let value = distribution
                    .range_value(rng.random_range(0..len))
                    .ok_or_else(|| unusable(name, distribution))?;
                ParamValue::Int(value)
            }
            Distribution::Choice { choices } => {
                check_bounds(name, !choices.is_empty(), distribution)?;
                let idx = rng.random_range(0..choices.len());
                ParamValue::from_json(choices[idx].clone())
            }
        };
        Ok(value)
    }

    fn name(&self) -> &str {
        "random"
    }
}

fn check_bounds(name: &str, ok: bool, distribution: &Distribution) -> HsResult<()> {
    if ok {
        Ok(())
    } else {
        Err(unusable(name, distribution))
    }
}

fn unusable(name: &str, distribution: &Distribution) -> HsError {
    config_error!(
        format!("group.params.{name}"),
        "cannot sample from distribution `{distribution}`: {}",
        distribution.grammar()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn draw(sampler: &RandomSampler, spec: &str) -> ParamValue {
        let dist: Distribution = spec.parse().unwrap();
        sampler.sample(&[], "p", &dist).unwrap()
    }

    #[test]
    fn seeded_samplers_are_reproducible() {
        let a = RandomSampler::seeded(7);
        let b = RandomSampler::seeded(7);
        for _ in 0..20 {
            assert_eq!(draw(&a, "uniform(0, 1)"), draw(&b, "uniform(0, 1)"));
        }
    }

    #[test]
    fn choice_returns_one_of_the_choices() {
        let sampler = RandomSampler::seeded(1);
        let dist: Distribution = "choice(['adam', 'sgd'])".parse().unwrap();
        for _ in 0..50 {
            let value = sampler.sample(&[], "optimizer", &dist).unwrap();
            assert!(matches!(value.as_str(), Some("adam") | Some("sgd")));
        }
    }

    #[test]
    fn range_excludes_stop() {
        let sampler = RandomSampler::seeded(3);
        for _ in 0..100 {
            let v = draw(&sampler, "range(0, 10, 5)").as_i64().unwrap();
            assert!(v == 0 || v == 5);
        }
    }

    #[test]
    fn randint_is_inclusive_on_both_ends() {
        let sampler = RandomSampler::seeded(5);
        let seen: std::collections::BTreeSet<i64> = (0..300)
            .map(|_| draw(&sampler, "randint(1, 3)").as_i64().unwrap())
            .collect();
        assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn stepped_range_hits_every_value_and_nothing_else() {
        let sampler = RandomSampler::seeded(9);
        let seen: std::collections::BTreeSet<i64> = (0..500)
            .map(|_| draw(&sampler, "range(0, 10, 2)").as_i64().unwrap())
            .collect();
        assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn huge_ranges_sample_without_materializing() {
        let sampler = RandomSampler::seeded(2);
        let dist = Distribution::Range { start: i64::MIN, stop: i64::MAX, step: 3 };
        for _ in 0..20 {
            let value = sampler.sample(&[], "x", &dist).unwrap();
            assert!(dist.contains(&value), "{value} outside {dist}");
        }
    }

    #[test]
    fn overflowing_uniform_width_is_a_config_error() {
        let sampler = RandomSampler::seeded(1);
        // Built directly: the parser already rejects this width.
        let dist = Distribution::Uniform { low: -1e308, high: 1e308 };
        let err = sampler.sample(&[], "x", &dist).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("group.params.x"), "{err}");
    }

    #[test]
    fn empty_choice_is_reported_against_the_parameter() {
        let sampler = RandomSampler::seeded(3);
        let dist = Distribution::Choice { choices: vec![] };
        let err = sampler.sample(&[], "activation", &dist).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("group.params.activation"));
    }

    proptest! {
        #[test]
        fn draws_stay_inside_their_distribution(
            seed in any::<u64>(),
            low in -1000.0f64..1000.0,
            width in 0.0f64..1000.0,
            ilow in -1000i64..1000,
            iwidth in 0i64..1000,
        ) {
            let sampler = RandomSampler::seeded(seed);
            let dists = [
                Distribution::Uniform { low, high: low + width },
                Distribution::LogUniform { low: width + 1e-3, high: width + 10.0 },
                Distribution::RandInt { low: ilow, high: ilow + iwidth },
                Distribution::Range { start: ilow, stop: ilow + iwidth + 1, step: 2 },
            ];
            for dist in &dists {
                let value = sampler.sample(&[], "x", dist).unwrap();
                prop_assert!(dist.contains(&value), "{value} outside {dist}");
            }
        }
    }
}
