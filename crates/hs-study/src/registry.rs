//! Sampler and pruner lookup by configuration id.

use hs_types::{ConfigError, GroupSpec, HsResult};
use std::sync::Arc;

use crate::pruner::{MedianPruner, NopPruner, PercentilePruner, Pruner};
use crate::sampler::{RandomSampler, Sampler};

pub const KNOWN_SAMPLERS: &[&str] = &["random"];
pub const KNOWN_PRUNERS: &[&str] = &["nop", "median", "percentile"];

/// `None` selects the default random sampler.
pub fn sampler_from_id(id: Option<&str>) -> HsResult<Arc<dyn Sampler>> {
    match id.unwrap_or("random") {
        "random" => Ok(Arc::new(RandomSampler::new())),
        other => Err(ConfigError::UnknownSampler {
            id: other.to_string(),
            known: KNOWN_SAMPLERS.join(", "),
        }
        .into()),
    }
}

/// `None` disables pruning.
pub fn pruner_from_id(id: Option<&str>) -> HsResult<Arc<dyn Pruner>> {
    match id.unwrap_or("nop") {
        "nop" => Ok(Arc::new(NopPruner)),
        "median" => Ok(Arc::new(MedianPruner::new())),
        // Prunes the worst quartile.
        "percentile" => Ok(Arc::new(PercentilePruner::new(75.0)?)),
        other => Err(ConfigError::UnknownPruner {
            id: other.to_string(),
            known: KNOWN_PRUNERS.join(", "),
        }
        .into()),
    }
}

/// Resolve both ids without building anything, so bad ids surface during
/// validation rather than on a worker.
pub fn validate_ids(group: &GroupSpec) -> HsResult<()> {
    let sampler = group.sampler.as_deref().unwrap_or("random");
    if !KNOWN_SAMPLERS.contains(&sampler) {
        return Err(ConfigError::UnknownSampler {
            id: sampler.to_string(),
            known: KNOWN_SAMPLERS.join(", "),
        }
        .into());
    }
    let pruner = group.pruner.as_deref().unwrap_or("nop");
    if !KNOWN_PRUNERS.contains(&pruner) {
        return Err(ConfigError::UnknownPruner {
            id: pruner.to_string(),
            known: KNOWN_PRUNERS.join(", "),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_ids() {
        assert_eq!(sampler_from_id(None).unwrap().name(), "random");
        assert_eq!(pruner_from_id(None).unwrap().name(), "nop");
        assert_eq!(pruner_from_id(Some("median")).unwrap().name(), "median");
        assert_eq!(pruner_from_id(Some("percentile")).unwrap().name(), "percentile");
    }

    #[test]
    fn unknown_ids_name_the_field() {
        let err = sampler_from_id(Some("skopt")).err().unwrap();
        assert!(err.to_string().contains("group.sampler"));
        assert!(err.to_string().contains("random"));

        let group = GroupSpec::new("g", 3).with_pruner("hyperband");
        let err = validate_ids(&group).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("group.pruner: unknown pruner `hyperband`"));
    }
}
