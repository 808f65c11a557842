//! Project settings read from the environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::{ConfigError, HsResult};
use crate::job::{JobKind, JobSpec};

pub const TRACKING_URI_VAR: &str = "HYPERSWEEP_TRACKING_URI";
pub const STUDY_STORAGE_URI_VAR: &str = "HYPERSWEEP_STUDY_STORAGE_URI";

/// Where tracking runs and studies are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub tracking_uri: String,
    pub study_storage_uri: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tracking_uri: "memory://".to_string(),
            study_storage_uri: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            tracking_uri: non_empty(TRACKING_URI_VAR).unwrap_or_else(|| "memory://".to_string()),
            study_storage_uri: non_empty(STUDY_STORAGE_URI_VAR),
        }
    }

    pub fn with_study_storage(mut self, uri: impl Into<String>) -> Self {
        self.study_storage_uri = Some(uri.into());
        self
    }

    pub fn with_tracking(mut self, uri: impl Into<String>) -> Self {
        self.tracking_uri = uri.into();
        self
    }

    /// Group jobs cannot run without somewhere to persist the study.
    pub fn validate_for(&self, job: &JobSpec) -> HsResult<()> {
        self.tracking_uri.parse::<BackendUri>()?;
        match (job.kind(), &self.study_storage_uri) {
            (JobKind::Group, None) => Err(ConfigError::MissingStorageUri.into()),
            (_, Some(uri)) => uri.parse::<BackendUri>().map(|_| ()).map_err(Into::into),
            _ => Ok(()),
        }
    }
}

/// Parsed storage location shared by study storage and tracking backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendUri {
    /// Process-local, lost on exit.
    Memory,
    /// A file or directory on the local filesystem.
    File(PathBuf),
}

impl FromStr for BackendUri {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri = s.trim();
        if uri == "memory://" || uri == "memory" {
            return Ok(Self::Memory);
        }
        match uri.strip_prefix("file://") {
            Some(path) if !path.is_empty() => Ok(Self::File(PathBuf::from(path))),
            _ => Err(ConfigError::UnsupportedUri {
                uri: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GroupSpec, JobBase, Metric};
    use std::collections::HashMap;

    #[test]
    fn reads_settings_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (TRACKING_URI_VAR, "file:///tmp/runs"),
            (STUDY_STORAGE_URI_VAR, "memory://"),
        ]
        .into_iter()
        .collect();

        let settings = Settings::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(settings.tracking_uri, "file:///tmp/runs");
        assert_eq!(settings.study_storage_uri.as_deref(), Some("memory://"));
    }

    #[test]
    fn defaults_when_unset() {
        let settings = Settings::from_lookup(|_| None);
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn group_requires_study_storage() {
        let group = JobSpec::Group(GroupSpec::new("g", 1).with_metric(Metric::minimize("loss")));
        let err = Settings::default().validate_for(&group).unwrap_err();
        assert!(err.to_string().contains(STUDY_STORAGE_URI_VAR));

        Settings::default()
            .with_study_storage("memory://")
            .validate_for(&group)
            .unwrap();

        let experiment = JobSpec::Experiment(JobBase::new("e"));
        Settings::default().validate_for(&experiment).unwrap();
    }

    #[test]
    fn parses_backend_uris() {
        assert_eq!("memory://".parse::<BackendUri>().unwrap(), BackendUri::Memory);
        assert_eq!(
            "file:///var/studies.json".parse::<BackendUri>().unwrap(),
            BackendUri::File(PathBuf::from("/var/studies.json"))
        );
        assert!("postgres://db".parse::<BackendUri>().is_err());
    }
}
