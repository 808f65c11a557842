//! Instrumentation hooks: seed capture and system information tags.

use hs_types::HsResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::tracking::Tracker;

/// Tags the tracking run with `<source> seed` the first time each source is
/// seeded. Later seeds of the same source are not recorded.
pub struct SeedRecorder {
    tracker: Arc<dyn Tracker>,
    run_id: String,
    seen: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for SeedRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedRecorder")
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl SeedRecorder {
    pub fn new(tracker: Arc<dyn Tracker>, run_id: impl Into<String>) -> Self {
        Self {
            tracker,
            run_id: run_id.into(),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Returns `true` if this was the first seed of `source`.
    pub fn record(&self, source: &str, seed: u64) -> HsResult<bool> {
        if !self.seen.lock().insert(source.to_string()) {
            return Ok(false);
        }
        self.tracker
            .set_tag(&self.run_id, &format!("{source} seed"), &seed.to_string())?;
        Ok(true)
    }
}

/// Facts about the machine a run executes on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub host: String,
    pub os: String,
    pub arch: String,
    pub cpus: usize,
    pub version: String,
}

impl SystemInfo {
    pub fn collect() -> Self {
        Self {
            host: hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn tag_run(&self, tracker: &dyn Tracker, run_id: &str) -> HsResult<()> {
        tracker.set_tag(run_id, "host", &self.host)?;
        tracker.set_tag(run_id, "os", &self.os)?;
        tracker.set_tag(run_id, "arch", &self.arch)?;
        tracker.set_tag(run_id, "cpus", &self.cpus.to_string())?;
        tracker.set_tag(run_id, "hypersweep version", &self.version)
    }
}

/// Best-effort host name.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
