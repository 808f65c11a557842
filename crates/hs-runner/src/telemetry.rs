//! Logging setup.

use hs_types::HsResult;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn open_log(dir: &Path, name: &str, level: &str) -> HsResult<Arc<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{name}.{level}.log")))?;
    Ok(Arc::new(file))
}

/// Install the global subscriber: `RUST_LOG` filtering (default `info`), a
/// console layer and, with a log directory, `<name>.info.log` and
/// `<name>.error.log`.
///
/// Returns `false` when a subscriber was already installed; the log files are
/// still created.
pub fn init_logging(name: &str, log_dir: Option<&Path>) -> HsResult<bool> {
    let (info_layer, error_layer) = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let info = open_log(dir, name, "info")?;
            let error = open_log(dir, name, "error")?;
            (
                Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(info)
                        .with_filter(LevelFilter::INFO),
                ),
                Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(error)
                        .with_filter(LevelFilter::ERROR),
                ),
            )
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(info_layer)
        .with(error_layer)
        .try_init()
        .is_ok();
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_log_files_and_installs_once() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");

        let _ = init_logging("mnist", Some(&logs)).unwrap();
        assert!(logs.join("mnist.info.log").exists());
        assert!(logs.join("mnist.error.log").exists());

        assert!(!init_logging("mnist", None).unwrap());
    }
}
