use std::fs::{self, File, OpenOptions};
use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;
use crate::{PulseError, Result};

/// Sets up the logging subscriber for the application.
///
/// # Arguments
/// * `component` - Name used for the default filter when `RUST_LOG` is unset
/// * `format` - Output format for stdout
/// * `log_file` - Optional plain-text log file, read back by the logs API
///
/// The returned guard flushes the file writer on drop; keep it alive until exit.
pub fn init_logger(component: &str, format: LogFormat, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}={}", component, Level::INFO)));

    let compact_layer = (format == LogFormat::Compact).then(|| {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .with_ansi(true)
            .compact()
    });

    let json_layer = (format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_file(true)
            .with_line_number(true)
    });

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            let layer = fmt::layer().with_writer(writer).with_target(false).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(compact_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| PulseError::Internal(format!("Failed to initialize logger: {}", e)))?;

    Ok(guard)
}

/// Appends to `path` from a background worker thread.
fn file_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    Ok(tracing_appender::non_blocking(open_log_file(path)?))
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::read_log_file;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_file_layer_output_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("pulse.log");

        let (writer, guard) = file_writer(&path).unwrap();
        let subscriber = tracing_subscriber::registry()
            .with(fmt::layer().with_writer(writer).with_target(false).with_ansi(false));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Processed 3 events, failed 0 events");
            tracing::warn!("Stream at 90/100 (~90%).");
        });
        // Dropping the guard flushes the background writer.
        drop(guard);

        let entries = read_log_file(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level.as_deref(), Some("INFO"));
        assert_eq!(entries[0].message, "Processed 3 events, failed 0 events");
        assert_eq!(entries[1].level.as_deref(), Some("WARN"));
    }
}
