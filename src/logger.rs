use anyhow::{anyhow, Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    EnvFilter,
};

/// Microsecond wall-clock timestamps on every line
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Initialize the logging system
///
/// `RUST_LOG` takes precedence over `log_level`. With a `log_file` output goes
/// through a non-blocking writer; keep the returned guard alive until exit
/// or buffered lines are lost.
pub fn init_logger(log_level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    match log_file {
        Some(path) => {
            let (dir, file_name) = split_log_path(path)?;
            std::fs::create_dir_all(&dir).with_context(|| format!("Cannot create log directory: {:?}", dir))?;

            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
                .with_target(false);

            let subscriber = tracing_subscriber::registry().with(env_filter).with(file_layer);
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| anyhow!("Failed to set global tracing subscriber: {}", e))?;

            tracing::info!("Logging system initialized, output to file: {}", path.display());
            Ok(Some(guard))
        }
        None => {
            let terminal_layer = fmt::layer()
                .with_writer(io::stdout)
                .with_thread_ids(true)
                .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
                .with_target(false);

            let subscriber = tracing_subscriber::registry().with(env_filter).with(terminal_layer);
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| anyhow!("Failed to set global tracing subscriber: {}", e))?;

            Ok(None)
        }
    }
}

/// Split a log file path into its directory and file name
fn split_log_path(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("Log file path has no file name: {:?}", path))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    Ok((dir, PathBuf::from(file_name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_log_path() {
        let (dir, name) = split_log_path(Path::new("/var/log/portal/server.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/log/portal"));
        assert_eq!(name, PathBuf::from("server.log"));

        let (dir, name) = split_log_path(Path::new("client.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, PathBuf::from("client.log"));

        assert!(split_log_path(Path::new("/")).is_err());
    }
}
