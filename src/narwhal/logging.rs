use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::narwhal::config;

/// Keeps the non-blocking writer flushing until dropped.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

/// Install the global subscriber. `RUST_LOG` wins over `level_override`,
/// which wins over the configured level.
pub fn init(
    logging: &config::LoggingConfig,
    level_override: Option<&str>,
) -> anyhow::Result<LoggingRuntime> {
    let level = level_override.unwrap_or(&logging.level);
    let format = logging.format.trim().to_ascii_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directive(level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(logging.output.trim())?;

    let base = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(format == "text")
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);
    let base = if format == "json" {
        base.json().boxed()
    } else {
        base.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(base)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

/// Unknown levels fall back to `info`.
fn filter_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

fn make_writer(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match output {
        "" | "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        path => {
            let p = Path::new(path);
            if let Some(parent) = p.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_to_directives() {
        assert_eq!(filter_directive("DEBUG"), "debug");
        assert_eq!(filter_directive(" warn "), "warn");
        assert_eq!(filter_directive("warning"), "warn");
        assert_eq!(filter_directive("error"), "error");
        assert_eq!(filter_directive("chatty"), "info");
        assert_eq!(filter_directive(""), "info");
    }

    #[test]
    fn file_output_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("narwhal_log_test_{}", std::process::id()));
        let path = dir.join("nested").join("narwhal.log");
        let (_writer, _guard) = make_writer(path.to_str().unwrap()).expect("writer");
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
