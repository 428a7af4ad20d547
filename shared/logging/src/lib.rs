use std::{fs::OpenOptions, path::PathBuf};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{
    filter::FromEnvError, fmt, layer::SubscriberExt, registry::LookupSpan, EnvFilter, Layer,
    Registry,
};

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq)]
pub enum LogOutput {
    /// Human readable lines on stdout.
    Console,
    /// One flattened JSON object per event on stdout, for log collectors.
    Json,
}

/// Env var that overrides the filter of the log file only.
pub const FILE_FILTER_ENV: &str = "WRITE_RUST_LOG";

fn env_filter(env_var: &str, level: Level) -> Result<EnvFilter, FromEnvError> {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var(env_var)
        .from_env()
}

fn stdout_layer<S>(output: LogOutput) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    match output {
        LogOutput::Console => fmt::layer().with_writer(std::io::stdout).boxed(),
        LogOutput::Json => fmt::layer()
            .json()
            .with_writer(std::io::stdout)
            .flatten_event(true)
            .with_current_span(true)
            .boxed(),
    }
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` overrides `level` on stdout. With `write_logs_file`, events are also appended to
/// that file without ANSI colours, filtered by [`FILE_FILTER_ENV`] when set.
pub fn init_logging(
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let file_layer = match write_logs_file {
        Some(path) => {
            let log_file = OpenOptions::new().append(true).create(true).open(&path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(log_file)
                    .with_filter(env_filter(FILE_FILTER_ENV, level)?),
            )
        }
        None => None,
    };

    let stdout_layer =
        stdout_layer::<Registry>(output).with_filter(env_filter(EnvFilter::DEFAULT_ENV, level)?);
    let subscriber = tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_output_parses_from_cli_names() {
        assert_eq!(LogOutput::from_str("console", true), Ok(LogOutput::Console));
        assert_eq!(LogOutput::from_str("JSON", true), Ok(LogOutput::Json));
        assert!(LogOutput::from_str("tui", true).is_err());
    }

    #[test]
    fn file_logging_appends_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        init_logging(LogOutput::Console, Level::INFO, Some(path.clone())).unwrap();
        tracing::info!(step = 1, "hello from the trainer");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello from the trainer"));
        assert!(contents.contains("step=1"));
    }
}
