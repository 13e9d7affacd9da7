//! Logging bootstrap for the service binaries. Verbosity and format come
//! from the environment (`RUST_LOG`, `LOG_FORMAT`, `NO_COLOR`); the
//! optional log file is a command-line concern and is passed in explicitly.

use std::{
    fs::File,
    io,
    path::Path,
};

use anyhow::Context as _;
use tracing_subscriber::{
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};

/// Keep this alive for as long as the process logs; dropping it flushes the
/// non-blocking file writer.
pub struct TracingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Daemons log to stdout at info, optionally teeing into a log file.
pub fn init_service_logging(log_file: Option<&Path>) -> anyhow::Result<TracingGuard> {
    init_logging(io::stdout, "info", log_file)
}

/// One-shot tools log to stderr and stay quiet unless something breaks.
pub fn init_tool_logging() -> anyhow::Result<TracingGuard> {
    init_logging(io::stderr, "error", None)
}

fn init_logging<W>(
    writer: W,
    default_filter: &str,
    log_file: Option<&Path>,
) -> anyhow::Result<TracingGuard>
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let console_layer = {
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(std::env::var("NO_COLOR").is_err())
            .with_writer(writer);
        let layer = if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
            layer.json().boxed()
        } else {
            layer.boxed()
        };
        layer.with_filter(env_filter(default_filter)).boxed()
    };
    let mut layers = vec![console_layer];

    let file_guard = match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Could not open log file {path:?}"))?;
            let (file_writer, guard) = tracing_appender::non_blocking(file);
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(file_writer)
                    .with_filter(env_filter(default_filter))
                    .boxed(),
            );
            Some(guard)
        },
        None => None,
    };

    tracing_subscriber::registry().with(layers).init();
    Ok(TracingGuard {
        _file_guard: file_guard,
    })
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// For test helpers. Losing the init race to another test is fine; whoever
/// got there first configured the same thing.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .compact()
        .try_init();
}
