//! Utilities for logging.

use std::io;

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    HumanReadable,
    Json,
}

/// Configure the global tracing subscriber.
///
/// `RUST_LOG` directives take precedence over `default_level`. Calling this
/// more than once is a no-op.
pub fn configure_global_logger<W>(default_level: Level, format: LogFormat, writer: W)
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_thread_names(true);

    // Already initialized elsewhere (tests, embedding application).
    let _ = match format {
        LogFormat::HumanReadable => builder.with_target(true).try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };
}

/// Logging for tests.
///
/// Output is captured by the test harness.
pub fn init_test() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::DEBUG.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .with_file(true)
        .with_line_number(true)
        .try_init();
}

/// Convenience for binaries writing logs to stderr.
pub fn configure_stderr_logger(default_level: Level, format: LogFormat) {
    configure_global_logger(default_level, format, io::stderr)
}
