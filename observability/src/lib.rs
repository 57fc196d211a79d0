//! # Tracing helpers
//!
//! Shared tracing initialization for all binaries. Components never install
//! global loggers themselves; they emit through `tracing` macros and the
//! binary calls [`init_tracing`] exactly once at startup.

use error_stack::{Result, ResultExt};
use tracing::Subscriber;
use tracing_subscriber::{fmt, prelude::*, registry::LookupSpan, EnvFilter, Layer};

/// Set to `json` to emit one JSON object per log line.
const LOG_FORMAT: &str = "MERIDIAN_LOG_FORMAT";

pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

#[derive(Debug)]
pub struct TracingInitError;

impl error_stack::Context for TracingInitError {}

impl std::fmt::Display for TracingInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("failed to initialize tracing")
    }
}

/// Initialize the tracing subscriber.
///
/// Log verbosity is controlled with `RUST_LOG` and defaults to `info`.
///
/// ```rs
/// use meridian_observability::init_tracing;
///
/// init_tracing().unwrap();
/// ```
pub fn init_tracing() -> Result<(), TracingInitError> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }

    let env_filter = EnvFilter::try_from_default_env()
        .change_context(TracingInitError)
        .attach_printable("invalid RUST_LOG filter")?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout())
        .try_init()
        .change_context(TracingInitError)?;

    Ok(())
}

fn stdout<S>() -> BoxedLayer<S>
where
    S: Subscriber + Send + Sync,
    for<'a> S: LookupSpan<'a>,
{
    let use_json = std::env::var(LOG_FORMAT)
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if use_json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    }
}
