use crate::error::Result;
use std::io;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides the level; `json`
/// swaps the text layer for JSON records.
pub fn init(verbose: bool, json: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let fmt_layer = (!json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(io::stderr)
    });

    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_thread_names(true)
            .with_writer(io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| crate::error::RobotError::config(format!("logger: {}", e)))?;

    Ok(())
}
