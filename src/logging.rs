use std::panic::{self, PanicHookInfo};
use std::sync::Once;

use anyhow::{Context, Result};
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::worker::panic_reason;

/// Dependencies stay quiet unless they warn; this crate logs at `info`.
pub const DEFAULT_DIRECTIVES: &str = "warn,flow_runner=info";

static INIT: Once = Once::new();

/// Builds the log filter: explicit directives, then `RUST_LOG`, then
/// [`DEFAULT_DIRECTIVES`].
pub fn filter(directives: Option<&str>) -> Result<EnvFilter> {
    match directives {
        Some(directives) => EnvFilter::builder()
            .parse(directives)
            .with_context(|| format!("invalid log level '{directives}'")),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))),
    }
}

/// Installs the fmt subscriber and routes panic messages through it.
///
/// Later calls only validate `directives`.
pub fn init(directives: Option<&str>) -> Result<()> {
    let filter = filter(directives)?;
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .compact()
            .init();
        panic::set_hook(Box::new(log_panic));
    });
    Ok(())
}

fn log_panic(info: &PanicHookInfo<'_>) {
    let reason = panic_reason(info.payload());
    let location = info
        .location()
        .map(|l| l.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let thread = std::thread::current();
    error!(
        target: "flow_runner::panic",
        thread = thread.name().unwrap_or("<unnamed>"),
        %location,
        %reason,
        "thread panicked"
    );
}
