//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the binary. [`init_tracing`] is the one-line default.

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Installs a formatted subscriber as the global default.
///
/// `RUST_LOG` takes precedence; otherwise `default_filter` (e.g. `"info"` or
/// `"briny_nn=debug"`) is used. Calling this again after a successful
/// install is a no-op.
///
/// # Errors
/// [`Error::Config`] if the filter does not parse or another global
/// subscriber is already installed.
pub fn init_tracing(default_filter: &str) -> Result<()> {
    if INITIALISED.get().is_some() {
        return Ok(());
    }

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(default_filter)?,
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);

    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("tracing subscriber already set: {e}")))?;

    let _ = INITIALISED.set(());
    Ok(())
}

fn parse_filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives).map_err(|e| Error::Config(format!("invalid log filter '{directives}': {e}")))
}
