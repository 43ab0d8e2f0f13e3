//! Log filter selection.

use crate::config::LoggingSettings;
use crate::{Error, Result};
use tracing_subscriber::EnvFilter;

/// Filter used when `--verbose` is given.
pub const VERBOSE_DIRECTIVE: &str = "lapse=debug,info";

/// Picks the filter directive.
///
/// `--verbose` wins, then `RUST_LOG`, then the configured level.
#[must_use]
pub fn filter_directive(
    settings: &LoggingSettings,
    verbose: bool,
    rust_log: Option<String>,
) -> String {
    if verbose {
        return VERBOSE_DIRECTIVE.to_string();
    }
    rust_log
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| settings.level.clone())
}

/// Builds the `EnvFilter` for the process.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the directive does not parse.
pub fn build_filter(settings: &LoggingSettings, verbose: bool) -> Result<EnvFilter> {
    let directive = filter_directive(settings, verbose, std::env::var("RUST_LOG").ok());
    EnvFilter::try_new(&directive)
        .map_err(|e| Error::InvalidInput(format!("log filter '{directive}': {e}")))
}
