//! Tracing subscriber installation for the `nodeprep` binary.

use crate::errors::NodeprepError;
use std::io::IsTerminal;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directives used when `RUST_LOG` is not set.
#[must_use]
pub fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "nodeprep=debug,warn"
    } else {
        "nodeprep=info,warn"
    }
}

/// Installs the global subscriber.
///
/// Log lines go to stderr so the run report on stdout stays clean. `RUST_LOG`
/// overrides the default filter; `verbose` lowers the default to debug and
/// adds targets to each line.
pub fn init_tracing(verbose: bool) -> Result<(), NodeprepError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(verbose)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(ansi)
                .with_target(verbose)
                .with_thread_ids(false)
                .with_line_number(false)
                .with_file(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| NodeprepError::Internal(format!("failed to install tracing subscriber: {e}")))
}
