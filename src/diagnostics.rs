//! Logging front door shared by every layer.
//!
//! Library code never installs a subscriber; the replay binary does so via
//! [`init_logging`]. Data inconsistencies go through [`warn`], fatal messages
//! are formatted with [`error_message`] so they read the same everywhere.

use std::fmt::Display;

use tracing_subscriber::EnvFilter;

const PREFIX: &str = "devtree";

/// Format a message for an error that ends the current operation.
pub fn error_message(msg: impl Display) -> String {
    format!("{}: {}", PREFIX, msg)
}

/// Report a tolerated inconsistency (the offending operation is dropped).
pub fn warn(msg: impl Display) {
    tracing::warn!(target: "devtree", "{}", msg);
}

/// Install a fmt subscriber. `RUST_LOG` wins over the verbosity flag.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second init (e.g. from tests) is harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
