//! Process bootstrap helpers.

use tracing_subscriber::EnvFilter;

/// Environment variable controlling the log filter.
pub const LOG_ENV_VAR: &str = "WEFT_LOG";

/// Initialize tracing with the `WEFT_LOG` environment variable.
///
/// Defaults to "info" level if `WEFT_LOG` is not set. Safe to call more
/// than once; later calls are no-ops.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}
