//! Tracing setup for hosts embedding the engine

use tracing_subscriber::EnvFilter;

use localsync_core::config::LoggingConfig;

/// Installs a global fmt subscriber
///
/// `RUST_LOG` takes precedence over the configured level.
///
/// # Errors
///
/// Fails if the level is not a valid filter or a global subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    if config.json {
        builder.json().try_init().map_err(|e| anyhow::anyhow!(e))
    } else {
        builder.try_init().map_err(|e| anyhow::anyhow!(e))
    }
}
