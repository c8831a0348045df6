//! Process-wide `tracing` setup.
//!
//! `RUST_LOG` takes precedence over the configured level so a single run can
//! be made more verbose without editing the config file.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{config::LoggingConfig, error::TernError};

/// Install a console subscriber filtered by `RUST_LOG` or `config.level`.
///
/// Fails if a global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<(), TernError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&config.level)))
        .map_err(|error| TernError::Telemetry(error.to_string()))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|error| TernError::Telemetry(error.to_string()))?;

    tracing::debug!(level = %config.level, "logging initialized");
    Ok(())
}

fn default_directives(level: &str) -> String {
    format!("warn,tern_core={level},tern_xmpp={level},tern_roster={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_scope_level_to_tern_crates() {
        let directives = default_directives("debug");
        assert_eq!(
            directives,
            "warn,tern_core=debug,tern_xmpp=debug,tern_roster=debug"
        );
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}
