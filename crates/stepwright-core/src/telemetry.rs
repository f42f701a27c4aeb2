//! Tracing initialisation for the `stepwright` binary.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored
//! because the global subscriber can only be set once per process.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber from the `[logging]` section.
///
/// `RUST_LOG` wins over the configured levels. Logs go to stderr so command
/// output on stdout stays machine-readable.
pub fn init_tracing(logging: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.directives()));

    if logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_parse() {
        let directives = LoggingConfig::default().directives();
        assert_eq!(
            directives,
            "warn,stepwright=info,stepwright_core=info,stepwright_ci=info"
        );
        assert!(EnvFilter::try_new(directives).is_ok());
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(&LoggingConfig::default());
        init_tracing(&LoggingConfig {
            json: true,
            ..LoggingConfig::default()
        });
    }
}
