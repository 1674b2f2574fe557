//! Tracing subscriber setup. Library code only emits `tracing` events; hosts
//! (the CLI, an embedding app) call [`init`] once.

use std::sync::Once;

use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "SCENE_BRIDGE_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Human-readable output on stderr, debug level.
    Development,
    /// JSON lines on stderr, info level.
    Production,
    /// No output.
    Quiet,
}

static INIT_ONCE: Once = Once::new();

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(profile: Profile) {
    INIT_ONCE.call_once(|| match profile {
        Profile::Development => {
            let _ = tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter("scene_bridge=debug"))
                .try_init();
        }
        Profile::Production => {
            let _ = tracing_subscriber::fmt()
                .json()
                .with_writer(std::io::stderr)
                .with_env_filter(filter("scene_bridge=info"))
                .try_init();
        }
        Profile::Quiet => {
            let _ = tracing_subscriber::registry().try_init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(Profile::Quiet);
        init(Profile::Development);
        init(Profile::Production);
    }
}
