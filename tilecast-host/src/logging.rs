//! Tracing setup.
//!
//! The subscriber is installed before the config is read so that config
//! loading can log. `RUST_LOG` wins when set; otherwise the filter starts
//! at [`DEFAULT_LEVEL`] and is swapped for the configured level once the
//! config is loaded.

use tracing::warn;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt};

pub const DEFAULT_LEVEL: &str = "info";

/// Pick the filter directive: a non-empty environment value, else the
/// configured one.
pub fn directive(env: Option<&str>, configured: &str) -> String {
    match env.map(str::trim) {
        Some(env) if !env.is_empty() => env.to_string(),
        _ => configured.to_string(),
    }
}

fn parse(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|e| {
        eprintln!("invalid log filter {directive:?}: {e}; using {DEFAULT_LEVEL}");
        EnvFilter::new(DEFAULT_LEVEL)
    })
}

/// Keeps the installed filter reloadable.
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    from_env: bool,
}

impl LogHandle {
    fn layer(filter: EnvFilter, from_env: bool) -> (reload::Layer<EnvFilter, Registry>, Self) {
        let (layer, filter) = reload::Layer::new(filter);
        (layer, Self { filter, from_env })
    }

    /// Switch to the configured level unless `RUST_LOG` chose the filter.
    pub fn apply(&self, configured: &str) {
        if self.from_env {
            return;
        }
        let filter = match EnvFilter::try_new(configured) {
            Ok(filter) => filter,
            Err(e) => {
                warn!(level = configured, error = %e, "invalid log level in config; keeping {DEFAULT_LEVEL}");
                return;
            }
        };
        if let Err(e) = self.filter.reload(filter) {
            warn!(error = %e, "failed to apply log level");
        }
    }

    /// The active filter, rendered as directives.
    pub fn current(&self) -> Option<String> {
        self.filter.with_current(|f| f.to_string()).ok()
    }
}

/// Install the global subscriber.
pub fn init() -> Result<LogHandle, tracing_subscriber::util::TryInitError> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let from_env = env.as_deref().is_some_and(|v| !v.trim().is_empty());
    let (layer, handle) = LogHandle::layer(parse(&directive(env.as_deref(), DEFAULT_LEVEL)), from_env);
    tracing_subscriber::registry()
        .with(layer)
        .with(fmt::layer())
        .try_init()?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_wins_when_set() {
        assert_eq!(directive(Some("tilecast=trace"), "warn"), "tilecast=trace");
        assert_eq!(directive(Some("  "), "warn"), "warn");
        assert_eq!(directive(None, "debug"), "debug");
    }

    #[test]
    fn configured_level_replaces_startup_filter() {
        let (layer, handle) = LogHandle::layer(parse(DEFAULT_LEVEL), false);
        let _subscriber = tracing_subscriber::registry().with(layer);

        handle.apply("debug");
        assert_eq!(handle.current(), Some(EnvFilter::new("debug").to_string()));

        // A bad level keeps what is there.
        handle.apply("tilecast=verbose");
        assert_eq!(handle.current(), Some(EnvFilter::new("debug").to_string()));
    }

    #[test]
    fn environment_filter_is_not_overridden() {
        let (layer, handle) = LogHandle::layer(parse("trace"), true);
        let _subscriber = tracing_subscriber::registry().with(layer);

        handle.apply("error");
        assert_eq!(handle.current(), Some(EnvFilter::new("trace").to_string()));
    }
}
