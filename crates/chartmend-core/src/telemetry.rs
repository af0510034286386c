//! Tracing setup shared by the chartmend binaries.
//!
//! Logs go to stderr so that `--format json` output on stdout stays
//! machine-readable. Only the first [`init_tracing`] call in a process
//! installs a subscriber.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const CHARTMEND_TARGETS: [&str; 2] = ["chartmend_core", "chartmend_cli"];

/// Filter used when `RUST_LOG` is unset: chartmend at `level`, everything
/// else at `warn`.
fn default_filter(level: Level) -> EnvFilter {
    let directives = CHARTMEND_TARGETS
        .iter()
        .map(|target| format!("{target}={}", level.as_str().to_ascii_lowercase()))
        .chain(std::iter::once("warn".to_string()))
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::new(directives)
}

/// Install the global subscriber; `json` switches to newline-delimited JSON.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_scopes_level_to_chartmend() {
        let rendered = default_filter(Level::DEBUG).to_string();
        assert!(rendered.contains("chartmend_core=debug"));
        assert!(rendered.contains("warn"));
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
    }
}
