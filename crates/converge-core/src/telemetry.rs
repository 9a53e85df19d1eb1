//! Log setup for the converge binary.
//!
//! Reports own stdout; every log line goes to stderr. Verbosity comes from
//! `CONVERGE_LOG`, then `RUST_LOG`, then the level picked on the command line.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Filter directive variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "CONVERGE_LOG";

/// Install the global subscriber. `json` switches to newline-delimited JSON
/// records. Later calls are no-ops.
pub fn init_tracing(json: bool, level: Level) {
    let configured = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok();
    let directive = filter_directive(level, configured);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("ignoring log filter {directive:?}: {e}");
        EnvFilter::new(level.as_str().to_lowercase())
    });

    let output = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let output = if json {
        output.json().boxed()
    } else {
        output.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .ok();
}

/// A non-blank configured directive wins over the CLI level.
fn filter_directive(level: Level, configured: Option<String>) -> String {
    configured
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| level.as_str().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive_falls_back_to_level() {
        assert_eq!(filter_directive(Level::DEBUG, None), "debug");
        assert_eq!(filter_directive(Level::INFO, Some("  ".to_string())), "info");
        assert_eq!(
            filter_directive(Level::INFO, Some("converge_core=trace".to_string())),
            "converge_core=trace"
        );
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
        tracing::info!(spec = "git", "still logging");
    }
}
