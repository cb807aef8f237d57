use std::sync::Once;

use log::LevelFilter;

static LOG_ONCE: Once = Once::new();

const LOG_ENV: &str = "GESTURE_CAPTURE_LOG";

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Filter directives from `GESTURE_CAPTURE_LOG`, then `RUST_LOG`, then the default level.
fn filter_directives(
    crate_env: Option<String>,
    rust_log: Option<String>,
    verbose: bool,
) -> String {
    crate_env
        .or(rust_log)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            let level = if verbose {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            };
            level_to_str(level).to_string()
        })
}

/// Initialize stderr logging.
///
/// Safe to call multiple times; only the first call installs the logger.
/// `verbose` raises the default level to `debug` when neither
/// `GESTURE_CAPTURE_LOG` nor `RUST_LOG` is set.
pub fn init_logging(verbose: bool) {
    LOG_ONCE.call_once(|| {
        let filters = filter_directives(
            std::env::var(LOG_ENV).ok(),
            std::env::var("RUST_LOG").ok(),
            verbose,
        );
        let _ = env_logger::Builder::new()
            .parse_filters(&filters)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_variable_wins_over_rust_log() {
        let f = filter_directives(Some("debug".into()), Some("warn".into()), false);
        assert_eq!(f, "debug");
    }

    #[test]
    fn falls_back_to_rust_log() {
        let f = filter_directives(None, Some(" gesture_capture=trace ".into()), false);
        assert_eq!(f, "gesture_capture=trace");
    }

    #[test]
    fn default_level_depends_on_verbose() {
        assert_eq!(filter_directives(None, None, false), "info");
        assert_eq!(filter_directives(None, None, true), "debug");
        assert_eq!(filter_directives(Some("  ".into()), None, false), "info");
    }

    #[test]
    fn init_is_idempotent() {
        init_logging(false);
        init_logging(true);
    }
}
