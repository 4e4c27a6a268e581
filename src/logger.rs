//! Tracing setup for the pipeline.
//!
//! A bare level applies to the pipeline's own events; the HTTP stack under
//! the feed and subreddit sources is held at `warn` unless a full directive
//! asks otherwise. Call [`init`] once, after config is loaded.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::AppError;

/// Crates whose per-request chatter is capped at `warn` for bare levels.
const TRANSPORT_CRATES: &[&str] = &["hyper", "hyper_util", "h2", "reqwest", "rustls"];

/// Where the requested level came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelOrigin {
    /// `-v` flags. Beats `RUST_LOG`.
    Cli,
    /// `pipeline.log_level` or `CROSSREF_LOG_LEVEL`. `RUST_LOG` beats it.
    Config,
}

/// Turn `level` into an `EnvFilter` directive.
///
/// `"debug"` becomes `"debug,hyper=warn,…"`. Anything that is not a bare
/// level (`"crossref_bot=trace,reqwest=debug"`) is used as given.
pub fn directive(level: &str) -> String {
    let level = level.trim();
    match level.parse::<LevelFilter>() {
        Ok(filter) if filter > LevelFilter::WARN => {
            let mut out = level.to_ascii_lowercase();
            for krate in TRANSPORT_CRATES {
                out.push_str(&format!(",{krate}=warn"));
            }
            out
        }
        Ok(_) => level.to_ascii_lowercase(),
        Err(_) => level.to_string(),
    }
}

/// Install the global subscriber, writing to stderr.
pub fn init(level: &str, origin: LevelOrigin) -> Result<(), AppError> {
    let wanted = directive(level);
    let filter = match origin {
        LevelOrigin::Cli => EnvFilter::try_new(&wanted).or_else(|level_err| {
            EnvFilter::try_from_default_env().map_err(|env_err| {
                AppError::Logger(format!(
                    "bad -v level '{wanted}': {level_err}; RUST_LOG unusable: {env_err}"
                ))
            })
        })?,
        LevelOrigin::Config => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&wanted))
            .map_err(|e| AppError::Logger(format!("bad log level '{wanted}': {e}")))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))
}

/// Validate a configured level. Only bare levels are accepted in config.
pub fn parse_level(level: &str) -> Result<LevelFilter, AppError> {
    if level.trim().is_empty() {
        return Err(AppError::Logger("log level must not be empty".into()));
    }
    level
        .trim()
        .parse::<LevelFilter>()
        .map_err(|_| AppError::Logger(format!("unrecognised log level: '{level}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_levels_parse() {
        for l in ["error", "warn", "info", "debug", "trace", "off", " INFO "] {
            assert!(parse_level(l).is_ok(), "expected '{l}' to be valid");
        }
    }

    #[test]
    fn invalid_level_errors() {
        assert!(parse_level("verbose").is_err());
        assert!(parse_level("  ").is_err());
    }

    #[test]
    fn verbose_levels_quiet_the_transport() {
        let d = directive("Debug");
        assert!(d.starts_with("debug,"));
        for krate in TRANSPORT_CRATES {
            assert!(d.contains(&format!("{krate}=warn")), "{d}");
        }
        assert!(EnvFilter::try_new(&d).is_ok());
    }

    #[test]
    fn quiet_levels_and_full_directives_pass_through() {
        assert_eq!(directive("warn"), "warn");
        assert_eq!(directive("error"), "error");
        assert_eq!(directive("crossref_bot=trace,reqwest=debug"), "crossref_bot=trace,reqwest=debug");
    }

    #[test]
    fn init_info_succeeds_or_already_init() {
        match init("info", LevelOrigin::Config) {
            Ok(()) => {}
            Err(AppError::Logger(msg)) if msg.contains("set subscriber") => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
