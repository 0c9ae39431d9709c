// ============================================================================
// LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{PulseError, PulseResult};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Map a configured level name onto a filter; unknown names mean `info`.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Output layer for `json`, `compact` or (anything else) `pretty`.
fn output_layer(config: &LoggingConfig) -> BoxedLayer {
    match config.format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_current_span(false)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .boxed(),
        "compact" => fmt::layer()
            .compact()
            .with_ansi(config.colors)
            .boxed(),
        _ => fmt::layer()
            .pretty()
            .with_ansi(config.colors)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .boxed(),
    }
}

/// Install the global subscriber. `RUST_LOG` directives take precedence
/// over the configured level. Fails if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> PulseResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(parse_level(&config.level).into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(output_layer(config))
        .with(env_filter)
        .try_init()
        .map_err(|e| PulseError::Internal(format!("Failed to set logger: {e}")))?;

    info!(
        target: "pulse::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(parse_level("warning"), LevelFilter::WARN);
        assert_eq!(parse_level("chatty"), LevelFilter::INFO);
    }

    #[test]
    fn test_every_format_builds_a_layer() {
        for format in ["json", "compact", "pretty", "unknown"] {
            let config = LoggingConfig {
                format: format.into(),
                ..LoggingConfig::default()
            };
            let _layer = output_layer(&config);
        }
    }
}
