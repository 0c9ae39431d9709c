//! Pulse command-line entry point.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use pulse_engine::aggregation::{AggregationRequest, TimeRange};
use pulse_engine::config::{EngineConfig, ReportOptions};
use pulse_engine::logging::init_logging;
use pulse_engine::report::ReportAction;
use pulse_engine::{Engine, ENGINE_FULL_NAME, ENGINE_VERSION};

// ----------------------------------------------------------------------------
// CLI Argument Parser
// ----------------------------------------------------------------------------

/// Pulse Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "pulse",
    author = "Pulse Team",
    version,
    about = "Telemetry aggregation and reporting server",
    long_about = "Pulse stores page, API and vitals telemetry and serves \
                  time-windowed health, performance and security reports \
                  over an action-dispatch HTTP API."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "pulse.toml", env = "PULSE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PULSE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "PULSE_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP API
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,

    /// Aggregate once against the configured store and print the report as JSON
    Report {
        /// get_system_overview, get_performance_metrics, get_security_dashboard
        /// or generate_admin_report
        #[arg(short, long, default_value = "get_system_overview")]
        action: String,

        /// 1h, 24h, 7d, 30d or 90d
        #[arg(short, long, default_value = "24h")]
        time_range: String,

        /// Admin token checked by the access policy
        #[arg(long, env = "PULSE_ADMIN_TOKEN")]
        token: Option<String>,
    },
}

// ----------------------------------------------------------------------------
// CLI Handler Functions
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = EngineConfig::load(config_path)
        .with_context(|| format!("Configuration at {} is invalid", config_path.display()))?;
    println!("Configuration is valid");

    if verbose {
        println!("\nParsed configuration:");
        println!("{}", "=".repeat(60));
        println!("{}", toml::to_string_pretty(&config)?);
    }

    println!("\nSummary:");
    println!("  • Instance name: {}", config.engine.instance_name);
    println!("  • Environment: {}", config.engine.environment);
    println!("  • Bind address: {}", config.server.bind_addr);
    println!("  • Store backend: {:?}", config.store.backend);
    println!("  • Admin tokens: {}", config.access.admin_tokens.len());
    println!("  • Flush interval: {}s", config.collector.flush_interval_secs);
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{config_str}"),
    }
    Ok(())
}

fn handle_version() {
    println!("{ENGINE_FULL_NAME} v{ENGINE_VERSION}");
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Report actions:");
    for action in ReportAction::ALL {
        println!("  • {action}");
    }
}

async fn handle_report(
    config: EngineConfig,
    action: &str,
    time_range: &str,
    token: Option<String>,
) -> AnyhowResult<()> {
    let action: ReportAction = action.parse()?;
    let engine = Engine::new(config).await.context("Failed to start engine")?;

    let options = ReportOptions {
        time_range: TimeRange::parse_or_default(time_range),
        ..ReportOptions::default()
    };
    let mut request = AggregationRequest::new(action).with_options(options);
    request.credentials = token;

    let aggregation = engine.aggregation_engine().aggregate(&request).await?;
    let report = engine.report_generator().build(&aggregation);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ----------------------------------------------------------------------------
// Main Entry Point
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need logging or a loaded config
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        _ => {}
    }

    let (config, config_missing) = if cli.config.exists() {
        let config = EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
        (config, false)
    } else {
        (EngineConfig::default(), true)
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if config_missing {
        warn!(target: "pulse::cli", path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Some(Commands::Report {
            action,
            time_range,
            token,
        }) => handle_report(config, &action, &time_range, token).await?,
        Some(Commands::Run) | None => {
            info!(target: "pulse::cli", "{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
            let engine = Engine::new(config).await.context("Failed to start engine")?;
            engine.run().await?;
        }
        Some(Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. }) => {}
    }

    Ok(())
}
