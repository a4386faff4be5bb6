// ============================================================================
// COMMAND LINE INTERFACE
// ============================================================================
// Entry point of the gateway binary:
// - `run` (default) serves the API until a termination signal
// - `validate` and `generate-config` work on configuration files
// - `version` prints build information
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use facette::config::GatewayConfig;
use facette::logging::init_logging;
use facette::server::Server;
use facette::{BUILD_DATE, FULL_NAME, VERSION};

// ----------------------------------------------------------------------------
// CLI Argument Parser
// ----------------------------------------------------------------------------

/// Facette gateway CLI
#[derive(Parser, Debug)]
#[command(
    name = "facette",
    version,
    about = "Time-series visualization gateway",
    long_about = "Facette federates pull-only metrics back-ends (Graphite, InfluxDB, \
                  KairosDB, other Facette instances) behind a searchable catalog, and \
                  serves graph definitions and their points over an HTTP API."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "facette.toml", env = "FACETTE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "FACETTE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway
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
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

fn handle_validate(path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", path.display());

    let config = GatewayConfig::load(path)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    println!("Configuration is valid");

    if verbose {
        println!();
        println!("{}", toml::to_string_pretty(&config)?);
    }

    println!();
    println!("Summary:");
    println!("  listen:       {}", config.http.listen);
    println!("  base path:    {}", config.http.base_path);
    println!("  read-only:    {}", config.http.read_only);
    match &config.storage.path {
        Some(storage) => println!("  storage:      {}", storage.display()),
        None => println!("  storage:      memory"),
    }
    println!("  time range:   {}", config.defaults.time_range);
    println!("  sample:       {}", config.defaults.sample);

    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let content = GatewayConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &content)
                .with_context(|| format!("Unable to write {}", path.display()))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", content),
    }

    Ok(())
}

fn handle_version() {
    println!("{} v{}", FULL_NAME, VERSION);
    println!("  build date: {}", BUILD_DATE);
    println!("  target:     {}-{}", std::env::consts::ARCH, std::env::consts::OS);
}

// ----------------------------------------------------------------------------
// Main Entry Point
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        Some(Commands::Run) | None => {}
    }

    let config_found = cli.config.exists();
    let mut config = if config_found {
        GatewayConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        GatewayConfig::default()
    };

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.debug {
        config.logging.level = "debug".into();
    }
    init_logging(&config.logging)?;

    if !config_found {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }
    info!(target: "facette::server", version = VERSION, "Starting {}", FULL_NAME);

    let server = Server::new(config).context("Failed to initialize gateway")?;
    server.run().await?;

    Ok(())
}
