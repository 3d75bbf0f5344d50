//! Tally CLI
//!
//! Command-line interface for running Tally validation nodes.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tally_node::config::LoggingConfig;
use tally_node::{NodeConfig, TallyNode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "tally")]
#[command(version)]
#[command(about = "Tally - reputation-weighted validation of market data over a P2P mesh", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a Tally node
    Node {
        /// Configuration file path; defaults plus environment if absent
        #[arg(short, long, env = "TALLY_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Write a default configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "tally.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show version information
    Version {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Node { config } => {
            let node_config = NodeConfig::load(config.as_deref())?;
            init_logging(cli.verbose, &node_config.logging);

            match &config {
                Some(path) => tracing::info!("Config: {:?}", path),
                None => tracing::info!("No config file given, using defaults"),
            }

            let node = TallyNode::new(node_config).await?;
            node.run().await?;
        }

        Commands::Init { output, force } => {
            init_logging(cli.verbose, &LoggingConfig::default());

            if output.exists() && !force {
                anyhow::bail!("{:?} already exists (use --force to overwrite)", output);
            }
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&output, NodeConfig::default().to_toml()?)?;

            println!("Configuration written to {:?}", output);
        }

        Commands::Version { json } => {
            let version = env!("CARGO_PKG_VERSION");
            if json {
                let info = serde_json::json!({
                    "name": "tally",
                    "version": version,
                    "topic": tally_node::VALIDATION_TOPIC,
                });
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("Tally v{}", version);
                println!("Validation topic: {}", tally_node::VALIDATION_TOPIC);
            }
        }
    }

    Ok(())
}
