//! Replica Rotator - MySQL staging replica rotation
//!
//! Brings up a read-only replica of the primary plus two staging
//! replicas behind an nginx proxy, then rotates the staging pair on
//! operator command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replica_rotator::config::RotatorConfig;
use replica_rotator::driver::{Driver, TerminalInput};
use replica_rotator::proxy::ProxyRoute;
use replica_rotator::runtime::DockerCli;
use replica_rotator::state::RotationLedger;

/// Replica Rotator - blue/green MySQL staging replicas
#[derive(Parser)]
#[command(name = "replica-rotator")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults apply when it does not exist)
    #[arg(short, long, default_value = "replica-rotator.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the replicas and proxy, then rotate on Enter until Ctrl+C
    Run,

    /// Write a configuration file with the default settings
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "replica-rotator.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show completed rotations from the ledger
    History {
        /// Number of rotations to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Print the proxy config that would route to a container
    RenderProxy {
        /// Target container name
        target: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = RotatorConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_rotator(config).await,
        Commands::Init { output, force } => run_init(&output, force),
        Commands::Validate => run_validate(&cli.config, &config),
        Commands::History { limit } => run_history(&config, limit).await,
        Commands::RenderProxy { target } => {
            print!("{}", ProxyRoute::new(target, config.proxy.listen_port).render());
            Ok(())
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Run the rotation loop until interrupted
async fn run_rotator(config: RotatorConfig) -> anyhow::Result<()> {
    tracing::info!("Starting replica rotator...");
    tracing::info!(
        "Staging replicas {:?}, proxy {} on port {}",
        config.staging.identities,
        config.proxy.container_name,
        config.proxy.published_port
    );

    let runtime = Arc::new(DockerCli::new(config.runtime.docker_binary.clone()));
    let mut driver = Driver::new(runtime, config).context("Failed to set up rotator")?;
    let mut input = TerminalInput::new();

    let rotations = driver.run(&mut input).await.context("Rotation aborted")?;
    tracing::info!("Replica rotator stopped after {} rotation(s)", rotations);
    Ok(())
}

/// Write the default configuration
fn run_init(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{:?} already exists, pass --force to overwrite", output);
    }

    let content = format!(
        "# Replica Rotator Configuration\n# Generated configuration file\n\n{}",
        RotatorConfig::default().to_toml()?
    );
    std::fs::write(output, content)
        .with_context(|| format!("Failed to write {:?}", output))?;

    println!("Configuration written to {:?}", output);
    println!();
    println!("Next steps:");
    println!("  1. Edit the configuration file for your environment");
    println!("  2. Run: replica-rotator --config {:?}", output);
    Ok(())
}

/// Report the effective configuration
fn run_validate(path: &Path, config: &RotatorConfig) -> anyhow::Result<()> {
    if !path.exists() {
        println!("(no file at {:?}, showing defaults)", path);
    }
    println!("✓ Configuration is valid");
    println!("  Primary pattern:  {}", config.primary.name_pattern);
    println!("  Primary-replica:  {}", config.primary_replica().container_name());
    let [first, second] = config.staging_identities()?;
    println!(
        "  Staging pair:     {} / {}",
        first.container_name(),
        second.container_name()
    );
    println!("  Rotation source:  {:?}", config.staging.source);
    println!(
        "  Bootstrap:        {} attempts, {}s {} backoff",
        config.bootstrap.max_attempts, config.bootstrap.retry_delay_secs, config.bootstrap.backoff
    );
    println!(
        "  Proxy:            {} -> {} ({})",
        config.proxy.published_port,
        config.proxy.listen_port,
        config.proxy_config_path().display()
    );
    match &config.state.ledger_path {
        Some(path) => println!("  Ledger:           {}", path.display()),
        None => println!("  Ledger:           disabled"),
    }
    Ok(())
}

/// Print the rotation history
async fn run_history(config: &RotatorConfig, limit: usize) -> anyhow::Result<()> {
    let path = config
        .state
        .ledger_path
        .as_ref()
        .context("No ledger configured (set state.ledger_path)")?;
    let ledger = RotationLedger::open(path)
        .with_context(|| format!("Failed to open ledger {:?}", path))?;

    let records = ledger.history(limit).await?;
    if records.is_empty() {
        println!("No rotations recorded");
        return Ok(());
    }

    println!("{:>6}  {:<25}  {:>6}  {:>6}  {:>6}  {:>8}", "SEQ", "COMPLETED", "SOURCE", "FROM", "TO", "TOOK");
    for record in records {
        println!(
            "{:>6}  {:<25}  {:>6}  {:>6}  {:>6}  {:>7}s",
            record.sequence,
            record.completed_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            record.source.to_string(),
            record.from.to_string(),
            record.to.to_string(),
            record.duration().num_seconds()
        );
    }
    Ok(())
}
