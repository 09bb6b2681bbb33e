//! Cohort - group membership node
//!
//! Runs one member of a statically configured group until interrupted.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use cohort_core::CohortConfig;
use cohort_group::{GroupEventsListener, GroupManager, MemberId};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cohort")]
#[command(author = "Cohort Team")]
#[command(version = cohort_core::VERSION)]
#[command(about = "Group membership and messaging node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Host name other members reach this node by
    #[arg(long, env = "COHORT_HOST")]
    host: Option<String>,

    /// Client-facing port, part of the node identity
    #[arg(short, long, env = "COHORT_PORT")]
    port: Option<u16>,

    /// Port the group layer listens on
    #[arg(long, env = "COHORT_GROUP_PORT")]
    group_port: Option<u16>,

    /// Comma separated peers (`host:port[:group_port]`)
    #[arg(long, env = "COHORT_PEERS", value_delimiter = ',')]
    peers: Option<Vec<String>>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "COHORT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, env = "COHORT_LOG_FORMAT")]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the group and run until interrupted
    Run {
        /// Log the membership state every N seconds
        #[arg(long)]
        status_interval: Option<u64>,
    },

    /// Print the effective configuration and exit
    Config,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Load or create config
    let mut config = if let Some(config_path) = &cli.config {
        CohortConfig::from_file(config_path)?
    } else {
        CohortConfig::from_env()
    };

    // Override with CLI args
    if let Some(host) = cli.host {
        config.node.host = host;
    }
    if let Some(port) = cli.port {
        config.node.port = port;
    }
    if let Some(group_port) = cli.group_port {
        config.node.group_port = group_port;
    }
    if let Some(peers) = cli.peers {
        config.group.peers = peers;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    init_logging(&config);

    match cli.command {
        Some(Commands::Version) => {
            println!("cohort {}", cohort_core::VERSION);
        }
        Some(Commands::Config) => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Some(Commands::Run { status_interval }) => {
            run_node(config, status_interval.map(Duration::from_secs)).await?;
        }
        None => run_node(config, None).await?,
    }

    Ok(())
}

fn init_logging(config: &CohortConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

struct MembershipLog;

impl GroupEventsListener for MembershipLog {
    fn node_joined(&self, id: &MemberId) {
        info!("Node joined: {}", id);
    }

    fn node_left(&self, id: &MemberId) {
        warn!("Node left: {}", id);
    }
}

async fn run_node(config: CohortConfig, status_interval: Option<Duration>) -> anyhow::Result<()> {
    let nodes = config.group_nodes()?;
    info!("Starting Cohort node {}", config.local_node());
    info!("Group port: {}", config.node.group_port);
    info!("Configured group: {} node(s)", nodes.len());

    let manager = GroupManager::from_config(&config)?;
    manager.register_for_group_events(Arc::new(MembershipLog));
    manager.join(&nodes).await?;

    match status_interval {
        Some(every) if !every.is_zero() => {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        info!("Members: {:?}", manager.members());
                        debug!("State: {}", manager.state_map());
                    }
                }
            }
        }
        _ => tokio::signal::ctrl_c().await?,
    }

    info!("Interrupted, leaving the group");
    manager.shutdown().await;
    Ok(())
}
