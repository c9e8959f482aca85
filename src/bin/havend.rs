//! Haven daemon binary.

use clap::Parser;
use haven::config::HavenConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "havend")]
#[command(about = "Haven high-availability manager daemon")]
struct Args {
    /// Cluster-unique node name
    #[arg(short, long, env = "HAVEN_NODE_NAME")]
    node_name: Option<String>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cluster filesystem mount point
    #[arg(long)]
    cluster_dir: Option<PathBuf>,

    /// Watchdog multiplexer socket
    #[arg(long)]
    watchdog_socket: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load or create configuration
    let mut config = if let Some(config_path) = &args.config {
        HavenConfig::from_file(config_path)?
    } else {
        HavenConfig::default()
    };

    // Override with CLI args
    if let Some(node_name) = args.node_name {
        config.node.name = node_name;
    }
    if let Some(cluster_dir) = args.cluster_dir {
        config.cluster.base_dir = cluster_dir;
    }
    if let Some(watchdog_socket) = args.watchdog_socket {
        config.cluster.watchdog_socket = watchdog_socket;
    }
    if args.json_logs {
        config.observability.json_logs = true;
    }

    haven::observability::init(&config.observability)?;

    haven::run(config).await?;

    Ok(())
}
