//! rotad — the rotagrid daemon.
//!
//! # Usage
//!
//! ```text
//! rotad simulate --nodes 3 --jobs 1,2,3,4 --api-port 8440
//! rotad serve --config /etc/rotagrid/rotad.toml      # feature "grpc"
//! ```

#[cfg(feature = "grpc")]
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use rotad::simulate::{run_simulate, SimulateOptions};
use rotagrid_node::NodeConfig;

const DEFAULT_FILTER: &str = "info,rotad=debug,rotagrid=debug";

#[derive(Parser)]
#[command(name = "rotad", about = "rotagrid rebalancing daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run several nodes in one process over an in-memory cluster.
    Simulate {
        /// Number of nodes to start.
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Size of the initial voting set (node-1..node-N); defaults to all nodes.
        #[arg(long)]
        voters: Option<usize>,

        /// Initial job ids.
        #[arg(long, value_delimiter = ',', default_value = "1,2,3,4,5")]
        jobs: Vec<u32>,

        /// Cluster name.
        #[arg(long, default_value = "rotagrid")]
        cluster: String,

        /// Admin API port.
        #[arg(long, default_value = "8440")]
        api_port: u16,

        /// Barrier timeout in milliseconds.
        #[arg(long, default_value = "10000")]
        confirm_timeout_ms: u64,
    },

    /// Run one node of a multi-process cluster.
    #[cfg(feature = "grpc")]
    Serve {
        /// Path to rotad.toml.
        #[arg(long, default_value = "rotad.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match cli.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    match cli.command {
        Command::Simulate {
            nodes,
            voters,
            jobs,
            cluster,
            api_port,
            confirm_timeout_ms,
        } => {
            if nodes == 0 {
                anyhow::bail!("--nodes must be at least 1");
            }
            run_simulate(SimulateOptions {
                cluster,
                nodes,
                voters: voters.unwrap_or(nodes).max(1),
                jobs,
                api_port,
                config: NodeConfig::default()
                    .with_confirm_timeout(Duration::from_millis(confirm_timeout_ms)),
            })
            .await
        }
        #[cfg(feature = "grpc")]
        Command::Serve { config } => {
            let config = rotad::RotadConfig::from_file(&config)?;
            rotad::serve::run_serve(config).await
        }
    }
}
