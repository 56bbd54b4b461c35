use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use searchpool::cli;
use searchpool::config;
use searchpool::Transport;

#[derive(Parser)]
#[command(name = "searchpool")]
#[command(version, about = "Cluster-aware search transport with node discovery", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Comma-separated node URLs, overriding the config file
    #[arg(long, global = true)]
    hosts: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the cluster answers
    Ping,

    /// Discover the cluster topology and print eligible nodes
    Nodes,

    /// Perform an arbitrary request
    Request {
        /// HTTP method (GET, POST, PUT, DELETE, ...)
        method: String,

        /// Request path, e.g. /_cluster/health
        path: String,

        /// Request body (JSON if it parses, raw text otherwise)
        #[arg(long)]
        body: Option<String>,

        /// Query parameter as key=value (repeatable)
        #[arg(long = "param")]
        params: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Sequential one-shot commands; a single-threaded runtime is enough
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = match &cli.hosts {
        Some(hosts) => config::TransportConfig::with_hosts(
            hosts
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
        ),
        None => config::load_config(cli.config.as_deref())?,
    };

    let transport = Transport::new(config).await?;

    let result = match cli.command {
        Commands::Ping => cli::commands::cmd_ping(&transport).await,
        Commands::Nodes => cli::commands::cmd_nodes(&transport).await,
        Commands::Request {
            method,
            path,
            body,
            params,
        } => cli::commands::cmd_request(&transport, &method, &path, body.as_deref(), &params).await,
    };

    transport.close().await;
    result
}
