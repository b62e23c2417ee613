use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunflow::attribution::{self, AttributionCache};
use tunflow::Config;

#[derive(Parser, Debug)]
#[command(name = "tunflow")]
#[command(about = "TUN packet translation engine with per-process flow attribution", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the TUN device and translate its traffic
    Run {
        /// Upstream proxy for public web traffic
        #[arg(long)]
        proxy: Option<SocketAddr>,

        /// TUN device name
        #[arg(short, long)]
        name: Option<String>,

        /// Serve process lookups as JSON-RPC on stdin/stdout
        #[arg(long)]
        rpc: bool,
    },

    /// Look up the process owning a local port
    Lookup {
        /// Local port
        #[arg(short, long)]
        port: u16,

        /// Local host of the socket
        #[arg(long)]
        host: Option<String>,

        /// Proxy address the socket is connected to
        #[arg(long)]
        proxy: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 初始化日志（stdout 留给 RPC）
    let log_level = if args.verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tunflow={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = Config::load(args.config.as_deref()).context("failed to load config")?;

    match args.command {
        Commands::Run { proxy, name, rpc } => {
            if proxy.is_some() {
                config.proxy.address = proxy;
            }
            if let Some(name) = name {
                config.tun.name = name;
            }

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl-C, shutting down");
                    signal.cancel();
                }
            });

            if let Err(e) = tunflow::tun::run_tun(config, rpc, shutdown).await {
                error!("Engine error: {}", e);
                return Err(e.into());
            }
        }

        Commands::Lookup { port, host, proxy } => {
            if proxy.is_some() {
                config.proxy.address = proxy;
            }

            let cache = AttributionCache::new(&config.cache, attribution::select_provider(), config.proxy.address);

            let info = cache.lookup_by_port(host.as_deref(), port).await;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}
