use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use ssrelay::config::AppConfig;
use ssrelay::logging;
use ssrelay::resolver::{DnsResolver, SystemLookup};
use ssrelay::server::RelayServer;
use ssrelay::transport::Acceptor;

#[derive(Parser)]
#[command(name = "ssrelay")]
#[command(about = "Server-side relay for SOCKS5-style tunnels", long_about = None)]
struct Args {
    /// JSON configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "app-config.json")]
    config: PathBuf,

    /// Override the configured listen port
    #[arg(short, long)]
    port: Option<u16>,
}

/// Waits for `exit` on stdin. Any other line is answered with a hint.
async fn wait_for_exit() {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line == "exit" => return,
            Ok(Some(_)) => warn!("type exit to stop the server"),
            Ok(None) => {
                info!("stdin closed, running until the process is killed");
                std::future::pending::<()>().await;
            }
            Err(e) => {
                warn!("stdin read failed, running until the process is killed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Ctrl-C does not terminate the relay; only `exit` on stdin does.
async fn suppress_interrupts() {
    loop {
        match tokio::signal::ctrl_c().await {
            Ok(()) => warn!("interrupt ignored, type exit to stop the server"),
            Err(e) => {
                error!("failed to install interrupt handler: {}", e);
                return;
            }
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = AppConfig::load_or_default(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(port) = args.port {
        config.remote_server.server_port = port;
    }
    config.remote_server.validate()?;

    let _guard = logging::init(&config.logging)?;
    info!(config = %args.config.display(), "configuration loaded");

    let remote = config.remote_server;
    let bind_addr = remote.bind_addr();
    let resolver = Arc::new(DnsResolver::with_lookup(
        Arc::new(SystemLookup),
        remote.dns_cache_capacity,
        remote.dns_ttl(),
    ));
    let server = RelayServer::new(remote, resolver);

    tokio::spawn(suppress_interrupts());

    server.start().await;
    let listening = server
        .tcp_acceptor()
        .await
        .is_some_and(|tcp| tcp.is_running());
    if !listening {
        server.stop().await;
        bail!("relay server failed to listen on {}", bind_addr);
    }

    info!("type exit to stop the server");
    wait_for_exit().await;

    server.stop().await;
    info!("relay server exited");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(run(args))
}
