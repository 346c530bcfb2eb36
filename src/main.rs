//! clockwire: run the connection process, the core process, or both.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clockwire::backend::FirmwareStore;
use clockwire::ipc::socket;
use clockwire::{Config, CoreService, PacketServer, QueuePair, logging};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "clockwire")]
#[command(about = "Time-clock terminal protocol server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept terminal connections and relay them to core
    Packet {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run the core process; waits for the packet and site processes to connect
    Core {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run packet server and core in one process; the site still connects by socket
    Standalone {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Zero-pad fw_<version>.bin to whole FOTA blocks
    AlignFirmware {
        version: u16,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    logging::init(config.log_filter.as_deref());
    Ok(config)
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Packet { config } => cmd_packet(load_config(config.as_ref())?).await,
        Commands::Core { config } => cmd_core(load_config(config.as_ref())?).await,
        Commands::Standalone { config } => cmd_standalone(load_config(config.as_ref())?).await,
        Commands::AlignFirmware { version, config } => {
            let config = load_config(config.as_ref())?;
            let path = FirmwareStore::new(&config.fota.firmware_dir).align(version).await?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

async fn bind(config: &Config) -> Result<TcpListener> {
    TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.server.listen_addr))
}

async fn cmd_packet(config: Config) -> Result<()> {
    let listener = bind(&config).await?;
    let core = socket::connect("packet", &config.ipc.packet_socket, config.ipc.connect_attempts)
        .await
        .context("connecting to core")?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let server = Arc::new(PacketServer::new(config.link.clone(), core.sink));
    server.run(listener, core.source, cancel).await?;
    Ok(())
}

async fn cmd_core(config: Config) -> Result<()> {
    let (packet, site) = tokio::try_join!(
        socket::accept("packet", &config.ipc.packet_socket),
        socket::accept("site", &config.ipc.site_socket),
    )
    .context("waiting for peer processes")?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let core = Arc::new(CoreService::new(&config, packet.sink, site.sink));
    core.run(packet.source, site.source, cancel).await?;
    Ok(())
}

async fn cmd_standalone(config: Config) -> Result<()> {
    let listener = bind(&config).await?;
    let (packet_side, core_side) = QueuePair::memory_link("packet", config.ipc.queue_depth);
    let site = socket::accept("site", &config.ipc.site_socket)
        .await
        .context("waiting for the site process")?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let core = Arc::new(CoreService::new(&config, core_side.sink, site.sink));
    let server = Arc::new(PacketServer::new(config.link.clone(), packet_side.sink));

    let core_task = tokio::spawn(core.run(core_side.source, site.source, cancel.clone()));
    let served = server.run(listener, packet_side.source, cancel.clone()).await;
    cancel.cancel();
    core_task.await.context("core task")??;
    served?;
    Ok(())
}
