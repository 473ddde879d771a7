//! Serialgate Node -- gateway between serial-line devices and an in-process
//! publish/subscribe bus.
//!
//! Usage:
//!   serialgate-node                           # Run with default config
//!   serialgate-node --config path.toml        # Run with custom config
//!   serialgate-node tcp --listen 0.0.0.0:11411
//!   serialgate-node serial --device /dev/ttyUSB0
//!   serialgate-node config                    # Print effective config

use serialgate_node::config::{self, TransportKind};
use serialgate_node::expand_tilde;
use serialgate_node::local_bus::LocalBus;
use serialgate_node::transport;
use serialgate_node::BridgeFactory;

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "serialgate-node", about = "Serial device to pub/sub gateway")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.serialgate/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run with the configured transport (default)
    Run,
    /// Accept device connections over TCP
    Tcp {
        /// Listen address, overrides the config file
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Talk to one device on a serial line
    Serial {
        /// Device path, overrides the config file
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "serialgate_node=info,serialgate_protocol=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let mut cfg = config::GatewayConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run) | None => {}
        Some(Commands::Tcp { listen }) => {
            cfg.gateway.transport = TransportKind::Tcp;
            if let Some(listen) = listen {
                cfg.gateway.listen_addr = listen;
            }
        }
        Some(Commands::Serial { device }) => {
            cfg.gateway.transport = TransportKind::Serial;
            if let Some(device) = device {
                cfg.gateway.serial_device = device;
            }
        }
        Some(Commands::Config) => {
            print!("{}", toml::to_string_pretty(&cfg)?);
            return Ok(());
        }
    }

    run_gateway(cfg).await
}

async fn run_gateway(cfg: config::GatewayConfig) -> anyhow::Result<()> {
    let session_config = cfg.session.session_config();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = ?cfg.gateway.transport,
        timeout_ms = cfg.session.timeout_interval_ms,
        attempt_ms = cfg.session.attempt_interval_ms,
        "starting serialgate-node"
    );

    let factory: Arc<dyn BridgeFactory> = Arc::new(LocalBus::new());

    // Shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let gateway_handle = {
        let shutdown = shutdown_tx.subscribe();
        match cfg.gateway.transport {
            TransportKind::Tcp => {
                let listener = tokio::net::TcpListener::bind(&cfg.gateway.listen_addr).await?;
                tokio::spawn(transport::serve_tcp(
                    listener,
                    session_config,
                    factory,
                    shutdown,
                ))
            }
            TransportKind::Serial => {
                let device = expand_tilde(&cfg.gateway.serial_device);
                let delay = Duration::from_millis(cfg.gateway.reconnect_delay_ms);
                tokio::spawn(async move {
                    transport::serve_serial(&device, delay, session_config, factory, shutdown)
                        .await
                })
            }
        }
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(());

    gateway_handle.await??;
    tracing::info!("gateway stopped");
    Ok(())
}
