mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peerlink_protocol::{
    JsonDeviceStore, LocalAdapter, MessageType, PeerLinkService, ReceivedMessage, TcpTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use config::Config;

/// PeerLink session daemon
#[derive(Debug, Parser)]
#[command(name = "peerlink-daemon", version, about)]
struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/peerlink/daemon.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept sessions and chat over stdin
    Serve,
    /// Dial a paired device and chat over stdin
    Connect {
        /// Device address
        address: String,
    },
    /// List paired devices
    Devices,
    /// Rename a paired device
    Rename {
        /// Device address
        address: String,
        /// New display name
        name: String,
    },
    /// Forget a paired device
    Unpair {
        /// Device address
        address: String,
    },
}

/// Main daemon state
struct Daemon {
    /// Configuration
    config: Config,

    /// Protocol service
    service: PeerLinkService,
}

impl Daemon {
    /// Create a new daemon
    fn new(config: Config) -> Result<Self> {
        config
            .ensure_directories()
            .context("Failed to create directories")?;

        let store = JsonDeviceStore::open(config.registry_path())
            .context("Failed to open device registry")?;

        let adapter = LocalAdapter {
            name: Some(config.device.name.clone()),
            address: config.device.address.clone(),
        };
        let transport = TcpTransport::new(
            adapter,
            config.network.listen_addr,
            config.peers.clone(),
        );

        let service = PeerLinkService::new(
            config.service_config(),
            Arc::new(transport),
            Arc::new(store),
        );

        Ok(Self { config, service })
    }

    /// Run one command to completion
    async fn run(&self, command: Command) -> Result<()> {
        self.service
            .start()
            .await
            .context("Failed to start service")?;

        match command {
            Command::Serve => {
                self.service
                    .start_serving()
                    .await
                    .context("Failed to start serving")?;
                info!("Listening on {}", self.config.network.listen_addr);
                self.chat().await
            }
            Command::Connect { address } => {
                self.service
                    .connect(&address)
                    .await
                    .with_context(|| format!("Failed to connect to {}", address))?;
                self.chat().await
            }
            Command::Devices => {
                let paired = self.service.paired_devices().borrow().clone();
                if paired.is_empty() {
                    println!("No paired devices");
                }
                for device in paired {
                    println!(
                        "{:<24} {:<20} {}{}",
                        device.display_name(),
                        device.address,
                        if device.is_connected { "connected" } else { "-" },
                        if device.is_master { " (master)" } else { "" },
                    );
                }
                Ok(())
            }
            Command::Rename { address, name } => {
                self.service
                    .rename_device(&name, &address)
                    .await
                    .with_context(|| format!("Failed to rename {}", address))?;
                println!("Renamed {} to {}", address, name);
                Ok(())
            }
            Command::Unpair { address } => {
                self.service
                    .unpair(&address)
                    .await
                    .with_context(|| format!("Failed to unpair {}", address))?;
                println!("Unpaired {}", address);
                Ok(())
            }
        }
    }

    /// Send stdin lines and print inbound traffic until EOF or Ctrl+C
    async fn chat(&self) -> Result<()> {
        let mut messages = self.service.messages();
        let mut notices = self.service.notices();
        let mut errors = self.service.errors();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        info!("Type a line to send it, Ctrl+C to stop");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    return Ok(());
                }
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read stdin")? else {
                        info!("Input closed");
                        return Ok(());
                    };
                    if line.is_empty() {
                        continue;
                    }
                    match self.service.send(Some(&line), MessageType::Standard).await {
                        Ok(Some(_)) => {}
                        Ok(None) => println!("-- not connected, message dropped"),
                        Err(e) => println!("-- {}", e.user_message()),
                    }
                }
                received = messages.recv() => {
                    match received {
                        Ok(received) => print_message(&received),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Skipped {} messages", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
                Ok(notice) = notices.recv() => println!("-- {}", notice),
                Ok(error) = errors.recv() => {
                    error!("{}", error.message);
                    println!("-- {}", error.user_message);
                }
            }
        }
    }

    /// Shutdown the daemon
    async fn shutdown(&self) {
        info!("Shutting down daemon...");
        self.service.shutdown().await;
        info!("Daemon shutdown complete");
    }
}

fn print_message(received: &ReceivedMessage) {
    let message = &received.message;
    println!(
        "[{}] {}: {} ({})",
        received.received_at.format("%H:%M:%S"),
        message.sender_name,
        message.body.as_deref().unwrap_or(""),
        received.size_label,
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.network.log_level)),
        )
        .init();

    info!("Starting PeerLink daemon...");
    info!("Device name: {}", config.device.name);
    info!("Known peers: {}", config.peers.len());

    let daemon = Daemon::new(config).context("Failed to create daemon")?;

    let result = daemon.run(cli.command).await;

    daemon.shutdown().await;

    result
}
