//! webrtc-im command line endpoint
//!
//! Usage:
//!   webrtc-im identity
//!   webrtc-im classify <peer-ip>
//!   webrtc-im config [--init]
//!   webrtc-im chat --peer <id> [--id <id>] [--fallback]
//!
//! In chat mode each stdin line is sent as text; `/file <path>` sends a file
//! over the data channel and `/quit` leaves.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use webrtc_im::config::get_config_path;
use webrtc_im::{
    classify, http_resolvers, ChannelPayload, Config, ConnectionEvent, ConnectionManager,
    DeviceClass, FilePayload, LocalityClassifier, Locality, NetworkIdentity, PeerId, RelayCarrier,
    RtcPeerConnectionFactory,
};

#[derive(Parser)]
#[command(name = "webrtc-im")]
#[command(about = "Peer-to-peer messaging over WebRTC data channels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve this endpoint's public network identity
    Identity,
    /// Classify a peer address as near or far
    Classify {
        /// Public address the peer announced
        peer_ip: String,
    },
    /// Print the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        init: bool,
    },
    /// Chat with a peer through the relay
    Chat {
        /// Peer to connect to
        #[arg(long)]
        peer: String,
        /// Local endpoint id (random if omitted)
        #[arg(long)]
        id: Option<String>,
        /// Skip WebRTC and send text through the relay
        #[arg(long)]
        fallback: bool,
    },
}

fn classifier(config: &Config) -> LocalityClassifier {
    LocalityClassifier::from_config(
        &config.locality,
        http_resolvers(config.locality.resolve_timeout()),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    // Default to info, override with RUST_LOG=webrtc_im=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("webrtc_im=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Identity => {
            let identity = classifier(&config).resolve_self_identity().await;
            println!("{}", identity.as_wire());
        }
        Commands::Classify { peer_ip } => {
            let own = classifier(&config).resolve_self_identity().await;
            let peer = NetworkIdentity::from_wire(&peer_ip);
            let locality = classify(&own, &peer);
            println!("{} ({} vs {})", locality_name(locality), own.as_wire(), peer.as_wire());
        }
        Commands::Config { init } => {
            if init {
                config.save().context("Failed to write config")?;
                eprintln!("Wrote {}", get_config_path().display());
            }
            println!("# {}", get_config_path().display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Chat { peer, id, fallback } => {
            let local_id = id.map(PeerId::from).unwrap_or_else(PeerId::generate);
            chat(config, local_id, PeerId::from(peer), fallback).await?;
        }
    }

    Ok(())
}

fn locality_name(locality: Locality) -> &'static str {
    match locality {
        Locality::Near => "near",
        Locality::Far => "far",
    }
}

async fn chat(config: Config, local_id: PeerId, peer: PeerId, fallback: bool) -> Result<()> {
    if config.relay.url.is_none() {
        bail!(
            "No relay configured. Set RELAY_URL or add [relay] url to {}",
            get_config_path().display()
        );
    }

    info!("Local id: {}", local_id);
    let relay = RelayCarrier::connect(&config.relay, local_id.clone(), DeviceClass::Desktop)
        .await
        .context("Failed to connect to relay")?;

    let manager = ConnectionManager::builder(local_id, Arc::new(RtcPeerConnectionFactory::new()))
        .ice_servers(config.ice.servers.clone())
        .far(Arc::new(relay))
        .classifier(Arc::new(classifier(&config)))
        .build();

    let mut events = manager.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Message { from, payload } => match payload {
                    ChannelPayload::Text(text) => println!("<{}> {}", from, text),
                    ChannelPayload::File(file) => {
                        println!("<{}> sent {} ({} bytes)", from, file.name, file.data.len())
                    }
                },
                ConnectionEvent::StateChanged { peer, state } => {
                    eprintln!("* {} is {:?}", peer, state)
                }
                ConnectionEvent::ModeSelected { peer, mode } => {
                    eprintln!("* talking to {} via {}", peer, mode)
                }
                ConnectionEvent::IncomingRequest { from } => {
                    eprintln!("* {} wants to connect", from)
                }
                ConnectionEvent::Closed { peer } => eprintln!("* session with {} closed", peer),
            }
        }
    });

    if fallback {
        // No broadcast carrier here, so a near hint lands on relay fallback
        manager.connect(&peer, Locality::Near).await?;
    } else {
        manager.connect(&peer, Locality::Far).await?;
        manager.wait_ready().await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        let result = match line.strip_prefix("/file ") {
            Some(path) => match read_file(Path::new(path.trim())).await {
                Ok(file) => manager.send_files(vec![file]).await,
                Err(e) => {
                    warn!("{:#}", e);
                    continue;
                }
            },
            None => manager.send_text(line).await,
        };
        if let Err(e) = result {
            warn!("Send failed: {}", e);
        }
    }

    manager.shutdown().await;
    printer.abort();
    Ok(())
}

async fn read_file(path: &Path) -> Result<FilePayload> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("File has no name")?;
    Ok(FilePayload::new(name, data))
}
