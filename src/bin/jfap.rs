//! JFAP CLI binary.
//!
//! Connection-layer diagnostics for the messaging bus comms protocol.
//!
//! # Commands
//!
//! - `versions` - Show the local supported-version table and capability mask
//! - `negotiate` - Negotiate a FAP level and capabilities offline
//! - `listen` - Accept connections and echo exchanges back
//! - `connect` - Connect, print connection metadata, run one exchange

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use jfap::{
    config::Config,
    mux::{Conversation, Inbound, MultiplexerOptions, Priority},
    protocol::{
        CapabilityMask, ConnectionProperties, FapBitmap, HandshakeKind, NegotiatedCapabilities,
        SupportedVersionTable, TransportFacts, TransportProfile,
    },
    transport::{self, TcpTransport},
    VERSION,
};
use serde_json::json;

#[derive(Parser)]
#[command(name = "jfap")]
#[command(version = VERSION)]
#[command(about = "JFAP - comms layer handshake and conversation multiplexing", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/jfap/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the local supported-version table and capability mask
    Versions {
        /// Highest FAP level to advertise
        #[arg(long)]
        max_level: Option<u16>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Negotiate a FAP level and capabilities without a connection
    Negotiate {
        /// Local supported levels, comma separated (default: legacy table)
        #[arg(long, value_delimiter = ',')]
        local: Vec<u16>,

        /// Peer supported levels, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        peer: Vec<u16>,

        /// Peer capability word (hex, e.g. 0x0047)
        #[arg(long, default_value = "0x0047")]
        peer_caps: String,
    },

    /// Accept connections and echo every exchange back
    Listen {
        /// Listen port
        #[arg(short, long, default_value = "7276")]
        port: u16,

        /// Listen host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Advertise as a messaging engine rather than a client
        #[arg(long)]
        engine: bool,
    },

    /// Connect to a listener and run one exchange
    Connect {
        /// Peer host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Peer port
        #[arg(short, long, default_value = "7276")]
        port: u16,

        /// Message to exchange
        #[arg(short, long, default_value = "ping")]
        message: String,

        /// Conversation priority (0-14)
        #[arg(long, default_value = "0")]
        priority: u8,

        /// Transport profile reported in metadata: plain, tls, tunneled, tunneled-tls
        #[arg(short, long, default_value = "plain")]
        transport: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Versions { max_level, json } => cmd_versions(max_level, json),

        Commands::Negotiate {
            local,
            peer,
            peer_caps,
        } => cmd_negotiate(&local, &peer, &peer_caps),

        Commands::Listen { port, host, engine } => {
            init_logging(cli.verbose);
            let config = load_config(cli.config)?;
            cmd_listen(config, &host, port, engine)
        },

        Commands::Connect {
            host,
            port,
            message,
            priority,
            transport,
        } => {
            init_logging(cli.verbose);
            let config = load_config(cli.config)?;
            cmd_connect(config, host, port, message, priority, &transport)
        },
    }
}

fn cmd_versions(max_level: Option<u16>, json: bool) -> anyhow::Result<()> {
    let mut table = SupportedVersionTable::legacy();
    if let Some(max) = max_level {
        table = table.clamp(max);
    }
    let mask = CapabilityMask::DEFAULT;

    if json {
        let entries: Vec<_> = table
            .entries()
            .map(|(ordinal, supported)| json!({ "level": ordinal, "supported": supported }))
            .collect();
        let value = json!({
            "versions": entries,
            "highest": table.highest().map(|v| v.ordinal()),
            "capabilities": format!("0x{:04x}", mask.bits()),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("FAP levels:");
    for (ordinal, supported) in table.entries() {
        println!(
            "  {ordinal:>3}  {}",
            if supported { "supported" } else { "reserved" }
        );
    }
    match table.highest() {
        Some(v) => println!("Highest:      {v}"),
        None => println!("Highest:      none"),
    }
    println!("Capabilities: 0x{:04x}", mask.bits());
    Ok(())
}

fn cmd_negotiate(local: &[u16], peer: &[u16], peer_caps: &str) -> anyhow::Result<()> {
    let table = if local.is_empty() {
        SupportedVersionTable::legacy()
    } else {
        SupportedVersionTable::from_ordinals(local.iter().copied())
    };
    let peer_bitmap = FapBitmap::from_ordinals(peer.iter().copied());
    let peer_bits = parse_caps(peer_caps)?;

    let version = table.negotiate(&peer_bitmap)?;
    let capabilities = NegotiatedCapabilities::negotiate(CapabilityMask::DEFAULT, peer_bits, version)?;

    let value = json!({
        "fap_level": version.ordinal(),
        "capabilities": capabilities,
        "transactions": capabilities.transactions(),
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn cmd_listen(config: Config, host: &str, port: u16, engine: bool) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let kind = if engine {
        HandshakeKind::MessagingEngine
    } else {
        HandshakeKind::Client
    };
    let options = MultiplexerOptions::new(config).with_kind(kind);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(addr, options))
}

async fn serve(addr: SocketAddr, options: MultiplexerOptions) -> anyhow::Result<()> {
    let listener = TcpTransport::bind(addr, options.clone()).await?;
    loop {
        let (stream, peer) = listener.accept_stream().await?;
        let options = options.clone();
        tokio::spawn(async move {
            match jfap::Multiplexer::accept(stream, options).await {
                Ok(mux) => {
                    tracing::info!(%peer, fap_level = mux.metadata().fap_level, "Peer connected");
                    while let Some(conversation) = mux.accept_conversation().await {
                        tokio::spawn(echo(conversation));
                    }
                    tracing::info!(%peer, stats = ?mux.stats(), "Peer disconnected");
                },
                Err(e) => tracing::warn!(%peer, error = %e, "Handshake failed"),
            }
        });
    }
}

async fn echo(mut conversation: Conversation) {
    let id = conversation.id();
    while let Some(inbound) = conversation.recv().await {
        match inbound {
            Inbound::Request(request) => {
                if let Err(e) = conversation.reply(&request, request.payload.clone()) {
                    tracing::warn!(conversation_id = id, error = %e, "Reply failed");
                    break;
                }
            },
            Inbound::Data(data) => {
                tracing::debug!(conversation_id = id, bytes = data.len(), "Data received");
            },
            Inbound::Refill(refill) => {
                tracing::debug!(conversation_id = id, ?refill, "Refill requested");
            },
        }
    }
    tracing::debug!(conversation_id = id, state = ?conversation.state(), "Conversation ended");
}

fn cmd_connect(
    config: Config,
    host: String,
    port: u16,
    message: String,
    priority: u8,
    transport_profile: &str,
) -> anyhow::Result<()> {
    let profile = TransportProfile::from_str(transport_profile).map_err(|e| anyhow::anyhow!(e))?;
    let priority = Priority::new(priority)?;
    let options = MultiplexerOptions::new(config).with_transport(TransportFacts::new(profile));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mux = transport::connect(ConnectionProperties::endpoint(host, port), options).await?;
        println!("{}", serde_json::to_string_pretty(mux.metadata())?);

        let conversation = mux.open_conversation(priority).await?;
        let started = std::time::Instant::now();
        let reply = conversation.exchange(message, priority).await?;
        eprintln!(
            "Reply: {} bytes in {:.1} ms",
            reply.len(),
            started.elapsed().as_secs_f64() * 1000.0
        );
        println!("{}", String::from_utf8_lossy(&reply));

        conversation.close().await?;
        mux.close().await?;
        Ok::<_, anyhow::Error>(())
    })
}

// Helper functions

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let file = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::load_default()?,
    };
    let config = file.merge(Config::from_env());
    config.validate()?;
    Ok(config)
}

fn parse_caps(s: &str) -> anyhow::Result<u16> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16)
        .map_err(|e| anyhow::anyhow!("Invalid capability word {s}: {e}"))
}
