//! # JFAP - Comms Layer Handshake and Conversation Multiplexing
//!
//! The connection layer of a messaging bus: two processes open one physical
//! stream, agree on a FAP version and capability set, then run many
//! independent conversations over it.
//!
//! ## Features
//!
//! - **Version negotiation**: sparse supported-version tables, highest common FAP level wins
//! - **Capability negotiation**: 16-bit masks with reserved-bit validation and version gating
//! - **Conversation multiplexing**: odd/even id spaces, per-conversation failure isolation
//! - **Exchanges**: correlated request/reply with timeouts
//! - **Priorities**: 15 caller levels plus a control level for heartbeats
//! - **Chunking**: large messages split across frames and reassembled
//! - **Read-ahead**: consumer-side flow control with low/high watermarks
//! - **Optimized transactions**: transaction flags flowed inline when negotiated
//!
//! ## Architecture
//!
//! ```text
//! Initiator                                                Acceptor
//!    |                                                        |
//!    |---- HANDSHAKE (faps, caps, heartbeat, sizes) -------->|
//!    |<--- ACCEPTED (fap level, caps) / REJECTED (reason) ---|
//!    |                                                        |
//!    |---- CONVERSATION_OPEN (conv 1) ---------------------->|
//!    |<--- accepted ------------------------------------------|
//!    |==== DATA / EXCHANGE (conv 1, 3, 5 ...) ==============>|
//!    |<=== DATA / EXCHANGE (conv 2, 4, 6 ...) ===============|
//!    |                                                        |
//!    |---- HEARTBEAT (idle only, control priority) --------->|
//!    |---- LOGICAL_CLOSE / PHYSICAL_CLOSE ------------------>|
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use jfap::config::Config;
//! use jfap::mux::{MultiplexerOptions, Priority};
//! use jfap::protocol::ConnectionProperties;
//!
//! # async fn run() -> jfap::Result<()> {
//! let options = MultiplexerOptions::new(Config::load_default()?);
//! let mux = jfap::transport::connect(ConnectionProperties::endpoint("localhost", 7276), options)
//!     .await?;
//! println!("negotiated FAP {}", mux.metadata().fap_level);
//!
//! let conversation = mux.open_conversation(Priority::LOWEST).await?;
//! conversation.on_failure(|e| eprintln!("conversation failed: {e}"))?;
//! let reply = conversation.exchange("hello", Priority::LOWEST).await?;
//! assert!(!reply.is_empty());
//!
//! conversation.close().await?;
//! mux.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Handshake records, version and capability negotiation, transaction flags
//! - [`codec`]: Frame header, incremental decoder, chunking
//! - [`mux`]: Multiplexer, conversations, exchanges, priorities
//! - [`flow`]: Read-ahead flow control and consumer callback dispatch
//! - [`transport`]: TCP connect and listen
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod codec;
pub mod config;
pub mod error;
pub mod flow;
pub mod mux;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use config::Config;
pub use error::{ErrorKind, JfapError, Result};
pub use mux::{Conversation, Inbound, Multiplexer, MultiplexerOptions, Priority, SendPriority};
pub use protocol::{
    CapabilityMask, ConnectionMetaData, ConnectionProperties, HandshakeKind, ProtocolVersion,
    SupportedVersionTable, TransactionFlags,
};
pub use transport::TcpTransport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Highest FAP level this implementation speaks
pub const FAP_LEVEL: u16 = ProtocolVersion::CURRENT.0;
