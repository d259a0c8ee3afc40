//! JFAP connection handshake and negotiation.
//!
//! Before any conversation traffic flows, the two ends of a physical
//! connection exchange handshake records and agree on a FAP version, a pair
//! of capability masks, heartbeat settings and size limits.
//!
//! ## Message Flow
//!
//! ```text
//! Initiator                           Acceptor
//!    |                                   |
//!    |---- HANDSHAKE (faps, caps) ------>|  Advertise versions and capabilities
//!    |                                   |
//!    |<--- ACCEPTED (fap level, caps) ---|  Highest common version chosen
//!    |     or REJECTED (reason)          |
//!    |                                   |
//!    |==== conversations (multiplexed) ==|
//!    |                                   |
//!    |---- HEARTBEAT ------------------->|  Priority 15, idle connections only
//!    |<--- HEARTBEAT RESPONSE -----------|
//! ```
//!
//! ## State Machine
//!
//! | State          | Description                          | Valid Transitions            |
//! |----------------|--------------------------------------|------------------------------|
//! | `Init`         | Nothing sent                         | → SendingCaps, Negotiating   |
//! | `SendingCaps`  | Request handed to the writer         | → AwaitingPeer               |
//! | `AwaitingPeer` | Waiting for the correlated reply     | → Negotiating                |
//! | `Negotiating`  | Checking the peer's record           | → Ready                      |
//! | `Ready`        | Connection usable                    | → Closing                    |
//! | `Closing`      | Close requested                      | → Closed                     |
//! | `Closed`       | Terminal                             |                              |
//! | `Failed`       | Terminal, reachable from any state   |                              |
//!
//! ## Version Negotiation
//!
//! The local [`SupportedVersionTable`] is sparse: revisions reserved for
//! service streams are explicit `false` entries and are never chosen, even if
//! the peer advertises them. The negotiated version is the highest revision
//! both sides support.
//!
//! # Usage
//!
//! ```rust
//! use jfap::config::Config;
//! use jfap::protocol::{HandshakeKind, HandshakeStateMachine, LocalHandshake, ProtocolVersion};
//!
//! let config = Config::default();
//! let mut client = HandshakeStateMachine::initiator(
//!     LocalHandshake::from_config(&config, HandshakeKind::Client),
//! );
//! let mut server = HandshakeStateMachine::acceptor(
//!     LocalHandshake::from_config(&config, HandshakeKind::MessagingEngine),
//! );
//!
//! let request = client.start().unwrap();
//! client.send_complete().unwrap();
//! let reply = server.process_request(&request).unwrap();
//! let negotiated = client.process_reply(&reply).unwrap();
//! assert_eq!(negotiated.version, ProtocolVersion::CURRENT);
//! ```

mod capabilities;
pub mod message;
mod properties;
mod session;
mod transaction;
mod version;

pub use capabilities::{CapabilityMask, NegotiatedCapabilities};
pub use message::{HandshakeField, HandshakeKind, HandshakeRecord, HandshakeReply};
pub use properties::{
    ConnectionMetaData, ConnectionProperties, Direction, Topology, TransportFacts,
    TransportProfile,
};
pub use session::{HandshakeState, HandshakeStateMachine, LocalHandshake, Negotiated, Role};
pub use transaction::{OptimizedTxHeader, TransactionFlags, TransactionFlowCodec};
pub use version::{FapBitmap, ProtocolVersion, SupportedVersionTable};

/// Product id: messaging engine / Java client
pub const PRODUCT_ID_JETSTREAM: u16 = 1;

/// Product id: XMS client
pub const PRODUCT_ID_XMS: u16 = 2;

/// Product id: .NET client
pub const PRODUCT_ID_DOTNET: u16 = 3;
