//! Conversation multiplexing over one physical connection.
//!
//! A [`Multiplexer`] runs the handshake, then carries any number of
//! [`Conversation`]s. Each conversation supports fire-and-forget sends,
//! correlated exchanges, schema requests and a read-ahead consumer.
//!
//! ```text
//! Conversation 1 ──┐                         ┌── Conversation 2
//! Conversation 3 ──┼── Multiplexer ══ wire ══ Multiplexer ──┼── Conversation 4
//!                  │   (odd ids)              (even ids)    │
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use jfap::config::Config;
//! use jfap::mux::{Multiplexer, MultiplexerOptions, Priority};
//! use jfap::protocol::ConnectionProperties;
//!
//! # async fn run(io: tokio::io::DuplexStream) -> jfap::Result<()> {
//! let mux = Multiplexer::connect(
//!     io,
//!     ConnectionProperties::endpoint("localhost", 7276),
//!     MultiplexerOptions::new(Config::default()),
//! )
//! .await?;
//!
//! let conversation = mux.open_conversation(Priority::LOWEST).await?;
//! let reply = conversation.exchange("hello", Priority::new(4)?).await?;
//! println!("{} bytes back", reply.len());
//! # Ok(())
//! # }
//! ```

mod conversation;
mod exchange;
mod multiplexer;
mod priority;
mod schema;
mod stats;

pub use conversation::{Conversation, ConversationState, FailureCallback, Inbound, Request};
pub use exchange::Reply;
pub use multiplexer::{Multiplexer, MultiplexerOptions};
pub use priority::{Priority, SendPriority, CONTROL_TRANSPORT_PRIORITY, PRIORITY_LOWEST_PENDING};
pub use schema::{InMemorySchemas, SchemaProvider};
pub use stats::MultiplexerStats;
