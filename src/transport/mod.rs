//! Physical transports for JFAP multiplexers.
//!
//! The multiplexer runs over any `AsyncRead + AsyncWrite` stream. This module
//! provides the plain TCP backend used by the `jfap` binary:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │     Multiplexer (transport-agnostic)     │
//! └────────────────────┬─────────────────────┘
//!                      │ AsyncRead + AsyncWrite
//!          ┌───────────┴───────────┐
//!          ▼                       ▼
//! ┌─────────────────┐   ┌─────────────────────┐
//! │  TcpTransport   │   │  duplex / TLS / ... │
//! │  tcp::connect   │   │  (caller supplied)  │
//! └─────────────────┘   └─────────────────────┘
//! ```
//!
//! TLS and tunneling are not implemented here; a caller that wraps the
//! stream reports them through [`TransportFacts`](crate::protocol::TransportFacts).

mod tcp;

pub use tcp::{connect, TcpTransport};
