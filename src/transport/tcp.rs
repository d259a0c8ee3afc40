//! TCP transport implementation.
//!
//! One TCP stream per multiplexer. Outbound connections are made from
//! `Endpoint` connection properties; the other variants are resolved by
//! layers above this one.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::error::{JfapError, Result};
use crate::mux::{Multiplexer, MultiplexerOptions};
use crate::protocol::ConnectionProperties;

/// Connect to an `Endpoint` and run the handshake.
///
/// Load-balancer and proxy-bridge properties fail with a usage error.
pub async fn connect(
    properties: ConnectionProperties,
    options: MultiplexerOptions,
) -> Result<Multiplexer> {
    let host = properties.host()?;
    let port = properties.port()?;

    let stream = TcpStream::connect((host, port)).await.map_err(|e| {
        JfapError::lost(format!("Failed to connect TCP to {}:{}: {}", host, port, e))
    })?;
    stream.set_nodelay(true)?;
    tracing::info!("TCP transport connected to {}:{}", host, port);

    Multiplexer::connect(stream, properties, options).await
}

/// Listening TCP transport producing accepted multiplexers.
#[derive(Debug)]
pub struct TcpTransport {
    listener: TcpListener,
    options: MultiplexerOptions,
}

impl TcpTransport {
    /// Bind to `addr`; accepted connections use `options`.
    pub async fn bind(addr: SocketAddr, options: MultiplexerOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| JfapError::Config(format!("Failed to bind TCP to {}: {}", addr, e)))?;
        tracing::info!("TCP transport listening on {}", listener.local_addr()?);
        Ok(Self { listener, options })
    }

    /// Bind to a localhost port (0 picks a free one)
    pub async fn localhost(port: u16, options: MultiplexerOptions) -> Result<Self> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], port)), options).await
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Options applied to accepted connections
    pub fn options(&self) -> &MultiplexerOptions {
        &self.options
    }

    /// Accept the next TCP stream without running the handshake.
    ///
    /// Lets a server hand the handshake to its own task so one slow peer
    /// does not hold up the accept loop.
    pub async fn accept_stream(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::debug!("TCP transport accepted {}", peer);
        Ok((stream, peer))
    }

    /// Accept the next connection and answer its handshake.
    pub async fn accept(&self) -> Result<(Multiplexer, SocketAddr)> {
        let (stream, peer) = self.accept_stream().await?;
        let mux = Multiplexer::accept(stream, self.options.clone()).await?;
        Ok((mux, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mux::Priority;

    fn options() -> MultiplexerOptions {
        MultiplexerOptions::new(Config::default())
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let transport = TcpTransport::localhost(0, options()).await.unwrap();
        let addr = transport.local_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");

        let server = tokio::spawn(async move {
            let (mux, _) = transport.accept().await.unwrap();
            let mut conversation = mux.accept_conversation().await.unwrap();
            if let Some(crate::mux::Inbound::Request(request)) = conversation.recv().await {
                conversation.reply(&request, request.payload.clone()).unwrap();
            }
            // Keep the connection up until the client is done.
            mux.accept_conversation().await;
        });

        let client = connect(
            ConnectionProperties::endpoint("127.0.0.1", addr.port()),
            options(),
        )
        .await
        .unwrap();
        let conversation = client.open_conversation(Priority::LOWEST).await.unwrap();
        let reply = conversation.exchange("ping", Priority::LOWEST).await.unwrap();
        assert_eq!(&reply[..], b"ping");

        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_needs_endpoint() {
        let result = connect(
            ConnectionProperties::LoadBalancer("lb-token".to_string()),
            options(),
        )
        .await;
        assert!(matches!(result, Err(JfapError::Usage(_))));
    }
}
