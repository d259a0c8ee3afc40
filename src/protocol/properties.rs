//! Connection properties, transport facts and connection metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::HandshakeKind;
use crate::error::{JfapError, Result};

/// How to reach the peer. Exactly one variant applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionProperties {
    /// Direct host/port endpoint
    Endpoint {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Opaque token resolved by a workload-management router
    LoadBalancer(String),
    /// Connection relayed through a proxy bridge
    ProxyBridge,
}

impl ConnectionProperties {
    /// Host/port endpoint
    pub fn endpoint(host: impl Into<String>, port: u16) -> Self {
        Self::Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Host of an endpoint
    pub fn host(&self) -> Result<&str> {
        match self {
            Self::Endpoint { host, .. } => Ok(host),
            other => Err(JfapError::Usage(format!(
                "host requested from {} connection properties",
                other.variant_name()
            ))),
        }
    }

    /// Port of an endpoint
    pub fn port(&self) -> Result<u16> {
        match self {
            Self::Endpoint { port, .. } => Ok(*port),
            other => Err(JfapError::Usage(format!(
                "port requested from {} connection properties",
                other.variant_name()
            ))),
        }
    }

    /// Load-balancer token
    pub fn endpoint_token(&self) -> Result<&str> {
        match self {
            Self::LoadBalancer(token) => Ok(token),
            other => Err(JfapError::Usage(format!(
                "load-balancer token requested from {} connection properties",
                other.variant_name()
            ))),
        }
    }

    /// Whether this is a proxy bridge connection
    pub fn is_proxy_bridge(&self) -> bool {
        matches!(self, Self::ProxyBridge)
    }

    fn variant_name(&self) -> &'static str {
        match self {
            Self::Endpoint { .. } => "endpoint",
            Self::LoadBalancer(_) => "load-balancer",
            Self::ProxyBridge => "proxy-bridge",
        }
    }
}

/// Transport chain profile supplied by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportProfile {
    /// Plain TCP
    #[default]
    Plain,
    /// TLS over TCP
    Tls,
    /// HTTP tunnel
    Tunneled,
    /// HTTP tunnel over TLS
    TunneledTls,
}

impl TransportProfile {
    /// Outbound chain name for this profile
    pub fn chain_name(self) -> &'static str {
        match self {
            Self::Plain => "BootstrapBasicMessaging",
            Self::Tls => "BootstrapSecureMessaging",
            Self::Tunneled => "BootstrapTunneledMessaging",
            Self::TunneledTls => "BootstrapTunneledSecureMessaging",
        }
    }

    /// Whether the channel is encrypted
    pub fn is_secure(self) -> bool {
        matches!(self, Self::Tls | Self::TunneledTls)
    }

    /// Whether the channel is tunneled
    pub fn is_tunneled(self) -> bool {
        matches!(self, Self::Tunneled | Self::TunneledTls)
    }
}

impl std::str::FromStr for TransportProfile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plain" | "tcp" => Ok(Self::Plain),
            "tls" | "ssl" => Ok(Self::Tls),
            "tunneled" | "http" => Ok(Self::Tunneled),
            "tunneled-tls" | "https" => Ok(Self::TunneledTls),
            _ => Err(format!("Unknown transport profile: {}", s)),
        }
    }
}

/// Facts about the physical transport, owned by whoever built the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransportFacts {
    /// Chain profile
    pub profile: TransportProfile,
    /// Peer is inside the trust boundary
    pub trusted: bool,
}

impl TransportFacts {
    /// Facts for a given profile
    pub fn new(profile: TransportProfile) -> Self {
        Self {
            profile,
            trusted: false,
        }
    }

    /// Mark the peer as trusted
    pub fn trusted(mut self) -> Self {
        self.trusted = true;
        self
    }
}

/// Opaque topology names flowed in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Topology {
    /// Cell name
    pub cell: Option<String>,
    /// Node name
    pub node: Option<String>,
    /// Server name
    pub server: Option<String>,
    /// Cluster name
    pub cluster: Option<String>,
}

/// Which side opened the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// We connected to the peer
    Outbound,
    /// The peer connected to us
    Inbound,
}

/// Immutable description of an established connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetaData {
    /// Multiplexer identity used in logs
    pub connection_id: Uuid,
    /// Transport chain name
    pub chain_name: String,
    /// Connection direction
    pub direction: Direction,
    /// Encrypted channel
    pub secure: bool,
    /// Tunneled channel
    pub tunneled: bool,
    /// Peer is trusted
    pub trusted: bool,
    /// Negotiated FAP level
    pub fap_level: u16,
    /// Peer kind
    pub peer_kind: HandshakeKind,
    /// Peer product id
    pub peer_product_id: Option<u16>,
    /// Peer product version (major, minor)
    pub peer_product_version: Option<(u16, u16)>,
    /// Peer conversation usage type
    pub peer_usage_type: Option<u8>,
    /// Peer topology names
    pub peer_topology: Topology,
    /// Time the handshake completed
    pub established_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_accessors() {
        let props = ConnectionProperties::endpoint("localhost", 7276);
        assert_eq!(props.host().unwrap(), "localhost");
        assert_eq!(props.port().unwrap(), 7276);
        assert!(matches!(props.endpoint_token(), Err(JfapError::Usage(_))));
    }

    #[test]
    fn test_wrong_variant_is_usage_error() {
        let props = ConnectionProperties::LoadBalancer("wlm:bus1".into());
        assert_eq!(props.endpoint_token().unwrap(), "wlm:bus1");
        assert!(matches!(props.host(), Err(JfapError::Usage(_))));
        assert!(matches!(
            ConnectionProperties::ProxyBridge.port(),
            Err(JfapError::Usage(_))
        ));
    }

    #[test]
    fn test_profile_from_str() {
        assert_eq!("tcp".parse::<TransportProfile>().unwrap(), TransportProfile::Plain);
        assert_eq!("TLS".parse::<TransportProfile>().unwrap(), TransportProfile::Tls);
        assert_eq!(
            "tunneled-tls".parse::<TransportProfile>().unwrap(),
            TransportProfile::TunneledTls
        );
        assert!("quic".parse::<TransportProfile>().is_err());
    }

    #[test]
    fn test_profile_facts() {
        assert_eq!(
            TransportProfile::TunneledTls.chain_name(),
            "BootstrapTunneledSecureMessaging"
        );
        assert!(TransportProfile::Tls.is_secure());
        assert!(!TransportProfile::Tls.is_tunneled());
        assert!(TransportProfile::Tunneled.is_tunneled());
    }
}
