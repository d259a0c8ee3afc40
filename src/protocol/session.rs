//! Handshake state machine.
//!
//! Drives one side of the connection handshake from `Init` to `Ready` or
//! `Failed`. The machine is pure: it produces and consumes encoded records,
//! and the multiplexer moves them across the wire.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::capabilities::{CapabilityMask, NegotiatedCapabilities};
use super::message::{HandshakeKind, HandshakeRecord, HandshakeReply, USAGE_TYPE_JFAP};
use super::properties::Topology;
use super::version::{ProtocolVersion, SupportedVersionTable};
use crate::config::Config;
use crate::error::{JfapError, Result};

/// Handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    /// Nothing sent yet
    Init,
    /// Request encoded, transport has not accepted it yet
    SendingCaps,
    /// Request written, waiting for the correlated reply
    AwaitingPeer,
    /// Peer record received and being checked
    Negotiating,
    /// Connection usable
    Ready,
    /// Close requested
    Closing,
    /// Closed (terminal)
    Closed,
    /// Failed (terminal)
    Failed,
}

impl HandshakeState {
    /// Whether no further operation is permitted
    pub fn is_released(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Which side of the handshake this machine drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the request
    Initiator,
    /// Answers the request
    Acceptor,
}

/// Local handshake values
#[derive(Debug, Clone)]
pub struct LocalHandshake {
    /// Process kind
    pub kind: HandshakeKind,
    /// Versions this side speaks
    pub versions: SupportedVersionTable,
    /// Capability mask before version gating
    pub capabilities: CapabilityMask,
    /// Product id
    pub product_id: u16,
    /// Product version (major, minor)
    pub product_version: (u16, u16),
    /// Largest message accepted
    pub max_message_size: u64,
    /// Largest frame payload accepted
    pub max_transmission_size: u32,
    /// Heartbeat interval, milliseconds (0 = none requested)
    pub heartbeat_interval_ms: u32,
    /// Heartbeat timeout, milliseconds
    pub heartbeat_timeout_ms: u32,
    /// Conversation usage type
    pub usage_type: u8,
    /// Topology names
    pub topology: Topology,
}

impl LocalHandshake {
    /// Build local values from configuration
    pub fn from_config(config: &Config, kind: HandshakeKind) -> Self {
        let mut versions = SupportedVersionTable::legacy();
        if let Some(max) = config.versions.max_fap_level {
            versions = versions.clamp(max);
        }
        Self {
            kind,
            versions,
            capabilities: config.capabilities.local_mask(),
            product_id: config.connection.product_id,
            product_version: config.connection.product_version,
            max_message_size: config.connection.max_message_size,
            max_transmission_size: config.connection.max_transmission_size,
            heartbeat_interval_ms: config.connection.heartbeat_interval_ms,
            heartbeat_timeout_ms: config.connection.heartbeat_timeout_ms,
            usage_type: USAGE_TYPE_JFAP,
            topology: Topology::default(),
        }
    }

    /// Replace the version table
    pub fn with_versions(mut self, versions: SupportedVersionTable) -> Self {
        self.versions = versions;
        self
    }

    /// Replace the capability mask
    pub fn with_capabilities(mut self, capabilities: CapabilityMask) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set topology names
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Set conversation usage type
    pub fn with_usage_type(mut self, usage_type: u8) -> Self {
        self.usage_type = usage_type;
        self
    }

    fn record(&self) -> HandshakeRecord {
        let mut record = HandshakeRecord::new(self.kind);
        record.product_version = Some(self.product_version);
        record.product_id = Some(self.product_id);
        record.max_message_size = Some(self.max_message_size);
        record.max_transmission_size = Some(self.max_transmission_size);
        record.heartbeat_interval_ms = Some(self.heartbeat_interval_ms);
        record.heartbeat_timeout_ms = Some(self.heartbeat_timeout_ms);
        record.capabilities = Some(self.capabilities.bits());
        record.supported_faps = Some(self.versions.to_bitmap());
        record.usage_type = Some(self.usage_type);
        record.topology = self.topology.clone();
        record
    }
}

/// Values agreed by a completed handshake
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Negotiated FAP version
    pub version: ProtocolVersion,
    /// Local and peer capability masks
    pub capabilities: NegotiatedCapabilities,
    /// Heartbeat interval (max of both sides), milliseconds
    pub heartbeat_interval_ms: u32,
    /// Heartbeat timeout (max of both sides), milliseconds
    pub heartbeat_timeout_ms: u32,
    /// Message size limit (min of both sides)
    pub max_message_size: u64,
    /// Frame payload limit (min of both sides)
    pub max_transmission_size: u32,
    /// Peer kind
    pub peer_kind: HandshakeKind,
    /// Peer product id
    pub peer_product_id: Option<u16>,
    /// Peer product version
    pub peer_product_version: Option<(u16, u16)>,
    /// Peer conversation usage type
    pub peer_usage_type: Option<u8>,
    /// Peer topology names
    pub peer_topology: Topology,
}

/// One side of the connection handshake
pub struct HandshakeStateMachine {
    role: Role,
    state: HandshakeState,
    local: LocalHandshake,
    negotiated: Option<Negotiated>,
    error: Option<JfapError>,
}

impl HandshakeStateMachine {
    /// Machine for the side that opens the connection
    pub fn initiator(local: LocalHandshake) -> Self {
        Self::new(Role::Initiator, local)
    }

    /// Machine for the side that accepts the connection
    pub fn acceptor(local: LocalHandshake) -> Self {
        Self::new(Role::Acceptor, local)
    }

    fn new(role: Role, local: LocalHandshake) -> Self {
        Self {
            role,
            state: HandshakeState::Init,
            local,
            negotiated: None,
            error: None,
        }
    }

    /// Current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the handshake completed
    pub fn is_ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    /// Negotiated values, once ready
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Take the error that failed the handshake, if any
    pub fn take_error(&mut self) -> Option<JfapError> {
        self.error.take()
    }

    fn guard(&self, expected: HandshakeState, operation: &str) -> Result<()> {
        if self.state.is_released() {
            return Err(JfapError::AlreadyReleased);
        }
        if self.state != expected {
            return Err(JfapError::InvalidState(format!(
                "Cannot {} in state {:?}",
                operation, self.state
            )));
        }
        Ok(())
    }

    /// `Init -> SendingCaps`: encode the handshake request.
    pub fn start(&mut self) -> Result<Bytes> {
        self.guard(HandshakeState::Init, "start handshake")?;
        if self.role != Role::Initiator {
            return Err(JfapError::InvalidState(
                "acceptor does not send a handshake request".to_string(),
            ));
        }
        let bytes = self.local.record().encode()?;
        self.state = HandshakeState::SendingCaps;
        Ok(bytes)
    }

    /// `SendingCaps -> AwaitingPeer`: the transport accepted the request.
    pub fn send_complete(&mut self) -> Result<()> {
        self.guard(HandshakeState::SendingCaps, "complete handshake send")?;
        self.state = HandshakeState::AwaitingPeer;
        Ok(())
    }

    /// `AwaitingPeer -> Negotiating -> Ready`: process the acceptor's reply.
    ///
    /// Any failure moves the machine to `Failed` and is returned.
    pub fn process_reply(&mut self, reply: &[u8]) -> Result<&Negotiated> {
        self.guard(HandshakeState::AwaitingPeer, "process handshake reply")?;
        self.state = HandshakeState::Negotiating;

        match self.negotiate_reply(reply) {
            Ok(negotiated) => {
                self.state = HandshakeState::Ready;
                Ok(&*self.negotiated.insert(negotiated))
            },
            Err(e) => {
                self.state = HandshakeState::Failed;
                Err(e)
            },
        }
    }

    fn negotiate_reply(&self, reply: &[u8]) -> Result<Negotiated> {
        let record = match HandshakeReply::decode(reply)? {
            HandshakeReply::Accepted(record) => record,
            HandshakeReply::Rejected(reason) => return Err(JfapError::NegotiationRejected(reason)),
        };
        let chosen = record
            .fap_level
            .ok_or_else(|| JfapError::Framing("handshake reply has no FAP level".to_string()))?;
        let version = self.local.versions.verify(ProtocolVersion(chosen))?;
        self.combine(version, &record)
    }

    /// `Init -> Negotiating -> Ready | Failed`: answer a handshake request.
    ///
    /// Always yields the reply to write. When negotiation fails the reply is
    /// a rejection, the machine is `Failed`, and the cause is kept for
    /// [`take_error`](Self::take_error).
    pub fn process_request(&mut self, request: &[u8]) -> Result<Bytes> {
        self.guard(HandshakeState::Init, "process handshake request")?;
        if self.role != Role::Acceptor {
            return Err(JfapError::InvalidState(
                "initiator does not answer handshake requests".to_string(),
            ));
        }
        self.state = HandshakeState::Negotiating;

        let outcome = HandshakeRecord::decode(request).and_then(|record| {
            let bitmap = record.supported_faps.as_ref().ok_or_else(|| {
                JfapError::Framing("handshake request has no supported FAP bitmap".to_string())
            })?;
            let version = self.local.versions.negotiate(bitmap)?;
            self.combine(version, &record)
        });

        match outcome {
            Ok(negotiated) => {
                let mut record = self.local.record();
                record.fap_level = Some(negotiated.version.0);
                record.capabilities = Some(negotiated.capabilities.local.bits());
                let reply = HandshakeReply::Accepted(record).encode()?;
                self.negotiated = Some(negotiated);
                self.state = HandshakeState::Ready;
                Ok(reply)
            },
            Err(e) => {
                let reply = HandshakeReply::Rejected(e.to_string()).encode()?;
                self.state = HandshakeState::Failed;
                self.error = Some(e);
                Ok(reply)
            },
        }
    }

    fn combine(&self, version: ProtocolVersion, peer: &HandshakeRecord) -> Result<Negotiated> {
        let peer_caps = peer
            .capabilities
            .ok_or_else(|| JfapError::Framing("handshake record has no capabilities".to_string()))?;
        let capabilities =
            NegotiatedCapabilities::negotiate(self.local.capabilities, peer_caps, version)?;

        let pick_max = |local: u32, peer: Option<u32>| peer.map_or(local, |p| p.max(local));
        let pick_min_u32 = |local: u32, peer: Option<u32>| match peer {
            Some(p) if p > 0 => p.min(local),
            _ => local,
        };

        Ok(Negotiated {
            version,
            capabilities,
            heartbeat_interval_ms: pick_max(
                self.local.heartbeat_interval_ms,
                peer.heartbeat_interval_ms,
            ),
            heartbeat_timeout_ms: pick_max(
                self.local.heartbeat_timeout_ms,
                peer.heartbeat_timeout_ms,
            ),
            max_message_size: peer
                .max_message_size
                .filter(|p| *p > 0)
                .map_or(self.local.max_message_size, |p| {
                    p.min(self.local.max_message_size)
                }),
            max_transmission_size: pick_min_u32(
                self.local.max_transmission_size,
                peer.max_transmission_size,
            ),
            peer_kind: peer.kind,
            peer_product_id: peer.product_id,
            peer_product_version: peer.product_version,
            peer_usage_type: peer.usage_type,
            peer_topology: peer.topology.clone(),
        })
    }

    /// Move to `Failed` from any non-terminal state.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn fail(&mut self) -> bool {
        if self.state.is_released() {
            return false;
        }
        self.state = HandshakeState::Failed;
        true
    }

    /// `Ready -> Closing`
    pub fn begin_close(&mut self) -> Result<()> {
        self.guard(HandshakeState::Ready, "close")?;
        self.state = HandshakeState::Closing;
        Ok(())
    }

    /// `Closing -> Closed`
    pub fn close_complete(&mut self) -> Result<()> {
        self.guard(HandshakeState::Closing, "complete close")?;
        self.state = HandshakeState::Closed;
        Ok(())
    }
}

impl fmt::Debug for HandshakeStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeStateMachine")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("version", &self.negotiated.as_ref().map(|n| n.version))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::version::FapBitmap;

    fn local(kind: HandshakeKind, versions: SupportedVersionTable) -> LocalHandshake {
        LocalHandshake::from_config(&Config::default(), kind).with_versions(versions)
    }

    fn handshake(
        client: SupportedVersionTable,
        server: SupportedVersionTable,
    ) -> (HandshakeStateMachine, HandshakeStateMachine, Result<ProtocolVersion>) {
        let mut c = HandshakeStateMachine::initiator(local(HandshakeKind::Client, client));
        let mut s =
            HandshakeStateMachine::acceptor(local(HandshakeKind::MessagingEngine, server));

        let request = c.start().unwrap();
        assert_eq!(c.state(), HandshakeState::SendingCaps);
        c.send_complete().unwrap();
        assert_eq!(c.state(), HandshakeState::AwaitingPeer);

        let reply = s.process_request(&request).unwrap();
        let result = c.process_reply(&reply).map(|n| n.version);
        (c, s, result)
    }

    #[test]
    fn test_handshake_negotiates_highest() {
        let (c, s, result) = handshake(
            SupportedVersionTable::legacy(),
            SupportedVersionTable::all_supported(20),
        );
        assert_eq!(result.unwrap(), ProtocolVersion(20));
        assert!(c.is_ready());
        assert!(s.is_ready());
        assert_eq!(s.negotiated().unwrap().peer_kind, HandshakeKind::Client);
        assert_eq!(
            c.negotiated().unwrap().peer_kind,
            HandshakeKind::MessagingEngine
        );
    }

    #[test]
    fn test_handshake_skips_reserved_ordinals() {
        // Client drops 20; server would happily speak 16..=19 but the
        // client reserves them, so 15 is chosen.
        let mut client = SupportedVersionTable::legacy();
        client.set(20, false);
        let (c, _, result) = handshake(client, SupportedVersionTable::all_supported(20));
        assert_eq!(result.unwrap(), ProtocolVersion(15));
        assert!(c.is_ready());
    }

    #[test]
    fn test_handshake_rejected_without_common_version() {
        let (mut c, mut s, result) = handshake(
            SupportedVersionTable::from_ordinals([1, 2]),
            SupportedVersionTable::from_ordinals([5, 6]),
        );
        assert!(matches!(result, Err(JfapError::NegotiationRejected(_))));
        assert_eq!(c.state(), HandshakeState::Failed);
        assert_eq!(s.state(), HandshakeState::Failed);
        assert!(matches!(
            s.take_error(),
            Some(JfapError::NoCompatibleVersion(_))
        ));
        assert!(matches!(c.begin_close(), Err(JfapError::AlreadyReleased)));
    }

    #[test]
    fn test_initiator_verifies_chosen_version() {
        let mut c = HandshakeStateMachine::initiator(local(
            HandshakeKind::Client,
            SupportedVersionTable::legacy(),
        ));
        c.start().unwrap();
        c.send_complete().unwrap();

        let mut record = HandshakeRecord::new(HandshakeKind::MessagingEngine);
        record.fap_level = Some(19);
        record.capabilities = Some(CapabilityMask::DEFAULT.bits());
        let reply = HandshakeReply::Accepted(record).encode().unwrap();

        assert!(matches!(
            c.process_reply(&reply),
            Err(JfapError::NoCompatibleVersion(_))
        ));
        assert_eq!(c.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_reserved_capability_bits_fail_handshake() {
        let mut s = HandshakeStateMachine::acceptor(local(
            HandshakeKind::MessagingEngine,
            SupportedVersionTable::legacy(),
        ));
        let mut record = HandshakeRecord::new(HandshakeKind::Client);
        record.supported_faps = Some(FapBitmap::from_ordinals([20]));
        record.capabilities = Some(0x0100);

        let reply = s.process_request(&record.encode().unwrap()).unwrap();
        assert!(matches!(
            HandshakeReply::decode(&reply).unwrap(),
            HandshakeReply::Rejected(_)
        ));
        assert!(matches!(
            s.take_error(),
            Some(JfapError::MalformedCapabilities(0x0100))
        ));
    }

    #[test]
    fn test_heartbeat_negotiated_upwards() {
        let mut client_cfg = Config::default();
        client_cfg.connection.heartbeat_interval_ms = 1000;
        client_cfg.connection.heartbeat_timeout_ms = 9000;
        let mut c = HandshakeStateMachine::initiator(LocalHandshake::from_config(
            &client_cfg,
            HandshakeKind::Client,
        ));
        let mut s = HandshakeStateMachine::acceptor(LocalHandshake::from_config(
            &Config::default(),
            HandshakeKind::MessagingEngine,
        ));

        let request = c.start().unwrap();
        c.send_complete().unwrap();
        let reply = s.process_request(&request).unwrap();
        let negotiated = c.process_reply(&reply).unwrap();
        assert_eq!(negotiated.heartbeat_interval_ms, 5000);
        assert_eq!(negotiated.heartbeat_timeout_ms, 9000);
    }

    #[test]
    fn test_close_lifecycle() {
        let (mut c, _, result) = handshake(
            SupportedVersionTable::legacy(),
            SupportedVersionTable::legacy(),
        );
        result.unwrap();
        c.begin_close().unwrap();
        assert!(matches!(c.begin_close(), Err(JfapError::InvalidState(_))));
        c.close_complete().unwrap();
        assert_eq!(c.state(), HandshakeState::Closed);
        assert!(!c.fail());
        assert!(matches!(c.close_complete(), Err(JfapError::AlreadyReleased)));
    }

    #[test]
    fn test_out_of_order_calls() {
        let mut c = HandshakeStateMachine::initiator(local(
            HandshakeKind::Client,
            SupportedVersionTable::legacy(),
        ));
        assert!(matches!(c.send_complete(), Err(JfapError::InvalidState(_))));
        assert!(matches!(c.process_reply(&[0]), Err(JfapError::InvalidState(_))));
        assert!(c.fail());
        assert!(matches!(c.start(), Err(JfapError::AlreadyReleased)));
    }
}
