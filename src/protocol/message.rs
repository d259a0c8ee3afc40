//! Handshake record wire format.
//!
//! A handshake record is a kind byte followed by any number of
//! `(field id: u16, length: u16, value)` entries. Field order is
//! insignificant; each id may appear at most once.
//!
//! ```text
//! +------+----------+--------+---------+----------+--------+---------+--
//! | kind | field id | length |  value  | field id | length |  value  | ...
//! |  u8  |   u16    |  u16   | len B   |   u16    |  u16   | len B   |
//! +------+----------+--------+---------+----------+--------+---------+--
//! ```
//!
//! The acceptor's reply is prefixed with a status byte: `0x00` followed by
//! its own record, or `0x01` followed by a UTF-8 rejection reason.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::properties::Topology;
use super::version::FapBitmap;
use crate::error::{JfapError, Result};

/// Handshake field ids.
pub mod field {
    /// Product version (u16 major, u16 minor)
    pub const PRODUCT_VERSION: u16 = 0x0001;
    /// Chosen FAP level (u16)
    pub const FAP_LEVEL: u16 = 0x0002;
    /// Maximum message size (u64)
    pub const MAX_MESSAGE_SIZE: u16 = 0x0003;
    /// Maximum transmission size (u32)
    pub const MAX_TRANSMISSION_SIZE: u16 = 0x0004;
    /// Heartbeat interval in milliseconds (u32)
    pub const HEARTBEAT_INTERVAL: u16 = 0x0005;
    /// Capability word (u16)
    pub const CAPABILITIES: u16 = 0x0007;
    /// Product id (u16)
    pub const PRODUCT_ID: u16 = 0x000B;
    /// Supported FAP bitmap (variable)
    pub const SUPPORTED_FAPS: u16 = 0x000C;
    /// Heartbeat timeout in milliseconds (u32)
    pub const HEARTBEAT_TIMEOUT: u16 = 0x000D;
    /// Conversation usage type (u8)
    pub const CONVERSATION_USAGE_TYPE: u16 = 0x000E;
    /// Cell name (UTF-8)
    pub const CELL_NAME: u16 = 0x000F;
    /// Node name (UTF-8)
    pub const NODE_NAME: u16 = 0x0010;
    /// Server name (UTF-8)
    pub const SERVER_NAME: u16 = 0x0011;
    /// Cluster name (UTF-8)
    pub const CLUSTER_NAME: u16 = 0x0012;
}

/// Which kind of process sent a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HandshakeKind {
    /// Client application
    #[default]
    Client = 0x01,
    /// Messaging engine
    MessagingEngine = 0x02,
}

impl HandshakeKind {
    /// Decode the kind byte
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x01 => Ok(Self::Client),
            0x02 => Ok(Self::MessagingEngine),
            other => Err(JfapError::Framing(format!(
                "unknown handshake kind 0x{other:02x}"
            ))),
        }
    }
}

/// Conversation usage type: plain comms conversation
pub const USAGE_TYPE_JFAP: u8 = 0;
/// Conversation usage type: JMS client conversation
pub const USAGE_TYPE_JMS: u8 = 1;

/// One typed handshake field.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum HandshakeField {
    ProductVersion { major: u16, minor: u16 },
    FapLevel(u16),
    MaxMessageSize(u64),
    MaxTransmissionSize(u32),
    HeartbeatInterval(u32),
    HeartbeatTimeout(u32),
    Capabilities(u16),
    ProductId(u16),
    SupportedFaps(FapBitmap),
    ConversationUsageType(u8),
    CellName(String),
    NodeName(String),
    ServerName(String),
    ClusterName(String),
}

impl HandshakeField {
    /// Wire id of this field
    pub fn id(&self) -> u16 {
        match self {
            Self::ProductVersion { .. } => field::PRODUCT_VERSION,
            Self::FapLevel(_) => field::FAP_LEVEL,
            Self::MaxMessageSize(_) => field::MAX_MESSAGE_SIZE,
            Self::MaxTransmissionSize(_) => field::MAX_TRANSMISSION_SIZE,
            Self::HeartbeatInterval(_) => field::HEARTBEAT_INTERVAL,
            Self::HeartbeatTimeout(_) => field::HEARTBEAT_TIMEOUT,
            Self::Capabilities(_) => field::CAPABILITIES,
            Self::ProductId(_) => field::PRODUCT_ID,
            Self::SupportedFaps(_) => field::SUPPORTED_FAPS,
            Self::ConversationUsageType(_) => field::CONVERSATION_USAGE_TYPE,
            Self::CellName(_) => field::CELL_NAME,
            Self::NodeName(_) => field::NODE_NAME,
            Self::ServerName(_) => field::SERVER_NAME,
            Self::ClusterName(_) => field::CLUSTER_NAME,
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let mut value = BytesMut::new();
        match self {
            Self::ProductVersion { major, minor } => {
                value.put_u16(*major);
                value.put_u16(*minor);
            },
            Self::FapLevel(v) | Self::Capabilities(v) | Self::ProductId(v) => value.put_u16(*v),
            Self::MaxMessageSize(v) => value.put_u64(*v),
            Self::MaxTransmissionSize(v) | Self::HeartbeatInterval(v) | Self::HeartbeatTimeout(v) => {
                value.put_u32(*v)
            },
            Self::SupportedFaps(bitmap) => value.put_slice(bitmap.as_bytes()),
            Self::ConversationUsageType(v) => value.put_u8(*v),
            Self::CellName(s) | Self::NodeName(s) | Self::ServerName(s) | Self::ClusterName(s) => {
                value.put_slice(s.as_bytes())
            },
        }

        let len = u16::try_from(value.len()).map_err(|_| {
            JfapError::Usage(format!(
                "handshake field 0x{:04x} value of {} bytes is too long",
                self.id(),
                value.len()
            ))
        })?;
        buf.put_u16(self.id());
        buf.put_u16(len);
        buf.put_slice(&value);
        Ok(())
    }

    fn decode(id: u16, mut value: &[u8]) -> Result<Self> {
        fn width(id: u16, value: &[u8], expected: usize) -> Result<()> {
            if value.len() != expected {
                return Err(JfapError::Framing(format!(
                    "handshake field 0x{id:04x} has length {}, expected {expected}",
                    value.len()
                )));
            }
            Ok(())
        }
        fn text(id: u16, value: &[u8]) -> Result<String> {
            String::from_utf8(value.to_vec()).map_err(|_| {
                JfapError::Framing(format!("handshake field 0x{id:04x} is not UTF-8"))
            })
        }

        let decoded = match id {
            field::PRODUCT_VERSION => {
                width(id, value, 4)?;
                Self::ProductVersion {
                    major: value.get_u16(),
                    minor: value.get_u16(),
                }
            },
            field::FAP_LEVEL => {
                width(id, value, 2)?;
                Self::FapLevel(value.get_u16())
            },
            field::MAX_MESSAGE_SIZE => {
                width(id, value, 8)?;
                Self::MaxMessageSize(value.get_u64())
            },
            field::MAX_TRANSMISSION_SIZE => {
                width(id, value, 4)?;
                Self::MaxTransmissionSize(value.get_u32())
            },
            field::HEARTBEAT_INTERVAL => {
                width(id, value, 4)?;
                Self::HeartbeatInterval(value.get_u32())
            },
            field::HEARTBEAT_TIMEOUT => {
                width(id, value, 4)?;
                Self::HeartbeatTimeout(value.get_u32())
            },
            field::CAPABILITIES => {
                width(id, value, 2)?;
                Self::Capabilities(value.get_u16())
            },
            field::PRODUCT_ID => {
                width(id, value, 2)?;
                Self::ProductId(value.get_u16())
            },
            field::SUPPORTED_FAPS => {
                Self::SupportedFaps(FapBitmap::from_bytes(Bytes::copy_from_slice(value))?)
            },
            field::CONVERSATION_USAGE_TYPE => {
                width(id, value, 1)?;
                Self::ConversationUsageType(value.get_u8())
            },
            field::CELL_NAME => Self::CellName(text(id, value)?),
            field::NODE_NAME => Self::NodeName(text(id, value)?),
            field::SERVER_NAME => Self::ServerName(text(id, value)?),
            field::CLUSTER_NAME => Self::ClusterName(text(id, value)?),
            unknown => return Err(JfapError::UnknownField(unknown)),
        };
        Ok(decoded)
    }
}

/// Decoded handshake record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRecord {
    /// Sender kind
    pub kind: HandshakeKind,
    /// Product version (major, minor)
    pub product_version: Option<(u16, u16)>,
    /// FAP level chosen by the acceptor
    pub fap_level: Option<u16>,
    /// Largest message the sender accepts
    pub max_message_size: Option<u64>,
    /// Largest frame payload the sender accepts
    pub max_transmission_size: Option<u32>,
    /// Heartbeat interval, milliseconds
    pub heartbeat_interval_ms: Option<u32>,
    /// Heartbeat timeout, milliseconds
    pub heartbeat_timeout_ms: Option<u32>,
    /// Raw capability word, validated during negotiation
    pub capabilities: Option<u16>,
    /// Product id
    pub product_id: Option<u16>,
    /// Supported FAP bitmap
    pub supported_faps: Option<FapBitmap>,
    /// Conversation usage type
    pub usage_type: Option<u8>,
    /// Topology names
    pub topology: Topology,
}

impl HandshakeRecord {
    /// Empty record of the given kind
    pub fn new(kind: HandshakeKind) -> Self {
        Self {
            kind,
            product_version: None,
            fap_level: None,
            max_message_size: None,
            max_transmission_size: None,
            heartbeat_interval_ms: None,
            heartbeat_timeout_ms: None,
            capabilities: None,
            product_id: None,
            supported_faps: None,
            usage_type: None,
            topology: Topology::default(),
        }
    }

    /// Present fields in id order
    pub fn fields(&self) -> Vec<HandshakeField> {
        let mut fields = Vec::new();
        if let Some((major, minor)) = self.product_version {
            fields.push(HandshakeField::ProductVersion { major, minor });
        }
        if let Some(v) = self.fap_level {
            fields.push(HandshakeField::FapLevel(v));
        }
        if let Some(v) = self.max_message_size {
            fields.push(HandshakeField::MaxMessageSize(v));
        }
        if let Some(v) = self.max_transmission_size {
            fields.push(HandshakeField::MaxTransmissionSize(v));
        }
        if let Some(v) = self.heartbeat_interval_ms {
            fields.push(HandshakeField::HeartbeatInterval(v));
        }
        if let Some(v) = self.capabilities {
            fields.push(HandshakeField::Capabilities(v));
        }
        if let Some(v) = self.product_id {
            fields.push(HandshakeField::ProductId(v));
        }
        if let Some(v) = &self.supported_faps {
            fields.push(HandshakeField::SupportedFaps(v.clone()));
        }
        if let Some(v) = self.heartbeat_timeout_ms {
            fields.push(HandshakeField::HeartbeatTimeout(v));
        }
        if let Some(v) = self.usage_type {
            fields.push(HandshakeField::ConversationUsageType(v));
        }
        if let Some(v) = &self.topology.cell {
            fields.push(HandshakeField::CellName(v.clone()));
        }
        if let Some(v) = &self.topology.node {
            fields.push(HandshakeField::NodeName(v.clone()));
        }
        if let Some(v) = &self.topology.server {
            fields.push(HandshakeField::ServerName(v.clone()));
        }
        if let Some(v) = &self.topology.cluster {
            fields.push(HandshakeField::ClusterName(v.clone()));
        }
        fields
    }

    /// Encode the record
    pub fn encode(&self) -> Result<Bytes> {
        encode_fields(self.kind, &self.fields())
    }

    /// Decode a record
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(JfapError::Framing("empty handshake record".to_string()));
        }
        let mut record = Self::new(HandshakeKind::from_byte(buf.get_u8())?);
        let mut seen = Vec::new();

        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(JfapError::Framing(format!(
                    "truncated handshake field header ({} trailing bytes)",
                    buf.remaining()
                )));
            }
            let id = buf.get_u16();
            let len = usize::from(buf.get_u16());
            if buf.remaining() < len {
                return Err(JfapError::Framing(format!(
                    "handshake field 0x{id:04x} claims {len} bytes, {} remain",
                    buf.remaining()
                )));
            }
            if seen.contains(&id) {
                return Err(JfapError::Framing(format!(
                    "duplicate handshake field 0x{id:04x}"
                )));
            }
            seen.push(id);

            let (value, rest) = buf.split_at(len);
            record.apply(HandshakeField::decode(id, value)?);
            buf = rest;
        }

        Ok(record)
    }

    fn apply(&mut self, field: HandshakeField) {
        match field {
            HandshakeField::ProductVersion { major, minor } => {
                self.product_version = Some((major, minor))
            },
            HandshakeField::FapLevel(v) => self.fap_level = Some(v),
            HandshakeField::MaxMessageSize(v) => self.max_message_size = Some(v),
            HandshakeField::MaxTransmissionSize(v) => self.max_transmission_size = Some(v),
            HandshakeField::HeartbeatInterval(v) => self.heartbeat_interval_ms = Some(v),
            HandshakeField::HeartbeatTimeout(v) => self.heartbeat_timeout_ms = Some(v),
            HandshakeField::Capabilities(v) => self.capabilities = Some(v),
            HandshakeField::ProductId(v) => self.product_id = Some(v),
            HandshakeField::SupportedFaps(v) => self.supported_faps = Some(v),
            HandshakeField::ConversationUsageType(v) => self.usage_type = Some(v),
            HandshakeField::CellName(v) => self.topology.cell = Some(v),
            HandshakeField::NodeName(v) => self.topology.node = Some(v),
            HandshakeField::ServerName(v) => self.topology.server = Some(v),
            HandshakeField::ClusterName(v) => self.topology.cluster = Some(v),
        }
    }
}

/// Encode an arbitrary ordered field list.
pub fn encode_fields(kind: HandshakeKind, fields: &[HandshakeField]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(kind as u8);
    for f in fields {
        f.encode_into(&mut buf)?;
    }
    Ok(buf.freeze())
}

const REPLY_ACCEPTED: u8 = 0x00;
const REPLY_REJECTED: u8 = 0x01;

/// Acceptor's answer to a handshake request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    /// Handshake accepted; the record carries the chosen FAP level
    Accepted(HandshakeRecord),
    /// Handshake refused
    Rejected(String),
}

impl HandshakeReply {
    /// Encode the reply
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Self::Accepted(record) => {
                buf.put_u8(REPLY_ACCEPTED);
                buf.put_slice(&record.encode()?);
            },
            Self::Rejected(reason) => {
                buf.put_u8(REPLY_REJECTED);
                buf.put_slice(reason.as_bytes());
            },
        }
        Ok(buf.freeze())
    }

    /// Decode a reply
    pub fn decode(buf: &[u8]) -> Result<Self> {
        match buf.split_first() {
            Some((&REPLY_ACCEPTED, rest)) => Ok(Self::Accepted(HandshakeRecord::decode(rest)?)),
            Some((&REPLY_REJECTED, rest)) => {
                Ok(Self::Rejected(String::from_utf8_lossy(rest).into_owned()))
            },
            Some((other, _)) => Err(JfapError::Framing(format!(
                "unknown handshake reply status 0x{other:02x}"
            ))),
            None => Err(JfapError::Framing("empty handshake reply".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HandshakeRecord {
        let mut record = HandshakeRecord::new(HandshakeKind::Client);
        record.product_version = Some((9, 0));
        record.max_message_size = Some(100 * 1024 * 1024);
        record.max_transmission_size = Some(65536);
        record.heartbeat_interval_ms = Some(5000);
        record.heartbeat_timeout_ms = Some(7000);
        record.capabilities = Some(0x0047);
        record.product_id = Some(1);
        record.supported_faps = Some(FapBitmap::from_ordinals([1, 2, 3, 20]));
        record.usage_type = Some(USAGE_TYPE_JMS);
        record.topology.cell = Some("cell01".into());
        record.topology.cluster = Some("cluster-a".into());
        record
    }

    #[test]
    fn test_record_roundtrip() {
        let record = sample();
        let bytes = record.encode().unwrap();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(HandshakeRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_field_order_irrelevant() {
        let record = sample();
        let mut fields = record.fields();
        fields.reverse();
        let bytes = encode_fields(HandshakeKind::Client, &fields).unwrap();
        assert_eq!(HandshakeRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let bytes = [0x01, 0x00, 0x42, 0x00, 0x01, 0xFF];
        assert!(matches!(
            HandshakeRecord::decode(&bytes),
            Err(JfapError::UnknownField(0x0042))
        ));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let fields = [HandshakeField::FapLevel(3), HandshakeField::FapLevel(4)];
        let bytes = encode_fields(HandshakeKind::Client, &fields).unwrap();
        assert!(matches!(
            HandshakeRecord::decode(&bytes),
            Err(JfapError::Framing(_))
        ));
    }

    #[test]
    fn test_wrong_width_rejected() {
        // Capabilities carried in 3 bytes instead of 2.
        let bytes = [0x02, 0x00, 0x07, 0x00, 0x03, 0x00, 0x00, 0x47];
        assert!(matches!(
            HandshakeRecord::decode(&bytes),
            Err(JfapError::Framing(_))
        ));
    }

    #[test]
    fn test_truncated_value_rejected() {
        let bytes = [0x01, 0x00, 0x02, 0x00, 0x02, 0x00];
        assert!(matches!(
            HandshakeRecord::decode(&bytes),
            Err(JfapError::Framing(_))
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(HandshakeRecord::decode(&[0x07]).is_err());
    }

    #[test]
    fn test_reply_roundtrip() {
        let accepted = HandshakeReply::Accepted(sample());
        let bytes = accepted.encode().unwrap();
        assert_eq!(HandshakeReply::decode(&bytes).unwrap(), accepted);

        let rejected = HandshakeReply::Rejected("no compatible FAP".into());
        let bytes = rejected.encode().unwrap();
        assert_eq!(HandshakeReply::decode(&bytes).unwrap(), rejected);
    }
}
