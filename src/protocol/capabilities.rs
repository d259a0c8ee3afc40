//! Connection capabilities for handshake negotiation.
//!
//! Capabilities are a 16-bit word flowed in the handshake. The low seven bits
//! are defined; the top nine are reserved and must be zero on receipt.
//!
//! | Bit    | Constant                      | Meaning                          |
//! |--------|-------------------------------|----------------------------------|
//! | `0x01` | `SUPPORTS_TRANSACTIONS`       | transacted operations supported  |
//! | `0x02` | `SUPPORTS_RELIABLE`           | reliable messages supported      |
//! | `0x04` | `SUPPORTS_ASSURED`            | assured messages supported       |
//! | `0x08` | `REQUIRES_NONJAVA_BOOTSTRAP`  | peer must bootstrap without Java |
//! | `0x10` | `REQUIRES_JMS_MESSAGES`       | only JMS messages may be sent    |
//! | `0x20` | `REQUIRES_JMF_ENCODING`       | only JMF encoding may be sent    |
//! | `0x40` | `REQUIRES_OPTIMIZED_TX`       | optimized transaction flows      |
//!
//! Each side keeps its own effective mask and records the peer's advertised
//! mask; neither side has to agree with the other's word.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::version::ProtocolVersion;
use crate::config::CapabilityConfig;
use crate::error::{JfapError, Result};

/// 16-bit capability flag set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CapabilityMask(u16);

impl CapabilityMask {
    /// Transacted operations supported
    pub const SUPPORTS_TRANSACTIONS: Self = Self(0x0001);
    /// Reliable messages supported
    pub const SUPPORTS_RELIABLE: Self = Self(0x0002);
    /// Assured messages supported
    pub const SUPPORTS_ASSURED: Self = Self(0x0004);
    /// Peer must bootstrap without Java-only facilities
    pub const REQUIRES_NONJAVA_BOOTSTRAP: Self = Self(0x0008);
    /// Only JMS messages may be sent
    pub const REQUIRES_JMS_MESSAGES: Self = Self(0x0010);
    /// Only JMF-encoded messages may be sent
    pub const REQUIRES_JMF_ENCODING: Self = Self(0x0020);
    /// Optimized transaction flows
    pub const REQUIRES_OPTIMIZED_TX: Self = Self(0x0040);

    /// Reserved bits (must be zero)
    pub const RESERVED: u16 = 0xFF80;

    /// No capabilities
    pub const NONE: Self = Self(0);

    /// Default advertised mask
    pub const DEFAULT: Self = Self(0x0001 | 0x0002 | 0x0004 | 0x0040);

    /// Validate a word received from the peer.
    pub fn from_wire(bits: u16) -> Result<Self> {
        if bits & Self::RESERVED != 0 {
            return Err(JfapError::MalformedCapabilities(bits));
        }
        Ok(Self(bits))
    }

    /// Raw bits
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Check whether every bit of `other` is set
    pub fn has(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`
    pub fn set(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`
    pub fn clear(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Copy with `other` set
    pub fn with(mut self, other: Self) -> Self {
        self.set(other);
        self
    }

    /// Copy with `other` cleared
    pub fn without(mut self, other: Self) -> Self {
        self.clear(other);
        self
    }

    /// Apply local configuration: requirement bits are added, and bits the
    /// configuration rules out are masked away.
    pub fn with_overrides(self, config: &CapabilityConfig) -> Self {
        let mut required = Self::NONE;
        let mut allowed = Self(!Self::RESERVED);

        if config.non_java_bootstrap {
            required.set(Self::REQUIRES_NONJAVA_BOOTSTRAP);
            // Optimized transaction flows need the Java client stack.
            allowed.clear(Self::REQUIRES_OPTIMIZED_TX);
        }
        if config.jms_messages_only {
            required.set(Self::REQUIRES_JMS_MESSAGES);
        }
        if config.jmf_encoding_only {
            required.set(Self::REQUIRES_JMF_ENCODING);
        }
        if config.disable_optimized_tx {
            allowed.clear(Self::REQUIRES_OPTIMIZED_TX);
        }

        Self((self.0 | required.0) & allowed.0)
    }
}

impl fmt::Debug for CapabilityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityMask(0x{:04x})", self.0)
    }
}

/// Outcome of capability negotiation for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedCapabilities {
    /// This side's effective mask, gated by the negotiated version
    pub local: CapabilityMask,
    /// Mask the peer advertised
    pub peer: CapabilityMask,
    /// Optimized transaction flows may be used
    pub optimized_tx: bool,
}

impl NegotiatedCapabilities {
    /// Combine the local mask with the peer's advertised word.
    ///
    /// Fails with `MalformedCapabilities` if the peer set a reserved bit.
    pub fn negotiate(
        local: CapabilityMask,
        peer_bits: u16,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let peer = CapabilityMask::from_wire(peer_bits)?;

        let mut local = CapabilityMask(local.0 & !CapabilityMask::RESERVED);
        if version < ProtocolVersion::OPTIMIZED_TX {
            local.clear(CapabilityMask::REQUIRES_OPTIMIZED_TX);
        }

        let optimized_tx = local.has(CapabilityMask::REQUIRES_OPTIMIZED_TX)
            && peer.has(CapabilityMask::REQUIRES_OPTIMIZED_TX);

        Ok(Self {
            local,
            peer,
            optimized_tx,
        })
    }

    /// Peer only accepts JMS messages
    pub fn peer_requires_jms_messages(&self) -> bool {
        self.peer.has(CapabilityMask::REQUIRES_JMS_MESSAGES)
    }

    /// Peer only accepts JMF-encoded messages
    pub fn peer_requires_jmf_encoding(&self) -> bool {
        self.peer.has(CapabilityMask::REQUIRES_JMF_ENCODING)
    }

    /// Peer bootstraps without Java
    pub fn peer_is_non_java(&self) -> bool {
        self.peer.has(CapabilityMask::REQUIRES_NONJAVA_BOOTSTRAP)
    }

    /// Both sides support transactions
    pub fn transactions(&self) -> bool {
        self.local.has(CapabilityMask::SUPPORTS_TRANSACTIONS)
            && self.peer.has(CapabilityMask::SUPPORTS_TRANSACTIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mask() {
        assert_eq!(CapabilityMask::DEFAULT.bits(), 0x0047);
        assert!(CapabilityMask::DEFAULT.has(CapabilityMask::REQUIRES_OPTIMIZED_TX));
        assert!(!CapabilityMask::DEFAULT.has(CapabilityMask::REQUIRES_JMS_MESSAGES));
    }

    #[test]
    fn test_reserved_bits_rejected() {
        assert!(CapabilityMask::from_wire(0x007F).is_ok());
        for bit in 7..16 {
            let bits = 1u16 << bit;
            assert!(matches!(
                CapabilityMask::from_wire(bits),
                Err(JfapError::MalformedCapabilities(b)) if b == bits
            ));
        }
    }

    #[test]
    fn test_overrides() {
        let config = CapabilityConfig {
            non_java_bootstrap: true,
            ..Default::default()
        };
        let mask = CapabilityMask::DEFAULT.with_overrides(&config);
        assert!(mask.has(CapabilityMask::REQUIRES_NONJAVA_BOOTSTRAP));
        assert!(!mask.has(CapabilityMask::REQUIRES_OPTIMIZED_TX));

        let config = CapabilityConfig {
            jms_messages_only: true,
            disable_optimized_tx: true,
            ..Default::default()
        };
        let mask = CapabilityMask::DEFAULT.with_overrides(&config);
        assert_eq!(mask.bits(), 0x0017);
    }

    #[test]
    fn test_optimized_tx_gated_by_version() {
        let old = NegotiatedCapabilities::negotiate(
            CapabilityMask::DEFAULT,
            CapabilityMask::DEFAULT.bits(),
            ProtocolVersion(3),
        )
        .unwrap();
        assert!(!old.local.has(CapabilityMask::REQUIRES_OPTIMIZED_TX));
        assert!(!old.optimized_tx);

        let new = NegotiatedCapabilities::negotiate(
            CapabilityMask::DEFAULT,
            CapabilityMask::DEFAULT.bits(),
            ProtocolVersion(4),
        )
        .unwrap();
        assert!(new.optimized_tx);
    }

    #[test]
    fn test_optimized_tx_needs_both_sides() {
        let peer = CapabilityMask::DEFAULT.without(CapabilityMask::REQUIRES_OPTIMIZED_TX);
        let caps = NegotiatedCapabilities::negotiate(
            CapabilityMask::DEFAULT,
            peer.bits(),
            ProtocolVersion::CURRENT,
        )
        .unwrap();
        assert!(caps.local.has(CapabilityMask::REQUIRES_OPTIMIZED_TX));
        assert!(!caps.optimized_tx);
        assert!(caps.transactions());
    }

    #[test]
    fn test_peer_requirements_recorded() {
        let peer = CapabilityMask::DEFAULT.with(CapabilityMask::REQUIRES_JMS_MESSAGES);
        let caps = NegotiatedCapabilities::negotiate(
            CapabilityMask::DEFAULT,
            peer.bits(),
            ProtocolVersion::CURRENT,
        )
        .unwrap();
        assert!(caps.peer_requires_jms_messages());
        assert!(!caps.peer_requires_jmf_encoding());
    }
}
