//! Optimized transaction flows.
//!
//! When both peers advertise `REQUIRES_OPTIMIZED_TX`, a transacted operation
//! carries a flags word and the transaction identity inline instead of
//! separate begin/end frames:
//!
//! ```text
//! flags: u32 | creating conversation: u32 | [transaction id: u32
//!            | [end flags: u32] | [xid len: u16 | xid]]
//! ```
//!
//! The transaction id follows only for transacted flows. The XID follows only
//! when a global transaction is created, and the end flags only when that
//! creation also ends the previous branch.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::capabilities::NegotiatedCapabilities;
use crate::error::{JfapError, Result};

/// Optimized transaction flag word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionFlags(u32);

impl TransactionFlags {
    /// Operation runs inside a transaction
    pub const TRANSACTED: u32 = 0x0000_0001;
    /// Uncoordinated local transaction (otherwise global)
    pub const LOCAL: u32 = 0x0000_0002;
    /// Create the transaction before the operation
    pub const CREATE: u32 = 0x0000_0004;
    /// End the previous global branch first
    pub const END_PREVIOUS: u32 = 0x0000_0008;
    /// Local transaction allows subordinate enlistment
    pub const SUBORDINATES_ALLOWED: u32 = 0x0000_0010;

    /// Bits this protocol defines
    pub const DEFINED: u32 = 0x0000_001F;

    /// No transaction
    pub fn none() -> Self {
        Self(0)
    }

    /// Transacted flow reusing an existing transaction
    pub fn transacted() -> Self {
        Self(Self::TRANSACTED)
    }

    /// Check if flag is set
    pub fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    /// Set flag
    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    /// Clear flag
    pub fn clear(&mut self, flag: u32) {
        self.0 &= !flag;
    }

    /// Copy with flag set
    pub fn with(mut self, flag: u32) -> Self {
        self.set(flag);
        self
    }

    /// Raw value
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Decode a received word, rejecting reserved bits and impossible
    /// combinations.
    pub fn from_bits(bits: u32) -> Result<Self> {
        let flags = Self(bits);
        flags
            .check()
            .map_err(|reason| JfapError::Framing(format!("transaction flags 0x{bits:08x}: {reason}")))?;
        Ok(flags)
    }

    fn check(self) -> std::result::Result<(), &'static str> {
        if self.0 & !Self::DEFINED != 0 {
            return Err("reserved bits set");
        }
        if !self.has(Self::TRANSACTED) && self.0 != 0 {
            return Err("transaction bits on a non-transacted flow");
        }
        if self.has(Self::SUBORDINATES_ALLOWED)
            && !(self.has(Self::LOCAL) && self.has(Self::CREATE))
        {
            return Err("subordinates allowed only when creating a local transaction");
        }
        if self.has(Self::END_PREVIOUS) && (self.has(Self::LOCAL) || !self.has(Self::CREATE)) {
            return Err("end previous only when creating a global transaction");
        }
        Ok(())
    }

    fn carries_xid(self) -> bool {
        self.has(Self::TRANSACTED) && self.has(Self::CREATE) && !self.has(Self::LOCAL)
    }
}

/// Transaction identity carried by an optimized flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizedTxHeader {
    /// Flag word
    pub flags: TransactionFlags,
    /// Conversation that created the transaction
    pub creating_conversation_id: u32,
    /// Transaction id (transacted flows only)
    pub transaction_id: Option<u32>,
    /// End flags for the previous branch (`END_PREVIOUS` only)
    pub end_flags: Option<u32>,
    /// XID of a newly created global transaction
    pub xid: Option<Bytes>,
}

impl OptimizedTxHeader {
    /// Header for a non-transacted flow
    pub fn none(creating_conversation_id: u32) -> Self {
        Self {
            flags: TransactionFlags::none(),
            creating_conversation_id,
            transaction_id: None,
            end_flags: None,
            xid: None,
        }
    }

    fn check(&self) -> Result<()> {
        let usage = |m: &str| Err(JfapError::Usage(format!("optimized transaction header: {m}")));
        self.flags
            .check()
            .map_err(|m| JfapError::Usage(format!("optimized transaction header: {m}")))?;
        let transacted = self.flags.has(TransactionFlags::TRANSACTED);
        if transacted != self.transaction_id.is_some() {
            return usage("transaction id must be present exactly for transacted flows");
        }
        if self.flags.carries_xid() != self.xid.is_some() {
            return usage("xid must be present exactly when creating a global transaction");
        }
        if self.flags.has(TransactionFlags::END_PREVIOUS) != self.end_flags.is_some() {
            return usage("end flags must be present exactly with END_PREVIOUS");
        }
        Ok(())
    }
}

/// Encoder/decoder for optimized transaction headers on one connection
#[derive(Debug, Clone, Copy)]
pub struct TransactionFlowCodec {
    enabled: bool,
}

impl TransactionFlowCodec {
    /// Codec for a connection with the given negotiated capabilities
    pub fn new(capabilities: &NegotiatedCapabilities) -> Self {
        Self {
            enabled: capabilities.optimized_tx,
        }
    }

    /// Whether optimized flows are available
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Encode a header. Fails with `OptimizedTxNotNegotiated` when the
    /// connection must use explicit begin/end frames instead.
    pub fn encode(&self, header: &OptimizedTxHeader) -> Result<Bytes> {
        if !self.enabled {
            return Err(JfapError::OptimizedTxNotNegotiated);
        }
        header.check()?;

        let mut buf = BytesMut::with_capacity(16);
        buf.put_u32(header.flags.bits());
        buf.put_u32(header.creating_conversation_id);
        if let Some(id) = header.transaction_id {
            buf.put_u32(id);
        }
        if let Some(end) = header.end_flags {
            buf.put_u32(end);
        }
        if let Some(xid) = &header.xid {
            let len = u16::try_from(xid.len())
                .map_err(|_| JfapError::Usage(format!("xid of {} bytes is too long", xid.len())))?;
            buf.put_u16(len);
            buf.put_slice(xid);
        }
        Ok(buf.freeze())
    }

    /// Decode a header from the front of `buf`, advancing past it.
    pub fn decode(&self, buf: &mut Bytes) -> Result<OptimizedTxHeader> {
        if !self.enabled {
            return Err(JfapError::OptimizedTxNotNegotiated);
        }
        let short = || JfapError::Framing("truncated optimized transaction header".to_string());

        if buf.remaining() < 8 {
            return Err(short());
        }
        let flags = TransactionFlags::from_bits(buf.get_u32())?;
        let creating_conversation_id = buf.get_u32();

        let mut header = OptimizedTxHeader {
            flags,
            creating_conversation_id,
            transaction_id: None,
            end_flags: None,
            xid: None,
        };

        if flags.has(TransactionFlags::TRANSACTED) {
            if buf.remaining() < 4 {
                return Err(short());
            }
            header.transaction_id = Some(buf.get_u32());
        }
        if flags.has(TransactionFlags::END_PREVIOUS) {
            if buf.remaining() < 4 {
                return Err(short());
            }
            header.end_flags = Some(buf.get_u32());
        }
        if flags.carries_xid() {
            if buf.remaining() < 2 {
                return Err(short());
            }
            let len = usize::from(buf.get_u16());
            if buf.remaining() < len {
                return Err(short());
            }
            header.xid = Some(buf.split_to(len));
        }
        Ok(header)
    }
}
