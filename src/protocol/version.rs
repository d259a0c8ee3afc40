//! FAP protocol versions and version negotiation.
//!
//! Each side advertises the FAP revisions it speaks as a big-endian bitmap
//! with one bit per revision ordinal (ordinal `n` is bit `n - 1` counted
//! from the least significant end). The negotiated version is the highest
//! ordinal both sides mark as supported.
//!
//! The local side of the comparison is a [`SupportedVersionTable`], a sparse
//! map where revisions reserved for service releases are explicit `false`
//! entries. A reserved revision is never selected, whatever the peer claims.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{JfapError, Result};

/// A FAP protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    /// Version not yet negotiated
    pub const UNKNOWN: Self = Self(0);

    /// First revision carrying optimized transaction flows
    pub const OPTIMIZED_TX: Self = Self(4);

    /// Latest revision this crate speaks
    pub const CURRENT: Self = Self(20);

    /// Ordinal value
    pub fn ordinal(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FAP{}", self.0)
    }
}

/// Ordinals 1..=20 that shipped as real releases. The gaps were held back for
/// service streams and must never be negotiated.
const LEGACY_RESERVED: &[u16] = &[4, 8, 11, 12, 16, 17, 18, 19];

/// Sparse, contiguous table of (ordinal -> supported).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedVersionTable {
    entries: BTreeMap<u16, bool>,
}

impl SupportedVersionTable {
    /// The table shipped with the legacy runtime: 1..=20 with service gaps.
    pub fn legacy() -> Self {
        let mut table = Self::empty(ProtocolVersion::CURRENT.0);
        for ordinal in 1..=ProtocolVersion::CURRENT.0 {
            table.set(ordinal, !LEGACY_RESERVED.contains(&ordinal));
        }
        table
    }

    /// Table with every ordinal in `1..=max` marked supported.
    pub fn all_supported(max: u16) -> Self {
        let mut table = Self::empty(max);
        for ordinal in 1..=max {
            table.set(ordinal, true);
        }
        table
    }

    /// Table supporting exactly `ordinals`; every other ordinal up to the
    /// largest one is an explicit `false`.
    pub fn from_ordinals(ordinals: impl IntoIterator<Item = u16>) -> Self {
        let ordinals: Vec<u16> = ordinals.into_iter().filter(|o| *o > 0).collect();
        let max = ordinals.iter().copied().max().unwrap_or(0);
        let mut table = Self::empty(max);
        for ordinal in ordinals {
            table.set(ordinal, true);
        }
        table
    }

    fn empty(max: u16) -> Self {
        Self {
            entries: (1..=max).map(|o| (o, false)).collect(),
        }
    }

    /// Mark an ordinal supported or reserved, extending the table with
    /// reserved entries if needed.
    pub fn set(&mut self, ordinal: u16, supported: bool) {
        if ordinal == 0 {
            return;
        }
        let max = self.max_ordinal();
        for gap in (max + 1)..ordinal {
            self.entries.insert(gap, false);
        }
        self.entries.insert(ordinal, supported);
    }

    /// Mark every ordinal above `max_level` as reserved.
    pub fn clamp(mut self, max_level: u16) -> Self {
        for (ordinal, supported) in self.entries.iter_mut() {
            if *ordinal > max_level {
                *supported = false;
            }
        }
        self
    }

    /// Whether this side may negotiate `version`.
    pub fn is_supported(&self, version: ProtocolVersion) -> bool {
        self.entries.get(&version.0).copied().unwrap_or(false)
    }

    /// Highest ordinal present in the table (supported or reserved).
    pub fn max_ordinal(&self) -> u16 {
        self.entries.keys().next_back().copied().unwrap_or(0)
    }

    /// Supported ordinals in ascending order.
    pub fn supported(&self) -> impl DoubleEndedIterator<Item = ProtocolVersion> + '_ {
        self.entries
            .iter()
            .filter(|(_, s)| **s)
            .map(|(o, _)| ProtocolVersion(*o))
    }

    /// Highest supported ordinal.
    pub fn highest(&self) -> Option<ProtocolVersion> {
        self.supported().next_back()
    }

    /// All entries, ascending, including reserved ones.
    pub fn entries(&self) -> impl Iterator<Item = (u16, bool)> + '_ {
        self.entries.iter().map(|(o, s)| (*o, *s))
    }

    /// Wire bitmap advertising the supported ordinals.
    pub fn to_bitmap(&self) -> FapBitmap {
        FapBitmap::from_ordinals(self.supported().map(ProtocolVersion::ordinal))
    }

    /// Pick the highest ordinal both this table and `peer` support.
    pub fn negotiate(&self, peer: &FapBitmap) -> Result<ProtocolVersion> {
        self.supported()
            .rev()
            .find(|v| peer.contains(v.0))
            .ok_or_else(|| {
                JfapError::NoCompatibleVersion(format!(
                    "local supports {:?}, peer advertises {:?}",
                    self.supported().map(|v| v.0).collect::<Vec<_>>(),
                    peer.ordinals()
                ))
            })
    }

    /// Check a version chosen by the peer against this table.
    pub fn verify(&self, chosen: ProtocolVersion) -> Result<ProtocolVersion> {
        if self.is_supported(chosen) {
            Ok(chosen)
        } else {
            Err(JfapError::NoCompatibleVersion(format!(
                "peer selected {chosen}, which this side does not support"
            )))
        }
    }
}

impl Default for SupportedVersionTable {
    fn default() -> Self {
        Self::legacy()
    }
}

/// Big-endian supported-version bitmap as carried on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct FapBitmap {
    bytes: Bytes,
}

impl FapBitmap {
    /// Build a bitmap with the given ordinals set.
    pub fn from_ordinals(ordinals: impl IntoIterator<Item = u16>) -> Self {
        let ordinals: Vec<u16> = ordinals.into_iter().filter(|o| *o > 0).collect();
        let max = ordinals.iter().copied().max().unwrap_or(0);
        let len = (usize::from(max) + 7) / 8;
        let mut bytes = vec![0u8; len.max(1)];
        let last = bytes.len() - 1;
        for ordinal in ordinals {
            let bit = usize::from(ordinal - 1);
            bytes[last - bit / 8] |= 1 << (bit % 8);
        }
        Self {
            bytes: Bytes::from(bytes),
        }
    }

    /// Wrap a received bitmap.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(JfapError::Framing("empty supported FAP bitmap".to_string()));
        }
        if bytes.len() > usize::from(u16::MAX) / 8 {
            return Err(JfapError::Framing(format!(
                "supported FAP bitmap of {} bytes exceeds the ordinal range",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Raw big-endian bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether `ordinal` is set.
    pub fn contains(&self, ordinal: u16) -> bool {
        if ordinal == 0 {
            return false;
        }
        let bit = usize::from(ordinal - 1);
        let byte = bit / 8;
        if byte >= self.bytes.len() {
            return false;
        }
        self.bytes[self.bytes.len() - 1 - byte] & (1 << (bit % 8)) != 0
    }

    /// All set ordinals, ascending.
    pub fn ordinals(&self) -> Vec<u16> {
        let max_bits = self.bytes.len() * 8;
        (1..=max_bits as u16).filter(|o| self.contains(*o)).collect()
    }
}

impl fmt::Debug for FapBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FapBitmap").field(&self.ordinals()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY_SUPPORTED: &[u16] = &[1, 2, 3, 5, 6, 7, 9, 10, 13, 14, 15, 20];

    #[test]
    fn test_legacy_table() {
        let table = SupportedVersionTable::legacy();
        let supported: Vec<u16> = table.supported().map(|v| v.0).collect();
        assert_eq!(supported, LEGACY_SUPPORTED);
        assert_eq!(table.max_ordinal(), 20);
        // Reserved ordinals are present, not absent.
        assert_eq!(table.entries().count(), 20);
        assert!(!table.is_supported(ProtocolVersion(19)));
    }

    #[test]
    fn test_bitmap_layout() {
        let bitmap = FapBitmap::from_ordinals([1, 9, 20]);
        // 20 ordinals -> 3 bytes, ordinal 1 is the least significant bit.
        assert_eq!(bitmap.as_bytes(), &[0x08, 0x01, 0x01]);
        assert!(bitmap.contains(20));
        assert!(!bitmap.contains(21));
        assert_eq!(bitmap.ordinals(), vec![1, 9, 20]);
    }

    #[test]
    fn test_negotiate_highest_common() {
        let client = SupportedVersionTable::legacy();
        let server = SupportedVersionTable::all_supported(20);
        assert_eq!(
            server.negotiate(&client.to_bitmap()).unwrap(),
            ProtocolVersion(20)
        );
        assert_eq!(
            client.negotiate(&server.to_bitmap()).unwrap(),
            ProtocolVersion(20)
        );
    }

    #[test]
    fn test_reserved_never_selected() {
        let local = SupportedVersionTable::legacy();
        // Peer claims every ordinal except 20, including the reserved 16..=19.
        let peer = FapBitmap::from_ordinals(1..=19);
        assert_eq!(local.negotiate(&peer).unwrap(), ProtocolVersion(15));
        assert!(local.verify(ProtocolVersion(19)).is_err());
    }

    #[test]
    fn test_no_common_version() {
        let local = SupportedVersionTable::from_ordinals([1, 2]);
        let peer = FapBitmap::from_ordinals([3, 4]);
        assert!(matches!(
            local.negotiate(&peer),
            Err(JfapError::NoCompatibleVersion(_))
        ));

        let zero = FapBitmap::from_bytes(vec![0u8, 0u8]).unwrap();
        assert!(local.negotiate(&zero).is_err());
    }

    #[test]
    fn test_empty_bitmap_is_framing_error() {
        assert!(matches!(
            FapBitmap::from_bytes(Vec::<u8>::new()),
            Err(JfapError::Framing(_))
        ));
    }

    #[test]
    fn test_clamp() {
        let table = SupportedVersionTable::legacy().clamp(14);
        assert_eq!(table.highest(), Some(ProtocolVersion(14)));
        assert_eq!(table.max_ordinal(), 20);
    }

    #[test]
    fn test_set_extends_with_reserved_entries() {
        let mut table = SupportedVersionTable::from_ordinals([1]);
        table.set(5, true);
        assert_eq!(
            table.entries().collect::<Vec<_>>(),
            vec![(1, true), (2, false), (3, false), (4, false), (5, true)]
        );
    }
}
