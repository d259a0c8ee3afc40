//! Connection diagnostics.
//!
//! Counters are updated by the reader, writer and heartbeat tasks and read
//! as a [`MultiplexerStats`] snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Thread-safe connection counters
#[derive(Debug, Default)]
pub(crate) struct ConnectionCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeats_received: AtomicU64,
}

impl ConnectionCounters {
    /// Record a frame handed to the transport
    pub fn record_sent(&self, bytes: usize, heartbeat: bool) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        if heartbeat {
            self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record bytes read from the transport
    pub fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a decoded frame
    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a heartbeat from the peer
    pub fn record_heartbeat_received(&self) {
        self.heartbeats_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot, with the live table sizes filled in by the caller
    pub fn snapshot(&self, conversations: usize, exchanges_outstanding: usize) -> MultiplexerStats {
        MultiplexerStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_received: self.heartbeats_received.load(Ordering::Relaxed),
            conversations,
            exchanges_outstanding,
        }
    }
}

/// Point-in-time connection statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplexerStats {
    /// Frames written
    pub frames_sent: u64,
    /// Frames decoded
    pub frames_received: u64,
    /// Bytes written, headers included
    pub bytes_sent: u64,
    /// Bytes read
    pub bytes_received: u64,
    /// Heartbeats sent
    pub heartbeats_sent: u64,
    /// Heartbeats received from the peer
    pub heartbeats_received: u64,
    /// Live conversations
    pub conversations: usize,
    /// Exchanges waiting for a reply
    pub exchanges_outstanding: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let counters = ConnectionCounters::default();
        counters.record_sent(30, false);
        counters.record_sent(18, true);
        counters.record_bytes_received(100);
        counters.record_frame_received();
        counters.record_heartbeat_received();

        let stats = counters.snapshot(2, 1);
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.bytes_sent, 48);
        assert_eq!(stats.heartbeats_sent, 1);
        assert_eq!(stats.bytes_received, 100);
        assert_eq!(stats.heartbeats_received, 1);
        assert_eq!(stats.conversations, 2);

        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["exchanges_outstanding"], 1);
    }
}
