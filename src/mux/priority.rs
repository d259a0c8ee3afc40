//! Message priorities and the priority-ordered outbound queue.
//!
//! Callers use logical priorities 0..=14. Logical `p` travels as transport
//! priority `p + 1`; heartbeats and connection control use transport 16,
//! which no caller can reach.
//!
//! ```text
//! send(p=3) ─┐                       ┌─ level 16 (control)
//! send(p=9) ─┼─► OutboundQueue ──────┼─ level 15..1 (data)  ─► writer task
//! heartbeat ─┘   (one FIFO per level)└─ highest level first
//! ```

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};

use crate::codec::frame::MAX_TRANSPORT_PRIORITY;
use crate::codec::Frame;
use crate::error::{JfapError, Result};

/// Transport priority used for heartbeats and connection control
pub const CONTROL_TRANSPORT_PRIORITY: u8 = MAX_TRANSPORT_PRIORITY;

/// Raw value selecting [`SendPriority::LowestPending`]
pub const PRIORITY_LOWEST_PENDING: u8 = 0xFF;

const LEVELS: usize = MAX_TRANSPORT_PRIORITY as usize + 1;

/// Logical message priority, 0 (lowest) to 14 (highest)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    /// Lowest caller priority
    pub const LOWEST: Self = Self(0);
    /// Highest caller priority
    pub const HIGHEST: Self = Self(14);

    /// Validate a caller-supplied priority. 15 belongs to heartbeats.
    pub fn new(value: u8) -> Result<Self> {
        if value > Self::HIGHEST.0 {
            return Err(JfapError::InvalidPriority(value));
        }
        Ok(Self(value))
    }

    /// Logical value
    pub fn value(self) -> u8 {
        self.0
    }

    /// Transport priority on the wire
    pub fn transport(self) -> u8 {
        self.0 + 1
    }

    /// Logical priority of a received data frame
    pub fn from_transport(transport: u8) -> Result<Self> {
        match transport {
            1..=15 => Ok(Self(transport - 1)),
            other => Err(JfapError::Framing(format!(
                "transport priority {other} is not a data priority"
            ))),
        }
    }
}

impl fmt::Debug for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Priority({})", self.0)
    }
}

/// Priority requested for a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPriority {
    /// Fixed logical priority
    Fixed(Priority),
    /// Whatever data priority is currently lowest in the outbound queue
    LowestPending,
}

impl SendPriority {
    /// Parse a raw caller value: 0..=14 or [`PRIORITY_LOWEST_PENDING`].
    pub fn from_raw(value: u8) -> Result<Self> {
        if value == PRIORITY_LOWEST_PENDING {
            Ok(Self::LowestPending)
        } else {
            Priority::new(value).map(Self::Fixed)
        }
    }
}

impl From<Priority> for SendPriority {
    fn from(p: Priority) -> Self {
        Self::Fixed(p)
    }
}

/// A frame waiting for the writer
pub(crate) struct QueuedFrame {
    pub frame: Frame,
    /// Signalled once the bytes have been handed to the transport
    pub sent: Option<oneshot::Sender<()>>,
}

impl QueuedFrame {
    pub fn new(frame: Frame) -> Self {
        Self { frame, sent: None }
    }

    pub fn notify_sent(frame: Frame, sent: oneshot::Sender<()>) -> Self {
        Self {
            frame,
            sent: Some(sent),
        }
    }
}

struct QueueInner {
    levels: [VecDeque<QueuedFrame>; LEVELS],
    len: usize,
    closed: bool,
}

impl QueueInner {
    fn lowest_pending_data(&self) -> Option<Priority> {
        (1..=15u8)
            .find(|t| !self.levels[usize::from(*t)].is_empty())
            .map(|t| Priority(t - 1))
    }
}

/// Outbound frames, one FIFO per transport priority, single consumer.
pub(crate) struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                levels: std::array::from_fn(|_| VecDeque::new()),
                len: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Queue frames at an explicit transport priority.
    pub fn push(&self, transport_priority: u8, frames: Vec<QueuedFrame>) -> Result<()> {
        self.push_with(None, |_| Ok((transport_priority, frames)))
            .map(|_| ())
    }

    /// Resolve `priority` against the current queue contents and queue the
    /// frames `build` produces for it, atomically.
    pub fn push_data<F>(&self, priority: SendPriority, build: F) -> Result<Priority>
    where
        F: FnOnce(Priority) -> Result<Vec<QueuedFrame>>,
    {
        let mut resolved = Priority::LOWEST;
        self.push_with(Some(priority), |p| {
            resolved = p;
            Ok((p.transport(), build(p)?))
        })?;
        Ok(resolved)
    }

    fn push_with<F>(&self, priority: Option<SendPriority>, build: F) -> Result<()>
    where
        F: FnOnce(Priority) -> Result<(u8, Vec<QueuedFrame>)>,
    {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(JfapError::lost("outbound queue closed"));
            }
            let logical = match priority {
                Some(SendPriority::Fixed(p)) => p,
                Some(SendPriority::LowestPending) => {
                    inner.lowest_pending_data().unwrap_or(Priority::LOWEST)
                },
                None => Priority::LOWEST,
            };
            let (level, frames) = build(logical)?;
            let level = usize::from(level.min(MAX_TRANSPORT_PRIORITY));
            inner.len += frames.len();
            inner.levels[level].extend(frames);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Next frame, highest priority first. `None` once closed and drained.
    pub async fn pop(&self) -> Option<QueuedFrame> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(frame) = Self::pop_highest(&mut inner) {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            // Single consumer: notify_one stores a permit if we are not
            // parked yet, so a push between unlock and await is not lost.
            self.notify.notified().await;
        }
    }

    fn pop_highest(inner: &mut QueueInner) -> Option<QueuedFrame> {
        let frame = inner
            .levels
            .iter_mut()
            .rev()
            .find_map(|level| level.pop_front())?;
        inner.len -= 1;
        Some(frame)
    }

    /// Stop accepting frames; already queued frames are still written.
    pub fn shutdown(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    /// Stop accepting frames and discard the queue.
    pub fn abort(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            for level in &mut inner.levels {
                level.clear();
            }
            inner.len = 0;
        }
        self.notify.notify_one();
    }

    /// Frames waiting
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    /// Whether new frames are refused
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::codec::{FrameHeader, SegmentType};

    fn frame(conv: u32) -> QueuedFrame {
        QueuedFrame::new(Frame::new(
            FrameHeader::new(SegmentType::Data, 1, conv),
            Bytes::new(),
        ))
    }

    #[test]
    fn test_priority_range() {
        assert_eq!(Priority::new(14).unwrap().transport(), 15);
        assert_eq!(Priority::new(0).unwrap().transport(), 1);
        assert!(matches!(Priority::new(15), Err(JfapError::InvalidPriority(15))));
        assert!(SendPriority::from_raw(15).is_err());
        assert_eq!(
            SendPriority::from_raw(PRIORITY_LOWEST_PENDING).unwrap(),
            SendPriority::LowestPending
        );
        assert!(Priority::from_transport(CONTROL_TRANSPORT_PRIORITY).is_err());
        assert!(Priority::from_transport(0).is_err());
    }

    #[tokio::test]
    async fn test_highest_priority_first() {
        let queue = OutboundQueue::new();
        queue
            .push_data(Priority::new(2).unwrap().into(), |_| Ok(vec![frame(1), frame(2)]))
            .unwrap();
        queue
            .push_data(Priority::new(9).unwrap().into(), |_| Ok(vec![frame(3)]))
            .unwrap();
        queue
            .push(CONTROL_TRANSPORT_PRIORITY, vec![frame(4)])
            .unwrap();

        let order: Vec<u32> = [
            queue.pop().await,
            queue.pop().await,
            queue.pop().await,
            queue.pop().await,
        ]
        .into_iter()
        .map(|f| f.unwrap().frame.header.conversation_id)
        .collect();
        assert_eq!(order, vec![4, 3, 1, 2]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_lowest_pending_resolution() {
        let queue = OutboundQueue::new();
        // Nothing queued: same as the lowest fixed priority.
        let p = queue
            .push_data(SendPriority::LowestPending, |_| Ok(Vec::new()))
            .unwrap();
        assert_eq!(p, Priority::LOWEST);

        queue
            .push_data(Priority::new(6).unwrap().into(), |_| Ok(vec![frame(1)]))
            .unwrap();
        queue
            .push_data(Priority::new(11).unwrap().into(), |_| Ok(vec![frame(2)]))
            .unwrap();
        let p = queue
            .push_data(SendPriority::LowestPending, |_| Ok(vec![frame(3)]))
            .unwrap();
        assert_eq!(p, Priority::new(6).unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_drains_abort_discards() {
        let queue = OutboundQueue::new();
        queue.push(1, vec![frame(1)]).unwrap();
        queue.shutdown();
        assert!(queue.push(1, vec![frame(2)]).is_err());
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());

        let queue = OutboundQueue::new();
        queue.push(1, vec![frame(1)]).unwrap();
        queue.abort();
        assert!(queue.pop().await.is_none());
    }
}
