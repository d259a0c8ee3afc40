//! Consumer-side read-ahead.
//!
//! [`FlowControlQueue`] buffers delivered messages and decides when to ask
//! the producer for more. It is synchronous and takes the current time as a
//! parameter; [`ReadAheadConsumer`] wires it to a callback and a refill sink.
//!
//! | Condition                                   | Action                         |
//! |---------------------------------------------|--------------------------------|
//! | buffered + outstanding < low watermark      | refill up to the high watermark |
//! | otherwise                                   | nothing                        |
//! | no data for the stall timeout               | forced refill                  |
//!
//! Every refill is capped at `max_queue_bytes`.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::config::ReadAheadConfig;
use crate::error::{JfapError, Result};

/// A request for the producer to send more data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefillRequest {
    /// Bytes the consumer is ready to receive
    pub bytes: u32,
    /// Sent because the stream stalled, not because of the watermarks
    pub forced: bool,
}

impl RefillRequest {
    /// Wire form: `bytes: u32`, `forced: u8`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u32(self.bytes);
        buf.put_u8(u8::from(self.forced));
        buf.freeze()
    }

    /// Decode the wire form
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() != 5 {
            return Err(JfapError::Framing(format!(
                "read-ahead request of {} bytes, expected 5",
                buf.len()
            )));
        }
        let bytes = buf.get_u32();
        let forced = match buf.get_u8() {
            0 => false,
            1 => true,
            other => {
                return Err(JfapError::Framing(format!(
                    "read-ahead forced flag 0x{other:02x}"
                )))
            },
        };
        Ok(Self { bytes, forced })
    }
}

/// Byte-watermark read-ahead buffer.
#[derive(Debug)]
pub struct FlowControlQueue {
    queue: VecDeque<Bytes>,
    buffered: usize,
    outstanding: usize,
    high: usize,
    low: usize,
    max: usize,
    stall_timeout: Duration,
    last_activity: Instant,
}

impl FlowControlQueue {
    /// Queue with the given watermarks, starting its stall clock at `now`
    pub fn new(config: &ReadAheadConfig, now: Instant) -> Self {
        Self {
            queue: VecDeque::new(),
            buffered: 0,
            outstanding: 0,
            high: config.high_queue_bytes,
            low: config.low_queue_bytes(),
            max: config.max_queue_bytes,
            stall_timeout: config.stall_timeout(),
            last_activity: now,
        }
    }

    /// Buffer a message from the producer
    pub fn on_data(&mut self, message: Bytes, now: Instant) {
        self.buffered += message.len();
        self.outstanding = self.outstanding.saturating_sub(message.len());
        self.queue.push_back(message);
        self.last_activity = now;
    }

    /// Take the oldest buffered message
    pub fn pop(&mut self) -> Option<Bytes> {
        let message = self.queue.pop_front()?;
        self.buffered -= message.len();
        Some(message)
    }

    /// Refill request due at `now`, if any
    pub fn poll_refill(&mut self, now: Instant) -> Option<RefillRequest> {
        if now.saturating_duration_since(self.last_activity) >= self.stall_timeout {
            let bytes = self.high.saturating_sub(self.buffered).max(self.low).min(self.max);
            self.outstanding = bytes;
            self.last_activity = now;
            return Some(Self::request(bytes, true));
        }

        if self.buffered + self.outstanding >= self.low {
            return None;
        }
        let bytes = self
            .high
            .saturating_sub(self.buffered + self.outstanding)
            .min(self.max);
        if bytes == 0 {
            return None;
        }
        self.outstanding += bytes;
        self.last_activity = now;
        Some(Self::request(bytes, false))
    }

    fn request(bytes: usize, forced: bool) -> RefillRequest {
        RefillRequest {
            bytes: u32::try_from(bytes).unwrap_or(u32::MAX),
            forced,
        }
    }

    /// When a forced refill becomes due
    pub fn stall_deadline(&self) -> Instant {
        self.last_activity + self.stall_timeout
    }

    /// Bytes buffered
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Messages buffered
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Callback receiving consumed messages
pub type ConsumerCallback = Box<dyn FnMut(Bytes) + Send>;

/// Sink for refill requests (normally the conversation's outbound path)
pub type RefillSink = Box<dyn Fn(RefillRequest) + Send + Sync>;

/// A [`FlowControlQueue`] feeding a callback.
pub struct ReadAheadConsumer {
    queue: Mutex<FlowControlQueue>,
    callback: Mutex<ConsumerCallback>,
    refill: RefillSink,
}

impl ReadAheadConsumer {
    /// Create a consumer and issue the initial refill
    pub fn new(config: &ReadAheadConfig, callback: ConsumerCallback, refill: RefillSink) -> Arc<Self> {
        let consumer = Arc::new(Self {
            queue: Mutex::new(FlowControlQueue::new(config, Instant::now())),
            callback: Mutex::new(callback),
            refill,
        });
        consumer.poll(Instant::now());
        consumer
    }

    /// Buffer a message from the reader
    pub fn on_data(&self, message: Bytes) {
        self.queue.lock().on_data(message, Instant::now());
    }

    /// Deliver every buffered message to the callback, refilling as the
    /// buffer drains.
    ///
    /// The callback lock serialises drains, so messages of one conversation
    /// reach the callback in order.
    pub fn drain(&self) {
        let mut callback = self.callback.lock();
        loop {
            let next = self.queue.lock().pop();
            let Some(message) = next else { break };
            (callback)(message);
            self.poll(Instant::now());
        }
    }

    fn poll(&self, now: Instant) {
        let request = self.queue.lock().poll_refill(now);
        if let Some(request) = request {
            debug!(bytes = request.bytes, forced = request.forced, "Read-ahead refill");
            (self.refill)(request);
        }
    }

    /// Issue forced refills while the stream is stalled, until `consumer`
    /// is dropped.
    pub async fn run_stall_timer(consumer: Weak<Self>) {
        loop {
            let deadline = match consumer.upgrade() {
                Some(c) => c.queue.lock().stall_deadline(),
                None => return,
            };
            tokio::time::sleep_until(deadline).await;
            match consumer.upgrade() {
                Some(c) => c.poll(Instant::now()),
                None => return,
            }
        }
    }

    /// Bytes buffered and not yet delivered
    pub fn buffered(&self) -> usize {
        self.queue.lock().buffered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReadAheadConfig {
        ReadAheadConfig {
            high_queue_bytes: 1000,
            low_queue_bytes_factor: 0.5,
            max_queue_bytes: 800,
            stall_timeout_ms: 2000,
        }
    }

    fn msg(len: usize) -> Bytes {
        Bytes::from(vec![0u8; len])
    }

    #[test]
    fn test_initial_refill_capped_by_max() {
        let t0 = Instant::now();
        let mut q = FlowControlQueue::new(&config(), t0);
        assert_eq!(
            q.poll_refill(t0),
            Some(RefillRequest {
                bytes: 800,
                forced: false
            })
        );
        // Outstanding credit suppresses another request.
        assert_eq!(q.poll_refill(t0), None);
    }

    #[test]
    fn test_high_watermark_blocks_until_low() {
        let t0 = Instant::now();
        let mut q = FlowControlQueue::new(&config(), t0);
        q.poll_refill(t0);
        for _ in 0..6 {
            q.on_data(msg(200), t0);
        }
        assert!(q.buffered() > 1000);

        let t = t0 + Duration::from_millis(100);
        assert_eq!(q.poll_refill(t), None);
        // Drain to 600, still above the low watermark.
        q.pop();
        q.pop();
        q.pop();
        assert_eq!(q.poll_refill(t), None);
        // 400 is below 500.
        q.pop();
        assert_eq!(
            q.poll_refill(t),
            Some(RefillRequest {
                bytes: 600,
                forced: false
            })
        );
    }

    #[test]
    fn test_forced_refill_at_stall_timeout() {
        let t0 = Instant::now();
        let mut q = FlowControlQueue::new(&config(), t0);
        q.poll_refill(t0);
        for _ in 0..6 {
            q.on_data(msg(200), t0);
        }

        let just_before = t0 + Duration::from_millis(1999);
        assert_eq!(q.poll_refill(just_before), None);

        let at = t0 + Duration::from_millis(2000);
        let forced = q.poll_refill(at).unwrap();
        assert!(forced.forced);
        // Above the high watermark the request falls back to the low mark.
        assert_eq!(forced.bytes, 500);
        assert_eq!(q.stall_deadline(), at + Duration::from_millis(2000));
    }

    #[test]
    fn test_refill_wire_form() {
        let request = RefillRequest {
            bytes: 4096,
            forced: true,
        };
        assert_eq!(&request.encode()[..], &[0, 0, 0x10, 0, 1]);
        assert_eq!(RefillRequest::decode(&request.encode()).unwrap(), request);
        assert!(RefillRequest::decode(&[0, 0, 0, 0, 2]).is_err());
        assert!(RefillRequest::decode(&[0, 0]).is_err());
    }

    #[test]
    fn test_consumer_delivers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let refills = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let refills_cb = Arc::clone(&refills);

        let consumer = ReadAheadConsumer::new(
            &config(),
            Box::new(move |m: Bytes| seen_cb.lock().push(m.len())),
            Box::new(move |r| refills_cb.lock().push(r)),
        );
        assert_eq!(refills.lock().len(), 1);

        consumer.on_data(msg(10));
        consumer.on_data(msg(20));
        consumer.drain();
        assert_eq!(*seen.lock(), vec![10, 20]);
        assert_eq!(consumer.buffered(), 0);
    }
}
