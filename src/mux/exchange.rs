//! Correlated request/reply waits.
//!
//! A waiter is registered under `(conversation, correlation)` before the
//! request frame is queued, so a reply can never arrive ahead of its waiter.
//! The reader resolves waiters by key and wakes exactly one caller. Dropping
//! a [`Waiter`] (timeout, cancellation) removes its registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::codec::SegmentType;
use crate::error::{JfapError, Result};

/// A correlated reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Segment type of the reply frame
    pub segment: SegmentType,
    /// Reply payload (reassembled if chunked)
    pub payload: Bytes,
}

type Slot = oneshot::Sender<Result<Reply>>;

#[derive(Default)]
struct Table {
    next_correlation: HashMap<u32, u32>,
    waiters: HashMap<(u32, u32), Slot>,
    failed: Option<String>,
}

/// Registry of outstanding exchanges on one multiplexer.
#[derive(Default)]
pub(crate) struct ExchangeCoordinator {
    table: Mutex<Table>,
}

impl ExchangeCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a correlation id and register its waiter.
    ///
    /// Only one exchange may be outstanding per conversation.
    pub fn register(self: &Arc<Self>, conversation_id: u32) -> Result<Waiter> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table.lock();

        if let Some(reason) = &table.failed {
            return Err(JfapError::ConnectionLost(reason.clone()));
        }
        if table.waiters.keys().any(|(conv, _)| *conv == conversation_id) {
            return Err(JfapError::InvalidState(format!(
                "conversation {conversation_id} already has an exchange in flight"
            )));
        }

        let next = table.next_correlation.entry(conversation_id).or_insert(1);
        let correlation_id = *next;
        *next = next.checked_add(1).unwrap_or(1);

        table
            .waiters
            .insert((conversation_id, correlation_id), tx);

        Ok(Waiter {
            rx,
            key: (conversation_id, correlation_id),
            coordinator: Arc::clone(self),
        })
    }

    /// Deliver a reply. Returns `false` if nobody is waiting for it.
    pub fn resolve(&self, conversation_id: u32, correlation_id: u32, reply: Reply) -> bool {
        self.complete((conversation_id, correlation_id), Ok(reply))
    }

    /// Fail one waiter with the error its reply produced.
    pub fn reject(&self, conversation_id: u32, correlation_id: u32, error: JfapError) -> bool {
        self.complete((conversation_id, correlation_id), Err(error))
    }

    fn complete(&self, key: (u32, u32), outcome: Result<Reply>) -> bool {
        let slot = self.table.lock().waiters.remove(&key);
        match slot {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Fail the waiters of one conversation.
    pub fn fail_conversation(&self, conversation_id: u32, error: impl Fn() -> JfapError) {
        let slots: Vec<Slot> = {
            let mut table = self.table.lock();
            let keys: Vec<(u32, u32)> = table
                .waiters
                .keys()
                .filter(|(conv, _)| *conv == conversation_id)
                .copied()
                .collect();
            keys.iter()
                .filter_map(|k| table.waiters.remove(k))
                .collect()
        };
        for slot in slots {
            let _ = slot.send(Err(error()));
        }
    }

    /// Fail every waiter and refuse new registrations.
    pub fn fail_all(&self, reason: &str) {
        let slots: Vec<Slot> = {
            let mut table = self.table.lock();
            table.failed = Some(reason.to_string());
            table.waiters.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let _ = slot.send(Err(JfapError::ConnectionLost(reason.to_string())));
        }
    }

    /// Drop the correlation counter of a released conversation.
    pub fn forget_conversation(&self, conversation_id: u32) {
        self.table.lock().next_correlation.remove(&conversation_id);
    }

    /// Outstanding waiters
    pub fn outstanding(&self) -> usize {
        self.table.lock().waiters.len()
    }

    fn remove(&self, key: (u32, u32)) {
        self.table.lock().waiters.remove(&key);
    }
}

/// A registered wait for one reply.
pub(crate) struct Waiter {
    rx: oneshot::Receiver<Result<Reply>>,
    key: (u32, u32),
    coordinator: Arc<ExchangeCoordinator>,
}

impl Waiter {
    /// Correlation id to stamp on the request frame
    pub fn correlation_id(&self) -> u32 {
        self.key.1
    }

    /// Wait for the reply, the connection failing, or `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Reply> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(JfapError::lost("exchange abandoned")),
            Err(_) => Err(JfapError::ExchangeTimeout(timeout)),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.coordinator.remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(payload: &'static [u8]) -> Reply {
        Reply {
            segment: SegmentType::Data,
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_resolve_wakes_only_its_waiter() {
        let coordinator = ExchangeCoordinator::new();
        let a = coordinator.register(1).unwrap();
        let b = coordinator.register(3).unwrap();
        assert_eq!(a.correlation_id(), 1);

        // Replies arrive in reverse order.
        assert!(coordinator.resolve(3, b.correlation_id(), reply(b"for-b")));
        assert!(coordinator.resolve(1, a.correlation_id(), reply(b"for-a")));

        let timeout = Duration::from_secs(1);
        assert_eq!(a.wait(timeout).await.unwrap().payload, "for-a");
        assert_eq!(b.wait(timeout).await.unwrap().payload, "for-b");
    }

    #[tokio::test]
    async fn test_waiter_pending_until_resolved() {
        let coordinator = ExchangeCoordinator::new();
        let waiter = coordinator.register(7).unwrap();
        let correlation = waiter.correlation_id();

        let mut wait = tokio_test::task::spawn(waiter.wait(Duration::from_secs(60)));
        tokio_test::assert_pending!(wait.poll());
        assert_eq!(coordinator.outstanding(), 1);

        assert!(coordinator.resolve(7, correlation, reply(b"done")));
        assert!(wait.is_woken());
        let reply = tokio_test::assert_ready_ok!(wait.poll());
        assert_eq!(reply.payload, "done");
    }

    #[tokio::test]
    async fn test_one_exchange_per_conversation() {
        let coordinator = ExchangeCoordinator::new();
        let _a = coordinator.register(5).unwrap();
        assert!(matches!(
            coordinator.register(5),
            Err(JfapError::InvalidState(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_leak() {
        let coordinator = ExchangeCoordinator::new();
        let waiter = coordinator.register(1).unwrap();
        let correlation = waiter.correlation_id();
        let result = waiter.wait(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(JfapError::ExchangeTimeout(_))));
        assert_eq!(coordinator.outstanding(), 0);
        // A late reply finds nobody.
        assert!(!coordinator.resolve(1, correlation, reply(b"late")));
        // Correlation ids keep increasing.
        assert_eq!(coordinator.register(1).unwrap().correlation_id(), correlation + 1);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let coordinator = ExchangeCoordinator::new();
        let waiter = coordinator.register(1).unwrap();
        coordinator.fail_all("transport gone");
        assert!(matches!(
            waiter.wait(Duration::from_secs(1)).await,
            Err(JfapError::ConnectionLost(_))
        ));
        assert!(matches!(
            coordinator.register(2),
            Err(JfapError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_conversation() {
        let coordinator = ExchangeCoordinator::new();
        let a = coordinator.register(1).unwrap();
        let b = coordinator.register(2).unwrap();
        coordinator.fail_conversation(1, || JfapError::AlreadyReleased);
        assert!(matches!(
            a.wait(Duration::from_secs(1)).await,
            Err(JfapError::AlreadyReleased)
        ));
        assert!(coordinator.resolve(2, b.correlation_id(), reply(b"ok")));
    }

    #[tokio::test]
    async fn test_reject_delivers_error() {
        let coordinator = ExchangeCoordinator::new();
        let waiter = coordinator.register(0).unwrap();
        assert!(coordinator.reject(
            0,
            waiter.correlation_id(),
            JfapError::NegotiationRejected("no".into())
        ));
        assert!(matches!(
            waiter.wait(Duration::from_secs(1)).await,
            Err(JfapError::NegotiationRejected(_))
        ));
    }
}
