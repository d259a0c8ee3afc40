//! Conversations: independently failing logical connections that share one
//! multiplexer.
//!
//! ```text
//!          close()            ack / timeout
//!   Open ───────────► Closing ─────────────► Closed
//!    │                   │
//!    └── framing error / transport loss ──► Failed
//! ```
//!
//! Every public operation checks the lifecycle first; once `Closed` or
//! `Failed` it returns [`JfapError::AlreadyReleased`] without touching the
//! wire.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::multiplexer::{Correlation, MuxShared};
use super::priority::{Priority, SendPriority};
use super::schema::{self, SchemaReply};
use crate::codec::SegmentType;
use crate::error::{JfapError, Result};
use crate::flow::{ReadAheadConsumer, RefillRequest};
use crate::protocol::TransactionFlowCodec;

/// Callback fired once when a conversation or multiplexer fails
pub type FailureCallback = Box<dyn FnOnce(&JfapError) + Send>;

/// Conversation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationState {
    /// Usable
    Open,
    /// Close requested, waiting for the peer's acknowledgement
    Closing,
    /// Closed by either side
    Closed,
    /// Failed; the failure callback has fired
    Failed,
}

impl ConversationState {
    /// `Closed` or `Failed`
    pub fn is_released(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// An exchange request from the peer, answered with [`Conversation::reply`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Correlation id to echo in the reply
    pub correlation_id: u32,
    /// Priority the request travelled at
    pub priority: Priority,
    /// Request payload
    pub payload: Bytes,
}

/// Something the peer sent on a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Fire-and-forget message
    Data(Bytes),
    /// Message expecting a reply
    Request(Request),
    /// The peer's consumer asks for more data
    Refill(RefillRequest),
}

struct Lifecycle {
    state: ConversationState,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    on_failure: Option<FailureCallback>,
    consumer: Option<Arc<ReadAheadConsumer>>,
}

/// Conversation state shared between the handle and the multiplexer.
pub(crate) struct ConversationShared {
    id: u32,
    priority: Priority,
    lifecycle: Mutex<Lifecycle>,
    schema_set: Mutex<BTreeSet<u64>>,
}

impl ConversationShared {
    pub fn new(id: u32, priority: Priority) -> (Arc<Self>, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            id,
            priority,
            lifecycle: Mutex::new(Lifecycle {
                state: ConversationState::Open,
                inbound: Some(tx),
                on_failure: None,
                consumer: None,
            }),
            schema_set: Mutex::new(BTreeSet::new()),
        });
        (shared, rx)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> ConversationState {
        self.lifecycle.lock().state
    }

    pub fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ConversationState::Open => Ok(()),
            ConversationState::Closing => Err(JfapError::InvalidState(format!(
                "conversation {} is closing",
                self.id
            ))),
            ConversationState::Closed | ConversationState::Failed => {
                Err(JfapError::AlreadyReleased)
            },
        }
    }

    /// Queue an inbound item for the handle. `false` once released.
    pub fn deliver(&self, item: Inbound) -> bool {
        self.lifecycle
            .lock()
            .inbound
            .as_ref()
            .is_some_and(|tx| tx.send(item).is_ok())
    }

    pub fn consumer(&self) -> Option<Arc<ReadAheadConsumer>> {
        self.lifecycle.lock().consumer.clone()
    }

    fn install_consumer(&self, consumer: Arc<ReadAheadConsumer>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state.is_released() {
            return Err(JfapError::AlreadyReleased);
        }
        if lifecycle.consumer.is_some() {
            return Err(JfapError::InvalidState(format!(
                "conversation {} already has a consumer",
                self.id
            )));
        }
        lifecycle.consumer = Some(consumer);
        Ok(())
    }

    fn set_on_failure(&self, callback: FailureCallback) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state.is_released() {
            return Err(JfapError::AlreadyReleased);
        }
        lifecycle.on_failure = Some(callback);
        Ok(())
    }

    fn begin_close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            ConversationState::Open => {
                lifecycle.state = ConversationState::Closing;
                Ok(())
            },
            ConversationState::Closing => Err(JfapError::InvalidState(format!(
                "conversation {} is already closing",
                self.id
            ))),
            ConversationState::Closed | ConversationState::Failed => {
                Err(JfapError::AlreadyReleased)
            },
        }
    }

    /// Move to `Failed` and fire the failure callback.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn fail(&self, error: &JfapError) -> bool {
        let callback = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state.is_released() {
                return false;
            }
            lifecycle.state = ConversationState::Failed;
            lifecycle.inbound = None;
            lifecycle.consumer = None;
            lifecycle.on_failure.take()
        };
        if let Some(callback) = callback {
            callback(error);
        }
        true
    }

    /// Move to `Closed` without firing the failure callback.
    pub fn release(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state.is_released() {
            return false;
        }
        lifecycle.state = ConversationState::Closed;
        lifecycle.inbound = None;
        lifecycle.consumer = None;
        lifecycle.on_failure = None;
        true
    }
}

impl fmt::Debug for ConversationShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .finish()
    }
}

/// Application handle to one conversation.
///
/// Dropping an open conversation notifies the peer and releases it without
/// waiting for an acknowledgement; [`Conversation::close`] waits.
pub struct Conversation {
    shared: Arc<ConversationShared>,
    mux: Arc<MuxShared>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl Conversation {
    pub(crate) fn new(
        shared: Arc<ConversationShared>,
        mux: Arc<MuxShared>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> Self {
        Self {
            shared,
            mux,
            inbound,
        }
    }

    /// Conversation id, unique within its multiplexer
    pub fn id(&self) -> u32 {
        self.shared.id()
    }

    /// Priority class the conversation was opened with
    pub fn priority(&self) -> Priority {
        self.shared.priority()
    }

    /// Lifecycle state
    pub fn state(&self) -> ConversationState {
        self.shared.state()
    }

    /// Send a message without waiting for a reply.
    ///
    /// Returns the priority the message was queued at, which differs from the
    /// request only for [`SendPriority::LowestPending`].
    pub fn send(
        &self,
        payload: impl Into<Bytes>,
        priority: impl Into<SendPriority>,
    ) -> Result<Priority> {
        self.shared.ensure_open()?;
        self.mux.send(
            self.id(),
            SegmentType::Data,
            payload.into(),
            priority.into(),
            Correlation::None,
        )
    }

    /// Send a request and wait for the peer's correlated reply.
    ///
    /// Fails with `ExchangeTimeout` when no reply arrives within the
    /// configured exchange timeout, and with `ConnectionLost` if the
    /// connection dies first.
    pub async fn exchange(
        &self,
        payload: impl Into<Bytes>,
        priority: impl Into<SendPriority>,
    ) -> Result<Bytes> {
        self.shared.ensure_open()?;
        let reply = self
            .mux
            .exchange(
                self.id(),
                SegmentType::Data,
                payload.into(),
                priority.into(),
                self.mux.exchange_timeout(),
            )
            .await?;
        Ok(reply.payload)
    }

    /// Answer a [`Request`] received on this conversation
    pub fn reply(&self, request: &Request, payload: impl Into<Bytes>) -> Result<()> {
        self.shared.ensure_open()?;
        self.mux
            .send(
                self.id(),
                SegmentType::Data,
                payload.into(),
                request.priority.into(),
                Correlation::Reply(request.correlation_id),
            )
            .map(|_| ())
    }

    /// Next inbound item. `None` once the conversation is released.
    ///
    /// Data is delivered here unless a consumer was installed with
    /// [`Conversation::set_consumer`].
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    /// Register the callback fired once if this conversation fails.
    pub fn on_failure<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(&JfapError) + Send + 'static,
    {
        self.shared.set_on_failure(Box::new(callback))
    }

    /// Close the conversation.
    ///
    /// The peer is asked to acknowledge; if it does not answer within the
    /// close timeout, or the transport is already unusable, the conversation
    /// is closed locally anyway. Pending exchanges fail with
    /// `AlreadyReleased`.
    pub async fn close(&self) -> Result<()> {
        let id = self.id();
        self.shared.begin_close()?;
        self.mux
            .exchanges()
            .fail_conversation(id, || JfapError::AlreadyReleased);

        let timeout = self.mux.close_ack_timeout();
        match self
            .mux
            .exchange(
                id,
                SegmentType::LogicalClose,
                Bytes::new(),
                self.priority().into(),
                timeout,
            )
            .await
        {
            Ok(_) => debug!(connection_id = %self.mux.id(), conversation_id = id, "Close acknowledged"),
            Err(JfapError::ExchangeTimeout(_)) => {
                warn!(connection_id = %self.mux.id(), conversation_id = id, ?timeout, "Close not acknowledged, closing anyway");
            },
            Err(e) => {
                debug!(connection_id = %self.mux.id(), conversation_id = id, error = %e, "Close notification not delivered");
            },
        }

        self.mux.forget_conversation(id);
        self.shared.release();
        Ok(())
    }

    /// Fetch a schema definition from the peer.
    ///
    /// `Ok(None)` when the peer does not know the id. A peer that fails to
    /// look it up yields `Internal`. Fetched ids join [`Self::schema_set`].
    pub async fn request_schema(&self, schema_id: u64) -> Result<Option<Bytes>> {
        self.shared.ensure_open()?;
        let reply = self
            .mux
            .exchange(
                self.id(),
                SegmentType::RequestSchema,
                schema::encode_request(schema_id),
                self.priority().into(),
                self.mux.exchange_timeout(),
            )
            .await?;
        let schema = SchemaReply::decode(&reply.payload)?.into_result()?;
        if schema.is_some() {
            self.shared.schema_set.lock().insert(schema_id);
        }
        Ok(schema)
    }

    /// Ids of the schemas fetched on this conversation
    pub fn schema_set(&self) -> Vec<u64> {
        self.shared.schema_set.lock().iter().copied().collect()
    }

    /// Optimized transaction codec for this connection's negotiated
    /// capabilities
    pub fn transaction_codec(&self) -> Result<TransactionFlowCodec> {
        self.shared.ensure_open()?;
        Ok(TransactionFlowCodec::new(
            &self.mux.negotiated()?.capabilities,
        ))
    }

    /// Deliver data through a read-ahead consumer instead of [`Self::recv`].
    ///
    /// Refill requests go to the peer as `READ_AHEAD_REQUEST` segments; the
    /// first one is sent immediately.
    pub fn set_consumer<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        self.shared.ensure_open()?;
        let id = self.id();
        let priority = self.priority();
        let mux = Arc::downgrade(&self.mux);

        let consumer = ReadAheadConsumer::new(
            self.mux.read_ahead_config(),
            Box::new(callback),
            Box::new(move |request: RefillRequest| {
                let Some(mux) = mux.upgrade() else { return };
                if let Err(e) = mux.send(
                    id,
                    SegmentType::ReadAheadRequest,
                    request.encode(),
                    priority.into(),
                    Correlation::None,
                ) {
                    debug!(conversation_id = id, error = %e, "Refill request not sent");
                }
            }),
        );
        self.shared.install_consumer(Arc::clone(&consumer))?;
        tokio::spawn(ReadAheadConsumer::run_stall_timer(Arc::downgrade(&consumer)));
        Ok(())
    }
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.shared.fmt(f)
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        if self.shared.state() == ConversationState::Open {
            self.mux.abandon_conversation(&self.shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_failure_callback_fires_once() {
        let (shared, _rx) = ConversationShared::new(1, Priority::LOWEST);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        shared
            .set_on_failure(Box::new(move |e| {
                assert!(e.is_fatal_to_connection());
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert!(shared.fail(&JfapError::lost("gone")));
        assert!(!shared.fail(&JfapError::lost("gone again")));
        assert!(!shared.release());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(shared.state(), ConversationState::Failed);
        assert!(matches!(shared.ensure_open(), Err(JfapError::AlreadyReleased)));
    }

    #[tokio::test]
    async fn test_release_ends_inbound_stream() {
        let (shared, mut rx) = ConversationShared::new(3, Priority::LOWEST);
        assert!(shared.deliver(Inbound::Data(Bytes::from_static(b"a"))));
        assert!(shared.release());
        assert!(!shared.deliver(Inbound::Data(Bytes::from_static(b"b"))));

        assert_eq!(rx.recv().await, Some(Inbound::Data(Bytes::from_static(b"a"))));
        assert_eq!(rx.recv().await, None);
        assert!(matches!(
            shared.set_on_failure(Box::new(|_| {})),
            Err(JfapError::AlreadyReleased)
        ));
    }

    #[test]
    fn test_close_guard() {
        let (shared, _rx) = ConversationShared::new(5, Priority::LOWEST);
        shared.begin_close().unwrap();
        assert!(matches!(shared.begin_close(), Err(JfapError::InvalidState(_))));
        assert!(matches!(shared.ensure_open(), Err(JfapError::InvalidState(_))));
        shared.release();
        assert!(matches!(shared.begin_close(), Err(JfapError::AlreadyReleased)));
    }
}
