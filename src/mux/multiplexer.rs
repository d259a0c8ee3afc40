//! The conversation multiplexer.
//!
//! One [`Multiplexer`] owns one physical stream. Three tasks serve it:
//!
//! ```text
//!                ┌──────────── reader ◄──── transport read half
//!                │  decode, reassemble, route by conversation id
//!   conversations┤
//!                │  send / exchange ──► OutboundQueue ──► writer ──► write half
//!                └──────────── heartbeat (probe idle peer, detect loss)
//! ```
//!
//! Transport failure, heartbeat loss or a framing error before any
//! conversation is identified terminates the multiplexer: every waiter gets
//! `ConnectionLost`, every live conversation moves to `Failed` and its
//! failure callback fires once, then the multiplexer's own callback fires.
//! A malformed frame addressed to a conversation fails only that
//! conversation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::conversation::{
    Conversation, ConversationShared, ConversationState, FailureCallback, Inbound, Request,
};
use super::exchange::{ExchangeCoordinator, Reply};
use super::priority::{
    OutboundQueue, Priority, QueuedFrame, SendPriority, CONTROL_TRANSPORT_PRIORITY,
};
use super::schema::{SchemaProvider, SchemaReply};
use super::stats::{ConnectionCounters, MultiplexerStats};
use crate::codec::{
    ChunkFlag, Chunker, Decoded, Frame, FrameDecoder, FrameHeader, Reassembler, SegmentType,
};
use crate::config::{Config, ReadAheadConfig};
use crate::error::{JfapError, Result};
use crate::flow::{Dispatcher, RefillRequest};
use crate::protocol::{
    CapabilityMask, ConnectionMetaData, ConnectionProperties, Direction, HandshakeKind,
    HandshakeState, HandshakeStateMachine, LocalHandshake, Negotiated, Role,
    SupportedVersionTable, Topology, TransportFacts,
};

const OPEN_ACCEPTED: u8 = 0x00;
const OPEN_REFUSED: u8 = 0x01;

const READ_BUFFER: usize = 16 * 1024;

/// Settings for one multiplexer
#[derive(Clone, Default)]
pub struct MultiplexerOptions {
    /// Connection configuration
    pub config: Config,
    /// What kind of process this side is
    pub kind: HandshakeKind,
    /// Facts about the transport the stream runs over
    pub transport: TransportFacts,
    /// Version table override (default: legacy table from config)
    pub versions: Option<SupportedVersionTable>,
    /// Capability override (default: mask from config)
    pub capabilities: Option<CapabilityMask>,
    /// Topology names flowed to the peer
    pub topology: Topology,
    /// Conversation usage type flowed to the peer
    pub usage_type: Option<u8>,
    /// Answers the peer's schema requests
    pub schema_provider: Option<Arc<dyn SchemaProvider>>,
}

impl MultiplexerOptions {
    /// Options for a given configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Set the process kind
    pub fn with_kind(mut self, kind: HandshakeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set transport facts
    pub fn with_transport(mut self, transport: TransportFacts) -> Self {
        self.transport = transport;
        self
    }

    /// Override the version table
    pub fn with_versions(mut self, versions: SupportedVersionTable) -> Self {
        self.versions = Some(versions);
        self
    }

    /// Override the capability mask
    pub fn with_capabilities(mut self, capabilities: CapabilityMask) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Set topology names
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Set conversation usage type
    pub fn with_usage_type(mut self, usage_type: u8) -> Self {
        self.usage_type = Some(usage_type);
        self
    }

    /// Install a schema provider
    pub fn with_schema_provider(mut self, provider: Arc<dyn SchemaProvider>) -> Self {
        self.schema_provider = Some(provider);
        self
    }

    fn local_handshake(&self) -> LocalHandshake {
        let mut local =
            LocalHandshake::from_config(&self.config, self.kind).with_topology(self.topology.clone());
        if let Some(versions) = &self.versions {
            local = local.with_versions(versions.clone());
        }
        if let Some(capabilities) = self.capabilities {
            local = local.with_capabilities(capabilities);
        }
        if let Some(usage_type) = self.usage_type {
            local = local.with_usage_type(usage_type);
        }
        local
    }
}

impl fmt::Debug for MultiplexerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexerOptions")
            .field("kind", &self.kind)
            .field("transport", &self.transport)
            .field("versions", &self.versions)
            .field("capabilities", &self.capabilities)
            .field("schema_provider", &self.schema_provider.is_some())
            .finish_non_exhaustive()
    }
}

/// Correlation stamped on an outbound frame
#[derive(Debug, Clone, Copy)]
pub(crate) enum Correlation {
    None,
    Request(u32),
    Reply(u32),
}

impl Correlation {
    fn apply(self, header: FrameHeader) -> FrameHeader {
        match self {
            Self::None => header,
            Self::Request(id) => header.request(id),
            Self::Reply(id) => header.reply(id),
        }
    }
}

/// How a multiplexer ends
pub(crate) enum Termination {
    /// Local close; queued frames are still written
    Closed,
    /// Failure; queued frames are discarded
    Failed(JfapError),
}

struct Established {
    negotiated: Negotiated,
    metadata: ConnectionMetaData,
    chunker: Chunker,
}

/// State shared by the multiplexer handle, its conversations and its tasks.
pub(crate) struct MuxShared {
    id: Uuid,
    role: Role,
    config: Config,
    transport: TransportFacts,
    handshake: Mutex<HandshakeStateMachine>,
    established: OnceLock<Established>,
    queue: OutboundQueue,
    exchanges: Arc<ExchangeCoordinator>,
    conversations: Mutex<HashMap<u32, Arc<ConversationShared>>>,
    /// Next id this side allocates; 0 once the id space is exhausted
    next_conversation_id: Mutex<u32>,
    incoming: Mutex<Option<mpsc::UnboundedSender<Conversation>>>,
    handshake_request: Mutex<Option<oneshot::Sender<Frame>>>,
    on_failure: Mutex<Option<FailureCallback>>,
    terminated: AtomicBool,
    dispatcher: Dispatcher,
    schema_provider: Option<Arc<dyn SchemaProvider>>,
    counters: ConnectionCounters,
    last_received: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl MuxShared {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn exchanges(&self) -> &ExchangeCoordinator {
        &self.exchanges
    }

    pub fn exchange_timeout(&self) -> Duration {
        self.config.connection.exchange_timeout()
    }

    pub fn close_ack_timeout(&self) -> Duration {
        self.config.connection.close_ack_timeout()
    }

    pub fn read_ahead_config(&self) -> &ReadAheadConfig {
        &self.config.read_ahead
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn established(&self) -> Result<&Established> {
        if self.is_terminated() {
            return Err(JfapError::AlreadyReleased);
        }
        self.established
            .get()
            .ok_or_else(|| JfapError::InvalidState("handshake has not completed".to_string()))
    }

    pub fn negotiated(&self) -> Result<&Negotiated> {
        self.established().map(|e| &e.negotiated)
    }

    fn conversation(&self, id: u32) -> Option<Arc<ConversationShared>> {
        self.conversations.lock().get(&id).cloned()
    }

    /// Queue a message, chunking it if needed.
    pub fn send(
        &self,
        conversation_id: u32,
        segment: SegmentType,
        payload: Bytes,
        priority: SendPriority,
        correlation: Correlation,
    ) -> Result<Priority> {
        let established = self.established()?;
        let limit = established.negotiated.max_message_size;
        if payload.len() as u64 > limit {
            return Err(JfapError::Usage(format!(
                "message of {} bytes exceeds the negotiated limit of {limit}",
                payload.len()
            )));
        }

        let pieces = established.chunker.split(payload);
        let chunks = pieces.len();
        let resolved = self.queue.push_data(priority, |p| {
            Ok(pieces
                .into_iter()
                .map(|(chunk, piece)| {
                    let header = FrameHeader::new(segment, p.transport(), conversation_id).chunk(chunk);
                    QueuedFrame::new(Frame::new(correlation.apply(header), piece))
                })
                .collect())
        })?;

        debug!(
            connection_id = %self.id,
            conversation_id,
            priority = resolved.value(),
            ?segment,
            chunks,
            "Queued"
        );
        Ok(resolved)
    }

    /// Send a request and wait for its correlated reply.
    pub async fn exchange(
        &self,
        conversation_id: u32,
        segment: SegmentType,
        payload: Bytes,
        priority: SendPriority,
        timeout: Duration,
    ) -> Result<Reply> {
        let waiter = self.exchanges.register(conversation_id)?;
        let correlation_id = waiter.correlation_id();
        self.send(
            conversation_id,
            segment,
            payload,
            priority,
            Correlation::Request(correlation_id),
        )?;
        debug!(connection_id = %self.id, conversation_id, correlation_id, "Exchange sent");
        waiter.wait(timeout).await
    }

    fn push_control(&self, frame: Frame) -> Result<()> {
        self.queue
            .push(CONTROL_TRANSPORT_PRIORITY, vec![QueuedFrame::new(frame)])
    }

    /// Queue a control frame and wait until the writer has written it.
    async fn push_control_and_wait(&self, frame: Frame) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.queue.push(
            CONTROL_TRANSPORT_PRIORITY,
            vec![QueuedFrame::notify_sent(frame, tx)],
        )?;
        rx.await
            .map_err(|_| JfapError::lost("transport closed before the frame was written"))
    }

    fn allocate_conversation_id(&self) -> Result<u32> {
        let mut next = self.next_conversation_id.lock();
        if *next == 0 {
            return Err(JfapError::InvalidState(
                "conversation id space exhausted".to_string(),
            ));
        }
        let id = *next;
        *next = next.checked_add(2).unwrap_or(0);
        Ok(id)
    }

    /// Drop a conversation from the table once it is closed.
    pub fn forget_conversation(&self, id: u32) {
        self.conversations.lock().remove(&id);
        self.exchanges.forget_conversation(id);
    }

    /// Release a conversation whose handle was dropped while open.
    pub fn abandon_conversation(&self, conversation: &ConversationShared) {
        let id = conversation.id();
        if !conversation.release() {
            return;
        }
        self.exchanges
            .fail_conversation(id, || JfapError::AlreadyReleased);
        self.notify_close(id, conversation.priority());
        self.forget_conversation(id);
        debug!(connection_id = %self.id, conversation_id = id, "Conversation dropped while open");
    }

    /// Best-effort close notification that expects no acknowledgement.
    fn notify_close(&self, id: u32, priority: Priority) {
        if let Err(e) = self.send(
            id,
            SegmentType::LogicalClose,
            Bytes::new(),
            priority.into(),
            Correlation::None,
        ) {
            debug!(connection_id = %self.id, conversation_id = id, error = %e, "Close notification not sent");
        }
    }

    /// Fail one conversation; the multiplexer and its other conversations
    /// are unaffected.
    fn fail_conversation(&self, conversation: &ConversationShared, error: JfapError) {
        let id = conversation.id();
        warn!(connection_id = %self.id, conversation_id = id, error = %error, "Conversation failed");
        self.conversations.lock().remove(&id);
        self.exchanges.fail_conversation(id, || error.duplicate());
        if conversation.fail(&error) {
            self.notify_close(id, conversation.priority());
        }
        self.exchanges.forget_conversation(id);
    }

    /// Take the multiplexer down. Only the first call has any effect.
    pub fn terminate(&self, how: Termination) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        let reason = match &how {
            Termination::Closed => "connection closed".to_string(),
            Termination::Failed(e) => e.to_string(),
        };
        match &how {
            Termination::Closed => self.queue.shutdown(),
            Termination::Failed(_) => self.queue.abort(),
        }
        self.exchanges.fail_all(&reason);

        {
            // Before Ready the handshake driver records its own outcome.
            let mut machine = self.handshake.lock();
            if machine.is_ready() {
                let closed = matches!(how, Termination::Closed)
                    && machine.begin_close().is_ok()
                    && machine.close_complete().is_ok();
                if !closed {
                    machine.fail();
                }
            }
        }

        let conversations: Vec<Arc<ConversationShared>> = self
            .conversations
            .lock()
            .drain()
            .map(|(_, c)| c)
            .collect();
        for conversation in &conversations {
            match &how {
                Termination::Closed => {
                    conversation.release();
                },
                Termination::Failed(e) => {
                    conversation.fail(&e.duplicate());
                },
            }
        }

        self.incoming.lock().take();
        self.handshake_request.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        match how {
            Termination::Closed => {
                info!(connection_id = %self.id, conversations = conversations.len(), "Connection closed");
            },
            Termination::Failed(e) => {
                error!(connection_id = %self.id, conversations = conversations.len(), error = %e, "Connection failed");
                let callback = self.on_failure.lock().take();
                if let Some(callback) = callback {
                    callback(&e);
                }
            },
        }
    }

    /// Initiator side of the handshake.
    ///
    /// The writer marks the request sent and the reader negotiates the reply,
    /// so the connection is established before any frame behind the reply
    /// is dispatched. This task only waits for the outcome.
    async fn initiate_handshake(&self) -> Result<ConnectionMetaData> {
        let request = self.handshake.lock().start()?;
        let waiter = self.exchanges.register(0)?;
        let header = FrameHeader::new(SegmentType::Handshake, CONTROL_TRANSPORT_PRIORITY, 0)
            .request(waiter.correlation_id());
        let outcome = match self.push_control(Frame::new(header, request)) {
            Ok(()) => waiter
                .wait(self.config.connection.handshake_timeout())
                .await
                .and_then(|_| self.metadata()),
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            self.handshake.lock().fail();
        }
        outcome
    }

    /// Reader side of the initiator handshake: negotiate the acceptor's reply
    /// and wake the connecting task.
    fn complete_handshake(&self, header: FrameHeader, payload: Bytes) {
        let outcome = {
            let mut machine = self.handshake.lock();
            // A reply proves the request left, even if the writer has not
            // recorded it yet.
            if machine.state() == HandshakeState::SendingCaps {
                let _ = machine.send_complete();
            }
            machine.process_reply(&payload).cloned()
        };
        let delivered = match outcome {
            Ok(negotiated) => {
                self.establish(negotiated);
                let reply = Reply {
                    segment: header.segment,
                    payload,
                };
                self.exchanges.resolve(0, header.correlation_id, reply)
            },
            Err(e) => self.exchanges.reject(0, header.correlation_id, e),
        };
        if !delivered {
            warn!(connection_id = %self.id, "Late handshake reply dropped");
        }
    }

    /// Acceptor side of the handshake.
    async fn answer_handshake(&self, request: oneshot::Receiver<Frame>) -> Result<ConnectionMetaData> {
        let timeout = self.config.connection.handshake_timeout();
        let frame = match tokio::time::timeout(timeout, request).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => {
                self.handshake.lock().fail();
                return Err(JfapError::lost("connection closed before the handshake"));
            },
            Err(_) => {
                self.handshake.lock().fail();
                return Err(JfapError::ExchangeTimeout(timeout));
            },
        };

        let (reply, outcome) = {
            let mut machine = self.handshake.lock();
            let reply = machine.process_request(&frame.payload)?;
            let outcome = match machine.negotiated() {
                Some(negotiated) if machine.is_ready() => Ok(negotiated.clone()),
                _ => Err(machine.take_error().unwrap_or_else(|| {
                    JfapError::NegotiationRejected("handshake did not complete".to_string())
                })),
            };
            (reply, outcome)
        };

        // Established before the reply leaves, so the initiator's first
        // frames find a ready connection.
        if let Ok(negotiated) = &outcome {
            self.establish(negotiated.clone());
        }
        let header = FrameHeader::new(SegmentType::Handshake, CONTROL_TRANSPORT_PRIORITY, 0)
            .reply(frame.header.correlation_id);
        self.push_control_and_wait(Frame::new(header, reply)).await?;

        outcome?;
        self.metadata()
    }

    fn metadata(&self) -> Result<ConnectionMetaData> {
        self.established
            .get()
            .map(|e| e.metadata.clone())
            .ok_or_else(|| JfapError::InvalidState("handshake has not completed".to_string()))
    }

    fn establish(&self, negotiated: Negotiated) {
        let metadata = ConnectionMetaData {
            connection_id: self.id,
            chain_name: self.transport.profile.chain_name().to_string(),
            direction: match self.role {
                Role::Initiator => Direction::Outbound,
                Role::Acceptor => Direction::Inbound,
            },
            secure: self.transport.profile.is_secure(),
            tunneled: self.transport.profile.is_tunneled(),
            trusted: self.transport.trusted,
            fap_level: negotiated.version.0,
            peer_kind: negotiated.peer_kind,
            peer_product_id: negotiated.peer_product_id,
            peer_product_version: negotiated.peer_product_version,
            peer_usage_type: negotiated.peer_usage_type,
            peer_topology: negotiated.peer_topology.clone(),
            established_at: Utc::now(),
        };
        let chunker = Chunker::new(
            self.config.connection.chunk_threshold,
            negotiated.max_transmission_size as usize,
        );
        info!(
            connection_id = %self.id,
            version = %negotiated.version,
            capabilities = negotiated.capabilities.local.bits(),
            peer_capabilities = negotiated.capabilities.peer.bits(),
            optimized_tx = negotiated.capabilities.optimized_tx,
            "Handshake complete"
        );
        let _ = self.established.set(Established {
            negotiated,
            metadata,
            chunker,
        });
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let Some(negotiated) = self.established.get().map(|e| &e.negotiated) else {
            return;
        };
        if negotiated.heartbeat_interval_ms == 0 {
            return;
        }
        let interval = Duration::from_millis(u64::from(negotiated.heartbeat_interval_ms));
        let timeout = Duration::from_millis(u64::from(negotiated.heartbeat_timeout_ms));
        let task = tokio::spawn(heartbeat_loop(Arc::clone(self), interval, timeout));
        self.tasks.lock().push(task);
    }

    /// Route one inbound frame.
    async fn dispatch(self: &Arc<Self>, frame: Frame, reassembler: &mut Reassembler) {
        let header = frame.header;
        debug!(
            connection_id = %self.id,
            conversation_id = header.conversation_id,
            correlation_id = header.correlation_id,
            priority = header.priority,
            segment = ?header.segment,
            len = frame.payload.len(),
            "Frame received"
        );

        if header.conversation_id == 0 {
            self.dispatch_connection(frame);
            return;
        }

        let Some(conversation) = self.conversation(header.conversation_id) else {
            self.dispatch_unknown(frame);
            return;
        };
        let id = conversation.id();

        let payload = if header.segment == SegmentType::Data || header.chunk != ChunkFlag::Whole {
            match reassembler.accept(id, header.priority, header.chunk, frame.payload) {
                Ok(Some(payload)) => payload,
                Ok(None) => return,
                Err(e) => {
                    reassembler.discard(id);
                    self.fail_conversation(&conversation, e);
                    return;
                },
            }
        } else {
            frame.payload
        };

        if header.is_reply() {
            let reply = Reply {
                segment: header.segment,
                payload,
            };
            if !self.exchanges.resolve(id, header.correlation_id, reply) {
                warn!(
                    connection_id = %self.id,
                    conversation_id = id,
                    correlation_id = header.correlation_id,
                    "Reply with no waiter dropped"
                );
            }
            return;
        }

        match header.segment {
            SegmentType::Data if header.is_request() => {
                match Priority::from_transport(header.priority) {
                    Ok(priority) => {
                        conversation.deliver(Inbound::Request(Request {
                            correlation_id: header.correlation_id,
                            priority,
                            payload,
                        }));
                    },
                    Err(e) => self.fail_conversation(&conversation, e),
                }
            },
            SegmentType::Data => match conversation.consumer() {
                Some(consumer) => {
                    consumer.on_data(payload);
                    self.dispatcher
                        .dispatch(id, Box::new(move || consumer.drain()))
                        .await;
                },
                None => {
                    conversation.deliver(Inbound::Data(payload));
                },
            },
            SegmentType::RequestSchema if header.is_request() => {
                let provider = self.schema_provider.as_deref();
                let reply = SchemaReply::answer(provider, &payload);
                if let SchemaReply::Internal(reason) = &reply {
                    warn!(connection_id = %self.id, conversation_id = id, %reason, "Schema request failed");
                }
                self.reply_on(id, header, reply.encode());
            },
            SegmentType::ReadAheadRequest => match RefillRequest::decode(&payload) {
                Ok(request) => {
                    conversation.deliver(Inbound::Refill(request));
                },
                Err(e) => self.fail_conversation(&conversation, e),
            },
            SegmentType::LogicalClose => {
                if header.is_request() {
                    self.acknowledge_close(id, header);
                }
                reassembler.discard(id);
                self.forget_conversation(id);
                self.exchanges
                    .fail_conversation(id, || JfapError::AlreadyReleased);
                conversation.release();
                debug!(connection_id = %self.id, conversation_id = id, "Conversation closed by peer");
            },
            SegmentType::LogicalCloseAck => {
                debug!(connection_id = %self.id, conversation_id = id, "Uncorrelated close acknowledgement ignored");
            },
            SegmentType::ConversationOpen if header.is_request() => {
                warn!(connection_id = %self.id, conversation_id = id, "Peer reopened a live conversation");
                self.reply_on(id, header, Bytes::from_static(&[OPEN_REFUSED]));
            },
            other => self.fail_conversation(
                &conversation,
                JfapError::Framing(format!("unexpected {other:?} segment")),
            ),
        }
    }

    /// Reply at the request's own transport priority.
    fn reply_on(&self, id: u32, request: FrameHeader, payload: Bytes) {
        self.reply_with(id, request, request.segment, payload);
    }

    fn acknowledge_close(&self, id: u32, request: FrameHeader) {
        self.reply_with(id, request, SegmentType::LogicalCloseAck, Bytes::new());
    }

    fn reply_with(&self, id: u32, request: FrameHeader, segment: SegmentType, payload: Bytes) {
        let priority = Priority::from_transport(request.priority).unwrap_or(Priority::LOWEST);
        if let Err(e) = self.send(
            id,
            segment,
            payload,
            priority.into(),
            Correlation::Reply(request.correlation_id),
        ) {
            debug!(connection_id = %self.id, conversation_id = id, error = %e, "Reply not sent");
        }
    }

    fn dispatch_connection(self: &Arc<Self>, frame: Frame) {
        let header = frame.header;
        match header.segment {
            SegmentType::Handshake if header.is_request() => {
                let slot = self.handshake_request.lock().take();
                match slot {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    },
                    None => self.terminate(Termination::Failed(JfapError::Framing(
                        "unexpected handshake request".to_string(),
                    ))),
                }
            },
            SegmentType::Handshake if header.is_reply() => {
                self.complete_handshake(header, frame.payload);
            },
            SegmentType::Heartbeat => {
                self.counters.record_heartbeat_received();
                let response = FrameHeader::new(
                    SegmentType::HeartbeatResponse,
                    CONTROL_TRANSPORT_PRIORITY,
                    0,
                )
                .reply(header.correlation_id);
                if let Err(e) = self.push_control(Frame::new(response, Bytes::new())) {
                    debug!(connection_id = %self.id, error = %e, "Heartbeat response not sent");
                }
            },
            SegmentType::HeartbeatResponse => {
                debug!(connection_id = %self.id, "Heartbeat response");
            },
            SegmentType::PhysicalClose => {
                info!(connection_id = %self.id, "Peer closed the connection");
                self.terminate(Termination::Failed(JfapError::lost(
                    "peer closed the connection",
                )));
            },
            other => self.terminate(Termination::Failed(JfapError::Framing(format!(
                "{other:?} segment is not valid at connection level"
            )))),
        }
    }

    /// Frames for conversations not in the table: peer opens, and replies or
    /// closes that raced with a local close.
    fn dispatch_unknown(self: &Arc<Self>, frame: Frame) {
        let header = frame.header;
        let id = header.conversation_id;
        match header.segment {
            SegmentType::ConversationOpen if header.is_request() => self.open_from_peer(header),
            SegmentType::LogicalClose if header.is_request() => {
                self.acknowledge_close(id, header);
            },
            _ if header.is_reply() => {
                let reply = Reply {
                    segment: header.segment,
                    payload: frame.payload,
                };
                if !self.exchanges.resolve(id, header.correlation_id, reply) {
                    warn!(connection_id = %self.id, conversation_id = id, "Reply for unknown conversation dropped");
                }
            },
            segment => {
                warn!(connection_id = %self.id, conversation_id = id, ?segment, "Frame for unknown conversation dropped");
            },
        }
    }

    fn open_from_peer(self: &Arc<Self>, header: FrameHeader) {
        let id = header.conversation_id;
        // Initiators allocate odd ids, acceptors even ones.
        let peer_parity = match self.role {
            Role::Initiator => 0,
            Role::Acceptor => 1,
        };
        let priority = Priority::from_transport(header.priority).unwrap_or(Priority::LOWEST);

        if id % 2 != peer_parity {
            warn!(connection_id = %self.id, conversation_id = id, "Conversation open with the wrong id parity refused");
            self.reply_on(id, header, Bytes::from_static(&[OPEN_REFUSED]));
            return;
        }

        let (shared, inbound) = ConversationShared::new(id, priority);
        self.conversations.lock().insert(id, Arc::clone(&shared));
        let conversation = Conversation::new(Arc::clone(&shared), Arc::clone(self), inbound);
        self.reply_on(id, header, Bytes::from_static(&[OPEN_ACCEPTED]));

        let undelivered = match self.incoming.lock().as_ref() {
            Some(tx) => tx.send(conversation).err().map(|e| e.0),
            None => Some(conversation),
        };
        match undelivered {
            None => debug!(connection_id = %self.id, conversation_id = id, "Conversation opened by peer"),
            Some(conversation) => {
                // Nobody will accept it; close it again.
                self.forget_conversation(id);
                shared.release();
                self.notify_close(id, priority);
                drop(conversation);
            },
        }
    }
}

impl fmt::Debug for MuxShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("handshake", &*self.handshake.lock())
            .field("conversations", &self.conversations.lock().len())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

async fn reader_loop<R>(shared: Arc<MuxShared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let max_payload = shared.config.connection.max_transmission_size as usize;
    let max_message = usize::try_from(shared.config.connection.max_message_size).unwrap_or(usize::MAX);
    let mut decoder = FrameDecoder::new(max_payload);
    let mut reassembler = Reassembler::new(max_message);
    let mut negotiated_limit = false;

    loop {
        decoder.buffer_mut().reserve(READ_BUFFER);
        match reader.read_buf(decoder.buffer_mut()).await {
            Ok(0) => {
                shared.terminate(Termination::Failed(JfapError::lost("transport closed")));
                return;
            },
            Ok(n) => {
                shared.counters.record_bytes_received(n);
                *shared.last_received.lock() = Instant::now();
            },
            Err(e) => {
                shared.terminate(Termination::Failed(JfapError::Io(e)));
                return;
            },
        }

        loop {
            if !negotiated_limit {
                if let Some(established) = shared.established.get() {
                    decoder.set_max_payload(established.negotiated.max_transmission_size as usize);
                    negotiated_limit = true;
                }
            }
            match decoder.next_decoded() {
                Ok(Some(Decoded::Frame(frame))) => {
                    shared.counters.record_frame_received();
                    shared.dispatch(frame, &mut reassembler).await;
                    if shared.is_terminated() {
                        return;
                    }
                },
                Ok(Some(Decoded::Malformed {
                    conversation_id,
                    error,
                })) => {
                    shared.counters.record_frame_received();
                    reassembler.discard(conversation_id);
                    match shared.conversation(conversation_id) {
                        Some(conversation) => shared.fail_conversation(&conversation, error),
                        None => {
                            warn!(connection_id = %shared.id, conversation_id, error = %error, "Malformed frame for unknown conversation dropped");
                        },
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    shared.terminate(Termination::Failed(e));
                    return;
                },
            }
        }
    }
}

async fn writer_loop<W>(shared: Arc<MuxShared>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER);
    while let Some(queued) = shared.queue.pop().await {
        buf.clear();
        if let Err(e) = queued.frame.encode_into(&mut buf) {
            warn!(connection_id = %shared.id, error = %e, "Frame not encodable, dropped");
            continue;
        }
        let written = match writer.write_all(&buf).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            shared.terminate(Termination::Failed(JfapError::Io(e)));
            break;
        }
        shared.counters.record_sent(
            buf.len(),
            queued.frame.header.segment == SegmentType::Heartbeat,
        );
        if queued.frame.header.segment == SegmentType::Handshake && queued.frame.header.is_request() {
            if let Err(e) = shared.handshake.lock().send_complete() {
                debug!(connection_id = %shared.id, error = %e, "Handshake request written late");
            }
        }
        if let Some(sent) = queued.sent {
            let _ = sent.send(());
        }
    }
    let _ = writer.shutdown().await;
}

async fn heartbeat_loop(shared: Arc<MuxShared>, interval: Duration, timeout: Duration) {
    let tick = (interval.min(timeout) / 4).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_probe: Option<Instant> = None;

    loop {
        ticker.tick().await;
        if shared.is_terminated() {
            return;
        }
        let last_received = *shared.last_received.lock();
        let idle = last_received.elapsed();

        if idle >= interval + timeout {
            shared.terminate(Termination::Failed(JfapError::lost(format!(
                "heartbeat timeout after {} ms of silence",
                idle.as_millis()
            ))));
            return;
        }

        // One probe per silent period.
        if idle >= interval && last_probe.map_or(true, |p| p < last_received) {
            let header = FrameHeader::new(SegmentType::Heartbeat, CONTROL_TRANSPORT_PRIORITY, 0);
            if shared.push_control(Frame::new(header, Bytes::new())).is_err() {
                return;
            }
            last_probe = Some(Instant::now());
            debug!(connection_id = %shared.id, idle_ms = idle.as_millis() as u64, "Heartbeat sent");
        }
    }
}

/// Terminates a multiplexer whose handshake future was dropped.
struct HandshakeGuard(Option<Arc<MuxShared>>);

impl HandshakeGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for HandshakeGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.0.take() {
            shared.terminate(Termination::Failed(JfapError::lost("handshake abandoned")));
        }
    }
}

/// One physical connection carrying many conversations.
pub struct Multiplexer {
    shared: Arc<MuxShared>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Conversation>>,
    metadata: ConnectionMetaData,
    properties: Option<ConnectionProperties>,
}

impl Multiplexer {
    /// Connect over `io` and run the initiator handshake.
    ///
    /// `properties` describe the endpoint `io` was opened to. On failure the
    /// transport is dropped and the cause returned.
    pub async fn connect<T>(
        io: T,
        properties: ConnectionProperties,
        options: MultiplexerOptions,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (shared, incoming, _) = Self::spawn(io, Role::Initiator, options);
        let guard = HandshakeGuard(Some(Arc::clone(&shared)));

        match shared.initiate_handshake().await {
            Ok(metadata) => {
                guard.disarm();
                shared.start_heartbeat();
                info!(connection_id = %shared.id, endpoint = ?properties, "Connected");
                Ok(Self {
                    shared,
                    incoming: tokio::sync::Mutex::new(incoming),
                    metadata,
                    properties: Some(properties),
                })
            },
            Err(e) => {
                shared.terminate(Termination::Failed(e.duplicate()));
                Err(e)
            },
        }
    }

    /// Accept a connection over `io` and answer the peer's handshake.
    ///
    /// A rejected handshake is reported to the peer before this returns the
    /// cause.
    pub async fn accept<T>(io: T, options: MultiplexerOptions) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (shared, incoming, request) = Self::spawn(io, Role::Acceptor, options);
        let guard = HandshakeGuard(Some(Arc::clone(&shared)));
        let request = request.ok_or_else(|| {
            JfapError::InvalidState("acceptor has no handshake slot".to_string())
        })?;

        match shared.answer_handshake(request).await {
            Ok(metadata) => {
                guard.disarm();
                shared.start_heartbeat();
                info!(connection_id = %shared.id, "Accepted");
                Ok(Self {
                    shared,
                    incoming: tokio::sync::Mutex::new(incoming),
                    metadata,
                    properties: None,
                })
            },
            Err(e) => {
                shared.terminate(Termination::Failed(e.duplicate()));
                Err(e)
            },
        }
    }

    fn spawn<T>(
        io: T,
        role: Role,
        options: MultiplexerOptions,
    ) -> (
        Arc<MuxShared>,
        mpsc::UnboundedReceiver<Conversation>,
        Option<oneshot::Receiver<Frame>>,
    )
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let local = options.local_handshake();
        let (machine, first_id) = match role {
            Role::Initiator => (HandshakeStateMachine::initiator(local), 1),
            Role::Acceptor => (HandshakeStateMachine::acceptor(local), 2),
        };
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = match role {
            Role::Acceptor => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            },
            Role::Initiator => (None, None),
        };

        let shared = Arc::new(MuxShared {
            id: Uuid::new_v4(),
            role,
            dispatcher: Dispatcher::new(options.config.dispatch.mode()),
            config: options.config,
            transport: options.transport,
            handshake: Mutex::new(machine),
            established: OnceLock::new(),
            queue: OutboundQueue::new(),
            exchanges: ExchangeCoordinator::new(),
            conversations: Mutex::new(HashMap::new()),
            next_conversation_id: Mutex::new(first_id),
            incoming: Mutex::new(Some(incoming_tx)),
            handshake_request: Mutex::new(request_tx),
            on_failure: Mutex::new(None),
            terminated: AtomicBool::new(false),
            schema_provider: options.schema_provider,
            counters: ConnectionCounters::default(),
            last_received: Mutex::new(Instant::now()),
            tasks: Mutex::new(Vec::new()),
            writer: Mutex::new(None),
        });

        let (read_half, write_half) = tokio::io::split(io);
        let writer = tokio::spawn(writer_loop(Arc::clone(&shared), write_half));
        *shared.writer.lock() = Some(writer);
        let reader = tokio::spawn(reader_loop(Arc::clone(&shared), read_half));
        shared.tasks.lock().push(reader);
        debug!(connection_id = %shared.id, ?role, "Multiplexer started");

        (shared, incoming_rx, request_rx)
    }

    /// Identity used in logs
    pub fn connection_id(&self) -> Uuid {
        self.shared.id
    }

    /// Snapshot taken when the handshake completed
    pub fn metadata(&self) -> &ConnectionMetaData {
        &self.metadata
    }

    /// Endpoint this side connected to (`None` for accepted connections)
    pub fn properties(&self) -> Option<&ConnectionProperties> {
        self.properties.as_ref()
    }

    /// Negotiated values
    pub fn negotiated(&self) -> Result<&Negotiated> {
        self.shared.negotiated()
    }

    /// Handshake lifecycle state
    pub fn state(&self) -> HandshakeState {
        self.shared.handshake.lock().state()
    }

    /// Whether the multiplexer has closed or failed
    pub fn is_released(&self) -> bool {
        self.shared.is_terminated()
    }

    /// Open a conversation; the peer sees it from
    /// [`accept_conversation`](Self::accept_conversation).
    pub async fn open_conversation(&self, priority: Priority) -> Result<Conversation> {
        self.shared.established()?;
        let id = self.shared.allocate_conversation_id()?;
        let (shared, inbound) = ConversationShared::new(id, priority);
        self.shared
            .conversations
            .lock()
            .insert(id, Arc::clone(&shared));
        let conversation = Conversation::new(Arc::clone(&shared), Arc::clone(&self.shared), inbound);

        let reply = self
            .shared
            .exchange(
                id,
                SegmentType::ConversationOpen,
                Bytes::new(),
                priority.into(),
                self.shared.exchange_timeout(),
            )
            .await
            .and_then(|reply| match reply.payload.first() {
                Some(&OPEN_ACCEPTED) => Ok(()),
                _ => Err(JfapError::InvalidState(format!(
                    "peer refused conversation {id}"
                ))),
            });

        match reply {
            Ok(()) => {
                debug!(connection_id = %self.shared.id, conversation_id = id, ?priority, "Conversation opened");
                Ok(conversation)
            },
            Err(e) => {
                self.shared.forget_conversation(id);
                shared.release();
                Err(e)
            },
        }
    }

    /// Next conversation opened by the peer. `None` once the multiplexer is
    /// released.
    pub async fn accept_conversation(&self) -> Option<Conversation> {
        self.incoming.lock().await.recv().await
    }

    /// Register the callback fired once if the multiplexer fails.
    pub fn on_failure<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(&JfapError) + Send + 'static,
    {
        if self.shared.is_terminated() {
            return Err(JfapError::AlreadyReleased);
        }
        *self.shared.on_failure.lock() = Some(Box::new(callback));
        Ok(())
    }

    /// Close the connection.
    ///
    /// The peer is notified and live conversations are released. Frames
    /// already queued are written, waiting at most the close timeout.
    pub async fn close(&self) -> Result<()> {
        if self.shared.is_terminated() {
            return Err(JfapError::AlreadyReleased);
        }
        let notice = FrameHeader::new(SegmentType::PhysicalClose, CONTROL_TRANSPORT_PRIORITY, 0);
        if let Err(e) = self.shared.push_control(Frame::new(notice, Bytes::new())) {
            debug!(connection_id = %self.shared.id, error = %e, "Close notice not sent");
        }
        self.shared.terminate(Termination::Closed);

        let writer = self.shared.writer.lock().take();
        if let Some(mut writer) = writer {
            let timeout = self.shared.close_ack_timeout();
            if tokio::time::timeout(timeout, &mut writer).await.is_err() {
                warn!(connection_id = %self.shared.id, ?timeout, "Writer did not drain before the close timeout");
                writer.abort();
            }
        }
        Ok(())
    }

    /// Connection counters
    pub fn stats(&self) -> MultiplexerStats {
        let live = self
            .shared
            .conversations
            .lock()
            .values()
            .filter(|c| c.state() == ConversationState::Open)
            .count();
        self.shared
            .counters
            .snapshot(live, self.shared.exchanges.outstanding())
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.shared.fmt(f)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if self.shared.is_terminated() {
            return;
        }
        let notice = FrameHeader::new(SegmentType::PhysicalClose, CONTROL_TRANSPORT_PRIORITY, 0);
        let _ = self.shared.push_control(Frame::new(notice, Bytes::new()));
        self.shared.terminate(Termination::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (Multiplexer, Multiplexer) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(Multiplexer::accept(server_io, MultiplexerOptions::default()));
        let client = Multiplexer::connect(
            client_io,
            ConnectionProperties::endpoint("localhost", 9000),
            MultiplexerOptions::default(),
        )
        .await
        .unwrap();
        (client, server.await.unwrap().unwrap())
    }

    #[tokio::test]
    async fn test_conversation_ids_by_role() {
        let (client, server) = pair().await;
        let a = client.open_conversation(Priority::LOWEST).await.unwrap();
        let b = client.open_conversation(Priority::LOWEST).await.unwrap();
        let c = server.open_conversation(Priority::LOWEST).await.unwrap();
        assert_eq!((a.id(), b.id(), c.id()), (1, 3, 2));

        let seen = server.accept_conversation().await.unwrap();
        assert_eq!(seen.id(), 1);
    }

    #[tokio::test]
    async fn test_allocator_exhaustion() {
        let (client, _server) = pair().await;
        *client.shared.next_conversation_id.lock() = u32::MAX;
        assert_eq!(client.shared.allocate_conversation_id().unwrap(), u32::MAX);
        assert!(matches!(
            client.shared.allocate_conversation_id(),
            Err(JfapError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata_direction() {
        let (client, server) = pair().await;
        assert_eq!(client.metadata().direction, Direction::Outbound);
        assert_eq!(server.metadata().direction, Direction::Inbound);
        assert_eq!(client.metadata().fap_level, 20);
        assert_eq!(client.state(), HandshakeState::Ready);
        assert!(server.properties().is_none());
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let (client, _server) = pair().await;
        let conversation = client.open_conversation(Priority::LOWEST).await.unwrap();
        client.close().await.unwrap();
        assert_eq!(conversation.state(), ConversationState::Closed);
        assert!(client.is_released());
        assert!(matches!(client.close().await, Err(JfapError::AlreadyReleased)));
        assert!(matches!(
            client.open_conversation(Priority::LOWEST).await,
            Err(JfapError::AlreadyReleased)
        ));
    }
}
