mod command;
mod pooled;
mod stream_description;

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use derive_where::derive_where;
use tokio::{
    io::{AsyncReadExt, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot, Mutex},
};

use crate::{
    client::options::ServerAddress,
    error::{Error, ErrorKind, Result},
    event::{cmap::CmapEvent, EventEmitter},
    runtime::{self, AsyncStream, StreamOptions},
    wire::{Header, Message, MessageFlags, OpCode, OpQuery, OpReply},
};

pub(crate) use command::{Command, RawCommandResponse};
pub(crate) use pooled::{PinnedConnectionHandle, PooledConnection};
pub(crate) use stream_description::StreamDescription;

use super::options::ConnectionOptions;

/// User-facing information about a connection to the database.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// A driver-generated identifier that uniquely identifies the connection within its pool.
    pub id: u32,

    /// A server-generated identifier that uniquely identifies the connection, reported by
    /// servers that support it.
    pub server_id: Option<i64>,

    /// The address that the connection is connected to.
    pub address: ServerAddress,
}

/// A connection that has been created but not yet established. Holds the identity the eventual
/// connection will carry.
#[derive(Clone, Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,
    pub(crate) event_emitter: EventEmitter<CmapEvent>,
    pub(crate) time_created: Instant,
}

/// An established wire connection to one server, exclusively owned by its current holder.
///
/// Sends and receives take `&self`: concurrent sends are serialized by a send lock, concurrent
/// receives by a receive lock, and inbound replies are routed to the outstanding request whose
/// id matches `response_to`.
#[derive_where(Debug)]
pub(crate) struct Connection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,

    /// The server-reported id for this connection, from the handshake.
    pub(crate) server_id: Option<i64>,

    time_created: Instant,

    /// When the connection was last checked into the pool; used for idleness detection.
    pub(super) ready_and_available_time: Option<Instant>,

    /// The description derived from the connection handshake.
    stream_description: Option<StreamDescription>,

    socket_timeout: Option<Duration>,

    /// When pinned, checked-in state routes back to the pinning holder instead of the pool.
    pinned_sender: Option<mpsc::Sender<Connection>>,

    #[derive_where(skip)]
    pub(super) event_emitter: EventEmitter<CmapEvent>,

    wire: Wire,
}

/// The split stream halves and correlation state shared by all in-flight operations on one
/// connection.
#[derive_where(Debug)]
struct Wire {
    #[derive_where(skip)]
    writer: Mutex<WriteHalf<AsyncStream>>,
    #[derive_where(skip)]
    reader: Mutex<ReadHalf<AsyncStream>>,
    /// Outstanding requests awaiting a correlated reply, keyed by request id.
    #[derive_where(skip)]
    pending: std::sync::Mutex<HashMap<i32, oneshot::Sender<InboundMessage>>>,
    /// Set when an I/O or protocol parse failure has made the connection unusable.
    errored: AtomicBool,
    /// Set when the last reply carried `moreToCome`; the next receive reads without a send.
    more_to_come: AtomicBool,
}

/// One framed inbound message, not yet parsed beyond its header.
#[derive(Debug)]
struct InboundMessage {
    header: Header,
    body: Vec<u8>,
}

impl InboundMessage {
    fn into_message(self) -> Result<Message> {
        Message::parse(self.header, &self.body)
    }

    fn into_reply(self) -> Result<OpReply> {
        OpReply::parse(self.header, &self.body)
    }
}

impl Connection {
    /// Establish the socket for a pending pool connection.
    pub(crate) async fn connect_pending(
        pending: &PendingConnection,
        options: &ConnectionOptions,
    ) -> Result<Self> {
        let stream = AsyncStream::connect(StreamOptions {
            address: pending.address.clone(),
            connect_timeout: options.connect_timeout,
            #[cfg(feature = "rustls-tls")]
            tls_config: options
                .tls_options
                .as_ref()
                .map(runtime::TlsConfig::new)
                .transpose()?,
        })
        .await?;
        Ok(Self::new(
            pending.id,
            pending.address.clone(),
            pending.generation,
            pending.time_created,
            stream,
            options.socket_timeout,
            pending.event_emitter.clone(),
        ))
    }

    /// Establish a monitoring connection; monitoring connections have id 0 and do not
    /// participate in any pool.
    pub(crate) async fn connect_monitoring(
        address: ServerAddress,
        options: &ConnectionOptions,
    ) -> Result<Self> {
        let stream = AsyncStream::connect(StreamOptions {
            address: address.clone(),
            connect_timeout: options.connect_timeout,
            #[cfg(feature = "rustls-tls")]
            tls_config: options
                .tls_options
                .as_ref()
                .map(runtime::TlsConfig::new)
                .transpose()?,
        })
        .await?;
        Ok(Self::new(
            0,
            address,
            0,
            Instant::now(),
            stream,
            options.socket_timeout,
            EventEmitter::disabled(),
        ))
    }

    fn new(
        id: u32,
        address: ServerAddress,
        generation: u32,
        time_created: Instant,
        stream: AsyncStream,
        socket_timeout: Option<Duration>,
        event_emitter: EventEmitter<CmapEvent>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id,
            address,
            generation,
            server_id: None,
            time_created,
            ready_and_available_time: None,
            stream_description: None,
            socket_timeout,
            pinned_sender: None,
            event_emitter,
            wire: Wire {
                writer: Mutex::new(writer),
                reader: Mutex::new(reader),
                pending: std::sync::Mutex::new(HashMap::new()),
                errored: AtomicBool::new(false),
                more_to_come: AtomicBool::new(false),
            },
        }
    }

    /// A connection over a sink stream, for tests that exercise pool behavior without sockets.
    #[cfg(test)]
    pub(crate) fn new_testing(id: u32, address: ServerAddress, generation: u32) -> Self {
        let mut conn = Self::new(
            id,
            address,
            generation,
            Instant::now(),
            AsyncStream::Null,
            None,
            EventEmitter::disabled(),
        );
        conn.stream_description = Some(StreamDescription::new_testing());
        conn
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Send a command message and await its correlated reply.
    pub(crate) async fn send_message(&self, mut message: Message) -> Result<Message> {
        self.ensure_usable()?;
        let request_id = crate::wire::next_request_id();
        message.request_id = Some(request_id);
        let receiver = self.register(request_id);

        {
            let mut writer = self.wire.writer.lock().await;
            let write_result = message
                .write_to(&mut *writer, self.max_message_size())
                .await;
            if let Err(e) = write_result {
                self.unregister(request_id);
                if e.is_network_error() {
                    self.mark_errored();
                }
                return Err(e);
            }
        }

        let inbound = self.receive_correlated(request_id, receiver).await?;
        self.parse_fatal(inbound.into_message())
    }

    /// Send a legacy OP_QUERY and await its OP_REPLY.
    pub(crate) async fn send_op_query(&self, query: OpQuery) -> Result<OpReply> {
        self.ensure_usable()?;
        let request_id = crate::wire::next_request_id();
        let receiver = self.register(request_id);
        {
            let mut writer = self.wire.writer.lock().await;
            if let Err(e) = query.write_to(&mut *writer, request_id).await {
                self.unregister(request_id);
                if e.is_network_error() {
                    self.mark_errored();
                }
                return Err(e);
            }
        }
        let inbound = self.receive_correlated(request_id, receiver).await?;
        self.parse_fatal(inbound.into_reply())
    }

    /// Execute a command and return the server's reply.
    pub(crate) async fn send_command(&self, command: Command) -> Result<RawCommandResponse> {
        let message = command.into_message();
        let reply = self.send_message(message).await?;
        Ok(RawCommandResponse::new(
            self.address.clone(),
            reply.into_body(),
        ))
    }

    /// Receive another reply without sending; only valid after a reply that carried
    /// `moreToCome`.
    pub(crate) async fn receive_exhaust_message(&self) -> Result<Message> {
        if !self.is_streaming() {
            return Err(Error::internal(
                "attempted exhaust receive on a connection with no pending stream",
            ));
        }
        self.ensure_usable()?;
        let mut reader = self.wire.reader.lock().await;
        let inbound = match self.read_inbound(&mut reader).await {
            Ok(inbound) => inbound,
            Err(e) => {
                self.mark_errored();
                return Err(e);
            }
        };
        self.parse_fatal(inbound.into_message())
    }

    /// Whether the previous reply carried `moreToCome`.
    pub(crate) fn is_streaming(&self) -> bool {
        self.wire.more_to_come.load(Ordering::SeqCst)
    }

    /// Whether this connection has seen an I/O or protocol failure and must be discarded.
    pub(crate) fn has_errored(&self) -> bool {
        self.wire.errored.load(Ordering::SeqCst)
    }

    /// Gets the connection's StreamDescription.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            Error::internal("stream description not available on unhandshaken connection")
        })
    }

    pub(crate) fn set_stream_description(&mut self, description: StreamDescription) {
        self.stream_description = Some(description);
    }

    /// Checks if the connection is idle.
    pub(super) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        self.ready_and_available_time
            .and_then(|ready_and_available_time| {
                max_idle_time.map(|max_idle_time| {
                    Instant::now().duration_since(ready_and_available_time) >= max_idle_time
                })
            })
            .unwrap_or(false)
    }

    /// Checks if the connection has outlived the configured maximum lifetime.
    pub(super) fn is_expired(&self, max_life_time: Option<Duration>) -> bool {
        max_life_time
            .map(|max| Instant::now().duration_since(self.time_created) >= max)
            .unwrap_or(false)
    }

    /// Checks if the connection is stale with respect to the pool's current generation.
    pub(super) fn is_stale(&self, current_generation: u32) -> bool {
        self.generation != current_generation
    }

    pub(crate) fn time_created(&self) -> Instant {
        self.time_created
    }

    /// Helper to mark the time that the connection was checked into the pool.
    pub(super) fn mark_as_available(&mut self) {
        self.ready_and_available_time = Some(Instant::now());
    }

    pub(super) fn mark_as_in_use(&mut self) {
        self.ready_and_available_time = None;
    }

    /// Whether this connection is pinned to a cursor or transaction.
    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned_sender.is_some()
    }

    /// Pin the connection: while the returned handle is alive, checked-in state routes back to
    /// it rather than to the pool's idle set.
    pub(crate) fn pin(&mut self) -> Result<PinnedConnectionHandle> {
        if self.pinned_sender.is_some() {
            return Err(Error::internal(format!(
                "cannot pin an already-pinned connection (id = {})",
                self.id
            )));
        }
        let (sender, receiver) = mpsc::channel(1);
        self.pinned_sender = Some(sender);
        Ok(PinnedConnectionHandle::new(self.id, receiver))
    }

    pub(super) fn take_pinned_sender(&mut self) -> Option<mpsc::Sender<Connection>> {
        self.pinned_sender.take()
    }

    pub(super) fn pinned_sender(&self) -> Option<&mpsc::Sender<Connection>> {
        self.pinned_sender.as_ref()
    }

    /// Close the connection, emitting a closed event with the given reason.
    pub(super) fn close_and_drop(self, reason: crate::event::cmap::ConnectionClosedReason) {
        let event_emitter = self.event_emitter.clone();
        let address = self.address.clone();
        let id = self.id;
        drop(self);
        event_emitter.emit(|| CmapEvent::ConnectionClosed {
            address,
            connection_id: id,
            reason,
        });
    }

    /// A body that fails to parse is fatal for the connection.
    fn parse_fatal<T>(&self, parsed: Result<T>) -> Result<T> {
        if parsed.is_err() {
            self.mark_errored();
        }
        parsed
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.has_errored() {
            return Err(socket_closed_error());
        }
        Ok(())
    }

    fn max_message_size(&self) -> Option<usize> {
        self.stream_description
            .as_ref()
            .map(|sd| sd.max_message_size_bytes as usize)
    }

    fn register(&self, request_id: i32) -> oneshot::Receiver<InboundMessage> {
        let (sender, receiver) = oneshot::channel();
        self.wire
            .pending
            .lock()
            .unwrap()
            .insert(request_id, sender);
        receiver
    }

    fn unregister(&self, request_id: i32) {
        self.wire.pending.lock().unwrap().remove(&request_id);
    }

    /// Mark the connection failed and wake every outstanding waiter with a socket error (their
    /// senders are dropped, which surfaces as a closed-channel receive).
    fn mark_errored(&self) {
        self.wire.errored.store(true, Ordering::SeqCst);
        self.wire.pending.lock().unwrap().clear();
    }

    /// Wait for the reply correlated with `request_id`. Whichever waiter holds the receive lock
    /// reads frames and routes them to the matching outstanding request; replies whose waiter
    /// has gone away are dropped.
    async fn receive_correlated(
        &self,
        request_id: i32,
        mut receiver: oneshot::Receiver<InboundMessage>,
    ) -> Result<InboundMessage> {
        loop {
            tokio::select! {
                biased;

                routed = &mut receiver => {
                    return routed.map_err(|_| socket_closed_error());
                }
                mut reader = self.wire.reader.lock() => {
                    // Our reply may have been routed while we waited for the lock.
                    match receiver.try_recv() {
                        Ok(inbound) => return Ok(inbound),
                        Err(oneshot::error::TryRecvError::Closed) => {
                            return Err(socket_closed_error())
                        }
                        Err(oneshot::error::TryRecvError::Empty) => {}
                    }
                    let inbound = match self.read_inbound(&mut reader).await {
                        Ok(inbound) => inbound,
                        Err(e) => {
                            self.mark_errored();
                            self.unregister(request_id);
                            return Err(e);
                        }
                    };
                    if inbound.header.response_to == request_id {
                        self.unregister(request_id);
                        return Ok(inbound);
                    }
                    self.route(inbound);
                }
            }
        }
    }

    /// Read one framed message off the stream, applying the socket timeout and updating the
    /// exhaust flag.
    async fn read_inbound(&self, reader: &mut ReadHalf<AsyncStream>) -> Result<InboundMessage> {
        let read = async {
            let header = Header::read_from(reader).await?;
            let body_len = header.length as usize;
            if header.length < Header::LENGTH as i32 {
                return Err(Error::invalid_response(format!(
                    "impossible message length {}",
                    header.length
                )));
            }
            let mut body = vec![0u8; body_len - Header::LENGTH];
            reader.read_exact(&mut body).await?;
            Ok(InboundMessage { header, body })
        };
        let inbound: InboundMessage = match self.socket_timeout {
            Some(timeout) => runtime::timeout(timeout, read).await??,
            None => read.await?,
        };
        tracing::trace!(
            connection_id = self.id,
            request_id = inbound.header.request_id,
            response_to = inbound.header.response_to,
            length = inbound.header.length,
            "received server message"
        );

        let more_to_come = inbound.header.op_code == OpCode::Message
            && inbound.body.len() >= 4
            && MessageFlags::from_bits_truncate(u32::from_le_bytes(
                inbound.body[..4].try_into().unwrap(),
            ))
            .contains(MessageFlags::MORE_TO_COME);
        self.wire
            .more_to_come
            .store(more_to_come, Ordering::SeqCst);

        Ok(inbound)
    }

    /// Hand an inbound message to the outstanding request it answers.
    fn route(&self, inbound: InboundMessage) {
        let sender = self
            .wire
            .pending
            .lock()
            .unwrap()
            .remove(&inbound.header.response_to);
        if let Some(sender) = sender {
            // The waiter may have timed out; its reply is discarded.
            let _: std::result::Result<_, _> = sender.send(inbound);
        }
    }
}

fn socket_closed_error() -> Error {
    ErrorKind::from(std::io::ErrorKind::ConnectionAborted).into()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expiration_uses_creation_time() {
        let conn = Connection::new_testing(1, ServerAddress::default(), 0);
        assert!(!conn.is_expired(None));
        assert!(!conn.is_expired(Some(Duration::from_secs(60))));
        assert!(conn.is_expired(Some(Duration::from_nanos(1))));
    }

    #[test]
    fn idleness_requires_having_been_available() {
        let mut conn = Connection::new_testing(1, ServerAddress::default(), 0);
        assert!(!conn.is_idle(Some(Duration::from_nanos(1))));
        conn.mark_as_available();
        assert!(conn.is_idle(Some(Duration::from_nanos(1))));
        assert!(!conn.is_idle(None));
    }

    #[test]
    fn staleness_compares_generations() {
        let conn = Connection::new_testing(1, ServerAddress::default(), 2);
        assert!(!conn.is_stale(2));
        assert!(conn.is_stale(3));
    }
}
