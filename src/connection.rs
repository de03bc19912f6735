//! Per-peer connection actor.
//!
//! A [`Connection`] owns one bidirectional transport to a single remote
//! party together with its [`MultiChannelQueue`]. All queue manipulation,
//! state transitions, and I/O completions run on the actor task driven by
//! [`Connection::run`], one activation at a time; other tasks post work
//! through a cloneable [`ConnectionHandle`]. The write side keeps exactly
//! one buffer in flight (the `is_sending` latch), popping the next
//! eligible message only after the previous write completes.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    io, mem,
    sync::Arc,
};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{self, TcpStream},
    sync::{mpsc, oneshot, watch},
};
use tokio_util::{
    codec::{Encoder, FramedRead},
    sync::CancellationToken,
};
use tracing::{debug, warn};

use crate::{
    channel::ConnectionStatus,
    codec::{self, MessageCodec},
    config::NetConfig,
    control::{ControlEntry, ControlRecord},
    error::NetError,
    hooks::NetworkHooks,
    message::{InstanceId, MessageDesc, QueryId},
    metrics::{self, Direction},
    queue::MultiChannelQueue,
    queue_kind::MessageQueueType,
};

/// Lifecycle of a connection's transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; the initial state and the terminal one after any
    /// disconnect.
    NotConnected,
    /// Resolution or dialling is underway.
    ConnectInProgress,
    /// The transport is established and the pipelines may run.
    Connected,
}

/// Callback fired when a connection carrying the query tears down.
///
/// Invoked at most once, on the actor task, during teardown. It must not
/// block; typically it posts an abort to the query's own executor.
pub type DisconnectHandler = Box<dyn FnOnce(QueryId) + Send + 'static>;

/// Work posted onto the actor, plus internal completion events.
enum Command {
    Send {
        msg: MessageDesc,
        mqt: MessageQueueType,
        reply: oneshot::Sender<Result<(), NetError>>,
    },
    AttachQuery {
        query: QueryId,
        handler: DisconnectHandler,
    },
    DetachQuery {
        query: QueryId,
    },
    PublishReceiveState {
        mqt: MessageQueueType,
    },
    SendComplete {
        result: io::Result<()>,
    },
}

/// Outcome of one actor activation source.
enum Event {
    Shutdown,
    Command(Option<Command>),
    Frame(Option<Result<MessageDesc, io::Error>>),
}

/// Cloneable front door to a connection actor.
///
/// Handles stay valid across the connection's whole life; once the actor
/// terminates every operation reports [`NetError::Closed`].
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    /// Queue `msg` for delivery on the channel for `mqt`.
    ///
    /// Resolves once the actor has accepted or rejected the push, not when
    /// the message reaches the wire. Overflow outcomes are recoverable;
    /// the caller decides whether to retry, drop, or fail upstream.
    ///
    /// # Errors
    ///
    /// [`NetError::OverflowSender`] or [`NetError::OverflowReceiver`] when
    /// the respective queue bound is hit; [`NetError::Closed`] when the
    /// actor has terminated.
    pub async fn send_message(
        &self,
        msg: MessageDesc,
        mqt: MessageQueueType,
    ) -> Result<(), NetError> {
        let (reply, outcome) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send { msg, mqt, reply })
            .map_err(|_| NetError::Closed)?;
        outcome.await.map_err(|_| NetError::Closed)?
    }

    /// Register a query with a handler fired if the connection tears down.
    ///
    /// # Errors
    ///
    /// [`NetError::Closed`] when the actor has terminated.
    pub fn attach_query(&self, query: QueryId, handler: DisconnectHandler) -> Result<(), NetError> {
        self.cmd_tx
            .send(Command::AttachQuery { query, handler })
            .map_err(|_| NetError::Closed)
    }

    /// Remove a query registration; its handler will no longer fire.
    ///
    /// # Errors
    ///
    /// [`NetError::Closed`] when the actor has terminated.
    pub fn detach_query(&self, query: QueryId) -> Result<(), NetError> {
        self.cmd_tx
            .send(Command::DetachQuery { query })
            .map_err(|_| NetError::Closed)
    }

    /// Note that the local receive view for `mqt` changed; the actor folds
    /// the update into the next outbound control frame.
    ///
    /// # Errors
    ///
    /// [`NetError::Closed`] when the actor has terminated.
    pub fn publish_receive_state(&self, mqt: MessageQueueType) -> Result<(), NetError> {
        self.cmd_tx
            .send(Command::PublishReceiveState { mqt })
            .map_err(|_| NetError::Closed)
    }

    /// Request disconnection. Idempotent; queued messages are aborted.
    pub fn disconnect(&self) { self.shutdown.cancel(); }

    /// Current state of the connection.
    #[must_use]
    pub fn state(&self) -> ConnectionState { *self.state.borrow() }

    /// Whether the transport is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool { self.state() == ConnectionState::Connected }
}

/// One per-peer connection: transport, send queue, and state machine.
pub struct Connection<S> {
    cfg: Arc<NetConfig>,
    source_instance: InstanceId,
    peer_instance: InstanceId,
    hooks: Box<dyn NetworkHooks>,
    queue: MultiChannelQueue,
    attached_queries: HashMap<QueryId, DisconnectHandler>,
    statuses_to_publish: BTreeMap<MessageQueueType, ConnectionStatus>,
    pending_control: BTreeSet<MessageQueueType>,
    is_sending: bool,
    aborted: bool,
    log_connect_errors: bool,
    state_tx: watch::Sender<ConnectionState>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    write_tx: Option<mpsc::Sender<Bytes>>,
    shutdown: CancellationToken,
    transport: Option<S>,
}

impl<S> Connection<S> {
    /// Create a connection to `peer_instance` in the `NotConnected` state.
    ///
    /// The network manager owns the returned connection; the handle is the
    /// cloneable surface everything else talks through.
    ///
    /// # Errors
    ///
    /// [`NetError::SystemTime`] if the generation identifier cannot be
    /// minted.
    pub fn new(
        hooks: Box<dyn NetworkHooks>,
        cfg: Arc<NetConfig>,
        source_instance: InstanceId,
        peer_instance: InstanceId,
    ) -> Result<(Self, ConnectionHandle), NetError> {
        let queue = MultiChannelQueue::new(peer_instance, Arc::clone(&cfg))?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::NotConnected);
        let shutdown = CancellationToken::new();
        let handle = ConnectionHandle {
            cmd_tx: cmd_tx.clone(),
            shutdown: shutdown.clone(),
            state: state_rx,
        };
        let connection = Self {
            cfg,
            source_instance,
            peer_instance,
            hooks,
            queue,
            attached_queries: HashMap::new(),
            statuses_to_publish: BTreeMap::new(),
            pending_control: BTreeSet::new(),
            is_sending: false,
            aborted: false,
            log_connect_errors: true,
            state_tx,
            cmd_tx,
            cmd_rx,
            write_tx: None,
            shutdown,
            transport: None,
        };
        Ok((connection, handle))
    }

    /// Current state of the connection.
    #[must_use]
    pub fn state(&self) -> ConnectionState { *self.state_tx.borrow() }

    /// Whether the transport is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool { self.state() == ConnectionState::Connected }

    /// Whether a socket write is currently outstanding.
    #[must_use]
    pub const fn is_sending(&self) -> bool { self.is_sending }

    /// Available send space for `mqt`, as seen by the send queue.
    #[must_use]
    pub fn available(&self, mqt: MessageQueueType) -> u64 { self.queue.available(mqt) }

    /// Exchange send queues with another connection to the same peer, so
    /// messages queued for a previous incarnation ride the new transport.
    pub fn swap_queue(&mut self, other: &mut Self) { self.queue.swap(&mut other.queue); }

    /// Disconnect and abort queued messages.
    ///
    /// While the actor is running, use [`ConnectionHandle::disconnect`]
    /// instead; it performs the same teardown on the actor task.
    pub fn disconnect(&mut self) {
        self.transport = None;
        self.disconnect_internal(None);
    }

    fn on_command(&mut self, cmd: Command) -> Result<(), NetError> {
        match cmd {
            Command::Send { msg, mqt, reply } => {
                let outcome = match self.queue.push_back(mqt, msg) {
                    Ok(status) => {
                        self.stage_status(status);
                        Ok(())
                    }
                    Err(err) => Err(err),
                };
                let pushed = outcome.is_ok();
                let _ = reply.send(outcome);
                if pushed {
                    self.push_next_message()?;
                }
            }
            Command::AttachQuery { query, handler } => {
                self.attached_queries.insert(query, handler);
            }
            Command::DetachQuery { query } => {
                self.attached_queries.remove(&query);
            }
            Command::PublishReceiveState { mqt } => {
                self.pending_control.insert(mqt);
                self.push_next_message()?;
            }
            Command::SendComplete { result } => {
                self.is_sending = false;
                result?;
                self.push_next_message()?;
            }
        }
        self.flush_statuses();
        Ok(())
    }

    fn on_frame(&mut self, frame: Option<Result<MessageDesc, io::Error>>) -> Result<(), NetError> {
        let msg = match frame {
            None => {
                return Err(NetError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                )));
            }
            Some(Err(err)) => return Err(Self::fatal_from_io(err)),
            Some(Ok(msg)) => msg,
        };
        if msg.message_id().is_control() {
            metrics::inc_control_frames(Direction::Inbound);
            self.apply_control(&msg)?;
            // A credit update may have made a blocked channel eligible.
            self.push_next_message()?;
        } else {
            self.hooks.on_data_message(self.peer_instance, msg);
        }
        self.flush_statuses();
        Ok(())
    }

    fn apply_control(&mut self, msg: &MessageDesc) -> Result<(), NetError> {
        let record = ControlRecord::from_record(msg.record())?;
        for entry in record.entries {
            // The peer wrote the tuple from its own perspective; its
            // `local_*` values are our `remote_*` inputs and vice versa.
            let status = self.queue.set_remote_state(
                entry.mqt,
                entry.remote_size,
                entry.remote_gen_id,
                entry.local_gen_id,
                entry.remote_seq_num,
                entry.local_seq_num,
            )?;
            self.stage_status(status);
        }
        Ok(())
    }

    /// Advance the write pipeline: at most one message goes to the writer
    /// and only when no other write is outstanding. Runs after every
    /// successful push, credit update, and send completion.
    fn push_next_message(&mut self) -> Result<(), NetError> {
        if self.is_sending {
            return Ok(());
        }
        let Some(write_tx) = self.write_tx.clone() else {
            // Transport not up yet; sends stay queued.
            return Ok(());
        };
        let (mut next, status) = self.queue.pop_front();
        self.stage_status(status);
        if next.is_none() && !self.pending_control.is_empty() {
            // Nothing eligible: the wire is free for the flow-control
            // updates we owe the peer. The control message travels the
            // unthrottled channel like any other.
            let control = self.build_control_record().into_message()?;
            match self.queue.push_back(MessageQueueType::None, control) {
                Ok(status) => {
                    self.pending_control.clear();
                    metrics::inc_control_frames(Direction::Outbound);
                    self.stage_status(status);
                    let (msg, status) = self.queue.pop_front();
                    self.stage_status(status);
                    next = msg;
                }
                // Unthrottled channel backed up; retry when it drains.
                Err(err) if err.is_overflow() => {}
                Err(err) => return Err(err),
            }
        }
        let Some(msg) = next else { return Ok(()) };
        let buf = self.encode(msg)?;
        if write_tx.try_send(buf).is_err() {
            return Err(NetError::Closed);
        }
        self.is_sending = true;
        metrics::inc_messages_sent();
        Ok(())
    }

    fn build_control_record(&self) -> ControlRecord {
        let mut record = ControlRecord::default();
        for &mqt in &self.pending_control {
            record.push(ControlEntry {
                mqt,
                remote_size: self.hooks.advertised_capacity(mqt).max(1),
                local_gen_id: self.queue.local_gen_id(),
                remote_gen_id: self.queue.remote_gen_id(),
                local_seq_num: self.queue.local_seq_num(mqt),
                remote_seq_num: self.queue.remote_seq_num(mqt),
            });
        }
        record
    }

    fn encode(&self, msg: MessageDesc) -> Result<Bytes, NetError> {
        let mut codec = MessageCodec::new(&self.cfg);
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).map_err(Self::fatal_from_io)?;
        Ok(buf.freeze())
    }

    /// Classify a pipeline I/O error into the crate taxonomy.
    fn fatal_from_io(err: io::Error) -> NetError {
        if let Some(malformed) = codec::as_malformed(&err) {
            return NetError::Malformed(malformed.clone());
        }
        NetError::Transport(err)
    }

    fn stage_status(&mut self, status: Option<ConnectionStatus>) {
        if let Some(status) = status {
            self.statuses_to_publish.insert(status.mqt, status);
        }
    }

    /// Publish staged status deltas, coalesced per queue type within one
    /// activation.
    fn flush_statuses(&mut self) {
        while let Some((_, status)) = self.statuses_to_publish.pop_first() {
            self.hooks.on_status(status);
        }
    }

    /// Tear the connection down exactly once: drop the transport, abort
    /// queued messages, and notify attached queries.
    fn disconnect_internal(&mut self, error: Option<&NetError>) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        self.is_sending = false;
        self.write_tx = None;
        self.set_state(ConnectionState::NotConnected);
        self.shutdown.cancel();
        match error {
            Some(err) => warn!(
                peer = %self.peer_instance,
                error = %err,
                "connection aborted"
            ),
            None => debug!(peer = %self.peer_instance, "connection closed"),
        }
        self.abort_messages();
    }

    fn abort_messages(&mut self) {
        let dropped = self.queue.abort_messages();
        if !dropped.is_empty() {
            warn!(
                peer = %self.peer_instance,
                count = dropped.len(),
                "dropping queued messages"
            );
            metrics::add_messages_aborted(dropped.len());
        }
        for msg in dropped {
            self.hooks.on_message_abort(msg);
        }
        for (query, handler) in mem::take(&mut self.attached_queries) {
            debug!(
                peer = %self.peer_instance,
                query = %query,
                "notifying query of disconnect"
            );
            handler(query);
        }
    }

    fn set_state(&mut self, state: ConnectionState) { self.state_tx.send_replace(state); }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Adopt an accepted socket, moving straight to `Connected`.
    ///
    /// # Errors
    ///
    /// [`NetError::AlreadyConnected`] if a transport is already attached.
    pub fn start(&mut self, stream: S) -> Result<(), NetError> {
        if self.state() != ConnectionState::NotConnected {
            return Err(NetError::AlreadyConnected);
        }
        self.transport = Some(stream);
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Drive the connection until disconnect or a fatal error.
    ///
    /// Runs the read pipeline, the write pipeline, and all posted
    /// commands. On return the connection is torn down: queued messages
    /// aborted, attached queries notified, state `NotConnected`.
    ///
    /// # Errors
    ///
    /// The fatal error that ended the connection, if it did not end by a
    /// requested disconnect: [`NetError::Transport`],
    /// [`NetError::Malformed`], or [`NetError::Protocol`].
    pub async fn run(&mut self) -> Result<(), NetError> {
        let stream = self.transport.take().ok_or(NetError::NotConnected)?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read_half, MessageCodec::new(&self.cfg));
        let (write_tx, write_rx) = mpsc::channel(1);
        self.write_tx = Some(write_tx);
        let writer = tokio::spawn(Self::write_loop(write_half, write_rx, self.cmd_tx.clone()));

        metrics::inc_connections();
        debug!(
            source = %self.source_instance,
            peer = %self.peer_instance,
            "connection running"
        );
        // Drain anything queued while the transport was still coming up.
        let result = match self.push_next_message() {
            Ok(()) => {
                self.flush_statuses();
                self.event_loop(&mut frames).await
            }
            Err(err) => Err(err),
        };
        self.disconnect_internal(result.as_ref().err());
        writer.abort();
        metrics::dec_connections();
        result
    }

    async fn event_loop(
        &mut self,
        frames: &mut FramedRead<ReadHalf<S>, MessageCodec>,
    ) -> Result<(), NetError> {
        let shutdown = self.shutdown.clone();
        loop {
            let event = tokio::select! {
                biased;

                () = shutdown.cancelled() => Event::Shutdown,
                cmd = self.cmd_rx.recv() => Event::Command(cmd),
                frame = frames.next() => Event::Frame(frame),
            };
            match event {
                Event::Shutdown => return Ok(()),
                // Unreachable while the actor holds its own sender; treated
                // as a disconnect for robustness.
                Event::Command(None) => return Ok(()),
                Event::Command(Some(cmd)) => self.on_command(cmd)?,
                Event::Frame(frame) => self.on_frame(frame)?,
            }
        }
    }

    async fn write_loop(
        mut writer: WriteHalf<S>,
        mut write_rx: mpsc::Receiver<Bytes>,
        events: mpsc::UnboundedSender<Command>,
    ) {
        while let Some(buf) = write_rx.recv().await {
            let result = Self::write_buffer(&mut writer, &buf).await;
            let failed = result.is_err();
            if events.send(Command::SendComplete { result }).is_err() || failed {
                break;
            }
        }
    }

    async fn write_buffer(writer: &mut WriteHalf<S>, buf: &Bytes) -> io::Result<()> {
        writer.write_all(buf).await?;
        writer.flush().await
    }
}

impl Connection<TcpStream> {
    /// Asynchronously resolve and connect to `address:port`.
    ///
    /// Legal only from `NotConnected`. On failure the state returns to
    /// `NotConnected` and the caller drives any retry (typically from a
    /// fresh catalog lookup). Only the first failure is logged at `warn`
    /// to keep retry storms quiet.
    ///
    /// # Errors
    ///
    /// [`NetError::AlreadyConnected`] from any other state;
    /// [`NetError::Transport`] when resolution or dialling fails.
    pub async fn connect_async(&mut self, address: &str, port: u16) -> Result<(), NetError> {
        if self.state() != ConnectionState::NotConnected {
            return Err(NetError::AlreadyConnected);
        }
        self.set_state(ConnectionState::ConnectInProgress);
        match Self::dial(address, port).await {
            Ok(stream) => {
                debug!(peer = %self.peer_instance, address, port, "connected");
                self.log_connect_errors = true;
                self.transport = Some(stream);
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::NotConnected);
                if self.log_connect_errors {
                    self.log_connect_errors = false;
                    warn!(
                        peer = %self.peer_instance,
                        address,
                        port,
                        error = %err,
                        "connect failed"
                    );
                } else {
                    debug!(
                        peer = %self.peer_instance,
                        address,
                        port,
                        error = %err,
                        "connect failed"
                    );
                }
                Err(NetError::Transport(err))
            }
        }
    }

    async fn dial(address: &str, port: u16) -> io::Result<TcpStream> {
        let addrs = net::lookup_host((address, port)).await?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "address resolved to no endpoints")
        }))
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        // Guarantees the abort path runs exactly once even if the owner
        // drops a connection that never ran.
        self.disconnect_internal(None);
    }
}
