//! Connection session: state machine, framing, and message exchange.
//!
//! A [`Session`] wraps one byte stream and runs it through a dedicated
//! lane task that owns the connection state, the reader and writer tasks,
//! and the inbound frame buffer. Callers interact through cheap cloneable
//! handles; inbound messages and state changes surface on a
//! [`SessionEvents`] receiver.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──start()──► Connecting ──► Ready ──► Closed
//!                               │                      ▲
//!                               └──────► Failed ───────┘ (via start() or close())
//! ```
//!
//! `start()` is rejected while connecting or ready; it is accepted again
//! from `Closed` and `Failed`, which reconnects endpoint-backed sessions.
//! `close()` is idempotent and never fails.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::codec::JsonCodec;
use crate::error::{Result, StatewireError};
use crate::message::Message;
use crate::protocol::{encode_frame, FrameBuffer, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::reader::{spawn_reader_task, ByteStreamEvent};
use crate::transport::{self, ByteStream};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle, DEFAULT_QUEUE_CAPACITY};

/// Capacity of the channel carrying raw chunks from the reader task.
const CHUNK_QUEUE_CAPACITY: usize = 32;

/// Capacity of the command channel between handles and the lane task.
const COMMAND_QUEUE_CAPACITY: usize = 16;

/// Connection state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state; no connection attempt yet.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Connected; messages flow in both directions.
    Ready,
    /// Closed locally or by the peer. Terminal until restarted.
    Closed,
    /// Connection or protocol failure. Terminal until restarted.
    Failed(String),
}

/// Events surfaced by a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A complete message arrived from the peer.
    Message(Message),
    /// A frame arrived but its payload failed to decode.
    ///
    /// The connection stays usable; only the one message is lost.
    DecodeError(StatewireError),
}

/// Configuration for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum accepted inbound payload size in bytes.
    pub max_payload_size: u32,
    /// Capacity of the outbound frame queue.
    pub write_queue: usize,
    /// Capacity of the event queue.
    pub event_queue: usize,
    /// Optional timeout for the connect attempt.
    pub connect_timeout: Option<Duration>,
    /// Optional per-chunk write timeout.
    pub write_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            write_queue: DEFAULT_QUEUE_CAPACITY,
            event_queue: 256,
            connect_timeout: None,
            write_timeout: None,
        }
    }
}

type BoxedStream = Box<dyn ByteStream>;

/// What the session connects to, or the stream it was handed.
enum Peer {
    /// Dial this address on every start.
    Endpoint(SocketAddr),
    /// Pre-established stream; consumed by the first start.
    Stream(Option<BoxedStream>),
}

/// Snapshot published to handles through the watch channel.
struct Shared {
    state: ConnectionState,
    writer: Option<WriterHandle>,
}

enum Command {
    Start { reply: oneshot::Sender<Result<()>> },
    Close { reply: oneshot::Sender<()> },
}

/// Tasks and buffers of a live connection.
struct Live {
    frame_buffer: FrameBuffer,
    chunk_rx: mpsc::Receiver<ByteStreamEvent>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<Result<()>>,
    writer: WriterHandle,
}

enum Phase {
    Idle,
    Connecting(JoinHandle<Result<BoxedStream>>),
    Ready(Live),
}

/// Handle to a running session.
///
/// Cloneable; all clones drive the same connection. The session shuts
/// down when every handle is dropped.
#[derive(Clone)]
pub struct Session {
    cmd_tx: mpsc::Sender<Command>,
    shared_rx: watch::Receiver<Shared>,
}

/// Receiver for [`SessionEvent`]s. Exactly one per session.
pub struct SessionEvents {
    rx: mpsc::Receiver<SessionEvent>,
}

impl SessionEvents {
    /// Receive the next event. `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }
}

impl Session {
    /// Create a session that dials `endpoint` when started.
    pub fn connect(endpoint: SocketAddr, config: SessionConfig) -> (Session, SessionEvents) {
        Self::new(Peer::Endpoint(endpoint), config)
    }

    /// Create a session over an already-established stream.
    ///
    /// The stream is consumed by the first `start()`; restarting a
    /// stream-backed session after it closes fails with
    /// [`StatewireError::SessionClosed`].
    pub fn attach<S: ByteStream>(stream: S, config: SessionConfig) -> (Session, SessionEvents) {
        Self::new(Peer::Stream(Some(Box::new(stream))), config)
    }

    fn new(peer: Peer, config: SessionConfig) -> (Session, SessionEvents) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(config.event_queue);
        let (shared_tx, shared_rx) = watch::channel(Shared {
            state: ConnectionState::Disconnected,
            writer: None,
        });

        let actor = SessionActor {
            peer,
            config,
            phase: Phase::Idle,
            cmd_rx,
            shared_tx,
            event_tx,
        };
        tokio::spawn(actor.run());

        (Session { cmd_tx, shared_rx }, SessionEvents { rx: event_rx })
    }

    /// Start (or restart) the connection.
    ///
    /// Fails with [`StatewireError::AlreadyStarted`] while connecting or
    /// ready. Success means the attempt began, not that it succeeded;
    /// watch for [`SessionEvent::StateChanged`] or call [`wait_ready`].
    ///
    /// [`wait_ready`]: Session::wait_ready
    pub async fn start(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Start { reply })
            .await
            .map_err(|_| StatewireError::SessionClosed)?;
        rx.await.map_err(|_| StatewireError::SessionClosed)?
    }

    /// Close the connection and release its resources.
    ///
    /// Idempotent: closing a closed session does nothing.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close { reply }).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Send a message to the peer.
    ///
    /// Fails with [`StatewireError::NotReady`] unless the session is
    /// `Ready`. Suspends while the outbound queue is full.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let writer = {
            let shared = self.shared_rx.borrow();
            match (&shared.state, &shared.writer) {
                (ConnectionState::Ready, Some(writer)) => writer.clone(),
                _ => return Err(StatewireError::NotReady),
            }
        };

        let payload = JsonCodec::encode(message)?;
        let frame = encode_frame(&payload)?;
        writer.send(frame).await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared_rx.borrow().state.clone()
    }

    /// Wait until the session is `Ready`.
    ///
    /// Fails as soon as the session reaches `Failed` or `Closed` instead.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.shared_rx.clone();
        loop {
            {
                let shared = rx.borrow_and_update();
                match &shared.state {
                    ConnectionState::Ready => return Ok(()),
                    ConnectionState::Failed(reason) => {
                        return Err(StatewireError::SessionFailed(reason.clone()))
                    }
                    ConnectionState::Closed => return Err(StatewireError::SessionClosed),
                    ConnectionState::Disconnected | ConnectionState::Connecting => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(StatewireError::SessionClosed);
            }
        }
    }
}

/// Lane task owning the connection.
struct SessionActor {
    peer: Peer,
    config: SessionConfig,
    phase: Phase,
    cmd_rx: mpsc::Receiver<Command>,
    shared_tx: watch::Sender<Shared>,
    event_tx: mpsc::Sender<SessionEvent>,
}

/// One unit of work for the lane task, picked by `next_step`.
enum Step {
    Cmd(Option<Command>),
    Connected(std::result::Result<Result<BoxedStream>, JoinError>),
    Stream(Option<ByteStreamEvent>),
    WriterDone(std::result::Result<Result<()>, JoinError>),
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            match self.next_step().await {
                Step::Cmd(None) => break,
                Step::Cmd(Some(Command::Start { reply })) => {
                    let result = self.handle_start().await;
                    let _ = reply.send(result);
                }
                Step::Cmd(Some(Command::Close { reply })) => {
                    self.handle_close().await;
                    let _ = reply.send(());
                }
                Step::Connected(result) => self.on_connect_done(result).await,
                Step::Stream(event) => self.on_stream_event(event).await,
                Step::WriterDone(result) => self.on_writer_done(result).await,
            }
        }

        // Every handle is gone; tear the link down.
        self.handle_close().await;
    }

    /// Wait for the next piece of work. Splitting this out keeps the
    /// phase borrow local to the select.
    async fn next_step(&mut self) -> Step {
        match &mut self.phase {
            Phase::Idle => Step::Cmd(self.cmd_rx.recv().await),
            Phase::Connecting(task) => {
                tokio::select! {
                    cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                    result = task => Step::Connected(result),
                }
            }
            Phase::Ready(live) => {
                tokio::select! {
                    cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                    event = live.chunk_rx.recv() => Step::Stream(event),
                    result = &mut live.writer_task => Step::WriterDone(result),
                }
            }
        }
    }

    async fn handle_start(&mut self) -> Result<()> {
        if matches!(self.phase, Phase::Connecting(_) | Phase::Ready(_)) {
            return Err(StatewireError::AlreadyStarted);
        }

        match &mut self.peer {
            Peer::Endpoint(addr) => {
                let addr = *addr;
                let connect_timeout = self.config.connect_timeout;
                let task = tokio::spawn(async move {
                    let stream = match connect_timeout {
                        Some(limit) => tokio::time::timeout(limit, transport::connect(addr))
                            .await
                            .map_err(|_| StatewireError::ConnectTimeout)??,
                        None => transport::connect(addr).await?,
                    };
                    Ok(Box::new(stream) as BoxedStream)
                });
                self.phase = Phase::Connecting(task);
                self.set_state(ConnectionState::Connecting).await;
            }
            Peer::Stream(slot) => {
                let stream = slot.take().ok_or(StatewireError::SessionClosed)?;
                self.set_state(ConnectionState::Connecting).await;
                self.attach_stream(stream);
                self.set_state(ConnectionState::Ready).await;
            }
        }

        Ok(())
    }

    async fn handle_close(&mut self) {
        if matches!(self.shared_tx.borrow().state, ConnectionState::Closed) {
            return;
        }
        self.close_link(ConnectionState::Closed).await;
    }

    /// Split the stream and spawn its reader and writer tasks.
    fn attach_stream(&mut self, stream: BoxedStream) {
        let (read_half, write_half) = tokio::io::split(stream);

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE_CAPACITY);
        let reader_task = spawn_reader_task(read_half, chunk_tx);

        let writer_config = WriterConfig {
            queue_capacity: self.config.write_queue,
            write_timeout: self.config.write_timeout,
        };
        let (writer, writer_task) = spawn_writer_task(write_half, writer_config);

        self.phase = Phase::Ready(Live {
            frame_buffer: FrameBuffer::with_max_payload(self.config.max_payload_size),
            chunk_rx,
            reader_task,
            writer_task,
            writer,
        });
    }

    async fn on_connect_done(
        &mut self,
        result: std::result::Result<Result<BoxedStream>, JoinError>,
    ) {
        self.phase = Phase::Idle;
        match result {
            Ok(Ok(stream)) => {
                self.attach_stream(stream);
                self.set_state(ConnectionState::Ready).await;
            }
            Ok(Err(e)) => {
                tracing::warn!("Connect failed: {}", e);
                self.set_state(ConnectionState::Failed(e.to_string())).await;
            }
            Err(e) => {
                tracing::error!("Connect task panicked: {}", e);
                self.set_state(ConnectionState::Failed(e.to_string())).await;
            }
        }
    }

    async fn on_stream_event(&mut self, event: Option<ByteStreamEvent>) {
        match event {
            Some(ByteStreamEvent::Chunk(chunk)) => self.on_chunk(chunk).await,
            Some(ByteStreamEvent::EndOfStream) | None => {
                tracing::debug!("Peer closed the stream");
                self.close_link(ConnectionState::Closed).await;
            }
            Some(ByteStreamEvent::Error(e)) => {
                tracing::warn!("Stream error: {}", e);
                self.close_link(ConnectionState::Closed).await;
            }
        }
    }

    async fn on_chunk(&mut self, chunk: Bytes) {
        let result = match &mut self.phase {
            Phase::Ready(live) => live.frame_buffer.push(&chunk),
            _ => return,
        };

        match result {
            Ok(payloads) => {
                for payload in payloads {
                    match JsonCodec::decode::<Message>(&payload) {
                        Ok(message) => {
                            let _ = self.event_tx.send(SessionEvent::Message(message)).await;
                        }
                        Err(e) => {
                            tracing::warn!("Failed to decode message payload: {}", e);
                            let _ = self.event_tx.send(SessionEvent::DecodeError(e)).await;
                        }
                    }
                }
            }
            Err(e) => {
                // Framing is unrecoverable once the length prefix is lost.
                tracing::error!("Protocol corruption: {}", e);
                self.close_link(ConnectionState::Failed(e.to_string())).await;
            }
        }
    }

    async fn on_writer_done(&mut self, result: std::result::Result<Result<()>, JoinError>) {
        match result {
            Ok(Ok(())) => tracing::debug!("Writer task finished"),
            Ok(Err(e)) => tracing::warn!("Writer failed: {}", e),
            Err(e) => tracing::error!("Writer task panicked: {}", e),
        }
        self.close_link(ConnectionState::Closed).await;
    }

    /// Tear down the current phase and publish the resulting state.
    async fn close_link(&mut self, state: ConnectionState) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Connecting(task) => task.abort(),
            Phase::Ready(live) => {
                live.reader_task.abort();
                live.writer_task.abort();
            }
        }
        self.set_state(state).await;
    }

    /// Publish a state change to handles and the event queue.
    async fn set_state(&mut self, state: ConnectionState) {
        let writer = match (&state, &self.phase) {
            (ConnectionState::Ready, Phase::Ready(live)) => Some(live.writer.clone()),
            _ => None,
        };
        self.shared_tx.send_replace(Shared {
            state: state.clone(),
            writer,
        });
        let _ = self.event_tx.send(SessionEvent::StateChanged(state)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::time::timeout;

    async fn next_event(events: &mut SessionEvents) -> SessionEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    fn attached_pair() -> ((Session, SessionEvents), (Session, SessionEvents)) {
        let (left, right) = duplex(64 * 1024);
        (
            Session::attach(left, SessionConfig::default()),
            Session::attach(right, SessionConfig::default()),
        )
    }

    async fn start_and_drain(session: &Session, events: &mut SessionEvents) {
        session.start().await.unwrap();
        assert!(matches!(
            next_event(events).await,
            SessionEvent::StateChanged(ConnectionState::Connecting)
        ));
        assert!(matches!(
            next_event(events).await,
            SessionEvent::StateChanged(ConnectionState::Ready)
        ));
    }

    #[tokio::test]
    async fn test_send_before_start_is_not_ready() {
        let (stream, _keep_alive) = duplex(1024);
        let (session, _events) = Session::attach(stream, SessionConfig::default());

        let err = session.send(&Message::replace(vec![1])).await.unwrap_err();
        assert!(matches!(err, StatewireError::NotReady));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_attached_start_reaches_ready() {
        let (stream, _keep_alive) = duplex(1024);
        let (session, mut events) = Session::attach(stream, SessionConfig::default());

        assert_eq!(session.state(), ConnectionState::Disconnected);
        start_and_drain(&session, &mut events).await;
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_start_twice_is_already_started() {
        let (stream, _keep_alive) = duplex(1024);
        let (session, mut events) = Session::attach(stream, SessionConfig::default());

        start_and_drain(&session, &mut events).await;

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, StatewireError::AlreadyStarted));
    }

    #[tokio::test]
    async fn test_sessions_exchange_messages() {
        let ((left, mut left_events), (right, mut right_events)) = attached_pair();
        start_and_drain(&left, &mut left_events).await;
        start_and_drain(&right, &mut right_events).await;

        let outbound = Message::update(vec![1, 2, 3], "increment", None);
        left.send(&outbound).await.unwrap();

        match next_event(&mut right_events).await {
            SessionEvent::Message(message) => assert_eq!(message, outbound),
            other => panic!("expected message, got {other:?}"),
        }

        let reply = Message::replace(vec![9, 9]);
        right.send(&reply).await.unwrap();

        match next_event(&mut left_events).await {
            SessionEvent::Message(message) => assert_eq!(message, reply),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_reaches_peer_as_closed() {
        let ((left, mut left_events), (right, mut right_events)) = attached_pair();
        start_and_drain(&left, &mut left_events).await;
        start_and_drain(&right, &mut right_events).await;

        left.close().await;
        assert!(matches!(
            next_event(&mut left_events).await,
            SessionEvent::StateChanged(ConnectionState::Closed)
        ));

        assert!(matches!(
            next_event(&mut right_events).await,
            SessionEvent::StateChanged(ConnectionState::Closed)
        ));
        assert_eq!(right.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (stream, _keep_alive) = duplex(1024);
        let (session, mut events) = Session::attach(stream, SessionConfig::default());
        start_and_drain(&session, &mut events).await;

        session.close().await;
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(ConnectionState::Closed)
        ));

        session.close().await;
        let second = timeout(Duration::from_millis(100), events.recv()).await;
        assert!(second.is_err(), "second close must not emit another event");
    }

    #[tokio::test]
    async fn test_bad_magic_fails_the_session() {
        let (stream, mut raw) = duplex(1024);
        let (session, mut events) = Session::attach(stream, SessionConfig::default());
        start_and_drain(&session, &mut events).await;

        raw.write_all(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x05]).await.unwrap();

        match next_event(&mut events).await {
            SessionEvent::StateChanged(ConnectionState::Failed(_)) => {}
            other => panic!("expected failed state, got {other:?}"),
        }
        assert!(matches!(session.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_decode_error_is_recoverable() {
        let (stream, mut raw) = duplex(8 * 1024);
        let (session, mut events) = Session::attach(stream, SessionConfig::default());
        start_and_drain(&session, &mut events).await;

        // A well-framed frame with a payload that is not a message.
        let garbage = encode_frame(b"not a message").unwrap();
        raw.write_all(&garbage).await.unwrap();

        let valid = Message::replace(vec![7]);
        let frame = encode_frame(&JsonCodec::encode(&valid).unwrap()).unwrap();
        raw.write_all(&frame).await.unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::DecodeError(_)
        ));
        match next_event(&mut events).await {
            SessionEvent::Message(message) => assert_eq!(message, valid),
            other => panic!("expected message, got {other:?}"),
        }
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_peer_eof_closes_session() {
        let (stream, raw) = duplex(1024);
        let (session, mut events) = Session::attach(stream, SessionConfig::default());
        start_and_drain(&session, &mut events).await;

        drop(raw);

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(ConnectionState::Closed)
        ));
        assert_eq!(session.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_restarting_spent_stream_session_fails() {
        let (stream, raw) = duplex(1024);
        let (session, mut events) = Session::attach(stream, SessionConfig::default());
        start_and_drain(&session, &mut events).await;

        drop(raw);
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(ConnectionState::Closed)
        ));

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, StatewireError::SessionClosed));
    }

    #[tokio::test]
    async fn test_send_after_close_is_not_ready() {
        let (stream, _keep_alive) = duplex(1024);
        let (session, mut events) = Session::attach(stream, SessionConfig::default());
        start_and_drain(&session, &mut events).await;

        session.close().await;
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(ConnectionState::Closed)
        ));

        let err = session.send(&Message::replace(vec![1])).await.unwrap_err();
        assert!(matches!(err, StatewireError::NotReady));
    }

    #[tokio::test]
    async fn test_restart_after_close_reconnects_endpoint_session() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_task = tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            let (second, _) = listener.accept().await.unwrap();
            (first, second)
        });

        let (session, mut events) = Session::connect(addr, SessionConfig::default());
        session.start().await.unwrap();
        session.wait_ready().await.unwrap();
        while !matches!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(ConnectionState::Ready)
        ) {}

        session.close().await;
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(ConnectionState::Closed)
        ));

        session.start().await.unwrap();
        session.wait_ready().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Ready);

        let (_first, _second) = accept_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_ready_resolves_on_failure() {
        // Nothing listens on port 1, so the connect is refused.
        let (session, _events) = Session::connect(
            "127.0.0.1:1".parse().unwrap(),
            SessionConfig {
                connect_timeout: Some(Duration::from_secs(2)),
                ..SessionConfig::default()
            },
        );
        session.start().await.unwrap();

        let err = timeout(Duration::from_secs(5), session.wait_ready())
            .await
            .expect("wait_ready timed out")
            .unwrap_err();
        assert!(matches!(
            err,
            StatewireError::SessionFailed(_) | StatewireError::SessionClosed
        ));
    }
}
