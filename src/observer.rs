//! Typed observer: accepts one producer and receives its state stream.
//!
//! An [`Observer`] listens for TCP connections, optionally announcing
//! itself on the local network. It holds at most one peer: a new
//! connection closes the previous one and takes its place, so the most
//! recent producer always wins. Inbound updates decode into the typed
//! state `S`; [`Observer::send_replace`] pushes a replacement state back
//! to the connected producer.

use std::marker::PhantomData;
use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::codec::JsonCodec;
use crate::discovery::{Advertiser, ServiceInfo, SERVICE_NAME};
use crate::error::{Result, StatewireError};
use crate::message::Message;
use crate::session::{ConnectionState, Session, SessionConfig, SessionEvent, SessionEvents};
use crate::transport::StreamListener;

/// A decoded state snapshot received from the producer.
#[derive(Debug, Clone, PartialEq)]
pub struct Update<S> {
    /// The application state after the action.
    pub state: S,
    /// The action that produced this state.
    pub action: String,
    /// Optional rendered-image attachment.
    pub attachment: Option<Vec<u8>>,
}

/// Events surfaced by an observer.
#[derive(Debug)]
pub enum ObserverEvent<S> {
    /// A producer connected (replacing any previous one).
    PeerConnected(SocketAddr),
    /// The producer sent a state snapshot.
    Update(Update<S>),
    /// An inbound payload failed to decode. The connection stays up.
    DecodeError(StatewireError),
    /// The producer's connection ended, with the state it ended in.
    PeerDisconnected(ConnectionState),
}

/// Builder for an [`Observer`].
pub struct ObserverBuilder<S> {
    bind_addr: SocketAddr,
    advertise: bool,
    service_name: String,
    session_config: SessionConfig,
    _marker: PhantomData<S>,
}

impl<S> ObserverBuilder<S>
where
    S: Serialize + DeserializeOwned + Send + 'static,
{
    fn new() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertise: false,
            service_name: SERVICE_NAME.to_string(),
            session_config: SessionConfig::default(),
            _marker: PhantomData,
        }
    }

    /// Listen on this address. Defaults to `0.0.0.0` with an OS-chosen
    /// port.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Announce the observer on the local network.
    pub fn advertise(mut self) -> Self {
        self.advertise = true;
        self
    }

    /// Instance name to announce under. Defaults to [`SERVICE_NAME`].
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Session tuning knobs.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Bind the listener, start announcing if asked, and begin
    /// accepting producers.
    pub async fn start(self) -> Result<(Observer<S>, ObserverEvents<S>)> {
        let listener = StreamListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let advertiser = if self.advertise {
            let mut advertiser =
                Advertiser::publish(ServiceInfo::new(self.service_name, local_addr.port()));
            advertiser.registration().await?;
            Some(advertiser)
        } else {
            None
        };

        let (current_tx, current_rx) = watch::channel(None);
        let (event_tx, event_rx) = mpsc::channel(64);
        let task = tokio::spawn(accept_loop(
            listener,
            self.session_config,
            current_tx,
            event_tx,
        ));

        let observer = Observer {
            local_addr,
            current: current_rx,
            task,
            _advertiser: advertiser,
            _marker: PhantomData,
        };
        Ok((observer, ObserverEvents { rx: event_rx }))
    }
}

/// Receives typed state snapshots from one producer at a time.
pub struct Observer<S> {
    local_addr: SocketAddr,
    current: watch::Receiver<Option<Session>>,
    task: JoinHandle<()>,
    _advertiser: Option<Advertiser>,
    _marker: PhantomData<S>,
}

/// Receiver for [`ObserverEvent`]s. Exactly one per observer.
pub struct ObserverEvents<S> {
    rx: mpsc::Receiver<ObserverEvent<S>>,
}

impl<S> ObserverEvents<S> {
    /// Receive the next event. `None` once the observer is gone.
    pub async fn recv(&mut self) -> Option<ObserverEvent<S>> {
        self.rx.recv().await
    }
}

impl<S> Observer<S>
where
    S: Serialize + DeserializeOwned + Send + 'static,
{
    /// Start building an observer.
    pub fn builder() -> ObserverBuilder<S> {
        ObserverBuilder::new()
    }

    /// Push a replacement state to the connected producer.
    ///
    /// Fails with [`StatewireError::NotReady`] when no producer is
    /// connected.
    pub async fn send_replace(&self, state: &S) -> Result<()> {
        let session = self
            .current
            .borrow()
            .clone()
            .ok_or(StatewireError::NotReady)?;
        let bytes = JsonCodec::encode(state)?;
        session.send(&Message::replace(bytes)).await
    }
}

impl<S> Observer<S> {
    /// Address the observer accepts producers on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether a producer is currently connected.
    pub fn has_peer(&self) -> bool {
        self.current.borrow().is_some()
    }
}

impl<S> Drop for Observer<S> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Step {
    Accepted(Result<(tokio::net::TcpStream, SocketAddr)>),
    Session(Option<SessionEvent>),
}

async fn accept_loop<S>(
    listener: StreamListener,
    config: SessionConfig,
    current: watch::Sender<Option<Session>>,
    events: mpsc::Sender<ObserverEvent<S>>,
) where
    S: DeserializeOwned + Send + 'static,
{
    let mut active: Option<SessionEvents> = None;

    loop {
        let step = match active.as_mut() {
            Some(session_events) => {
                tokio::select! {
                    accepted = listener.accept() => Step::Accepted(accepted),
                    event = session_events.recv() => Step::Session(event),
                }
            }
            None => Step::Accepted(listener.accept().await),
        };

        match step {
            Step::Accepted(Ok((stream, peer))) => {
                // Newest connection wins. Drop the old event receiver
                // before closing so a suspended session task cannot
                // stall the close on a full event queue.
                if active.take().is_some() {
                    if let Some(old) = current.send_replace(None) {
                        old.close().await;
                    }
                    let _ = events
                        .send(ObserverEvent::PeerDisconnected(ConnectionState::Closed))
                        .await;
                }

                let (session, session_events) = Session::attach(stream, config.clone());
                if let Err(e) = session.start().await {
                    tracing::warn!("Failed to start session for {}: {}", peer, e);
                    continue;
                }
                current.send_replace(Some(session));
                active = Some(session_events);
                let _ = events.send(ObserverEvent::PeerConnected(peer)).await;
            }
            Step::Accepted(Err(e)) => {
                tracing::error!("Accept failed: {}", e);
                break;
            }
            Step::Session(Some(event)) => {
                handle_session_event(event, &mut active, &current, &events).await;
            }
            Step::Session(None) => {
                active = None;
                current.send_replace(None);
            }
        }
    }
}

async fn handle_session_event<S>(
    event: SessionEvent,
    active: &mut Option<SessionEvents>,
    current: &watch::Sender<Option<Session>>,
    events: &mpsc::Sender<ObserverEvent<S>>,
) where
    S: DeserializeOwned,
{
    match event {
        SessionEvent::Message(Message::StateUpdate {
            state,
            action,
            attachment,
        }) => match JsonCodec::decode::<S>(&state) {
            Ok(state) => {
                let update = Update {
                    state,
                    action,
                    attachment,
                };
                let _ = events.send(ObserverEvent::Update(update)).await;
            }
            Err(e) => {
                let _ = events.send(ObserverEvent::DecodeError(e)).await;
            }
        },
        SessionEvent::Message(Message::StateReplace { .. }) => {
            tracing::warn!("Ignoring state replacement sent by the producer");
        }
        SessionEvent::DecodeError(e) => {
            let _ = events.send(ObserverEvent::DecodeError(e)).await;
        }
        SessionEvent::StateChanged(state @ (ConnectionState::Closed | ConnectionState::Failed(_))) => {
            *active = None;
            current.send_replace(None);
            let _ = events.send(ObserverEvent::PeerDisconnected(state)).await;
        }
        SessionEvent::StateChanged(_) => {}
    }
}
