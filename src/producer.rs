//! Typed producer: streams state snapshots to an observer.
//!
//! A [`Producer`] owns one [`Session`](crate::session::Session) to an
//! observer, found either by a direct endpoint or by local-network
//! discovery. State values serialize to JSON and travel inside
//! [`Message::StateUpdate`] frames; replacement states pushed back by
//! the observer surface as [`ProducerEvent::Replace`].

use std::marker::PhantomData;
use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::JsonCodec;
use crate::discovery::{Locator, SERVICE_DOMAIN, SERVICE_TYPE};
use crate::error::{Result, StatewireError};
use crate::message::Message;
use crate::session::{ConnectionState, Session, SessionConfig, SessionEvent, SessionEvents};

/// Events surfaced by a producer.
#[derive(Debug)]
pub enum ProducerEvent<S> {
    /// The underlying connection changed state.
    Connection(ConnectionState),
    /// The observer pushed a replacement state.
    Replace(S),
    /// An inbound payload failed to decode. The connection stays up.
    DecodeError(StatewireError),
}

/// Builder for a [`Producer`].
pub struct ProducerBuilder<S> {
    endpoint: Option<SocketAddr>,
    service_type: String,
    domain: String,
    name: Option<String>,
    session_config: SessionConfig,
    _marker: PhantomData<S>,
}

impl<S> ProducerBuilder<S>
where
    S: Serialize + DeserializeOwned + Send + 'static,
{
    fn new() -> Self {
        Self {
            endpoint: None,
            service_type: SERVICE_TYPE.to_string(),
            domain: SERVICE_DOMAIN.to_string(),
            name: None,
            session_config: SessionConfig::default(),
            _marker: PhantomData,
        }
    }

    /// Connect to this address instead of discovering one.
    pub fn endpoint(mut self, addr: SocketAddr) -> Self {
        self.endpoint = Some(addr);
        self
    }

    /// Service type to discover. Defaults to [`SERVICE_TYPE`].
    pub fn service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }

    /// Domain to discover in. Defaults to [`SERVICE_DOMAIN`].
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Only accept services announced under this instance name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Session tuning knobs.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Resolve the observer, connect, and start streaming.
    pub async fn start(self) -> Result<(Producer<S>, ProducerEvents<S>)> {
        let endpoint = match self.endpoint {
            Some(addr) => addr,
            None => self.discover().await?,
        };

        let (session, session_events) = Session::connect(endpoint, self.session_config);
        session.start().await?;

        let (tx, rx) = mpsc::channel(64);
        let pump = tokio::spawn(pump_events(session_events, tx));

        let producer = Producer {
            session,
            _pump: pump,
            _marker: PhantomData,
        };
        Ok((producer, ProducerEvents { rx }))
    }

    async fn discover(&self) -> Result<SocketAddr> {
        let mut discovered = Locator::resolve(&self.service_type, &self.domain).await?;
        loop {
            let endpoint = discovered.next().await.ok_or(StatewireError::DiscoveryEnded)?;
            match &self.name {
                Some(name) if &endpoint.info.name != name => continue,
                _ => return Ok(endpoint.addr),
            }
        }
    }
}

/// Streams typed state snapshots to an observer.
pub struct Producer<S> {
    session: Session,
    _pump: JoinHandle<()>,
    _marker: PhantomData<S>,
}

/// Receiver for [`ProducerEvent`]s. Exactly one per producer.
pub struct ProducerEvents<S> {
    rx: mpsc::Receiver<ProducerEvent<S>>,
}

impl<S> ProducerEvents<S> {
    /// Receive the next event. `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<ProducerEvent<S>> {
        self.rx.recv().await
    }
}

impl<S> Producer<S>
where
    S: Serialize + DeserializeOwned + Send + 'static,
{
    /// Start building a producer.
    pub fn builder() -> ProducerBuilder<S> {
        ProducerBuilder::new()
    }

    /// Send a state snapshot tagged with the action that produced it,
    /// optionally carrying a rendered-image attachment.
    pub async fn send_update(
        &self,
        state: &S,
        action: impl Into<String>,
        attachment: Option<Vec<u8>>,
    ) -> Result<()> {
        let bytes = JsonCodec::encode(state)?;
        self.session
            .send(&Message::update(bytes, action, attachment))
            .await
    }

    /// Wait until the connection is ready.
    pub async fn ready(&self) -> Result<()> {
        self.session.wait_ready().await
    }

    /// Reconnect after the connection closed or failed.
    pub async fn reconnect(&self) -> Result<()> {
        self.session.start().await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Whether the connection is ready for updates.
    pub fn is_connected(&self) -> bool {
        self.session.state() == ConnectionState::Ready
    }

    /// Close the connection.
    pub async fn close(&self) {
        self.session.close().await
    }
}

/// Forward session events, decoding replacement states.
async fn pump_events<S>(mut session_events: SessionEvents, tx: mpsc::Sender<ProducerEvent<S>>)
where
    S: DeserializeOwned + Send + 'static,
{
    while let Some(event) = session_events.recv().await {
        let out = match event {
            SessionEvent::StateChanged(state) => ProducerEvent::Connection(state),
            SessionEvent::Message(Message::StateReplace { state }) => {
                match JsonCodec::decode::<S>(&state) {
                    Ok(value) => ProducerEvent::Replace(value),
                    Err(e) => ProducerEvent::DecodeError(e),
                }
            }
            SessionEvent::Message(Message::StateUpdate { .. }) => {
                tracing::warn!("Ignoring state update sent by the observer");
                continue;
            }
            SessionEvent::DecodeError(e) => ProducerEvent::DecodeError(e),
        };
        if tx.send(out).await.is_err() {
            return;
        }
    }
}
