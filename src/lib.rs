//! # statewire
//!
//! Stream application-state snapshots from a running process to an
//! observer on the local network, with state push-back.
//!
//! The producing process sends its state after every action, optionally
//! with a rendered-image attachment; the observer can push a replacement
//! state back, steering the producer remotely. Peers find each other
//! through UDP beacons or connect to a direct endpoint.
//!
//! ## Wire format
//!
//! Messages are JSON payloads wrapped in self-delimiting frames:
//!
//! ```text
//! ┌──────┬─────────────────┬──────────────┐
//! │ 0xCE │ length (u32 BE) │   payload    │
//! └──────┴─────────────────┴──────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use serde::{Deserialize, Serialize};
//! use statewire::{Observer, ObserverEvent, Producer};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct AppState {
//!     count: i32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> statewire::Result<()> {
//!     let (observer, mut events) = Observer::<AppState>::builder()
//!         .advertise()
//!         .start()
//!         .await?;
//!
//!     let (producer, _events) = Producer::<AppState>::builder()
//!         .endpoint(observer.local_addr())
//!         .start()
//!         .await?;
//!     producer.ready().await?;
//!
//!     producer.send_update(&AppState { count: 1 }, "increment", None).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let ObserverEvent::Update(update) = event {
//!             println!("{} -> {:?}", update.action, update.state);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod discovery;
pub mod error;
pub mod message;
pub mod protocol;
pub mod reader;
pub mod transport;
pub mod writer;

mod observer;
mod producer;
mod session;

pub use error::{Result, StatewireError};
pub use message::Message;
pub use observer::{Observer, ObserverBuilder, ObserverEvent, ObserverEvents, Update};
pub use producer::{Producer, ProducerBuilder, ProducerEvent, ProducerEvents};
pub use session::{ConnectionState, Session, SessionConfig, SessionEvent, SessionEvents};
