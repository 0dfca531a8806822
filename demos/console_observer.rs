//! Console observer - accepts a producer and prints its state stream.
//!
//! This example demonstrates:
//! - Accepting producers on a local port
//! - Announcing the observer on the local network
//! - Pushing a replacement state back to the producer
//!
//! # Running
//!
//! ```sh
//! cargo run --example console_observer
//! # in another terminal:
//! cargo run --example counter_producer
//! ```

use serde::{Deserialize, Serialize};
use statewire::{Observer, ObserverEvent};

/// State shared with the counter producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CounterState {
    count: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Bind an OS-chosen port and announce it on the local network.
    let (observer, mut events) = Observer::<CounterState>::builder()
        .advertise()
        .start()
        .await?;
    println!("Listening on {}", observer.local_addr());

    while let Some(event) = events.recv().await {
        match event {
            ObserverEvent::PeerConnected(peer) => {
                println!("Producer connected from {}", peer);
            }
            ObserverEvent::Update(update) => {
                match &update.attachment {
                    Some(image) => println!(
                        "{} -> {:?} (+{} byte attachment)",
                        update.action,
                        update.state,
                        image.len()
                    ),
                    None => println!("{} -> {:?}", update.action, update.state),
                }

                // Steer the producer: reset the counter every ten ticks.
                if update.state.count != 0 && update.state.count % 10 == 0 {
                    observer.send_replace(&CounterState { count: 0 }).await?;
                }
            }
            ObserverEvent::DecodeError(e) => {
                eprintln!("Failed to decode a message: {}", e);
            }
            ObserverEvent::PeerDisconnected(state) => {
                println!("Producer left: {:?}", state);
            }
        }
    }

    Ok(())
}
