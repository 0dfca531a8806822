//! Counter producer - streams a counter to a discovered observer.
//!
//! This example demonstrates:
//! - Finding an observer through local-network discovery
//! - Sending a state update after every action
//! - Applying a replacement state pushed back by the observer
//!
//! # Running
//!
//! Start `console_observer` first; this producer waits until it finds
//! the observer's beacon.
//!
//! ```sh
//! cargo run --example counter_producer
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use statewire::{Producer, ProducerEvent};

/// State shared with the console observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CounterState {
    count: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Resolve the observer through its beacon and connect.
    let (producer, mut events) = Producer::<CounterState>::builder().start().await?;
    producer.ready().await?;
    println!("Connected to observer");

    let mut state = CounterState { count: 0 };
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                state.count += 1;
                if let Err(e) = producer.send_update(&state, "increment", None).await {
                    eprintln!("Send failed: {}", e);
                }
            }
            event = events.recv() => match event {
                Some(ProducerEvent::Replace(replacement)) => {
                    println!("Observer replaced the state: {:?}", replacement);
                    state = replacement;
                }
                Some(ProducerEvent::Connection(connection)) => {
                    println!("Connection: {:?}", connection);
                }
                Some(ProducerEvent::DecodeError(e)) => {
                    eprintln!("Failed to decode a message: {}", e);
                }
                None => break,
            },
        }
    }

    Ok(())
}
