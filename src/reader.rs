//! Dedicated reader task feeding raw chunks to the session.
//!
//! The task pulls at most [`MAX_TRANSFER_UNIT`] bytes per read call and
//! forwards each chunk in arrival order. It emits exactly one terminal
//! event and performs no further reads after it. The chunk channel is
//! bounded, so a stalled consumer stops the reads instead of buffering
//! without limit.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::transport::MAX_TRANSFER_UNIT;

/// Events produced by the reader task.
#[derive(Debug)]
pub enum ByteStreamEvent {
    /// A chunk of raw bytes, at most [`MAX_TRANSFER_UNIT`] long.
    Chunk(Bytes),
    /// The peer closed the stream. Terminal.
    EndOfStream,
    /// The stream failed. Terminal.
    Error(std::io::Error),
}

/// Spawn the reader task.
pub fn spawn_reader_task<R>(reader: R, tx: mpsc::Sender<ByteStreamEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(read_loop(reader, tx))
}

async fn read_loop<R>(mut reader: R, tx: mpsc::Sender<ByteStreamEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; MAX_TRANSFER_UNIT];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(ByteStreamEvent::EndOfStream).await;
                return;
            }
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if tx.send(ByteStreamEvent::Chunk(chunk)).await.is_err() {
                    // Consumer is gone; stop reading.
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(ByteStreamEvent::Error(e)).await;
                return;
            }
        }
    }
}
