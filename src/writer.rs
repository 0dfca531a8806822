//! Dedicated writer task for outbound frames.
//!
//! Frames queue into a bounded mpsc channel and a single task drains it,
//! writing each frame to the stream in chunks of at most
//! [`MAX_TRANSFER_UNIT`] bytes. Senders share the queue through cloneable
//! [`WriterHandle`]s; a full queue suspends the sender, which is the
//! backpressure signal.
//!
//! # Architecture
//!
//! ```text
//! Sender 1 ─┐
//! Sender 2 ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► Stream
//! Sender N ─┘
//! ```
//!
//! A write failure ends the task with the error; frames still queued are
//! discarded, and further sends on the handle fail.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, StatewireError};
use crate::transport::MAX_TRANSFER_UNIT;

/// Default capacity of the outbound frame queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Capacity of the frame queue. A full queue suspends senders.
    pub queue_capacity: usize,
    /// Optional per-chunk write timeout.
    pub write_timeout: Option<Duration>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            write_timeout: None,
        }
    }
}

/// Handle for queueing frames onto the writer task.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    pending: Arc<AtomicUsize>,
}

impl WriterHandle {
    /// Queue a frame for writing.
    ///
    /// Suspends while the queue is full. Fails with
    /// [`StatewireError::SessionClosed`] once the writer task is gone.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            StatewireError::SessionClosed
        })
    }

    /// Number of frames queued but not yet written.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

/// Spawn the writer task.
///
/// Returns a handle for queueing frames and the join handle of the task.
/// The task ends when every handle is dropped (clean) or a write fails.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let task = tokio::spawn(writer_loop(writer, rx, Arc::clone(&pending), config));

    (WriterHandle { tx, pending }, task)
}

async fn writer_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Bytes>,
    pending: Arc<AtomicUsize>,
    config: WriterConfig,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let result = write_frame(&mut writer, &frame, config.write_timeout).await;
        pending.fetch_sub(1, Ordering::Relaxed);
        result?;
    }
    Ok(())
}

/// Write one frame in chunks of at most [`MAX_TRANSFER_UNIT`] bytes.
async fn write_frame<W>(writer: &mut W, frame: &[u8], write_timeout: Option<Duration>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // A zero-length write reads as end-of-stream on the far side.
    if frame.is_empty() {
        return Ok(());
    }

    let mut offset = 0;
    while offset < frame.len() {
        let end = (offset + MAX_TRANSFER_UNIT).min(frame.len());
        let chunk = &frame[offset..end];

        let written = match write_timeout {
            Some(timeout) => tokio::time::timeout(timeout, writer.write(chunk))
                .await
                .map_err(|_| StatewireError::WriteTimeout)??,
            None => writer.write(chunk).await?,
        };

        if written == 0 {
            return Err(StatewireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "stream accepted no bytes",
            )));
        }

        offset += written;
    }

    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncReadExt};

    /// Records the size of every write call it receives.
    #[derive(Default)]
    struct RecordingWriter {
        writes: Vec<usize>,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.writes.push(buf.len());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Fails every write with a broken pipe.
    struct FailingWriter;

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Never completes a write.
    struct StalledWriter;

    impl AsyncWrite for StalledWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_frame_reaches_stream() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(Bytes::from_static(b"hello")).await.unwrap();
        drop(handle);

        task.await.unwrap().unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(&received[..], b"hello");
    }

    #[tokio::test]
    async fn test_chunk_sizes_capped_at_transfer_unit() {
        // Drive write_frame directly so the writer stays observable.
        let mut writer = RecordingWriter::default();
        write_frame(&mut writer, &vec![0xAB; 3000], None).await.unwrap();
        assert_eq!(writer.writes, vec![1024, 1024, 952]);
    }

    #[tokio::test]
    async fn test_empty_frame_writes_nothing() {
        let mut writer = RecordingWriter::default();
        write_frame(&mut writer, b"", None).await.unwrap();
        assert!(writer.writes.is_empty());
    }

    #[tokio::test]
    async fn test_frames_preserve_order_under_backpressure() {
        // Tiny stream buffer so the writer stalls until the reader drains.
        let (client, mut server) = duplex(8);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            received
        });

        for i in 0..10u8 {
            handle.send(Bytes::from(vec![i; 100])).await.unwrap();
        }
        drop(handle);

        task.await.unwrap().unwrap();

        let received = reader.await.unwrap();
        assert_eq!(received.len(), 1000);
        for (i, window) in received.chunks(100).enumerate() {
            assert!(window.iter().all(|&b| b == i as u8));
        }
    }

    #[tokio::test]
    async fn test_write_failure_ends_task_and_handle() {
        let (handle, task) = spawn_writer_task(FailingWriter, WriterConfig::default());

        handle.send(Bytes::from_static(b"doomed")).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, StatewireError::Io(_)));

        // The queue is gone with the task, so later sends fail.
        let err = handle.send(Bytes::from_static(b"after")).await.unwrap_err();
        assert!(matches!(err, StatewireError::SessionClosed));
    }

    #[tokio::test]
    async fn test_stalled_write_times_out() {
        let config = WriterConfig {
            write_timeout: Some(Duration::from_millis(50)),
            ..WriterConfig::default()
        };
        let (handle, task) = spawn_writer_task(StalledWriter, config);

        handle.send(Bytes::from_static(b"stuck")).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, StatewireError::WriteTimeout));
    }

    #[tokio::test]
    async fn test_dropping_all_handles_ends_task_cleanly() {
        let (client, _server) = duplex(64);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        let clone = handle.clone();
        drop(handle);
        drop(clone);

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pending_count_tracks_queue() {
        let (client, _server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        assert_eq!(handle.pending_count(), 0);
        handle.send(Bytes::from_static(b"one")).await.unwrap();
        // The task may have drained it already; the count only ever trails.
        assert!(handle.pending_count() <= 1);
    }
}
