//! A single HTTP response sink attached to a stream's fan-out.
//!
//! Each client owns a bounded chunk queue; the fan-out enqueues without ever
//! blocking, and a saturated queue marks the client as too slow to keep. The
//! done-signal tears the client's writer down exactly once.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::types::StreamError;

/// Queue slot granularity; a client buffering `client_buffer_size` bytes
/// gets `client_buffer_size / QUEUE_SLOT_BYTES` queue slots.
pub const QUEUE_SLOT_BYTES: usize = 4096;

#[derive(Debug)]
pub struct StreamClient {
    id: Uuid,
    sender: mpsc::Sender<Bytes>,
    done: CancellationToken,
    closed: AtomicBool,
}

impl StreamClient {
    /// Create a client with a chunk queue sized from `buffer_size` bytes.
    /// Returns the client and the receiving half its writer drains.
    pub fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let slots = (buffer_size / QUEUE_SLOT_BYTES).max(1);
        let (sender, receiver) = mpsc::channel(slots);
        (
            Self {
                id: Uuid::new_v4(),
                sender,
                done: CancellationToken::new(),
                closed: AtomicBool::new(false),
            },
            receiver,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Token cancelled exactly once by [`close`](Self::close).
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Copy `data` and enqueue it without blocking.
    ///
    /// The copy matters: the fan-out reuses its read buffer between
    /// iterations. A full queue is surfaced as
    /// [`StreamError::ClientQueueFull`]; the stream treats that as a slow
    /// client and closes it rather than backpressuring the upstream.
    pub fn send(&self, data: &[u8]) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::ClientClosed { id: self.id });
        }
        let chunk = Bytes::copy_from_slice(data);
        match self.sender.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(StreamError::ClientQueueFull { id: self.id })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(StreamError::ClientClosed { id: self.id })
            }
        }
    }

    /// Idempotent: the first call signals done, later calls are no-ops.
    ///
    /// The closed flag is set before the done-signal fires so a writer woken
    /// by the signal can drain the queue knowing nothing more will arrive.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.done.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_chunks_in_order() {
        let (client, mut rx) = StreamClient::new(QUEUE_SLOT_BYTES * 4);
        client.send(b"one").unwrap();
        client.send(b"two").unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn send_copies_the_callers_buffer() {
        let (client, mut rx) = StreamClient::new(QUEUE_SLOT_BYTES);
        let mut buf = *b"abcd";
        client.send(&buf).unwrap();
        buf.copy_from_slice(b"zzzz");
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"abcd"));
    }

    #[tokio::test]
    async fn full_queue_is_reported_as_slow_client() {
        // One slot: the second undrained send must fail fast.
        let (client, _rx) = StreamClient::new(QUEUE_SLOT_BYTES);
        client.send(b"first").unwrap();
        let err = client.send(b"second").unwrap_err();
        assert!(matches!(err, StreamError::ClientQueueFull { .. }));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (client, _rx) = StreamClient::new(QUEUE_SLOT_BYTES);
        client.close();
        let err = client.send(b"late").unwrap_err();
        assert!(matches!(err, StreamError::ClientClosed { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_signals_done() {
        let (client, _rx) = StreamClient::new(QUEUE_SLOT_BYTES);
        let done = client.done();
        assert!(!done.is_cancelled());
        client.close();
        client.close();
        assert!(done.is_cancelled());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn tiny_buffer_still_gets_one_slot() {
        let (client, mut rx) = StreamClient::new(1);
        client.send(b"only").unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"only"));
    }
}
