//! One upstream connection fanned out to many attached clients.
//!
//! A `Stream` owns exactly one upstream reader at a time. The fan-out task
//! appends every chunk to the reconnection ring buffer and then delivers it
//! to a snapshot of the attached clients. Mid-stream upstream failures are
//! handled by the reconnect loop without disturbing the clients: their
//! queues keep draining while the upstream is re-established, so a brief
//! outage looks like nothing more than a short stall.
//!
//! Termination is deliberate and narrow: upstream EOF, shutdown, or an
//! upstream error with no clients left. A client disconnecting never touches
//! the upstream.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StreamingConfig;
use crate::errors::types::StreamError;
use crate::metrics::StreamMetrics;
use crate::models::ContentId;
use crate::streaming::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::streaming::client::StreamClient;
use crate::streaming::ring_buffer::RingBuffer;

/// Boxed upstream byte source; in production this is a reqwest
/// `bytes_stream`, in tests anything that yields the same items.
pub type UpstreamBytes = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// Chunk size used when replaying the ring buffer to a late joiner.
pub const REPLAY_CHUNK_SIZE: usize = 32 * 1024;

pub struct Stream {
    content_id: ContentId,
    upstream_url: String,
    http_client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    buffer: RingBuffer,
    clients: RwLock<HashMap<Uuid, Arc<StreamClient>>>,
    reconnecting: AtomicBool,
    started: AtomicBool,
    cancel: CancellationToken,
    fanout: std::sync::Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<StreamMetrics>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Stream {
    pub fn new(
        content_id: ContentId,
        upstream_url: String,
        http_client: reqwest::Client,
        breaker: Arc<CircuitBreaker>,
        config: &StreamingConfig,
        metrics: Arc<StreamMetrics>,
    ) -> Result<Self, StreamError> {
        Ok(Self {
            content_id,
            upstream_url,
            http_client,
            breaker,
            buffer: RingBuffer::new(config.reconnect_buffer_size)?,
            clients: RwLock::new(HashMap::new()),
            reconnecting: AtomicBool::new(false),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            fanout: std::sync::Mutex::new(None),
            metrics,
            initial_backoff: config.reconnect_initial_backoff,
            max_backoff: config.reconnect_max_backoff,
        })
    }

    pub fn content_id(&self) -> &ContentId {
        &self.content_id
    }

    /// Launch the fan-out task over an already-established upstream body.
    /// May be called once; later calls fail.
    pub fn start(self: Arc<Self>, upstream: UpstreamBytes) -> Result<(), StreamError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StreamError::AlreadyStarted);
        }
        let stream = Arc::clone(&self);
        let handle = tokio::spawn(stream.run(upstream));
        *self.fanout.lock().expect("fan-out handle lock poisoned") = Some(handle);
        Ok(())
    }

    /// Cancel the fan-out and wait for it to finish. Safe to call after the
    /// stream has already terminated on its own.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .fanout
            .lock()
            .expect("fan-out handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                debug!(
                    content_id = %self.content_id,
                    error = %err,
                    "fan-out task did not join cleanly"
                );
            }
        }
    }

    pub async fn add_client(&self, client: Arc<StreamClient>) {
        let count = {
            let mut clients = self.clients.write().await;
            clients.insert(client.id(), Arc::clone(&client));
            clients.len()
        };
        self.metrics.client_connected();
        // Lost race with termination: the fan-out already drained the client
        // map, so nobody else will ever close this client.
        if self.cancel.is_cancelled() {
            client.close();
        }
        info!(content_id = %self.content_id, clients = count, "client attached");
    }

    /// Close and detach a client, returning how many remain.
    pub async fn remove_client(&self, client_id: Uuid) -> usize {
        let (removed, remaining) = {
            let mut clients = self.clients.write().await;
            let removed = clients.remove(&client_id);
            (removed, clients.len())
        };
        if let Some(client) = removed {
            client.close();
            self.metrics.client_disconnected();
            info!(
                content_id = %self.content_id,
                client_id = %client_id,
                clients = remaining,
                "client detached"
            );
        }
        remaining
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Replay the ring buffer into a freshly attached client.
    ///
    /// Called for clients that join while the upstream is being
    /// re-established, so they have content to show the moment the stream
    /// recovers. A full queue aborts the replay; the caller evicts the
    /// client and it can simply reconnect.
    pub fn send_buffer_to_client(&self, client: &StreamClient) -> Result<(), StreamError> {
        let snapshot = self.buffer.peek_all();
        for chunk in snapshot.chunks(REPLAY_CHUNK_SIZE) {
            client.send(chunk)?;
        }
        if !snapshot.is_empty() {
            debug!(
                content_id = %self.content_id,
                client_id = %client.id(),
                bytes = snapshot.len(),
                "replayed buffered bytes to late joiner"
            );
        }
        Ok(())
    }

    async fn run(self: Arc<Self>, mut upstream: UpstreamBytes) {
        debug!(content_id = %self.content_id, "fan-out loop started");
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => break,
                chunk = upstream.next() => chunk,
            };
            match chunk {
                None => {
                    info!(content_id = %self.content_id, "upstream reached EOF");
                    break;
                }
                Some(Err(err)) => {
                    if self.cancel.is_cancelled() || self.client_count().await == 0 {
                        break;
                    }
                    warn!(
                        content_id = %self.content_id,
                        error = %err,
                        "upstream read failed, entering reconnection"
                    );
                    // Release the dead connection before retrying.
                    upstream = futures::stream::empty().boxed();
                    match self.reconnect().await {
                        Some(replacement) => upstream = replacement,
                        None => break,
                    }
                }
                Some(Ok(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    self.buffer.write(&data);
                    self.metrics.add_upstream_bytes(data.len() as u64);
                    self.fan_out(&data).await;
                }
            }
        }
        // Mark the stream terminated before draining clients so a racing
        // add_client sees it and closes its client itself.
        self.cancel.cancel();
        self.shutdown_clients().await;
        debug!(content_id = %self.content_id, "fan-out loop finished");
    }

    /// Deliver one chunk to every attached client.
    ///
    /// Delivery is a snapshot-then-send wave: `send` can never suspend, so
    /// by the time the loop ends the whole wave has completed. A client
    /// whose queue is full gets closed on the spot; its teardown runs on its
    /// own writer path and never stalls this loop.
    async fn fan_out(&self, data: &[u8]) {
        let snapshot: Vec<Arc<StreamClient>> = {
            let clients = self.clients.read().await;
            clients.values().cloned().collect()
        };
        for client in snapshot {
            if client.is_closed() {
                continue;
            }
            if let Err(err) = client.send(data) {
                if matches!(err, StreamError::ClientQueueFull { .. }) {
                    warn!(
                        content_id = %self.content_id,
                        client_id = %client.id(),
                        "client cannot keep up, closing it"
                    );
                    self.metrics.client_evicted();
                }
                client.close();
            }
        }
    }

    /// Re-establish the upstream with exponential backoff through the
    /// circuit breaker. Returns the new byte source, or `None` when the
    /// stream should terminate instead (shutdown or no clients left).
    async fn reconnect(&self) -> Option<UpstreamBytes> {
        self.reconnecting.store(true, Ordering::SeqCst);
        let outage_started = Instant::now();
        let mut backoff = self.initial_backoff;

        let replacement = loop {
            if self.cancel.is_cancelled() || self.client_count().await == 0 {
                break None;
            }
            if self.breaker.state() == CircuitState::Open {
                debug!(
                    content_id = %self.content_id,
                    "circuit open, waiting out the cooldown"
                );
                if !self.sleep_unless_cancelled(self.breaker.cooldown()).await {
                    break None;
                }
                continue;
            }
            if !self.sleep_unless_cancelled(backoff).await {
                break None;
            }
            if self.client_count().await == 0 {
                break None;
            }

            self.metrics.reconnect_attempt();
            let url = self.upstream_url.clone();
            let http_client = self.http_client.clone();
            let attempt = self
                .breaker
                .execute(|| async move {
                    let response = http_client
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| e.to_string())?;
                    if !response.status().is_success() {
                        return Err(format!("upstream status {}", response.status()));
                    }
                    Ok(response)
                })
                .await;

            match attempt {
                Ok(response) => {
                    let downtime = outage_started.elapsed();
                    info!(
                        content_id = %self.content_id,
                        downtime_ms = downtime.as_millis() as u64,
                        "upstream reconnected"
                    );
                    self.metrics.reconnected(downtime);
                    break Some(response.bytes_stream().boxed());
                }
                Err(err) => {
                    warn!(
                        content_id = %self.content_id,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "reconnect attempt failed"
                    );
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        };

        self.reconnecting.store(false, Ordering::SeqCst);
        replacement
    }

    async fn sleep_unless_cancelled(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn shutdown_clients(&self) {
        let drained: Vec<Arc<StreamClient>> = {
            let mut clients = self.clients.write().await;
            clients.drain().map(|(_, client)| client).collect()
        };
        for client in &drained {
            client.close();
            self.metrics.client_disconnected();
        }
        if !drained.is_empty() {
            info!(
                content_id = %self.content_id,
                clients = drained.len(),
                "closed all clients on stream termination"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::streaming::client::QUEUE_SLOT_BYTES;

    fn test_stream(config: &StreamingConfig) -> Arc<Stream> {
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        Arc::new(
            Stream::new(
                ContentId::parse("0123456789abcdef0123456789abcdef01234567").unwrap(),
                "http://127.0.0.1:1/ace/getstream".to_string(),
                reqwest::Client::new(),
                breaker,
                config,
                Arc::new(StreamMetrics::new()),
            )
            .unwrap(),
        )
    }

    fn test_config() -> StreamingConfig {
        StreamingConfig {
            client_buffer_size: QUEUE_SLOT_BYTES * 8,
            reconnect_buffer_size: 64 * 1024,
            reconnect_initial_backoff: Duration::from_millis(10),
            reconnect_max_backoff: Duration::from_millis(50),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_millis(100),
                half_open_max_probes: 1,
            },
        }
    }

    fn upstream_of(chunks: Vec<&'static [u8]>) -> UpstreamBytes {
        futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, reqwest::Error>(Bytes::from_static(c))),
        )
        .boxed()
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let stream = test_stream(&test_config());
        Arc::clone(&stream).start(upstream_of(vec![])).unwrap();
        let err = Arc::clone(&stream).start(upstream_of(vec![])).unwrap_err();
        assert!(matches!(err, StreamError::AlreadyStarted));
        stream.stop().await;
    }

    #[tokio::test]
    async fn delivers_upstream_chunks_to_client_then_closes_on_eof() {
        let stream = test_stream(&test_config());
        let (client, mut rx) = StreamClient::new(QUEUE_SLOT_BYTES * 8);
        let client = Arc::new(client);
        let done = client.done();
        stream.add_client(Arc::clone(&client)).await;

        Arc::clone(&stream)
            .start(upstream_of(vec![b"ABC", b"DEF"]))
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"ABC"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"DEF"));
        done.cancelled().await;
        assert_eq!(stream.client_count().await, 0);
    }

    #[tokio::test]
    async fn slow_client_is_closed_without_stalling_peers() {
        let stream = test_stream(&test_config());
        // One queue slot and nobody draining it.
        let (slow, _slow_rx) = StreamClient::new(QUEUE_SLOT_BYTES);
        let slow = Arc::new(slow);
        let (fast, mut fast_rx) = StreamClient::new(QUEUE_SLOT_BYTES * 8);
        let fast = Arc::new(fast);
        stream.add_client(Arc::clone(&slow)).await;
        stream.add_client(Arc::clone(&fast)).await;

        Arc::clone(&stream)
            .start(upstream_of(vec![b"one", b"two", b"three"]))
            .unwrap();

        assert_eq!(fast_rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(fast_rx.recv().await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(fast_rx.recv().await.unwrap(), Bytes::from_static(b"three"));
        slow.done().cancelled().await;
        assert!(slow.is_closed());
        assert!(fast.is_closed()); // EOF teardown closes the survivors too
    }

    #[tokio::test]
    async fn removing_one_client_leaves_the_other_attached() {
        let stream = test_stream(&test_config());
        let (a, _rx_a) = StreamClient::new(QUEUE_SLOT_BYTES);
        let a = Arc::new(a);
        let (b, _rx_b) = StreamClient::new(QUEUE_SLOT_BYTES);
        let b = Arc::new(b);
        stream.add_client(Arc::clone(&a)).await;
        stream.add_client(Arc::clone(&b)).await;

        assert_eq!(stream.remove_client(a.id()).await, 1);
        assert!(a.is_closed());
        assert!(!b.is_closed());
        // Removing an unknown client is a no-op.
        assert_eq!(stream.remove_client(a.id()).await, 1);
    }

    #[tokio::test]
    async fn buffer_replay_feeds_a_late_joiner() {
        let config = test_config();
        let stream = test_stream(&config);
        stream.buffer.write(b"buffered-bytes");

        let (client, mut rx) = StreamClient::new(QUEUE_SLOT_BYTES * 8);
        stream.send_buffer_to_client(&client).unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            Bytes::from_static(b"buffered-bytes")
        );
    }

    #[tokio::test]
    async fn buffer_replay_overrun_reports_queue_full() {
        let config = test_config();
        let stream = test_stream(&config);
        let big = vec![0u8; REPLAY_CHUNK_SIZE * 2];
        stream.buffer.write(&big);

        // One slot: the second replay chunk cannot be enqueued.
        let (client, _rx) = StreamClient::new(QUEUE_SLOT_BYTES);
        let err = stream.send_buffer_to_client(&client).unwrap_err();
        assert!(matches!(err, StreamError::ClientQueueFull { .. }));
    }

    #[tokio::test]
    async fn stop_terminates_a_pending_stream() {
        let stream = test_stream(&test_config());
        // An upstream that never yields.
        let pending = futures::stream::pending::<Result<Bytes, reqwest::Error>>().boxed();
        Arc::clone(&stream).start(pending).unwrap();
        let (client, _rx) = StreamClient::new(QUEUE_SLOT_BYTES);
        let client = Arc::new(client);
        stream.add_client(Arc::clone(&client)).await;

        stream.stop().await;
        assert!(client.is_closed());
        assert_eq!(stream.client_count().await, 0);
    }
}
