//! Process-wide registry of active streams, keyed by content id.
//!
//! The multiplexer guarantees at most one upstream connection per content:
//! the first client's request creates the stream, later clients attach to
//! it, and the stream is torn down only once its client count drops to zero.
//!
//! Upstream lifetimes are deliberately decoupled from request lifetimes.
//! Establishment runs on a detached task, so a client that aborts while the
//! upstream GET is in flight leaves a perfectly usable stream behind for
//! whoever connects next.

use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StreamingConfig;
use crate::errors::types::{AppError, UpstreamError};
use crate::metrics::StreamMetrics;
use crate::models::ContentId;
use crate::sessions::SessionGuard;
use crate::streaming::circuit_breaker::CircuitBreaker;
use crate::streaming::client::StreamClient;
use crate::streaming::stream::Stream;

pub struct Multiplexer {
    streams: Mutex<HashMap<ContentId, Arc<Stream>>>,
    http_client: reqwest::Client,
    config: StreamingConfig,
    metrics: Arc<StreamMetrics>,
}

impl Multiplexer {
    pub fn new(
        http_client: reqwest::Client,
        config: StreamingConfig,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            http_client,
            config,
            metrics,
        }
    }

    pub fn metrics(&self) -> Arc<StreamMetrics> {
        Arc::clone(&self.metrics)
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }

    /// Find the stream for `content_id` or establish it.
    ///
    /// Runs on a detached task: if the requesting client disconnects while
    /// the upstream GET is in flight, establishment still completes and the
    /// stream is registered for subsequent clients. Returns the stream and
    /// whether it already existed.
    pub async fn get_or_create_stream(
        self: Arc<Self>,
        content_id: &ContentId,
        upstream_url: &str,
    ) -> Result<(Arc<Stream>, bool), AppError> {
        let this = self;
        let content_id = content_id.clone();
        let upstream_url = upstream_url.to_string();
        tokio::spawn(async move { this.get_or_create_inner(content_id, upstream_url).await })
            .await
            .map_err(|err| {
                AppError::internal(format!("stream establishment task failed: {err}"))
            })?
    }

    async fn get_or_create_inner(
        self: Arc<Self>,
        content_id: ContentId,
        upstream_url: String,
    ) -> Result<(Arc<Stream>, bool), AppError> {
        let mut streams = self.streams.lock().await;
        if let Some(existing) = streams.get(&content_id) {
            debug!(content_id = %content_id, "reusing existing stream");
            return Ok((Arc::clone(existing), true));
        }

        info!(content_id = %content_id, "establishing upstream for new stream");
        let response = self
            .http_client
            .get(&upstream_url)
            .send()
            .await
            .map_err(|err| UpstreamError::connect(&upstream_url, err.to_string()))?;
        if !response.status().is_success() {
            return Err(
                UpstreamError::bad_status(response.status().as_u16(), &upstream_url).into(),
            );
        }

        let breaker = Arc::new(CircuitBreaker::new(self.config.circuit_breaker.clone()));
        let stream = Arc::new(Stream::new(
            content_id.clone(),
            upstream_url,
            self.http_client.clone(),
            breaker,
            &self.config,
            Arc::clone(&self.metrics),
        )?);
        Arc::clone(&stream).start(response.bytes_stream().boxed())?;
        streams.insert(content_id, Arc::clone(&stream));
        self.metrics.set_streams_active(streams.len());
        Ok((stream, false))
    }

    /// Stop and drop the stream for `content_id` if it has no clients.
    /// A no-op for unknown ids and for streams that (re)gained a client.
    pub async fn remove_stream(&self, content_id: &ContentId) {
        let stream = {
            let mut streams = self.streams.lock().await;
            let empty = match streams.get(content_id) {
                Some(stream) => stream.client_count().await == 0,
                None => false,
            };
            if !empty {
                return;
            }
            let stream = streams.remove(content_id);
            self.metrics.set_streams_active(streams.len());
            stream
        };
        if let Some(stream) = stream {
            stream.stop().await;
            info!(content_id = %content_id, "removed idle stream");
        }
    }

    /// Attach a new client to the content's stream and return the streaming
    /// HTTP response. The `session` guard travels with the response body and
    /// releases the client's PID when the body is dropped.
    pub async fn serve_stream(
        self: Arc<Self>,
        content_id: ContentId,
        upstream_url: String,
        session: SessionGuard,
    ) -> Result<Response<Body>, AppError> {
        let (stream, _existed) = Arc::clone(&self)
            .get_or_create_stream(&content_id, &upstream_url)
            .await?;

        let (client, receiver) = StreamClient::new(self.config.client_buffer_size);
        let client = Arc::new(client);
        stream.add_client(Arc::clone(&client)).await;

        // A client joining mid-blackout is primed from the ring buffer so it
        // has content to show the moment the upstream recovers.
        if stream.is_reconnecting() {
            if let Err(err) = stream.send_buffer_to_client(&client) {
                warn!(
                    content_id = %content_id,
                    client_id = %client.id(),
                    error = %err,
                    "buffer replay overran the new client's queue"
                );
                let remaining = stream.remove_client(client.id()).await;
                if remaining == 0 {
                    self.remove_stream(&content_id).await;
                }
                return Err(err.into());
            }
        }

        let guard = ClientGuard {
            multiplexer: Arc::clone(&self),
            stream: Arc::clone(&stream),
            content_id,
            client_id: client.id(),
            session: Some(session),
        };
        let body = Body::from_stream(client_body(client, receiver, guard));

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "video/mp2t")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .body(body)
            .map_err(|err| AppError::internal(format!("failed to build response: {err}")))
    }

    /// Stop every stream; used on process shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<(ContentId, Arc<Stream>)> = {
            let mut streams = self.streams.lock().await;
            streams.drain().collect()
        };
        for (content_id, stream) in drained {
            stream.stop().await;
            info!(content_id = %content_id, "stopped stream on shutdown");
        }
        self.metrics.set_streams_active(0);
    }
}

/// Runs the per-client teardown when the response body is dropped, whether
/// the stream ended, the client was evicted, or the connection vanished.
struct ClientGuard {
    multiplexer: Arc<Multiplexer>,
    stream: Arc<Stream>,
    content_id: ContentId,
    client_id: Uuid,
    session: Option<SessionGuard>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let multiplexer = Arc::clone(&self.multiplexer);
        let stream = Arc::clone(&self.stream);
        let content_id = self.content_id.clone();
        let client_id = self.client_id;
        let session = self.session.take();
        tokio::spawn(async move {
            let remaining = stream.remove_client(client_id).await;
            if remaining == 0 {
                multiplexer.remove_stream(&content_id).await;
            }
            // Releases the PID and sweeps disconnected sessions.
            drop(session);
        });
    }
}

/// The per-client writer: drains the chunk queue into the hyper connection
/// until the client's done-signal fires or the connection goes away.
fn client_body(
    client: Arc<StreamClient>,
    mut receiver: mpsc::Receiver<Bytes>,
    guard: ClientGuard,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> {
    let done = client.done();
    async_stream::stream! {
        let _guard = guard;
        loop {
            let chunk = tokio::select! {
                biased;
                chunk = receiver.recv() => chunk,
                _ = done.cancelled() => break,
            };
            match chunk {
                Some(bytes) => yield Ok::<Bytes, Infallible>(bytes),
                None => break,
            }
        }
        // close() sets the closed flag before signalling done, so whatever
        // is queued now is all there will ever be; hand it over before
        // ending the body.
        while let Ok(bytes) = receiver.try_recv() {
            yield Ok::<Bytes, Infallible>(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use std::time::Duration;

    fn test_multiplexer() -> Arc<Multiplexer> {
        Arc::new(Multiplexer::new(
            reqwest::Client::new(),
            StreamingConfig {
                client_buffer_size: 64 * 1024,
                reconnect_buffer_size: 64 * 1024,
                reconnect_initial_backoff: Duration::from_millis(10),
                reconnect_max_backoff: Duration::from_millis(50),
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 3,
                    cooldown: Duration::from_millis(100),
                    half_open_max_probes: 1,
                },
            },
            Arc::new(StreamMetrics::new()),
        ))
    }

    #[tokio::test]
    async fn remove_stream_on_unknown_id_is_a_noop() {
        let multiplexer = test_multiplexer();
        let content_id = ContentId::parse("0123456789abcdef0123456789abcdef01234567").unwrap();
        multiplexer.remove_stream(&content_id).await;
        assert_eq!(multiplexer.stream_count().await, 0);
    }

    #[tokio::test]
    async fn establishment_failure_registers_nothing() {
        let multiplexer = test_multiplexer();
        let content_id = ContentId::parse("0123456789abcdef0123456789abcdef01234567").unwrap();
        // Nothing listens on this port.
        let result = Arc::clone(&multiplexer)
            .get_or_create_stream(&content_id, "http://127.0.0.1:9/ace/getstream")
            .await;
        assert!(result.is_err());
        assert_eq!(multiplexer.stream_count().await, 0);
    }
}
