//! HTTP request handlers.

use axum::{
    body::Body,
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, Method, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::AppState;
use crate::errors::types::AppError;
use crate::models::{ClientFingerprint, ContentId};
use crate::sessions::SessionGuard;

/// Query parameters accepted on the stream endpoint. The `transcode_*`
/// values are forwarded to the engine untouched.
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub id: Option<String>,
    pub transcode_audio: Option<String>,
    pub transcode_mp3: Option<String>,
    pub transcode_ac3: Option<String>,
}

/// `GET /stream?id={40hex}`: attach to the content's shared stream.
///
/// HEAD answers with the streaming headers only, for player pre-flight
/// probes; it allocates no PID and dials no upstream. Anything other than
/// GET/HEAD is a 405.
pub async fn stream_channel(
    State(state): State<AppState>,
    method: Method,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> Response<Body> {
    match method {
        Method::GET => {}
        Method::HEAD => return streaming_headers_response(),
        _ => {
            return plain_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "only GET and HEAD are supported",
            )
        }
    }

    let raw_id = match params.id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => return plain_response(StatusCode::BAD_REQUEST, "missing id parameter"),
    };
    let content_id = match ContentId::parse(raw_id) {
        Ok(id) => id,
        Err(err) => return plain_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let fingerprint = client_fingerprint(&headers, remote_addr);
    let pid = state.sessions.get_or_create_pid(&content_id, &fingerprint);
    let session = SessionGuard::new(Arc::clone(&state.sessions), pid);

    let upstream_url =
        match engine_stream_url(&state.config.engine.base_url, &content_id, pid, &params) {
            Ok(url) => url,
            Err(err) => {
                error!(error = %err, "failed to compose engine URL");
                return plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to compose upstream URL",
                );
            }
        };

    info!(
        content_id = %content_id,
        pid,
        client = %fingerprint,
        "client requested stream"
    );

    match Arc::clone(&state.multiplexer)
        .serve_stream(content_id.clone(), upstream_url, session)
        .await
    {
        Ok(response) => response,
        Err(err) if err.is_upstream_failure() => {
            error!(content_id = %content_id, error = %err, "failed to establish upstream");
            plain_response(StatusCode::BAD_GATEWAY, "failed to connect to upstream")
        }
        Err(err) => {
            warn!(content_id = %content_id, error = %err, "stream setup failed");
            plain_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "stream temporarily unavailable",
            )
        }
    }
}

/// `GET /health`: liveness plus a streaming metrics snapshot.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.metrics.snapshot();
    Json(serde_json::json!({
        "status": "healthy",
        "active_sessions": state.sessions.active_sessions(),
        "streaming": metrics,
    }))
}

/// The viewer's identity as the PID allocator sees it: proxy-aware IP plus
/// user agent.
fn client_fingerprint(headers: &HeaderMap, remote_addr: SocketAddr) -> ClientFingerprint {
    let forwarded_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        });
    let ip = forwarded_ip.unwrap_or_else(|| remote_addr.ip().to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();
    ClientFingerprint::new(ip, user_agent)
}

/// Compose `{base}/ace/getstream?id=…&pid=…` plus any pass-through params.
fn engine_stream_url(
    base_url: &str,
    content_id: &ContentId,
    pid: u64,
    params: &StreamParams,
) -> Result<String, AppError> {
    let mut url = url::Url::parse(base_url)
        .map_err(|err| AppError::configuration(format!("invalid engine base URL: {err}")))?;
    url.set_path("/ace/getstream");
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("id", content_id.as_str());
        query.append_pair("pid", &pid.to_string());
        if let Some(value) = &params.transcode_audio {
            query.append_pair("transcode_audio", value);
        }
        if let Some(value) = &params.transcode_mp3 {
            query.append_pair("transcode_mp3", value);
        }
        if let Some(value) = &params.transcode_ac3 {
            query.append_pair("transcode_ac3", value);
        }
    }
    Ok(url.to_string())
}

fn streaming_headers_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn plain_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
