//! Error type definitions for the Ace Stream proxy.
//!
//! This module defines all error types used throughout the application,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward.

use thiserror::Error;
use uuid::Uuid;

/// Top-level application error type
///
/// This enum represents all possible errors that can occur in the
/// application. It uses `thiserror` to provide automatic error trait
/// implementations and proper error chaining.
#[derive(Error, Debug)]
pub enum AppError {
    /// Upstream (engine) errors
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Streaming layer errors
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Session/PID allocator errors
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Validation errors
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Generic internal errors
    #[error("internal error: {message}")]
    Internal { message: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors talking to the upstream engine.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Transport-level connection failures
    #[error("failed to connect to upstream {url}: {message}")]
    Connect { url: String, message: String },

    /// Upstream answered, but not with a success status
    #[error("upstream returned status {status} for {url}")]
    BadStatus { status: u16, url: String },
}

/// Errors inside the stream fan-out machinery.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Ring buffers must hold at least one byte
    #[error("buffer capacity must be greater than zero")]
    ZeroCapacity,

    /// A client's chunk queue is saturated; the client is too slow
    #[error("client {id} send queue is full")]
    ClientQueueFull { id: Uuid },

    /// Send attempted on a client that was already closed
    #[error("client {id} is closed")]
    ClientClosed { id: Uuid },

    /// Start called twice on the same stream
    #[error("stream already started")]
    AlreadyStarted,
}

/// Errors from the PID/session allocator.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no session found for pid {pid}")]
    PidNotFound { pid: u64 },
}

/// Convenience methods for creating common error types
impl AppError {
    /// Create a validation error with a custom message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error means the upstream could not be established.
    ///
    /// The web layer maps these to 502; everything else pre-body is a 500.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Http(_))
    }
}

impl UpstreamError {
    pub fn connect<U: Into<String>, M: Into<String>>(url: U, message: M) -> Self {
        Self::Connect {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn bad_status<U: Into<String>>(status: u16, url: U) -> Self {
        Self::BadStatus {
            status,
            url: url.into(),
        }
    }
}
