//! Error handling for the application.

pub mod types;

pub use types::{AppError, SessionError, StreamError, UpstreamError};
