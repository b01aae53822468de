//! The stream multiplexing core.
//!
//! One upstream connection per content, any number of clients. The pieces:
//!
//!   - ring_buffer: last-N-bytes buffer that masks reconnection gaps.
//!   - circuit_breaker: stops hammering an upstream that keeps failing.
//!   - client: a single response sink with a bounded, non-blocking queue.
//!   - stream: the fan-out task; owns the upstream reader and reconnection.
//!   - multiplexer: the process-wide registry tying it all together.

pub mod circuit_breaker;
pub mod client;
pub mod multiplexer;
pub mod ring_buffer;
pub mod stream;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use client::StreamClient;
pub use multiplexer::Multiplexer;
pub use ring_buffer::RingBuffer;
pub use stream::Stream;
