//! Fixed-capacity byte ring for masking reconnection gaps.
//!
//! Every chunk read from the upstream is appended here before fan-out. When
//! the upstream drops, clients keep draining their own queues while the
//! stream reconnects; clients that join during the blackout are primed from
//! this buffer so they see content the moment the stream recovers.
//!
//! Semantics: writes always succeed in full and overwrite the oldest bytes
//! once the ring is full, so the buffer always holds the last `capacity`
//! bytes written.

use std::sync::Mutex;

use crate::errors::types::StreamError;

#[derive(Debug)]
struct RingState {
    buf: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    full: bool,
}

impl RingState {
    fn available(&self) -> usize {
        if self.full {
            self.buf.len()
        } else if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.buf.len() - self.read_pos + self.write_pos
        }
    }
}

/// Mutex-guarded byte ring; writers and peekers may run concurrently from
/// different tasks.
#[derive(Debug)]
pub struct RingBuffer {
    state: Mutex<RingState>,
    capacity: usize,
}

impl RingBuffer {
    /// Create a ring holding the last `capacity` bytes written.
    pub fn new(capacity: usize) -> Result<Self, StreamError> {
        if capacity == 0 {
            return Err(StreamError::ZeroCapacity);
        }
        Ok(Self {
            state: Mutex::new(RingState {
                buf: vec![0u8; capacity].into_boxed_slice(),
                read_pos: 0,
                write_pos: 0,
                full: false,
            }),
            capacity,
        })
    }

    /// Append `data`, overwriting the oldest bytes on overflow. Never fails,
    /// never blocks beyond the internal lock, returns the number of bytes
    /// accepted (always `data.len()`).
    pub fn write(&self, data: &[u8]) -> usize {
        let mut state = self.state.lock().expect("ring buffer lock poisoned");
        let capacity = self.capacity;

        // Larger-than-capacity writes reduce to their trailing window.
        let src = if data.len() > capacity {
            &data[data.len() - capacity..]
        } else {
            data
        };

        let overwrites = state.full || src.len() > capacity - state.available();

        let write_pos = state.write_pos;
        let first = (capacity - write_pos).min(src.len());
        state.buf[write_pos..write_pos + first].copy_from_slice(&src[..first]);
        let rest = src.len() - first;
        if rest > 0 {
            state.buf[..rest].copy_from_slice(&src[first..]);
        }
        state.write_pos = (write_pos + src.len()) % capacity;

        if overwrites {
            // Oldest bytes were consumed by this write; the read cursor
            // follows the write cursor.
            state.read_pos = state.write_pos;
            state.full = true;
        } else if state.write_pos == state.read_pos {
            state.full = true;
        }

        data.len()
    }

    /// Destructively copy up to `dst.len()` of the oldest live bytes into
    /// `dst`, returning the count copied.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let mut state = self.state.lock().expect("ring buffer lock poisoned");
        let count = state.available().min(dst.len());
        if count == 0 {
            return 0;
        }
        let capacity = self.capacity;
        let read_pos = state.read_pos;
        let first = (capacity - read_pos).min(count);
        dst[..first].copy_from_slice(&state.buf[read_pos..read_pos + first]);
        if count > first {
            dst[first..count].copy_from_slice(&state.buf[..count - first]);
        }
        state.read_pos = (read_pos + count) % capacity;
        state.full = false;
        count
    }

    /// Non-destructive snapshot of all live bytes, oldest first. Atomic with
    /// respect to concurrent writes; does not advance the read cursor.
    pub fn peek_all(&self) -> Vec<u8> {
        let state = self.state.lock().expect("ring buffer lock poisoned");
        let count = state.available();
        let mut out = Vec::with_capacity(count);
        if count == 0 {
            return out;
        }
        let first = (self.capacity - state.read_pos).min(count);
        out.extend_from_slice(&state.buf[state.read_pos..state.read_pos + first]);
        if count > first {
            out.extend_from_slice(&state.buf[..count - first]);
        }
        out
    }

    /// Count of live bytes.
    pub fn available(&self) -> usize {
        self.state
            .lock()
            .expect("ring buffer lock poisoned")
            .available()
    }

    /// Drop all live bytes.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("ring buffer lock poisoned");
        state.read_pos = 0;
        state.write_pos = 0;
        state.full = false;
    }

    /// Fixed capacity in bytes.
    pub fn size(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(
            RingBuffer::new(0),
            Err(StreamError::ZeroCapacity)
        ));
    }

    #[test]
    fn holds_all_bytes_when_under_capacity() {
        let ring = RingBuffer::new(16).unwrap();
        assert_eq!(ring.write(b"hello"), 5);
        assert_eq!(ring.available(), 5);
        assert_eq!(ring.peek_all(), b"hello");
    }

    #[test]
    fn keeps_last_capacity_bytes_on_overflow() {
        let ring = RingBuffer::new(8).unwrap();
        ring.write(b"abcdefgh");
        ring.write(b"ijkl");
        assert_eq!(ring.available(), 8);
        assert_eq!(ring.peek_all(), b"efghijkl");
    }

    #[test]
    fn single_write_larger_than_capacity_keeps_tail() {
        let ring = RingBuffer::new(4).unwrap();
        assert_eq!(ring.write(b"0123456789"), 10);
        assert_eq!(ring.peek_all(), b"6789");
    }

    #[test]
    fn many_small_writes_keep_last_window() {
        let ring = RingBuffer::new(10).unwrap();
        let mut expected = Vec::new();
        for i in 0u32..100 {
            let chunk = [b'a' + (i % 26) as u8; 3];
            ring.write(&chunk);
            expected.extend_from_slice(&chunk);
        }
        let tail = &expected[expected.len() - 10..];
        assert_eq!(ring.peek_all(), tail);
    }

    #[test]
    fn peek_does_not_advance_read_cursor() {
        let ring = RingBuffer::new(8).unwrap();
        ring.write(b"abcd");
        assert_eq!(ring.peek_all(), b"abcd");
        assert_eq!(ring.peek_all(), b"abcd");
        assert_eq!(ring.available(), 4);
    }

    #[test]
    fn read_advances_and_peek_returns_newer_bytes() {
        let ring = RingBuffer::new(8).unwrap();
        ring.write(b"abcdef");
        let mut dst = [0u8; 3];
        assert_eq!(ring.read(&mut dst), 3);
        assert_eq!(&dst, b"abc");
        assert_eq!(ring.peek_all(), b"def");
    }

    #[test]
    fn read_wraps_around_the_ring() {
        let ring = RingBuffer::new(4).unwrap();
        ring.write(b"abcd");
        let mut dst = [0u8; 2];
        assert_eq!(ring.read(&mut dst), 2);
        ring.write(b"ef");
        let mut rest = [0u8; 4];
        assert_eq!(ring.read(&mut rest), 4);
        assert_eq!(&rest, b"cdef");
    }

    #[test]
    fn reset_empties_the_ring() {
        let ring = RingBuffer::new(4).unwrap();
        ring.write(b"abcd");
        ring.reset();
        assert_eq!(ring.available(), 0);
        assert!(ring.peek_all().is_empty());
        ring.write(b"xy");
        assert_eq!(ring.peek_all(), b"xy");
    }

    #[test]
    fn read_from_empty_returns_zero() {
        let ring = RingBuffer::new(4).unwrap();
        let mut dst = [0u8; 4];
        assert_eq!(ring.read(&mut dst), 0);
    }

    #[test]
    fn concurrent_writers_and_peekers_do_not_corrupt() {
        use std::sync::Arc;
        let ring = Arc::new(RingBuffer::new(64).unwrap());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let ring = Arc::clone(&ring);
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    ring.write(b"0123456789abcdef");
                    let snapshot = ring.peek_all();
                    assert!(snapshot.len() <= 64);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ring.available(), 64);
    }
}
