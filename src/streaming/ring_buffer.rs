//! Fixed-capacity circular byte store.
//!
//! Keeps the most recent bytes of an upstream for diagnostics and late-join
//! prefetch experiments. This is a recent-window, not a lossless queue: the
//! fan-out path is the broadcast hub, and readers here are advisory copies
//! that never move the write cursor.

use tokio::sync::RwLock;

pub struct RingBuffer {
    capacity: usize,
    inner: RwLock<Inner>,
}

struct Inner {
    buf: Vec<u8>,
    start: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(Inner {
                buf: vec![0; capacity],
                start: 0,
                len: 0,
            }),
        }
    }

    /// Write bytes, overwriting the oldest data when full. Input larger
    /// than the capacity keeps only its trailing `capacity` bytes.
    pub async fn write(&self, data: &[u8]) -> usize {
        let mut inner = self.inner.write().await;
        let cap = self.capacity;
        if cap == 0 {
            return 0;
        }

        let src = if data.len() > cap {
            &data[data.len() - cap..]
        } else {
            data
        };

        for &byte in src {
            let index = (inner.start + inner.len) % cap;
            inner.buf[index] = byte;
            if inner.len == cap {
                inner.start = (inner.start + 1) % cap;
            } else {
                inner.len += 1;
            }
        }

        src.len()
    }

    /// Copy up to `dst.len()` bytes from the oldest retained byte forward.
    pub async fn read(&self, dst: &mut [u8]) -> usize {
        let inner = self.inner.read().await;
        let n = dst.len().min(inner.len);
        for (i, slot) in dst.iter_mut().enumerate().take(n) {
            *slot = inner.buf[(inner.start + i) % self.capacity];
        }
        n
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let ring = RingBuffer::new(16);
        assert_eq!(ring.write(b"hello").await, 5);
        let mut out = [0u8; 16];
        let n = ring.read(&mut out).await;
        assert_eq!(&out[..n], b"hello");
    }

    #[tokio::test]
    async fn overflow_keeps_most_recent_bytes() {
        let ring = RingBuffer::new(4);
        ring.write(b"abcd").await;
        ring.write(b"ef").await;
        let mut out = [0u8; 4];
        let n = ring.read(&mut out).await;
        assert_eq!(&out[..n], b"cdef");
    }

    #[tokio::test]
    async fn input_larger_than_capacity_keeps_trailing_bytes() {
        let ring = RingBuffer::new(4);
        assert_eq!(ring.write(b"abcdefgh").await, 4);
        let mut out = [0u8; 4];
        let n = ring.read(&mut out).await;
        assert_eq!(&out[..n], b"efgh");
    }

    #[tokio::test]
    async fn read_does_not_consume() {
        let ring = RingBuffer::new(8);
        ring.write(b"data").await;
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        assert_eq!(ring.read(&mut first).await, 4);
        assert_eq!(ring.read(&mut second).await, 4);
        assert_eq!(&first[..4], &second[..4]);
        assert_eq!(ring.len().await, 4);
    }
}
