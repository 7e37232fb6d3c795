use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// An ordered queue of byte buffers that defers copying until consumption.
///
/// Producers append whole buffers; consumers take, inspect, or discard an
/// arbitrary number of bytes from the front regardless of how the buffers
/// were originally chunked. Data is only copied when a request spans more
/// than one queued segment.
///
/// # Use Cases
///
/// - Holding unconsumed outbound bytes between a caller and a socket
///   worker thread that drains whatever the OS will accept per wakeup
/// - Re-chunking a byte stream without reallocating on every append
///
/// # Tradeoffs
///
/// - **Fast path**: a request satisfied by the front segment is O(1) with
///   no copy (just a refcount bump on the underlying `Bytes`)
/// - **Slow path**: a request spanning segments copies once into a
///   contiguous buffer
#[derive(Debug, Default)]
pub struct ByteQueue {
    segs: VecDeque<Bytes>,
    len: usize,
}

impl ByteQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segs: VecDeque::new(),
            len: 0,
        }
    }

    /// Total bytes held across all queued segments.
    #[inline]
    #[must_use]
    pub const fn bytes_queued(&self) -> usize {
        self.len
    }

    /// Number of distinct segments currently queued.
    #[inline]
    #[must_use]
    pub fn buffers_queued(&self) -> usize {
        self.segs.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a buffer to the back of the queue. Empty buffers are ignored.
    #[inline]
    pub fn enqueue(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.segs.push_back(data);
    }

    /// Remove and return up to `n` bytes from the front of the queue.
    ///
    /// Returns fewer bytes only when the queue holds fewer; never blocks.
    /// If the front segment alone satisfies the request this is zero-copy.
    pub fn dequeue(&mut self, n: usize) -> Bytes {
        let n = n.min(self.len);
        if n == 0 {
            return Bytes::new();
        }

        let front = self
            .segs
            .front_mut()
            .expect("non-zero length implies a front segment");
        if front.len() >= n {
            self.len -= n;
            let out = front.split_to(n);
            if front.is_empty() {
                self.segs.pop_front();
            }
            return out;
        }

        // Spans segments: copy.
        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let seg = self
                .segs
                .pop_front()
                .expect("length accounting guarantees segments remain");
            let take = remaining.min(seg.len());
            out.extend_from_slice(&seg[..take]);
            remaining -= take;
            self.len -= take;
            if take < seg.len() {
                let mut rest = seg;
                rest.advance(take);
                self.segs.push_front(rest);
            }
        }
        out.freeze()
    }

    /// Return up to `n` bytes from the front without consuming them.
    ///
    /// A subsequent `dequeue(n)` returns the same bytes.
    #[must_use]
    pub fn peek(&self, n: usize) -> Bytes {
        let n = n.min(self.len);
        if n == 0 {
            return Bytes::new();
        }

        let front = self
            .segs
            .front()
            .expect("non-zero length implies a front segment");
        if front.len() >= n {
            return front.slice(..n);
        }

        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        for seg in &self.segs {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(seg.len());
            out.extend_from_slice(&seg[..take]);
            remaining -= take;
        }
        out.freeze()
    }

    /// Drop up to `n` bytes from the front without copying them out.
    pub fn discard(&mut self, mut n: usize) {
        n = n.min(self.len);
        self.len -= n;

        while n > 0 {
            let Some(mut front) = self.segs.pop_front() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                continue;
            }
            // partially consumed
            front.advance(n);
            self.segs.push_front(front);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_across_chunk_boundaries() {
        let mut q = ByteQueue::new();
        q.enqueue(&b"Hello"[..]);
        q.enqueue(&b", "[..]);
        q.enqueue(&b"World!"[..]);
        assert_eq!(q.bytes_queued(), 13);
        assert_eq!(q.buffers_queued(), 3);

        // Dequeue sizes deliberately misaligned with the enqueue boundaries.
        assert_eq!(&q.dequeue(3)[..], b"Hel");
        assert_eq!(&q.dequeue(6)[..], b"lo, Wo");
        assert_eq!(&q.dequeue(4)[..], b"rld!");
        assert!(q.is_empty());
        assert_eq!(q.buffers_queued(), 0);
    }

    #[test]
    fn whole_segment_dequeue_is_exact() {
        let mut q = ByteQueue::new();
        q.enqueue(&b"abc"[..]);
        q.enqueue(&b"defg"[..]);
        assert_eq!(&q.dequeue(3)[..], b"abc");
        assert_eq!(q.buffers_queued(), 1);
        assert_eq!(&q.dequeue(4)[..], b"defg");
        assert!(q.is_empty());
    }

    #[test]
    fn peek_does_not_consume() {
        let mut q = ByteQueue::new();
        q.enqueue(&b"abc"[..]);
        q.enqueue(&b"def"[..]);
        assert_eq!(&q.peek(5)[..], b"abcde");
        assert_eq!(q.bytes_queued(), 6);
        assert_eq!(q.buffers_queued(), 2);
        assert_eq!(&q.dequeue(5)[..], b"abcde");
        assert_eq!(q.bytes_queued(), 1);
    }

    #[test]
    fn underfull_request_returns_everything() {
        let mut q = ByteQueue::new();
        q.enqueue(&b"xyz"[..]);
        assert_eq!(&q.dequeue(100)[..], b"xyz");
        assert!(q.is_empty());
        assert_eq!(q.dequeue(100), Bytes::new());
    }

    #[test]
    fn zero_length_requests() {
        let mut q = ByteQueue::new();
        q.enqueue(&b"data"[..]);
        assert!(q.dequeue(0).is_empty());
        assert!(q.peek(0).is_empty());
        q.discard(0);
        assert_eq!(q.bytes_queued(), 4);
    }

    #[test]
    fn discard_drops_without_copy() {
        let mut q = ByteQueue::new();
        q.enqueue(&b"abcdef"[..]);
        q.enqueue(&b"ghi"[..]);
        q.discard(7);
        assert_eq!(q.bytes_queued(), 2);
        assert_eq!(&q.dequeue(2)[..], b"hi");
    }

    #[test]
    fn empty_buffers_are_ignored() {
        let mut q = ByteQueue::new();
        q.enqueue(Bytes::new());
        assert!(q.is_empty());
        assert_eq!(q.buffers_queued(), 0);
    }
}
