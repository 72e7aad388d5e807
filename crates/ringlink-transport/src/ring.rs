//! Circular-buffer arithmetic shared by the RDMA channel and the shared-memory rings.
//!
//! Positions handed around in this crate are virtual: they grow monotonically and
//! are reduced to a buffer offset by masking with `capacity - 1`. A byte range that
//! runs past the end of the buffer is never wrapped by the operation itself; it is
//! split into at most two contiguous [`Segment`]s by [`split_range`].

use crate::error::{Result, TransportError};

/// A contiguous byte range inside a ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Offset from the start of the buffer.
    pub offset: usize,
    /// Number of bytes.
    pub len: usize,
}

impl Segment {
    /// One past the last offset covered by this segment.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Result of splitting a circular range at the wraparound boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// The range fits before the end of the buffer.
    One(Segment),
    /// The range crosses the end; the second segment always starts at offset 0.
    Two(Segment, Segment),
}

impl Split {
    /// Total number of bytes covered.
    pub fn len(&self) -> usize {
        match self {
            Split::One(a) => a.len,
            Split::Two(a, b) => a.len + b.len,
        }
    }

    /// Whether the split covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the range crossed the wraparound boundary.
    pub fn is_wrapped(&self) -> bool {
        matches!(self, Split::Two(..))
    }

    /// The segment before the wrap and, if the range wraps, the one after it.
    pub fn segments_pair(self) -> (Segment, Option<Segment>) {
        match self {
            Split::One(a) => (a, None),
            Split::Two(a, b) => (a, Some(b)),
        }
    }

    /// Segments in the order they must be written or read.
    pub fn segments(self) -> impl Iterator<Item = Segment> {
        let (a, b) = self.segments_pair();
        std::iter::once(a).chain(b)
    }
}

/// Maps `(offset, len, capacity)` to one or two contiguous segments.
///
/// `offset` may be a virtual position; it is masked into the buffer. `capacity`
/// must be a power of two and `len` must not exceed it.
pub fn split_range(offset: u64, len: usize, capacity: usize) -> Split {
    debug_assert!(capacity.is_power_of_two());
    debug_assert!(len <= capacity);
    let start = (offset as usize) & (capacity - 1);
    let first = len.min(capacity - start);
    if first == len {
        Split::One(Segment { offset: start, len })
    } else {
        Split::Two(
            Segment {
                offset: start,
                len: first,
            },
            Segment {
                offset: 0,
                len: len - first,
            },
        )
    }
}

/// Rejects capacities that are not powers of two or smaller than `min`.
pub fn validate_capacity(capacity: usize, min: usize) -> Result<()> {
    if !capacity.is_power_of_two() {
        return Err(TransportError::config(format!(
            "ring capacity {capacity} is not a power of two"
        )));
    }
    if capacity < min {
        return Err(TransportError::config(format!(
            "ring capacity {capacity} is below the minimum of {min} bytes"
        )));
    }
    Ok(())
}

/// Read-only view of bytes that may straddle the end of a ring buffer.
#[derive(Debug, Clone, Copy)]
pub struct RingSlice<'a> {
    head: &'a [u8],
    tail: &'a [u8],
}

impl<'a> RingSlice<'a> {
    /// Builds a view from the part before the wrap and the part after it.
    pub fn new(head: &'a [u8], tail: &'a [u8]) -> Self {
        Self { head, tail }
    }

    /// A view over a single contiguous slice.
    pub fn contiguous(bytes: &'a [u8]) -> Self {
        Self {
            head: bytes,
            tail: &[],
        }
    }

    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Both parts, in stream order.
    pub fn parts(&self) -> (&'a [u8], &'a [u8]) {
        (self.head, self.tail)
    }

    /// Copies up to `dst.len()` bytes out of the view and returns how many were copied.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len());
        let from_head = n.min(self.head.len());
        dst[..from_head].copy_from_slice(&self.head[..from_head]);
        dst[from_head..n].copy_from_slice(&self.tail[..n - from_head]);
        n
    }

    /// The view without its first `n` bytes.
    pub fn skip(&self, n: usize) -> RingSlice<'a> {
        if n <= self.head.len() {
            RingSlice {
                head: &self.head[n..],
                tail: self.tail,
            }
        } else {
            let m = (n - self.head.len()).min(self.tail.len());
            RingSlice::contiguous(&self.tail[m..])
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(self.head);
        out.extend_from_slice(self.tail);
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a u8> + 'a {
        self.head.iter().chain(self.tail.iter())
    }
}

/// Writable view of bytes that may straddle the end of a ring buffer.
#[derive(Debug)]
pub struct RingSliceMut<'a> {
    head: &'a mut [u8],
    tail: &'a mut [u8],
}

impl<'a> RingSliceMut<'a> {
    pub fn new(head: &'a mut [u8], tail: &'a mut [u8]) -> Self {
        Self { head, tail }
    }

    pub fn contiguous(bytes: &'a mut [u8]) -> Self {
        Self {
            head: bytes,
            tail: &mut [],
        }
    }

    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Both parts, in stream order.
    pub fn parts_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        (&mut *self.head, &mut *self.tail)
    }

    /// Copies as much of `src` as fits and returns the number of bytes written.
    pub fn copy_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.len());
        let into_head = n.min(self.head.len());
        self.head[..into_head].copy_from_slice(&src[..into_head]);
        self.tail[..n - into_head].copy_from_slice(&src[into_head..n]);
        n
    }
}
