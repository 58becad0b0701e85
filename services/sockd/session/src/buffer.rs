//! Growable byte storage used for the send and receive pipelines.
//!
//! A [`Buffer`] tracks a logical capacity separately from the allocation held
//! by the inner [`BytesMut`], so the receive path can reason about "the read
//! filled the whole buffer" without depending on allocator rounding.

use bytes::BytesMut;

/// Resizable byte region with append, clear and reserve operations
#[derive(Debug, Default)]
pub struct Buffer {
    data: BytesMut,
    capacity: usize,
}

impl Buffer {
    /// Create an empty buffer with no reserved capacity
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with `capacity` bytes reserved
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of bytes stored
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no bytes are stored
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Logical capacity of the buffer
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stored bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append bytes at the end, growing the capacity when needed
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if self.data.len() > self.capacity {
            self.capacity = self.data.len().max(self.capacity * 2);
        }
    }

    /// Drop the stored bytes, keeping the allocation
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Make sure at least `capacity` bytes are available without reallocating
    pub fn reserve(&mut self, capacity: usize) {
        if capacity > self.capacity {
            self.data.reserve(capacity - self.data.len());
            self.capacity = capacity;
        }
    }

    /// Expose the full capacity as a writable slice for a read call.
    ///
    /// The returned slice is exactly [`capacity`](Self::capacity) bytes long.
    /// Only bytes beyond the previous length are zeroed, so repeated reads
    /// into a buffer of unchanged capacity cost nothing extra; earlier
    /// content is overwritten by the read.
    pub(crate) fn read_target(&mut self) -> &mut [u8] {
        if self.data.len() != self.capacity {
            self.data.resize(self.capacity, 0);
        }
        &mut self.data[..]
    }
}
