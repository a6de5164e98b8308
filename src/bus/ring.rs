//! Fixed-capacity FIFO byte buffer.

use crate::error::BusError;

/// Circular byte buffer decoupling stream ingestion from serial flushes.
///
/// Overflow is an error, never a silent drop: losing bytes here would
/// desynchronize the bus controller's flow accounting. The controller sizes
/// the buffer generously relative to expected burst size and treats an
/// overflow as a fatal configuration error.
#[derive(Debug)]
pub struct ByteRingBuffer {
    elements: Box<[u8]>,
    head: usize,
    available: usize,
}

impl ByteRingBuffer {
    /// Create a buffer with the given capacity.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be positive");
        Self {
            elements: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            available: 0,
        }
    }

    /// Append one byte.
    pub fn push(&mut self, byte: u8) -> Result<(), BusError> {
        if self.available == self.elements.len() {
            return Err(BusError::BufferOverflow {
                capacity: self.elements.len(),
            });
        }
        self.elements[self.head] = byte;
        self.head = (self.head + 1) % self.elements.len();
        self.available += 1;
        Ok(())
    }

    /// Append a slice; fails at the first byte that would overflow.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<(), BusError> {
        for &byte in data {
            self.push(byte)?;
        }
        Ok(())
    }

    /// Remove and return the oldest byte.
    pub fn pop(&mut self) -> Option<u8> {
        if self.available == 0 {
            return None;
        }
        let capacity = self.elements.len();
        let tail = (self.head + capacity - self.available) % capacity;
        self.available -= 1;
        Some(self.elements[tail])
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.available
    }

    /// True when no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.available == 0
    }

    /// Total capacity.
    pub fn capacity(&self) -> usize {
        self.elements.len()
    }
}
