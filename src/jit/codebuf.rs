//! Code buffer for building JIT code.
//!
//! The buffer is addressed purely by byte offsets. Its backing region is
//! reallocated as it fills, so no pointer into it survives an emission.

use super::memory::{AllocError, CodeAllocator};
use super::{CodeOffset, Failure};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Growth limits for one buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferLimits {
    /// How many times the initial estimate may double.
    pub max_growths: u32,
    /// Hard ceiling in bytes.
    pub max_code_size: u32,
}

/// A growable buffer of 32-bit instruction words.
pub struct CodeBuffer {
    region: Box<[u8]>,
    len: u32,
    growths: u32,
    limits: BufferLimits,
    allocator: Arc<dyn CodeAllocator>,
}

impl CodeBuffer {
    /// Reserve `estimate` bytes from `allocator`.
    pub fn new(
        allocator: Arc<dyn CodeAllocator>,
        estimate: u32,
        limits: BufferLimits,
    ) -> Result<Self, AllocError> {
        let size = estimate.clamp(4, limits.max_code_size.max(4)) & !3;
        let region = allocator.allocate_code(size as usize)?;
        Ok(Self {
            region,
            len: 0,
            growths: 0,
            limits,
            allocator,
        })
    }

    /// Offset the next word is written at.
    pub fn offset(&self) -> CodeOffset {
        self.len
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> u32 {
        self.region.len() as u32
    }

    /// Number of doublings so far.
    pub fn growths(&self) -> u32 {
        self.growths
    }

    /// Bytes that can still be emitted, counting growth still allowed.
    pub fn headroom(&self) -> u32 {
        let mut capacity = self.capacity();
        for _ in self.growths..self.limits.max_growths {
            capacity = capacity.saturating_mul(2).min(self.limits.max_code_size);
        }
        capacity.saturating_sub(self.len)
    }

    /// Append one little-endian word, growing first if needed.
    pub fn emit_u32(&mut self, word: u32) -> Result<(), Failure> {
        if self.len + 4 > self.capacity() {
            self.grow()?;
        }
        let at = self.len as usize;
        self.region[at..at + 4].copy_from_slice(&word.to_le_bytes());
        self.len += 4;
        Ok(())
    }

    /// Read the word at `at`.
    pub fn read_u32(&self, at: CodeOffset) -> u32 {
        assert!(at % 4 == 0 && at + 4 <= self.len, "read at {} outside code", at);
        let at = at as usize;
        u32::from_le_bytes([
            self.region[at],
            self.region[at + 1],
            self.region[at + 2],
            self.region[at + 3],
        ])
    }

    /// Overwrite the word at `at`.
    pub fn write_u32(&mut self, at: CodeOffset, word: u32) {
        assert!(at % 4 == 0 && at + 4 <= self.len, "write at {} outside code", at);
        let at = at as usize;
        self.region[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }

    /// The emitted bytes.
    pub fn code(&self) -> &[u8] {
        &self.region[..self.len as usize]
    }

    /// Trim the region to the emitted length and copy the code out.
    /// The scratch region is released when the buffer drops.
    pub fn finish(mut self) -> Vec<u8> {
        self.allocator.shrink(&mut self.region, self.len as usize);
        self.code().to_vec()
    }

    fn grow(&mut self) -> Result<(), Failure> {
        let needed = self.len + 4;
        if self.growths >= self.limits.max_growths || needed > self.limits.max_code_size {
            debug!(
                len = self.len,
                growths = self.growths,
                "code buffer exceeded its estimate"
            );
            return Err(Failure::OutOfMemory);
        }

        let new_size = self
            .capacity()
            .saturating_mul(2)
            .min(self.limits.max_code_size)
            .max(needed);
        self.allocator
            .grow(&mut self.region, new_size as usize)
            .map_err(|err| {
                debug!(%err, new_size, "code buffer growth refused");
                Failure::OutOfMemory
            })?;
        self.growths += 1;
        debug!(new_size, growths = self.growths, "code buffer grown");
        Ok(())
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        let region = std::mem::take(&mut self.region);
        self.allocator.release(region);
    }
}

impl fmt::Debug for CodeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("growths", &self.growths)
            .finish()
    }
}
