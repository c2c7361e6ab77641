//! Scratch memory for code buffers, and executable memory for finished code.
//!
//! Code buffers are backed by a [`CodeAllocator`] so that every session's
//! working memory is accounted against one limit. Finished code is copied
//! into an [`ExecutableMemory`] mapping when it is installed.

use super::code::Relocation;
use super::CodeOffset;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("scratch limit exceeded: {requested} bytes requested, {available} available")]
    LimitExceeded { requested: usize, available: usize },
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid memory size")]
    InvalidSize,
    #[error("relocated address does not fit the pool word at {0}")]
    RelocationOverflow(CodeOffset),
}

/// Source of code buffer regions.
///
/// Regions are handed out exclusively; the allocator only accounts for them.
pub trait CodeAllocator: Send + Sync + fmt::Debug {
    /// A zeroed region of exactly `size` bytes.
    fn allocate_code(&self, size: usize) -> Result<Box<[u8]>, AllocError>;

    /// Reallocate `region` to `new_size` bytes, preserving its contents.
    /// On failure `region` is untouched.
    fn grow(&self, region: &mut Box<[u8]>, new_size: usize) -> Result<(), AllocError>;

    /// Trim `region` to its first `used` bytes.
    fn shrink(&self, region: &mut Box<[u8]>, used: usize);

    /// Give a region back.
    fn release(&self, region: Box<[u8]>);

    /// Bytes currently handed out.
    fn in_use(&self) -> usize;
}

/// Heap-backed allocator with a global byte limit.
#[derive(Debug)]
pub struct HeapAllocator {
    limit: usize,
    in_use: AtomicUsize,
}

impl HeapAllocator {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn reserve(&self, bytes: usize) -> Result<(), AllocError> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.limit)
            })
            .map(|_| ())
            .map_err(|used| AllocError::LimitExceeded {
                requested: bytes,
                available: self.limit.saturating_sub(used),
            })
    }

    fn unreserve(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::AcqRel);
    }
}

impl CodeAllocator for HeapAllocator {
    fn allocate_code(&self, size: usize) -> Result<Box<[u8]>, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidSize);
        }
        self.reserve(size)?;
        Ok(vec![0u8; size].into_boxed_slice())
    }

    fn grow(&self, region: &mut Box<[u8]>, new_size: usize) -> Result<(), AllocError> {
        let old_size = region.len();
        if new_size <= old_size {
            return Err(AllocError::InvalidSize);
        }
        self.reserve(new_size - old_size)?;
        let mut grown = vec![0u8; new_size];
        grown[..old_size].copy_from_slice(region);
        *region = grown.into_boxed_slice();
        Ok(())
    }

    fn shrink(&self, region: &mut Box<[u8]>, used: usize) {
        if used >= region.len() {
            return;
        }
        let freed = region.len() - used;
        *region = region[..used].to_vec().into_boxed_slice();
        self.unreserve(freed);
    }

    fn release(&self, region: Box<[u8]>) {
        self.unreserve(region.len());
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

/// A block of memory mapped with mmap.
///
/// The memory starts writable. Call `make_executable()` to flip it to
/// read+execute before running code from it.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Map a writable block of at least `size` bytes.
    pub fn new(size: usize) -> Result<Self, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidSize);
        }

        let page_size = Self::page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);
        let ptr = Self::mmap_alloc(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    /// Map `code`, apply `relocations`, and make the mapping executable.
    ///
    /// `resolve` maps an object handle to its current address.
    pub fn install<F>(code: &[u8], relocations: &[Relocation], resolve: F) -> Result<Self, AllocError>
    where
        F: Fn(u32) -> usize,
    {
        let mut mem = Self::new(code.len())?;
        mem.write(0, code)?;
        for reloc in relocations {
            mem.relocate(reloc, resolve(reloc.handle))?;
        }
        mem.make_executable()?;
        Ok(mem)
    }

    /// Overwrite the pool word of `reloc` with `base + addend`.
    pub fn relocate(&mut self, reloc: &Relocation, base: usize) -> Result<(), AllocError> {
        let address = (base as u64).wrapping_add(reloc.addend as i64 as u64);
        let at = reloc.offset as usize;
        if reloc.width == 8 {
            return self.write(at, &address.to_le_bytes());
        }
        let word = u32::try_from(address).map_err(|_| AllocError::RelocationOverflow(reloc.offset))?;
        self.write(at, &word.to_le_bytes())
    }

    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, AllocError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(AllocError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(AllocError::AllocationFailed)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `data` in at `offset`. Fails once the memory is executable.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), AllocError> {
        if self.executable {
            return Err(AllocError::ProtectionFailed);
        }
        if offset + data.len() > self.size {
            return Err(AllocError::InvalidSize);
        }

        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }
        Ok(())
    }

    /// Remap as read+execute. The memory can no longer be written.
    pub fn make_executable(&mut self) -> Result<(), AllocError> {
        if self.executable {
            return Ok(());
        }

        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(AllocError::ProtectionFailed);
        }

        self.executable = true;
        Ok(())
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Read back the bytes at `offset..offset + len`.
    pub fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        if offset + len > self.size {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) })
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

impl fmt::Debug for ExecutableMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableMemory")
            .field("size", &self.size)
            .field("executable", &self.executable)
            .finish()
    }
}

// The mapping is owned exclusively and never aliased mutably once shared.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_allocator_accounting() {
        let alloc = HeapAllocator::new(1024);
        let mut region = alloc.allocate_code(256).unwrap();
        assert_eq!(alloc.in_use(), 256);

        region[0] = 0xAB;
        alloc.grow(&mut region, 512).unwrap();
        assert_eq!(region.len(), 512);
        assert_eq!(region[0], 0xAB);
        assert_eq!(alloc.in_use(), 512);

        alloc.shrink(&mut region, 100);
        assert_eq!(region.len(), 100);
        assert_eq!(alloc.in_use(), 100);

        alloc.release(region);
        assert_eq!(alloc.in_use(), 0);
    }

    #[test]
    fn test_heap_allocator_limit() {
        let alloc = HeapAllocator::new(300);
        let mut region = alloc.allocate_code(200).unwrap();
        assert!(matches!(
            alloc.allocate_code(200),
            Err(AllocError::LimitExceeded { requested: 200, available: 100 })
        ));
        assert!(alloc.grow(&mut region, 400).is_err());
        assert_eq!(region.len(), 200);
        assert_eq!(alloc.in_use(), 200);
    }

    #[test]
    fn test_install_code() {
        let mem = ExecutableMemory::install(&[0x1F, 0x20, 0x03, 0xD5], &[], |_| 0).unwrap();
        assert!(mem.size() >= 4);
        assert!(mem.is_executable());
        assert_eq!(mem.bytes(0, 4), Some(&[0x1F, 0x20, 0x03, 0xD5][..]));
    }

    #[test]
    fn test_cannot_write_after_executable() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        mem.make_executable().unwrap();
        assert!(mem.write(0, &[0x90]).is_err());
    }

    #[test]
    fn test_install_patches_relocations() {
        let code = [0u8; 16];
        let relocations = [
            Relocation {
                offset: 4,
                handle: 1,
                addend: -8,
                width: 4,
            },
            Relocation {
                offset: 8,
                handle: 2,
                addend: 16,
                width: 8,
            },
        ];
        let mem = ExecutableMemory::install(&code, &relocations, |handle| 0x1000 * handle as usize)
            .unwrap();

        assert_eq!(mem.bytes(0, 4), Some(&[0u8; 4][..]));
        assert_eq!(mem.bytes(4, 4), Some(&0x0FF8u32.to_le_bytes()[..]));
        assert_eq!(mem.bytes(8, 8), Some(&0x2010u64.to_le_bytes()[..]));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_narrow_relocation_overflow() {
        let reloc = Relocation {
            offset: 0,
            handle: 0,
            addend: 0,
            width: 4,
        };
        let mut mem = ExecutableMemory::new(4).unwrap();
        assert!(matches!(
            mem.relocate(&reloc, 1 << 40),
            Err(AllocError::RelocationOverflow(0))
        ));
    }
}
