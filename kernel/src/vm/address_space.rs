// SPDX-License-Identifier: MPL-2.0

use kestrel_frame::mm::{empty_ptr, is_empty_ptr, AllocFlags, Allocator};
use kestrel_frame::sync::SpinLock;

use crate::prelude::*;

const CHUNK_CAPACITY: usize = 8;

// Tracked allocations are recorded in fixed-capacity pointer chunks strung
// on a singly linked list. The open chunk sits at the head.
struct PtrChunk {
    ptrs: [*mut u8; CHUNK_CAPACITY],
    count: usize,
    next: Option<Box<PtrChunk>>,
}

impl PtrChunk {
    fn new() -> Box<Self> {
        Box::new(Self {
            ptrs: [core::ptr::null_mut(); CHUNK_CAPACITY],
            count: 0,
            next: None,
        })
    }
}

struct SpaceInner {
    chunks: Option<Box<PtrChunk>>,
    allocation_count: usize,
    byte_count: usize,
}

/// The address space of a process: a tracked bag of user-visible
/// allocations.
///
/// Every allocation is forwarded to the physical allocator and remembered,
/// so that process exit reclaims all of them in one sweep without any
/// per-allocation bookkeeping by the callers.
pub struct AddressSpace {
    allocator: Arc<Allocator>,
    inner: SpinLock<SpaceInner>,
}

// SAFETY: the recorded pointers refer to allocator-owned memory and are only
// handed back to that allocator; list access goes through the inner lock.
unsafe impl Send for AddressSpace {}
unsafe impl Sync for AddressSpace {}

impl AddressSpace {
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self {
            allocator,
            inner: SpinLock::new(SpaceInner {
                chunks: None,
                allocation_count: 0,
                byte_count: 0,
            }),
        }
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// Allocates `nbytes` bytes of user-visible memory and tracks the
    /// allocation for bulk reclamation.
    pub fn allocate(&self, nbytes: usize) -> Result<*mut u8> {
        self.allocate_with(nbytes, AllocFlags::empty())
    }

    /// Like [`AddressSpace::allocate`], but the memory is zeroed.
    pub fn allocate_cleared(&self, nbytes: usize) -> Result<*mut u8> {
        self.allocate_with(nbytes, AllocFlags::CLEAR)
    }

    fn allocate_with(&self, nbytes: usize, flags: AllocFlags) -> Result<*mut u8> {
        if nbytes == 0 {
            return Ok(empty_ptr());
        }

        let mut inner = self.inner.lock();
        let ptr = self.allocator.allocate(nbytes, flags)?;
        match &mut inner.chunks {
            Some(chunk) if chunk.count < CHUNK_CAPACITY => {
                chunk.ptrs[chunk.count] = ptr;
                chunk.count += 1;
            }
            head => {
                let mut chunk = PtrChunk::new();
                chunk.ptrs[0] = ptr;
                chunk.count = 1;
                chunk.next = head.take();
                *head = Some(chunk);
            }
        }
        inner.allocation_count += 1;
        inner.byte_count += nbytes;
        Ok(ptr)
    }

    /// Whether no allocation has been made since creation or the last
    /// [`AddressSpace::destroy`].
    pub fn is_empty(&self) -> bool {
        self.inner.lock().allocation_count == 0
    }

    pub fn allocation_count(&self) -> usize {
        self.inner.lock().allocation_count
    }

    pub fn byte_count(&self) -> usize {
        self.inner.lock().byte_count
    }

    /// Frees every tracked allocation and resets the arena.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        let mut cur = inner.chunks.take();
        while let Some(mut chunk) = cur {
            for i in 0..chunk.count {
                if !is_empty_ptr(chunk.ptrs[i]) {
                    self.allocator.deallocate(chunk.ptrs[i]);
                }
            }
            cur = chunk.next.take();
        }
        inner.allocation_count = 0;
        inner.byte_count = 0;
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kestrel_frame::mm::{MemoryAccess, MemoryRegionDesc, ALLOC_ALIGN};

    fn test_allocator() -> Arc<Allocator> {
        let layout = std::alloc::Layout::from_size_align(64 * 1024, ALLOC_ALIGN).unwrap();
        let lower = unsafe { std::alloc::alloc(layout) };
        assert!(!lower.is_null());
        let desc = MemoryRegionDesc {
            lower,
            upper: unsafe { lower.add(64 * 1024) },
            access: MemoryAccess::DmaAndCpu,
        };
        Arc::new(Allocator::new(&[desc]).unwrap())
    }

    #[test]
    fn destroy_returns_every_allocation_to_the_allocator() {
        let heap = test_allocator();
        let space = AddressSpace::new(heap.clone());

        let mut ptrs = Vec::new();
        // Cross a chunk boundary so more than one chunk is in play.
        for i in 1..=20 {
            ptrs.push(space.allocate(i * 16).unwrap());
        }
        assert_eq!(space.allocation_count(), 20);
        for ptr in &ptrs {
            assert!(heap.owns(*ptr));
        }

        space.destroy();
        assert!(space.is_empty());
        for ptr in &ptrs {
            assert!(!heap.owns(*ptr));
        }
        assert_eq!(heap.allocated_byte_count(), 0);
    }

    #[test]
    fn is_empty_tracks_only_real_allocations() {
        let space = AddressSpace::new(test_allocator());
        assert!(space.is_empty());

        // Zero-byte allocations return the sentinel and are not tracked.
        let ptr = space.allocate(0).unwrap();
        assert!(is_empty_ptr(ptr));
        assert!(space.is_empty());

        space.allocate(100).unwrap();
        assert!(!space.is_empty());
        space.destroy();
        assert!(space.is_empty());
    }

    #[test]
    fn arena_survives_reuse_after_destroy() {
        let heap = test_allocator();
        let space = AddressSpace::new(heap.clone());

        space.allocate(128).unwrap();
        space.destroy();
        let ptr = space.allocate_cleared(64).unwrap();
        assert!(heap.owns(ptr));
        assert_eq!(space.byte_count(), 64);
    }
}
