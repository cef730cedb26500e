// SPDX-License-Identifier: MPL-2.0

//! The multi-region physical memory allocator.
//!
//! The allocator hands out aligned byte ranges from one or more contiguous
//! memory regions. Region 0 is the RAM that both the chipset DMA engines and
//! the CPU can reach; every further region is reachable by the CPU only.
//! Within a region, free memory is kept on a singly linked free list whose
//! nodes live in-band at the start of each free block. Allocated blocks keep
//! their header and are additionally threaded onto an allocated list, which
//! is what lets the allocator detect double frees and foreign pointers.

use alloc::vec::Vec;
use core::mem;
use core::ptr;

use crate::prelude::*;
use crate::sync::SpinLock;

/// The allocation alignment. Both block headers and user pointers are
/// aligned to this.
pub const ALLOC_ALIGN: usize = 8;

/// Returns the sentinel returned for zero-byte allocations. Accepted by
/// [`Allocator::deallocate`] as a no-op.
pub fn empty_ptr() -> *mut u8 {
    usize::MAX as *mut u8
}

/// Whether `ptr` is the zero-byte allocation sentinel.
pub fn is_empty_ptr(ptr: *const u8) -> bool {
    ptr as usize == usize::MAX
}

/// The access class of a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccess {
    /// Reachable by the chipset DMA engines and the CPU.
    DmaAndCpu,
    /// Reachable by the CPU only.
    CpuOnly,
}

/// Describes one contiguous memory region handed to the allocator.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegionDesc {
    pub lower: *mut u8,
    pub upper: *mut u8,
    pub access: MemoryAccess,
}

bitflags::bitflags! {
    /// Options for [`Allocator::allocate`].
    pub struct AllocFlags: u32 {
        /// Zero the allocated bytes.
        const CLEAR = 1 << 0;
        /// Satisfy the allocation from DMA-reachable RAM if possible.
        const PREFER_DMA = 1 << 1;
    }
}

// A block header precedes every free and every allocated block. `size`
// includes the header itself.
#[repr(C)]
struct BlockHeader {
    next: *mut BlockHeader,
    size: usize,
}

const HEADER_SIZE: usize = align_up(mem::size_of::<BlockHeader>(), ALLOC_ALIGN);

const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

struct Region {
    // The aligned start of managed memory within the region.
    base: *mut u8,
    upper: *mut u8,
    access: MemoryAccess,
    first_free: *mut BlockHeader,
}

impl Region {
    fn contains(&self, ptr: *const u8) -> bool {
        ptr >= self.base as *const u8 && ptr < self.upper as *const u8
    }

    fn managed_bytes(&self) -> usize {
        self.upper as usize - self.base as usize
    }
}

struct AllocatorInner {
    regions: Vec<Region>,
    first_allocated: *mut BlockHeader,
}

/// The multi-region first-fit allocator.
pub struct Allocator {
    inner: SpinLock<AllocatorInner>,
}

// SAFETY: the raw pointers refer to the managed regions, which the allocator
// owns exclusively; all access goes through the inner lock.
unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl Allocator {
    /// Creates an allocator over the given memory layout.
    ///
    /// Region 0 must be the DMA-reachable region and all further regions must
    /// be CPU-only. Each region starts out covered by a single free block.
    pub fn new(layout: &[MemoryRegionDesc]) -> Result<Self> {
        if layout.is_empty() {
            return_errno_with_message!(Errno::EINVAL, "empty memory layout");
        }
        if layout[0].access != MemoryAccess::DmaAndCpu {
            return_errno_with_message!(Errno::EINVAL, "region 0 must be DMA-reachable");
        }
        if layout[1..].iter().any(|d| d.access != MemoryAccess::CpuOnly) {
            return_errno_with_message!(Errno::EINVAL, "regions beyond 0 must be CPU-only");
        }

        let mut regions = Vec::with_capacity(layout.len());
        for desc in layout {
            regions.push(Self::make_region(desc)?);
        }

        Ok(Self {
            inner: SpinLock::new(AllocatorInner {
                regions,
                first_allocated: ptr::null_mut(),
            }),
        })
    }

    fn make_region(desc: &MemoryRegionDesc) -> Result<Region> {
        let base = align_up(desc.lower as usize, ALLOC_ALIGN) as *mut u8;
        if (base as usize) + HEADER_SIZE > desc.upper as usize {
            return_errno_with_message!(Errno::EINVAL, "memory region is too small");
        }

        let free_size = desc.upper as usize - base as usize;
        let first_free = base as *mut BlockHeader;
        // SAFETY: `base..upper` is unused memory owned by the caller and big
        // enough for a header.
        unsafe {
            (*first_free).next = ptr::null_mut();
            (*first_free).size = free_size;
        }

        Ok(Region {
            base,
            upper: desc.upper,
            access: desc.access,
            first_free,
        })
    }

    /// Extends the allocator with an additional CPU-only memory region.
    pub fn add_memory_region(&self, desc: &MemoryRegionDesc) -> Result<()> {
        if desc.access != MemoryAccess::CpuOnly {
            return_errno_with_message!(Errno::EINVAL, "added regions must be CPU-only");
        }
        let region = Self::make_region(desc)?;
        self.inner.lock().regions.push(region);
        log::debug!(
            "allocator: added region {:p}..{:p}",
            desc.lower,
            desc.upper
        );
        Ok(())
    }

    /// Allocates `nbytes` bytes.
    ///
    /// A zero-byte request returns the empty sentinel. Without
    /// [`AllocFlags::PREFER_DMA`] the CPU-only regions are searched in
    /// ascending order and the DMA region serves as the fallback; with it,
    /// the DMA region is tried first.
    pub fn allocate(&self, nbytes: usize, flags: AllocFlags) -> Result<*mut u8> {
        if nbytes == 0 {
            return Ok(empty_ptr());
        }

        let nbytes_to_alloc = align_up(HEADER_SIZE + nbytes, ALLOC_ALIGN);

        let ptr = {
            let mut inner = self.inner.lock();
            let region_count = inner.regions.len();
            // CPU-only regions in ascending order with the DMA region as the
            // fallback, unless the caller asked for DMA RAM up front.
            let order: Vec<usize> = if flags.contains(AllocFlags::PREFER_DMA) {
                (0..region_count).collect()
            } else {
                (1..region_count).chain(0..1).collect()
            };

            let mut found = ptr::null_mut();
            for idx in order {
                // SAFETY: the region free list only refers to memory inside
                // the region and is consistent under the inner lock.
                found = unsafe { inner.allocate_from_region(idx, nbytes_to_alloc) };
                if !found.is_null() {
                    break;
                }
            }
            found
        };

        if ptr.is_null() {
            return_errno!(Errno::ENOMEM);
        }
        if flags.contains(AllocFlags::CLEAR) {
            // SAFETY: `ptr` points at `nbytes` freshly allocated bytes.
            unsafe { ptr::write_bytes(ptr, 0, nbytes) };
        }
        Ok(ptr)
    }

    /// Returns an allocated block to its region, coalescing it with adjacent
    /// free blocks.
    ///
    /// Passing null or the empty sentinel is a no-op. Passing a pointer that
    /// the allocator does not consider allocated is fatal.
    pub fn deallocate(&self, ptr: *mut u8) {
        if ptr.is_null() || is_empty_ptr(ptr) {
            return;
        }

        let mut inner = self.inner.lock();

        let region_idx = inner
            .regions
            .iter()
            .position(|r| r.contains(ptr))
            .unwrap_or_else(|| panic!("deallocate: {:p} is not in any managed region", ptr));

        // SAFETY: `ptr` lies in a managed region; the header precedes it.
        unsafe {
            let header = ptr.sub(HEADER_SIZE) as *mut BlockHeader;
            inner.remove_allocated(header);
            inner.insert_free(region_idx, header);
        }
    }

    /// Whether `ptr` refers to a live allocation.
    pub fn owns(&self, ptr: *const u8) -> bool {
        if ptr.is_null() || is_empty_ptr(ptr) {
            return false;
        }
        let inner = self.inner.lock();
        let mut cur = inner.first_allocated;
        while !cur.is_null() {
            // SAFETY: the allocated list is consistent under the inner lock.
            unsafe {
                if (cur as *const u8).add(HEADER_SIZE) == ptr {
                    return true;
                }
                cur = (*cur).next;
            }
        }
        false
    }

    /// Total bytes under management (the sum of all aligned region spans).
    pub fn managed_byte_count(&self) -> usize {
        self.inner.lock().regions.iter().map(|r| r.managed_bytes()).sum()
    }

    /// Bytes currently on the free lists, including free block headers.
    pub fn free_byte_count(&self) -> usize {
        let inner = self.inner.lock();
        let mut total = 0;
        for region in &inner.regions {
            let mut cur = region.first_free;
            while !cur.is_null() {
                // SAFETY: free lists are consistent under the inner lock.
                unsafe {
                    total += (*cur).size;
                    cur = (*cur).next;
                }
            }
        }
        total
    }

    /// Bytes currently allocated, including block headers.
    pub fn allocated_byte_count(&self) -> usize {
        let inner = self.inner.lock();
        let mut total = 0;
        let mut cur = inner.first_allocated;
        while !cur.is_null() {
            // SAFETY: the allocated list is consistent under the inner lock.
            unsafe {
                total += (*cur).size;
                cur = (*cur).next;
            }
        }
        total
    }

    /// Whether `ptr` lies within the DMA-reachable region.
    pub fn is_dma_memory(&self, ptr: *const u8) -> bool {
        let inner = self.inner.lock();
        inner
            .regions
            .iter()
            .any(|r| r.access == MemoryAccess::DmaAndCpu && r.contains(ptr))
    }

    /// Logs the free and allocated lists.
    pub fn dump(&self) {
        let inner = self.inner.lock();
        for (i, region) in inner.regions.iter().enumerate() {
            let mut cur = region.first_free;
            while !cur.is_null() {
                // SAFETY: free lists are consistent under the inner lock.
                unsafe {
                    log::debug!("free: region {} {:p} {}", i, cur, (*cur).size);
                    cur = (*cur).next;
                }
            }
        }
        let mut cur = inner.first_allocated;
        while !cur.is_null() {
            // SAFETY: the allocated list is consistent under the inner lock.
            unsafe {
                log::debug!("alloc: {:p} {}", cur, (*cur).size);
                cur = (*cur).next;
            }
        }
    }
}

impl AllocatorInner {
    // First-fit search in the region's free list. `nbytes_to_alloc` includes
    // the header and alignment. Returns the user pointer or null.
    //
    // SAFETY: the caller must hold the inner lock (enforced by `&mut self`);
    // the free lists must only refer to memory inside their regions.
    unsafe fn allocate_from_region(&mut self, region_idx: usize, nbytes_to_alloc: usize) -> *mut u8 {
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut cur = self.regions[region_idx].first_free;
        // SAFETY: list invariants per above.
        unsafe {
            while !cur.is_null() && (*cur).size < nbytes_to_alloc {
                prev = cur;
                cur = (*cur).next;
            }
            if cur.is_null() {
                return ptr::null_mut();
            }

            let found = cur;
            let next_free = (*found).next;
            let remainder = (*found).size - nbytes_to_alloc;

            // Split the found block. A residual smaller than a header cannot
            // carry a free-list node, so the whole block is handed out then.
            let (replacement, alloc_size) = if remainder >= HEADER_SIZE {
                let new_free = (found as *mut u8).add(nbytes_to_alloc) as *mut BlockHeader;
                (*new_free).next = next_free;
                (*new_free).size = remainder;
                (new_free, nbytes_to_alloc)
            } else {
                (next_free, (*found).size)
            };

            if prev.is_null() {
                self.regions[region_idx].first_free = replacement;
            } else {
                (*prev).next = replacement;
            }

            (*found).next = self.first_allocated;
            (*found).size = alloc_size;
            self.first_allocated = found;

            (found as *mut u8).add(HEADER_SIZE)
        }
    }

    // Unlinks `header` from the allocated list. Fatal if it is not on it,
    // which catches double frees and pointers the allocator never returned.
    //
    // SAFETY: caller must hold the inner lock.
    unsafe fn remove_allocated(&mut self, header: *mut BlockHeader) {
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut cur = self.first_allocated;
        // SAFETY: list invariants per above.
        unsafe {
            while !cur.is_null() {
                if cur == header {
                    if prev.is_null() {
                        self.first_allocated = (*cur).next;
                    } else {
                        (*prev).next = (*cur).next;
                    }
                    (*cur).next = ptr::null_mut();
                    return;
                }
                prev = cur;
                cur = (*cur).next;
            }
        }
        panic!("deallocate: double free or corrupted pointer {:p}", header);
    }

    // Inserts `header` into the region free list, merging with the free
    // blocks immediately below and above it.
    //
    // SAFETY: caller must hold the inner lock; `header` must be a valid,
    // unlinked block within region `region_idx`.
    unsafe fn insert_free(&mut self, region_idx: usize, header: *mut BlockHeader) {
        let region = &mut self.regions[region_idx];

        // SAFETY: list invariants per above.
        unsafe {
            let lower_to_free = header as *mut u8;
            let upper_to_free = lower_to_free.add((*header).size);

            let mut lower: *mut BlockHeader = ptr::null_mut();
            let mut upper: *mut BlockHeader = ptr::null_mut();
            let mut upper_prev: *mut BlockHeader = ptr::null_mut();

            let mut prev: *mut BlockHeader = ptr::null_mut();
            let mut cur = region.first_free;
            while !cur.is_null() {
                let cur_lower = cur as *mut u8;
                let cur_upper = cur_lower.add((*cur).size);

                if cur_lower == upper_to_free {
                    upper = cur;
                    upper_prev = prev;
                }
                if cur_upper == lower_to_free {
                    lower = cur;
                }
                if !lower.is_null() && !upper.is_null() {
                    break;
                }

                prev = cur;
                cur = (*cur).next;
            }

            if !lower.is_null() {
                // Merge into the lower neighbor; if an upper neighbor exists
                // too, swallow it and unlink it from the free list.
                (*lower).size += (*header).size;
                if !upper.is_null() {
                    (*lower).size += (*upper).size;
                    if upper_prev.is_null() {
                        region.first_free = (*upper).next;
                    } else {
                        (*upper_prev).next = (*upper).next;
                    }
                }
            } else if !upper.is_null() {
                // Merge the upper neighbor into the freed block, which takes
                // the neighbor's place in the free list.
                (*header).size += (*upper).size;
                (*header).next = (*upper).next;
                if upper_prev.is_null() {
                    region.first_free = header;
                } else {
                    (*upper_prev).next = header;
                }
            } else {
                (*header).next = region.first_free;
                region.first_free = header;
            }
        }
    }
}
