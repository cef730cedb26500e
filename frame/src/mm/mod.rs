// SPDX-License-Identifier: MPL-2.0

//! Physical memory management.

mod allocator;

pub use allocator::{
    empty_ptr, is_empty_ptr, AllocFlags, Allocator, MemoryAccess, MemoryRegionDesc, ALLOC_ALIGN,
};
