// SPDX-License-Identifier: MPL-2.0

//! The block layer of the Kestrel kernel.
//!
//! This crate provides the block container abstraction that decouples the
//! filesystems from the underlying storage, a RAM-backed container, and the
//! disk image header format used to persist container contents.
//!
//! A container hands out at most one mapping per block at a time; mapping an
//! already-mapped block is a fatal error, because it means two callers would
//! hold aliasing views of the same storage.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod image;
mod ram;

use core::ops::Deref;
use core::ptr::NonNull;

use kestrel_frame::prelude::*;

pub use ram::RamContainer;

/// The sector size every on-disk structure in the system is built around.
pub const BLOCK_SIZE: usize = 512;

/// Metadata of a block container.
#[derive(Debug, Clone, Copy)]
pub struct ContainerInfo {
    pub block_size: usize,
    pub block_count: u64,
    pub is_read_only: bool,
}

/// How a block is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// The caller only reads the block contents.
    ReadOnly,
    /// The caller reads and modifies the block contents.
    Update,
    /// The caller overwrites the whole block; the old contents are not
    /// read.
    Replace,
    /// Like `Replace`, but the buffer is zero-filled after mapping.
    Cleared,
}

impl MapMode {
    pub fn is_writable(&self) -> bool {
        !matches!(self, MapMode::ReadOnly)
    }
}

/// What happens to a modified block on unmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBack {
    /// Discard the modification state; nothing is scheduled for writing.
    None,
    /// Write the block out before the unmap returns.
    Sync,
    /// Write the block out eventually.
    Deferred,
}

/// A mapped block: a window onto one block of a container's storage.
///
/// The guard must be returned through
/// [`BlockContainer::unmap_block`]; the block stays mapped (and further maps
/// of it stay fatal) until then.
#[derive(Debug)]
pub struct BlockGuard {
    lba: u64,
    data: NonNull<u8>,
    len: usize,
    writable: bool,
}

impl BlockGuard {
    /// # Safety
    ///
    /// `data` must point at `len` bytes that stay valid and unaliased until
    /// the guard is unmapped.
    pub(crate) unsafe fn new(lba: u64, data: NonNull<u8>, len: usize, writable: bool) -> Self {
        Self {
            lba,
            data,
            len,
            writable,
        }
    }

    pub fn lba(&self) -> u64 {
        self.lba
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Mutable view of the block contents. Fatal on a read-only mapping.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(self.writable, "write through a read-only block mapping");
        // SAFETY: per the construction contract, the pointed-to bytes are
        // valid and unaliased while the block is mapped.
        unsafe { core::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }
}

impl Deref for BlockGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: per the construction contract.
        unsafe { core::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }
}

// SAFETY: the guard is an exclusive window onto the mapped block.
unsafe impl Send for BlockGuard {}
unsafe impl Sync for BlockGuard {}

/// Abstract block storage with map/unmap semantics.
pub trait BlockContainer: Send + Sync {
    fn info(&self) -> ContainerInfo;

    /// Maps the block at `lba`. At most one mapping per block may be
    /// outstanding; violating this is fatal. `lba` beyond the end of the
    /// container fails with `ENXIO`.
    fn map_block(&self, lba: u64, mode: MapMode) -> Result<BlockGuard>;

    /// Unmaps a block previously mapped with [`BlockContainer::map_block`],
    /// applying the given write-back mode.
    fn unmap_block(&self, guard: BlockGuard, mode: WriteBack) -> Result<()>;
}
