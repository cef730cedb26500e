// SPDX-License-Identifier: MPL-2.0

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use bitvec::prelude::*;
use kestrel_frame::prelude::*;
use kestrel_frame::sync::SpinLock;

use crate::{BlockContainer, BlockGuard, ContainerInfo, MapMode, WriteBack};

#[derive(Debug)]
struct RamState {
    mapped: BitVec<u8, Lsb0>,
    lowest_written_lba: Option<u64>,
    highest_written_lba: Option<u64>,
}

/// A block container backed by a contiguous in-memory buffer.
///
/// Besides the plain map/unmap contract, the container remembers the lowest
/// and highest LBA ever written back, which the disk image writer uses to
/// emit sparse images.
#[derive(Debug)]
pub struct RamContainer {
    block_size: usize,
    block_count: u64,
    read_only: bool,
    state: SpinLock<RamState>,
    // Stable backing storage; aliasing is governed by the mapped flags.
    storage: UnsafeCell<Box<[u8]>>,
}

// SAFETY: the mapped flags guarantee at most one live view per block, and
// the flags themselves are guarded by the state lock.
unsafe impl Send for RamContainer {}
unsafe impl Sync for RamContainer {}

impl RamContainer {
    pub fn new(block_count: u64, block_size: usize) -> Self {
        let bytes = block_count as usize * block_size;
        Self {
            block_size,
            block_count,
            read_only: false,
            state: SpinLock::new(RamState {
                mapped: bitvec![u8, Lsb0; 0; block_count as usize],
                lowest_written_lba: None,
                highest_written_lba: None,
            }),
            storage: UnsafeCell::new(alloc::vec![0u8; bytes].into_boxed_slice()),
        }
    }

    /// Creates a container over existing block contents, e.g. an ingested
    /// disk image body.
    pub fn from_blocks(contents: &[u8], block_count: u64, block_size: usize) -> Self {
        let container = Self::new(block_count, block_size);
        // SAFETY: no block is mapped yet, so the storage is unaliased.
        let storage = unsafe { &mut *container.storage.get() };
        let len = contents.len().min(storage.len());
        storage[..len].copy_from_slice(&contents[..len]);
        container
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// The lowest LBA that has been written back, if any.
    pub fn lowest_written_lba(&self) -> Option<u64> {
        self.state.lock().lowest_written_lba
    }

    /// The highest LBA that has been written back, if any.
    pub fn highest_written_lba(&self) -> Option<u64> {
        self.state.lock().highest_written_lba
    }

    pub fn is_wholly_unwritten(&self) -> bool {
        self.state.lock().highest_written_lba.is_none()
    }

    // Copies block `lba` into `out` without going through a mapping. Used by
    // the image writer.
    pub(crate) fn read_block_raw(&self, lba: u64, out: &mut [u8]) {
        let state = self.state.lock();
        assert!(!state.mapped[lba as usize], "raw read of a mapped block");
        let offset = lba as usize * self.block_size;
        // SAFETY: the block is unmapped, so no mutable view exists.
        let storage = unsafe { &*self.storage.get() };
        out.copy_from_slice(&storage[offset..offset + self.block_size]);
    }
}

impl BlockContainer for RamContainer {
    fn info(&self) -> ContainerInfo {
        ContainerInfo {
            block_size: self.block_size,
            block_count: self.block_count,
            is_read_only: self.read_only,
        }
    }

    fn map_block(&self, lba: u64, mode: MapMode) -> Result<BlockGuard> {
        if lba >= self.block_count {
            return_errno_with_message!(Errno::ENXIO, "LBA beyond end of container");
        }
        if self.read_only && mode.is_writable() {
            return_errno_with_message!(Errno::EROFS, "container is read-only");
        }

        {
            let mut state = self.state.lock();
            if state.mapped[lba as usize] {
                panic!("block {} is already mapped", lba);
            }
            state.mapped.set(lba as usize, true);
        }

        let offset = lba as usize * self.block_size;
        // SAFETY: the mapped flag was just taken, so this is the only view
        // of the block; the storage itself is never reallocated.
        let data = unsafe {
            let base = (*self.storage.get()).as_mut_ptr().add(offset);
            NonNull::new_unchecked(base)
        };

        let mut guard =
            // SAFETY: `data` covers one block of stable storage, and the
            // mapped flag keeps it unaliased until unmap.
            unsafe { BlockGuard::new(lba, data, self.block_size, mode.is_writable()) };
        if mode == MapMode::Cleared {
            guard.as_mut_slice().fill(0);
        }
        Ok(guard)
    }

    fn unmap_block(&self, guard: BlockGuard, mode: WriteBack) -> Result<()> {
        let lba = guard.lba();
        let writable = guard.is_writable();
        drop(guard);

        let mut state = self.state.lock();
        if lba >= self.block_count || !state.mapped[lba as usize] {
            return_errno_with_message!(Errno::ENXIO, "unmap of an unmapped block");
        }
        state.mapped.set(lba as usize, false);

        // RAM writes are in place, so Sync and Deferred only differ in the
        // write tracking; None discards the modification state.
        if writable && mode != WriteBack::None {
            state.lowest_written_lba = Some(match state.lowest_written_lba {
                Some(lowest) => lowest.min(lba),
                None => lba,
            });
            state.highest_written_lba = Some(match state.highest_written_lba {
                Some(highest) => highest.max(lba),
                None => lba,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::BLOCK_SIZE;

    #[test]
    fn written_bytes_survive_a_remap() {
        let disk = RamContainer::new(8, BLOCK_SIZE);

        let mut block = disk.map_block(3, MapMode::Replace).unwrap();
        block.as_mut_slice().fill(0xa5);
        disk.unmap_block(block, WriteBack::Sync).unwrap();

        let block = disk.map_block(3, MapMode::ReadOnly).unwrap();
        assert!(block.iter().all(|&b| b == 0xa5));
        disk.unmap_block(block, WriteBack::None).unwrap();
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn double_map_of_one_block_is_fatal() {
        let disk = RamContainer::new(8, BLOCK_SIZE);
        let first = disk.map_block(2, MapMode::ReadOnly).unwrap();
        let _second = disk.map_block(2, MapMode::ReadOnly);
        drop(first);
    }

    #[test]
    fn lba_beyond_the_end_is_enxio() {
        let disk = RamContainer::new(8, BLOCK_SIZE);
        let err = disk.map_block(8, MapMode::ReadOnly).unwrap_err();
        assert_eq!(err.error(), Errno::ENXIO);
    }

    #[test]
    fn cleared_mapping_zeroes_the_block() {
        let disk = RamContainer::new(4, BLOCK_SIZE);

        let mut block = disk.map_block(0, MapMode::Replace).unwrap();
        block.as_mut_slice().fill(0xff);
        disk.unmap_block(block, WriteBack::Sync).unwrap();

        let block = disk.map_block(0, MapMode::Cleared).unwrap();
        assert!(block.iter().all(|&b| b == 0));
        disk.unmap_block(block, WriteBack::Sync).unwrap();
    }

    #[test]
    fn write_tracking_follows_writeback_mode() {
        let disk = RamContainer::new(16, BLOCK_SIZE);
        assert!(disk.is_wholly_unwritten());

        // A read-only unmap does not count as a write.
        let block = disk.map_block(5, MapMode::ReadOnly).unwrap();
        disk.unmap_block(block, WriteBack::Sync).unwrap();
        assert!(disk.is_wholly_unwritten());

        // Neither does discarding a writable mapping.
        let block = disk.map_block(5, MapMode::Update).unwrap();
        disk.unmap_block(block, WriteBack::None).unwrap();
        assert!(disk.is_wholly_unwritten());

        let block = disk.map_block(9, MapMode::Update).unwrap();
        disk.unmap_block(block, WriteBack::Deferred).unwrap();
        let block = disk.map_block(2, MapMode::Replace).unwrap();
        disk.unmap_block(block, WriteBack::Sync).unwrap();

        assert_eq!(disk.lowest_written_lba(), Some(2));
        assert_eq!(disk.highest_written_lba(), Some(9));
    }

    #[test]
    fn read_only_container_refuses_writable_mappings() {
        let mut disk = RamContainer::new(4, BLOCK_SIZE);
        disk.set_read_only(true);
        let err = disk.map_block(0, MapMode::Update).unwrap_err();
        assert_eq!(err.error(), Errno::EROFS);
        disk.map_block(0, MapMode::ReadOnly).unwrap();
    }

    #[test]
    #[should_panic(expected = "read-only block mapping")]
    fn writing_through_a_read_only_mapping_is_fatal() {
        let disk = RamContainer::new(4, BLOCK_SIZE);
        let mut block = disk.map_block(1, MapMode::ReadOnly).unwrap();
        block.as_mut_slice()[0] = 1;
    }
}
