// SPDX-License-Identifier: MPL-2.0

//! The on-disk structures of KestrelFS.

use kestrel_block::{BlockContainer, MapMode, WriteBack, BLOCK_SIZE};
use static_assertions::const_assert_eq;
use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::prelude::*;

pub const KFS_MAGIC: [u8; 4] = *b"KFS1";
pub const KFS_VERSION: u32 = 1;

/// Number of direct block pointers per inode; also the maximum file length
/// in blocks.
pub const DIRECT_POINTER_COUNT: usize = 114;

pub const DIR_ENTRY_SIZE: usize = 32;
pub const DIR_ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / DIR_ENTRY_SIZE;

// Bits per bitmap block.
pub const BITS_PER_BITMAP_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

/// Block 0 of every KestrelFS volume.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DiskSuperBlock {
    pub magic: [u8; 4],
    pub version: U32,
    pub block_count: U32,
    pub inode_count: U32,
    pub bitmap_start: U32,
    pub bitmap_blocks: U32,
    pub itable_start: U32,
    pub data_start: U32,
    pub root_ino: U32,
}

const_assert_eq!(core::mem::size_of::<DiskSuperBlock>(), 36);

/// One inode record. The inode table stores one record per block, so the
/// record of inode `i` (1-based) lives in block `itable_start + i - 1`.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DiskInode {
    pub file_type: u8,
    pub reserved0: u8,
    pub permissions: U16,
    pub link_count: U16,
    pub reserved1: [u8; 2],
    pub uid: U32,
    pub gid: U32,
    pub size: U64,
    pub access_time: U32,
    pub modification_time: U32,
    pub status_change_time: U32,
    pub direct: [U32; DIRECT_POINTER_COUNT],
    pub reserved2: [u8; 20],
}

const_assert_eq!(core::mem::size_of::<DiskInode>(), BLOCK_SIZE);

pub const FILE_TYPE_FREE: u8 = 0;
pub const FILE_TYPE_REGULAR: u8 = 1;
pub const FILE_TYPE_DIRECTORY: u8 = 2;
pub const FILE_TYPE_DEVICE: u8 = 3;
pub const FILE_TYPE_NAMED_PIPE: u8 = 4;
pub const FILE_TYPE_SYMBOLIC_LINK: u8 = 5;

/// One directory entry: the referenced inode id plus the NUL-padded name.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone)]
#[repr(C)]
pub struct DirEntryRaw {
    pub ino: U32,
    pub name: [u8; 28],
}

const_assert_eq!(core::mem::size_of::<DirEntryRaw>(), DIR_ENTRY_SIZE);

impl DirEntryRaw {
    pub fn new(ino: u32, name: &[u8]) -> Self {
        debug_assert!(name.len() <= 28);
        let mut padded = [0u8; 28];
        padded[..name.len()].copy_from_slice(name);
        Self {
            ino: U32::new(ino),
            name: padded,
        }
    }

    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(28);
        &self.name[..len]
    }

    pub fn name_matches(&self, name: &[u8]) -> bool {
        self.name_bytes() == name
    }
}

/// The volume geometry, as read from the superblock.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub block_count: u32,
    pub inode_count: u32,
    pub bitmap_start: u32,
    pub bitmap_blocks: u32,
    pub itable_start: u32,
    pub data_start: u32,
    pub root_ino: u32,
}

impl Geometry {
    pub fn compute(block_count: u32, inode_count: u32) -> Result<Self> {
        let bitmap_blocks = block_count.div_ceil(BITS_PER_BITMAP_BLOCK);
        let itable_start = 1 + bitmap_blocks;
        let data_start = itable_start + inode_count;
        // The smallest useful volume stores at least the root directory.
        if inode_count == 0 || data_start >= block_count {
            return_errno_with_message!(Errno::ENOSPC, "volume too small for the chosen layout");
        }
        Ok(Self {
            block_count,
            inode_count,
            bitmap_start: 1,
            bitmap_blocks,
            itable_start,
            data_start,
            root_ino: 1,
        })
    }

    pub fn from_super_block(sb: &DiskSuperBlock, device_blocks: u64) -> Result<Self> {
        if sb.magic != KFS_MAGIC {
            return_errno_with_message!(Errno::EIO, "bad filesystem magic");
        }
        if sb.version.get() != KFS_VERSION {
            return_errno_with_message!(Errno::EIO, "unsupported filesystem version");
        }
        let geometry = Self {
            block_count: sb.block_count.get(),
            inode_count: sb.inode_count.get(),
            bitmap_start: sb.bitmap_start.get(),
            bitmap_blocks: sb.bitmap_blocks.get(),
            itable_start: sb.itable_start.get(),
            data_start: sb.data_start.get(),
            root_ino: sb.root_ino.get(),
        };
        if geometry.block_count as u64 > device_blocks
            || geometry.data_start >= geometry.block_count
            || geometry.root_ino == 0
            || geometry.root_ino > geometry.inode_count
        {
            return_errno_with_message!(Errno::EIO, "corrupt filesystem geometry");
        }
        Ok(geometry)
    }

    pub fn to_super_block(self) -> DiskSuperBlock {
        DiskSuperBlock {
            magic: KFS_MAGIC,
            version: U32::new(KFS_VERSION),
            block_count: U32::new(self.block_count),
            inode_count: U32::new(self.inode_count),
            bitmap_start: U32::new(self.bitmap_start),
            bitmap_blocks: U32::new(self.bitmap_blocks),
            itable_start: U32::new(self.itable_start),
            data_start: U32::new(self.data_start),
            root_ino: U32::new(self.root_ino),
        }
    }

    pub fn inode_block(&self, ino: u32) -> u64 {
        (self.itable_start + ino - 1) as u64
    }
}

/// Writes an empty KestrelFS volume onto the container: superblock, block
/// bitmap, inode table and the root directory.
pub fn format(container: &dyn BlockContainer, inode_count: u32) -> Result<()> {
    let info = container.info();
    if info.block_size != BLOCK_SIZE {
        return_errno_with_message!(Errno::EINVAL, "container block size must be 512");
    }
    let block_count = u32::try_from(info.block_count)
        .map_err(|_| Error::with_message(Errno::EINVAL, "container too large"))?;
    let geometry = Geometry::compute(block_count, inode_count)?;
    let root_dir_block = geometry.data_start;

    // Superblock.
    let mut block = container.map_block(0, MapMode::Cleared)?;
    block.as_mut_slice()[..core::mem::size_of::<DiskSuperBlock>()]
        .copy_from_slice(geometry.to_super_block().as_bytes());
    container.unmap_block(block, WriteBack::Sync)?;

    // Block bitmap: all metadata blocks plus the root directory block are
    // in use.
    let used_blocks = root_dir_block + 1;
    for bitmap_idx in 0..geometry.bitmap_blocks {
        let mut block =
            container.map_block((geometry.bitmap_start + bitmap_idx) as u64, MapMode::Cleared)?;
        let first_bit = bitmap_idx * BITS_PER_BITMAP_BLOCK;
        let buf = block.as_mut_slice();
        for bit in 0..BITS_PER_BITMAP_BLOCK {
            let device_block = first_bit + bit;
            if device_block >= used_blocks {
                break;
            }
            buf[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        container.unmap_block(block, WriteBack::Sync)?;
    }

    // Inode table: every record free except the root directory.
    for ino in 1..=geometry.inode_count {
        let lba = geometry.inode_block(ino);
        if ino != geometry.root_ino {
            let block = container.map_block(lba, MapMode::Cleared)?;
            container.unmap_block(block, WriteBack::Sync)?;
            continue;
        }

        let mut root = DiskInode::new_zeroed();
        root.file_type = FILE_TYPE_DIRECTORY;
        root.permissions = U16::new(0o755);
        root.link_count = U16::new(2);
        root.size = U64::new(2 * DIR_ENTRY_SIZE as u64);
        root.direct[0] = U32::new(root_dir_block);

        let mut block = container.map_block(lba, MapMode::Cleared)?;
        block.as_mut_slice().copy_from_slice(root.as_bytes());
        container.unmap_block(block, WriteBack::Sync)?;
    }

    // The root directory itself: "." and "..", both the root.
    let mut block = container.map_block(root_dir_block as u64, MapMode::Cleared)?;
    let buf = block.as_mut_slice();
    buf[..DIR_ENTRY_SIZE].copy_from_slice(DirEntryRaw::new(geometry.root_ino, b".").as_bytes());
    buf[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]
        .copy_from_slice(DirEntryRaw::new(geometry.root_ino, b"..").as_bytes());
    container.unmap_block(block, WriteBack::Sync)?;

    log::info!(
        "kfs: formatted {} blocks, {} inodes",
        geometry.block_count,
        geometry.inode_count
    );
    Ok(())
}
