// SPDX-License-Identifier: MPL-2.0

//! KestrelFS, the system's native on-disk filesystem.
//!
//! The format is deliberately plain: 512-byte blocks, one superblock, a
//! whole-device block allocation bitmap, a table of fixed-size inode
//! records with up to 114 direct block pointers each, and directories made
//! of 32-byte entries whose first two slots are always `.` and `..`.

mod disk;
mod fs;

pub use disk::{format, DirEntryRaw, DiskInode, DiskSuperBlock, DIR_ENTRIES_PER_BLOCK, KFS_MAGIC};
pub use fs::KfsFilesystem;
