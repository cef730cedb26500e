// SPDX-License-Identifier: MPL-2.0

//! The filesystem core.
//!
//! Filesystems own their inodes; everyone else holds counted acquisitions
//! ([`InodeGuard`]). The [`FilesystemManager`] keeps the mount table, and
//! the [`PathResolver`] walks names across mount boundaries.

mod filesystem;
mod inode;
pub mod kfs;
mod manager;
mod resolver;
#[cfg(test)]
mod test;

pub use filesystem::{
    alloc_filesystem_id, DirEntry, Filesystem, InodeGuard, NameBuffer, PathComponent, NAME_MAX,
    PATH_MAX,
};
pub use inode::{
    Access, FileInfo, FileInfoUpdate, FilePermissions, FilesystemId, Inode, InodeId, InodeState,
    InodeType, User, ROOT_UID,
};
pub use manager::FilesystemManager;
pub use resolver::{PathResolver, Resolved, ResolveMode};
