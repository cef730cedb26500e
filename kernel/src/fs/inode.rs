// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use kestrel_frame::sync::{Mutex, MutexGuard, SpinLock, SpinLockGuard};

use crate::prelude::*;

/// A filesystem-local inode id.
pub type InodeId = u32;

/// A globally unique id of a filesystem instance.
pub type FilesystemId = u32;

pub const ROOT_UID: u32 = 0;

/// The type of a filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    RegularFile,
    Directory,
    Device,
    NamedPipe,
    SymbolicLink,
    Filesystem,
    Process,
}

bitflags::bitflags! {
    /// POSIX-style permission bits: owner, group and other classes of
    /// read/write/execute.
    pub struct FilePermissions: u16 {
        const OTHER_EXECUTE = 0o0001;
        const OTHER_WRITE   = 0o0002;
        const OTHER_READ    = 0o0004;
        const GROUP_EXECUTE = 0o0010;
        const GROUP_WRITE   = 0o0020;
        const GROUP_READ    = 0o0040;
        const OWNER_EXECUTE = 0o0100;
        const OWNER_WRITE   = 0o0200;
        const OWNER_READ    = 0o0400;
    }
}

impl FilePermissions {
    /// Builds a permission set from one [`Access`] value per class.
    pub fn make(owner: Access, group: Access, other: Access) -> Self {
        Self::from_bits_truncate(
            ((owner.bits() as u16) << 6) | ((group.bits() as u16) << 3) | other.bits() as u16,
        )
    }
}

bitflags::bitflags! {
    /// A requested access within a single permission class.
    pub struct Access: u16 {
        const EXECUTE = 0o1;
        const WRITE   = 0o2;
        const READ    = 0o4;
    }
}

/// The identity an operation is performed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

impl User {
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub const fn root() -> Self {
        Self::new(ROOT_UID, 0)
    }
}

bitflags::bitflags! {
    struct InodeFlags: u8 {
        /// Another filesystem is mounted on this directory. Owned by the
        /// filesystem manager.
        const MOUNTPOINT     = 0x01;
        /// The access time needs updating.
        const ACCESSED       = 0x02;
        /// The modification time needs updating.
        const UPDATED        = 0x04;
        /// The status-change time needs updating.
        const STATUS_CHANGED = 0x08;
    }
}

/// The mutable attributes of an inode.
pub struct InodeState {
    pub uid: u32,
    pub gid: u32,
    pub permissions: FilePermissions,
    pub link_count: u32,
    pub size: u64,
    pub access_time: u64,
    pub modification_time: u64,
    pub status_change_time: u64,
    /// Filesystem-private payload.
    pub refcon: Option<Box<dyn Any + Send + Sync>>,
}

/// A snapshot of an inode's metadata.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub fsid: FilesystemId,
    pub ino: InodeId,
    pub type_: InodeType,
    pub uid: u32,
    pub gid: u32,
    pub permissions: FilePermissions,
    pub link_count: u32,
    pub size: u64,
    pub access_time: u64,
    pub modification_time: u64,
    pub status_change_time: u64,
}

/// A metadata update request. Only the populated fields change.
#[derive(Default)]
pub struct FileInfoUpdate {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// New permission bits plus the mask of bits to take from them.
    pub permissions: Option<(FilePermissions, FilePermissions)>,
}

/// The meta information of a file or directory.
///
/// The owning filesystem creates inodes and manages their use counts;
/// everyone else refers to them through acquisitions. Two inodes are the
/// same object iff their `(fsid, ino)` pair matches. The protocol lock is
/// held across multi-step operations that mutate inode state; the state
/// itself sits behind a short-lived spin lock.
pub struct Inode {
    fsid: FilesystemId,
    ino: InodeId,
    type_: InodeType,
    flags: AtomicU8,
    mounted_fsid: AtomicU32,
    use_count: AtomicU32,
    lock: Mutex<()>,
    state: SpinLock<InodeState>,
}

impl Inode {
    pub fn new(fsid: FilesystemId, ino: InodeId, type_: InodeType, state: InodeState) -> Arc<Self> {
        Arc::new(Self {
            fsid,
            ino,
            type_,
            flags: AtomicU8::new(0),
            mounted_fsid: AtomicU32::new(0),
            use_count: AtomicU32::new(0),
            lock: Mutex::new(()),
            state: SpinLock::new(state),
        })
    }

    pub fn fsid(&self) -> FilesystemId {
        self.fsid
    }

    pub fn ino(&self) -> InodeId {
        self.ino
    }

    pub fn type_(&self) -> InodeType {
        self.type_
    }

    pub fn is_directory(&self) -> bool {
        self.type_ == InodeType::Directory
    }

    /// Takes the inode protocol lock for a multi-step operation.
    pub fn lock<'a>(&'a self, ctx: &SchedCtx<'a>) -> Result<MutexGuard<'a, ()>> {
        self.lock.lock(ctx)
    }

    /// Short-term access to the inode attributes.
    pub fn state(&self) -> SpinLockGuard<'_, InodeState> {
        self.state.lock()
    }

    /// Whether `self` and `other` denote the same filesystem object.
    pub fn is_same(&self, other: &Inode) -> bool {
        self.fsid == other.fsid && self.ino == other.ino
    }

    // Use counting, managed by the owning filesystem.

    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::Acquire)
    }

    pub fn retain(&self) -> u32 {
        self.use_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn release(&self) -> u32 {
        let prev = self.use_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        prev - 1
    }

    // Mountpoint bookkeeping, owned by the filesystem manager.

    pub fn is_mountpoint(&self) -> bool {
        self.flags().contains(InodeFlags::MOUNTPOINT)
    }

    pub fn set_mountpoint(&self, is_mountpoint: bool) {
        if is_mountpoint {
            self.flags.fetch_or(InodeFlags::MOUNTPOINT.bits(), Ordering::AcqRel);
        } else {
            self.flags
                .fetch_and(!InodeFlags::MOUNTPOINT.bits(), Ordering::AcqRel);
        }
    }

    /// The id of the filesystem mounted on this directory, if any.
    pub fn mounted_fsid(&self) -> Option<FilesystemId> {
        match self.mounted_fsid.load(Ordering::Acquire) {
            0 => None,
            fsid => Some(fsid),
        }
    }

    pub fn set_mounted_fsid(&self, fsid: Option<FilesystemId>) {
        debug_assert!(self.is_directory());
        self.mounted_fsid.store(fsid.unwrap_or(0), Ordering::Release);
    }

    // Modification flags.

    fn flags(&self) -> InodeFlags {
        InodeFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn mark_accessed(&self) {
        self.flags.fetch_or(InodeFlags::ACCESSED.bits(), Ordering::AcqRel);
    }

    pub fn mark_updated(&self) {
        self.flags.fetch_or(InodeFlags::UPDATED.bits(), Ordering::AcqRel);
    }

    pub fn mark_status_changed(&self) {
        self.flags
            .fetch_or(InodeFlags::STATUS_CHANGED.bits(), Ordering::AcqRel);
    }

    pub fn is_modified(&self) -> bool {
        self.flags()
            .intersects(InodeFlags::ACCESSED | InodeFlags::UPDATED | InodeFlags::STATUS_CHANGED)
    }

    pub fn clear_modified(&self) {
        self.flags.fetch_and(
            !(InodeFlags::ACCESSED | InodeFlags::UPDATED | InodeFlags::STATUS_CHANGED).bits(),
            Ordering::AcqRel,
        );
    }

    /// Verifies that `user` has at least `access` on this inode, picking the
    /// owner, group or other permission class as appropriate.
    pub fn check_access(&self, user: User, access: Access) -> Result<()> {
        let state = self.state();
        let required = if state.uid == user.uid {
            FilePermissions::make(access, Access::empty(), Access::empty())
        } else if state.gid == user.gid {
            FilePermissions::make(Access::empty(), access, Access::empty())
        } else {
            FilePermissions::make(Access::empty(), Access::empty(), access)
        };
        if state.permissions.contains(required) {
            Ok(())
        } else {
            return_errno_with_message!(Errno::EACCES, "insufficient permissions")
        }
    }

    /// A snapshot of the metadata.
    pub fn file_info(&self) -> FileInfo {
        let state = self.state();
        FileInfo {
            fsid: self.fsid,
            ino: self.ino,
            type_: self.type_,
            uid: state.uid,
            gid: state.gid,
            permissions: state.permissions,
            link_count: state.link_count,
            size: state.size,
            access_time: state.access_time,
            modification_time: state.modification_time,
            status_change_time: state.status_change_time,
        }
    }

    /// Applies a metadata update. Changing the owner, group or permission
    /// bits requires being the owner or root.
    pub fn update_file_info(&self, user: User, update: &FileInfoUpdate) -> Result<()> {
        let mut state = self.state();

        let changes_identity =
            update.uid.is_some() || update.gid.is_some() || update.permissions.is_some();
        if changes_identity && user.uid != state.uid && user.uid != ROOT_UID {
            return_errno_with_message!(Errno::EPERM, "not the owner");
        }

        if let Some(uid) = update.uid {
            state.uid = uid;
        }
        if let Some(gid) = update.gid {
            state.gid = gid;
        }
        if let Some((permissions, mask)) = update.permissions {
            let kept = state.permissions.bits() & !mask.bits();
            state.permissions =
                FilePermissions::from_bits_truncate(kept | (permissions.bits() & mask.bits()));
        }
        drop(state);
        self.mark_status_changed();
        Ok(())
    }
}

impl PartialEq for Inode {
    fn eq(&self, other: &Self) -> bool {
        self.is_same(other)
    }
}

impl Eq for Inode {}

impl Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Inode")
            .field("fsid", &self.fsid)
            .field("ino", &self.ino)
            .field("type", &self.type_)
            .finish()
    }
}
