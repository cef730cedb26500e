// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU32, Ordering};

use crate::fs::inode::{
    Access, FileInfo, FileInfoUpdate, FilePermissions, FilesystemId, Inode, InodeId, InodeType,
    User,
};
use crate::fs::manager::FilesystemManager;
use crate::prelude::*;

/// The longest name a single path component may have.
pub const NAME_MAX: usize = 28;

/// The longest path the resolver accepts.
pub const PATH_MAX: usize = 511;

static NEXT_FSID: AtomicU32 = AtomicU32::new(1);

/// Returns the next available filesystem id.
pub fn alloc_filesystem_id() -> FilesystemId {
    NEXT_FSID.fetch_add(1, Ordering::Relaxed)
}

/// One component of a path. Never empty and never contains a separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathComponent<'a> {
    name: &'a str,
}

impl<'a> PathComponent<'a> {
    pub fn new(name: &'a str) -> Result<Self> {
        if name.is_empty() || name.contains('/') {
            return_errno_with_message!(Errno::EINVAL, "malformed path component");
        }
        if name.len() > NAME_MAX {
            return_errno_with_message!(Errno::ENAMETOOLONG, "path component too long");
        }
        Ok(Self { name })
    }

    pub const fn self_dir() -> Self {
        Self { name: "." }
    }

    pub const fn parent_dir() -> Self {
        Self { name: ".." }
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn is_self(&self) -> bool {
        self.name == "."
    }

    pub fn is_parent(&self) -> bool {
        self.name == ".."
    }
}

/// A fixed-capacity buffer a filesystem writes a component name into.
#[derive(Clone, Copy)]
pub struct NameBuffer {
    buf: [u8; NAME_MAX],
    len: usize,
}

impl NameBuffer {
    pub fn new() -> Self {
        Self {
            buf: [0; NAME_MAX],
            len: 0,
        }
    }

    pub fn set(&mut self, name: &[u8]) -> Result<()> {
        if name.len() > NAME_MAX {
            return_errno_with_message!(Errno::ERANGE, "name does not fit");
        }
        self.buf[..name.len()].copy_from_slice(name);
        self.len = name.len();
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for NameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for NameBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One directory entry as reported by [`Filesystem::read_directory`].
#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub ino: InodeId,
    pub name: NameBuffer,
}

/// The interface every filesystem implements.
///
/// A filesystem owns its inodes. Callers acquire them (directly or through
/// [`InodeGuard`]) and must pair every acquisition with a relinquish; the
/// filesystem uses the inode use counts to drive its cache.
pub trait Filesystem: Send + Sync + Any {
    fn id(&self) -> FilesystemId;

    /// Invoked when an instance of this filesystem is mounted.
    fn on_mount(&self, ctx: &SchedCtx, params: &[u8]) -> Result<()>;

    /// Invoked when a mounted instance is unmounted. The outcome is
    /// advisory; the unmount completes regardless. Implementations verify
    /// through [`FilesystemManager::can_safely_unmount`] that no channels
    /// are left open.
    fn on_unmount(&self, _ctx: &SchedCtx, _manager: &FilesystemManager) -> Result<()> {
        Ok(())
    }

    /// Acquires the root directory of the filesystem.
    fn acquire_root_node(&self) -> Result<Arc<Inode>>;

    /// Acquires the node called `name` in `dir`. Handles `.` and `..`; a
    /// lookup of `..` on the filesystem root returns the root itself.
    fn acquire_node_for_name(
        &self,
        ctx: &SchedCtx,
        dir: &Arc<Inode>,
        name: &PathComponent,
        user: User,
    ) -> Result<Arc<Inode>>;

    /// Writes the name under which `child_ino` appears in `dir` into `out`.
    fn get_name_of_node(
        &self,
        ctx: &SchedCtx,
        dir: &Arc<Inode>,
        child_ino: InodeId,
        user: User,
        out: &mut NameBuffer,
    ) -> Result<()>;

    /// Takes another acquisition of an already-acquired node.
    fn reacquire_node(&self, node: &Arc<Inode>) -> Arc<Inode>;

    /// Gives up one acquisition.
    fn relinquish_node(&self, node: &Arc<Inode>);

    /// Creates a node of the given type in `dir` and returns it acquired.
    fn create_node(
        &self,
        _ctx: &SchedCtx,
        _dir: &Arc<Inode>,
        _name: &PathComponent,
        _type_: InodeType,
        _user: User,
        _permissions: FilePermissions,
    ) -> Result<Arc<Inode>> {
        Err(Error::with_message(Errno::ENOTSUP, "filesystem is read-only"))
    }

    /// Creates an empty directory in `dir`.
    fn create_directory(
        &self,
        ctx: &SchedCtx,
        dir: &Arc<Inode>,
        name: &PathComponent,
        user: User,
        permissions: FilePermissions,
    ) -> Result<()> {
        let node = self.create_node(ctx, dir, name, InodeType::Directory, user, permissions)?;
        self.relinquish_node(&node);
        Ok(())
    }

    /// Prepares `dir` for reading through a directory channel.
    fn open_directory(&self, ctx: &SchedCtx, dir: &Arc<Inode>, user: User) -> Result<()> {
        if !dir.is_directory() {
            return Err(Error::with_message(Errno::ENOTDIR, "not a directory"));
        }
        self.check_access(ctx, dir, user, Access::READ)
    }

    /// Reads directory entries starting at `start_index`. Entry 0 is `.`
    /// and entry 1 is `..`. Returns how many entries were produced.
    fn read_directory(
        &self,
        _ctx: &SchedCtx,
        _dir: &Arc<Inode>,
        _start_index: usize,
        _out: &mut [DirEntry],
    ) -> Result<usize> {
        Err(Error::with_message(Errno::ENOTSUP, "not a browsable filesystem"))
    }

    /// Tears down per-open directory state.
    fn close_directory(&self, _ctx: &SchedCtx, _dir: &Arc<Inode>) -> Result<()> {
        Ok(())
    }

    /// Verifies that `user` may access `node` as requested.
    fn check_access(
        &self,
        _ctx: &SchedCtx,
        node: &Arc<Inode>,
        user: User,
        access: Access,
    ) -> Result<()> {
        node.check_access(user, access)
    }

    fn get_file_info(&self, _ctx: &SchedCtx, node: &Arc<Inode>) -> Result<FileInfo> {
        Ok(node.file_info())
    }

    fn set_file_info(
        &self,
        _ctx: &SchedCtx,
        node: &Arc<Inode>,
        user: User,
        update: &FileInfoUpdate,
    ) -> Result<()> {
        node.update_file_info(user, update)
    }

    /// Reads file contents.
    fn read(
        &self,
        _ctx: &SchedCtx,
        _node: &Arc<Inode>,
        _offset: u64,
        _buf: &mut [u8],
    ) -> Result<usize> {
        Err(Error::with_message(Errno::ENOTSUP, "not readable"))
    }

    /// Writes file contents.
    fn write(
        &self,
        _ctx: &SchedCtx,
        _node: &Arc<Inode>,
        _offset: u64,
        _buf: &[u8],
    ) -> Result<usize> {
        Err(Error::with_message(Errno::ENOTSUP, "not writable"))
    }

    /// Flushes cached state to the backing store.
    fn sync(&self, _ctx: &SchedCtx) -> Result<()> {
        Ok(())
    }
}

impl dyn Filesystem {
    pub fn downcast_ref<T: Filesystem>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }
}

/// A counted inode acquisition: a filesystem reference plus one use count
/// on the node. Cloning reacquires; dropping relinquishes.
pub struct InodeGuard {
    fs: Arc<dyn Filesystem>,
    node: Arc<Inode>,
}

impl InodeGuard {
    /// Wraps a node freshly acquired from `fs`.
    pub fn from_acquired(fs: Arc<dyn Filesystem>, node: Arc<Inode>) -> Self {
        Self { fs, node }
    }

    /// Acquires the root directory of `fs`.
    pub fn acquire_root(fs: &Arc<dyn Filesystem>) -> Result<Self> {
        let node = fs.acquire_root_node()?;
        Ok(Self {
            fs: fs.clone(),
            node,
        })
    }

    pub fn fs(&self) -> &Arc<dyn Filesystem> {
        &self.fs
    }

    pub fn node(&self) -> &Arc<Inode> {
        &self.node
    }

    /// Acquires the node called `name` in this directory.
    pub fn lookup(&self, ctx: &SchedCtx, name: &PathComponent, user: User) -> Result<InodeGuard> {
        let node = self.fs.acquire_node_for_name(ctx, &self.node, name, user)?;
        Ok(Self {
            fs: self.fs.clone(),
            node,
        })
    }

    pub fn is_same_node(&self, other: &InodeGuard) -> bool {
        self.node.is_same(&other.node)
    }
}

impl Clone for InodeGuard {
    fn clone(&self) -> Self {
        Self {
            fs: self.fs.clone(),
            node: self.fs.reacquire_node(&self.node),
        }
    }
}

impl Drop for InodeGuard {
    fn drop(&mut self) {
        self.fs.relinquish_node(&self.node);
    }
}

impl core::ops::Deref for InodeGuard {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.node
    }
}

impl Debug for InodeGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InodeGuard")
            .field("fsid", &self.node.fsid())
            .field("ino", &self.node.ino())
            .finish()
    }
}
