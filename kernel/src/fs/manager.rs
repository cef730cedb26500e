// SPDX-License-Identifier: MPL-2.0

use hashbrown::HashMap;
use kestrel_frame::sync::SpinLock;

use crate::fs::filesystem::{Filesystem, InodeGuard};
use crate::fs::inode::{FilesystemId, Inode};
use crate::prelude::*;

// One mounted filesystem and the place it hangs off of. The root mount is
// the only one with no mounting side.
struct Mountpoint {
    fs: Arc<dyn Filesystem>,
    mounting_fs: Option<Arc<dyn Filesystem>>,
    mounting_inode: Option<InodeGuard>,
}

struct MgrInner {
    mounts: Vec<Mountpoint>,
    open_channels: HashMap<FilesystemId, usize>,
}

/// The mount table.
///
/// Keeps a strong reference to every mounted filesystem, an acquisition of
/// every mountpoint directory, and the per-filesystem count of open I/O
/// channels that the safe-unmount check relies on.
pub struct FilesystemManager {
    inner: SpinLock<MgrInner>,
}

impl FilesystemManager {
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(MgrInner {
                mounts: Vec::new(),
                open_channels: HashMap::new(),
            }),
        }
    }

    /// Mounts `fs`. The first mount needs no mountpoint and becomes the
    /// root mount; every further mount attaches to the directory `at`.
    pub fn mount(
        &self,
        ctx: &SchedCtx,
        fs: Arc<dyn Filesystem>,
        params: &[u8],
        at: Option<&InodeGuard>,
    ) -> Result<()> {
        {
            let inner = self.inner.lock();
            if inner.mounts.iter().any(|m| m.fs.id() == fs.id()) {
                return_errno_with_message!(Errno::EINVAL, "filesystem is already mounted");
            }
            match at {
                None => {
                    if !inner.mounts.is_empty() {
                        return_errno_with_message!(Errno::EINVAL, "mountpoint required");
                    }
                }
                Some(at) => {
                    if inner.mounts.is_empty() {
                        return_errno_with_message!(Errno::EINVAL, "no root filesystem yet");
                    }
                    if at.fs().id() == fs.id() {
                        return_errno_with_message!(
                            Errno::EINVAL,
                            "cannot mount a filesystem on itself"
                        );
                    }
                    if !at.node().is_directory() {
                        return_errno_with_message!(Errno::ENOTDIR, "mountpoint is not a directory");
                    }
                    if at.node().is_mountpoint() {
                        return_errno_with_message!(Errno::EBUSY, "mountpoint is in use");
                    }
                }
            }
        }

        fs.on_mount(ctx, params)?;

        let mount = match at {
            None => Mountpoint {
                fs,
                mounting_fs: None,
                mounting_inode: None,
            },
            Some(at) => {
                at.node().set_mounted_fsid(Some(fs.id()));
                at.node().set_mountpoint(true);
                Mountpoint {
                    fs,
                    mounting_fs: Some(at.fs().clone()),
                    mounting_inode: Some(at.clone()),
                }
            }
        };
        log::info!("fs: mounted filesystem {}", mount.fs.id());
        self.inner.lock().mounts.push(mount);
        Ok(())
    }

    /// Unmounts `fs`, which must be the filesystem mounted at `at` and not
    /// the root filesystem. Unmount errors from the filesystem itself are
    /// advisory.
    pub fn unmount(&self, ctx: &SchedCtx, fs: &Arc<dyn Filesystem>, at: &InodeGuard) -> Result<()> {
        {
            let inner = self.inner.lock();
            let Some(idx) = inner.mounts.iter().position(|m| m.fs.id() == fs.id()) else {
                return_errno_with_message!(Errno::EINVAL, "filesystem is not mounted");
            };
            if idx == 0 {
                return_errno_with_message!(Errno::EBUSY, "cannot unmount the root filesystem");
            }
            let mounted_at = inner.mounts[idx].mounting_inode.as_ref().unwrap();
            if !mounted_at.node().is_same(at.node()) {
                return_errno_with_message!(Errno::EINVAL, "filesystem is not mounted here");
            }
        }

        if let Err(err) = fs.on_unmount(ctx, self) {
            log::warn!("fs: unmount of {} reported {:?}", fs.id(), err.error());
        }

        let mount = {
            let mut inner = self.inner.lock();
            let idx = inner
                .mounts
                .iter()
                .position(|m| m.fs.id() == fs.id())
                .unwrap();
            inner.mounts.remove(idx)
        };
        at.node().set_mounted_fsid(None);
        at.node().set_mountpoint(false);
        log::info!("fs: unmounted filesystem {}", fs.id());
        drop(mount);
        Ok(())
    }

    /// The filesystem registered under `fsid`.
    pub fn filesystem_for_id(&self, fsid: FilesystemId) -> Option<Arc<dyn Filesystem>> {
        let inner = self.inner.lock();
        inner
            .mounts
            .iter()
            .find(|m| m.fs.id() == fsid)
            .map(|m| m.fs.clone())
    }

    /// The root filesystem, once one is mounted.
    pub fn root_filesystem(&self) -> Option<Arc<dyn Filesystem>> {
        self.inner.lock().mounts.first().map(|m| m.fs.clone())
    }

    /// Probes whether `node` is a mountpoint and returns the filesystem
    /// mounted on it.
    pub fn filesystem_mounted_at(&self, node: &Inode) -> Option<Arc<dyn Filesystem>> {
        if !node.is_mountpoint() {
            return None;
        }
        let inner = self.inner.lock();
        inner
            .mounts
            .iter()
            .find(|m| {
                m.mounting_inode
                    .as_ref()
                    .is_some_and(|at| at.node().is_same(node))
            })
            .map(|m| m.fs.clone())
    }

    /// The directory a filesystem is mounted on, together with the mounting
    /// filesystem. `None` for the root filesystem. Used for `..` traversal
    /// across mount boundaries.
    pub fn mountpoint_of_filesystem(
        &self,
        fsid: FilesystemId,
    ) -> Option<(InodeGuard, Arc<dyn Filesystem>)> {
        let inner = self.inner.lock();
        let mount = inner.mounts.iter().find(|m| m.fs.id() == fsid)?;
        let at = mount.mounting_inode.as_ref()?;
        Some((at.clone(), mount.mounting_fs.as_ref().unwrap().clone()))
    }

    /// Whether no open I/O channel refers to the filesystem anymore.
    /// Filesystems call this from their unmount path.
    pub fn can_safely_unmount(&self, fsid: FilesystemId) -> bool {
        self.inner
            .lock()
            .open_channels
            .get(&fsid)
            .copied()
            .unwrap_or(0)
            == 0
    }

    pub(crate) fn channel_opened(&self, fsid: FilesystemId) {
        *self.inner.lock().open_channels.entry(fsid).or_insert(0) += 1;
    }

    pub(crate) fn channel_closed(&self, fsid: FilesystemId) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.open_channels.get_mut(&fsid) {
            *count = count.saturating_sub(1);
        }
    }
}

impl Default for FilesystemManager {
    fn default() -> Self {
        Self::new()
    }
}
