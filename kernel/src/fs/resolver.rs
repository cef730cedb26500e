// SPDX-License-Identifier: MPL-2.0

use crate::fs::filesystem::{Filesystem, InodeGuard, PathComponent, NAME_MAX, PATH_MAX};
use crate::fs::inode::{Access, InodeId, User};
use crate::fs::manager::FilesystemManager;
use crate::prelude::*;

/// How far a resolution should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Resolve the whole path to its target.
    TargetOnly,
    /// Resolve to the parent of the last component and hand the last
    /// component back to the caller.
    ParentOnly,
}

/// The outcome of a resolution: the acquired node plus, in `ParentOnly`
/// mode, the unresolved last component.
#[derive(Debug)]
pub struct Resolved {
    pub inode: InodeGuard,
    pub last_component: String,
}

/// A per-caller path resolver.
///
/// The resolver is bound to a root directory (the ceiling `..` never
/// crosses) and a current working directory, both held as acquisitions.
/// Resolution walks the path one component at a time: descending into a
/// mountpoint switches to the mounted filesystem's root, and `..` at a
/// filesystem root re-crosses the mount to the parent of the mounting
/// directory.
pub struct PathResolver {
    manager: Arc<FilesystemManager>,
    root: InodeGuard,
    cwd: InodeGuard,
}

impl PathResolver {
    pub fn new(manager: Arc<FilesystemManager>, root: InodeGuard) -> Self {
        let cwd = root.clone();
        Self { manager, root, cwd }
    }

    pub fn root(&self) -> &InodeGuard {
        &self.root
    }

    pub fn cwd(&self) -> &InodeGuard {
        &self.cwd
    }

    /// Rebinds the current working directory. The target must be a
    /// searchable directory.
    pub fn set_cwd(&mut self, ctx: &SchedCtx, path: &str, user: User) -> Result<()> {
        let target = self.checked_directory(ctx, path, user)?;
        self.cwd = target;
        Ok(())
    }

    /// Rebinds the resolver's root directory.
    pub fn set_root(&mut self, ctx: &SchedCtx, path: &str, user: User) -> Result<()> {
        let target = self.checked_directory(ctx, path, user)?;
        self.root = target;
        Ok(())
    }

    fn checked_directory(&self, ctx: &SchedCtx, path: &str, user: User) -> Result<InodeGuard> {
        let resolved = self.resolve(ctx, ResolveMode::TargetOnly, path, user)?;
        if !resolved.inode.node().is_directory() {
            return_errno_with_message!(Errno::ENOTDIR, "not a directory");
        }
        resolved
            .inode
            .fs()
            .check_access(ctx, resolved.inode.node(), user, Access::EXECUTE)?;
        Ok(resolved.inode)
    }

    /// Resolves `path`, acquiring the resulting node.
    pub fn resolve(
        &self,
        ctx: &SchedCtx,
        mode: ResolveMode,
        path: &str,
        user: User,
    ) -> Result<Resolved> {
        if path.is_empty() {
            return_errno_with_message!(Errno::ENOENT, "empty path");
        }
        if path.len() > PATH_MAX {
            return_errno_with_message!(Errno::ENAMETOOLONG, "path too long");
        }

        let bytes = path.as_bytes();
        let mut iter = if bytes[0] == b'/' {
            self.root.clone()
        } else {
            self.cwd.clone()
        };

        let mut pos = 0;
        loop {
            // Skip over (runs of) separators.
            while pos < bytes.len() && bytes[pos] == b'/' {
                pos += 1;
            }

            let start = pos;
            while pos < bytes.len() && bytes[pos] != b'/' {
                pos += 1;
            }

            // A path that ends in a trailing separator resolves as if it
            // ended in ".".
            let name = if start == pos { "." } else { &path[start..pos] };
            if name.len() > NAME_MAX {
                return_errno_with_message!(Errno::ENAMETOOLONG, "path component too long");
            }
            let component = PathComponent::new(name)?;

            if mode == ResolveMode::ParentOnly && Self::only_separators_remain(bytes, pos) {
                // The iterator points at the parent of the last component.
                return Ok(Resolved {
                    inode: iter,
                    last_component: name.to_string(),
                });
            }

            iter = self.advance(ctx, iter, &component, user)?;

            if pos >= bytes.len() {
                return Ok(Resolved {
                    inode: iter,
                    last_component: String::new(),
                });
            }
        }
    }

    fn only_separators_remain(bytes: &[u8], mut pos: usize) -> bool {
        while pos < bytes.len() && bytes[pos] == b'/' {
            pos += 1;
        }
        pos >= bytes.len()
    }

    // Moves the iterator across one path component: up for "..", sideways
    // for ".", down for everything else.
    fn advance(
        &self,
        ctx: &SchedCtx,
        iter: InodeGuard,
        component: &PathComponent,
        user: User,
    ) -> Result<InodeGuard> {
        if !iter.node().is_directory() {
            return_errno_with_message!(Errno::ENOTDIR, "intermediate component is not a directory");
        }

        if component.is_parent() {
            return self.advance_up(ctx, iter, user).map(|(parent, _)| parent);
        }

        let child = iter.lookup(ctx, component, user)?;
        if component.is_self() {
            return Ok(child);
        }

        // Descend into a mounted filesystem if the child is a mountpoint.
        if let Some(mounted_fs) = self.manager.filesystem_mounted_at(child.node()) {
            return InodeGuard::acquire_root(&mounted_fs);
        }
        Ok(child)
    }

    // Walks to the parent of `iter`. Besides the parent, the returned inode
    // id identifies the entry whose name the parent knows the position
    // under, which differs from `iter` itself when a mount boundary was
    // crossed.
    fn advance_up(
        &self,
        ctx: &SchedCtx,
        iter: InodeGuard,
        user: User,
    ) -> Result<(InodeGuard, InodeId)> {
        // The resolver root is the ceiling.
        if self.is_resolver_root(&iter) {
            let ino = iter.node().ino();
            return Ok((iter, ino));
        }

        let child_ino = iter.node().ino();
        let parent = iter.lookup(ctx, &PathComponent::parent_dir(), user)?;
        if !parent.is_same_node(&iter) {
            return Ok((parent, child_ino));
        }

        // `iter` is the root of a filesystem mounted somewhere below the
        // global root: cross the mount and take the parent of the mounting
        // directory.
        let Some((mounting_dir, _mounting_fs)) =
            self.manager.mountpoint_of_filesystem(iter.fs().id())
        else {
            // The global root; `..` stays put.
            return Ok((parent, child_ino));
        };
        drop(parent);
        drop(iter);

        let effective_child = mounting_dir.node().ino();
        let parent = mounting_dir.lookup(ctx, &PathComponent::parent_dir(), user)?;
        Ok((parent, effective_child))
    }

    fn is_resolver_root(&self, iter: &InodeGuard) -> bool {
        iter.node().is_same(self.root.node())
    }

    /// Reconstructs the absolute path of the current working directory by
    /// walking up to the resolver root.
    pub fn cwd_path(&self, ctx: &SchedCtx, user: User) -> Result<String> {
        let mut components: Vec<String> = Vec::new();
        let mut iter = self.cwd.clone();

        while !self.is_resolver_root(&iter) {
            let (parent, child_ino) = self.advance_up(ctx, iter, user)?;

            let mut name = crate::fs::filesystem::NameBuffer::new();
            parent
                .fs()
                .get_name_of_node(ctx, parent.node(), child_ino, user, &mut name)?;
            components.push(name.as_str().to_string());

            iter = parent;
        }

        if components.is_empty() {
            return Ok("/".to_string());
        }
        let mut path = String::new();
        for component in components.iter().rev() {
            path.push('/');
            path.push_str(component);
        }
        Ok(path)
    }
}
