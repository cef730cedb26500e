// SPDX-License-Identifier: MPL-2.0

//! Filesystem core tests: KestrelFS, the mount table and path resolution
//! across mount boundaries.

use kestrel_block::{RamContainer, BLOCK_SIZE};
use kestrel_frame::clock::MonotonicClock;
use kestrel_frame::sched::{Scheduler, Vp, PRIORITY_NORMAL};

use crate::fs::kfs::KfsFilesystem;
use crate::fs::{
    Access, DirEntry, FilePermissions, Filesystem, FilesystemManager, InodeGuard, InodeType,
    NameBuffer, PathComponent, PathResolver, ResolveMode, User, PATH_MAX,
};
use crate::io::{open_directory, open_file, ChannelMode, SeekWhence};
use crate::prelude::*;

struct Fixture {
    sched: Arc<Scheduler>,
    vp: Arc<Vp>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            sched: Arc::new(Scheduler::new(Arc::new(MonotonicClock::new()))),
            vp: Vp::new(PRIORITY_NORMAL),
        }
    }

    fn ctx(&self) -> SchedCtx<'_> {
        SchedCtx::new(&self.sched, &self.vp)
    }
}

fn user() -> User {
    User::new(0, 0)
}

fn perms_rwx() -> FilePermissions {
    FilePermissions::make(
        Access::READ | Access::WRITE | Access::EXECUTE,
        Access::READ | Access::EXECUTE,
        Access::READ | Access::EXECUTE,
    )
}

fn fresh_volume(blocks: u64) -> Arc<dyn Filesystem> {
    let disk = RamContainer::new(blocks, BLOCK_SIZE);
    KfsFilesystem::format(&disk, 32).unwrap();
    KfsFilesystem::new(Arc::new(disk))
}

// Mounts FS "A" as root with /a, /a/b and /mnt, and FS "B" (carrying /x) at
// /mnt.
fn mounted_tree(f: &Fixture) -> (Arc<FilesystemManager>, PathResolver) {
    let ctx = f.ctx();
    let manager = Arc::new(FilesystemManager::new());

    let fs_a = fresh_volume(256);
    manager.mount(&ctx, fs_a.clone(), &[], None).unwrap();
    let root = InodeGuard::acquire_root(&fs_a).unwrap();

    let a = fs_a
        .create_node(
            &ctx,
            root.node(),
            &PathComponent::new("a").unwrap(),
            InodeType::Directory,
            user(),
            perms_rwx(),
        )
        .unwrap();
    fs_a.create_directory(
        &ctx,
        &a,
        &PathComponent::new("b").unwrap(),
        user(),
        perms_rwx(),
    )
    .unwrap();
    fs_a.relinquish_node(&a);
    fs_a.create_directory(
        &ctx,
        root.node(),
        &PathComponent::new("mnt").unwrap(),
        user(),
        perms_rwx(),
    )
    .unwrap();

    let fs_b = fresh_volume(128);
    let mnt = root
        .lookup(&ctx, &PathComponent::new("mnt").unwrap(), user())
        .unwrap();
    manager.mount(&ctx, fs_b.clone(), &[], Some(&mnt)).unwrap();

    let b_root = InodeGuard::acquire_root(&fs_b).unwrap();
    fs_b.create_node(
        &ctx,
        b_root.node(),
        &PathComponent::new("x").unwrap(),
        InodeType::RegularFile,
        user(),
        perms_rwx(),
    )
    .map(|node| fs_b.relinquish_node(&node))
    .unwrap();

    let resolver = PathResolver::new(manager.clone(), root);
    (manager, resolver)
}

mod kfs {
    use super::*;

    #[test]
    fn format_creates_a_root_with_dot_entries() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let fs = fresh_volume(64);
        fs.on_mount(&ctx, &[]).unwrap();

        let root = InodeGuard::acquire_root(&fs).unwrap();
        assert!(root.node().is_directory());

        let mut entries = [DirEntry {
            ino: 0,
            name: NameBuffer::new(),
        }; 4];
        let count = fs
            .read_directory(&ctx, root.node(), 0, &mut entries)
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(entries[0].name.as_str(), ".");
        assert_eq!(entries[1].name.as_str(), "..");
        assert_eq!(entries[0].ino, root.node().ino());
        assert_eq!(entries[1].ino, root.node().ino());
    }

    #[test]
    fn dot_dot_at_the_filesystem_root_is_the_root_itself() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let fs = fresh_volume(64);
        fs.on_mount(&ctx, &[]).unwrap();

        let root = InodeGuard::acquire_root(&fs).unwrap();
        let parent = root
            .lookup(&ctx, &PathComponent::parent_dir(), user())
            .unwrap();
        assert!(parent.is_same_node(&root));
    }

    #[test]
    fn created_files_survive_cache_eviction() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let fs = fresh_volume(128);
        fs.on_mount(&ctx, &[]).unwrap();

        {
            let root = InodeGuard::acquire_root(&fs).unwrap();
            let file = fs
                .create_node(
                    &ctx,
                    root.node(),
                    &PathComponent::new("notes.txt").unwrap(),
                    InodeType::RegularFile,
                    user(),
                    perms_rwx(),
                )
                .unwrap();
            fs.write(&ctx, &file, 0, b"written before eviction").unwrap();
            fs.relinquish_node(&file);
            // Dropping the root guard evicts everything from the cache.
        }

        let root = InodeGuard::acquire_root(&fs).unwrap();
        let file = root
            .lookup(&ctx, &PathComponent::new("notes.txt").unwrap(), user())
            .unwrap();
        let mut buf = [0u8; 64];
        let read = fs.read(&ctx, file.node(), 0, &mut buf).unwrap();
        assert_eq!(&buf[..read], b"written before eviction");
    }

    #[test]
    fn writes_spanning_blocks_read_back() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let fs = fresh_volume(128);
        fs.on_mount(&ctx, &[]).unwrap();

        let root = InodeGuard::acquire_root(&fs).unwrap();
        let file = fs
            .create_node(
                &ctx,
                root.node(),
                &PathComponent::new("big").unwrap(),
                InodeType::RegularFile,
                user(),
                perms_rwx(),
            )
            .unwrap();

        let payload: Vec<u8> = (0..3 * BLOCK_SIZE + 77).map(|i| (i % 251) as u8).collect();
        // Write at an offset that straddles a block boundary.
        let written = fs.write(&ctx, &file, 100, &payload).unwrap();
        assert_eq!(written, payload.len());
        assert_eq!(file.state().size, 100 + payload.len() as u64);

        let mut buf = vec![0u8; payload.len()];
        let read = fs.read(&ctx, &file, 100, &mut buf).unwrap();
        assert_eq!(read, payload.len());
        assert_eq!(buf, payload);

        // The leading hole reads as zeroes.
        let mut head = [0xffu8; 100];
        fs.read(&ctx, &file, 0, &mut head).unwrap();
        assert!(head.iter().all(|&b| b == 0));
        fs.relinquish_node(&file);
    }

    #[test]
    fn duplicate_names_are_refused() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let fs = fresh_volume(64);
        fs.on_mount(&ctx, &[]).unwrap();

        let root = InodeGuard::acquire_root(&fs).unwrap();
        let name = PathComponent::new("dup").unwrap();
        fs.create_directory(&ctx, root.node(), &name, user(), perms_rwx())
            .unwrap();
        let err = fs
            .create_directory(&ctx, root.node(), &name, user(), perms_rwx())
            .unwrap_err();
        assert_eq!(err.error(), Errno::EEXIST);
    }

    #[test]
    fn lookup_of_a_missing_name_is_enoent() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let fs = fresh_volume(64);
        fs.on_mount(&ctx, &[]).unwrap();

        let root = InodeGuard::acquire_root(&fs).unwrap();
        let err = root
            .lookup(&ctx, &PathComponent::new("ghost").unwrap(), user())
            .unwrap_err();
        assert_eq!(err.error(), Errno::ENOENT);
    }

    #[test]
    fn get_name_of_node_reports_the_directory_entry() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let fs = fresh_volume(64);
        fs.on_mount(&ctx, &[]).unwrap();

        let root = InodeGuard::acquire_root(&fs).unwrap();
        let child = fs
            .create_node(
                &ctx,
                root.node(),
                &PathComponent::new("named").unwrap(),
                InodeType::Directory,
                user(),
                perms_rwx(),
            )
            .unwrap();

        let mut name = NameBuffer::new();
        fs.get_name_of_node(&ctx, root.node(), child.ino(), user(), &mut name)
            .unwrap();
        assert_eq!(name.as_str(), "named");
        fs.relinquish_node(&child);
    }
}

mod mounting {
    use super::*;

    #[test]
    fn a_filesystem_mounts_only_once() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (manager, resolver) = mounted_tree(&f);

        let fs_b = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/mnt", user())
            .unwrap()
            .inode
            .fs()
            .clone();
        let somewhere = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/a", user())
            .unwrap();
        let err = manager
            .mount(&ctx, fs_b, &[], Some(&somewhere.inode))
            .unwrap_err();
        assert_eq!(err.error(), Errno::EINVAL);
    }

    #[test]
    fn the_root_filesystem_cannot_be_unmounted() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (manager, resolver) = mounted_tree(&f);

        let root_fs = manager.root_filesystem().unwrap();
        let root = resolver.root().clone();
        let err = manager.unmount(&ctx, &root_fs, &root).unwrap_err();
        assert_eq!(err.error(), Errno::EBUSY);
    }

    #[test]
    fn unmount_clears_the_mountpoint() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (manager, resolver) = mounted_tree(&f);

        let mnt = resolver
            .resolve(&ctx, ResolveMode::ParentOnly, "/mnt/x", user())
            .unwrap();
        // ParentOnly stops at the mounted root of B.
        let fs_b = mnt.inode.fs().clone();
        drop(mnt);

        // Re-resolve the mountpoint directory on A.
        let (mount_dir, _) = manager.mountpoint_of_filesystem(fs_b.id()).unwrap();
        assert!(mount_dir.node().is_mountpoint());

        manager.unmount(&ctx, &fs_b, &mount_dir).unwrap();
        assert!(!mount_dir.node().is_mountpoint());
        assert!(manager.filesystem_for_id(fs_b.id()).is_none());

        // /mnt is a plain directory again.
        let resolved = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/mnt", user())
            .unwrap();
        assert_eq!(resolved.inode.fs().id(), manager.root_filesystem().unwrap().id());
    }

    #[test]
    fn open_channels_block_the_safe_unmount_check() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (manager, resolver) = mounted_tree(&f);

        let x = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/mnt/x", user())
            .unwrap();
        let fsid = x.inode.fs().id();
        let channel = open_file(&ctx, &manager, x.inode, ChannelMode::READ, user()).unwrap();

        assert!(!manager.can_safely_unmount(fsid));
        channel.close(&ctx).unwrap();
        assert!(manager.can_safely_unmount(fsid));
    }
}

mod resolution {
    use super::*;

    #[test]
    fn absolute_lookup_stays_on_the_root_filesystem() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (manager, resolver) = mounted_tree(&f);

        let resolved = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/a/b", user())
            .unwrap();
        assert_eq!(
            resolved.inode.fs().id(),
            manager.root_filesystem().unwrap().id()
        );
        assert!(resolved.inode.node().is_directory());

        let mut name = NameBuffer::new();
        let a = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/a", user())
            .unwrap();
        a.inode
            .fs()
            .get_name_of_node(
                &ctx,
                a.inode.node(),
                resolved.inode.node().ino(),
                user(),
                &mut name,
            )
            .unwrap();
        assert_eq!(name.as_str(), "b");
    }

    #[test]
    fn dot_dot_from_an_unmounted_child_returns_to_the_root() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (_, resolver) = mounted_tree(&f);

        // cwd is the root; "mnt/.." comes straight back to it.
        let resolved = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "mnt/..", user())
            .unwrap();
        assert!(resolved.inode.node().is_same(resolver.root().node()));
    }

    #[test]
    fn descending_into_a_mountpoint_switches_filesystems() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (manager, resolver) = mounted_tree(&f);

        let resolved = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/mnt/x", user())
            .unwrap();
        assert_ne!(
            resolved.inode.fs().id(),
            manager.root_filesystem().unwrap().id()
        );
        assert_eq!(resolved.inode.node().type_(), InodeType::RegularFile);
    }

    #[test]
    fn dot_dot_re_crosses_the_mount_boundary() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (_, resolver) = mounted_tree(&f);

        let resolved = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/mnt/..", user())
            .unwrap();
        assert!(resolved.inode.node().is_same(resolver.root().node()));
    }

    #[test]
    fn over_long_paths_are_rejected() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (_, resolver) = mounted_tree(&f);

        let mut path = String::from("/a");
        while path.len() <= PATH_MAX {
            path.push_str("/b");
        }
        let err = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, &path, user())
            .unwrap_err();
        assert_eq!(err.error(), Errno::ENAMETOOLONG);
    }

    #[test]
    fn a_trailing_separator_resolves_like_a_dot() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (_, resolver) = mounted_tree(&f);

        let resolved = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "a/", user())
            .unwrap();
        assert!(resolved.inode.node().is_directory());

        let plain = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "a", user())
            .unwrap();
        assert!(resolved.inode.is_same_node(&plain.inode));

        // The trailing "." step requires a directory.
        let err = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/mnt/x/", user())
            .unwrap_err();
        assert_eq!(err.error(), Errno::ENOTDIR);
    }

    #[test]
    fn parent_only_mode_stops_before_the_last_component() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (_, resolver) = mounted_tree(&f);

        let resolved = resolver
            .resolve(&ctx, ResolveMode::ParentOnly, "/a/newfile", user())
            .unwrap();
        assert_eq!(resolved.last_component, "newfile");

        let a = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/a", user())
            .unwrap();
        assert!(resolved.inode.is_same_node(&a.inode));
    }

    #[test]
    fn intermediate_non_directories_fail_with_enotdir() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (_, resolver) = mounted_tree(&f);

        let err = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/mnt/x/deeper", user())
            .unwrap_err();
        assert_eq!(err.error(), Errno::ENOTDIR);
    }

    #[test]
    fn dot_dot_never_escapes_the_resolver_root() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (_, resolver) = mounted_tree(&f);

        let resolved = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/../../..", user())
            .unwrap();
        assert!(resolved.inode.node().is_same(resolver.root().node()));
    }

    #[test]
    fn cwd_path_reconstructs_the_absolute_path() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (_, mut resolver) = mounted_tree(&f);

        assert_eq!(resolver.cwd_path(&ctx, user()).unwrap(), "/");
        resolver.set_cwd(&ctx, "/a/b", user()).unwrap();
        assert_eq!(resolver.cwd_path(&ctx, user()).unwrap(), "/a/b");

        // Relative resolution now starts at the new cwd.
        let resolved = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "..", user())
            .unwrap();
        let a = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/a", user())
            .unwrap();
        assert!(resolved.inode.is_same_node(&a.inode));
    }
}

mod channels {
    use super::*;

    #[test]
    fn file_channels_enforce_their_mode() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (manager, resolver) = mounted_tree(&f);

        let x = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/mnt/x", user())
            .unwrap();
        let read_only =
            open_file(&ctx, &manager, x.inode.clone(), ChannelMode::READ, user()).unwrap();

        let err = read_only.write(&ctx, b"nope").unwrap_err();
        assert_eq!(err.error(), Errno::EBADF);

        let write_only = open_file(&ctx, &manager, x.inode, ChannelMode::WRITE, user()).unwrap();
        let mut buf = [0u8; 8];
        let err = write_only.read(&ctx, &mut buf).unwrap_err();
        assert_eq!(err.error(), Errno::EBADF);

        read_only.close(&ctx).unwrap();
        write_only.close(&ctx).unwrap();
    }

    #[test]
    fn sequential_reads_and_seeks_share_the_channel_offset() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (manager, resolver) = mounted_tree(&f);

        let x = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/mnt/x", user())
            .unwrap();
        let channel = open_file(
            &ctx,
            &manager,
            x.inode,
            ChannelMode::READ | ChannelMode::WRITE,
            user(),
        )
        .unwrap();

        channel.write(&ctx, b"hello, world").unwrap();
        channel.seek(&ctx, 0, SeekWhence::Set).unwrap();

        let mut buf = [0u8; 5];
        channel.read(&ctx, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        channel.seek(&ctx, 2, SeekWhence::Current).unwrap();
        channel.read(&ctx, &mut buf).unwrap();
        assert_eq!(&buf, b"world");

        // Append mode writes at the end regardless of the offset.
        let append = channel.dup(&ctx).unwrap();
        drop(channel);
        let appender = open_file(
            &ctx,
            &manager,
            resolver
                .resolve(&ctx, ResolveMode::TargetOnly, "/mnt/x", user())
                .unwrap()
                .inode,
            ChannelMode::APPEND,
            user(),
        )
        .unwrap();
        appender.write(&ctx, b"!").unwrap();
        appender.seek(&ctx, 0, SeekWhence::End).unwrap();
        assert_eq!(appender.offset(), 13);
        let _ = append;
    }

    #[test]
    fn directory_channels_list_entries_and_seek_absolutely() {
        let f = Fixture::new();
        let ctx = f.ctx();
        let (manager, resolver) = mounted_tree(&f);

        let a = resolver
            .resolve(&ctx, ResolveMode::TargetOnly, "/a", user())
            .unwrap();
        let channel = open_directory(&ctx, &manager, a.inode, user()).unwrap();

        let dir = channel
            .resource()
            .clone();
        let dir = (dir.as_ref() as &dyn Any)
            .downcast_ref::<crate::io::DirectoryResource>()
            .unwrap();

        let mut entries = [DirEntry {
            ino: 0,
            name: NameBuffer::new(),
        }; 8];
        let count = dir.read_entries(&ctx, &channel, &mut entries).unwrap();
        assert_eq!(count, 3);
        assert_eq!(entries[0].name.as_str(), ".");
        assert_eq!(entries[1].name.as_str(), "..");
        assert_eq!(entries[2].name.as_str(), "b");

        // Rewind and read again.
        channel.seek(&ctx, 0, SeekWhence::Set).unwrap();
        let count = dir.read_entries(&ctx, &channel, &mut entries[..2]).unwrap();
        assert_eq!(count, 2);

        // Only absolute seeks are meaningful on directories.
        let err = channel.seek(&ctx, 1, SeekWhence::Current).unwrap_err();
        assert_eq!(err.error(), Errno::EINVAL);
        channel.close(&ctx).unwrap();
    }

    #[test]
    fn plain_resources_report_espipe_on_seek() {
        use crate::io::{IoChannel, IoResource};
        struct Pipeish;
        impl IoResource for Pipeish {}

        let f = Fixture::new();
        let ctx = f.ctx();
        let channel = IoChannel::new(
            Arc::new(Pipeish),
            ChannelMode::READ,
            crate::io::ChannelKind::Pipe,
        );
        let err = channel.seek(&ctx, 0, SeekWhence::Set).unwrap_err();
        assert_eq!(err.error(), Errno::ESPIPE);
    }
}
