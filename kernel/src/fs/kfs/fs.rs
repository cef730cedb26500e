// SPDX-License-Identifier: MPL-2.0

use hashbrown::HashMap;
use kestrel_block::{BlockContainer, MapMode, WriteBack, BLOCK_SIZE};
use kestrel_frame::sync::SpinLock;
use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::fs::filesystem::{
    alloc_filesystem_id, DirEntry, Filesystem, NameBuffer, PathComponent,
};
use crate::fs::inode::{
    Access, FilePermissions, FilesystemId, Inode, InodeId, InodeState, InodeType, User,
};
use crate::fs::kfs::disk::{
    format as format_volume, DirEntryRaw, DiskInode, DiskSuperBlock, Geometry, BITS_PER_BITMAP_BLOCK,
    DIRECT_POINTER_COUNT, DIR_ENTRIES_PER_BLOCK, DIR_ENTRY_SIZE, FILE_TYPE_DEVICE,
    FILE_TYPE_DIRECTORY, FILE_TYPE_FREE, FILE_TYPE_NAMED_PIPE, FILE_TYPE_REGULAR,
    FILE_TYPE_SYMBOLIC_LINK,
};
use crate::fs::manager::FilesystemManager;
use crate::prelude::*;

// The filesystem-private inode payload: the direct block pointers.
struct KfsNode {
    direct: [u32; DIRECT_POINTER_COUNT],
}

struct KfsState {
    geometry: Option<Geometry>,
    icache: HashMap<InodeId, Arc<Inode>>,
}

/// A mounted (or mountable) KestrelFS volume.
pub struct KfsFilesystem {
    id: FilesystemId,
    container: Arc<dyn BlockContainer>,
    state: SpinLock<KfsState>,
}

impl KfsFilesystem {
    pub fn new(container: Arc<dyn BlockContainer>) -> Arc<Self> {
        Arc::new(Self {
            id: alloc_filesystem_id(),
            container,
            state: SpinLock::new(KfsState {
                geometry: None,
                icache: HashMap::new(),
            }),
        })
    }

    /// Formats the container with an empty volume. See
    /// [`crate::fs::kfs::format`].
    pub fn format(container: &dyn BlockContainer, inode_count: u32) -> Result<()> {
        format_volume(container, inode_count)
    }

    fn geometry(&self) -> Result<Geometry> {
        self.state
            .lock()
            .geometry
            .ok_or(Error::with_message(Errno::EIO, "filesystem is not mounted"))
    }

    fn with_block<R>(&self, lba: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let block = self.container.map_block(lba, MapMode::ReadOnly)?;
        let result = f(&block);
        self.container.unmap_block(block, WriteBack::None)?;
        Ok(result)
    }

    fn modify_block<R>(&self, lba: u64, mode: MapMode, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut block = self.container.map_block(lba, mode)?;
        let result = f(block.as_mut_slice());
        self.container.unmap_block(block, WriteBack::Sync)?;
        Ok(result)
    }

    fn read_disk_inode(&self, geometry: &Geometry, ino: InodeId) -> Result<DiskInode> {
        if ino == 0 || ino > geometry.inode_count {
            return_errno_with_message!(Errno::ENOENT, "inode id out of range");
        }
        self.with_block(geometry.inode_block(ino), |buf| {
            DiskInode::read_from_bytes(&buf[..BLOCK_SIZE]).unwrap()
        })
    }

    fn write_disk_inode(&self, geometry: &Geometry, ino: InodeId, dnode: &DiskInode) -> Result<()> {
        self.modify_block(geometry.inode_block(ino), MapMode::Replace, |buf| {
            buf.copy_from_slice(dnode.as_bytes());
        })
    }

    fn type_from_raw(raw: u8) -> Result<InodeType> {
        Ok(match raw {
            FILE_TYPE_REGULAR => InodeType::RegularFile,
            FILE_TYPE_DIRECTORY => InodeType::Directory,
            FILE_TYPE_DEVICE => InodeType::Device,
            FILE_TYPE_NAMED_PIPE => InodeType::NamedPipe,
            FILE_TYPE_SYMBOLIC_LINK => InodeType::SymbolicLink,
            _ => return_errno_with_message!(Errno::EIO, "corrupt inode record"),
        })
    }

    fn type_to_raw(type_: InodeType) -> Result<u8> {
        Ok(match type_ {
            InodeType::RegularFile => FILE_TYPE_REGULAR,
            InodeType::Directory => FILE_TYPE_DIRECTORY,
            InodeType::Device => FILE_TYPE_DEVICE,
            InodeType::NamedPipe => FILE_TYPE_NAMED_PIPE,
            InodeType::SymbolicLink => FILE_TYPE_SYMBOLIC_LINK,
            _ => return_errno_with_message!(Errno::EINVAL, "type not storable on disk"),
        })
    }

    fn make_node(&self, ino: InodeId, dnode: &DiskInode) -> Result<Arc<Inode>> {
        let mut direct = [0u32; DIRECT_POINTER_COUNT];
        for (slot, raw) in direct.iter_mut().zip(dnode.direct.iter()) {
            *slot = raw.get();
        }
        let state = InodeState {
            uid: dnode.uid.get(),
            gid: dnode.gid.get(),
            permissions: FilePermissions::from_bits_truncate(dnode.permissions.get()),
            link_count: dnode.link_count.get() as u32,
            size: dnode.size.get(),
            access_time: dnode.access_time.get() as u64,
            modification_time: dnode.modification_time.get() as u64,
            status_change_time: dnode.status_change_time.get() as u64,
            refcon: Some(Box::new(KfsNode { direct })),
        };
        Ok(Inode::new(
            self.id,
            ino,
            Self::type_from_raw(dnode.file_type)?,
            state,
        ))
    }

    // Writes the runtime state of `node` back into its inode record.
    fn flush_node(&self, node: &Inode) -> Result<()> {
        let geometry = self.geometry()?;
        let mut dnode = DiskInode::new_zeroed();
        {
            let state = node.state();
            dnode.file_type = Self::type_to_raw(node.type_())?;
            dnode.permissions = U16::new(state.permissions.bits());
            dnode.link_count = U16::new(state.link_count as u16);
            dnode.uid = U32::new(state.uid);
            dnode.gid = U32::new(state.gid);
            dnode.size = U64::new(state.size);
            dnode.access_time = U32::new(state.access_time as u32);
            dnode.modification_time = U32::new(state.modification_time as u32);
            dnode.status_change_time = U32::new(state.status_change_time as u32);
            let kfs_node = Self::payload(&state);
            for (raw, block) in dnode.direct.iter_mut().zip(kfs_node.direct.iter()) {
                *raw = U32::new(*block);
            }
        }
        self.write_disk_inode(&geometry, node.ino(), &dnode)
    }

    fn payload<'a>(state: &'a crate::fs::inode::InodeState) -> &'a KfsNode {
        state
            .refcon
            .as_ref()
            .and_then(|any| any.downcast_ref::<KfsNode>())
            .expect("kfs inode without kfs payload")
    }

    fn payload_mut<'a>(state: &'a mut crate::fs::inode::InodeState) -> &'a mut KfsNode {
        state
            .refcon
            .as_mut()
            .and_then(|any| any.downcast_mut::<KfsNode>())
            .expect("kfs inode without kfs payload")
    }

    fn acquire_inode(&self, ino: InodeId) -> Result<Arc<Inode>> {
        if let Some(node) = self.state.lock().icache.get(&ino) {
            node.retain();
            return Ok(node.clone());
        }

        let geometry = self.geometry()?;
        let dnode = self.read_disk_inode(&geometry, ino)?;
        if dnode.file_type == FILE_TYPE_FREE {
            return_errno_with_message!(Errno::ENOENT, "no such inode");
        }
        let node = self.make_node(ino, &dnode)?;

        let mut state = self.state.lock();
        let entry = state.icache.entry(ino).or_insert(node);
        entry.retain();
        Ok(entry.clone())
    }

    // Allocates a free device block and marks it used in the bitmap.
    fn alloc_block(&self, geometry: &Geometry) -> Result<u32> {
        for bitmap_idx in 0..geometry.bitmap_blocks {
            let lba = (geometry.bitmap_start + bitmap_idx) as u64;
            let first_bit = bitmap_idx * BITS_PER_BITMAP_BLOCK;
            let found = self.modify_block(lba, MapMode::Update, |buf| {
                for bit in 0..BITS_PER_BITMAP_BLOCK {
                    let device_block = first_bit + bit;
                    if device_block >= geometry.block_count {
                        return None;
                    }
                    let byte = (bit / 8) as usize;
                    let mask = 1u8 << (bit % 8);
                    if buf[byte] & mask == 0 {
                        buf[byte] |= mask;
                        return Some(device_block);
                    }
                }
                None
            })?;
            if let Some(block) = found {
                return Ok(block);
            }
        }
        return_errno_with_message!(Errno::ENOSPC, "no free blocks")
    }

    // Finds a free inode record.
    fn alloc_inode_slot(&self, geometry: &Geometry) -> Result<InodeId> {
        for ino in 1..=geometry.inode_count {
            let free = self.with_block(geometry.inode_block(ino), |buf| buf[0] == FILE_TYPE_FREE)?;
            if free {
                return Ok(ino);
            }
        }
        return_errno_with_message!(Errno::ENOSPC, "no free inodes")
    }

    // Reads the directory entry at `index`, given the directory's block
    // pointers.
    fn read_entry(&self, blocks: &[u32], index: usize) -> Result<DirEntryRaw> {
        let block = blocks
            .get(index / DIR_ENTRIES_PER_BLOCK)
            .copied()
            .filter(|&b| b != 0)
            .ok_or(Error::with_message(Errno::EIO, "directory hole"))?;
        let offset = (index % DIR_ENTRIES_PER_BLOCK) * DIR_ENTRY_SIZE;
        self.with_block(block as u64, |buf| {
            DirEntryRaw::read_from_bytes(&buf[offset..offset + DIR_ENTRY_SIZE]).unwrap()
        })
    }

    // Looks `name` up in the directory, returning the entry's inode id.
    fn lookup_entry(&self, dir: &Arc<Inode>, name: &[u8]) -> Result<Option<InodeId>> {
        let (entry_count, blocks) = {
            let state = dir.state();
            let count = (state.size / DIR_ENTRY_SIZE as u64) as usize;
            (count, Self::payload(&state).direct)
        };
        for index in 0..entry_count {
            let entry = self.read_entry(&blocks, index)?;
            if entry.ino.get() != 0 && entry.name_matches(name) {
                return Ok(Some(entry.ino.get()));
            }
        }
        Ok(None)
    }

    // Appends a directory entry, growing the directory by one block if the
    // last one is full.
    fn append_entry(&self, geometry: &Geometry, dir: &Arc<Inode>, entry: DirEntryRaw) -> Result<()> {
        let (index, block) = {
            let state = dir.state();
            let index = (state.size / DIR_ENTRY_SIZE as u64) as usize;
            let block_idx = index / DIR_ENTRIES_PER_BLOCK;
            if block_idx >= DIRECT_POINTER_COUNT {
                return_errno_with_message!(Errno::EFBIG, "directory is full");
            }
            (index, Self::payload(&state).direct[block_idx])
        };

        let block = if block != 0 {
            block
        } else {
            let new_block = self.alloc_block(geometry)?;
            // Start from a clean block so stale bytes never read as
            // entries.
            let guard = self.container.map_block(new_block as u64, MapMode::Cleared)?;
            self.container.unmap_block(guard, WriteBack::Sync)?;
            let mut state = dir.state();
            Self::payload_mut(&mut state).direct[index / DIR_ENTRIES_PER_BLOCK] = new_block;
            new_block
        };

        let offset = (index % DIR_ENTRIES_PER_BLOCK) * DIR_ENTRY_SIZE;
        self.modify_block(block as u64, MapMode::Update, |buf| {
            buf[offset..offset + DIR_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
        })?;

        dir.state().size += DIR_ENTRY_SIZE as u64;
        dir.mark_updated();
        Ok(())
    }
}

impl Filesystem for KfsFilesystem {
    fn id(&self) -> FilesystemId {
        self.id
    }

    fn on_mount(&self, _ctx: &SchedCtx, _params: &[u8]) -> Result<()> {
        let info = self.container.info();
        if info.block_size != BLOCK_SIZE {
            return_errno_with_message!(Errno::EINVAL, "container block size must be 512");
        }

        let geometry = self.with_block(0, |buf| {
            DiskSuperBlock::read_from_prefix(buf)
                .map_err(|_| Error::with_message(Errno::EIO, "short superblock"))
                .and_then(|(sb, _)| Geometry::from_super_block(&sb, info.block_count))
        })??;

        self.state.lock().geometry = Some(geometry);
        log::info!("kfs: mounted volume with {} blocks", geometry.block_count);
        Ok(())
    }

    fn on_unmount(&self, ctx: &SchedCtx, manager: &FilesystemManager) -> Result<()> {
        if !manager.can_safely_unmount(self.id) {
            return_errno_with_message!(Errno::EBUSY, "open channels remain");
        }
        self.sync(ctx)
    }

    fn acquire_root_node(&self) -> Result<Arc<Inode>> {
        let geometry = self.geometry()?;
        self.acquire_inode(geometry.root_ino)
    }

    fn acquire_node_for_name(
        &self,
        ctx: &SchedCtx,
        dir: &Arc<Inode>,
        name: &PathComponent,
        user: User,
    ) -> Result<Arc<Inode>> {
        if !dir.is_directory() {
            return_errno_with_message!(Errno::ENOTDIR, "not a directory");
        }
        self.check_access(ctx, dir, user, Access::EXECUTE)?;

        let Some(ino) = self.lookup_entry(dir, name.name().as_bytes())? else {
            return_errno_with_message!(Errno::ENOENT, "no such directory entry");
        };
        self.acquire_inode(ino)
    }

    fn get_name_of_node(
        &self,
        _ctx: &SchedCtx,
        dir: &Arc<Inode>,
        child_ino: InodeId,
        _user: User,
        out: &mut NameBuffer,
    ) -> Result<()> {
        let (entry_count, blocks) = {
            let state = dir.state();
            let count = (state.size / DIR_ENTRY_SIZE as u64) as usize;
            (count, Self::payload(&state).direct)
        };
        // Entries 0 and 1 are "." and "..", which are not names of
        // children.
        for index in 2..entry_count {
            let entry = self.read_entry(&blocks, index)?;
            if entry.ino.get() == child_ino {
                return out.set(entry.name_bytes());
            }
        }
        return_errno_with_message!(Errno::ENOENT, "node is not a child of this directory")
    }

    fn reacquire_node(&self, node: &Arc<Inode>) -> Arc<Inode> {
        node.retain();
        node.clone()
    }

    fn relinquish_node(&self, node: &Arc<Inode>) {
        if node.release() > 0 {
            return;
        }

        // Last acquisition gone: evict from the cache and write back any
        // pending metadata changes.
        let evicted = {
            let mut state = self.state.lock();
            if node.use_count() == 0 {
                state.icache.remove(&node.ino()).is_some()
            } else {
                false
            }
        };
        if evicted && node.is_modified() {
            if let Err(err) = self.flush_node(node) {
                log::error!(
                    "kfs: writeback of inode {} failed: {:?}",
                    node.ino(),
                    err.error()
                );
            }
            node.clear_modified();
        }
    }

    fn create_node(
        &self,
        ctx: &SchedCtx,
        dir: &Arc<Inode>,
        name: &PathComponent,
        type_: InodeType,
        user: User,
        permissions: FilePermissions,
    ) -> Result<Arc<Inode>> {
        if !dir.is_directory() {
            return_errno_with_message!(Errno::ENOTDIR, "not a directory");
        }
        if name.is_self() || name.is_parent() {
            return_errno_with_message!(Errno::EINVAL, "reserved name");
        }
        self.check_access(ctx, dir, user, Access::WRITE | Access::EXECUTE)?;

        let geometry = self.geometry()?;
        let _dir_lock = dir.lock(ctx)?;

        if self.lookup_entry(dir, name.name().as_bytes())?.is_some() {
            return_errno_with_message!(Errno::EEXIST, "name is already taken");
        }

        let ino = self.alloc_inode_slot(&geometry)?;
        let now = ctx.sched().clock().now();

        let mut dnode = DiskInode::new_zeroed();
        dnode.file_type = Self::type_to_raw(type_)?;
        dnode.permissions = U16::new(permissions.bits());
        dnode.uid = U32::new(user.uid);
        dnode.gid = U32::new(user.gid);
        dnode.access_time = U32::new(now as u32);
        dnode.modification_time = U32::new(now as u32);
        dnode.status_change_time = U32::new(now as u32);

        if type_ == InodeType::Directory {
            // A new directory carries "." and ".." from the start.
            let dir_block = self.alloc_block(&geometry)?;
            self.modify_block(dir_block as u64, MapMode::Cleared, |buf| {
                buf[..DIR_ENTRY_SIZE].copy_from_slice(DirEntryRaw::new(ino, b".").as_bytes());
                buf[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]
                    .copy_from_slice(DirEntryRaw::new(dir.ino(), b"..").as_bytes());
            })?;
            dnode.link_count = U16::new(2);
            dnode.size = U64::new(2 * DIR_ENTRY_SIZE as u64);
            dnode.direct[0] = U32::new(dir_block);
        } else {
            dnode.link_count = U16::new(1);
        }

        self.write_disk_inode(&geometry, ino, &dnode)?;
        self.append_entry(&geometry, dir, DirEntryRaw::new(ino, name.name().as_bytes()))?;

        if type_ == InodeType::Directory {
            // The child's ".." entry links the parent.
            dir.state().link_count += 1;
        }
        self.flush_node(dir)?;

        log::debug!("kfs: created {:?} '{}' as inode {}", type_, name.name(), ino);
        self.acquire_inode(ino)
    }

    fn read_directory(
        &self,
        _ctx: &SchedCtx,
        dir: &Arc<Inode>,
        start_index: usize,
        out: &mut [DirEntry],
    ) -> Result<usize> {
        if !dir.is_directory() {
            return_errno_with_message!(Errno::ENOTDIR, "not a directory");
        }
        let (entry_count, blocks) = {
            let state = dir.state();
            let count = (state.size / DIR_ENTRY_SIZE as u64) as usize;
            (count, Self::payload(&state).direct)
        };

        let mut produced = 0;
        let mut index = start_index;
        while index < entry_count && produced < out.len() {
            let entry = self.read_entry(&blocks, index)?;
            index += 1;
            if entry.ino.get() == 0 {
                continue;
            }
            let mut name = NameBuffer::new();
            name.set(entry.name_bytes())?;
            out[produced] = DirEntry {
                ino: entry.ino.get(),
                name,
            };
            produced += 1;
        }
        dir.mark_accessed();
        Ok(produced)
    }

    fn read(&self, ctx: &SchedCtx, node: &Arc<Inode>, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if node.is_directory() {
            return_errno_with_message!(Errno::EISDIR, "is a directory");
        }
        let _lock = node.lock(ctx)?;

        let (size, blocks) = {
            let state = node.state();
            (state.size, Self::payload(&state).direct)
        };
        if offset >= size {
            return Ok(0);
        }
        let to_read = buf.len().min((size - offset) as usize);

        let mut done = 0;
        while done < to_read {
            let pos = offset as usize + done;
            let block_idx = pos / BLOCK_SIZE;
            let block_off = pos % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - block_off).min(to_read - done);

            let block = blocks[block_idx];
            if block == 0 {
                // Unwritten hole.
                buf[done..done + chunk].fill(0);
            } else {
                self.with_block(block as u64, |data| {
                    buf[done..done + chunk].copy_from_slice(&data[block_off..block_off + chunk]);
                })?;
            }
            done += chunk;
        }

        node.mark_accessed();
        Ok(done)
    }

    fn write(&self, ctx: &SchedCtx, node: &Arc<Inode>, offset: u64, buf: &[u8]) -> Result<usize> {
        if node.is_directory() {
            return_errno_with_message!(Errno::EISDIR, "is a directory");
        }
        let geometry = self.geometry()?;
        let _lock = node.lock(ctx)?;

        let limit = (DIRECT_POINTER_COUNT * BLOCK_SIZE) as u64;
        if offset >= limit {
            return_errno_with_message!(Errno::EFBIG, "beyond the maximum file size");
        }
        let to_write = buf.len().min((limit - offset) as usize);

        let mut done = 0;
        while done < to_write {
            let pos = offset as usize + done;
            let block_idx = pos / BLOCK_SIZE;
            let block_off = pos % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - block_off).min(to_write - done);

            let block = {
                let state = node.state();
                Self::payload(&state).direct[block_idx]
            };
            let block = if block != 0 {
                block
            } else {
                let new_block = self.alloc_block(&geometry)?;
                let mut state = node.state();
                Self::payload_mut(&mut state).direct[block_idx] = new_block;
                new_block
            };

            let mode = if chunk == BLOCK_SIZE {
                MapMode::Replace
            } else {
                MapMode::Update
            };
            self.modify_block(block as u64, mode, |data| {
                data[block_off..block_off + chunk].copy_from_slice(&buf[done..done + chunk]);
            })?;
            done += chunk;
        }

        {
            let mut state = node.state();
            state.size = state.size.max(offset + done as u64);
            state.modification_time = ctx.sched().clock().now();
        }
        node.mark_updated();
        self.flush_node(node)?;
        Ok(done)
    }

    fn sync(&self, _ctx: &SchedCtx) -> Result<()> {
        let nodes: Vec<Arc<Inode>> = self.state.lock().icache.values().cloned().collect();
        for node in nodes {
            if node.is_modified() {
                self.flush_node(&node)?;
                node.clear_modified();
            }
        }
        Ok(())
    }
}
