// SPDX-License-Identifier: MPL-2.0

use zerocopy::IntoBytes;

use crate::fs::{
    Access, DirEntry, Filesystem, FilesystemManager, InodeGuard, InodeType, NameBuffer, User,
};
use crate::io::channel::{ChannelKind, ChannelMode, IoChannel, IoResource, SeekWhence};
use crate::prelude::*;

/// A regular file opened through a filesystem.
pub struct FileResource {
    node: InodeGuard,
    manager: Arc<FilesystemManager>,
}

impl FileResource {
    fn size(&self) -> u64 {
        self.node.node().state().size
    }
}

impl IoResource for FileResource {
    fn dup(&self, _ctx: &SchedCtx, channel: &Arc<IoChannel>) -> Result<Arc<IoChannel>> {
        self.manager.channel_opened(self.node.fs().id());
        let copy = IoChannel::new(channel.resource().clone(), channel.mode(), channel.kind());
        copy.set_offset(channel.offset());
        Ok(copy)
    }

    fn read(&self, ctx: &SchedCtx, channel: &IoChannel, buf: &mut [u8]) -> Result<usize> {
        let offset = channel.offset();
        let read = self
            .node
            .fs()
            .read(ctx, self.node.node(), offset, buf)?;
        channel.advance_offset(read as u64);
        Ok(read)
    }

    fn write(&self, ctx: &SchedCtx, channel: &IoChannel, buf: &[u8]) -> Result<usize> {
        // Append mode always writes at the current end of the file.
        let offset = if channel.mode().contains(ChannelMode::APPEND) {
            self.size()
        } else {
            channel.offset()
        };
        let written = self.node.fs().write(ctx, self.node.node(), offset, buf)?;
        channel.set_offset(offset + written as u64);
        Ok(written)
    }

    fn seek(
        &self,
        _ctx: &SchedCtx,
        channel: &IoChannel,
        offset: i64,
        whence: SeekWhence,
    ) -> Result<u64> {
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Current => channel.offset() as i64,
            SeekWhence::End => self.size() as i64,
        };
        let target = base.checked_add(offset).filter(|&pos| pos >= 0).ok_or(
            Error::with_message(Errno::EINVAL, "seek position out of range"),
        )?;
        let old = channel.offset();
        channel.set_offset(target as u64);
        Ok(old)
    }

    fn close(&self, _ctx: &SchedCtx, _channel: &IoChannel) -> Result<()> {
        self.manager.channel_closed(self.node.fs().id());
        Ok(())
    }
}

/// Opens a regular file as an I/O channel, checking the node type and the
/// caller's permissions against the requested mode.
pub fn open_file(
    ctx: &SchedCtx,
    manager: &Arc<FilesystemManager>,
    node: InodeGuard,
    mode: ChannelMode,
    user: User,
) -> Result<Arc<IoChannel>> {
    match node.node().type_() {
        InodeType::RegularFile | InodeType::Device => {}
        InodeType::Directory => {
            return_errno_with_message!(Errno::EISDIR, "use open_directory for directories")
        }
        _ => return_errno_with_message!(Errno::EINVAL, "not an openable file"),
    }

    let mut access = Access::empty();
    if mode.contains(ChannelMode::READ) {
        access |= Access::READ;
    }
    if mode.intersects(ChannelMode::WRITE | ChannelMode::APPEND) {
        access |= Access::WRITE;
    }
    node.fs().check_access(ctx, node.node(), user, access)?;

    manager.channel_opened(node.fs().id());
    let resource = Arc::new(FileResource {
        node,
        manager: manager.clone(),
    });
    Ok(IoChannel::new(resource, mode, ChannelKind::File))
}

/// A directory opened for reading its entries.
///
/// The channel offset is the index of the next entry, not a byte offset;
/// consequently only absolute seeks to positions previously obtained (or 0
/// for rewind) are meaningful, and only those are allowed.
pub struct DirectoryResource {
    node: InodeGuard,
    manager: Arc<FilesystemManager>,
}

impl DirectoryResource {
    /// Reads the next batch of entries, advancing the channel position.
    pub fn read_entries(
        &self,
        ctx: &SchedCtx,
        channel: &IoChannel,
        out: &mut [DirEntry],
    ) -> Result<usize> {
        let index = channel.offset() as usize;
        let produced = self
            .node
            .fs()
            .read_directory(ctx, self.node.node(), index, out)?;
        channel.advance_offset(produced as u64);
        Ok(produced)
    }
}

impl IoResource for DirectoryResource {
    fn dup(&self, _ctx: &SchedCtx, channel: &Arc<IoChannel>) -> Result<Arc<IoChannel>> {
        self.manager.channel_opened(self.node.fs().id());
        let copy = IoChannel::new(channel.resource().clone(), channel.mode(), channel.kind());
        copy.set_offset(channel.offset());
        Ok(copy)
    }

    fn read(&self, ctx: &SchedCtx, channel: &IoChannel, buf: &mut [u8]) -> Result<usize> {
        // Serialize whole directory entries; a partial entry is never
        // produced.
        let capacity = buf.len() / core::mem::size_of::<RawDirEntry>();
        if capacity == 0 {
            return_errno_with_message!(Errno::EINVAL, "buffer holds no directory entry");
        }

        let mut entries = vec![
            DirEntry {
                ino: 0,
                name: NameBuffer::new()
            };
            capacity
        ];
        let produced = self.read_entries(ctx, channel, &mut entries)?;

        let mut written = 0;
        for entry in &entries[..produced] {
            let mut raw = RawDirEntry {
                ino: entry.ino,
                name: [0; 28],
            };
            let bytes = entry.name.as_str().as_bytes();
            raw.name[..bytes.len()].copy_from_slice(bytes);
            buf[written..written + core::mem::size_of::<RawDirEntry>()]
                .copy_from_slice(raw.as_bytes());
            written += core::mem::size_of::<RawDirEntry>();
        }
        Ok(written)
    }

    fn seek(
        &self,
        _ctx: &SchedCtx,
        channel: &IoChannel,
        offset: i64,
        whence: SeekWhence,
    ) -> Result<u64> {
        if whence != SeekWhence::Set || offset < 0 {
            return_errno_with_message!(Errno::EINVAL, "directories allow absolute seeks only");
        }
        let old = channel.offset();
        channel.set_offset(offset as u64);
        Ok(old)
    }

    fn close(&self, ctx: &SchedCtx, _channel: &IoChannel) -> Result<()> {
        let result = self
            .node
            .fs()
            .close_directory(ctx, self.node.node());
        self.manager.channel_closed(self.node.fs().id());
        result
    }
}

/// The user-visible serialization of a directory entry.
#[derive(IntoBytes, zerocopy::Immutable, Clone, Copy)]
#[repr(C)]
struct RawDirEntry {
    ino: u32,
    name: [u8; 28],
}

/// Opens a directory as an entry-reading I/O channel.
pub fn open_directory(
    ctx: &SchedCtx,
    manager: &Arc<FilesystemManager>,
    node: InodeGuard,
    user: User,
) -> Result<Arc<IoChannel>> {
    node.fs().open_directory(ctx, node.node(), user)?;

    manager.channel_opened(node.fs().id());
    let resource = Arc::new(DirectoryResource {
        node,
        manager: manager.clone(),
    });
    Ok(IoChannel::new(
        resource,
        ChannelMode::READ,
        ChannelKind::Directory,
    ))
}
