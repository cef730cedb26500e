// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicBool, Ordering};

use kestrel_frame::sync::SpinLock;

use crate::prelude::*;

bitflags::bitflags! {
    /// What a channel may be used for.
    pub struct ChannelMode: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const APPEND = 1 << 2;
    }
}

/// The kind of resource behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    File,
    Directory,
    Device,
    Pipe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Current,
    End,
}

/// The operations of the object a channel refers to.
///
/// Every operation receives the channel so that per-channel state (the
/// offset, the mode) is available to the resource. The defaults make a
/// resource that supports nothing: reads and writes are refused, and
/// seeking reports `ESPIPE` the way any non-seekable resource does.
pub trait IoResource: Send + Sync + Any {
    fn dup(&self, _ctx: &SchedCtx, _channel: &Arc<IoChannel>) -> Result<Arc<IoChannel>> {
        Err(Error::with_message(Errno::ENOTSUP, "cannot duplicate"))
    }

    fn read(&self, _ctx: &SchedCtx, _channel: &IoChannel, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::with_message(Errno::ENOTSUP, "not readable"))
    }

    fn write(&self, _ctx: &SchedCtx, _channel: &IoChannel, _buf: &[u8]) -> Result<usize> {
        Err(Error::with_message(Errno::ENOTSUP, "not writable"))
    }

    fn seek(
        &self,
        _ctx: &SchedCtx,
        _channel: &IoChannel,
        _offset: i64,
        _whence: SeekWhence,
    ) -> Result<u64> {
        Err(Error::with_message(Errno::ESPIPE, "not seekable"))
    }

    fn ioctl(&self, _ctx: &SchedCtx, _channel: &IoChannel, _cmd: u32, _arg: usize) -> Result<usize> {
        Err(Error::with_message(Errno::ENOTTY, "no such control operation"))
    }

    fn close(&self, _ctx: &SchedCtx, _channel: &IoChannel) -> Result<()> {
        Ok(())
    }
}

/// A reference-counted I/O channel: a resource, an access mode and the
/// per-open state.
pub struct IoChannel {
    resource: Arc<dyn IoResource>,
    mode: ChannelMode,
    kind: ChannelKind,
    offset: SpinLock<u64>,
    closed: AtomicBool,
}

impl IoChannel {
    pub fn new(resource: Arc<dyn IoResource>, mode: ChannelMode, kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self {
            resource,
            mode,
            kind,
            offset: SpinLock::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn resource(&self) -> &Arc<dyn IoResource> {
        &self.resource
    }

    /// The current channel position: a byte offset for files, an entry
    /// index for directories.
    pub fn offset(&self) -> u64 {
        *self.offset.lock()
    }

    pub fn set_offset(&self, offset: u64) {
        *self.offset.lock() = offset;
    }

    pub(crate) fn advance_offset(&self, delta: u64) {
        *self.offset.lock() += delta;
    }

    pub fn dup(self: &Arc<Self>, ctx: &SchedCtx) -> Result<Arc<IoChannel>> {
        self.resource.dup(ctx, self)
    }

    pub fn read(self: &Arc<Self>, ctx: &SchedCtx, buf: &mut [u8]) -> Result<usize> {
        if !self.mode.contains(ChannelMode::READ) {
            return_errno_with_message!(Errno::EBADF, "channel is not open for reading");
        }
        self.resource.read(ctx, self, buf)
    }

    pub fn write(self: &Arc<Self>, ctx: &SchedCtx, buf: &[u8]) -> Result<usize> {
        if !self.mode.intersects(ChannelMode::WRITE | ChannelMode::APPEND) {
            return_errno_with_message!(Errno::EBADF, "channel is not open for writing");
        }
        self.resource.write(ctx, self, buf)
    }

    pub fn seek(self: &Arc<Self>, ctx: &SchedCtx, offset: i64, whence: SeekWhence) -> Result<u64> {
        self.resource.seek(ctx, self, offset, whence)
    }

    pub fn ioctl(self: &Arc<Self>, ctx: &SchedCtx, cmd: u32, arg: usize) -> Result<usize> {
        self.resource.ioctl(ctx, self, cmd, arg)
    }

    /// Closes the channel. Further closes are no-ops.
    pub fn close(self: &Arc<Self>, ctx: &SchedCtx) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.resource.close(ctx, self)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Debug for IoChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoChannel")
            .field("kind", &self.kind)
            .field("mode", &self.mode.bits())
            .finish()
    }
}
