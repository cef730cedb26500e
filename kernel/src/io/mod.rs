// SPDX-License-Identifier: MPL-2.0

//! I/O channels and resources.

mod channel;
mod file;

pub use channel::{ChannelKind, ChannelMode, IoChannel, IoResource, SeekWhence};
pub use file::{open_directory, open_file, DirectoryResource, FileResource};
