// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;
use crate::vm::AddressSpace;

/// The outcome of loading an executable into an address space.
pub struct LoadedImage {
    pub image_base: *mut u8,
    pub entry_point: *mut u8,
    pub image_size: usize,
}

/// Loads executable images into a process address space.
///
/// The actual executable format lives outside the kernel core; this trait
/// is the seam it plugs into.
pub trait ExecutableLoader: Send + Sync {
    fn load(&self, space: &AddressSpace, image: &[u8]) -> Result<LoadedImage>;
}

/// Loads a flat binary: the bytes are copied verbatim and execution starts
/// at the image base.
pub struct FlatBinaryLoader;

impl ExecutableLoader for FlatBinaryLoader {
    fn load(&self, space: &AddressSpace, image: &[u8]) -> Result<LoadedImage> {
        if image.is_empty() {
            return_errno_with_message!(Errno::ENOEXEC, "empty executable image");
        }
        let base = space.allocate(image.len())?;
        // SAFETY: `base` points at a fresh allocation of `image.len()`
        // bytes owned by the address space.
        unsafe {
            core::ptr::copy_nonoverlapping(image.as_ptr(), base, image.len());
        }
        Ok(LoadedImage {
            image_base: base,
            entry_point: base,
            image_size: image.len(),
        })
    }
}
