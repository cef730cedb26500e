// SPDX-License-Identifier: MPL-2.0

//! The disk image format.
//!
//! A Kestrel disk image is an optional fixed header followed by a packed
//! array of logical blocks. Raw images (e.g. floppy dumps) carry no header
//! and are recognized by the missing signature. Sparse images store only the
//! blocks up to the highest LBA that was ever written; the header records
//! both the stored (physical) and the full (logical) block count.

use alloc::vec::Vec;

use kestrel_frame::prelude::*;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::ram::RamContainer;
use crate::BlockContainer;

/// The disk image signature.
pub const DISK_IMAGE_SIGNATURE: [u8; 8] = *b"KstrlDsk";

/// The fixed header at the start of a non-raw disk image. All multi-byte
/// fields are big-endian.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DiskImageHeader {
    pub signature: [u8; 8],
    pub header_size: U32,
    pub physical_block_count: U64,
    pub logical_block_count: U64,
    pub block_size: U32,
    pub options: U32,
}

const_assert_eq!(core::mem::size_of::<DiskImageHeader>(), 36);

impl DiskImageHeader {
    pub fn new(physical_block_count: u64, logical_block_count: u64, block_size: u32) -> Self {
        Self {
            signature: DISK_IMAGE_SIGNATURE,
            header_size: U32::new(core::mem::size_of::<Self>() as u32),
            physical_block_count: U64::new(physical_block_count),
            logical_block_count: U64::new(logical_block_count),
            block_size: U32::new(block_size),
            options: U32::new(0),
        }
    }
}

/// Serializes the container into a disk image.
///
/// With `sparse`, only the blocks up to the highest written LBA are stored;
/// a container that was never written produces a body-less image.
pub fn write_image(container: &RamContainer, sparse: bool) -> Result<Vec<u8>> {
    let info = container.info();

    let physical_count = if sparse {
        container
            .highest_written_lba()
            .map_or(0, |highest| highest + 1)
    } else {
        info.block_count
    };

    log::debug!(
        "disk image: emitting {}/{} blocks of {} bytes",
        physical_count,
        info.block_count,
        info.block_size
    );
    let header = DiskImageHeader::new(physical_count, info.block_count, info.block_size as u32);
    let mut image =
        Vec::with_capacity(core::mem::size_of::<DiskImageHeader>() + physical_count as usize * info.block_size);
    image.extend_from_slice(header.as_bytes());

    let mut block = alloc::vec![0u8; info.block_size];
    for lba in 0..physical_count {
        container.read_block_raw(lba, &mut block);
        image.extend_from_slice(&block);
    }
    Ok(image)
}

/// Reconstructs a container from a disk image.
///
/// Images without the signature are treated as raw block dumps of
/// `raw_block_size`-sized blocks.
pub fn read_image(image: &[u8], raw_block_size: usize) -> Result<RamContainer> {
    if image.len() >= 8 && image[..8] == DISK_IMAGE_SIGNATURE {
        let (header, _) = DiskImageHeader::read_from_prefix(image)
            .map_err(|_| Error::with_message(Errno::EIO, "truncated disk image header"))?;

        let header_size = header.header_size.get() as usize;
        let block_size = header.block_size.get() as usize;
        let physical = header.physical_block_count.get();
        let logical = header.logical_block_count.get();
        if block_size == 0 || physical > logical {
            return_errno_with_message!(Errno::EIO, "bad disk image header");
        }

        let body = image
            .get(header_size..)
            .ok_or(Error::with_message(Errno::EIO, "truncated disk image"))?;
        if body.len() < physical as usize * block_size {
            return_errno_with_message!(Errno::EIO, "disk image body is short");
        }

        Ok(RamContainer::from_blocks(body, logical, block_size))
    } else {
        if raw_block_size == 0 || image.len() % raw_block_size != 0 {
            return_errno_with_message!(Errno::EIO, "raw image is not block-aligned");
        }
        let block_count = (image.len() / raw_block_size) as u64;
        Ok(RamContainer::from_blocks(image, block_count, raw_block_size))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{MapMode, WriteBack, BLOCK_SIZE};

    #[test]
    fn image_round_trip_preserves_contents() {
        let disk = RamContainer::new(16, BLOCK_SIZE);
        let mut block = disk.map_block(7, MapMode::Replace).unwrap();
        block.as_mut_slice().fill(0x3c);
        disk.unmap_block(block, WriteBack::Sync).unwrap();

        let image = write_image(&disk, false).unwrap();
        let restored = read_image(&image, BLOCK_SIZE).unwrap();
        assert_eq!(restored.info().block_count, 16);

        let block = restored.map_block(7, MapMode::ReadOnly).unwrap();
        assert!(block.iter().all(|&b| b == 0x3c));
        restored.unmap_block(block, WriteBack::None).unwrap();
    }

    #[test]
    fn sparse_image_stores_only_written_blocks() {
        let disk = RamContainer::new(1000, BLOCK_SIZE);
        let mut block = disk.map_block(3, MapMode::Replace).unwrap();
        block.as_mut_slice().fill(1);
        disk.unmap_block(block, WriteBack::Sync).unwrap();

        let image = write_image(&disk, true).unwrap();
        let expected = core::mem::size_of::<DiskImageHeader>() + 4 * BLOCK_SIZE;
        assert_eq!(image.len(), expected);

        // The logical geometry survives even though the body is truncated.
        let restored = read_image(&image, BLOCK_SIZE).unwrap();
        assert_eq!(restored.info().block_count, 1000);
    }

    #[test]
    fn raw_images_have_no_header() {
        let raw = alloc::vec![9u8; 4 * BLOCK_SIZE];
        let restored = read_image(&raw, BLOCK_SIZE).unwrap();
        assert_eq!(restored.info().block_count, 4);

        let block = restored.map_block(0, MapMode::ReadOnly).unwrap();
        assert!(block.iter().all(|&b| b == 9));
        restored.unmap_block(block, WriteBack::None).unwrap();
    }

    #[test]
    fn corrupt_headers_are_rejected() {
        let disk = RamContainer::new(4, BLOCK_SIZE);
        let mut image = write_image(&disk, false).unwrap();
        // Claim more stored blocks than the logical size.
        let header = DiskImageHeader::new(100, 4, BLOCK_SIZE as u32);
        image[..core::mem::size_of::<DiskImageHeader>()].copy_from_slice(header.as_bytes());
        assert_eq!(
            read_image(&image, BLOCK_SIZE).unwrap_err().error(),
            Errno::EIO
        );
    }
}
