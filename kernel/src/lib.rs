// SPDX-License-Identifier: MPL-2.0

//! The Kestrel kernel proper.
//!
//! Built on [`kestrel_frame`], this crate provides the process model with
//! its address-space arena and descriptor table, the filesystem core (inode
//! model, filesystem dispatch, mount table and path resolution), the
//! I/O channel layer, the dispatch queue contract and the boot wiring.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod boot;
pub mod dispatch;
pub mod fs;
pub mod io;
pub mod prelude;
pub mod process;
pub mod vm;
