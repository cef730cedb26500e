// SPDX-License-Identifier: MPL-2.0

//! Process-side memory management.

mod address_space;

pub use address_space::AddressSpace;
