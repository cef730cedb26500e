// SPDX-License-Identifier: MPL-2.0

//! Platform constants.

/// The CPU page size. User-visible allocations such as the process argument
/// area are rounded up to a multiple of this.
pub const PAGE_SIZE: usize = 4096;

/// Default size of a kernel-mode execution stack.
pub const DEFAULT_KERNEL_STACK_SIZE: usize = PAGE_SIZE;

/// Default size of a user-mode execution stack.
pub const DEFAULT_USER_STACK_SIZE: usize = PAGE_SIZE;

/// Minimum size of a kernel-mode execution stack.
pub const MIN_KERNEL_STACK_SIZE: usize = 16;
