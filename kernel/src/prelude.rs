// SPDX-License-Identifier: MPL-2.0

//! The kernel prelude.

pub use alloc::{
    boxed::Box,
    string::{String, ToString},
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
pub use core::{any::Any, fmt::Debug};

pub use kestrel_frame::error::{Errno, Error, Result};
pub use kestrel_frame::sched::SchedCtx;
pub use kestrel_frame::{return_errno, return_errno_with_message};
