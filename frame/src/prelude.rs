// SPDX-License-Identifier: MPL-2.0

//! The frame prelude.

pub use alloc::{
    boxed::Box,
    string::{String, ToString},
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
pub use core::{any::Any, fmt::Debug};

pub use crate::error::{Errno, Error, Result};
pub use crate::{return_errno, return_errno_with_message};
