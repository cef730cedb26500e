// SPDX-License-Identifier: MPL-2.0

use bit_field::BitField;
use intrusive_collections::LinkedList;

use crate::prelude::*;
use crate::sched::vp::{Vp, VpRunAdapter, PRIORITY_COUNT};

/// The ready queue: one FIFO bucket per priority plus a population bitmap.
///
/// Selecting the best ready VP is a highest-set-bit scan over the bitmap
/// followed by taking the front of that bucket.
pub(super) struct ReadyQueue {
    buckets: [LinkedList<VpRunAdapter>; PRIORITY_COUNT],
    populated: u64,
}

impl ReadyQueue {
    pub(super) fn new() -> Self {
        Self {
            buckets: core::array::from_fn(|_| LinkedList::new(VpRunAdapter::new())),
            populated: 0,
        }
    }

    /// Appends `vp` to the bucket of its effective priority.
    pub(super) fn push(&mut self, vp: Arc<Vp>) {
        let pri = vp.effective_priority() as usize;
        self.buckets[pri].push_back(vp);
        self.populated.set_bit(pri, true);
    }

    /// Removes `vp` from the bucket of its effective priority, if present.
    pub(super) fn remove(&mut self, vp: &Vp) -> Option<Arc<Vp>> {
        let pri = vp.effective_priority() as usize;
        let removed = remove_from_list(&mut self.buckets[pri], vp);
        if self.buckets[pri].is_empty() {
            self.populated.set_bit(pri, false);
        }
        removed
    }

    /// The priority of the best ready VP.
    pub(super) fn highest_populated(&self) -> Option<usize> {
        if self.populated == 0 {
            None
        } else {
            Some(63 - self.populated.leading_zeros() as usize)
        }
    }

    /// Returns the best ready VP without removing it.
    pub(super) fn peek_highest(&self) -> Option<Arc<Vp>> {
        let pri = self.highest_populated()?;
        self.buckets[pri].front().clone_pointer()
    }

    /// Removes and returns the best ready VP.
    pub(super) fn pop_highest(&mut self) -> Option<Arc<Vp>> {
        let pri = self.highest_populated()?;
        let vp = self.buckets[pri].pop_front();
        if self.buckets[pri].is_empty() {
            self.populated.set_bit(pri, false);
        }
        vp
    }

    pub(super) fn is_empty(&self) -> bool {
        self.populated == 0
    }
}

/// Removes the element identified by pointer equality from an intrusive
/// list.
pub(super) fn remove_from_list(list: &mut LinkedList<VpRunAdapter>, vp: &Vp) -> Option<Arc<Vp>> {
    let mut cursor = list.front_mut();
    loop {
        let found = match cursor.get() {
            None => return None,
            Some(v) => core::ptr::eq(v, vp),
        };
        if found {
            return cursor.remove();
        }
        cursor.move_next();
    }
}
