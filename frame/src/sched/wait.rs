// SPDX-License-Identifier: MPL-2.0

use intrusive_collections::LinkedList;

use crate::prelude::*;
use crate::sched::runqueue::remove_from_list;
use crate::sched::vp::{Vp, Vpid, VpRunAdapter};
use crate::sync::{SpinLock, SpinLockGuard};

/// A queue of virtual processors blocked waiting for an event.
///
/// Entries are kept sorted by effective priority, highest first; VPs of
/// equal priority leave the queue in the order they entered it. A wait queue
/// must outlive every wait entered on it.
pub struct WaitQueue {
    list: SpinLock<LinkedList<VpRunAdapter>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            list: SpinLock::new(LinkedList::new(VpRunAdapter::new())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.lock().iter().count()
    }

    /// The vpids currently on the queue, front to back.
    pub fn vpids(&self) -> Vec<Vpid> {
        self.list.lock().iter().map(|vp| vp.vpid()).collect()
    }

    pub(super) fn list(&self) -> SpinLockGuard<'_, LinkedList<VpRunAdapter>> {
        self.list.lock()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Inserts `vp` by descending effective priority; equal priorities append at
/// the tail of their run.
pub(super) fn insert_sorted(list: &mut LinkedList<VpRunAdapter>, vp: Arc<Vp>) {
    let priority = vp.effective_priority();
    let mut cursor = list.front_mut();
    loop {
        let stop = match cursor.get() {
            None => true,
            Some(v) => v.effective_priority() < priority,
        };
        if stop {
            break;
        }
        cursor.move_next();
    }
    cursor.insert_before(vp);
}

/// Removes `vp` from the queue list, if present.
pub(super) fn remove_vp(list: &mut LinkedList<VpRunAdapter>, vp: &Vp) -> Option<Arc<Vp>> {
    remove_from_list(list, vp)
}

/// Clones out the queue entries, front to back.
pub(super) fn snapshot(list: &LinkedList<VpRunAdapter>) -> Vec<Arc<Vp>> {
    let mut out = Vec::new();
    let mut cursor = list.front();
    while let Some(vp) = cursor.clone_pointer() {
        out.push(vp);
        cursor.move_next();
    }
    out
}
