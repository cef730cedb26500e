// SPDX-License-Identifier: MPL-2.0

use hashbrown::HashMap;
use kestrel_frame::sync::SpinLock;

use crate::prelude::*;
use crate::process::{Pid, Process};

/// The registry of live processes.
pub struct ProcessManager {
    table: SpinLock<HashMap<Pid, Arc<Process>>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            table: SpinLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, process: &Arc<Process>) {
        let previous = self.table.lock().insert(process.pid(), process.clone());
        debug_assert!(previous.is_none());
    }

    /// Removes a process from the registry, dropping the registry's strong
    /// reference.
    pub fn unregister(&self, pid: Pid) {
        self.table.lock().remove(&pid);
    }

    /// A strong reference to the process with the given pid, if it is still
    /// registered.
    pub fn process_for_pid(&self, pid: Pid) -> Option<Arc<Process>> {
        self.table.lock().get(&pid).cloned()
    }

    pub fn count(&self) -> usize {
        self.table.lock().len()
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
