// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;
use crate::sched::scheduler::Scheduler;
use crate::sched::vp::{Vp, Vpid};

/// The execution context of a blocking kernel path: the scheduler plus the
/// virtual processor the path runs on.
///
/// There is no ambient notion of "the current VP" in the hosted model, so
/// every operation that may suspend takes its context explicitly.
#[derive(Clone, Copy)]
pub struct SchedCtx<'a> {
    sched: &'a Scheduler,
    vp: &'a Arc<Vp>,
}

impl<'a> SchedCtx<'a> {
    pub fn new(sched: &'a Scheduler, vp: &'a Arc<Vp>) -> Self {
        Self { sched, vp }
    }

    pub fn sched(&self) -> &'a Scheduler {
        self.sched
    }

    pub fn vp(&self) -> &'a Arc<Vp> {
        self.vp
    }

    pub fn vpid(&self) -> Vpid {
        self.vp.vpid()
    }
}
