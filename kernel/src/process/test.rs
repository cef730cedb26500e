// SPDX-License-Identifier: MPL-2.0

//! Process model tests: spawning, descriptor inheritance, argument areas
//! and the termination protocol.

use kestrel_frame::irq::NopChip;
use kestrel_frame::mm::{Allocator, MemoryAccess, MemoryRegionDesc, ALLOC_ALIGN};

use crate::boot::KernelServices;
use crate::io::{ChannelKind, ChannelMode, IoChannel, IoResource};
use crate::prelude::*;
use crate::process::{
    FlatBinaryLoader, Process, ProcessArguments, SpawnArgs, SpawnOptions, ANY_CHILD,
};

fn test_allocator() -> Arc<Allocator> {
    let size = 1 << 20;
    let layout = std::alloc::Layout::from_size_align(size, ALLOC_ALIGN).unwrap();
    let lower = unsafe { std::alloc::alloc(layout) };
    assert!(!lower.is_null());
    let desc = MemoryRegionDesc {
        lower,
        upper: unsafe { lower.add(size) },
        access: MemoryAccess::DmaAndCpu,
    };
    Arc::new(Allocator::new(&[desc]).unwrap())
}

fn services() -> Arc<KernelServices> {
    KernelServices::new(
        test_allocator(),
        Box::new(NopChip),
        Arc::new(FlatBinaryLoader),
    )
}

fn spawn_args<'a>(argv: &'a [&'a str]) -> SpawnArgs<'a> {
    SpawnArgs {
        argv,
        envp: &[],
        options: SpawnOptions::empty(),
        image: b"\x4e\x71\x4e\x75",
    }
}

// A do-nothing channel resource for descriptor table tests.
struct NullResource;
impl IoResource for NullResource {
    fn dup(&self, _ctx: &SchedCtx, channel: &Arc<IoChannel>) -> Result<Arc<IoChannel>> {
        Ok(IoChannel::new(
            channel.resource().clone(),
            channel.mode(),
            channel.kind(),
        ))
    }
}

fn null_channel() -> Arc<IoChannel> {
    IoChannel::new(Arc::new(NullResource), ChannelMode::READ, ChannelKind::Device)
}

#[test]
fn descriptors_are_dense_and_reuse_the_lowest_free_slot() {
    let services = services();
    let ctx = services.boot_ctx();
    let root = Process::create_root(&services);

    let fds: Vec<i32> = (0..4)
        .map(|_| root.register_channel(&ctx, &null_channel()).unwrap())
        .collect();
    assert_eq!(fds, vec![0, 1, 2, 3]);

    root.unregister_channel(&ctx, 1).unwrap();
    assert_eq!(root.register_channel(&ctx, &null_channel()).unwrap(), 1);

    let err = root.channel_for_descriptor(&ctx, 99).unwrap_err();
    assert_eq!(err.error(), Errno::EBADF);
    let err = root.unregister_channel(&ctx, -1).unwrap_err();
    assert_eq!(err.error(), Errno::EBADF);
}

#[test]
fn spawn_inherits_stdio_unless_opted_out() {
    let services = services();
    let ctx = services.boot_ctx();
    let root = Process::create_root(&services);

    for _ in 0..3 {
        root.register_channel(&ctx, &null_channel()).unwrap();
    }

    let child_pid = root.spawn_child(&ctx, &spawn_args(&["init"])).unwrap();
    let child = services.processes.process_for_pid(child_pid).unwrap();
    for fd in 0..3 {
        child.channel_for_descriptor(&ctx, fd).unwrap();
    }

    let args = SpawnArgs {
        options: SpawnOptions::NO_DEFAULT_DESCRIPTOR_INHERITANCE,
        ..spawn_args(&["init"])
    };
    let loner_pid = root.spawn_child(&ctx, &args).unwrap();
    let loner = services.processes.process_for_pid(loner_pid).unwrap();
    assert_eq!(
        loner.channel_for_descriptor(&ctx, 0).unwrap_err().error(),
        Errno::EBADF
    );
}

#[test]
fn the_argument_area_has_the_documented_layout() {
    let services = services();
    let ctx = services.boot_ctx();
    let root = Process::create_root(&services);

    let pid = root
        .spawn_child(&ctx, &spawn_args(&["shell", "-l", "home"]))
        .unwrap();
    let child = services.processes.process_for_pid(pid).unwrap();

    let base = child.arguments_base();
    assert!(!base.is_null());

    // SAFETY: the argument area was laid out by copy_in_arguments and stays
    // alive as long as the child process does.
    unsafe {
        let header = &*(base as *const ProcessArguments);
        assert_eq!(header.argc, 3);
        assert_eq!(header.version as usize, core::mem::size_of::<ProcessArguments>());
        assert_eq!(header.arguments_size % kestrel_frame::config::PAGE_SIZE, 0);
        assert_eq!(header.image_base, child.image_base());
        assert!(!header.image_base.is_null());

        let argv = header.argv;
        let expected = ["shell", "-l", "home"];
        for (i, want) in expected.iter().enumerate() {
            let arg = *argv.add(i);
            let bytes = core::slice::from_raw_parts(arg, want.len() + 1);
            assert_eq!(&bytes[..want.len()], want.as_bytes());
            assert_eq!(bytes[want.len()], 0);
        }
        assert!((*argv.add(3)).is_null());
        assert!((*header.envp).is_null());
    }
}

#[test]
fn oversized_argument_lists_are_rejected() {
    let services = services();
    let ctx = services.boot_ctx();
    let root = Process::create_root(&services);

    let big = "x".repeat(0x20000);
    let argv = [big.as_str()];
    let err = root.spawn_child(&ctx, &spawn_args(&argv)).unwrap_err();
    assert_eq!(err.error(), Errno::E2BIG);

    // The failed spawn does not leave a stray child behind.
    let err = root
        .wait_for_termination_of_child(&ctx, ANY_CHILD)
        .unwrap_err();
    assert_eq!(err.error(), Errno::ECHILD);
}

#[test]
fn wait_consumes_the_tombstone_of_a_terminated_child() {
    let services = services();
    let ctx = services.boot_ctx();
    let root = Process::create_root(&services);

    let pid = root.spawn_child(&ctx, &spawn_args(&["task"])).unwrap();
    let child = services.processes.process_for_pid(pid).unwrap();

    child.terminate(&ctx, 17);
    // Termination runs asynchronously on the kernel queue.
    assert!(child.is_terminating());
    services.kernel_queue.drain(&ctx).unwrap();

    let (dead_pid, status) = root.wait_for_termination_of_child(&ctx, pid).unwrap();
    assert_eq!(dead_pid, pid);
    assert_eq!(status, 17);

    // The tombstone is consumed and the child is gone.
    assert!(services.processes.process_for_pid(pid).is_none());
    let err = root.wait_for_termination_of_child(&ctx, pid).unwrap_err();
    assert_eq!(err.error(), Errno::ECHILD);
}

#[test]
fn only_the_first_exit_code_wins() {
    let services = services();
    let ctx = services.boot_ctx();
    let root = Process::create_root(&services);

    let pid = root.spawn_child(&ctx, &spawn_args(&["task"])).unwrap();
    let child = services.processes.process_for_pid(pid).unwrap();

    child.terminate(&ctx, 1);
    child.terminate(&ctx, 2);
    services.kernel_queue.drain(&ctx).unwrap();

    let (_, status) = root.wait_for_termination_of_child(&ctx, ANY_CHILD).unwrap();
    assert_eq!(status, 1);
}

#[test]
fn terminating_a_parent_reaps_the_whole_subtree() {
    let services = services();
    let ctx = services.boot_ctx();
    let root = Process::create_root(&services);

    let parent_pid = root.spawn_child(&ctx, &spawn_args(&["parent"])).unwrap();
    let parent = services.processes.process_for_pid(parent_pid).unwrap();

    let child_pid = parent.spawn_child(&ctx, &spawn_args(&["child"])).unwrap();
    let grandchild_pid = {
        let child = services.processes.process_for_pid(child_pid).unwrap();
        child.spawn_child(&ctx, &spawn_args(&["grandchild"])).unwrap()
    };
    assert_eq!(services.processes.count(), 4);

    parent.terminate(&ctx, 0);
    services.kernel_queue.drain(&ctx).unwrap();

    // The whole subtree is gone and the root consumed the parent's
    // tombstone.
    assert!(services.processes.process_for_pid(parent_pid).is_none());
    assert!(services.processes.process_for_pid(child_pid).is_none());
    assert!(services.processes.process_for_pid(grandchild_pid).is_none());
    assert_eq!(services.processes.count(), 1);

    let (dead_pid, _) = root.wait_for_termination_of_child(&ctx, ANY_CHILD).unwrap();
    assert_eq!(dead_pid, parent_pid);

    // The parent's main queue reached its terminal state.
    assert_eq!(
        parent.main_dispatch_queue().state(&ctx),
        crate::dispatch::QueueState::Terminated
    );
}

#[test]
fn lane_vps_resolve_back_to_their_owning_process() {
    let services = services();
    let ctx = services.boot_ctx();
    let root = Process::create_root(&services);

    let pid = root.spawn_child(&ctx, &spawn_args(&["task"])).unwrap();
    let child = services.processes.process_for_pid(pid).unwrap();

    // Dispatching the entry point acquired a lane VP bound to the child's
    // main queue; the binding resolves back to the process by weak
    // reference only.
    let lane = child.main_dispatch_queue().lane_vps(&ctx);
    assert_eq!(lane.len(), 1);
    let resolved = crate::process::current_process(&lane[0]).unwrap();
    assert_eq!(resolved.pid(), pid);
}

#[test]
fn wait_with_no_children_reports_echild() {
    let services = services();
    let ctx = services.boot_ctx();
    let root = Process::create_root(&services);

    let err = root
        .wait_for_termination_of_child(&ctx, ANY_CHILD)
        .unwrap_err();
    assert_eq!(err.error(), Errno::ECHILD);
    let err = root.wait_for_termination_of_child(&ctx, 4242).unwrap_err();
    assert_eq!(err.error(), Errno::ECHILD);
}

#[test]
#[should_panic(expected = "root process")]
fn terminating_the_root_process_is_fatal() {
    let services = services();
    let ctx = services.boot_ctx();
    let root = Process::create_root(&services);
    root.terminate(&ctx, 0);
}

#[test]
fn termination_frees_the_address_space() {
    let services = services();
    let ctx = services.boot_ctx();
    let root = Process::create_root(&services);

    let pid = root.spawn_child(&ctx, &spawn_args(&["task"])).unwrap();
    let child = services.processes.process_for_pid(pid).unwrap();
    // The argument area and the image were allocated in the child's space.
    assert!(!child.address_space().is_empty());

    child.terminate(&ctx, 0);
    services.kernel_queue.drain(&ctx).unwrap();
    root.wait_for_termination_of_child(&ctx, pid).unwrap();

    assert!(child.address_space().is_empty());
}
