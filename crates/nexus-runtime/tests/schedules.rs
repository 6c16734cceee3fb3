//! Command building, finalize validation and schedule execution.

mod common;

use common::{assert_close, host_device, sample_kernel};
use nexus_abi::{KernelArgs, KernelDescriptor, KernelTable, WorkItem, KERNEL_OK};
use nexus_runtime::loader::register_module;
use nexus_runtime::{
    BufferState, CommandStatus, Device, ErrorKind, HostRegion, Kernel, LaunchGeometry, NexusError,
};

const FAULTY: &str = "nexus-test:faulty-kernels";

/// Fails every invocation with status 5.
unsafe extern "C" fn always_fail(_: *const KernelArgs, _: *const WorkItem) -> i32 {
    5
}

/// `x[i] = -1` for every covered element.
unsafe extern "C" fn poison(args: *const KernelArgs, item: *const WorkItem) -> i32 {
    let (args, i) = (&*args, (*item).global_id());
    if i < args.len::<f32>(0) {
        *args.ptr::<f32>(0).add(i) = -1.0;
    }
    KERNEL_OK
}

static FAULTY_KERNELS: [KernelDescriptor; 2] = [
    KernelDescriptor { name: c"always_fail".as_ptr(), slot_count: 1, entry: always_fail },
    KernelDescriptor { name: c"poison".as_ptr(), slot_count: 1, entry: poison },
];
static FAULTY_TABLE: KernelTable = KernelTable::new(&FAULTY_KERNELS);

fn faulty_kernel(device: &Device, name: &str) -> Kernel {
    register_module(FAULTY, &FAULTY_TABLE).unwrap();
    device.load_library(FAULTY).unwrap().get_kernel(name).unwrap()
}

#[test]
fn test_commands_run_in_insertion_order() {
    let device = host_device();
    let x = device.upload(&HostRegion::of(&[1.0f32, 2.0, 3.0, 4.0])).unwrap();
    let y = device.allocate_buffer(16, nexus_runtime::DataType::F32).unwrap();
    let z = device.allocate_buffer(16, nexus_runtime::DataType::F32).unwrap();

    let schedule = device.create_schedule();
    let copy = schedule.create_command(&sample_kernel(&device, "copy_vector")).unwrap();
    copy.set_buffer(0, &x).unwrap();
    copy.set_buffer(1, &y).unwrap();
    copy.finalize(1, 4).unwrap();

    let inc = schedule.create_command(&sample_kernel(&device, "increment")).unwrap();
    inc.set_buffer(0, &y).unwrap();
    inc.finalize(2, 2).unwrap();

    let square = schedule.create_command(&sample_kernel(&device, "mul_vectors")).unwrap();
    square.set_buffer(0, &y).unwrap();
    square.set_buffer(1, &y).unwrap();
    square.set_buffer(2, &z).unwrap();
    square.finalize(4, 1).unwrap();

    assert_eq!(schedule.len(), 3);
    schedule.run().unwrap();

    for cmd in [&copy, &inc, &square] {
        assert_eq!(cmd.status().unwrap(), CommandStatus::Completed);
    }
    assert_eq!(z.state().unwrap(), BufferState::Synced);
    assert_close(&z.to_vec::<f32>().unwrap(), &[4.0, 9.0, 16.0, 25.0], 1e-6);
}

#[test]
fn test_failing_command_aborts_rest() {
    let device = host_device();
    let a = device.upload(&HostRegion::of(&[1.0f32; 8])).unwrap();
    let b = device.upload(&HostRegion::of(&[2.0f32; 8])).unwrap();
    let c = device.upload(&HostRegion::of(&[3.0f32; 8])).unwrap();

    let schedule = device.create_schedule();
    let first = schedule.create_command(&sample_kernel(&device, "increment")).unwrap();
    first.set_buffer(0, &a).unwrap();
    first.finalize(8, 1).unwrap();
    let second = schedule.create_command(&faulty_kernel(&device, "always_fail")).unwrap();
    second.set_buffer(0, &b).unwrap();
    second.finalize(1, 1).unwrap();
    let third = schedule.create_command(&faulty_kernel(&device, "poison")).unwrap();
    third.set_buffer(0, &c).unwrap();
    third.finalize(8, 1).unwrap();

    let err = schedule.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
    assert_eq!(err.failed_command(), Some(1));
    match &err {
        NexusError::CommandFailed { command, kernel, reason, .. } => {
            assert_eq!(*command, second.id());
            assert_eq!(kernel, "always_fail");
            assert!(reason.contains("status 5"), "{reason}");
        }
        other => panic!("unexpected error {other:?}"),
    }

    // Nothing completes unless the whole run does.
    assert_eq!(first.status().unwrap(), CommandStatus::Finalized);
    assert_eq!(second.status().unwrap(), CommandStatus::Finalized);
    assert_eq!(third.status().unwrap(), CommandStatus::Finalized);

    assert_eq!(a.state().unwrap(), BufferState::Synced);
    assert_eq!(b.state().unwrap(), BufferState::Unsynced);
    assert_eq!(c.state().unwrap(), BufferState::Unsynced);

    assert_eq!(a.to_vec::<f32>().unwrap(), vec![2.0; 8]);
    // The third command never executed.
    assert_eq!(c.to_vec::<f32>().unwrap(), vec![3.0; 8]);
}

#[test]
fn test_failed_rerun_keeps_earlier_completion() {
    let device = host_device();
    let x = device.upload(&HostRegion::of(&[0.0f32; 4])).unwrap();
    let y = device.upload(&HostRegion::of(&[0.0f32; 4])).unwrap();

    let ok = device.create_schedule();
    let inc = ok.create_command(&sample_kernel(&device, "increment")).unwrap();
    inc.set_buffer(0, &x).unwrap();
    inc.finalize(4, 1).unwrap();
    ok.run().unwrap();
    assert_eq!(inc.status().unwrap(), CommandStatus::Completed);

    let failing = device.create_schedule();
    let before = failing.create_command(&sample_kernel(&device, "increment")).unwrap();
    before.set_buffer(0, &y).unwrap();
    before.finalize(4, 1).unwrap();
    let bad = failing.create_command(&faulty_kernel(&device, "always_fail")).unwrap();
    bad.set_buffer(0, &x).unwrap();
    bad.finalize(1, 1).unwrap();

    assert_eq!(failing.run().unwrap_err().failed_command(), Some(1));
    assert_eq!(before.status().unwrap(), CommandStatus::Finalized);
    assert_eq!(y.to_vec::<f32>().unwrap(), vec![1.0; 4]);
    // Completion from an earlier successful run is kept.
    assert_eq!(inc.status().unwrap(), CommandStatus::Completed);
}

#[test]
fn test_shared_buffer_with_failing_command_is_unsynced() {
    let device = host_device();
    let shared = device.upload(&HostRegion::of(&[0.0f32; 4])).unwrap();

    let schedule = device.create_schedule();
    let ok = schedule.create_command(&sample_kernel(&device, "iota")).unwrap();
    ok.set_buffer(0, &shared).unwrap();
    ok.finalize(4, 1).unwrap();
    let bad = schedule.create_command(&faulty_kernel(&device, "always_fail")).unwrap();
    bad.set_buffer(0, &shared).unwrap();
    bad.finalize(1, 1).unwrap();

    assert_eq!(schedule.run().unwrap_err().failed_command(), Some(1));
    assert_eq!(shared.state().unwrap(), BufferState::Unsynced);
}

#[test]
fn test_run_rejects_unfinalized_without_side_effects() {
    let device = host_device();
    let x = device.upload(&HostRegion::of(&[5.0f32; 4])).unwrap();

    let schedule = device.create_schedule();
    let done = schedule.create_command(&sample_kernel(&device, "increment")).unwrap();
    done.set_buffer(0, &x).unwrap();
    done.finalize(4, 1).unwrap();
    let pending = schedule.create_command(&sample_kernel(&device, "increment")).unwrap();
    pending.set_buffer(0, &x).unwrap();

    let err = schedule.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(err.to_string().contains("command 1"), "{err}");
    assert_eq!(done.status().unwrap(), CommandStatus::Finalized);
    assert_eq!(x.state().unwrap(), BufferState::Synced);
    assert_eq!(x.to_vec::<f32>().unwrap(), vec![5.0; 4]);
}

#[test]
fn test_run_rejects_released_binding() {
    let device = host_device();
    let x = device.upload(&HostRegion::of(&[1.0f32; 4])).unwrap();
    let y = device.upload(&HostRegion::of(&[1.0f32; 4])).unwrap();

    let schedule = device.create_schedule();
    let first = schedule.create_command(&sample_kernel(&device, "increment")).unwrap();
    first.set_buffer(0, &x).unwrap();
    first.finalize(4, 1).unwrap();
    let second = schedule.create_command(&sample_kernel(&device, "increment")).unwrap();
    second.set_buffer(0, &y).unwrap();
    second.finalize(4, 1).unwrap();

    y.release().unwrap();
    assert_eq!(schedule.run().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(x.to_vec::<f32>().unwrap(), vec![1.0; 4]);
    assert_eq!(first.status().unwrap(), CommandStatus::Finalized);
}

#[test]
fn test_finalize_validation_order() {
    let device = host_device();
    let kernel = sample_kernel(&device, "add_vectors");
    assert_eq!(kernel.slot_count(), 3);
    let a = device.allocate_buffer(16, nexus_runtime::DataType::F32).unwrap();

    let schedule = device.create_schedule();
    let cmd = schedule.create_command(&kernel).unwrap();
    assert_eq!(cmd.status().unwrap(), CommandStatus::Building);

    // Geometry is checked before bindings.
    assert_eq!(cmd.finalize(0, 1).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(cmd.finalize(1, 0).unwrap_err().kind(), ErrorKind::InvalidArgument);

    cmd.set_buffer(0, &a).unwrap();
    cmd.set_buffer(2, &a).unwrap();
    let err = cmd.finalize(1, 4).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(err.to_string().contains("slot 1"), "{err}");
    assert_eq!(cmd.status().unwrap(), CommandStatus::Building);
    assert_eq!(cmd.geometry().unwrap(), None);

    cmd.set_buffer(1, &a).unwrap();
    cmd.finalize(1, 4).unwrap();
    assert_eq!(cmd.geometry().unwrap(), Some(LaunchGeometry { grid_size: 1, block_size: 4 }));

    assert_eq!(cmd.finalize(1, 4).unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(cmd.set_buffer(0, &a).unwrap_err().kind(), ErrorKind::InvalidState);
}

#[test]
fn test_set_buffer_validation() {
    let device = host_device();
    let schedule = device.create_schedule();
    let cmd = schedule.create_command(&sample_kernel(&device, "copy_vector")).unwrap();
    let a = device.allocate_buffer(8, nexus_runtime::DataType::F32).unwrap();
    let b = device.allocate_buffer(8, nexus_runtime::DataType::F32).unwrap();

    assert_eq!(cmd.set_buffer(2, &a).unwrap_err().kind(), ErrorKind::InvalidArgument);

    // Rebinding overwrites.
    cmd.set_buffer(0, &a).unwrap();
    cmd.set_buffer(0, &b).unwrap();

    a.release().unwrap();
    assert_eq!(cmd.set_buffer(1, &a).unwrap_err().kind(), ErrorKind::InvalidState);
}

#[test]
fn test_scalar_argument_reaches_kernel() {
    let device = host_device();
    let x = device.upload(&HostRegion::of(&[1.0f32, -2.0, 3.5, 0.0, 8.0])).unwrap();

    let schedule = device.create_schedule();
    let scale = schedule.create_command(&sample_kernel(&device, "scale")).unwrap();
    assert_eq!(scale.kernel().slot_count(), 2);
    scale.set_buffer(0, &x).unwrap();
    scale.set_scalar(1, 2.0f32).unwrap();
    scale.finalize(2, 4).unwrap();

    schedule.run().unwrap();
    schedule.run().unwrap();
    assert_eq!(scale.status().unwrap(), CommandStatus::Completed);
    assert_close(&x.to_vec::<f32>().unwrap(), &[4.0, -8.0, 14.0, 0.0, 32.0], 1e-6);
}

#[test]
fn test_set_scalar_validation() {
    let device = host_device();
    let x = device.allocate_buffer(16, nexus_runtime::DataType::F32).unwrap();
    let schedule = device.create_schedule();
    let cmd = schedule.create_command(&sample_kernel(&device, "scale")).unwrap();

    assert_eq!(cmd.set_scalar(2, 1.0f32).unwrap_err().kind(), ErrorKind::InvalidArgument);

    // A scalar fills a slot for finalize, and either kind overwrites the other.
    cmd.set_scalar(0, 3i32).unwrap();
    cmd.set_buffer(0, &x).unwrap();
    cmd.set_buffer(1, &x).unwrap();
    cmd.set_scalar(1, 0.5f32).unwrap();
    cmd.finalize(1, 4).unwrap();

    assert_eq!(cmd.set_scalar(1, 1.0f32).unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(cmd.status().unwrap(), CommandStatus::Finalized);
}

#[test]
fn test_scalar_in_buffer_slot_fails_command() {
    let device = host_device();
    let x = device.upload(&HostRegion::of(&[1.0f32; 4])).unwrap();

    let schedule = device.create_schedule();
    let cmd = schedule.create_command(&sample_kernel(&device, "scale")).unwrap();
    cmd.set_buffer(0, &x).unwrap();
    cmd.set_buffer(1, &x).unwrap();
    cmd.finalize(1, 4).unwrap();

    let err = schedule.run().unwrap_err();
    assert_eq!(err.failed_command(), Some(0));
    assert_eq!(cmd.status().unwrap(), CommandStatus::Finalized);
    assert_eq!(x.state().unwrap(), BufferState::Unsynced);
}

#[test]
fn test_cross_device_handles_rejected() {
    let first = host_device();
    let second = host_device();
    assert_ne!(first.id(), second.id());

    let schedule = second.create_schedule();
    let foreign = sample_kernel(&first, "increment");
    assert_eq!(schedule.create_command(&foreign).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert!(schedule.is_empty());

    let cmd = schedule.create_command(&sample_kernel(&second, "increment")).unwrap();
    let foreign_buffer = first.allocate_buffer(4, nexus_runtime::DataType::F32).unwrap();
    assert_eq!(cmd.set_buffer(0, &foreign_buffer).unwrap_err().kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_completed_commands_rerun() {
    let device = host_device();
    let x = device.upload(&HostRegion::of(&[0.0f32; 6])).unwrap();

    let schedule = device.create_schedule();
    let cmd = schedule.create_command(&sample_kernel(&device, "increment")).unwrap();
    cmd.set_buffer(0, &x).unwrap();
    // Rounded-up geometry; the kernel ignores items past the end.
    cmd.finalize(2, 4).unwrap();

    schedule.run().unwrap();
    schedule.run().unwrap();
    assert_eq!(cmd.status().unwrap(), CommandStatus::Completed);
    assert_eq!(x.to_vec::<f32>().unwrap(), vec![2.0; 6]);
}

#[test]
fn test_empty_schedule_runs() {
    let device = host_device();
    let schedule = device.create_schedule();
    assert!(schedule.is_empty());
    schedule.run().unwrap();
    assert_eq!(schedule.command(0).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn test_command_lookup_by_index() {
    let device = host_device();
    let schedule = device.create_schedule();
    let created = schedule.create_command(&sample_kernel(&device, "iota")).unwrap();
    let found = schedule.command(0).unwrap();
    assert_eq!(found.id(), created.id());
    assert_eq!(found.index(), 0);
    assert_eq!(found.kernel().name(), "iota");
}

#[test]
fn test_commands_outlived_by_schedule() {
    let device = host_device();
    let schedule = device.create_schedule();
    let cmd = schedule.create_command(&sample_kernel(&device, "iota")).unwrap();
    drop(schedule);
    assert_eq!(cmd.status().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(cmd.finalize(1, 1).unwrap_err().kind(), ErrorKind::InvalidState);
}

#[test]
fn test_concurrent_schedules_serialize() {
    let device = host_device();
    let x = device.upload(&HostRegion::of(&[0.0f32; 256])).unwrap();

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let schedule = device.create_schedule();
                let cmd = schedule.create_command(&sample_kernel(&device, "increment")).unwrap();
                cmd.set_buffer(0, &x).unwrap();
                cmd.finalize(4, 64).unwrap();
                for _ in 0..10 {
                    schedule.run().unwrap();
                }
            });
        }
    });

    assert_eq!(x.to_vec::<f32>().unwrap(), vec![40.0; 256]);
}
