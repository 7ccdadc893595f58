//! Monitor semantics: reentrance, mutual exclusion, queue behaviour.

use bvm_config::VmOptions;
use bvm_vm::{Class, ClassBuilder, MethodDecl, MethodFlags, MockPlatform, ThreadId, Vm};

fn boot() -> Vm {
    Vm::new(
        VmOptions::with_heap_size(256 * 1024),
        Box::new(MockPlatform::new()),
    )
    .expect("vm boots")
}

fn spawn_started(vm: &mut Vm) -> ThreadId {
    let object = vm.new_instance(vm.core_thread()).expect("thread object");
    let thread = vm.create_vmthread(object).expect("vmthread");
    vm.start_thread(thread, true).expect("start");
    thread
}

#[test]
fn test_reentrance_through_a_synchronized_frame() {
    let mut vm = boot();
    let main = vm.current_thread();
    let lockable = ClassBuilder::new("sync/Lockable")
        .super_class(vm.core_object())
        .method(
            MethodDecl::new("guarded", "()V")
                .flags(MethodFlags::SYNCHRONIZED)
                .bytecode(vec![0xb1])
                .max_stack(2)
                .max_locals(1),
        )
        .build(&mut vm)
        .expect("class");
    vm.make_permanent_root(lockable).expect("root");
    let object = vm.new_instance(lockable).expect("object");
    vm.make_permanent_root(object).expect("root");

    // Depth 1: an explicit monitorenter.
    assert!(vm.monitor_acquire(object, main).expect("acquire"));
    assert_eq!(vm.monitor_view(object).expect("view").depth, 1);

    // Depth 2: the interpreter invokes the synchronized method, recording
    // the monitor in the frame's sync slot.
    let method = Class::method_record(vm.heap(), lockable, 0);
    assert!(vm.monitor_acquire(object, main).expect("reacquire"));
    let sp = vm.registers().sp;
    vm.push_frame(method, sp, 0, 0, object).expect("push");
    assert_eq!(vm.monitor_view(object).expect("view").depth, 2);

    // The method returns: release through the frame's sync slot.
    let held = vm.frame_sync_obj();
    assert_eq!(held, object);
    vm.pop_frame();
    vm.monitor_release(held).expect("release");
    assert_eq!(vm.monitor_view(object).expect("view").depth, 1);

    // The outer release leaves the monitor cached and free for others.
    vm.monitor_release(object).expect("release");
    assert!(vm.monitor_view(object).is_none());

    let other = spawn_started(&mut vm);
    assert!(vm.monitor_acquire(object, other).expect("other acquires"));
    let view = vm.monitor_view(object).expect("view");
    assert_eq!(view.owner_thread, Some(other));
}

#[test]
fn test_mutual_exclusion_and_fifo_promotion() {
    let mut vm = boot();
    let main = vm.current_thread();
    let object = vm.new_instance(vm.core_object()).expect("object");
    vm.make_permanent_root(object).expect("root");
    let t1 = spawn_started(&mut vm);
    let t2 = spawn_started(&mut vm);

    assert!(vm.monitor_acquire(object, main).expect("main acquires"));
    assert!(!vm.monitor_acquire(object, t1).expect("t1 blocks"));
    assert!(!vm.monitor_acquire(object, t2).expect("t2 blocks"));

    let view = vm.monitor_view(object).expect("view");
    assert_eq!(view.owner_thread, Some(main));
    assert_eq!(view.lock_queue, vec![t1, t2]);
    assert!(!vm.runnable_list().contains(&t1));
    assert!(!vm.runnable_list().contains(&t2));

    // Releasing promotes the queue head, in order.
    vm.monitor_release(object).expect("release");
    let view = vm.monitor_view(object).expect("view");
    assert_eq!(view.owner_thread, Some(t1));
    assert_eq!(view.depth, 1);
    assert_eq!(view.lock_queue, vec![t2]);
    assert!(vm.runnable_list().contains(&t1));
}

#[test]
fn test_lock_depth_zero_means_no_owner() {
    let mut vm = boot();
    let main = vm.current_thread();
    let object = vm.new_instance(vm.core_object()).expect("object");

    for _ in 0..4 {
        vm.monitor_acquire(object, main).expect("acquire");
    }
    for remaining in (0..4).rev() {
        vm.monitor_release(object).expect("release");
        match vm.monitor_view(object) {
            Some(view) => {
                assert_eq!(view.depth, remaining);
                assert_eq!(view.owner_thread, Some(main));
            }
            None => assert_eq!(remaining, 0),
        }
    }
}

#[test]
fn test_wait_hands_the_monitor_to_a_queued_locker() {
    let mut vm = boot();
    let main = vm.current_thread();
    let object = vm.new_instance(vm.core_object()).expect("object");
    vm.make_permanent_root(object).expect("root");
    let t1 = spawn_started(&mut vm);

    // main owns at depth 2; t1 is queued for the lock.
    vm.monitor_acquire(object, main).expect("acquire");
    vm.monitor_acquire(object, main).expect("acquire");
    assert!(!vm.monitor_acquire(object, t1).expect("t1 blocks"));

    // Waiting releases the whole depth and promotes t1.
    vm.monitor_wait(object, 0).expect("wait");
    let view = vm.monitor_view(object).expect("view");
    assert_eq!(view.owner_thread, Some(t1));
    assert_eq!(view.wait_queue, vec![main]);

    // When t1 notifies and releases, main reclaims its full depth.
    while vm.current_thread() != t1 {
        vm.switch_thread().expect("switch");
    }
    vm.monitor_notify(object, false).expect("notify");
    let view = vm.monitor_view(object).expect("view");
    assert_eq!(view.lock_queue, vec![main]);
    vm.monitor_release(object).expect("t1 releases");

    let view = vm.monitor_view(object).expect("view");
    assert_eq!(view.owner_thread, Some(main));
    assert_eq!(view.depth, 2, "the saved depth was restored");
}

#[test]
fn test_wait_by_non_owner_is_illegal() {
    let mut vm = boot();
    let object = vm.new_instance(vm.core_object()).expect("object");
    let t1 = spawn_started(&mut vm);

    // t1 owns; main (current) must not wait or notify.
    assert!(vm.monitor_acquire(object, t1).expect("t1 acquires"));
    let err = vm.monitor_wait(object, 0).unwrap_err();
    assert_eq!(
        err.thrown_kind(),
        Some(bvm_vm::ThrowableKind::IllegalMonitorStateException)
    );
    let err = vm.monitor_notify(object, true).unwrap_err();
    assert_eq!(
        err.thrown_kind(),
        Some(bvm_vm::ThrowableKind::IllegalMonitorStateException)
    );
}
