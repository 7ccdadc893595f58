//! Scheduler integration: list invariants, wait/notifyAll round trips,
//! timed sleep with interrupt, and uncaught-exception delivery.

use bvm_config::VmOptions;
use bvm_vm::{
    ClassBuilder, MethodDecl, MockPlatform, Platform, ThreadId, ThreadStatus, ThrowableKind, Vm,
};
use std::rc::Rc;

fn boot() -> (Vm, Rc<MockPlatform>) {
    let clock = Rc::new(MockPlatform::new());
    let vm = Vm::new(
        VmOptions::with_heap_size(256 * 1024),
        Box::new(clock.clone()),
    )
    .expect("vm boots");
    (vm, clock)
}

fn spawn_started(vm: &mut Vm) -> ThreadId {
    let object = vm.new_instance(vm.core_thread()).expect("thread object");
    let thread = vm.create_vmthread(object).expect("vmthread");
    vm.start_thread(thread, true).expect("start");
    thread
}

fn run_until_current(vm: &mut Vm, target: ThreadId) {
    for _ in 0..32 {
        if vm.current_thread() == target {
            return;
        }
        vm.switch_thread().expect("switch");
    }
    panic!("thread {target} never became current");
}

fn assert_list_invariants(vm: &Vm) {
    let runnable = vm.runnable_list();
    let callbacks = vm.callback_list();
    for thread in &runnable {
        assert!(
            !callbacks.contains(thread),
            "thread {thread} on both runnable and callback lists"
        );
        let (status, _) = vm.thread_status(*thread);
        assert_eq!(status, ThreadStatus::Runnable);
    }
    for thread in vm.all_threads() {
        let (status, _) = vm.thread_status(thread);
        if matches!(status, ThreadStatus::New | ThreadStatus::Terminated) {
            assert!(!runnable.contains(&thread));
            assert!(!callbacks.contains(&thread));
        }
    }
}

#[test]
fn test_list_invariants_hold_across_operations() {
    let (mut vm, clock) = boot();
    let main = vm.current_thread();
    let t1 = spawn_started(&mut vm);
    let t2 = spawn_started(&mut vm);
    assert_list_invariants(&vm);

    let object = vm.new_instance(vm.core_object()).expect("object");
    vm.make_permanent_root(object).expect("root");

    // Sleep, contention, waiting: the invariants hold at every step.
    vm.monitor_acquire(object, main).expect("acquire");
    vm.monitor_acquire(object, t1).expect("t1 queues");
    assert_list_invariants(&vm);

    vm.monitor_release(object).expect("release");
    assert_list_invariants(&vm);

    run_until_current(&mut vm, t2);
    vm.sleep_current(50).expect("sleep");
    assert_list_invariants(&vm);

    clock.advance_ms(60);
    vm.switch_thread().expect("switch");
    assert_list_invariants(&vm);
}

#[test]
fn test_wait_notify_all_round_trip() {
    let (mut vm, _clock) = boot();
    let main = vm.current_thread();
    let object = vm.new_instance(vm.core_object()).expect("object");
    vm.make_permanent_root(object).expect("root");

    let workers = [
        spawn_started(&mut vm),
        spawn_started(&mut vm),
        spawn_started(&mut vm),
    ];

    // Each worker takes the lock and waits, in order.
    for &worker in &workers {
        run_until_current(&mut vm, worker);
        assert!(vm.monitor_acquire(object, worker).expect("acquire"));
        vm.monitor_wait(object, 0).expect("wait");
    }
    let view = vm.monitor_view(object).expect("view");
    assert_eq!(view.wait_queue, workers.to_vec());
    assert!(view.owner_thread.is_none());

    // The main thread holds the lock, notifies all, then releases.
    run_until_current(&mut vm, main);
    assert!(vm.monitor_acquire(object, main).expect("acquire"));
    vm.monitor_notify(object, true).expect("notifyAll");

    // While main still owns, every worker sits in the lock queue.
    let view = vm.monitor_view(object).expect("view");
    assert_eq!(view.owner_thread, Some(main));
    assert_eq!(view.lock_queue, workers.to_vec());
    assert!(view.wait_queue.is_empty());

    vm.monitor_release(object).expect("release");

    // Exactly one worker owns; the rest stay queued.
    let view = vm.monitor_view(object).expect("view");
    assert_eq!(view.owner_thread, Some(workers[0]));
    assert_eq!(view.lock_queue, vec![workers[1], workers[2]]);

    // Each owner completes and hands the lock on; nobody faults.
    for index in 0..workers.len() {
        let owner = vm
            .monitor_view(object)
            .expect("view")
            .owner_thread
            .expect("an owner");
        assert_eq!(owner, workers[index]);
        run_until_current(&mut vm, owner);
        vm.monitor_release(object).expect("release");
    }
    assert!(vm.monitor_view(object).is_none());
}

#[test]
fn test_timed_sleep_with_interrupt() {
    let (mut vm, clock) = boot();
    let main = vm.current_thread();
    let t1 = spawn_started(&mut vm);

    // t1 goes to sleep for ten seconds.
    run_until_current(&mut vm, t1);
    vm.sleep_current(10_000).expect("sleep");
    assert!(vm.callback_list().contains(&t1));

    // At t = 100 ms the main thread interrupts it.
    run_until_current(&mut vm, main);
    clock.advance_ms(100);
    vm.interrupt_thread(t1).expect("interrupt");

    // The interruption arrives as InterruptedException when t1 is next
    // scheduled, long before the ten seconds elapse.
    let mut delivered = false;
    for _ in 0..16 {
        match vm.switch_thread() {
            Ok(()) => {}
            Err(error) => {
                assert_eq!(
                    error.thrown_kind(),
                    Some(ThrowableKind::InterruptedException)
                );
                assert_eq!(vm.current_thread(), t1);
                delivered = true;
                break;
            }
        }
    }
    assert!(delivered);
    assert!(clock.system_time_ms() < 10_000, "woke early");
    assert!(!vm.is_interrupted(t1), "the flag cleared with the throw");
}

#[test]
fn test_timed_wait_resumes_after_timeout() {
    let (mut vm, clock) = boot();
    let main = vm.current_thread();
    let _other = spawn_started(&mut vm);
    let object = vm.new_instance(vm.core_object()).expect("object");
    vm.make_permanent_root(object).expect("root");

    vm.monitor_acquire(object, main).expect("acquire");
    vm.monitor_wait(object, 200).expect("timed wait");
    assert!(vm.callback_list().contains(&main));

    // Before the deadline nothing moves it.
    vm.switch_thread().expect("switch");
    assert!(vm.callback_list().contains(&main));

    // After the deadline the waiter reclaims the (free) monitor.
    clock.advance_ms(250);
    vm.switch_thread().expect("switch");
    let view = vm.monitor_view(object).expect("view");
    assert_eq!(view.owner_thread, Some(main));
    assert!(vm.runnable_list().contains(&main));
}

#[test]
fn test_priority_scales_the_slice() {
    let (mut vm, _clock) = boot();
    let t1 = spawn_started(&mut vm);
    vm.set_priority(t1, bvm_config::PRIORITY_MAX);

    run_until_current(&mut vm, t1);
    let high = vm.slice_remaining();

    let t2 = spawn_started(&mut vm);
    vm.set_priority(t2, bvm_config::PRIORITY_MIN);
    run_until_current(&mut vm, t2);
    let low = vm.slice_remaining();

    assert_eq!(
        high / low,
        bvm_config::PRIORITY_MAX / bvm_config::PRIORITY_MIN
    );
}

#[test]
fn test_uncaught_exception_with_handler_pushes_its_frame() {
    let (mut vm, _clock) = boot();

    // A Thread subclass declaring dispatchUncaughtException.
    let subclass = ClassBuilder::new("app/GuardedThread")
        .super_class(vm.core_thread())
        .method(
            MethodDecl::new("dispatchUncaughtException", "(Ljava/lang/Throwable;)V")
                .bytecode(vec![0xb1])
                .max_stack(2)
                .max_locals(2),
        )
        .build(&mut vm)
        .expect("class");
    vm.make_permanent_root(subclass).expect("root");

    let object = vm.new_instance(subclass).expect("thread object");
    let guarded = vm.create_vmthread(object).expect("vmthread");
    vm.start_thread(guarded, true).expect("start");
    run_until_current(&mut vm, guarded);

    let thrown = vm
        .new_throwable(ThrowableKind::ArithmeticException)
        .expect("throwable");
    let handled = vm.dispatch_uncaught_exception(thrown).expect("dispatch");
    assert!(handled);
    assert!(vm.is_alive(guarded));

    // The handler frame sits on top with receiver and throwable as locals.
    let mut top_locals = None;
    vm.visit_frames(guarded, 0, 1, |frame| {
        top_locals = Some(frame.locals);
        true
    });
    let locals = top_locals.expect("a frame");
    assert_eq!(vm.heap().cell(locals + 4).as_ref(), thrown);
}

#[test]
fn test_uncaught_exception_without_handler_terminates_the_thread() {
    let (mut vm, _clock) = boot();
    let plain = spawn_started(&mut vm);
    run_until_current(&mut vm, plain);

    let thrown = vm
        .new_throwable(ThrowableKind::ArithmeticException)
        .expect("throwable");
    let handled = vm.dispatch_uncaught_exception(thrown).expect("dispatch");
    assert!(!handled);
    let (status, _) = vm.thread_status(plain);
    assert_eq!(status, ThreadStatus::Terminated);

    // Only the offending thread died; the VM still has its main thread.
    assert!(!vm.should_exit());
}
