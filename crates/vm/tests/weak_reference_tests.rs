//! Weak reference clearing semantics.

use bvm_config::VmOptions;
use bvm_vm::{AllocType, Cell, ClassBuilder, MockPlatform, Vm};

fn boot() -> Vm {
    Vm::new(
        VmOptions::with_heap_size(256 * 1024),
        Box::new(MockPlatform::new()),
    )
    .expect("vm boots")
}

#[test]
fn test_retyped_object_becomes_weak_and_clears() {
    let mut vm = boot();

    // A plain one-field object retyped into a weak reference: the field
    // becomes the referent.
    let holder_class = ClassBuilder::new("refs/Holder")
        .super_class(vm.core_object())
        .instance_field("referent", "Ljava/lang/Object;")
        .build(&mut vm)
        .expect("class");
    vm.make_permanent_root(holder_class).expect("root class");

    let target = vm.new_instance(vm.core_object()).expect("target");
    let weak = vm.new_instance(holder_class).expect("holder");
    vm.heap_mut().set_type(weak, AllocType::WeakReference);
    vm.set_object_field(weak, 0, Cell::from_ref(target));
    vm.make_permanent_root(weak).expect("root weak");

    let report = vm.gc().expect("gc");
    assert!(vm.heap().in_use(weak), "the weak reference itself is live");
    assert!(
        vm.object_field(weak, 0).as_ref().is_null(),
        "the referent was only weakly reachable"
    );
    assert_eq!(report.weak_cleared, 1);
    assert!(!vm.heap().in_use(target));
}

#[test]
fn test_strongly_held_referent_is_kept() {
    let mut vm = boot();
    let target = vm.new_instance(vm.core_object()).expect("target");
    let weak = vm.new_weak_reference(target).expect("weak");
    vm.make_permanent_root(weak).expect("root weak");
    vm.make_permanent_root(target).expect("root target");

    let report = vm.gc().expect("gc");
    assert_eq!(vm.weak_referent(weak), target);
    assert_eq!(report.weak_cleared, 0);
}

#[test]
fn test_weak_reference_itself_collects_when_unreachable() {
    let mut vm = boot();
    let target = vm.new_instance(vm.core_object()).expect("target");
    let weak = vm.new_weak_reference(target).expect("weak");
    let _ = weak;

    let report = vm.gc().expect("gc");
    // Both the weak reference and its referent were unreachable.
    assert!(report.chunks_freed >= 2);
}

#[test]
fn test_cleared_referent_stays_null_on_later_cycles() {
    let mut vm = boot();
    let target = vm.new_instance(vm.core_object()).expect("target");
    let weak = vm.new_weak_reference(target).expect("weak");
    vm.make_permanent_root(weak).expect("root");

    vm.gc().expect("gc");
    assert!(vm.weak_referent(weak).is_null());

    let report = vm.gc().expect("gc");
    assert!(vm.weak_referent(weak).is_null());
    assert_eq!(report.weak_cleared, 0);
}
