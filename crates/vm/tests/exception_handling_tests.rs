//! Try/throw/catch and its interaction with scoped transient roots.

use bvm_config::VmOptions;
use bvm_vm::{ExitCode, MockPlatform, ThrowableKind, Vm, VmError, VmResult};

fn boot() -> Vm {
    Vm::new(
        VmOptions::with_heap_size(256 * 1024),
        Box::new(MockPlatform::new()),
    )
    .expect("vm boots")
}

#[test]
fn test_throw_across_transient_blocks_releases_roots() {
    let mut vm = boot();
    let top_at_try = vm.transient_root_top();

    let caught = vm
        .try_catch(
            |vm| -> VmResult<&'static str> {
                vm.transient_scope(|vm| {
                    let r1 = vm.new_instance(vm.core_object())?;
                    vm.make_transient_root(r1)?;
                    let r2 = vm.new_instance(vm.core_object())?;
                    vm.make_transient_root(r2)?;
                    assert_eq!(vm.transient_root_top(), top_at_try + 2);
                    Err(vm.raise(ThrowableKind::IllegalArgumentException))
                })
            },
            |vm, thrown| {
                assert!(!thrown.is_null());
                Ok("caught")
            },
        )
        .expect("catch ran");
    assert_eq!(caught, "caught");
    assert_eq!(vm.transient_root_top(), top_at_try);
}

#[test]
fn test_nested_blocks_unwind_to_the_surrounding_try() {
    let mut vm = boot();
    let top_at_try = vm.transient_root_top();

    vm.try_catch(
        |vm| -> VmResult<()> {
            vm.transient_scope(|vm| {
                let a = vm.new_instance(vm.core_object())?;
                vm.make_transient_root(a)?;
                vm.transient_scope(|vm| {
                    let b = vm.new_instance(vm.core_object())?;
                    vm.make_transient_root(b)?;
                    vm.transient_scope(|vm| {
                        let c = vm.new_instance(vm.core_object())?;
                        vm.make_transient_root(c)?;
                        Err(vm.raise(ThrowableKind::ArithmeticException))
                    })
                })
            })
        },
        |_vm, _thrown| Ok(()),
    )
    .expect("caught");
    assert_eq!(vm.transient_root_top(), top_at_try);
}

#[test]
fn test_normal_exit_also_restores_the_top() {
    let mut vm = boot();
    let top_before = vm.transient_root_top();
    let value = vm
        .transient_scope(|vm| {
            for _ in 0..5 {
                let r = vm.new_instance(vm.core_object())?;
                vm.make_transient_root(r)?;
            }
            Ok(17)
        })
        .expect("scope");
    assert_eq!(value, 17);
    assert_eq!(vm.transient_root_top(), top_before);
}

#[test]
fn test_nested_try_rethrow_reaches_outer_catch() {
    let mut vm = boot();
    let result = vm
        .try_catch(
            |vm| -> VmResult<u32> {
                vm.try_catch(
                    |vm| -> VmResult<u32> {
                        Err(vm.raise(ThrowableKind::ClassCastException))
                    },
                    // The inner catch rethrows.
                    |_vm, thrown| Err(VmError::throw(thrown)),
                )
            },
            |_vm, _thrown| Ok(99),
        )
        .expect("outer catch");
    assert_eq!(result, 99);
}

#[test]
fn test_fatal_errors_pass_through_catch() {
    let mut vm = boot();
    let result = vm.try_catch(
        |_vm| -> VmResult<()> {
            Err(Vm::vm_exit(ExitCode::InvalidChunk, "corrupt header"))
        },
        |_vm, _thrown| Ok(()),
    );
    assert!(matches!(
        result,
        Err(VmError::Exit {
            code: ExitCode::InvalidChunk,
            ..
        })
    ));
}

#[test]
fn test_exit_frame_reports_the_code() {
    let mut vm = boot();
    let (code, message) = vm.with_exit_frame(|vm| -> VmResult<()> {
        vm.try_catch(
            |_vm| Err(Vm::vm_exit(ExitCode::NoRunnableThreads, "deadlock")),
            |_vm, _thrown| Ok(()),
        )
    });
    assert_eq!(code, ExitCode::NoRunnableThreads);
    assert_eq!(message.as_deref(), Some("deadlock"));
}

#[test]
fn test_thrown_object_is_the_raised_instance() {
    let mut vm = boot();
    vm.try_catch(
        |vm| -> VmResult<()> { Err(vm.raise(ThrowableKind::NullPointerException)) },
        |vm, thrown| {
            let class = vm.object_class(thrown);
            let expected = vm
                .get_class(bvm_vm::Ref::NULL, "java/lang/NullPointerException")
                .expect("registered");
            assert_eq!(class, expected);
            Ok(())
        },
    )
    .expect("caught");
}
