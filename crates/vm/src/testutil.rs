//! Shared helpers for in-crate unit tests.

use crate::platform::MockPlatform;
use crate::vm::Vm;
use bvm_config::VmOptions;

/// A freshly booted VM over a mock platform and a 256 KiB heap.
pub(crate) fn test_vm() -> Vm {
    let options = VmOptions::with_heap_size(256 * 1024);
    Vm::new(options, Box::new(MockPlatform::new())).expect("vm boots")
}

/// A freshly booted VM with a caller-chosen heap size.
pub(crate) fn test_vm_with_heap(heap_size: usize) -> Vm {
    let options = VmOptions::with_heap_size(heap_size);
    Vm::new(options, Box::new(MockPlatform::new())).expect("vm boots")
}

/// A freshly booted VM plus a handle to its mock clock.
pub(crate) fn test_vm_with_clock() -> (Vm, std::rc::Rc<MockPlatform>) {
    let clock = std::rc::Rc::new(MockPlatform::new());
    let options = VmOptions::with_heap_size(256 * 1024);
    let vm = Vm::new(options, Box::new(clock.clone())).expect("vm boots");
    (vm, clock)
}
