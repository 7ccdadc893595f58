//! # Babe Virtual Machine (BVM)
//!
//! The core of a class-file-based, stack-oriented bytecode virtual machine
//! for small systems: one contiguous fixed-size heap, cooperative green
//! threads above the OS, no native threads, no dynamic linking.
//!
//! ## Architecture
//!
//! The core is organized around a handful of tightly interwoven subsystems:
//!
//! - **Heap**: a single owning arena with coalescing best-fit allocation;
//!   every chunk header carries an in-use bit, a tri-colour GC mark, a
//!   4-bit allocation type and a 24-bit size
//! - **Garbage collector**: tri-colour mark-and-sweep with conservative
//!   thread-stack scanning, weak-reference clearing and class unloading
//! - **Root stacks**: permanent and scoped-transient GC roots, the latter
//!   rewound by the try/throw/catch protocol on every unwind
//! - **Threads and scheduler**: green threads with round-robin slices
//!   measured in bytecodes, a runnable list and a timed callback list
//! - **Monitors**: per-object synchronization with reentrant depth, lock
//!   and wait queues, and record reuse through a free-list cache
//! - **Frames**: linked stack segments holding a 7-cell return-info block,
//!   locals and operand stack per invocation, dispatched through one
//!   global register set
//!
//! ## Example
//!
//! ```rust,no_run
//! use bvm_vm::{SystemPlatform, Vm};
//! use bvm_config::VmOptions;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = VmOptions::with_heap_size(1024 * 1024);
//! let mut vm = Vm::new(options, Box::new(SystemPlatform))?;
//!
//! let greeting = vm.intern_string("hello")?;
//! let report = vm.gc()?;
//! println!("freed {} chunks", report.chunks_freed);
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

/// The universal cell and arena handles
pub mod cell;
/// Chunk header encoding: in-use bit, colour, type, size
pub mod chunk;
/// Class, field and method descriptor layouts
pub mod class;
/// Programmatic class construction into the arena
pub mod class_builder;
/// VM error types, exit codes and the throwable taxonomy
pub mod error;
/// Execution registers, stack segments and the frame protocol
pub mod frame;
/// The tri-colour mark-and-sweep collector
pub mod gc;
/// The fixed-size arena and its allocator
pub mod heap;
/// Monitors: acquire/release/wait/notify
pub mod monitor;
/// Language-object allocation over the arena
pub mod objects;
/// Clock and console abstraction
pub mod platform;
/// Bucketed UTF-string and native-method pools
pub mod pools;
/// Permanent and transient GC-root stacks
pub mod roots;
/// The green-thread scheduler
pub mod scheduler;
/// Shared helpers for unit tests
#[cfg(test)]
pub(crate) mod testutil;
/// VM thread records and the thread table
pub mod thread;
/// The VM aggregate and its cross-cutting protocols
pub mod vm;

pub use cell::{Cell, CellAddr, Ref};
pub use chunk::{AllocType, ChunkHeader, Colour};
pub use class::{
    Class, ClassPool, ClassState, Field, FieldFlags, Method, MethodAddr, MethodFlags,
    PrimitiveKind,
};
pub use class_builder::{ClassBuilder, HandlerDecl, MethodDecl};
pub use error::{BootError, ExitCode, ThrowableKind, VmError, VmResult};
pub use frame::{FrameView, Registers, TERMINAL_PC};
pub use gc::GcReport;
pub use heap::{Heap, HeapStats};
pub use monitor::{Monitor, MonitorTable, MonitorView};
pub use platform::{MockPlatform, Platform, SystemPlatform};
pub use pools::{NativeMethod, NativeMethodPool, UtfPool};
pub use roots::{RootStacks, TransientMark};
pub use scheduler::SchedulerState;
pub use thread::{StatusMods, ThreadId, ThreadStatus, VmThread, WakeCallback};
pub use vm::Vm;
