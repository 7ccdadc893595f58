//! The VM aggregate: one structure owning the heap, the root stacks, the
//! pools, the monitor and thread tables, and the global execution
//! registers.
//!
//! This module also carries the two cross-cutting protocols everything else
//! leans on: allocation with the collect-once-and-retry rule, and the
//! try/throw/catch discipline that keeps the transient root stack balanced
//! across every exit path.

use crate::cell::Ref;
use crate::chunk::{AllocType, CHUNK_HEADER_BYTES};
use crate::class::{ClassPool, MethodAddr, PrimitiveKind};
use crate::class_builder::{self, ClassBuilder, MethodDecl};
use crate::error::{BootError, ExitCode, ThrowableKind, VmError, VmResult};
use crate::frame::Registers;
use crate::heap::Heap;
use crate::monitor::MonitorTable;
use crate::platform::Platform;
use crate::pools::{NativeMethod, NativeMethodPool, UtfPool};
use crate::roots::RootStacks;
use crate::scheduler::SchedulerState;
use crate::thread::{ThreadId, ThreadTable};
use bvm_config::{VmOptions, PRIORITY_NORMAL};
use hashbrown::HashMap;

/// Handles to the classes the core itself depends on, created at bootstrap
/// and pinned as permanent roots.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CoreClasses {
    pub object: Ref,
    pub string: Ref,
    pub char_array: Ref,
    pub thread: Ref,
    pub weak_reference: Ref,
}

/// The Babe VM.
pub struct Vm {
    pub(crate) options: VmOptions,
    pub(crate) platform: Box<dyn Platform>,
    pub(crate) heap: Heap,
    pub(crate) roots: RootStacks,
    pub(crate) utf_pool: UtfPool,
    pub(crate) native_pool: NativeMethodPool,
    pub(crate) class_pool: ClassPool,
    /// Interned String objects by their UTF bytes; never collected
    pub(crate) interned_strings: HashMap<Vec<u8>, Ref>,
    pub(crate) monitors: MonitorTable,
    pub(crate) threads: ThreadTable,
    pub(crate) sched: SchedulerState,
    /// The global register set the interpreter dispatches through
    pub(crate) regs: Registers,
    pub(crate) core: CoreClasses,
    pub(crate) throwable_classes: HashMap<ThrowableKind, Ref>,
    /// Built at startup so it can be thrown with the heap exhausted
    pub(crate) prebuilt_oom: Ref,
    /// Planted as the pending exception by interrupt
    pub(crate) prebuilt_interrupted: Ref,
    /// The sentinel method of the callback wedge frame
    pub(crate) wedge_method: MethodAddr,
    /// Extra roots registered while a debug session is open
    pub(crate) debug_roots: Vec<Ref>,
}

impl Vm {
    /// Builds and bootstraps a VM: heap, pools, core classes, prebuilt
    /// throwables, and the single bootstrap thread (current, RUNNABLE, with
    /// only the callback wedge on its stack).
    pub fn new(options: VmOptions, platform: Box<dyn Platform>) -> Result<Vm, BootError> {
        options.validate()?;
        let heap = Heap::new(options.heap_size)?;
        let roots = RootStacks::new(options.permanent_root_depth, options.transient_root_depth);
        let utf_pool = UtfPool::new(options.utf_buckets);
        let native_pool = NativeMethodPool::new(options.native_buckets);

        let mut vm = Vm {
            heap,
            roots,
            utf_pool,
            native_pool,
            class_pool: ClassPool::new(),
            interned_strings: HashMap::new(),
            monitors: MonitorTable::new(),
            threads: ThreadTable::new(),
            sched: SchedulerState::new(),
            regs: Registers::default(),
            core: CoreClasses::default(),
            throwable_classes: HashMap::new(),
            prebuilt_oom: Ref::NULL,
            prebuilt_interrupted: Ref::NULL,
            wedge_method: 0,
            debug_roots: Vec::new(),
            platform,
            options,
        };
        vm.bootstrap()?;
        Ok(vm)
    }

    fn bootstrap(&mut self) -> VmResult<()> {
        self.wedge_method = class_builder::build_wedge_method(self)?;

        let object = ClassBuilder::new("java/lang/Object").build(self)?;
        self.core.object = object;
        self.roots.push_permanent(object)?;

        let string = ClassBuilder::new("java/lang/String")
            .super_class(object)
            .build(self)?;
        self.core.string = string;
        self.roots.push_permanent(string)?;

        let char_array = class_builder::build_primitive_array_class(self, PrimitiveKind::Char)?;
        self.core.char_array = char_array;
        self.roots.push_permanent(char_array)?;

        let thread = ClassBuilder::new("java/lang/Thread")
            .super_class(object)
            .instance_field("target", "Ljava/lang/Runnable;")
            .instance_field("name", "Ljava/lang/String;")
            .instance_field("priority", "I")
            .instance_field("daemon", "Z")
            .method(
                MethodDecl::new("run", "()V")
                    .bytecode(vec![0xb1]) // return
                    .max_stack(1)
                    .max_locals(1),
            )
            .build(self)?;
        self.core.thread = thread;
        self.roots.push_permanent(thread)?;

        let weak_reference = ClassBuilder::new("java/lang/ref/WeakReference")
            .super_class(object)
            .instance_field("referent", "Ljava/lang/Object;")
            .build(self)?;
        self.core.weak_reference = weak_reference;
        self.roots.push_permanent(weak_reference)?;

        for &kind in ThrowableKind::all() {
            let class = ClassBuilder::new(kind.class_name())
                .super_class(object)
                .build(self)?;
            self.throwable_classes.insert(kind, class);
            self.roots.push_permanent(class)?;
        }

        self.prebuilt_oom = self.new_throwable(ThrowableKind::OutOfMemoryError)?;
        self.roots.push_permanent(self.prebuilt_oom)?;
        self.prebuilt_interrupted = self.new_throwable(ThrowableKind::InterruptedException)?;
        self.roots.push_permanent(self.prebuilt_interrupted)?;

        // The one thread every VM starts with.
        let thread_object = self.new_instance(self.core.thread)?;
        let bootstrap = self.create_vmthread(thread_object)?;
        self.threads.get_mut(bootstrap).priority = PRIORITY_NORMAL;
        self.start_thread(bootstrap, false)?;
        log::debug!(
            "bootstrap complete: {} classes, heap {} bytes",
            self.class_pool.len(),
            self.heap.capacity()
        );
        Ok(())
    }

    // ---- allocation ------------------------------------------------------

    /// Allocates through the shared heap. On failure the collector runs
    /// exactly once and the allocation is retried; a second failure throws
    /// the prebuilt OutOfMemoryError. Requests that could never fit the
    /// heap are fatal.
    pub fn allocate(&mut self, size: usize, alloc_type: AllocType) -> VmResult<Ref> {
        if size as u64 + u64::from(CHUNK_HEADER_BYTES) > u64::from(self.heap.capacity()) {
            return Err(VmError::exit(
                ExitCode::OutOfMemory,
                format!("request of {size} bytes exceeds the whole heap"),
            ));
        }
        if let Some(reference) = self.heap.alloc(size, alloc_type) {
            return Ok(reference);
        }
        log::debug!("allocation of {size} bytes failed; running the collector");
        self.gc()?;
        if let Some(reference) = self.heap.alloc(size, alloc_type) {
            return Ok(reference);
        }
        Err(VmError::throw_kind(
            self.prebuilt_oom,
            ThrowableKind::OutOfMemoryError,
        ))
    }

    /// [`Vm::allocate`], zeroing the payload.
    pub fn allocate_zeroed(&mut self, size: usize, alloc_type: AllocType) -> VmResult<Ref> {
        let reference = self.allocate(size, alloc_type)?;
        let len = self.heap.chunk_size(reference) as usize;
        self.heap.bytes_mut(reference, len).fill(0);
        Ok(reference)
    }

    /// Duplicates a chunk with the collect-once-and-retry rule.
    pub fn clone_chunk(&mut self, reference: Ref) -> VmResult<Ref> {
        if let Some(copy) = self.heap.clone_chunk(reference)? {
            return Ok(copy);
        }
        self.gc()?;
        if let Some(copy) = self.heap.clone_chunk(reference)? {
            return Ok(copy);
        }
        Err(VmError::throw_kind(
            self.prebuilt_oom,
            ThrowableKind::OutOfMemoryError,
        ))
    }

    /// Frees a chunk explicitly. The only way STATIC chunks are released.
    pub fn free(&mut self, reference: Ref) -> VmResult<()> {
        self.heap.free(reference)?;
        Ok(())
    }

    /// Shared heap accessor for collaborators and tests.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutable heap access for the interpreter loop and the class loader.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Current transient-root stack top, for invariant checks.
    pub fn transient_root_top(&self) -> usize {
        self.roots.transient_top()
    }

    /// Current permanent-root stack top.
    pub fn permanent_root_top(&self) -> usize {
        self.roots.permanent_top()
    }

    /// A thread's base status and modifier bits.
    pub fn thread_status(&self, thread: crate::thread::ThreadId) -> (crate::thread::ThreadStatus, crate::thread::StatusMods) {
        let record = self.threads.get(thread);
        (record.status, record.mods)
    }

    /// Marks a NEW thread as a daemon; daemons do not keep the VM alive.
    pub fn set_daemon(&mut self, thread: crate::thread::ThreadId, daemon: bool) {
        self.threads.get_mut(thread).daemon = daemon;
    }

    /// Sets a thread's priority; its timeslice scales with it.
    pub fn set_priority(&mut self, thread: crate::thread::ThreadId, priority: u32) {
        self.threads.get_mut(thread).priority = priority;
    }

    // ---- roots and the try/throw/catch protocol --------------------------

    /// Registers a root for the life of the VM.
    pub fn make_permanent_root(&mut self, reference: Ref) -> VmResult<()> {
        self.roots.push_permanent(reference)
    }

    /// Registers a root for the current transient block.
    pub fn make_transient_root(&mut self, reference: Ref) -> VmResult<()> {
        self.roots.push_transient(reference)
    }

    /// Runs `f` inside a scoped transient block: the transient top is
    /// snapshotted on entry and restored on every exit path.
    pub fn transient_scope<T>(
        &mut self,
        f: impl FnOnce(&mut Vm) -> VmResult<T>,
    ) -> VmResult<T> {
        let mark = self.roots.mark_transient();
        let result = f(self);
        self.roots.release_transient(mark);
        result
    }

    /// A language-level try block. `body` runs first; if it throws, the
    /// transient top is restored to its value at try entry (releasing every
    /// root pushed since, however many scoped blocks were open) and `catch`
    /// runs with the throwable, which stays rooted for the catch's
    /// duration. Fatal VM errors pass straight through.
    pub fn try_catch<T>(
        &mut self,
        body: impl FnOnce(&mut Vm) -> VmResult<T>,
        catch: impl FnOnce(&mut Vm, Ref) -> VmResult<T>,
    ) -> VmResult<T> {
        let mark = self.roots.mark_transient();
        match body(self) {
            Ok(value) => {
                self.roots.release_transient(mark);
                Ok(value)
            }
            Err(VmError::Throw { object, .. }) => {
                self.roots.release_transient(mark);
                self.roots.push_transient(object)?;
                let result = catch(self, object);
                self.roots.release_transient(mark);
                result
            }
            Err(fatal @ VmError::Exit { .. }) => Err(fatal),
        }
    }

    /// The outermost VM-exit frame. Maps a normal return to
    /// [`ExitCode::Success`], a `vm_exit` to its code, and a throwable that
    /// reached this frame to an uncaught-exception exit. Prints to the
    /// console either way.
    pub fn with_exit_frame<T>(
        &mut self,
        f: impl FnOnce(&mut Vm) -> VmResult<T>,
    ) -> (ExitCode, Option<String>) {
        match f(self) {
            Ok(_) => (ExitCode::Success, None),
            Err(VmError::Exit { code, message }) => {
                self.platform
                    .console_line(&format!("VM exit {}: {message}", code.code()));
                (code, Some(message))
            }
            Err(VmError::Throw { kind, .. }) => {
                let message = match kind {
                    Some(kind) => format!("uncaught {}", kind.class_name()),
                    None => "uncaught exception".to_owned(),
                };
                self.platform.console_line(&message);
                (ExitCode::UncaughtException, Some(message))
            }
        }
    }

    /// Raises a fatal VM error: unwinds to the outermost exit frame.
    pub fn vm_exit(code: ExitCode, message: impl Into<String>) -> VmError {
        VmError::exit(code, message)
    }

    // ---- throwables ------------------------------------------------------

    /// Allocates a fresh instance of a core throwable class.
    pub fn new_throwable(&mut self, kind: ThrowableKind) -> VmResult<Ref> {
        let class = self
            .throwable_classes
            .get(&kind)
            .copied()
            .ok_or_else(|| {
                VmError::exit(
                    ExitCode::InvalidChunk,
                    format!("throwable class missing for {kind:?}"),
                )
            })?;
        self.new_instance(class)
    }

    /// Builds the error value that raises `kind`. When even the instance
    /// allocation fails, the failure (OOM) is raised instead.
    pub fn raise(&mut self, kind: ThrowableKind) -> VmError {
        match self.new_throwable(kind) {
            Ok(object) => VmError::throw_kind(object, kind),
            Err(error) => error,
        }
    }

    /// The prebuilt OutOfMemoryError instance.
    pub fn prebuilt_oom(&self) -> Ref {
        self.prebuilt_oom
    }

    /// The prebuilt InterruptedException instance.
    pub fn prebuilt_interrupted(&self) -> Ref {
        self.prebuilt_interrupted
    }

    // ---- pools and collaborator seams ------------------------------------

    /// Interns a UTF byte string, allocating a pooled STATIC entry on first
    /// sight.
    pub fn intern_utf(&mut self, bytes: &[u8]) -> VmResult<Ref> {
        if let Some(entry) = self.utf_pool.find(&self.heap, bytes) {
            return Ok(entry);
        }
        let entry = self.allocate(UtfPool::entry_size(bytes), AllocType::Static)?;
        self.utf_pool.insert(&mut self.heap, entry, bytes);
        Ok(entry)
    }

    /// Looks up a loaded class by loader and name; the class-loader
    /// collaborator populates the pool through [`ClassBuilder`].
    pub fn get_class(&self, loader: Ref, name: &str) -> Option<Ref> {
        self.class_pool.get(loader, name.as_bytes())
    }

    /// Registers a native method body.
    pub fn register_native(
        &mut self,
        class: Ref,
        name: &str,
        signature: &str,
        method: NativeMethod,
    ) {
        self.native_pool.register(class, name, signature, method);
    }

    /// Looks up a native method body.
    pub fn native_method(&self, class: Ref, name: &str, signature: &str) -> Option<NativeMethod> {
        self.native_pool.get(class, name, signature)
    }

    /// Installs the debugger's extra root set; the GC walks it while a
    /// session is open. An empty set detaches.
    pub fn set_debug_roots(&mut self, roots: Vec<Ref>) {
        self.debug_roots = roots;
    }

    /// The sentinel method of the callback wedge at every stack base.
    pub fn wedge_method(&self) -> MethodAddr {
        self.wedge_method
    }

    /// The root class, `java/lang/Object`.
    pub fn core_object(&self) -> Ref {
        self.core.object
    }

    /// The `java/lang/String` class.
    pub fn core_string(&self) -> Ref {
        self.core.string
    }

    /// The `[C` class backing string contents.
    pub fn core_char_array(&self) -> Ref {
        self.core.char_array
    }

    /// The `java/lang/Thread` class.
    pub fn core_thread(&self) -> Ref {
        self.core.thread
    }

    /// The `java/lang/ref/WeakReference` class.
    pub fn core_weak_reference(&self) -> Ref {
        self.core.weak_reference
    }

    /// The bootstrap thread, current after [`Vm::new`].
    pub fn current_thread(&self) -> ThreadId {
        self.sched.current
    }

    /// The global register set, for the interpreter loop.
    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    /// Mutable global registers, for the interpreter loop.
    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }
}
