//! The green-thread scheduler.
//!
//! All language threads share one interpreter loop and one register set;
//! switches happen at bytecode boundaries when the slice counter runs out.
//! Three thread lists exist: the global list (every thread, insertion
//! order, pruned of terminated records by the collector), the runnable
//! list, and the callback list of blocked threads scheduled to wake at a
//! wall-clock instant. A thread is never on more than one of the runnable
//! and callback lists.

use crate::cell::Cell;
use crate::cell::Ref;
use crate::class::{Class, Method, MethodFlags};
use crate::error::{ExitCode, ThrowableKind, VmError, VmResult};
use crate::frame::{frame_slots, Registers, TERMINAL_PC};
use crate::thread::{StatusMods, ThreadId, ThreadStatus, WakeCallback};
use crate::vm::Vm;

/// The scheduler's global state.
#[derive(Debug)]
pub struct SchedulerState {
    /// The thread whose registers are live in the globals
    pub current: ThreadId,
    /// Bytecodes remaining in the current slice
    pub slice_remaining: u32,
    /// Global list head (every thread, insertion order)
    pub all_head: Option<ThreadId>,
    /// Runnable list head
    pub runnable_head: Option<ThreadId>,
    /// Callback list head
    pub callback_head: Option<ThreadId>,
    /// Started and not yet terminated threads
    pub active_threads: u32,
    /// Of those, non-daemon threads; the VM exits when this reaches zero
    pub non_daemon_threads: u32,
}

impl SchedulerState {
    /// Fresh state, before the bootstrap thread exists.
    pub fn new() -> Self {
        Self {
            current: 0,
            slice_remaining: 0,
            all_head: None,
            runnable_head: None,
            callback_head: None,
            active_threads: 0,
            non_daemon_threads: 0,
        }
    }
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    // ---- lifecycle -------------------------------------------------------

    /// Creates a NEW VM thread paired with `thread_object` and appends it
    /// to the global list.
    pub fn create_vmthread(&mut self, thread_object: Ref) -> VmResult<ThreadId> {
        let id = self
            .threads
            .create(thread_object, bvm_config::PRIORITY_NORMAL);
        match self.sched.all_head {
            None => self.sched.all_head = Some(id),
            Some(head) => {
                let mut tail = head;
                while let Some(next) = self.threads.get(tail).next {
                    tail = next;
                }
                self.threads.get_mut(tail).next = Some(id);
            }
        }
        Ok(id)
    }

    /// Starts a NEW thread: builds its callback-wedge base frame and,
    /// when `push_run` is set, the frame for its resolved `run()` method.
    /// A synchronized `run` contends for the thread object's monitor here;
    /// losing leaves the thread queued with a saved lock depth of one so
    /// promotion starts it later.
    pub fn start_thread(&mut self, thread: ThreadId, push_run: bool) -> VmResult<()> {
        if self.threads.get(thread).status != ThreadStatus::New {
            return Err(self.raise(ThrowableKind::IllegalThreadStateException));
        }

        // Work on the new thread's registers, restoring the caller's after.
        let caller = self.sched.current;
        self.threads.get_mut(caller).regs = self.regs;
        self.regs = Registers::default();

        let result = self.build_initial_frames(thread, push_run);

        self.threads.get_mut(thread).regs = self.regs;
        self.regs = self.threads.get(caller).regs;
        result?;

        self.sched.active_threads += 1;
        if !self.threads.get(thread).daemon {
            self.sched.non_daemon_threads += 1;
        }
        log::debug!(
            "thread {thread} started (push_run={push_run}), {} active",
            self.sched.active_threads
        );
        Ok(())
    }

    fn build_initial_frames(&mut self, thread: ThreadId, push_run: bool) -> VmResult<()> {
        // The wedge frame closes the stack: dropping through to it runs the
        // termination callback.
        let segment = self.new_segment(0)?;
        self.threads.get_mut(thread).head_segment = segment;
        let base = self.segment_first_cell(segment);
        let wedge = self.wedge_method();
        self.heap.set_word(base + frame_slots::PC * 4, TERMINAL_PC);
        self.heap.set_word(base + frame_slots::PPC * 4, TERMINAL_PC);
        self.heap.set_word(base + frame_slots::METHOD * 4, wedge);
        self.regs.method = wedge;
        self.regs.pc = TERMINAL_PC;
        self.regs.ppc = TERMINAL_PC;
        self.regs.locals = base + frame_slots::RETURN_INFO_CELLS * 4;
        self.regs.sp = self.regs.locals;
        self.regs.segment = segment;

        let thread_object = self.threads.get(thread).thread_object;
        if push_run {
            let name = self.intern_utf(b"run")?;
            let signature = self.intern_utf(b"()V")?;
            let class = self.object_class(thread_object);
            let run = Class::find_method(&self.heap, class, name, signature)
                .ok_or_else(|| self.raise(ThrowableKind::NoSuchMethodError))?;

            let synchronized =
                Method::flags(&self.heap, run).contains(MethodFlags::SYNCHRONIZED);
            let sync_obj = if synchronized { thread_object } else { Ref::NULL };

            // The receiver travels on the wedge's operand stack into the
            // run frame's first local.
            let restore_sp = self.regs.sp;
            self.heap.set_cell(self.regs.sp, Cell::from_ref(thread_object));
            self.regs.sp += 4;
            self.push_frame(run, restore_sp, TERMINAL_PC, TERMINAL_PC, sync_obj)?;
            self.heap
                .set_cell(self.regs.locals, Cell::from_ref(thread_object));

            if synchronized {
                let contested = self
                    .monitors
                    .index_for(thread_object)
                    .map(|index| {
                        let owner = self.monitors.get(index).owner_thread;
                        owner.is_some() && owner != Some(thread)
                    })
                    .unwrap_or(false);
                if contested {
                    // Queue for the monitor; promotion will start the thread.
                    let index = self.monitors.index_for(thread_object).unwrap_or_default();
                    self.threads.get_mut(thread).saved_lock_depth = 1;
                    self.threads.get_mut(thread).status = ThreadStatus::Blocked;
                    self.lock_enqueue(index, thread);
                    return Ok(());
                }
                self.monitor_acquire(thread_object, thread)?;
            }
        }
        self.threads.get_mut(thread).status = ThreadStatus::Blocked;
        self.resume_thread(thread)?;
        Ok(())
    }

    /// The termination callback: runs when execution drops through to the
    /// wedge frame of the current thread.
    pub fn on_thread_terminated(&mut self) -> VmResult<()> {
        let thread = self.sched.current;
        debug_assert_eq!(self.threads.get(thread).status, ThreadStatus::Runnable);

        self.sched.active_threads -= 1;
        if !self.threads.get(thread).daemon {
            self.sched.non_daemon_threads -= 1;
        }
        self.runnable_remove(thread);
        {
            let record = self.threads.get_mut(thread);
            record.status = ThreadStatus::Terminated;
            record.mods = StatusMods::empty();
        }

        // Free every stack segment immediately rather than via the GC.
        let mut segment = self.threads.get(thread).head_segment;
        while let Some(current) = segment.non_null() {
            let next = self.segment_next(current);
            self.heap.free(current)?;
            segment = next;
        }
        self.threads.get_mut(thread).head_segment = Ref::NULL;
        self.regs = Registers::default();
        self.threads.get_mut(thread).regs = Registers::default();
        self.sched.slice_remaining = 0;

        // Wake anyone joined on the thread object.
        let thread_object = self.threads.get(thread).thread_object;
        if let Some(index) = self.monitors.index_for(thread_object) {
            self.notify_all_unchecked(index)?;
        }
        log::debug!(
            "thread {thread} terminated, {} non-daemon remaining",
            self.sched.non_daemon_threads
        );
        Ok(())
    }

    /// Wakes every waiter on a monitor without an ownership check; thread
    /// termination uses this for joiners.
    fn notify_all_unchecked(&mut self, index: usize) -> VmResult<()> {
        while let Some(waiter) = self.monitors.get(index).wait_head {
            self.wait_dequeue(index, waiter);
            self.callback_remove(waiter);
            {
                let record = self.threads.get_mut(waiter);
                record.mods -= StatusMods::WAITING | StatusMods::TIMED_WAITING;
                record.waiting_on = Ref::NULL;
                record.callback = None;
            }
            self.reacquire_after_wait(index, waiter)?;
        }
        Ok(())
    }

    /// Routes a throwable that escaped every frame of the current thread.
    /// When the thread's class declares `dispatchUncaughtException`, a frame
    /// for it is pushed (receiver and throwable in its locals) and true
    /// returns; otherwise a stack trace goes to the console, the thread
    /// terminates, and false returns. Either way the VM itself survives.
    pub fn dispatch_uncaught_exception(&mut self, thrown: Ref) -> VmResult<bool> {
        self.transient_scope(|vm| {
            vm.make_transient_root(thrown)?;
            let thread = vm.sched.current;
            let thread_object = vm.threads.get(thread).thread_object;
            let class = vm.object_class(thread_object);
            let name = vm.intern_utf(b"dispatchUncaughtException")?;
            let signature = vm.intern_utf(b"(Ljava/lang/Throwable;)V")?;
            let handler = Class::find_method(&vm.heap, class, name, signature)
                .filter(|&m| !Method::flags(&vm.heap, m).contains(MethodFlags::ABSTRACT));
            match handler {
                Some(handler) => {
                    let restore_sp = vm.regs.sp;
                    let (pc, ppc) = (vm.regs.pc, vm.regs.ppc);
                    vm.push_frame(handler, restore_sp, ppc, pc, Ref::NULL)?;
                    // Receiver and throwable land in the handler's locals.
                    vm.heap
                        .set_cell(vm.regs.locals, Cell::from_ref(thread_object));
                    vm.heap
                        .set_cell(vm.regs.locals + 4, Cell::from_ref(thrown));
                    Ok(true)
                }
                None => {
                    vm.print_stack_trace(thread);
                    vm.on_thread_terminated()?;
                    Ok(false)
                }
            }
        })
    }

    /// Writes the thread's frames to the console, top first.
    pub fn print_stack_trace(&self, thread: ThreadId) {
        let mut lines = Vec::new();
        self.visit_frames(thread, 0, 0, |frame| {
            let class = Method::class(&self.heap, frame.method);
            let class_name = class
                .non_null()
                .map(|c| {
                    String::from_utf8_lossy(crate::pools::UtfPool::bytes_of(
                        &self.heap,
                        Class::name(&self.heap, c),
                    ))
                    .into_owned()
                })
                .unwrap_or_else(|| "<vm>".to_owned());
            let method_name = String::from_utf8_lossy(crate::pools::UtfPool::bytes_of(
                &self.heap,
                Method::name(&self.heap, frame.method),
            ))
            .into_owned();
            lines.push(format!("    at {class_name}.{method_name} (pc {})", frame.pc));
            true
        });
        for line in lines {
            self.platform.console_line(&line);
        }
    }

    /// True when the last non-daemon thread has terminated.
    pub fn should_exit(&self) -> bool {
        self.sched.non_daemon_threads == 0
    }

    /// Alive means started and not terminated.
    pub fn is_alive(&self, thread: ThreadId) -> bool {
        self.threads.get(thread).is_alive()
    }

    // ---- suspension ------------------------------------------------------

    /// Takes a RUNNABLE thread off the runnable list and blocks it. Blocking
    /// the current thread forces the slice to end.
    pub fn block_thread(&mut self, thread: ThreadId) -> VmResult<()> {
        debug_assert_eq!(self.threads.get(thread).status, ThreadStatus::Runnable);
        self.runnable_remove(thread);
        self.threads.get_mut(thread).status = ThreadStatus::Blocked;
        if thread == self.sched.current {
            self.sched.slice_remaining = 0;
        }
        Ok(())
    }

    /// Returns a BLOCKED thread to the front of the runnable list.
    pub fn resume_thread(&mut self, thread: ThreadId) -> VmResult<()> {
        debug_assert_eq!(self.threads.get(thread).status, ThreadStatus::Blocked);
        let record = self.threads.get_mut(thread);
        record.status = ThreadStatus::Runnable;
        record.next_in_list = self.sched.runnable_head;
        self.sched.runnable_head = Some(thread);
        Ok(())
    }

    /// Blocks the current thread for `duration_ms`, scheduling a plain
    /// wake through the callback list.
    pub fn sleep_current(&mut self, duration_ms: u64) -> VmResult<()> {
        let thread = self.sched.current;
        if self.threads.get(thread).interrupted {
            self.threads.get_mut(thread).interrupted = false;
            return Err(self.raise(ThrowableKind::InterruptedException));
        }
        self.block_thread(thread)?;
        self.threads.get_mut(thread).mods |= StatusMods::TIMED_WAITING;
        let wake_at = self.platform.system_time_ms() + duration_ms;
        self.callback_enroll(thread, wake_at, WakeCallback::Sleep);
        log::trace!("thread {thread} sleeping until {wake_at}");
        Ok(())
    }

    /// Interrupts a thread. Waiting or sleeping threads get the prebuilt
    /// InterruptedException planted as pending (flag cleared with it) and
    /// an immediate wake; runnable threads only get the flag. Interrupting
    /// the current thread ends its slice. No effect on non-alive threads.
    pub fn interrupt_thread(&mut self, thread: ThreadId) -> VmResult<()> {
        if !self.threads.get(thread).is_alive() {
            return Ok(());
        }
        self.threads.get_mut(thread).interrupted = true;
        if self.threads.get(thread).is_waiting() {
            let pending = self.prebuilt_interrupted();
            let record = self.threads.get_mut(thread);
            record.pending_exception = pending;
            record.interrupted = false;
            record.time_to_awake = 0;
            if record.callback.is_none() {
                // A plain waiter is not on the callback list yet; enroll it
                // so the next scheduling pass wakes it.
                self.callback_enroll(thread, 0, WakeCallback::MonitorWake);
            }
        }
        if thread == self.sched.current {
            self.sched.slice_remaining = 0;
        }
        Ok(())
    }

    /// The interrupted flag, as Thread.interrupted()/isInterrupted() see it.
    pub fn is_interrupted(&self, thread: ThreadId) -> bool {
        self.threads.get(thread).interrupted
    }

    // ---- the switch ------------------------------------------------------

    /// Picks and installs the next thread. Runs the callback pass first,
    /// spinning while only waiting threads exist; raises a fatal VM error
    /// when no thread is runnable or waiting; delivers a pending exception
    /// into the chosen thread by returning it as a throw.
    pub fn switch_thread(&mut self) -> VmResult<()> {
        loop {
            if self.sched.callback_head.is_some() {
                self.run_callback_pass()?;
            }
            if self.sched.runnable_head.is_some() {
                break;
            }
            if self.sched.callback_head.is_none() {
                return Err(VmError::exit(
                    ExitCode::NoRunnableThreads,
                    "no runnable or waiting threads",
                ));
            }
            // Only timed waiters remain: spin until one comes due.
        }

        let current = self.sched.current;
        let head = match self.sched.runnable_head {
            Some(head) => head,
            None => {
                return Err(VmError::exit(
                    ExitCode::NoRunnableThreads,
                    "no runnable or waiting threads",
                ))
            }
        };
        // Round robin: continue past the current thread, wrapping to the
        // list head.
        let next = if self.threads.get(current).status == ThreadStatus::Runnable {
            self.threads.get(current).next_in_list.unwrap_or(head)
        } else {
            head
        };

        if next != current {
            self.threads.get_mut(current).regs = self.regs;
            self.regs = self.threads.get(next).regs;
            self.sched.current = next;
            log::trace!("switched thread {current} -> {next}");
        }
        self.sched.slice_remaining =
            self.threads.get(next).priority * self.options.timeslice;

        let pending = self.threads.get(next).pending_exception;
        if let Some(exception) = pending.non_null() {
            self.threads.get_mut(next).pending_exception = Ref::NULL;
            let kind = if exception == self.prebuilt_interrupted() {
                Some(ThrowableKind::InterruptedException)
            } else {
                None
            };
            return Err(VmError::Throw {
                object: exception,
                kind,
            });
        }
        Ok(())
    }

    /// One pass over the callback list, firing every due wake action.
    fn run_callback_pass(&mut self) -> VmResult<()> {
        let now = self.platform.system_time_ms();
        let mut due = Vec::new();
        let mut cursor = self.sched.callback_head;
        while let Some(thread) = cursor {
            cursor = self.threads.get(thread).next_in_list;
            if self.threads.get(thread).time_to_awake <= now {
                due.push(thread);
            }
        }
        for thread in due {
            self.callback_remove(thread);
            let callback = self.threads.get_mut(thread).callback.take();
            match callback {
                Some(WakeCallback::Sleep) => {
                    self.threads.get_mut(thread).mods -= StatusMods::TIMED_WAITING;
                    self.resume_thread(thread)?;
                }
                Some(WakeCallback::MonitorWake) => {
                    let monitor = self.waiting_monitor(thread);
                    {
                        let record = self.threads.get_mut(thread);
                        record.mods -= StatusMods::WAITING | StatusMods::TIMED_WAITING;
                        record.waiting_on = Ref::NULL;
                    }
                    match monitor {
                        Some(index) => {
                            self.wait_dequeue(index, thread);
                            self.reacquire_after_wait(index, thread)?;
                        }
                        None => self.resume_thread(thread)?,
                    }
                }
                None => self.resume_thread(thread)?,
            }
        }
        Ok(())
    }

    // ---- list maintenance ------------------------------------------------

    fn runnable_remove(&mut self, thread: ThreadId) {
        if self.sched.runnable_head == Some(thread) {
            self.sched.runnable_head = self.threads.get(thread).next_in_list;
        } else if let Some(head) = self.sched.runnable_head {
            let mut cursor = head;
            while let Some(next) = self.threads.get(cursor).next_in_list {
                if next == thread {
                    self.threads.get_mut(cursor).next_in_list =
                        self.threads.get(thread).next_in_list;
                    break;
                }
                cursor = next;
            }
        }
        self.threads.get_mut(thread).next_in_list = None;
    }

    pub(crate) fn callback_enroll(
        &mut self,
        thread: ThreadId,
        wake_at: u64,
        callback: WakeCallback,
    ) {
        debug_assert!(self.threads.get(thread).next_in_list.is_none());
        let record = self.threads.get_mut(thread);
        record.time_to_awake = wake_at;
        record.callback = Some(callback);
        record.next_in_list = self.sched.callback_head;
        self.sched.callback_head = Some(thread);
    }

    /// Removes a thread from the callback list if present.
    pub(crate) fn callback_remove(&mut self, thread: ThreadId) {
        if self.sched.callback_head == Some(thread) {
            self.sched.callback_head = self.threads.get(thread).next_in_list;
            self.threads.get_mut(thread).next_in_list = None;
            return;
        }
        let Some(head) = self.sched.callback_head else {
            return;
        };
        let mut cursor = head;
        while let Some(next) = self.threads.get(cursor).next_in_list {
            if next == thread {
                self.threads.get_mut(cursor).next_in_list =
                    self.threads.get(thread).next_in_list;
                self.threads.get_mut(thread).next_in_list = None;
                return;
            }
            cursor = next;
        }
    }

    /// Splices terminated records out of the global list; the collector
    /// runs this every cycle.
    pub(crate) fn prune_terminated(&mut self) {
        let mut prev: Option<ThreadId> = None;
        let mut cursor = self.sched.all_head;
        while let Some(thread) = cursor {
            let next = self.threads.get(thread).next;
            if self.threads.get(thread).status == ThreadStatus::Terminated {
                match prev {
                    None => self.sched.all_head = next,
                    Some(prev) => self.threads.get_mut(prev).next = next,
                }
                self.threads.get_mut(thread).next = None;
            } else {
                prev = Some(thread);
            }
            cursor = next;
        }
    }

    // ---- inspection ------------------------------------------------------

    /// The runnable list, head first.
    pub fn runnable_list(&self) -> Vec<ThreadId> {
        let mut list = Vec::new();
        let mut cursor = self.sched.runnable_head;
        while let Some(thread) = cursor {
            list.push(thread);
            cursor = self.threads.get(thread).next_in_list;
        }
        list
    }

    /// The callback list, head first.
    pub fn callback_list(&self) -> Vec<ThreadId> {
        let mut list = Vec::new();
        let mut cursor = self.sched.callback_head;
        while let Some(thread) = cursor {
            list.push(thread);
            cursor = self.threads.get(thread).next_in_list;
        }
        list
    }

    /// The global list, insertion order.
    pub fn all_threads(&self) -> Vec<ThreadId> {
        let mut list = Vec::new();
        let mut cursor = self.sched.all_head;
        while let Some(thread) = cursor {
            list.push(thread);
            cursor = self.threads.get(thread).next;
        }
        list
    }

    /// Bytecodes remaining in the current slice; the interpreter decrements
    /// its own copy and calls [`Vm::switch_thread`] at zero.
    pub fn slice_remaining(&self) -> u32 {
        self.sched.slice_remaining
    }

    /// Spends `count` bytecodes of the current slice.
    pub fn consume_slice(&mut self, count: u32) {
        self.sched.slice_remaining = self.sched.slice_remaining.saturating_sub(count);
    }
}
