//! Per-object monitors: ownership, lock depth, lock and wait queues.
//!
//! Monitor records are cached: a record whose owner, lock queue and wait
//! queue have all drained is zeroed in place and linked onto a free list
//! for reuse, preserving record identity across lock cycles. Threads sit in
//! at most one monitor queue at a time, linked through their
//! `next_in_queue` field.

use crate::cell::Ref;
use crate::error::{ThrowableKind, VmResult};
use crate::thread::{StatusMods, ThreadId, WakeCallback};
use crate::vm::Vm;
use hashbrown::HashMap;

/// One monitor record.
#[derive(Debug, Default)]
pub struct Monitor {
    /// The object this monitor locks
    pub owner_object: Ref,
    /// Owning thread, or none while unlocked
    pub owner_thread: Option<ThreadId>,
    /// Reentrant lock depth; at least 1 while owned
    pub depth: u32,
    /// Head of the queue of threads blocked acquiring
    pub lock_head: Option<ThreadId>,
    /// Head of the queue of waiting threads
    pub wait_head: Option<ThreadId>,
    /// False for zeroed records on the free list
    pub in_use: bool,
    /// Free-list link
    next_free: Option<usize>,
}

/// The table of all monitor records, live and cached.
#[derive(Debug, Default)]
pub struct MonitorTable {
    monitors: Vec<Monitor>,
    free_head: Option<usize>,
    by_object: HashMap<u32, usize>,
}

impl MonitorTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The monitor currently attached to `object`, if any.
    pub fn index_for(&self, object: Ref) -> Option<usize> {
        self.by_object.get(&object.offset()).copied()
    }

    /// Attaches a monitor to `object`, reusing a cached record when one
    /// exists.
    fn take(&mut self, object: Ref) -> usize {
        let index = match self.free_head {
            Some(index) => {
                self.free_head = self.monitors[index].next_free;
                index
            }
            None => {
                self.monitors.push(Monitor::default());
                self.monitors.len() - 1
            }
        };
        let monitor = &mut self.monitors[index];
        monitor.owner_object = object;
        monitor.in_use = true;
        monitor.next_free = None;
        self.by_object.insert(object.offset(), index);
        index
    }

    /// Detaches and zeroes a wholly idle record, caching it for reuse.
    fn dispose(&mut self, index: usize) {
        let object = self.monitors[index].owner_object;
        self.by_object.remove(&object.offset());
        self.monitors[index] = Monitor {
            next_free: self.free_head,
            ..Monitor::default()
        };
        self.free_head = Some(index);
    }

    pub(crate) fn get(&self, index: usize) -> &Monitor {
        &self.monitors[index]
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> &mut Monitor {
        &mut self.monitors[index]
    }

    /// All records, for invariant checks.
    pub fn records(&self) -> impl Iterator<Item = &Monitor> {
        self.monitors.iter()
    }

    /// Records currently attached to an object.
    pub fn live_count(&self) -> usize {
        self.by_object.len()
    }
}

/// A monitor snapshot for tests and the debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorView {
    /// Owning thread, if any
    pub owner_thread: Option<ThreadId>,
    /// Current lock depth
    pub depth: u32,
    /// Threads blocked acquiring, in queue order
    pub lock_queue: Vec<ThreadId>,
    /// Threads waiting, in queue order
    pub wait_queue: Vec<ThreadId>,
}

impl Vm {
    // ---- acquire / release -----------------------------------------------

    /// Acquires the monitor of `object` for `thread`. Returns true when the
    /// lock is held on return; false when the thread was queued and
    /// blocked. A null object raises NullPointerException.
    pub fn monitor_acquire(&mut self, object: Ref, thread: ThreadId) -> VmResult<bool> {
        if object.is_null() {
            return Err(self.raise(ThrowableKind::NullPointerException));
        }
        match self.monitors.index_for(object) {
            None => {
                let index = self.monitors.take(object);
                let monitor = self.monitors.get_mut(index);
                monitor.owner_thread = Some(thread);
                monitor.depth = 1;
                Ok(true)
            }
            Some(index) => {
                let owner = self.monitors.get(index).owner_thread;
                match owner {
                    None => {
                        let saved = self.threads.get(thread).saved_lock_depth;
                        self.threads.get_mut(thread).saved_lock_depth = 0;
                        let monitor = self.monitors.get_mut(index);
                        monitor.owner_thread = Some(thread);
                        monitor.depth = saved.max(1);
                        Ok(true)
                    }
                    Some(current_owner) if current_owner == thread => {
                        self.monitors.get_mut(index).depth += 1;
                        Ok(true)
                    }
                    Some(_) => {
                        log::trace!("thread {thread} blocks on monitor of {:#x}", object.offset());
                        self.lock_enqueue(index, thread);
                        self.block_thread(thread)?;
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Releases one lock level held by the calling thread; at depth zero
    /// the next queued acquirer is promoted and a wholly idle monitor is
    /// zeroed and cached. Raises IllegalMonitorStateException when the
    /// caller is not the owner, NullPointerException for null.
    pub fn monitor_release(&mut self, object: Ref) -> VmResult<()> {
        if object.is_null() {
            return Err(self.raise(ThrowableKind::NullPointerException));
        }
        let caller = self.sched.current;
        let Some(index) = self.monitors.index_for(object) else {
            return Err(self.raise(ThrowableKind::IllegalMonitorStateException));
        };
        if self.monitors.get(index).owner_thread != Some(caller) {
            return Err(self.raise(ThrowableKind::IllegalMonitorStateException));
        }
        let monitor = self.monitors.get_mut(index);
        monitor.depth -= 1;
        if monitor.depth == 0 {
            monitor.owner_thread = None;
            self.promote_locker(index)?;
            self.dispose_if_idle(index);
        }
        Ok(())
    }

    /// Makes the head of the lock queue the owner, restoring its saved
    /// depth, and resumes it.
    fn promote_locker(&mut self, index: usize) -> VmResult<()> {
        let Some(next) = self.monitors.get(index).lock_head else {
            return Ok(());
        };
        self.lock_dequeue(index, next);
        let saved = self.threads.get(next).saved_lock_depth;
        self.threads.get_mut(next).saved_lock_depth = 0;
        let monitor = self.monitors.get_mut(index);
        monitor.owner_thread = Some(next);
        monitor.depth = saved.max(1);
        log::trace!("thread {next} promoted to monitor owner at depth {}", saved.max(1));
        self.resume_thread(next)
    }

    fn dispose_if_idle(&mut self, index: usize) {
        let monitor = self.monitors.get(index);
        if monitor.owner_thread.is_none()
            && monitor.lock_head.is_none()
            && monitor.wait_head.is_none()
        {
            self.monitors.dispose(index);
        }
    }

    // ---- wait / notify ---------------------------------------------------

    /// Releases the monitor of `object` entirely and waits to be notified,
    /// with an optional timeout in milliseconds (zero waits indefinitely).
    /// The caller must own the monitor. A pending interrupt raises
    /// InterruptedException immediately, clearing the flag.
    pub fn monitor_wait(&mut self, object: Ref, timeout_ms: u64) -> VmResult<()> {
        if object.is_null() {
            return Err(self.raise(ThrowableKind::NullPointerException));
        }
        let caller = self.sched.current;
        let owned = self
            .monitors
            .index_for(object)
            .filter(|&index| self.monitors.get(index).owner_thread == Some(caller));
        let Some(index) = owned else {
            return Err(self.raise(ThrowableKind::IllegalMonitorStateException));
        };
        if self.threads.get(caller).interrupted {
            self.threads.get_mut(caller).interrupted = false;
            return Err(self.raise(ThrowableKind::InterruptedException));
        }

        // Remember how deep the lock was so reacquisition can restore it.
        let depth = self.monitors.get(index).depth;
        {
            let thread = self.threads.get_mut(caller);
            thread.saved_lock_depth = depth;
            thread.waiting_on = object;
        }
        self.block_thread(caller)?;
        if timeout_ms > 0 {
            let wake_at = self.platform.system_time_ms() + timeout_ms;
            self.threads.get_mut(caller).mods |= StatusMods::TIMED_WAITING;
            self.callback_enroll(caller, wake_at, WakeCallback::MonitorWake);
        } else {
            self.threads.get_mut(caller).mods |= StatusMods::WAITING;
        }
        self.wait_enqueue(index, caller);

        // Hand the monitor over: another locker becomes owner, or it goes
        // unowned until a notify or timeout brings someone back.
        let monitor = self.monitors.get_mut(index);
        monitor.depth = 0;
        monitor.owner_thread = None;
        self.promote_locker(index)?;
        Ok(())
    }

    /// Notifies one waiter (or all) on the monitor of `object`. Each
    /// notified thread leaves the wait queue and the callback list, then
    /// either claims the monitor immediately (restoring its saved depth) or
    /// joins the lock queue still blocked. The caller must own the monitor.
    pub fn monitor_notify(&mut self, object: Ref, all: bool) -> VmResult<()> {
        if object.is_null() {
            return Err(self.raise(ThrowableKind::NullPointerException));
        }
        let caller = self.sched.current;
        let owned = self
            .monitors
            .index_for(object)
            .filter(|&index| self.monitors.get(index).owner_thread == Some(caller));
        let Some(index) = owned else {
            return Err(self.raise(ThrowableKind::IllegalMonitorStateException));
        };
        while let Some(waiter) = self.monitors.get(index).wait_head {
            self.wait_dequeue(index, waiter);
            self.callback_remove(waiter);
            {
                let thread = self.threads.get_mut(waiter);
                thread.mods -= StatusMods::WAITING | StatusMods::TIMED_WAITING;
                thread.waiting_on = Ref::NULL;
                thread.callback = None;
            }
            self.reacquire_after_wait(index, waiter)?;
            if !all {
                break;
            }
        }
        Ok(())
    }

    /// Puts a thread leaving the wait queue back on the monitor: owner at
    /// its saved depth when the monitor is unowned, lock queue otherwise.
    pub(crate) fn reacquire_after_wait(
        &mut self,
        index: usize,
        thread: ThreadId,
    ) -> VmResult<()> {
        if self.monitors.get(index).owner_thread.is_none() {
            let saved = self.threads.get(thread).saved_lock_depth;
            self.threads.get_mut(thread).saved_lock_depth = 0;
            let monitor = self.monitors.get_mut(index);
            monitor.owner_thread = Some(thread);
            monitor.depth = saved.max(1);
            self.resume_thread(thread)?;
        } else {
            self.lock_enqueue(index, thread);
        }
        Ok(())
    }

    // ---- queues ----------------------------------------------------------

    pub(crate) fn lock_enqueue(&mut self, index: usize, thread: ThreadId) {
        debug_assert!(self.threads.get(thread).next_in_queue.is_none());
        let head = self.monitors.get(index).lock_head;
        match head {
            None => self.monitors.get_mut(index).lock_head = Some(thread),
            Some(head) => {
                let mut tail = head;
                while let Some(next) = self.threads.get(tail).next_in_queue {
                    tail = next;
                }
                self.threads.get_mut(tail).next_in_queue = Some(thread);
            }
        }
    }

    fn lock_dequeue(&mut self, index: usize, thread: ThreadId) {
        let head = self.monitors.get(index).lock_head;
        if head == Some(thread) {
            self.monitors.get_mut(index).lock_head = self.threads.get(thread).next_in_queue;
        } else if let Some(head) = head {
            let mut cursor = head;
            while let Some(next) = self.threads.get(cursor).next_in_queue {
                if next == thread {
                    self.threads.get_mut(cursor).next_in_queue =
                        self.threads.get(thread).next_in_queue;
                    break;
                }
                cursor = next;
            }
        }
        self.threads.get_mut(thread).next_in_queue = None;
    }

    fn wait_enqueue(&mut self, index: usize, thread: ThreadId) {
        debug_assert!(self.threads.get(thread).next_in_queue.is_none());
        let head = self.monitors.get(index).wait_head;
        match head {
            None => self.monitors.get_mut(index).wait_head = Some(thread),
            Some(head) => {
                let mut tail = head;
                while let Some(next) = self.threads.get(tail).next_in_queue {
                    tail = next;
                }
                self.threads.get_mut(tail).next_in_queue = Some(thread);
            }
        }
    }

    pub(crate) fn wait_dequeue(&mut self, index: usize, thread: ThreadId) {
        let head = self.monitors.get(index).wait_head;
        if head == Some(thread) {
            self.monitors.get_mut(index).wait_head = self.threads.get(thread).next_in_queue;
        } else if let Some(head) = head {
            let mut cursor = head;
            while let Some(next) = self.threads.get(cursor).next_in_queue {
                if next == thread {
                    self.threads.get_mut(cursor).next_in_queue =
                        self.threads.get(thread).next_in_queue;
                    break;
                }
                cursor = next;
            }
        }
        self.threads.get_mut(thread).next_in_queue = None;
    }

    // ---- inspection ------------------------------------------------------

    /// A snapshot of the monitor attached to `object`, if any.
    pub fn monitor_view(&self, object: Ref) -> Option<MonitorView> {
        let index = self.monitors.index_for(object)?;
        let monitor = self.monitors.get(index);
        let collect = |mut cursor: Option<ThreadId>| {
            let mut queue = Vec::new();
            while let Some(thread) = cursor {
                queue.push(thread);
                cursor = self.threads.get(thread).next_in_queue;
            }
            queue
        };
        Some(MonitorView {
            owner_thread: monitor.owner_thread,
            depth: monitor.depth,
            lock_queue: collect(monitor.lock_head),
            wait_queue: collect(monitor.wait_head),
        })
    }

    /// The monitor index a waiting thread belongs to, through its
    /// `waiting_on` object.
    pub(crate) fn waiting_monitor(&self, thread: ThreadId) -> Option<usize> {
        self.monitors
            .index_for(self.threads.get(thread).waiting_on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_vm;

    #[test]
    fn test_reentrant_acquire_release() {
        let mut vm = test_vm();
        let object = vm.new_instance(vm.core_object()).expect("object");
        let main = vm.current_thread();

        assert!(vm.monitor_acquire(object, main).expect("acquire"));
        assert!(vm.monitor_acquire(object, main).expect("reacquire"));
        let view = vm.monitor_view(object).expect("view");
        assert_eq!(view.owner_thread, Some(main));
        assert_eq!(view.depth, 2);

        vm.monitor_release(object).expect("release");
        assert_eq!(vm.monitor_view(object).expect("view").depth, 1);
        vm.monitor_release(object).expect("release");

        // Fully released and idle: the record was zeroed and cached.
        assert!(vm.monitor_view(object).is_none());
        assert_eq!(vm.monitors.live_count(), 0);
    }

    #[test]
    fn test_release_by_non_owner_is_illegal() {
        let mut vm = test_vm();
        let object = vm.new_instance(vm.core_object()).expect("object");
        let err = vm.monitor_release(object).unwrap_err();
        assert_eq!(
            err.thrown_kind(),
            Some(ThrowableKind::IllegalMonitorStateException)
        );
    }

    #[test]
    fn test_null_object_raises_npe() {
        let mut vm = test_vm();
        let main = vm.current_thread();
        let err = vm.monitor_acquire(Ref::NULL, main).unwrap_err();
        assert_eq!(err.thrown_kind(), Some(ThrowableKind::NullPointerException));
        let err = vm.monitor_wait(Ref::NULL, 0).unwrap_err();
        assert_eq!(err.thrown_kind(), Some(ThrowableKind::NullPointerException));
    }

    #[test]
    fn test_wait_requires_ownership() {
        let mut vm = test_vm();
        let object = vm.new_instance(vm.core_object()).expect("object");
        let err = vm.monitor_wait(object, 0).unwrap_err();
        assert_eq!(
            err.thrown_kind(),
            Some(ThrowableKind::IllegalMonitorStateException)
        );
        let err = vm.monitor_notify(object, true).unwrap_err();
        assert_eq!(
            err.thrown_kind(),
            Some(ThrowableKind::IllegalMonitorStateException)
        );
    }

    #[test]
    fn test_monitor_record_reuse_keeps_identity() {
        let mut vm = test_vm();
        let first = vm.new_instance(vm.core_object()).expect("first");
        let second = vm.new_instance(vm.core_object()).expect("second");
        let main = vm.current_thread();

        vm.monitor_acquire(first, main).expect("acquire");
        vm.monitor_release(first).expect("release");

        // The cached record is handed to the next object that needs one.
        vm.monitor_acquire(second, main).expect("acquire");
        let view = vm.monitor_view(second).expect("view");
        assert_eq!(view.owner_thread, Some(main));
        assert_eq!(vm.monitors.live_count(), 1);
        vm.monitor_release(second).expect("release");
    }
}
