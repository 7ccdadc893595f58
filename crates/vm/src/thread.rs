//! VM thread records and the thread table.
//!
//! Every language-level Thread object pairs one-to-one with a `VmThread`
//! record holding its scheduler state, saved registers and list links. The
//! records live outside the arena; the collector walks the global list to
//! mark each thread's language object, pending exception and stack
//! segments.

use crate::cell::Ref;
use crate::frame::Registers;
use bitflags::bitflags;

/// Index of a thread record in the thread table.
pub type ThreadId = usize;

/// Base thread status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created, not yet started
    New,
    /// On (or eligible for) the runnable list
    Runnable,
    /// Off the runnable list; modifier bits say why
    Blocked,
    /// Finished; pruned from the global list by the next collection
    Terminated,
}

bitflags! {
    /// Modifier bits orthogonal to [`ThreadStatus::Blocked`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusMods: u32 {
        /// In a monitor's wait queue with no timeout
        const WAITING = 1 << 0;
        /// Scheduled to wake at a wall-clock instant
        const TIMED_WAITING = 1 << 1;
        /// Suspended by the debugger
        const DBG_SUSPENDED = 1 << 2;
    }
}

/// The wake action a thread on the callback list runs when its time
/// arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCallback {
    /// Plain sleep: back to the runnable list
    Sleep,
    /// Timed or interrupted wait: back through the monitor
    MonitorWake,
}

/// One green thread.
#[derive(Debug)]
pub struct VmThread {
    /// This record's index
    pub id: ThreadId,
    /// Base status
    pub status: ThreadStatus,
    /// Modifier bits, meaningful while Blocked
    pub mods: StatusMods,
    /// The paired language-level Thread object
    pub thread_object: Ref,
    /// Head of the stack segment list
    pub head_segment: Ref,
    /// Saved execution registers, loaded into the globals when scheduled
    pub regs: Registers,
    /// Priority; the timeslice scales with it
    pub priority: u32,
    /// Daemon threads do not keep the VM alive
    pub daemon: bool,
    /// The object this thread is waiting on, if any
    pub waiting_on: Ref,
    /// Lock depth to restore when the monitor is re-acquired after a wait
    pub saved_lock_depth: u32,
    /// Wall-clock instant a timed wait ends
    pub time_to_awake: u64,
    /// The interrupted flag
    pub interrupted: bool,
    /// Thrown into the thread when it is next scheduled
    pub pending_exception: Ref,
    /// Wake action while on the callback list
    pub callback: Option<WakeCallback>,
    /// Global list link
    pub next: Option<ThreadId>,
    /// Runnable-or-callback list link (at most one of the two)
    pub next_in_list: Option<ThreadId>,
    /// Monitor lock-or-wait queue link (at most one queue)
    pub next_in_queue: Option<ThreadId>,
}

impl VmThread {
    fn new(id: ThreadId, thread_object: Ref, priority: u32) -> Self {
        Self {
            id,
            status: ThreadStatus::New,
            mods: StatusMods::empty(),
            thread_object,
            head_segment: Ref::NULL,
            regs: Registers::default(),
            priority,
            daemon: false,
            waiting_on: Ref::NULL,
            saved_lock_depth: 0,
            time_to_awake: 0,
            interrupted: false,
            pending_exception: Ref::NULL,
            callback: None,
            next: None,
            next_in_list: None,
            next_in_queue: None,
        }
    }

    /// Alive means started and not yet terminated.
    pub fn is_alive(&self) -> bool {
        matches!(self.status, ThreadStatus::Runnable | ThreadStatus::Blocked)
    }

    /// True while the thread waits on a monitor or sleeps.
    pub fn is_waiting(&self) -> bool {
        self.status == ThreadStatus::Blocked
            && self
                .mods
                .intersects(StatusMods::WAITING | StatusMods::TIMED_WAITING)
    }
}

/// The table of every thread record created in this VM.
#[derive(Debug, Default)]
pub struct ThreadTable {
    records: Vec<VmThread>,
}

impl ThreadTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a NEW thread record paired with a language Thread object.
    pub fn create(&mut self, thread_object: Ref, priority: u32) -> ThreadId {
        let id = self.records.len();
        self.records.push(VmThread::new(id, thread_object, priority));
        id
    }

    /// Borrows a record.
    pub fn get(&self, id: ThreadId) -> &VmThread {
        &self.records[id]
    }

    /// Mutably borrows a record.
    pub fn get_mut(&mut self, id: ThreadId) -> &mut VmThread {
        &mut self.records[id]
    }

    /// Records ever created (terminated included).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no thread was ever created.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, for invariant checks.
    pub fn iter(&self) -> impl Iterator<Item = &VmThread> {
        self.records.iter()
    }
}
