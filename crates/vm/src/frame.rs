//! The execution register model and the method frame protocol.
//!
//! A thread's stack is a singly linked list of fixed-height segments, each
//! a DATA chunk in the arena. A frame is a layout within a segment: a
//! 7-cell return-info block, then the locals, then the operand stack. One
//! global register set is live at a time; the scheduler swaps it in and out
//! of thread records on a switch.
//!
//! Both the next-to-execute and the last-executed pc are kept: invoke
//! bytecodes of different lengths advance the pc before a push, and the
//! exception handler search must resolve against the instruction that
//! actually faulted.

use crate::cell::{Cell, CellAddr, Ref};
use crate::chunk::AllocType;
use crate::class::{Method, MethodAddr};
use crate::error::VmResult;
use crate::vm::Vm;

/// The pc value marking the callback wedge at a stack base.
pub const TERMINAL_PC: u32 = u32::MAX;

/// Cell indices of the return-info block at the base of every frame.
pub mod frame_slots {
    /// Caller's locals base
    pub const LOCALS: u32 = 0;
    /// Caller's operand stack pointer
    pub const SP: u32 = 1;
    /// Caller's last-executed pc
    pub const PPC: u32 = 2;
    /// Caller's resume pc
    pub const PC: u32 = 3;
    /// Caller's method
    pub const METHOD: u32 = 4;
    /// Caller's stack segment
    pub const STACK: u32 = 5;
    /// Monitor object held by the callee, if any
    pub const SYNCOBJ: u32 = 6;
    /// Cells in the block
    pub const RETURN_INFO_CELLS: u32 = 7;
}

/// Segment payload layout: link, height, then cells.
const SEG_NEXT: u32 = 0;
const SEG_HEIGHT: u32 = 4;
const SEG_CELLS: u32 = 8;

/// The global register set the interpreter dispatches through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers {
    /// Current method record
    pub method: MethodAddr,
    /// Next bytecode offset to execute
    pub pc: u32,
    /// Last executed bytecode offset
    pub ppc: u32,
    /// Top of the operand stack, exclusive
    pub sp: CellAddr,
    /// First cell of the local variable area
    pub locals: CellAddr,
    /// Segment holding the current frame
    pub segment: Ref,
}

/// One frame as seen by a stack visit.
#[derive(Debug, Clone, Copy)]
pub struct FrameView {
    /// The executing method
    pub method: MethodAddr,
    /// The frame's pc (resume pc for non-top frames)
    pub pc: u32,
    /// Locals base
    pub locals: CellAddr,
    /// Operand stack top, exclusive
    pub sp: CellAddr,
    /// Owning segment
    pub segment: Ref,
    /// Monitor object held by this frame's method, if any
    pub sync_obj: Ref,
}

/// Internal top-down frame cursor shared by visit and the stack scan.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameWalker {
    pub method: MethodAddr,
    pub pc: u32,
    pub locals: CellAddr,
    pub sp: CellAddr,
    pub segment: Ref,
}

impl FrameWalker {
    /// Starts at a thread's top frame.
    pub fn top(regs: &Registers) -> Self {
        Self {
            method: regs.method,
            pc: regs.pc,
            locals: regs.locals,
            sp: regs.sp,
            segment: regs.segment,
        }
    }

    fn return_info(&self) -> CellAddr {
        self.locals - frame_slots::RETURN_INFO_CELLS * 4
    }

    /// True at the callback wedge closing the stack.
    pub fn is_terminal(&self, vm: &Vm) -> bool {
        self.method == vm.wedge_method() && self.pc == TERMINAL_PC
    }

    /// Steps down to the caller frame.
    pub fn step(&self, vm: &Vm) -> FrameWalker {
        let info = self.return_info();
        FrameWalker {
            locals: vm.heap.word(info + frame_slots::LOCALS * 4),
            sp: vm.heap.word(info + frame_slots::SP * 4),
            pc: vm.heap.word(info + frame_slots::PC * 4),
            method: vm.heap.word(info + frame_slots::METHOD * 4),
            segment: vm.heap.cell(info + frame_slots::STACK * 4).as_ref(),
        }
    }

    /// The monitor object this frame's method holds, if any.
    pub fn sync_obj(&self, vm: &Vm) -> Ref {
        vm.heap
            .cell(self.return_info() + frame_slots::SYNCOBJ * 4)
            .as_ref()
    }

    fn view(&self, vm: &Vm) -> FrameView {
        FrameView {
            method: self.method,
            pc: self.pc,
            locals: self.locals,
            sp: self.sp,
            segment: self.segment,
            sync_obj: self.sync_obj(vm),
        }
    }
}

impl Vm {
    // ---- segments --------------------------------------------------------

    /// Allocates a fresh stack segment holding at least `min_cells`.
    pub(crate) fn new_segment(&mut self, min_cells: u32) -> VmResult<Ref> {
        let height = (self.options.stack_segment_cells as u32).max(min_cells);
        let segment =
            self.allocate_zeroed((SEG_CELLS + height * 4) as usize, AllocType::Data)?;
        self.heap.set_word(segment.offset() + SEG_HEIGHT, height);
        Ok(segment)
    }

    /// The next segment in a thread's list, or null.
    pub(crate) fn segment_next(&self, segment: Ref) -> Ref {
        self.heap.cell(segment.offset() + SEG_NEXT).as_ref()
    }

    /// Links (or severs, with null) a segment's successor.
    pub(crate) fn set_segment_next(&mut self, segment: Ref, next: Ref) {
        self.heap
            .set_cell(segment.offset() + SEG_NEXT, Cell::from_ref(next));
    }

    /// Cell capacity of a segment.
    pub(crate) fn segment_height(&self, segment: Ref) -> u32 {
        self.heap.word(segment.offset() + SEG_HEIGHT)
    }

    /// Address of a segment's first cell.
    pub(crate) fn segment_first_cell(&self, segment: Ref) -> CellAddr {
        segment.offset() + SEG_CELLS
    }

    /// Address one past a segment's last cell.
    pub(crate) fn segment_top(&self, segment: Ref) -> CellAddr {
        self.segment_first_cell(segment) + self.segment_height(segment) * 4
    }

    // ---- push / pop ------------------------------------------------------

    /// Pushes a frame for `method` and advances the global registers into
    /// it. `caller_sp` is the operand top to restore on return (the
    /// interpreter has already consumed the arguments), `caller_pc` the
    /// caller's last-executed pc, `resume_pc` where the caller continues,
    /// and `sync_obj` the monitor the callee holds, or null.
    pub fn push_frame(
        &mut self,
        method: MethodAddr,
        caller_sp: CellAddr,
        caller_pc: u32,
        resume_pc: u32,
        sync_obj: Ref,
    ) -> VmResult<()> {
        let max_locals = Method::max_locals(&self.heap, method);
        let max_stack = Method::max_stack(&self.heap, method);
        let required = frame_slots::RETURN_INFO_CELLS + max_locals + max_stack;

        // The next free cell past the current frame's full extent.
        let current_span = Method::max_locals(&self.heap, self.regs.method)
            + Method::max_stack(&self.heap, self.regs.method);
        let next_free = self.regs.locals + current_span * 4;

        let current_segment = self.regs.segment;
        let (segment, base) = if next_free + required * 4 <= self.segment_top(current_segment) {
            (current_segment, next_free)
        } else {
            let linked = self.segment_next(current_segment);
            let reuse = linked
                .non_null()
                .filter(|&seg| self.segment_height(seg) >= required);
            let segment = match reuse {
                Some(seg) => seg,
                None => {
                    // Any previously linked (too small) successor becomes
                    // unreachable and is reclaimed by the next collection.
                    let fresh = self.new_segment(required)?;
                    self.set_segment_next(current_segment, fresh);
                    fresh
                }
            };
            let base = self.segment_first_cell(segment);
            (segment, base)
        };

        let info = base;
        self.heap
            .set_word(info + frame_slots::LOCALS * 4, self.regs.locals);
        self.heap.set_word(info + frame_slots::SP * 4, caller_sp);
        self.heap.set_word(info + frame_slots::PPC * 4, caller_pc);
        self.heap.set_word(info + frame_slots::PC * 4, resume_pc);
        self.heap
            .set_word(info + frame_slots::METHOD * 4, self.regs.method);
        self.heap.set_cell(
            info + frame_slots::STACK * 4,
            Cell::from_ref(current_segment),
        );
        self.heap
            .set_cell(info + frame_slots::SYNCOBJ * 4, Cell::from_ref(sync_obj));

        self.regs.method = method;
        self.regs.locals = base + frame_slots::RETURN_INFO_CELLS * 4;
        self.regs.sp = self.regs.locals + max_locals * 4;
        self.regs.pc = 0;
        self.regs.ppc = 0;
        self.regs.segment = segment;
        Ok(())
    }

    /// Pops the current frame, restoring the caller's registers from the
    /// return-info block.
    pub fn pop_frame(&mut self) {
        let info = self.regs.locals - frame_slots::RETURN_INFO_CELLS * 4;
        let locals = self.heap.word(info + frame_slots::LOCALS * 4);
        let sp = self.heap.word(info + frame_slots::SP * 4);
        let ppc = self.heap.word(info + frame_slots::PPC * 4);
        let pc = self.heap.word(info + frame_slots::PC * 4);
        let method = self.heap.word(info + frame_slots::METHOD * 4);
        let segment = self.heap.cell(info + frame_slots::STACK * 4).as_ref();

        self.regs.locals = locals;
        self.regs.sp = sp;
        self.regs.ppc = ppc;
        self.regs.pc = pc;
        self.regs.method = method;
        self.regs.segment = segment;
    }

    /// The monitor object held by the current frame's method, or null.
    pub fn frame_sync_obj(&self) -> Ref {
        self.heap
            .cell(self.regs.locals - frame_slots::RETURN_INFO_CELLS * 4 + frame_slots::SYNCOBJ * 4)
            .as_ref()
    }

    /// The registers describing `thread`'s stack: the live globals for the
    /// current thread, the saved copy for everyone else.
    pub(crate) fn thread_registers(&self, thread: crate::thread::ThreadId) -> Registers {
        if thread == self.sched.current {
            self.regs
        } else {
            self.threads.get(thread).regs
        }
    }

    // ---- visit -----------------------------------------------------------

    /// Walks `thread`'s frames top-down, skipping `start_frame` frames and
    /// then calling `visit` on up to `count` frames (all remaining when
    /// `count` is zero), stopping early when the callback returns false.
    /// The callback never sees the wedge sentinel. Returns frames visited.
    pub fn visit_frames(
        &self,
        thread: crate::thread::ThreadId,
        start_frame: u32,
        count: u32,
        mut visit: impl FnMut(&FrameView) -> bool,
    ) -> u32 {
        let regs = self.thread_registers(thread);
        if regs.segment.is_null() {
            return 0;
        }
        let mut walker = FrameWalker::top(&regs);
        let mut skipped = 0;
        let mut visited = 0;
        while !walker.is_terminal(self) {
            if skipped < start_frame {
                skipped += 1;
            } else {
                if count != 0 && visited == count {
                    break;
                }
                visited += 1;
                if !visit(&walker.view(self)) {
                    break;
                }
            }
            walker = walker.step(self);
        }
        visited
    }
}
