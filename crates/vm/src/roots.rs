//! The two GC-root stacks.
//!
//! Host code that holds an arena handle across a possible collection point
//! must register it here. The permanent stack is push-only: its entries are
//! roots for the life of the VM. The transient stack is scoped: opening a
//! block snapshots the top, closing restores it, and the try/catch protocol
//! performs the same restore on unwind, so a throw releases exactly the
//! roots pushed since the surrounding try.

use crate::cell::Ref;
use crate::error::{ExitCode, VmError, VmResult};

/// A snapshot of the transient stack top, taken at block or try entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientMark(usize);

/// The permanent and transient GC-root stacks.
pub struct RootStacks {
    permanent: Vec<Ref>,
    permanent_capacity: usize,
    transient: Vec<Ref>,
    transient_capacity: usize,
}

impl RootStacks {
    /// Builds both stacks with the configured fixed depths.
    pub fn new(permanent_capacity: usize, transient_capacity: usize) -> Self {
        Self {
            permanent: Vec::with_capacity(permanent_capacity),
            permanent_capacity,
            transient: Vec::with_capacity(transient_capacity),
            transient_capacity,
        }
    }

    /// Pushes a permanent root. Exhaustion is a fatal VM error.
    pub fn push_permanent(&mut self, reference: Ref) -> VmResult<()> {
        if self.permanent.len() == self.permanent_capacity {
            return Err(VmError::exit(
                ExitCode::PermanentRootsExhausted,
                format!("permanent root stack full at {}", self.permanent_capacity),
            ));
        }
        self.permanent.push(reference);
        Ok(())
    }

    /// Pushes a transient root into the currently open block. Exhaustion is
    /// a fatal VM error.
    pub fn push_transient(&mut self, reference: Ref) -> VmResult<()> {
        if self.transient.len() == self.transient_capacity {
            return Err(VmError::exit(
                ExitCode::TransientRootsExhausted,
                format!("transient root stack full at {}", self.transient_capacity),
            ));
        }
        self.transient.push(reference);
        Ok(())
    }

    /// Snapshots the transient top for a scoped block or a try frame.
    pub fn mark_transient(&self) -> TransientMark {
        TransientMark(self.transient.len())
    }

    /// Restores the transient top to a snapshot, releasing every root
    /// pushed since. Restoring to a stale (higher) mark is a no-op.
    pub fn release_transient(&mut self, mark: TransientMark) {
        if mark.0 <= self.transient.len() {
            self.transient.truncate(mark.0);
        }
    }

    /// Current transient top, for invariant checks.
    pub fn transient_top(&self) -> usize {
        self.transient.len()
    }

    /// Current permanent top.
    pub fn permanent_top(&self) -> usize {
        self.permanent.len()
    }

    /// All permanent roots below the top.
    pub fn permanent_roots(&self) -> &[Ref] {
        &self.permanent
    }

    /// All transient roots below the top.
    pub fn transient_roots(&self) -> &[Ref] {
        &self.transient
    }
}
