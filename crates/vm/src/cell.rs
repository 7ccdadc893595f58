//! The universal cell and the arena handle type.
//!
//! Every stack slot and object field is one 32-bit cell. A cell holds either
//! a signed integer, an arena reference, a bytecode offset, or half of a
//! 64-bit primitive; the interpretation is contextual and the GC treats any
//! cell as a candidate reference during conservative scanning.

/// Bytes per cell. Cells are 32-bit words; 64-bit primitives span two.
pub const CELL_BYTES: u32 = 4;

/// An arena reference: the byte offset of a chunk's payload from the arena
/// base. `Ref::NULL` (offset zero) is the null reference; the arena reserves
/// its first bytes so no payload ever sits at offset zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ref(u32);

impl Ref {
    /// The null reference.
    pub const NULL: Ref = Ref(0);

    /// Builds a reference from a raw payload offset.
    pub fn from_offset(offset: u32) -> Self {
        Ref(offset)
    }

    /// The raw payload offset.
    pub fn offset(self) -> u32 {
        self.0
    }

    /// True when this is the null reference.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Converts to `Option`, mapping null to `None`.
    pub fn non_null(self) -> Option<Ref> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

/// A cell address: the byte offset of a cell from the arena base. Frame
/// registers (stack pointer, locals base) are cell addresses.
pub type CellAddr = u32;

/// A single cell value as stored in stacks and fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cell(pub u32);

impl Cell {
    /// A zeroed cell.
    pub const ZERO: Cell = Cell(0);

    /// A cell holding a signed 32-bit integer.
    pub fn from_int(value: i32) -> Self {
        Cell(value as u32)
    }

    /// A cell holding an arena reference.
    pub fn from_ref(reference: Ref) -> Self {
        Cell(reference.offset())
    }

    /// The cell read as a signed integer.
    pub fn as_int(self) -> i32 {
        self.0 as i32
    }

    /// The cell read as an arena reference. Whether the value really is a
    /// reference is a contextual question; the conservative scanner answers
    /// it structurally.
    pub fn as_ref(self) -> Ref {
        Ref(self.0)
    }

    /// The raw word.
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Splits a 64-bit value into the (low, high) cell pair it occupies.
pub fn split_long(value: i64) -> (Cell, Cell) {
    let bits = value as u64;
    (Cell(bits as u32), Cell((bits >> 32) as u32))
}

/// Reassembles a 64-bit value from its (low, high) cell pair.
pub fn join_long(low: Cell, high: Cell) -> i64 {
    (((high.0 as u64) << 32) | low.0 as u64) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_ref() {
        assert!(Ref::NULL.is_null());
        assert_eq!(Ref::NULL.non_null(), None);
        let r = Ref::from_offset(24);
        assert!(!r.is_null());
        assert_eq!(r.non_null(), Some(r));
    }

    #[test]
    fn test_int_round_trip() {
        assert_eq!(Cell::from_int(-1).as_int(), -1);
        assert_eq!(Cell::from_int(i32::MIN).as_int(), i32::MIN);
        assert_eq!(Cell::from_int(i32::MAX).as_int(), i32::MAX);
    }

    #[test]
    fn test_long_split_join() {
        for value in [0i64, -1, i64::MIN, i64::MAX, 0x1234_5678_9abc_def0] {
            let (low, high) = split_long(value);
            assert_eq!(join_long(low, high), value);
        }
    }
}
