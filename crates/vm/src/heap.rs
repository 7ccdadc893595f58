//! The unified heap: a single fixed-size arena shared by VM bookkeeping and
//! language-visible objects.
//!
//! Allocation is coalescing best-fit over an address-ordered free list.
//! Chunks are contiguous, so a header walk from the arena base reaches
//! exactly the end of the heap; the sweep relies on this. The heap never
//! grows. Callers that want the collect-and-retry behaviour allocate through
//! [`crate::vm::Vm::allocate`]; the methods here never collect.

use crate::cell::{Cell, CellAddr, Ref};
use crate::chunk::{
    align_size, AllocType, ChunkHeader, Colour, CHUNK_ALIGNMENT, CHUNK_HEADER_BYTES,
    MAX_CHUNK_SIZE,
};
use crate::error::{ExitCode, VmError, VmResult};

/// The first chunk starts here; the pad below it keeps chunk offset zero
/// unused so zero can mean "none" in the free list and `Ref::NULL` never
/// aliases a payload.
const ARENA_PAD: u32 = 8;

/// Smallest payload: one word for the free-list link plus alignment.
const MIN_PAYLOAD: u32 = CHUNK_ALIGNMENT;

/// Splitting a free chunk must leave room for a header and a minimal payload.
const MIN_SPLIT: u32 = CHUNK_HEADER_BYTES + MIN_PAYLOAD;

/// Usage statistics over the whole arena, gathered by a header walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Total arena bytes
    pub capacity: u32,
    /// Bytes below the first chunk
    pub reserved: u32,
    /// Number of in-use chunks
    pub in_use_chunks: u32,
    /// Payload bytes in use
    pub in_use_bytes: u32,
    /// Number of free chunks
    pub free_chunks: u32,
    /// Payload bytes on the free list
    pub free_bytes: u32,
    /// Header bytes across all chunks
    pub header_bytes: u32,
    /// Largest single free payload
    pub largest_free: u32,
}

/// A chunk seen during a heap walk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkView {
    /// Payload handle
    pub payload: Ref,
    /// Decoded header
    pub header: ChunkHeader,
}

/// The fixed-size arena and its allocator.
pub struct Heap {
    arena: Vec<u8>,
    capacity: u32,
    /// Chunk offset of the first free chunk in address order; 0 = none
    free_head: u32,
}

impl Heap {
    /// Builds a heap of `capacity` bytes holding one spanning free chunk.
    pub fn new(capacity: usize) -> VmResult<Self> {
        let capacity = u32::try_from(capacity).map_err(|_| {
            VmError::exit(ExitCode::PlatformTypeSize, "heap size exceeds u32 range")
        })?;
        if capacity <= ARENA_PAD + MIN_SPLIT {
            return Err(VmError::exit(
                ExitCode::OutOfMemory,
                format!("heap of {capacity} bytes is too small to hold any chunk"),
            ));
        }
        let mut heap = Self {
            arena: vec![0u8; capacity as usize],
            capacity,
            free_head: ARENA_PAD,
        };
        let span = capacity - ARENA_PAD - CHUNK_HEADER_BYTES;
        heap.write_header(
            ARENA_PAD,
            ChunkHeader::new(false, Colour::White, AllocType::Data, span),
        );
        heap.set_free_link(ARENA_PAD, 0);
        Ok(heap)
    }

    /// Total arena bytes.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    // ---- raw word access -------------------------------------------------

    /// Reads a 32-bit word at a byte offset.
    pub fn word(&self, addr: CellAddr) -> u32 {
        let i = addr as usize;
        u32::from_le_bytes([
            self.arena[i],
            self.arena[i + 1],
            self.arena[i + 2],
            self.arena[i + 3],
        ])
    }

    /// Writes a 32-bit word at a byte offset.
    pub fn set_word(&mut self, addr: CellAddr, value: u32) {
        let i = addr as usize;
        self.arena[i..i + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Reads a cell.
    pub fn cell(&self, addr: CellAddr) -> Cell {
        Cell(self.word(addr))
    }

    /// Writes a cell.
    pub fn set_cell(&mut self, addr: CellAddr, cell: Cell) {
        self.set_word(addr, cell.0);
    }

    /// Borrows `len` payload bytes starting at a handle.
    pub fn bytes(&self, reference: Ref, len: usize) -> &[u8] {
        let start = reference.offset() as usize;
        &self.arena[start..start + len]
    }

    /// Mutably borrows `len` payload bytes starting at a handle.
    pub fn bytes_mut(&mut self, reference: Ref, len: usize) -> &mut [u8] {
        let start = reference.offset() as usize;
        &mut self.arena[start..start + len]
    }

    // ---- header access ---------------------------------------------------

    fn write_header(&mut self, chunk_off: u32, header: ChunkHeader) {
        self.set_word(chunk_off, header.raw());
    }

    pub(crate) fn header_at(&self, chunk_off: u32) -> ChunkHeader {
        ChunkHeader::from_raw(self.word(chunk_off))
    }

    pub(crate) fn chunk_offset_of(&self, reference: Ref) -> u32 {
        reference.offset() - CHUNK_HEADER_BYTES
    }

    pub(crate) fn payload_of(&self, chunk_off: u32) -> Ref {
        Ref::from_offset(chunk_off + CHUNK_HEADER_BYTES)
    }

    /// The decoded header of the chunk owning `reference`.
    pub fn chunk_header(&self, reference: Ref) -> ChunkHeader {
        self.header_at(self.chunk_offset_of(reference))
    }

    /// The allocation type of a chunk; `None` when the tag is corrupt.
    pub fn alloc_type(&self, reference: Ref) -> Option<AllocType> {
        self.chunk_header(reference).alloc_type()
    }

    /// Restamps the allocation type of an in-use chunk.
    pub fn set_type(&mut self, reference: Ref, alloc_type: AllocType) {
        let chunk_off = self.chunk_offset_of(reference);
        let header = self.header_at(chunk_off).with_type(alloc_type);
        self.write_header(chunk_off, header);
    }

    /// The GC colour of a chunk.
    pub fn colour(&self, reference: Ref) -> Colour {
        self.chunk_header(reference).colour()
    }

    /// Recolours a chunk.
    pub fn set_colour(&mut self, reference: Ref, colour: Colour) {
        let chunk_off = self.chunk_offset_of(reference);
        let header = self.header_at(chunk_off).with_colour(colour);
        self.write_header(chunk_off, header);
    }

    /// The in-use bit of a chunk.
    pub fn in_use(&self, reference: Ref) -> bool {
        self.chunk_header(reference).in_use()
    }

    /// Payload size in bytes of a chunk.
    pub fn chunk_size(&self, reference: Ref) -> u32 {
        self.chunk_header(reference).size()
    }

    /// Structural validity of an in-use chunk handle: range, alignment,
    /// in-use bit, decodable type, and a size that stays inside the arena.
    pub fn is_valid_chunk(&self, reference: Ref) -> bool {
        let off = reference.offset();
        if off < ARENA_PAD + CHUNK_HEADER_BYTES || off >= self.capacity {
            return false;
        }
        if off % CHUNK_ALIGNMENT != 0 {
            return false;
        }
        let header = self.chunk_header(reference);
        if !header.in_use() || header.alloc_type().is_none() {
            return false;
        }
        let size = header.size();
        size % CHUNK_ALIGNMENT == 0 && off + size <= self.capacity
    }

    // ---- free list -------------------------------------------------------

    fn free_link(&self, chunk_off: u32) -> u32 {
        self.word(chunk_off + CHUNK_HEADER_BYTES)
    }

    fn set_free_link(&mut self, chunk_off: u32, next: u32) {
        self.set_word(chunk_off + CHUNK_HEADER_BYTES, next);
    }

    // ---- allocate / free -------------------------------------------------

    /// Allocates `size` payload bytes stamped with `alloc_type`, or `None`
    /// when no free chunk fits. New chunks come out white.
    pub fn alloc(&mut self, size: usize, alloc_type: AllocType) -> Option<Ref> {
        let size = u32::try_from(size).ok()?;
        if size > MAX_CHUNK_SIZE {
            return None;
        }
        let wanted = align_size(size.max(MIN_PAYLOAD));

        // Best fit: smallest free chunk that holds the request.
        let mut prev_of_best = 0u32;
        let mut best = 0u32;
        let mut best_size = u32::MAX;
        let mut prev = 0u32;
        let mut cursor = self.free_head;
        while cursor != 0 {
            let avail = self.header_at(cursor).size();
            if avail >= wanted && avail < best_size {
                prev_of_best = prev;
                best = cursor;
                best_size = avail;
                if avail == wanted {
                    break;
                }
            }
            prev = cursor;
            cursor = self.free_link(cursor);
        }
        if best == 0 {
            return None;
        }

        let next = self.free_link(best);
        if best_size >= wanted + MIN_SPLIT {
            // Split: the allocation takes the front, the remainder stays free
            // at the same position in address order.
            let rest_off = best + CHUNK_HEADER_BYTES + wanted;
            let rest_size = best_size - wanted - CHUNK_HEADER_BYTES;
            self.write_header(
                rest_off,
                ChunkHeader::new(false, Colour::White, AllocType::Data, rest_size),
            );
            self.set_free_link(rest_off, next);
            self.relink(prev_of_best, rest_off);
            self.write_header(best, ChunkHeader::new(true, Colour::White, alloc_type, wanted));
        } else {
            // Take the whole chunk.
            self.relink(prev_of_best, next);
            self.write_header(
                best,
                ChunkHeader::new(true, Colour::White, alloc_type, best_size),
            );
        }
        Some(self.payload_of(best))
    }

    /// Allocates and zeroes.
    pub fn calloc(&mut self, size: usize, alloc_type: AllocType) -> Option<Ref> {
        let reference = self.alloc(size, alloc_type)?;
        let len = self.chunk_size(reference) as usize;
        self.bytes_mut(reference, len).fill(0);
        Some(reference)
    }

    fn relink(&mut self, prev: u32, next: u32) {
        if prev == 0 {
            self.free_head = next;
        } else {
            self.set_free_link(prev, next);
        }
    }

    /// Frees a chunk, merging with free neighbours. Returns the chunk offset
    /// of the resulting free chunk (which may start before the freed one
    /// when a backward merge happened); the sweep uses this to keep walking.
    ///
    /// An invalid handle is a fatal VM error.
    pub fn free(&mut self, reference: Ref) -> VmResult<u32> {
        if !self.is_valid_chunk(reference) {
            return Err(VmError::exit(
                ExitCode::InvalidChunk,
                format!("free of invalid chunk at {:#x}", reference.offset()),
            ));
        }
        let chunk_off = self.chunk_offset_of(reference);
        let size = self.header_at(chunk_off).size();
        self.write_header(
            chunk_off,
            ChunkHeader::new(false, Colour::White, AllocType::Data, size),
        );

        // Find the free-list neighbours in address order.
        let mut prev = 0u32;
        let mut next = self.free_head;
        while next != 0 && next < chunk_off {
            prev = next;
            next = self.free_link(next);
        }

        let mut merged = chunk_off;
        if prev != 0 && prev + CHUNK_HEADER_BYTES + self.header_at(prev).size() == chunk_off {
            // Merge backward: the previous free chunk absorbs this one.
            let grown = self.header_at(prev).size() + CHUNK_HEADER_BYTES + size;
            let header = self.header_at(prev);
            self.write_header(prev, ChunkHeader::new(false, header.colour(), AllocType::Data, grown));
            merged = prev;
        } else {
            self.set_free_link(chunk_off, next);
            self.relink(prev, chunk_off);
        }

        let merged_size = self.header_at(merged).size();
        if next != 0 && merged + CHUNK_HEADER_BYTES + merged_size == next {
            // Merge forward: absorb the following free chunk.
            let grown = merged_size + CHUNK_HEADER_BYTES + self.header_at(next).size();
            self.write_header(
                merged,
                ChunkHeader::new(false, Colour::White, AllocType::Data, grown),
            );
            let after = self.free_link(next);
            self.set_free_link(merged, after);
        }
        Ok(merged)
    }

    /// Duplicates a chunk, payload and type alike. The clone comes out white.
    ///
    /// An invalid handle is a fatal VM error; `None` means the heap is full.
    pub fn clone_chunk(&mut self, reference: Ref) -> VmResult<Option<Ref>> {
        if !self.is_valid_chunk(reference) {
            return Err(VmError::exit(
                ExitCode::InvalidChunk,
                format!("clone of invalid chunk at {:#x}", reference.offset()),
            ));
        }
        let header = self.chunk_header(reference);
        let size = header.size() as usize;
        let alloc_type = match header.alloc_type() {
            Some(t) => t,
            None => {
                return Err(VmError::exit(
                    ExitCode::InvalidChunk,
                    "clone of chunk with corrupt type tag",
                ))
            }
        };
        let Some(copy) = self.alloc(size, alloc_type) else {
            return Ok(None);
        };
        let src = reference.offset() as usize;
        let dst = copy.offset() as usize;
        self.arena.copy_within(src..src + size, dst);
        Ok(Some(copy))
    }

    // ---- walking ---------------------------------------------------------

    pub(crate) fn first_chunk_offset(&self) -> u32 {
        ARENA_PAD
    }

    pub(crate) fn next_chunk_offset(&self, chunk_off: u32) -> u32 {
        chunk_off + CHUNK_HEADER_BYTES + self.header_at(chunk_off).size()
    }

    pub(crate) fn end_offset(&self) -> u32 {
        self.capacity
    }

    /// Walks every chunk in address order.
    pub fn walk(&self, mut visit: impl FnMut(ChunkView)) {
        let mut off = self.first_chunk_offset();
        while off < self.capacity {
            let header = self.header_at(off);
            visit(ChunkView {
                payload: self.payload_of(off),
                header,
            });
            off = self.next_chunk_offset(off);
        }
    }

    /// Gathers usage statistics with a full header walk.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            capacity: self.capacity,
            reserved: ARENA_PAD,
            in_use_chunks: 0,
            in_use_bytes: 0,
            free_chunks: 0,
            free_bytes: 0,
            header_bytes: 0,
            largest_free: 0,
        };
        self.walk(|chunk| {
            stats.header_bytes += CHUNK_HEADER_BYTES;
            if chunk.header.in_use() {
                stats.in_use_chunks += 1;
                stats.in_use_bytes += chunk.header.size();
            } else {
                stats.free_chunks += 1;
                stats.free_bytes += chunk.header.size();
                stats.largest_free = stats.largest_free.max(chunk.header.size());
            }
        });
        stats
    }
}
