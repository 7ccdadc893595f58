//! Class, field and method descriptor layouts over the arena.
//!
//! Class descriptors are INSTANCE_CLAZZ / ARRAY_CLAZZ / PRIMITIVE_CLAZZ
//! chunks; their tables (fields, methods, constant pool, interfaces, static
//! longs, bytecode) are DATA sub-chunks freed with the class when it
//! unloads. Every class payload begins with the magic word the conservative
//! stack scanner checks, followed by the classloader back-pointer the GC
//! marks.
//!
//! Accessors are associated functions over `(&Heap, Ref)` so the collector
//! can use them while it holds the heap alone.

use crate::cell::{Cell, Ref};
use crate::heap::Heap;
use bitflags::bitflags;
use hashbrown::HashMap;

/// The magic word at offset 0 of every class payload. Cell values that
/// claim to be object references must point at a chunk whose class carries
/// this word before the conservative scanner will follow them.
pub const CLASS_MAGIC: u32 = 0xBABE_C1A5;

/// Byte offsets shared by all class kinds.
pub mod class_offsets {
    /// Magic word
    pub const MAGIC: u32 = 0;
    /// Classloader object back-pointer
    pub const LOADER: u32 = 4;
    /// Super class
    pub const SUPER: u32 = 8;
    /// Lifecycle state
    pub const STATE: u32 = 12;
    /// Access flags
    pub const FLAGS: u32 = 16;
    /// Interned UTF name
    pub const NAME: u32 = 20;

    // Instance-class extras.
    /// JNI-style signature
    pub const SIGNATURE: u32 = 24;
    /// Field descriptor table (DATA)
    pub const FIELD_TABLE: u32 = 28;
    /// Declared field count (statics first)
    pub const FIELD_COUNT: u32 = 32;
    /// Boundary: fields below this index are static
    pub const STATIC_COUNT: u32 = 36;
    /// Total instance cells, inherited included
    pub const INSTANCE_CELLS: u32 = 40;
    /// Method descriptor table (DATA)
    pub const METHOD_TABLE: u32 = 44;
    /// Method count
    pub const METHOD_COUNT: u32 = 48;
    /// Constant pool (DATA)
    pub const CONSTANT_POOL: u32 = 52;
    /// Interface list (DATA)
    pub const INTERFACES: u32 = 56;
    /// Interface count
    pub const INTERFACE_COUNT: u32 = 60;
    /// 64-bit static slab (DATA)
    pub const STATIC_LONGS: u32 = 64;
    /// The associated Class object
    pub const CLASS_OBJECT: u32 = 68;
    /// Cells in the inline statics area
    pub const STATIC_CELLS: u32 = 72;
    /// First byte of the inline statics area
    pub const STATICS: u32 = 76;

    // Array-class extras (after NAME).
    /// Element class for object arrays
    pub const ELEMENT_CLASS: u32 = 24;
    /// Element kind for primitive arrays
    pub const ELEMENT_KIND: u32 = 28;
    /// Array-class payload size
    pub const ARRAY_CLAZZ_BYTES: u32 = 32;

    // Primitive-class extras (after NAME).
    /// Primitive kind
    pub const PRIMITIVE_KIND: u32 = 24;
    /// Primitive-class payload size
    pub const PRIMITIVE_CLAZZ_BYTES: u32 = 28;
}

/// Class lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ClassState {
    Loading = 0,
    Loaded = 1,
    Verified = 2,
    Prepared = 3,
    Initialising = 4,
    Initialised = 5,
    Error = 6,
}

impl ClassState {
    /// Decodes a state word; corrupt values read as `Error`.
    pub fn from_word(word: u32) -> ClassState {
        match word {
            0 => Self::Loading,
            1 => Self::Loaded,
            2 => Self::Verified,
            3 => Self::Prepared,
            4 => Self::Initialising,
            5 => Self::Initialised,
            _ => Self::Error,
        }
    }
}

bitflags! {
    /// Field access and layout flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldFlags: u32 {
        const STATIC = 1 << 0;
        /// The field holds an arena reference and is scanned by the GC
        const REFERENCE = 1 << 1;
        /// The field spans two cells
        const LONG = 1 << 2;
        const FINAL = 1 << 3;
        const VOLATILE = 1 << 4;
        const TRANSIENT = 1 << 5;
    }
}

bitflags! {
    /// Method access flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodFlags: u32 {
        const STATIC = 1 << 0;
        const SYNCHRONIZED = 1 << 1;
        const NATIVE = 1 << 2;
        const ABSTRACT = 1 << 3;
        const FINAL = 1 << 4;
        const PUBLIC = 1 << 5;
        const PRIVATE = 1 << 6;
        const PROTECTED = 1 << 7;
    }
}

/// Element kinds for primitive arrays; the value encodes the element width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PrimitiveKind {
    Boolean = 1,
    Byte = 2,
    Char = 3,
    Short = 4,
    Int = 5,
    Float = 6,
    Long = 7,
    Double = 8,
}

impl PrimitiveKind {
    /// Decodes a kind word.
    pub fn from_word(word: u32) -> Option<PrimitiveKind> {
        match word {
            1 => Some(Self::Boolean),
            2 => Some(Self::Byte),
            3 => Some(Self::Char),
            4 => Some(Self::Short),
            5 => Some(Self::Int),
            6 => Some(Self::Float),
            7 => Some(Self::Long),
            8 => Some(Self::Double),
            _ => None,
        }
    }

    /// Element width in bytes.
    pub fn width(self) -> u32 {
        match self {
            Self::Boolean | Self::Byte => 1,
            Self::Char | Self::Short => 2,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double => 8,
        }
    }
}

/// Bytes per field descriptor record.
pub const FIELD_RECORD_BYTES: u32 = 16;

/// Field record word offsets.
mod field_offsets {
    pub const NAME: u32 = 0;
    pub const FLAGS: u32 = 4;
    pub const SLOT: u32 = 8;
    pub const SIGNATURE: u32 = 12;
}

/// Bytes per method descriptor record.
pub const METHOD_RECORD_BYTES: u32 = 48;

/// Method record word offsets.
mod method_offsets {
    pub const CLASS: u32 = 0;
    pub const NAME: u32 = 4;
    pub const SIGNATURE: u32 = 8;
    pub const FLAGS: u32 = 12;
    pub const BYTECODE: u32 = 16;
    pub const BYTECODE_LEN: u32 = 20;
    pub const MAX_STACK: u32 = 24;
    pub const MAX_LOCALS: u32 = 28;
    pub const ARG_CELLS: u32 = 32;
    pub const EXCEPTION_TABLE: u32 = 36;
    pub const LINE_TABLE: u32 = 40;
    pub const LOCALVAR_TABLE: u32 = 44;
}

/// The arena address of a method descriptor record.
pub type MethodAddr = u32;

/// Accessors over class payloads.
pub struct Class;

impl Class {
    /// The magic word.
    pub fn magic(heap: &Heap, class: Ref) -> u32 {
        heap.word(class.offset() + class_offsets::MAGIC)
    }

    /// The classloader object, or null for the boot loader.
    pub fn loader(heap: &Heap, class: Ref) -> Ref {
        heap.cell(class.offset() + class_offsets::LOADER).as_ref()
    }

    /// The super class, or null for the root class.
    pub fn super_class(heap: &Heap, class: Ref) -> Ref {
        heap.cell(class.offset() + class_offsets::SUPER).as_ref()
    }

    /// The lifecycle state.
    pub fn state(heap: &Heap, class: Ref) -> ClassState {
        ClassState::from_word(heap.word(class.offset() + class_offsets::STATE))
    }

    /// Moves the lifecycle state.
    pub fn set_state(heap: &mut Heap, class: Ref, state: ClassState) {
        heap.set_word(class.offset() + class_offsets::STATE, state as u32);
    }

    /// The interned UTF name entry.
    pub fn name(heap: &Heap, class: Ref) -> Ref {
        heap.cell(class.offset() + class_offsets::NAME).as_ref()
    }

    /// The JNI-style signature entry.
    pub fn signature(heap: &Heap, class: Ref) -> Ref {
        heap.cell(class.offset() + class_offsets::SIGNATURE).as_ref()
    }

    /// The field descriptor table chunk.
    pub fn field_table(heap: &Heap, class: Ref) -> Ref {
        heap.cell(class.offset() + class_offsets::FIELD_TABLE).as_ref()
    }

    /// Declared field count (statics first).
    pub fn field_count(heap: &Heap, class: Ref) -> u32 {
        heap.word(class.offset() + class_offsets::FIELD_COUNT)
    }

    /// Fields below this index are static; at or above, instance.
    pub fn static_count(heap: &Heap, class: Ref) -> u32 {
        heap.word(class.offset() + class_offsets::STATIC_COUNT)
    }

    /// Total instance cells for instances of this class, inherited included.
    pub fn instance_cells(heap: &Heap, class: Ref) -> u32 {
        heap.word(class.offset() + class_offsets::INSTANCE_CELLS)
    }

    /// The method table chunk.
    pub fn method_table(heap: &Heap, class: Ref) -> Ref {
        heap.cell(class.offset() + class_offsets::METHOD_TABLE).as_ref()
    }

    /// Method count.
    pub fn method_count(heap: &Heap, class: Ref) -> u32 {
        heap.word(class.offset() + class_offsets::METHOD_COUNT)
    }

    /// The constant pool chunk.
    pub fn constant_pool(heap: &Heap, class: Ref) -> Ref {
        heap.cell(class.offset() + class_offsets::CONSTANT_POOL).as_ref()
    }

    /// The interface list chunk.
    pub fn interfaces(heap: &Heap, class: Ref) -> Ref {
        heap.cell(class.offset() + class_offsets::INTERFACES).as_ref()
    }

    /// Interface count.
    pub fn interface_count(heap: &Heap, class: Ref) -> u32 {
        heap.word(class.offset() + class_offsets::INTERFACE_COUNT)
    }

    /// The 64-bit static slab chunk.
    pub fn static_longs(heap: &Heap, class: Ref) -> Ref {
        heap.cell(class.offset() + class_offsets::STATIC_LONGS).as_ref()
    }

    /// The associated Class object.
    pub fn class_object(heap: &Heap, class: Ref) -> Ref {
        heap.cell(class.offset() + class_offsets::CLASS_OBJECT).as_ref()
    }

    /// Installs the associated Class object.
    pub fn set_class_object(heap: &mut Heap, class: Ref, object: Ref) {
        heap.set_cell(
            class.offset() + class_offsets::CLASS_OBJECT,
            Cell::from_ref(object),
        );
    }

    /// Cells in the inline statics area.
    pub fn static_cells(heap: &Heap, class: Ref) -> u32 {
        heap.word(class.offset() + class_offsets::STATIC_CELLS)
    }

    /// The arena address of static cell `slot`.
    pub fn static_cell_addr(class: Ref, slot: u32) -> u32 {
        class.offset() + class_offsets::STATICS + slot * 4
    }

    /// The arena address of field record `index` in the field table.
    pub fn field_record(heap: &Heap, class: Ref, index: u32) -> u32 {
        Class::field_table(heap, class).offset() + index * FIELD_RECORD_BYTES
    }

    /// The arena address of method record `index` in the method table.
    pub fn method_record(heap: &Heap, class: Ref, index: u32) -> MethodAddr {
        Class::method_table(heap, class).offset() + index * METHOD_RECORD_BYTES
    }

    /// The element class of an object-array class.
    pub fn element_class(heap: &Heap, class: Ref) -> Ref {
        heap.cell(class.offset() + class_offsets::ELEMENT_CLASS).as_ref()
    }

    /// The element kind of a primitive-array class.
    pub fn element_kind(heap: &Heap, class: Ref) -> Option<PrimitiveKind> {
        PrimitiveKind::from_word(heap.word(class.offset() + class_offsets::ELEMENT_KIND))
    }

    /// Walks the super chain testing whether `class` is `ancestor` or a
    /// subclass of it.
    pub fn is_subclass_of(heap: &Heap, class: Ref, ancestor: Ref) -> bool {
        let mut cursor = class;
        while let Some(current) = cursor.non_null() {
            if current == ancestor {
                return true;
            }
            cursor = Class::super_class(heap, current);
        }
        false
    }

    /// Searches this class and then its supers for a method by interned
    /// name and signature entries.
    pub fn find_method(heap: &Heap, class: Ref, name: Ref, signature: Ref) -> Option<MethodAddr> {
        let mut cursor = class;
        while let Some(current) = cursor.non_null() {
            for index in 0..Class::method_count(heap, current) {
                let method = Class::method_record(heap, current, index);
                if Method::name(heap, method) == name
                    && Method::signature(heap, method) == signature
                {
                    return Some(method);
                }
            }
            cursor = Class::super_class(heap, current);
        }
        None
    }
}

/// Accessors over field descriptor records.
pub struct Field;

impl Field {
    /// The interned UTF name entry.
    pub fn name(heap: &Heap, record: u32) -> Ref {
        heap.cell(record + field_offsets::NAME).as_ref()
    }

    /// The field flags.
    pub fn flags(heap: &Heap, record: u32) -> FieldFlags {
        FieldFlags::from_bits_truncate(heap.word(record + field_offsets::FLAGS))
    }

    /// The cell slot: index into the statics area for static fields, into
    /// the instance payload for the rest.
    pub fn slot(heap: &Heap, record: u32) -> u32 {
        heap.word(record + field_offsets::SLOT)
    }

    /// The interned UTF signature entry.
    pub fn signature(heap: &Heap, record: u32) -> Ref {
        heap.cell(record + field_offsets::SIGNATURE).as_ref()
    }
}

/// Accessors over method descriptor records.
pub struct Method;

impl Method {
    /// The declaring class.
    pub fn class(heap: &Heap, method: MethodAddr) -> Ref {
        heap.cell(method + method_offsets::CLASS).as_ref()
    }

    /// The interned UTF name entry.
    pub fn name(heap: &Heap, method: MethodAddr) -> Ref {
        heap.cell(method + method_offsets::NAME).as_ref()
    }

    /// The interned UTF signature entry.
    pub fn signature(heap: &Heap, method: MethodAddr) -> Ref {
        heap.cell(method + method_offsets::SIGNATURE).as_ref()
    }

    /// The method flags.
    pub fn flags(heap: &Heap, method: MethodAddr) -> MethodFlags {
        MethodFlags::from_bits_truncate(heap.word(method + method_offsets::FLAGS))
    }

    /// The bytecode chunk; null for native and abstract methods.
    pub fn bytecode(heap: &Heap, method: MethodAddr) -> Ref {
        heap.cell(method + method_offsets::BYTECODE).as_ref()
    }

    /// Bytecode length in bytes.
    pub fn bytecode_len(heap: &Heap, method: MethodAddr) -> u32 {
        heap.word(method + method_offsets::BYTECODE_LEN)
    }

    /// Operand stack height in cells.
    pub fn max_stack(heap: &Heap, method: MethodAddr) -> u32 {
        heap.word(method + method_offsets::MAX_STACK)
    }

    /// Local variable area in cells.
    pub fn max_locals(heap: &Heap, method: MethodAddr) -> u32 {
        heap.word(method + method_offsets::MAX_LOCALS)
    }

    /// Argument cells, receiver excluded.
    pub fn arg_cells(heap: &Heap, method: MethodAddr) -> u32 {
        heap.word(method + method_offsets::ARG_CELLS)
    }

    /// The exception table chunk (count word then 4-word entries), or null.
    pub fn exception_table(heap: &Heap, method: MethodAddr) -> Ref {
        heap.cell(method + method_offsets::EXCEPTION_TABLE).as_ref()
    }

    /// The line number table chunk, or null.
    pub fn line_table(heap: &Heap, method: MethodAddr) -> Ref {
        heap.cell(method + method_offsets::LINE_TABLE).as_ref()
    }

    /// The local variable table chunk, or null.
    pub fn localvar_table(heap: &Heap, method: MethodAddr) -> Ref {
        heap.cell(method + method_offsets::LOCALVAR_TABLE).as_ref()
    }

    /// Cells the caller must expose for a native call: the arguments plus
    /// the receiver for instance methods.
    pub fn native_arg_span(heap: &Heap, method: MethodAddr) -> u32 {
        let receiver = if Method::flags(heap, method).contains(MethodFlags::STATIC) {
            0
        } else {
            1
        };
        Method::arg_cells(heap, method) + receiver
    }

    /// Finds the handler covering `pc` for a thrown class, searching the
    /// exception table in order. A null catch class is a catch-all entry.
    pub fn find_handler(
        heap: &Heap,
        method: MethodAddr,
        pc: u32,
        thrown_class: Ref,
    ) -> Option<u32> {
        let table = Method::exception_table(heap, method).non_null()?;
        let count = heap.word(table.offset());
        for index in 0..count {
            let entry = table.offset() + 4 + index * 16;
            let start = heap.word(entry);
            let end = heap.word(entry + 4);
            let handler = heap.word(entry + 8);
            let catch_class = heap.cell(entry + 12).as_ref();
            if pc >= start && pc < end {
                if catch_class.is_null()
                    || Class::is_subclass_of(heap, thrown_class, catch_class)
                {
                    return Some(handler);
                }
            }
        }
        None
    }
}

/// The loaded-class pool, keyed by (loader, name bytes).
#[derive(Default)]
pub struct ClassPool {
    map: HashMap<(u32, Vec<u8>), Ref>,
}

impl ClassPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class under its loader and name.
    pub fn add(&mut self, loader: Ref, name: &[u8], class: Ref) {
        self.map.insert((loader.offset(), name.to_vec()), class);
    }

    /// Looks a class up by loader and name.
    pub fn get(&self, loader: Ref, name: &[u8]) -> Option<Ref> {
        self.map.get(&(loader.offset(), name.to_vec())).copied()
    }

    /// Removes a class being unloaded, keyed through its name entry.
    pub fn remove(&mut self, heap: &Heap, class: Ref) {
        let loader = Class::loader(heap, class);
        let name = crate::pools::UtfPool::bytes_of(heap, Class::name(heap, class)).to_vec();
        self.map.remove(&(loader.offset(), name));
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no classes are registered.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All registered classes.
    pub fn classes(&self) -> impl Iterator<Item = Ref> + '_ {
        self.map.values().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_state_decoding() {
        assert_eq!(ClassState::from_word(0), ClassState::Loading);
        assert_eq!(ClassState::from_word(5), ClassState::Initialised);
        assert_eq!(ClassState::from_word(99), ClassState::Error);
        assert!(ClassState::Initialised > ClassState::Initialising);
    }

    #[test]
    fn test_primitive_widths() {
        assert_eq!(PrimitiveKind::Byte.width(), 1);
        assert_eq!(PrimitiveKind::Char.width(), 2);
        assert_eq!(PrimitiveKind::Int.width(), 4);
        assert_eq!(PrimitiveKind::Double.width(), 8);
        assert_eq!(PrimitiveKind::from_word(0), None);
    }

    #[test]
    fn test_field_flags() {
        let flags = FieldFlags::STATIC | FieldFlags::REFERENCE;
        assert!(flags.contains(FieldFlags::STATIC));
        assert!(!flags.contains(FieldFlags::LONG));
    }
}
