//! Allocation of language-visible objects over the arena.
//!
//! Object payloads begin with the class descriptor reference the
//! conservative scanner validates; arrays add a length word, strings hold
//! their char array, offset and length. Multi-step constructions root their
//! intermediate chunks transiently so a collection triggered by a later
//! step cannot reclaim them.

use crate::cell::{Cell, Ref};
use crate::chunk::AllocType;
use crate::class::{class_offsets, Class, PrimitiveKind};
use crate::class_builder;
use crate::error::{ThrowableKind, VmResult};
use crate::vm::Vm;

/// Byte offset of the class reference in every object-kind payload.
pub const OBJECT_CLASS_OFFSET: u32 = 0;
/// Byte offset of the first instance field cell.
pub const OBJECT_FIELDS_OFFSET: u32 = 4;

/// Array payload offsets: class, length, then elements.
pub const ARRAY_LENGTH_OFFSET: u32 = 4;
pub const ARRAY_ELEMENTS_OFFSET: u32 = 8;

/// String payload offsets: class, char array, offset, length.
pub const STRING_CHARS_OFFSET: u32 = 4;
pub const STRING_OFFSET_OFFSET: u32 = 8;
pub const STRING_LENGTH_OFFSET: u32 = 12;

/// Weak references keep their referent in instance slot 0.
pub const WEAK_REFERENT_SLOT: u32 = 0;

impl Vm {
    // ---- instances -------------------------------------------------------

    /// Allocates a zeroed instance of `class`.
    pub fn new_instance(&mut self, class: Ref) -> VmResult<Ref> {
        let cells = Class::instance_cells(&self.heap, class);
        let object = self.allocate_zeroed(
            (OBJECT_FIELDS_OFFSET + cells * 4) as usize,
            AllocType::Object,
        )?;
        self.heap
            .set_cell(object.offset() + OBJECT_CLASS_OFFSET, Cell::from_ref(class));
        Ok(object)
    }

    /// The class descriptor of any object-kind chunk.
    pub fn object_class(&self, object: Ref) -> Ref {
        self.heap
            .cell(object.offset() + OBJECT_CLASS_OFFSET)
            .as_ref()
    }

    /// Reads instance field cell `slot`.
    pub fn object_field(&self, object: Ref, slot: u32) -> Cell {
        self.heap
            .cell(object.offset() + OBJECT_FIELDS_OFFSET + slot * 4)
    }

    /// Writes instance field cell `slot`.
    pub fn set_object_field(&mut self, object: Ref, slot: u32, value: Cell) {
        self.heap
            .set_cell(object.offset() + OBJECT_FIELDS_OFFSET + slot * 4, value);
    }

    /// Reads static field cell `slot` of `class`.
    pub fn static_field(&self, class: Ref, slot: u32) -> Cell {
        self.heap.cell(Class::static_cell_addr(class, slot))
    }

    /// Writes static field cell `slot` of `class`.
    pub fn set_static_field(&mut self, class: Ref, slot: u32, value: Cell) {
        self.heap
            .set_cell(Class::static_cell_addr(class, slot), value);
    }

    // ---- arrays ----------------------------------------------------------

    /// Allocates an object array of `length` nulls.
    pub fn new_object_array(&mut self, element_class: Ref, length: i32) -> VmResult<Ref> {
        if length < 0 {
            return Err(self.raise(ThrowableKind::NegativeArraySizeException));
        }
        self.transient_scope(|vm| {
            let array_class = class_builder::build_object_array_class(vm, element_class)?;
            vm.make_transient_root(array_class)?;
            let array = vm.allocate_zeroed(
                (ARRAY_ELEMENTS_OFFSET + length as u32 * 4) as usize,
                AllocType::ArrayOfObject,
            )?;
            vm.heap
                .set_cell(array.offset(), Cell::from_ref(array_class));
            vm.heap
                .set_word(array.offset() + ARRAY_LENGTH_OFFSET, length as u32);
            Ok(array)
        })
    }

    /// Allocates a primitive array of `length` zeroed elements.
    pub fn new_primitive_array(&mut self, kind: PrimitiveKind, length: i32) -> VmResult<Ref> {
        if length < 0 {
            return Err(self.raise(ThrowableKind::NegativeArraySizeException));
        }
        self.transient_scope(|vm| {
            let array_class = class_builder::build_primitive_array_class(vm, kind)?;
            vm.make_transient_root(array_class)?;
            let bytes = ARRAY_ELEMENTS_OFFSET as usize + length as usize * kind.width() as usize;
            let array = vm.allocate_zeroed(bytes, AllocType::ArrayOfPrimitive)?;
            vm.heap
                .set_cell(array.offset(), Cell::from_ref(array_class));
            vm.heap
                .set_word(array.offset() + ARRAY_LENGTH_OFFSET, length as u32);
            Ok(array)
        })
    }

    /// Element count of any array.
    pub fn array_length(&self, array: Ref) -> u32 {
        self.heap.word(array.offset() + ARRAY_LENGTH_OFFSET)
    }

    /// Reads element `index` of an object array, bounds checked.
    pub fn object_array_get(&mut self, array: Ref, index: i32) -> VmResult<Ref> {
        let length = self.array_length(array);
        if index < 0 || index as u32 >= length {
            return Err(self.raise(ThrowableKind::ArrayIndexOutOfBoundsException));
        }
        Ok(self
            .heap
            .cell(array.offset() + ARRAY_ELEMENTS_OFFSET + index as u32 * 4)
            .as_ref())
    }

    /// Writes element `index` of an object array, bounds and store checked.
    pub fn object_array_set(&mut self, array: Ref, index: i32, value: Ref) -> VmResult<()> {
        let length = self.array_length(array);
        if index < 0 || index as u32 >= length {
            return Err(self.raise(ThrowableKind::ArrayIndexOutOfBoundsException));
        }
        if let Some(value) = value.non_null() {
            let array_class = self.object_class(array);
            let element_class = Class::element_class(&self.heap, array_class);
            if let Some(element_class) = element_class.non_null() {
                let value_class = self.object_class(value);
                if !Class::is_subclass_of(&self.heap, value_class, element_class) {
                    return Err(self.raise(ThrowableKind::ArrayStoreException));
                }
            }
        }
        self.heap.set_cell(
            array.offset() + ARRAY_ELEMENTS_OFFSET + index as u32 * 4,
            Cell::from_ref(value),
        );
        Ok(())
    }

    // ---- strings ---------------------------------------------------------

    /// Allocates a String over a fresh char array holding `text` in UTF-16.
    pub fn new_string(&mut self, text: &str) -> VmResult<Ref> {
        let units: Vec<u16> = text.encode_utf16().collect();
        self.transient_scope(|vm| {
            let chars = vm.new_primitive_array(PrimitiveKind::Char, units.len() as i32)?;
            vm.make_transient_root(chars)?;
            let elements = Ref::from_offset(chars.offset() + ARRAY_ELEMENTS_OFFSET);
            let raw = vm.heap.bytes_mut(elements, units.len() * 2);
            for (index, unit) in units.iter().enumerate() {
                raw[index * 2..index * 2 + 2].copy_from_slice(&unit.to_le_bytes());
            }

            let string = vm.allocate_zeroed(16, AllocType::String)?;
            let base = string.offset();
            vm.heap.set_cell(base, Cell::from_ref(vm.core_string()));
            vm.heap
                .set_cell(base + STRING_CHARS_OFFSET, Cell::from_ref(chars));
            vm.heap.set_word(base + STRING_OFFSET_OFFSET, 0);
            vm.heap
                .set_word(base + STRING_LENGTH_OFFSET, units.len() as u32);
            Ok(string)
        })
    }

    /// Interns a String: one object per distinct text, alive for the VM's
    /// lifetime (the collector blackens the pool every cycle).
    pub fn intern_string(&mut self, text: &str) -> VmResult<Ref> {
        if let Some(&existing) = self.interned_strings.get(text.as_bytes()) {
            return Ok(existing);
        }
        let string = self.new_string(text)?;
        self.interned_strings.insert(text.as_bytes().to_vec(), string);
        Ok(string)
    }

    /// The char array behind a String.
    pub fn string_chars(&self, string: Ref) -> Ref {
        self.heap
            .cell(string.offset() + STRING_CHARS_OFFSET)
            .as_ref()
    }

    /// Character count of a String.
    pub fn string_length(&self, string: Ref) -> u32 {
        self.heap.word(string.offset() + STRING_LENGTH_OFFSET)
    }

    /// Decodes a String back to host text.
    pub fn string_text(&self, string: Ref) -> String {
        let chars = self.string_chars(string);
        let offset = self.heap.word(string.offset() + STRING_OFFSET_OFFSET);
        let length = self.string_length(string);
        let elements = Ref::from_offset(chars.offset() + ARRAY_ELEMENTS_OFFSET + offset * 2);
        let raw = self.heap.bytes(elements, length as usize * 2);
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    }

    // ---- weak references -------------------------------------------------

    /// Allocates a weak reference to `referent`.
    pub fn new_weak_reference(&mut self, referent: Ref) -> VmResult<Ref> {
        let weak = self.new_instance(self.core_weak_reference())?;
        self.heap.set_type(weak, AllocType::WeakReference);
        self.set_weak_referent(weak, referent);
        Ok(weak)
    }

    /// The referent of a weak reference; null once cleared.
    pub fn weak_referent(&self, weak: Ref) -> Ref {
        self.object_field(weak, WEAK_REFERENT_SLOT).as_ref()
    }

    /// Installs a referent.
    pub fn set_weak_referent(&mut self, weak: Ref, referent: Ref) {
        self.set_object_field(weak, WEAK_REFERENT_SLOT, Cell::from_ref(referent));
    }

    /// The element kind of a primitive array, read through its class.
    pub fn primitive_array_kind(&self, array: Ref) -> Option<PrimitiveKind> {
        let class = self.object_class(array);
        PrimitiveKind::from_word(
            self.heap
                .word(class.offset() + class_offsets::ELEMENT_KIND),
        )
    }
}
