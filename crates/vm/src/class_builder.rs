//! Programmatic construction of class descriptors directly into the arena.
//!
//! This is the seam the external class-file parser targets, and the way
//! tests and the bootstrap build classes. Descriptor sub-structures (field
//! and method tables, bytecode, exception tables, array-class name buffers)
//! are STATIC chunks: the collector never scans or frees them, and class
//! unloading releases them explicitly during sweep.

use crate::cell::{Cell, Ref};
use crate::chunk::AllocType;
use crate::class::{
    class_offsets, Class, ClassState, FieldFlags, MethodAddr, MethodFlags, PrimitiveKind,
    CLASS_MAGIC, FIELD_RECORD_BYTES, METHOD_RECORD_BYTES,
};
use crate::error::VmResult;
use crate::vm::Vm;

/// A declared exception handler range.
#[derive(Debug, Clone, Copy)]
pub struct HandlerDecl {
    /// First covered bytecode offset
    pub start_pc: u32,
    /// End of the covered range, exclusive
    pub end_pc: u32,
    /// Handler entry offset
    pub handler_pc: u32,
    /// Caught class; null is a catch-all
    pub catch_class: Ref,
}

/// A method under construction.
#[derive(Debug, Clone)]
pub struct MethodDecl {
    name: String,
    signature: String,
    flags: MethodFlags,
    bytecode: Vec<u8>,
    max_stack: u32,
    max_locals: u32,
    arg_cells: Option<u32>,
    handlers: Vec<HandlerDecl>,
}

impl MethodDecl {
    /// A bytecode method with empty code and default limits.
    pub fn new(name: &str, signature: &str) -> Self {
        Self {
            name: name.to_owned(),
            signature: signature.to_owned(),
            flags: MethodFlags::empty(),
            bytecode: Vec::new(),
            max_stack: 1,
            max_locals: 1,
            arg_cells: None,
            handlers: Vec::new(),
        }
    }

    /// Sets the access flags.
    pub fn flags(mut self, flags: MethodFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the bytecode body.
    pub fn bytecode(mut self, code: Vec<u8>) -> Self {
        self.bytecode = code;
        self
    }

    /// Sets the operand stack height in cells.
    pub fn max_stack(mut self, cells: u32) -> Self {
        self.max_stack = cells;
        self
    }

    /// Sets the local variable area in cells.
    pub fn max_locals(mut self, cells: u32) -> Self {
        self.max_locals = cells;
        self
    }

    /// Overrides the argument cell count derived from the signature.
    pub fn arg_cells(mut self, cells: u32) -> Self {
        self.arg_cells = Some(cells);
        self
    }

    /// Adds an exception handler entry.
    pub fn handler(mut self, decl: HandlerDecl) -> Self {
        self.handlers.push(decl);
        self
    }
}

#[derive(Debug, Clone)]
struct FieldDecl {
    name: String,
    signature: String,
    flags: FieldFlags,
}

/// Builds an instance class descriptor in the arena.
pub struct ClassBuilder {
    name: String,
    signature: Option<String>,
    loader: Ref,
    super_class: Ref,
    access_flags: u32,
    state: ClassState,
    fields: Vec<FieldDecl>,
    methods: Vec<MethodDecl>,
}

impl ClassBuilder {
    /// Starts a class with an internal (slash-separated) name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            signature: None,
            loader: Ref::NULL,
            super_class: Ref::NULL,
            access_flags: 0,
            state: ClassState::Initialised,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Sets the defining classloader object; null is the boot loader.
    pub fn loader(mut self, loader: Ref) -> Self {
        self.loader = loader;
        self
    }

    /// Sets the super class.
    pub fn super_class(mut self, super_class: Ref) -> Self {
        self.super_class = super_class;
        self
    }

    /// Sets the class access flags.
    pub fn access_flags(mut self, flags: u32) -> Self {
        self.access_flags = flags;
        self
    }

    /// Sets the lifecycle state the class is born in.
    pub fn state(mut self, state: ClassState) -> Self {
        self.state = state;
        self
    }

    /// Declares a field with explicit flags.
    pub fn field(mut self, name: &str, signature: &str, flags: FieldFlags) -> Self {
        self.fields.push(FieldDecl {
            name: name.to_owned(),
            signature: signature.to_owned(),
            flags: flags | derived_field_flags(signature),
        });
        self
    }

    /// Declares an instance field; reference and width flags derive from
    /// the signature.
    pub fn instance_field(self, name: &str, signature: &str) -> Self {
        self.field(name, signature, FieldFlags::empty())
    }

    /// Declares a static field; reference and width flags derive from the
    /// signature.
    pub fn static_field(self, name: &str, signature: &str) -> Self {
        self.field(name, signature, FieldFlags::STATIC)
    }

    /// Declares a method.
    pub fn method(mut self, decl: MethodDecl) -> Self {
        self.methods.push(decl);
        self
    }

    /// Allocates the descriptor and registers it in the class pool.
    pub fn build(self, vm: &mut Vm) -> VmResult<Ref> {
        let name_utf = vm.intern_utf(self.name.as_bytes())?;
        let signature = self
            .signature
            .unwrap_or_else(|| format!("L{};", self.name));
        let signature_utf = vm.intern_utf(signature.as_bytes())?;

        // Lay out slots: statics first, instance fields behind the super's.
        let mut ordered: Vec<&FieldDecl> = Vec::with_capacity(self.fields.len());
        ordered.extend(self.fields.iter().filter(|f| f.flags.contains(FieldFlags::STATIC)));
        let static_count = ordered.len() as u32;
        ordered.extend(self.fields.iter().filter(|f| !f.flags.contains(FieldFlags::STATIC)));

        let inherited_cells = self
            .super_class
            .non_null()
            .map(|s| Class::instance_cells(&vm.heap, s))
            .unwrap_or(0);
        let mut static_cell_slot = 0u32;
        let mut static_long_slot = 0u32;
        let mut instance_slot = inherited_cells;
        let mut slots = Vec::with_capacity(ordered.len());
        for field in &ordered {
            if field.flags.contains(FieldFlags::STATIC) {
                if field.flags.contains(FieldFlags::LONG) {
                    slots.push(static_long_slot);
                    static_long_slot += 1;
                } else {
                    slots.push(static_cell_slot);
                    static_cell_slot += 1;
                }
            } else {
                slots.push(instance_slot);
                instance_slot += if field.flags.contains(FieldFlags::LONG) {
                    2
                } else {
                    1
                };
            }
        }

        // Field table.
        let field_count = ordered.len() as u32;
        let mut field_table = Ref::NULL;
        if field_count > 0 {
            let table = vm.allocate_zeroed(
                (field_count * FIELD_RECORD_BYTES) as usize,
                AllocType::Static,
            )?;
            for (index, field) in ordered.iter().enumerate() {
                let field_name = vm.intern_utf(field.name.as_bytes())?;
                let field_sig = vm.intern_utf(field.signature.as_bytes())?;
                let record = table.offset() + index as u32 * FIELD_RECORD_BYTES;
                vm.heap.set_cell(record, Cell::from_ref(field_name));
                vm.heap.set_word(record + 4, field.flags.bits());
                vm.heap.set_word(record + 8, slots[index]);
                vm.heap.set_cell(record + 12, Cell::from_ref(field_sig));
            }
            field_table = table;
        }

        // Static long slab.
        let mut static_longs = Ref::NULL;
        if static_long_slot > 0 {
            static_longs =
                vm.allocate_zeroed((static_long_slot * 8) as usize, AllocType::Static)?;
        }

        // Method table with per-method bytecode and exception tables.
        let method_count = self.methods.len() as u32;
        let mut method_table = Ref::NULL;
        if method_count > 0 {
            let table = vm.allocate_zeroed(
                (method_count * METHOD_RECORD_BYTES) as usize,
                AllocType::Static,
            )?;
            for (index, decl) in self.methods.iter().enumerate() {
                let method_name = vm.intern_utf(decl.name.as_bytes())?;
                let method_sig = vm.intern_utf(decl.signature.as_bytes())?;

                let mut bytecode = Ref::NULL;
                if !decl.bytecode.is_empty() {
                    bytecode = vm.allocate(decl.bytecode.len(), AllocType::Static)?;
                    vm.heap
                        .bytes_mut(bytecode, decl.bytecode.len())
                        .copy_from_slice(&decl.bytecode);
                }

                let mut exception_table = Ref::NULL;
                if !decl.handlers.is_empty() {
                    let bytes = 4 + decl.handlers.len() * 16;
                    let chunk = vm.allocate_zeroed(bytes, AllocType::Static)?;
                    vm.heap.set_word(chunk.offset(), decl.handlers.len() as u32);
                    for (h, handler) in decl.handlers.iter().enumerate() {
                        let entry = chunk.offset() + 4 + h as u32 * 16;
                        vm.heap.set_word(entry, handler.start_pc);
                        vm.heap.set_word(entry + 4, handler.end_pc);
                        vm.heap.set_word(entry + 8, handler.handler_pc);
                        vm.heap
                            .set_cell(entry + 12, Cell::from_ref(handler.catch_class));
                    }
                    exception_table = chunk;
                }

                let arg_cells = decl
                    .arg_cells
                    .unwrap_or_else(|| signature_arg_cells(&decl.signature));
                let record = table.offset() + index as u32 * METHOD_RECORD_BYTES;
                vm.heap.set_cell(record, Cell::ZERO); // class, patched below
                vm.heap.set_cell(record + 4, Cell::from_ref(method_name));
                vm.heap.set_cell(record + 8, Cell::from_ref(method_sig));
                vm.heap.set_word(record + 12, decl.flags.bits());
                vm.heap.set_cell(record + 16, Cell::from_ref(bytecode));
                vm.heap.set_word(record + 20, decl.bytecode.len() as u32);
                vm.heap.set_word(record + 24, decl.max_stack);
                vm.heap.set_word(record + 28, decl.max_locals);
                vm.heap.set_word(record + 32, arg_cells);
                vm.heap
                    .set_cell(record + 36, Cell::from_ref(exception_table));
            }
            method_table = table;
        }

        // The class chunk itself, statics area included.
        let class = vm.allocate_zeroed(
            (class_offsets::STATICS + static_cell_slot * 4) as usize,
            AllocType::InstanceClazz,
        )?;
        let base = class.offset();
        vm.heap.set_word(base + class_offsets::MAGIC, CLASS_MAGIC);
        vm.heap
            .set_cell(base + class_offsets::LOADER, Cell::from_ref(self.loader));
        vm.heap
            .set_cell(base + class_offsets::SUPER, Cell::from_ref(self.super_class));
        vm.heap
            .set_word(base + class_offsets::STATE, self.state as u32);
        vm.heap
            .set_word(base + class_offsets::FLAGS, self.access_flags);
        vm.heap
            .set_cell(base + class_offsets::NAME, Cell::from_ref(name_utf));
        vm.heap.set_cell(
            base + class_offsets::SIGNATURE,
            Cell::from_ref(signature_utf),
        );
        vm.heap
            .set_cell(base + class_offsets::FIELD_TABLE, Cell::from_ref(field_table));
        vm.heap
            .set_word(base + class_offsets::FIELD_COUNT, field_count);
        vm.heap
            .set_word(base + class_offsets::STATIC_COUNT, static_count);
        vm.heap
            .set_word(base + class_offsets::INSTANCE_CELLS, instance_slot);
        vm.heap.set_cell(
            base + class_offsets::METHOD_TABLE,
            Cell::from_ref(method_table),
        );
        vm.heap
            .set_word(base + class_offsets::METHOD_COUNT, method_count);
        vm.heap.set_cell(
            base + class_offsets::STATIC_LONGS,
            Cell::from_ref(static_longs),
        );
        vm.heap
            .set_word(base + class_offsets::STATIC_CELLS, static_cell_slot);

        // Patch the declaring class into each method record.
        for index in 0..method_count {
            let record = method_table.offset() + index * METHOD_RECORD_BYTES;
            vm.heap.set_cell(record, Cell::from_ref(class));
        }

        vm.class_pool.add(self.loader, self.name.as_bytes(), class);
        log::trace!("built class {} at {:#x}", self.name, class.offset());
        Ok(class)
    }
}

/// Reference and width flags a JNI signature implies.
fn derived_field_flags(signature: &str) -> FieldFlags {
    match signature.as_bytes().first() {
        Some(b'L') | Some(b'[') => FieldFlags::REFERENCE,
        Some(b'J') | Some(b'D') => FieldFlags::LONG,
        _ => FieldFlags::empty(),
    }
}

/// Argument cells a JNI method signature implies, receiver excluded.
fn signature_arg_cells(signature: &str) -> u32 {
    let bytes = signature.as_bytes();
    let mut cells = 0u32;
    let mut i = 1; // past '('
    while i < bytes.len() && bytes[i] != b')' {
        match bytes[i] {
            b'J' | b'D' => {
                cells += 2;
                i += 1;
            }
            b'L' => {
                cells += 1;
                while i < bytes.len() && bytes[i] != b';' {
                    i += 1;
                }
                i += 1;
            }
            b'[' => {
                cells += 1;
                while i < bytes.len() && bytes[i] == b'[' {
                    i += 1;
                }
                if i < bytes.len() && bytes[i] == b'L' {
                    while i < bytes.len() && bytes[i] != b';' {
                        i += 1;
                    }
                }
                i += 1;
            }
            _ => {
                cells += 1;
                i += 1;
            }
        }
    }
    cells
}

/// Allocates an unpooled STATIC name buffer in the UTF entry layout, used
/// by array and primitive class descriptors; the sweep frees it with its
/// class.
fn alloc_name_buffer(vm: &mut Vm, name: &str) -> VmResult<Ref> {
    let bytes = name.as_bytes();
    let buffer = vm.allocate_zeroed(8 + bytes.len() + 1, AllocType::Static)?;
    vm.heap.set_word(buffer.offset() + 4, bytes.len() as u32);
    vm.heap
        .bytes_mut(Ref::from_offset(buffer.offset() + 8), bytes.len())
        .copy_from_slice(bytes);
    Ok(buffer)
}

/// Builds the descriptor for an array of a primitive kind (`[C`, `[I`, ...).
pub fn build_primitive_array_class(vm: &mut Vm, kind: PrimitiveKind) -> VmResult<Ref> {
    let tag = match kind {
        PrimitiveKind::Boolean => "[Z",
        PrimitiveKind::Byte => "[B",
        PrimitiveKind::Char => "[C",
        PrimitiveKind::Short => "[S",
        PrimitiveKind::Int => "[I",
        PrimitiveKind::Float => "[F",
        PrimitiveKind::Long => "[J",
        PrimitiveKind::Double => "[D",
    };
    if let Some(existing) = vm.get_class(Ref::NULL, tag) {
        return Ok(existing);
    }
    let name = alloc_name_buffer(vm, tag)?;
    let class = vm.allocate_zeroed(
        class_offsets::ARRAY_CLAZZ_BYTES as usize,
        AllocType::ArrayClazz,
    )?;
    write_special_class_prefix(vm, class, name);
    vm.heap
        .set_word(class.offset() + class_offsets::ELEMENT_KIND, kind as u32);
    vm.class_pool.add(Ref::NULL, tag.as_bytes(), class);
    Ok(class)
}

/// Builds the descriptor for an array of objects of `element_class`.
pub fn build_object_array_class(vm: &mut Vm, element_class: Ref) -> VmResult<Ref> {
    let element_name =
        crate::pools::UtfPool::bytes_of(&vm.heap, Class::name(&vm.heap, element_class)).to_vec();
    let tag = format!("[L{};", String::from_utf8_lossy(&element_name));
    let loader = Class::loader(&vm.heap, element_class);
    if let Some(existing) = vm.class_pool.get(loader, tag.as_bytes()) {
        return Ok(existing);
    }
    let name = alloc_name_buffer(vm, &tag)?;
    let class = vm.allocate_zeroed(
        class_offsets::ARRAY_CLAZZ_BYTES as usize,
        AllocType::ArrayClazz,
    )?;
    write_special_class_prefix(vm, class, name);
    vm.heap.set_cell(
        class.offset() + class_offsets::LOADER,
        Cell::from_ref(loader),
    );
    vm.heap.set_cell(
        class.offset() + class_offsets::ELEMENT_CLASS,
        Cell::from_ref(element_class),
    );
    vm.class_pool.add(loader, tag.as_bytes(), class);
    Ok(class)
}

/// Builds the descriptor for a primitive type itself (`int`, `char`, ...).
pub fn build_primitive_class(vm: &mut Vm, kind: PrimitiveKind) -> VmResult<Ref> {
    let tag = match kind {
        PrimitiveKind::Boolean => "boolean",
        PrimitiveKind::Byte => "byte",
        PrimitiveKind::Char => "char",
        PrimitiveKind::Short => "short",
        PrimitiveKind::Int => "int",
        PrimitiveKind::Float => "float",
        PrimitiveKind::Long => "long",
        PrimitiveKind::Double => "double",
    };
    if let Some(existing) = vm.get_class(Ref::NULL, tag) {
        return Ok(existing);
    }
    let name = alloc_name_buffer(vm, tag)?;
    let class = vm.allocate_zeroed(
        class_offsets::PRIMITIVE_CLAZZ_BYTES as usize,
        AllocType::PrimitiveClazz,
    )?;
    write_special_class_prefix(vm, class, name);
    vm.heap
        .set_word(class.offset() + class_offsets::PRIMITIVE_KIND, kind as u32);
    vm.class_pool.add(Ref::NULL, tag.as_bytes(), class);
    Ok(class)
}

fn write_special_class_prefix(vm: &mut Vm, class: Ref, name: Ref) {
    let base = class.offset();
    vm.heap.set_word(base + class_offsets::MAGIC, CLASS_MAGIC);
    vm.heap
        .set_word(base + class_offsets::STATE, ClassState::Initialised as u32);
    vm.heap
        .set_cell(base + class_offsets::SUPER, Cell::from_ref(vm.core_object()));
    vm.heap
        .set_cell(base + class_offsets::NAME, Cell::from_ref(name));
}

/// Allocates the wedge sentinel method record that sits at the base of
/// every thread stack. It lives in a STATIC chunk and carries the NATIVE
/// flag; its terminal PC is what the scheduler's termination callback keys
/// on.
pub(crate) fn build_wedge_method(vm: &mut Vm) -> VmResult<MethodAddr> {
    let name = vm.intern_utf(b"(callback-wedge)")?;
    let signature = vm.intern_utf(b"()V")?;
    let record = vm.allocate_zeroed(METHOD_RECORD_BYTES as usize, AllocType::Static)?;
    let base = record.offset();
    vm.heap.set_cell(base + 4, Cell::from_ref(name));
    vm.heap.set_cell(base + 8, Cell::from_ref(signature));
    vm.heap.set_word(
        base + 12,
        (MethodFlags::NATIVE | MethodFlags::STATIC).bits(),
    );
    vm.heap.set_word(base + 24, 4); // max_stack: room for pushed arguments
    Ok(base)
}
