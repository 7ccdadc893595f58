//! The tri-colour mark-and-sweep collector.
//!
//! Roots are the two root stacks, the interned String pool (blackened
//! unconditionally every cycle), every live thread (its language object,
//! pending exception and stack), and the debugger's root set while a
//! session is open. Thread stacks are scanned conservatively: any cell
//! whose value survives the structural validation chain is treated as a
//! reference, so residue may pin dead objects but no live object is ever
//! missed.
//!
//! Marking drains an explicit grey worklist rather than recursing through
//! the host stack; the order of observable effects is unchanged.

use crate::cell::Ref;
use crate::chunk::{AllocType, Colour};
use crate::class::{Class, ClassState, Field, FieldFlags, Method, MethodFlags, CLASS_MAGIC};
use crate::error::{ExitCode, VmError, VmResult};
use crate::frame::FrameWalker;
use crate::objects::{ARRAY_ELEMENTS_OFFSET, OBJECT_FIELDS_OFFSET, STRING_CHARS_OFFSET};
use crate::thread::{ThreadId, ThreadStatus};
use crate::vm::Vm;

/// What one collection cycle accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Chunks returned to the free list
    pub chunks_freed: u32,
    /// Payload bytes reclaimed
    pub bytes_reclaimed: u32,
    /// Class descriptors unloaded
    pub classes_unloaded: u32,
    /// Weak references whose referent was cleared
    pub weak_cleared: u32,
}

impl Vm {
    /// Runs a full collection cycle. On return every surviving chunk is
    /// white and every unreachable non-STATIC chunk is back on the free
    /// list.
    pub fn gc(&mut self) -> VmResult<GcReport> {
        log::debug!("gc: start, {} bytes free", self.heap.stats().free_bytes);
        let mut grey: Vec<Ref> = Vec::new();
        let mut weak: Vec<Ref> = Vec::new();

        // Interned strings survive unconditionally: both the String object
        // and its char array go straight to black.
        let interned: Vec<Ref> = self.interned_strings.values().copied().collect();
        for string in interned {
            self.heap.set_colour(string, Colour::Black);
            let chars = self
                .heap
                .cell(string.offset() + STRING_CHARS_OFFSET)
                .as_ref();
            if !chars.is_null() {
                self.heap.set_colour(chars, Colour::Black);
            }
        }

        // Root stacks: transient below its top, then permanent.
        let mut roots: Vec<Ref> = Vec::new();
        roots.extend_from_slice(self.roots.transient_roots());
        roots.extend_from_slice(self.roots.permanent_roots());
        roots.extend_from_slice(&self.debug_roots);
        for root in roots {
            self.mark_from(root, &mut grey, &mut weak);
        }

        // Threads: language objects, pending exceptions, stacks.
        if !self.threads.is_empty() {
            let current = self.sched.current;
            self.threads.get_mut(current).regs = self.regs;

            let threads = self.all_threads();
            for thread in threads {
                if self.threads.get(thread).status == ThreadStatus::Terminated {
                    continue;
                }
                let record = self.threads.get(thread);
                let thread_object = record.thread_object;
                let pending = record.pending_exception;
                let waiting_on = record.waiting_on;
                self.mark_from(thread_object, &mut grey, &mut weak);
                self.mark_from(pending, &mut grey, &mut weak);
                self.mark_from(waiting_on, &mut grey, &mut weak);

                if self.threads.get(thread).status == ThreadStatus::New {
                    // Not yet started: keep the segments, skip the cells.
                    let mut segment = self.threads.get(thread).head_segment;
                    while let Some(current) = segment.non_null() {
                        self.heap.set_colour(current, Colour::Black);
                        segment = self.segment_next(current);
                    }
                } else {
                    self.scan_thread_stack(thread, &mut grey, &mut weak);
                }
            }
            self.prune_terminated();
        }

        // Weak references found during the mark: clear referents that only
        // they still reach.
        let mut weak_cleared = 0;
        for weak_ref in weak {
            let referent = self
                .heap
                .cell(weak_ref.offset() + OBJECT_FIELDS_OFFSET)
                .as_ref();
            if let Some(referent) = referent.non_null() {
                if self.heap.is_valid_chunk(referent)
                    && self.heap.colour(referent) == Colour::White
                {
                    self.heap
                        .set_cell(weak_ref.offset() + OBJECT_FIELDS_OFFSET, crate::cell::Cell::ZERO);
                    weak_cleared += 1;
                }
            }
        }

        let mut report = self.sweep()?;
        report.weak_cleared = weak_cleared;
        log::debug!(
            "gc: done, freed {} chunks / {} bytes, {} classes unloaded, {} weak cleared",
            report.chunks_freed,
            report.bytes_reclaimed,
            report.classes_unloaded,
            report.weak_cleared
        );
        Ok(report)
    }

    // ---- marking ---------------------------------------------------------

    /// Greys a white chunk and drains the worklist from it.
    fn mark_from(&mut self, root: Ref, grey: &mut Vec<Ref>, weak: &mut Vec<Ref>) {
        if root.is_null() || !self.heap.is_valid_chunk(root) {
            return;
        }
        if self.heap.colour(root) != Colour::White {
            return;
        }
        self.heap.set_colour(root, Colour::Grey);
        grey.push(root);
        while let Some(chunk) = grey.pop() {
            self.scan_chunk(chunk, grey, weak);
            self.heap.set_colour(chunk, Colour::Black);
        }
    }

    fn push_if_white(&mut self, reference: Ref, grey: &mut Vec<Ref>) {
        if reference.is_null() || !self.heap.is_valid_chunk(reference) {
            return;
        }
        if self.heap.colour(reference) == Colour::White {
            self.heap.set_colour(reference, Colour::Grey);
            grey.push(reference);
        }
    }

    /// Greys the children of one chunk, dispatching on its allocation type.
    fn scan_chunk(&mut self, chunk: Ref, grey: &mut Vec<Ref>, weak: &mut Vec<Ref>) {
        let Some(alloc_type) = self.heap.alloc_type(chunk) else {
            return;
        };
        match alloc_type {
            AllocType::Static | AllocType::Data | AllocType::ArrayOfPrimitive => {
                // The primitive array's class still has to survive.
                if alloc_type == AllocType::ArrayOfPrimitive {
                    let class = self.heap.cell(chunk.offset()).as_ref();
                    self.push_if_white(class, grey);
                }
            }
            AllocType::Object => {
                let class = self.heap.cell(chunk.offset()).as_ref();
                self.push_if_white(class, grey);
                self.scan_instance_fields(chunk, class, grey);
            }
            AllocType::ArrayOfObject => {
                let class = self.heap.cell(chunk.offset()).as_ref();
                self.push_if_white(class, grey);
                let length = self.heap.word(chunk.offset() + 4);
                for index in 0..length {
                    let element = self
                        .heap
                        .cell(chunk.offset() + ARRAY_ELEMENTS_OFFSET + index * 4)
                        .as_ref();
                    self.push_if_white(element, grey);
                }
            }
            AllocType::String => {
                // Strings share char arrays; blacken the child directly
                // instead of queueing it.
                let class = self.heap.cell(chunk.offset()).as_ref();
                self.push_if_white(class, grey);
                let chars = self
                    .heap
                    .cell(chunk.offset() + STRING_CHARS_OFFSET)
                    .as_ref();
                if !chars.is_null() && self.heap.is_valid_chunk(chars) {
                    self.heap.set_colour(chars, Colour::Black);
                }
            }
            AllocType::WeakReference => {
                let class = self.heap.cell(chunk.offset()).as_ref();
                self.push_if_white(class, grey);
                // The referent is deliberately not traced.
                weak.push(chunk);
            }
            AllocType::InstanceClazz => {
                // Walk the super chain, marking loaders and static
                // reference fields; each level goes straight to black.
                let mut class = chunk;
                loop {
                    self.push_if_white(Class::loader(&self.heap, class), grey);
                    let static_count = Class::static_count(&self.heap, class);
                    for index in 0..static_count {
                        let record = Class::field_record(&self.heap, class, index);
                        if Field::flags(&self.heap, record).contains(FieldFlags::REFERENCE) {
                            let slot = Field::slot(&self.heap, record);
                            let value = self
                                .heap
                                .cell(Class::static_cell_addr(class, slot))
                                .as_ref();
                            self.push_if_white(value, grey);
                        }
                    }
                    self.push_if_white(Class::class_object(&self.heap, class), grey);
                    self.heap.set_colour(class, Colour::Black);
                    match Class::super_class(&self.heap, class).non_null() {
                        Some(super_class)
                            if self.heap.colour(super_class) != Colour::Black =>
                        {
                            class = super_class;
                        }
                        _ => break,
                    }
                }
            }
            AllocType::ArrayClazz | AllocType::PrimitiveClazz => {
                self.push_if_white(Class::loader(&self.heap, chunk), grey);
            }
        }
    }

    fn scan_instance_fields(&mut self, object: Ref, class: Ref, grey: &mut Vec<Ref>) {
        let mut cursor = class;
        while let Some(current) = cursor.non_null() {
            let field_count = Class::field_count(&self.heap, current);
            let static_count = Class::static_count(&self.heap, current);
            for index in static_count..field_count {
                let record = Class::field_record(&self.heap, current, index);
                if Field::flags(&self.heap, record).contains(FieldFlags::REFERENCE) {
                    let slot = Field::slot(&self.heap, record);
                    let value = self
                        .heap
                        .cell(object.offset() + OBJECT_FIELDS_OFFSET + slot * 4)
                        .as_ref();
                    self.push_if_white(value, grey);
                }
            }
            cursor = Class::super_class(&self.heap, current);
        }
    }

    // ---- conservative stack scan -----------------------------------------

    fn scan_thread_stack(&mut self, thread: ThreadId, grey: &mut Vec<Ref>, weak: &mut Vec<Ref>) {
        let regs = self.thread_registers(thread);
        if regs.segment.is_null() {
            return;
        }

        // Segments grown past the current one are no longer part of the
        // stack; severing the link lets the sweep take them.
        self.set_segment_next(regs.segment, Ref::NULL);
        let mut segment = self.threads.get(thread).head_segment;
        while let Some(current) = segment.non_null() {
            self.heap.set_colour(current, Colour::Black);
            segment = self.segment_next(current);
        }

        let mut walker = FrameWalker::top(&regs);
        while !walker.is_terminal(self) {
            if walker.method != self.wedge_method()
                && Method::flags(&self.heap, walker.method).contains(MethodFlags::NATIVE)
            {
                // Native frames keep their arguments in the caller's
                // operand stack.
                let caller_sp = self
                    .heap
                    .word(walker.locals - 28 + crate::frame::frame_slots::SP * 4);
                let span = Method::native_arg_span(&self.heap, walker.method);
                for index in 0..span {
                    self.scan_conservative_cell(caller_sp + index * 4, grey, weak);
                }
            } else {
                let mut addr = walker.locals;
                while addr < walker.sp {
                    self.scan_conservative_cell(addr, grey, weak);
                    addr += 4;
                }
            }
            walker = walker.step(self);
        }
    }

    /// Treats one cell as a candidate reference, following it only when the
    /// full validation chain holds: heap range, chunk validity, object-kind
    /// type, class in range, class kind, class magic.
    fn scan_conservative_cell(&mut self, addr: u32, grey: &mut Vec<Ref>, weak: &mut Vec<Ref>) {
        let candidate = self.heap.cell(addr).as_ref();
        if candidate.is_null() || !self.heap.is_valid_chunk(candidate) {
            return;
        }
        let Some(alloc_type) = self.heap.alloc_type(candidate) else {
            return;
        };
        if !alloc_type.is_object_kind() {
            return;
        }
        let class = self.heap.cell(candidate.offset()).as_ref();
        if class.is_null() || !self.heap.is_valid_chunk(class) {
            return;
        }
        let class_kind = self.heap.alloc_type(class);
        if !class_kind.map(AllocType::is_class_kind).unwrap_or(false) {
            return;
        }
        if Class::magic(&self.heap, class) != CLASS_MAGIC {
            return;
        }
        if self.heap.colour(candidate) == Colour::White {
            self.mark_from(candidate, grey, weak);
        }
    }

    // ---- sweep -----------------------------------------------------------

    fn sweep(&mut self) -> VmResult<GcReport> {
        let mut report = GcReport::default();
        let end = self.heap.end_offset();
        let mut off = self.heap.first_chunk_offset();
        while off < end {
            let header = self.heap.header_at(off);
            if !header.in_use() {
                off = self.heap.next_chunk_offset(off);
                continue;
            }
            let Some(alloc_type) = header.alloc_type() else {
                return Err(VmError::exit(
                    ExitCode::InvalidChunk,
                    format!("sweep met corrupt type tag at {off:#x}"),
                ));
            };
            let payload = self.heap.payload_of(off);
            if header.colour() != Colour::White {
                self.heap.set_colour(payload, Colour::White);
                off = self.heap.next_chunk_offset(off);
                continue;
            }
            match alloc_type {
                AllocType::Static => {
                    off = self.heap.next_chunk_offset(off);
                }
                AllocType::Data
                | AllocType::Object
                | AllocType::ArrayOfPrimitive
                | AllocType::ArrayOfObject
                | AllocType::String
                | AllocType::WeakReference => {
                    report.chunks_freed += 1;
                    report.bytes_reclaimed += header.size();
                    let merged = self.heap.free(payload)?;
                    off = self.heap.next_chunk_offset(merged);
                }
                AllocType::ArrayClazz | AllocType::PrimitiveClazz => {
                    self.class_pool.remove(&self.heap, payload);
                    let name = Class::name(&self.heap, payload);
                    if !name.is_null() {
                        self.heap.free(name)?;
                    }
                    report.chunks_freed += 1;
                    report.bytes_reclaimed += header.size();
                    report.classes_unloaded += 1;
                    let merged = self.heap.free(payload)?;
                    off = self.heap.next_chunk_offset(merged);
                }
                AllocType::InstanceClazz => {
                    self.unload_instance_class(payload)?;
                    report.chunks_freed += 1;
                    report.bytes_reclaimed += header.size();
                    report.classes_unloaded += 1;
                    let merged = self.heap.free(payload)?;
                    off = self.heap.next_chunk_offset(merged);
                }
            }
        }
        Ok(report)
    }

    /// Frees an unloading class's sub-allocations: constant pool, field
    /// table, interface list, static-long slab, per-method tables, method
    /// table. The interned name entry stays; interned UTF strings live as
    /// long as the VM.
    fn unload_instance_class(&mut self, class: Ref) -> VmResult<()> {
        if Class::state(&self.heap, class) != ClassState::Error {
            self.class_pool.remove(&self.heap, class);
        }
        for index in 0..Class::method_count(&self.heap, class) {
            let method = Class::method_record(&self.heap, class, index);
            for table in [
                Method::bytecode(&self.heap, method),
                Method::exception_table(&self.heap, method),
                Method::line_table(&self.heap, method),
                Method::localvar_table(&self.heap, method),
            ] {
                if !table.is_null() {
                    self.heap.free(table)?;
                }
            }
        }
        for table in [
            Class::constant_pool(&self.heap, class),
            Class::field_table(&self.heap, class),
            Class::interfaces(&self.heap, class),
            Class::static_longs(&self.heap, class),
            Class::method_table(&self.heap, class),
        ] {
            if !table.is_null() {
                self.heap.free(table)?;
            }
        }
        log::debug!("unloaded class at {:#x}", class.offset());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_vm;

    #[test]
    fn test_unreachable_objects_are_swept() {
        let mut vm = test_vm();
        let baseline = vm.gc().expect("gc");
        assert_eq!(baseline.chunks_freed, 0);

        // An unrooted instance vanishes; a rooted one survives.
        let doomed = vm.new_instance(vm.core_object()).expect("doomed");
        let kept = vm.new_instance(vm.core_object()).expect("kept");
        vm.make_permanent_root(kept).expect("root");
        let _ = doomed;

        let report = vm.gc().expect("gc");
        assert_eq!(report.chunks_freed, 1);
        assert!(vm.heap().in_use(kept));
        assert_eq!(vm.heap().colour(kept), Colour::White);
    }

    #[test]
    fn test_gc_is_idempotent() {
        let mut vm = test_vm();
        for _ in 0..3 {
            let text = vm.new_string("idempotent").expect("string");
            let _ = text;
        }
        let first = vm.gc().expect("gc");
        assert!(first.chunks_freed > 0);
        let second = vm.gc().expect("gc");
        assert_eq!(second.chunks_freed, 0);
        assert_eq!(second.classes_unloaded, 0);
    }

    #[test]
    fn test_transient_roots_pin_only_while_open() {
        let mut vm = test_vm();
        let object = vm.new_instance(vm.core_object()).expect("object");
        vm.transient_scope(|vm| {
            vm.make_transient_root(object)?;
            let report = vm.gc()?;
            assert_eq!(report.chunks_freed, 0);
            assert!(vm.heap().in_use(object));
            Ok(())
        })
        .expect("scope");

        let report = vm.gc().expect("gc");
        assert_eq!(report.chunks_freed, 1);
    }

    #[test]
    fn test_reference_chains_are_traced() {
        let mut vm = test_vm();
        let holder_class = crate::class_builder::ClassBuilder::new("sample/Holder")
            .super_class(vm.core_object())
            .instance_field("held", "Ljava/lang/Object;")
            .build(&mut vm)
            .expect("class");
        let holder = vm.new_instance(holder_class).expect("holder");
        let held = vm.new_instance(vm.core_object()).expect("held");
        vm.set_object_field(holder, 0, crate::cell::Cell::from_ref(held));
        vm.make_permanent_root(holder).expect("root");

        vm.gc().expect("gc");
        assert!(vm.heap().in_use(held));

        // Dropping the edge frees the held object next cycle.
        vm.set_object_field(holder, 0, crate::cell::Cell::ZERO);
        let report = vm.gc().expect("gc");
        assert_eq!(report.chunks_freed, 1);
    }

    #[test]
    fn test_object_arrays_trace_elements() {
        let mut vm = test_vm();
        let array = vm.new_object_array(vm.core_object(), 4).expect("array");
        let element = vm.new_instance(vm.core_object()).expect("element");
        vm.object_array_set(array, 2, element).expect("store");
        vm.make_permanent_root(array).expect("root");

        vm.gc().expect("gc");
        assert!(vm.heap().in_use(element));
    }

    #[test]
    fn test_weak_referent_cleared_when_unreachable() {
        let mut vm = test_vm();
        let target = vm.new_instance(vm.core_object()).expect("target");
        let weak = vm.new_weak_reference(target).expect("weak");
        vm.make_permanent_root(weak).expect("root");

        let report = vm.gc().expect("gc");
        assert!(vm.heap().in_use(weak));
        assert!(vm.weak_referent(weak).is_null());
        assert_eq!(report.weak_cleared, 1);
    }

    #[test]
    fn test_weak_referent_kept_while_strongly_reachable() {
        let mut vm = test_vm();
        let target = vm.new_instance(vm.core_object()).expect("target");
        let weak = vm.new_weak_reference(target).expect("weak");
        vm.make_permanent_root(weak).expect("weak root");
        vm.make_permanent_root(target).expect("strong root");

        let report = vm.gc().expect("gc");
        assert_eq!(vm.weak_referent(weak), target);
        assert_eq!(report.weak_cleared, 0);
    }

    #[test]
    fn test_interned_strings_survive_unrooted() {
        let mut vm = test_vm();
        let interned = vm.intern_string("forever").expect("intern");
        let plain = vm.new_string("fleeting").expect("plain");
        let _ = plain;

        vm.gc().expect("gc");
        assert!(vm.heap().in_use(interned));
        assert!(vm.heap().in_use(vm.string_chars(interned)));
        assert_eq!(vm.string_text(interned), "forever");
    }

    #[test]
    fn test_class_unloading_frees_tables() {
        let mut vm = test_vm();
        let stats_before = vm.heap().stats();
        let class = crate::class_builder::ClassBuilder::new("sample/Ephemeral")
            .super_class(vm.core_object())
            .instance_field("a", "I")
            .static_field("b", "Ljava/lang/Object;")
            .method(
                crate::class_builder::MethodDecl::new("tick", "()V")
                    .bytecode(vec![0xb1])
                    .max_stack(1)
                    .max_locals(1),
            )
            .build(&mut vm)
            .expect("class");
        assert!(vm.get_class(Ref::NULL, "sample/Ephemeral").is_some());
        let _ = class;

        let report = vm.gc().expect("gc");
        assert_eq!(report.classes_unloaded, 1);
        assert!(vm.get_class(Ref::NULL, "sample/Ephemeral").is_none());
        // Everything but the interned name entries came back.
        let stats_after = vm.heap().stats();
        assert!(stats_after.in_use_bytes < stats_before.in_use_bytes + 256);
    }

    #[test]
    fn test_live_instances_keep_their_class() {
        let mut vm = test_vm();
        let class = crate::class_builder::ClassBuilder::new("sample/Pinned")
            .super_class(vm.core_object())
            .build(&mut vm)
            .expect("class");
        let instance = vm.new_instance(class).expect("instance");
        vm.make_permanent_root(instance).expect("root");

        let report = vm.gc().expect("gc");
        assert_eq!(report.classes_unloaded, 0);
        assert!(vm.heap().in_use(class));
        assert!(vm.get_class(Ref::NULL, "sample/Pinned").is_some());
        let _ = report;
    }

    #[test]
    fn test_conservative_scan_pins_stack_residents() {
        let mut vm = test_vm();
        // Park a reference in a local slot of a live frame.
        let class = crate::class_builder::ClassBuilder::new("sample/Carrier")
            .super_class(vm.core_object())
            .method(
                crate::class_builder::MethodDecl::new("carry", "()V")
                    .bytecode(vec![0xb1])
                    .max_stack(2)
                    .max_locals(2),
            )
            .build(&mut vm)
            .expect("class");
        let method = Class::method_record(&vm.heap, class, 0);
        let sp = vm.registers().sp;
        vm.push_frame(method, sp, crate::frame::TERMINAL_PC, crate::frame::TERMINAL_PC, Ref::NULL)
            .expect("push");

        let passenger = vm.new_instance(vm.core_object()).expect("passenger");
        let locals = vm.registers().locals;
        vm.heap
            .set_cell(locals, crate::cell::Cell::from_ref(passenger));

        vm.gc().expect("gc");
        assert!(vm.heap().in_use(passenger));

        // Clearing the slot releases it.
        vm.heap.set_cell(locals, crate::cell::Cell::ZERO);
        vm.gc().expect("gc");
        assert!(!vm.heap().in_use(passenger));
        vm.pop_frame();
    }

    #[test]
    fn test_marking_recolours_to_white_after_sweep() {
        let mut vm = test_vm();
        let kept = vm.new_instance(vm.core_object()).expect("kept");
        vm.make_permanent_root(kept).expect("root");
        vm.gc().expect("gc");

        let mut any_marked = 0;
        vm.heap().walk(|chunk| {
            if chunk.header.in_use() && chunk.header.colour() != Colour::White {
                any_marked += 1;
            }
        });
        assert_eq!(any_marked, 0);
    }
}
