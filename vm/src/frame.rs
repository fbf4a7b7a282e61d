//! Activation frames.
//!
//! A frame is a heap chunk laid out as
//!
//! ```text
//! [method u32][parent Ref][pc u32][saved_int_stack u32][saved_ref_stack u32]
//! [ref operand stack: max_ref_stack * 4]
//! [int operand stack: max_int_stack * 2]
//! [ref locals: ref_locals * 4]
//! [int locals: int_locals * 2]
//! ```
//!
//! Both operand stacks grow upward and the saved pointers address the next
//! free slot. The saved int stack pointer may point outside the arena when
//! the operands live on a native stack; it is then left alone by the
//! collector.

use heap::{Heap, HeapError};
use log::trace;
use object::{ChunkKind, MethodId, REF_SIZE, Ref};

use crate::Vm;
use crate::error::Violation;
use crate::metadata::{Metadata, MethodDescriptor};

pub const FRAME_HEADER: u32 = 20;
pub const INT_SLOT_SIZE: u32 = 2;

const METHOD: u32 = 0;
const PARENT: u32 = 4;
const PC: u32 = 8;
const SAVED_INT_STACK: u32 = 12;
const SAVED_REF_STACK: u32 = 16;

/// Payload offsets of a frame's regions, derived from its method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub ref_stack: u32,
    pub int_stack: u32,
    pub ref_locals: u32,
    pub int_locals: u32,
    /// Total payload size.
    pub size: u32,
    pub max_ref_stack: u16,
    pub max_int_stack: u16,
    pub ref_local_count: u16,
    pub int_local_count: u16,
}

impl FrameLayout {
    pub fn of(method: &MethodDescriptor) -> Self {
        let ref_stack = FRAME_HEADER;
        let int_stack = ref_stack + method.max_ref_stack as u32 * REF_SIZE as u32;
        let ref_locals = int_stack + method.max_int_stack as u32 * INT_SLOT_SIZE;
        let int_locals = ref_locals + method.ref_locals as u32 * REF_SIZE as u32;
        let size = int_locals + method.int_locals as u32 * INT_SLOT_SIZE;
        Self {
            ref_stack,
            int_stack,
            ref_locals,
            int_locals,
            size,
            max_ref_stack: method.max_ref_stack,
            max_int_stack: method.max_int_stack,
            ref_local_count: method.ref_locals,
            int_local_count: method.int_locals,
        }
    }

    pub fn for_frame(heap: &Heap, metadata: &dyn Metadata, frame: Frame) -> Self {
        Self::of(metadata.method_or_abort(frame.method(heap)))
    }
}

/// View over a `Frame` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame(pub Ref);

impl Frame {
    #[inline]
    fn addr(self, offset: u32) -> u32 {
        self.0.addr() + offset
    }

    pub fn method(self, heap: &Heap) -> MethodId {
        MethodId::from_bits(heap.read_u32(self.addr(METHOD)))
    }

    pub fn parent(self, heap: &Heap) -> Option<Frame> {
        heap.read_ref(self.addr(PARENT)).non_null().map(Frame)
    }

    pub fn set_parent(self, heap: &mut Heap, parent: Option<Frame>) {
        heap.write_ref(self.addr(PARENT), parent.map_or(Ref::NULL, |f| f.0));
    }

    pub fn pc(self, heap: &Heap) -> u32 {
        heap.read_u32(self.addr(PC))
    }

    pub fn set_pc(self, heap: &mut Heap, pc: u32) {
        heap.write_u32(self.addr(PC), pc);
    }

    pub fn saved_int_stack(self, heap: &Heap) -> u32 {
        heap.read_u32(self.addr(SAVED_INT_STACK))
    }

    pub fn set_saved_int_stack(self, heap: &mut Heap, sp: u32) {
        heap.write_u32(self.addr(SAVED_INT_STACK), sp);
    }

    pub fn saved_ref_stack(self, heap: &Heap) -> u32 {
        heap.read_u32(self.addr(SAVED_REF_STACK))
    }

    pub fn set_saved_ref_stack(self, heap: &mut Heap, sp: u32) {
        heap.write_u32(self.addr(SAVED_REF_STACK), sp);
    }

    /// Occupied reference stack slots.
    pub fn ref_stack_depth(self, heap: &Heap, layout: &FrameLayout) -> u32 {
        let base = self.addr(layout.ref_stack);
        let sp = self.saved_ref_stack(heap);
        let depth = sp.wrapping_sub(base) / REF_SIZE as u32;
        if sp < base || depth > layout.max_ref_stack as u32 {
            Violation::CorruptChunk(self.0).abort();
        }
        depth
    }

    /// Occupied int stack slots, or `None` when the int stack is off-heap.
    pub fn int_stack_depth(self, heap: &Heap, layout: &FrameLayout) -> Option<u32> {
        let sp = self.saved_int_stack(heap);
        if !heap.is_heap_pointer(sp) {
            return None;
        }
        let base = self.addr(layout.int_stack);
        if sp < base || sp > self.addr(layout.ref_locals) {
            Violation::CorruptChunk(self.0).abort();
        }
        Some((sp - base) / INT_SLOT_SIZE)
    }

    /// Empty both operand stacks. An off-heap int stack is left as is.
    pub fn reset_operand_stacks(self, heap: &mut Heap, layout: &FrameLayout) {
        self.set_saved_ref_stack(heap, self.addr(layout.ref_stack));
        if heap.is_heap_pointer(self.saved_int_stack(heap)) {
            self.set_saved_int_stack(heap, self.addr(layout.int_stack));
        }
    }

    fn ref_local_addr(self, layout: &FrameLayout, index: u16) -> u32 {
        debug_assert!(index < layout.ref_local_count);
        self.addr(layout.ref_locals) + index as u32 * REF_SIZE as u32
    }

    fn int_local_addr(self, layout: &FrameLayout, index: u16) -> u32 {
        debug_assert!(index < layout.int_local_count);
        self.addr(layout.int_locals) + index as u32 * INT_SLOT_SIZE
    }

    pub fn ref_local(self, heap: &Heap, layout: &FrameLayout, index: u16) -> Ref {
        heap.read_ref(self.ref_local_addr(layout, index))
    }

    pub fn set_ref_local(self, heap: &mut Heap, layout: &FrameLayout, index: u16, value: Ref) {
        heap.write_ref(self.ref_local_addr(layout, index), value);
    }

    pub fn int_local(self, heap: &Heap, layout: &FrameLayout, index: u16) -> i16 {
        heap.read_u16(self.int_local_addr(layout, index)) as i16
    }

    pub fn set_int_local(self, heap: &mut Heap, layout: &FrameLayout, index: u16, value: i16) {
        heap.write_u16(self.int_local_addr(layout, index), value as u16);
    }
}

/// The frame itself is a root: black, never traced. Only the occupied part
/// of the reference stack and the reference locals are grayed.
pub(crate) fn mark_root_set(heap: &mut Heap, metadata: &dyn Metadata, frame: Frame) {
    heap.mark_black(frame.0);
    let layout = FrameLayout::for_frame(heap, metadata, frame);
    let depth = frame.ref_stack_depth(heap, &layout);
    for i in 0..depth {
        let r = heap.read_ref(frame.addr(layout.ref_stack) + i * REF_SIZE as u32);
        heap.mark_gray_if_white(r);
    }
    for i in 0..layout.ref_local_count {
        let r = frame.ref_local(heap, &layout, i);
        heap.mark_gray_if_white(r);
    }
}

/// Used when a frame is reached through the heap rather than a thread's
/// root set.
pub(crate) fn trace(heap: &Heap, metadata: &dyn Metadata, frame: Frame, visitor: &mut dyn FnMut(Ref)) {
    let layout = FrameLayout::for_frame(heap, metadata, frame);
    if let Some(parent) = frame.parent(heap) {
        visitor(parent.0);
    }
    for i in 0..frame.ref_stack_depth(heap, &layout) {
        visitor(heap.read_ref(frame.addr(layout.ref_stack) + i * REF_SIZE as u32));
    }
    for i in 0..layout.ref_local_count {
        visitor(frame.ref_local(heap, &layout, i));
    }
}

pub(crate) fn relocate(heap: &mut Heap, metadata: &dyn Metadata, frame: Frame) {
    let layout = FrameLayout::for_frame(heap, metadata, frame);
    // depth comes from the saved pointer, so read it before moving that
    let depth = frame.ref_stack_depth(heap, &layout);
    for i in 0..depth {
        heap.relocate_slot(frame.addr(layout.ref_stack) + i * REF_SIZE as u32);
    }
    for i in 0..layout.ref_local_count {
        heap.relocate_slot(frame.ref_local_addr(&layout, i));
    }

    let shift = heap.chunk_shift(frame.0);
    let ref_sp = frame.saved_ref_stack(heap);
    frame.set_saved_ref_stack(heap, ref_sp - shift);
    let int_sp = frame.saved_int_stack(heap);
    if heap.is_heap_pointer(int_sp) {
        frame.set_saved_int_stack(heap, int_sp - shift);
    }

    heap.relocate_slot(frame.addr(PARENT));
    trace!("relocated frame {:?} by {shift}", frame.0);
}

impl Vm {
    /// Allocate a frame for `method`: zeroed locals, empty operand stacks,
    /// no parent.
    ///
    /// Aborts on an unknown method or an inconsistent method header.
    pub fn create_frame(&mut self, method: MethodId) -> Result<Frame, HeapError> {
        let descriptor = self.metadata.method_or_abort(method);
        if let Err(violation) = descriptor.validate(method) {
            violation.abort();
        }
        let layout = FrameLayout::of(descriptor);

        let frame = Frame(self.allocate(layout.size as usize, ChunkKind::Frame)?);
        let heap = &mut self.heap;
        heap.write_u32(frame.addr(METHOD), method.to_bits());
        frame.set_saved_ref_stack(heap, frame.addr(layout.ref_stack));
        frame.set_saved_int_stack(heap, frame.addr(layout.int_stack));
        trace!("created frame {:?} for {method:?}", frame.0);
        Ok(frame)
    }
}
