//! Execution-state hooks for native glue: operand stack access on the
//! current frame, throwing, and the native stack probe.

use std::sync::Arc;

use log::{debug, warn};
use object::{REF_SIZE, Ref};

use crate::Vm;
use crate::error::{Fault, Violation};
use crate::frame::{Frame, FrameLayout, INT_SLOT_SIZE};
use crate::objects::Object;
use crate::threading::{Thread, ThreadStatus};

// ── Stack probe ───────────────────────────────────────────────────────

/// Compares the native stack position against a low-water mark computed
/// from the position at construction and a byte budget.
#[derive(Debug, Clone, Copy)]
pub struct StackProbe {
    low_water: Option<usize>,
}

impl StackProbe {
    /// `None` disables the probe.
    pub fn new(budget: Option<usize>) -> Self {
        let low_water = budget.map(|b| stack_position().saturating_sub(b));
        Self { low_water }
    }

    pub fn disabled() -> Self {
        Self { low_water: None }
    }

    /// Check an explicit stack position. Stacks grow down.
    pub fn check_at(&self, sp: usize) -> Result<(), Violation> {
        match self.low_water {
            Some(low) if sp < low => Err(Violation::NativeStackExhausted),
            _ => Ok(()),
        }
    }

    pub fn check(&self) -> Result<(), Violation> {
        self.check_at(stack_position())
    }
}

#[inline(never)]
fn stack_position() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

// ── Operand stacks ────────────────────────────────────────────────────

impl Vm {
    /// Top frame of the current thread. Aborts if there is none.
    pub fn current_frame(&self) -> Frame {
        self.current_thread()
            .and_then(|t| t.top_frame(&self.heap))
            .unwrap_or_else(|| Violation::EmptyFrameChain.abort())
    }

    fn current_layout(&self) -> (Frame, FrameLayout) {
        let frame = self.current_frame();
        (frame, FrameLayout::for_frame(&self.heap, &*self.metadata, frame))
    }

    /// Reserve `bytes` on the current int stack, returning the old top.
    fn int_stack_grow(&mut self, bytes: u32) -> u32 {
        let (frame, layout) = self.current_layout();
        let sp = frame.saved_int_stack(&self.heap);
        if !self.heap.is_heap_pointer(sp) {
            Violation::CorruptChunk(frame.0).abort();
        }
        let limit = frame.0.addr() + layout.int_stack + layout.max_int_stack as u32 * INT_SLOT_SIZE;
        if sp + bytes > limit {
            Violation::OperandStackOverflow.abort();
        }
        frame.set_saved_int_stack(&mut self.heap, sp + bytes);
        sp
    }

    /// Release `bytes` from the current int stack, returning the new top.
    fn int_stack_shrink(&mut self, bytes: u32) -> u32 {
        let (frame, layout) = self.current_layout();
        let sp = frame.saved_int_stack(&self.heap);
        if !self.heap.is_heap_pointer(sp) {
            Violation::CorruptChunk(frame.0).abort();
        }
        if sp < frame.0.addr() + layout.int_stack + bytes {
            Violation::OperandStackUnderflow.abort();
        }
        frame.set_saved_int_stack(&mut self.heap, sp - bytes);
        sp - bytes
    }

    /// Push a 16-bit value.
    pub fn push_short(&mut self, value: i16) {
        let sp = self.int_stack_grow(INT_SLOT_SIZE);
        self.heap.write_u16(sp, value as u16);
    }

    pub fn pop_short(&mut self) -> i16 {
        let sp = self.int_stack_shrink(INT_SLOT_SIZE);
        self.heap.read_u16(sp) as i16
    }

    /// Push an `int` as two slots, low half first.
    pub fn push_int(&mut self, value: i32) {
        let sp = self.int_stack_grow(2 * INT_SLOT_SIZE);
        self.heap.write_u32(sp, value as u32);
    }

    pub fn pop_int(&mut self) -> i32 {
        let sp = self.int_stack_shrink(2 * INT_SLOT_SIZE);
        self.heap.read_u32(sp) as i32
    }

    /// Push a `long` as four slots.
    pub fn push_long(&mut self, value: i64) {
        let sp = self.int_stack_grow(4 * INT_SLOT_SIZE);
        self.heap.write_i64(sp, value);
    }

    pub fn pop_long(&mut self) -> i64 {
        let sp = self.int_stack_shrink(4 * INT_SLOT_SIZE);
        self.heap.read_i64(sp)
    }

    pub fn push_ref(&mut self, value: Ref) {
        let (frame, layout) = self.current_layout();
        let sp = frame.saved_ref_stack(&self.heap);
        if frame.ref_stack_depth(&self.heap, &layout) >= layout.max_ref_stack as u32 {
            Violation::OperandStackOverflow.abort();
        }
        self.heap.write_ref(sp, value);
        frame.set_saved_ref_stack(&mut self.heap, sp + REF_SIZE as u32);
    }

    /// Pop a reference. The slot keeps its old bits but is no longer a root.
    pub fn pop_ref(&mut self) -> Ref {
        let (frame, layout) = self.current_layout();
        if frame.ref_stack_depth(&self.heap, &layout) == 0 {
            Violation::OperandStackUnderflow.abort();
        }
        let sp = frame.saved_ref_stack(&self.heap) - REF_SIZE as u32;
        frame.set_saved_ref_stack(&mut self.heap, sp);
        self.heap.read_ref(sp)
    }

    pub fn peek_ref(&self) -> Ref {
        let (frame, layout) = self.current_layout();
        if frame.ref_stack_depth(&self.heap, &layout) == 0 {
            Violation::OperandStackUnderflow.abort();
        }
        self.heap.read_ref(frame.saved_ref_stack(&self.heap) - REF_SIZE as u32)
    }

    // ── Throwing ──────────────────────────────────────────────────────

    /// Raise `fault` in the current thread as an exception object of the
    /// fault's class.
    pub fn create_and_throw(&mut self, fault: Fault) {
        let class = self.metadata.fault_class(fault);
        match self.new_object(class) {
            Ok(exception) => self.throw(exception.0),
            Err(err) => {
                let thread = self.current_thread_or_abort();
                warn!("cannot allocate {fault} exception ({err}), finishing thread");
                self.finish_uncaught(thread);
            }
        }
    }

    /// Unwind the current thread to the nearest handler for `exception`.
    /// Frames without one are discarded; the catching frame resumes at the
    /// handler with an emptied operand stack holding only the exception.
    /// A thread with no catching frame finishes.
    pub fn throw(&mut self, exception: Ref) {
        let thread = self.current_thread_or_abort();
        let metadata = Arc::clone(&self.metadata);
        let class = Object(exception).class(&self.heap);

        while let Some(frame) = thread.top_frame(&self.heap) {
            let method = metadata.method_or_abort(frame.method(&self.heap));
            let pc = frame.pc(&self.heap);
            let handler = method.handlers.iter().find(|h| {
                h.covers(pc) && h.catch.is_none_or(|c| metadata.is_subtype_of(class, c))
            });
            if let Some(handler) = handler {
                let layout = FrameLayout::of(method);
                frame.set_pc(&mut self.heap, handler.handler_pc);
                frame.reset_operand_stacks(&mut self.heap, &layout);
                self.push_ref(exception);
                debug!(
                    "thread {}: {class:?} caught at pc {}",
                    thread.id(&self.heap),
                    handler.handler_pc
                );
                return;
            }
            self.pop_frame(thread);
        }

        warn!("thread {}: uncaught {class:?}", thread.id(&self.heap));
        self.finish_uncaught(thread);
    }

    fn finish_uncaught(&mut self, thread: Thread) {
        while thread.top_frame(&self.heap).is_some() {
            self.pop_frame(thread);
        }
        if !thread.is_finished(&self.heap) {
            self.set_status(thread, ThreadStatus::Finished);
        }
    }

    fn current_thread_or_abort(&self) -> Thread {
        self.current_thread()
            .unwrap_or_else(|| Violation::EmptyFrameChain.abort())
    }
}
