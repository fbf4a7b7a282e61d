pub mod alloc;
pub mod arrays;
pub mod clock;
pub mod error;
pub mod execution;
pub mod frame;
pub mod handles;
pub mod layout;
pub mod metadata;
pub mod monitor;
pub mod natives;
pub mod objects;
pub mod threading;

use std::sync::Arc;

use heap::{Heap, HeapSettings, RootProvider};
use object::Ref;

pub use error::{Fault, Violation, VmError};
pub use execution::StackProbe;
pub use heap::{GcStats, HeapError};

use clock::Clock;
use layout::VmLayout;
use metadata::Metadata;
use monitor::MonitorBlock;
use threading::Thread;

#[derive(Debug, Clone)]
pub struct VmSettings {
    pub heap: HeapSettings,
    /// Bytes of native stack frame pushes may consume below the position
    /// at VM creation. `None` disables the probe.
    pub native_stack_budget: Option<usize>,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            heap: HeapSettings::default(),
            native_stack_budget: Some(64 * 1024),
        }
    }
}

/// Everything the collector must treat as a root.
pub struct VmRoots {
    metadata: Arc<dyn Metadata>,
    /// Static fields.
    pub globals: Vec<Ref>,
    /// Thread table. Finished threads stay here until a collection finds
    /// them unreachable.
    pub threads: Vec<Ref>,
    /// Head of the monitor block list.
    pub monitors: Ref,
    pub current_thread: Ref,
    pub(crate) safe: Vec<Ref>,
}

impl RootProvider for VmRoots {
    fn mark_roots(&mut self, heap: &mut Heap) {
        for &thread in &self.threads {
            threading::mark_root_set(heap, &*self.metadata, Thread(thread));
        }

        let mut block = self.monitors.non_null().map(MonitorBlock);
        while let Some(b) = block {
            monitor::mark_root_set(heap, b);
            block = b.next(heap);
        }

        for &r in self.globals.iter().chain(&self.safe) {
            heap.mark_gray_if_white(r);
        }
        heap.mark_gray_if_white(self.current_thread);
    }

    fn relocate_roots(&mut self, heap: &Heap) {
        for r in self.globals.iter_mut().chain(self.safe.iter_mut()) {
            *r = heap.updated_ref(*r);
        }
        self.threads.retain_mut(|t| {
            *t = heap.updated_ref(*t);
            !t.is_null()
        });
        self.monitors = heap.updated_ref(self.monitors);
        self.current_thread = heap.updated_ref(self.current_thread);
    }
}

/// The runtime context: heap, roots and the read-only metadata they are
/// interpreted with.
pub struct Vm {
    pub heap: Heap,
    pub metadata: Arc<dyn Metadata>,
    pub clock: Box<dyn Clock>,
    pub roots: VmRoots,
    pub(crate) probe: StackProbe,
    pub(crate) next_thread_id: u16,
}

impl Vm {
    pub fn new(settings: VmSettings, metadata: Arc<dyn Metadata>, clock: Box<dyn Clock>) -> Self {
        let layout = Arc::new(VmLayout::new(Arc::clone(&metadata)));
        let heap = Heap::new(settings.heap, layout);
        Self {
            heap,
            roots: VmRoots {
                metadata: Arc::clone(&metadata),
                globals: Vec::new(),
                threads: Vec::new(),
                monitors: Ref::NULL,
                current_thread: Ref::NULL,
                safe: Vec::new(),
            },
            metadata,
            clock,
            probe: StackProbe::new(settings.native_stack_budget),
            next_thread_id: 0,
        }
    }

    /// Run a full collection now. Every `Ref` not reachable from
    /// [`Vm::roots`] is invalid afterwards.
    pub fn collect(&mut self) {
        self.heap.collect(&mut self.roots);
        self.release_orphaned_monitors();
    }

    pub fn stats(&self) -> GcStats {
        self.heap.stats
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameLayout;
    use crate::objects::Object;
    use crate::testing::{TestRuntime, method};
    use object::{ChunkKind, HEADER_SIZE};

    #[test]
    fn half_of_a_full_heap_survives_compaction() {
        // thread 40 + frame 36 + keep array 220 + 100 nodes * 24 = 2696
        let mut rt = TestRuntime::with_methods(2704, [method(0, 0, 1, 0)]);
        let thread = rt.vm.create_thread().unwrap();
        let frame = rt.vm.create_frame(rt.methods[0]).unwrap();
        rt.vm.push_frame(thread, frame);
        let keep = rt.vm.new_ref_array(rt.node, 50).unwrap();
        let layout = FrameLayout::for_frame(&rt.vm.heap, &*rt.vm.metadata, frame);
        frame.set_ref_local(&mut rt.vm.heap, &layout, 0, keep.0);

        let node = rt.vm.metadata.class_or_abort(rt.node).clone();
        let mut nodes = Vec::new();
        for i in 0..100 {
            let obj = rt.vm.new_object(rt.node).unwrap();
            obj.write_int(&mut rt.vm.heap, &node, 0, i);
            if i % 2 == 0 {
                keep.set(&mut rt.vm.heap, i / 2, obj.0).unwrap();
            }
            if i >= 2 {
                let prev: Object = nodes[i as usize - 2];
                prev.set_field(&mut rt.vm.heap, 0, obj.0);
            }
            nodes.push(obj);
        }
        assert_eq!(rt.vm.heap.available(), 8);
        assert_eq!(rt.vm.stats().collections, 0);

        let extra = rt.vm.new_object(rt.node).unwrap();

        let stats = rt.vm.stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.chunks_reclaimed, 50);
        assert_eq!(stats.live_bytes, 1496);
        assert_eq!(extra.0.addr(), rt.vm.heap.base() + 1496 + HEADER_SIZE as u32);

        let heap = &rt.vm.heap;
        let thread = rt.vm.thread(0).unwrap();
        let frame = thread.top_frame(heap).unwrap();
        let keep = crate::arrays::RefArray(frame.ref_local(heap, &layout, 0));
        assert_eq!(heap.chunk_kind(keep.0), ChunkKind::RefArray);

        let first = heap.base() + 296 + HEADER_SIZE as u32;
        for k in 0..50 {
            let obj = Object(keep.get(heap, k).unwrap());
            assert_eq!(obj.0.addr(), first + k as u32 * 24);
            assert_eq!(obj.class(heap), rt.node);
            assert_eq!(obj.read_int(heap, &node, 0), 2 * k);
            let next = obj.field(heap, 0);
            if k < 49 {
                assert_eq!(next, keep.get(heap, k + 1).unwrap());
            } else {
                assert_eq!(next, Ref::NULL);
            }
        }
    }

    #[test]
    fn popped_stack_slot_is_not_a_root() {
        let mut rt = TestRuntime::with_methods(512, [method(2, 0, 0, 0)]);
        let thread = rt.vm.create_thread().unwrap();
        rt.vm.set_current_thread(Some(thread));
        let frame = rt.vm.create_frame(rt.methods[0]).unwrap();
        rt.vm.push_frame(thread, frame);
        let stale = rt.vm.new_object(rt.node).unwrap();
        let live = rt.vm.new_object(rt.node).unwrap();
        rt.vm.push_ref(live.0);
        rt.vm.push_ref(stale.0);
        assert_eq!(rt.vm.pop_ref(), stale.0);

        rt.vm.collect();

        assert_eq!(rt.vm.stats().chunks_reclaimed, 1);
        let live = rt.vm.pop_ref();
        assert_eq!(rt.vm.heap.chunk_kind(live), ChunkKind::Object);
        // thread, frame and the one object still on the stack
        assert_eq!(rt.vm.heap.chunks().count(), 3);
    }

    #[test]
    fn globals_are_roots() {
        let mut rt = TestRuntime::with_methods(512, []);
        let garbage = rt.vm.new_object(rt.node).unwrap();
        let a = rt.vm.new_object(rt.node).unwrap();
        let b = rt.vm.new_object(rt.node).unwrap();
        a.set_field(&mut rt.vm.heap, 0, b.0);
        b.set_field(&mut rt.vm.heap, 0, garbage.0);
        b.set_field(&mut rt.vm.heap, 0, Ref::NULL);
        rt.vm.roots.globals.push(a.0);

        rt.vm.collect();

        let a = Object(rt.vm.roots.globals[0]);
        let b = Object(a.field(&rt.vm.heap, 0));
        assert_eq!(a.0.addr(), rt.vm.heap.base() + HEADER_SIZE as u32);
        assert_eq!(b.0.addr(), a.0.addr() + 24);
        assert_eq!(rt.vm.heap.used(), 48);
    }
}
