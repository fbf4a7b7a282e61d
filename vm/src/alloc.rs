use heap::HeapError;
use object::{ChunkKind, ClassId, ElementType, Ref};

use crate::Vm;
use crate::arrays::{IntArray, RefArray, int_array_size, ref_array_size};
use crate::objects::{Object, instance_size};

impl Vm {
    /// Allocate a raw chunk with `size` zeroed payload bytes, collecting
    /// with the VM roots if the arena is full.
    pub fn allocate(&mut self, size: usize, kind: ChunkKind) -> Result<Ref, HeapError> {
        let collections = self.heap.stats.collections;
        let chunk = self.heap.allocate(size, kind, &mut self.roots);
        if self.heap.stats.collections != collections {
            self.release_orphaned_monitors();
        }
        chunk
    }

    /// Allocate an instance of `class` with all fields zeroed.
    ///
    /// Aborts if `class` is unknown.
    pub fn new_object(&mut self, class: ClassId) -> Result<Object, HeapError> {
        let size = instance_size(self.metadata.class_or_abort(class));
        let obj = Object(self.allocate(size, ChunkKind::Object)?);
        obj.init(&mut self.heap, class);
        Ok(obj)
    }

    /// Allocate a primitive array of `length` zeroed elements.
    pub fn new_int_array(&mut self, element: ElementType, length: u32) -> Result<IntArray, HeapError> {
        let array = IntArray(self.allocate(int_array_size(element, length), ChunkKind::IntArray)?);
        array.init(&mut self.heap, element, length);
        Ok(array)
    }

    /// Allocate a reference array of `length` null elements accepting
    /// instances of `class`.
    pub fn new_ref_array(&mut self, class: ClassId, length: u32) -> Result<RefArray, HeapError> {
        let array = RefArray(self.allocate(ref_array_size(length), ChunkKind::RefArray)?);
        array.init(&mut self.heap, class, length);
        Ok(array)
    }
}
