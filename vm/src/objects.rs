use heap::Heap;
use object::{ClassId, REF_SIZE, Ref};

use crate::metadata::{ClassDescriptor, Metadata};

/// Bytes before the first field: `[class u16][pad u16]`.
pub const OBJECT_HEADER: u32 = 4;

/// Payload bytes of an instance of `class`.
pub fn instance_size(class: &ClassDescriptor) -> usize {
    OBJECT_HEADER as usize + class.ref_fields as usize * REF_SIZE + class.primitive_bytes as usize
}

/// View over an `Object` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Object(pub Ref);

impl Object {
    pub fn class(self, heap: &Heap) -> ClassId {
        ClassId(heap.read_u16(self.0.addr()))
    }

    pub(crate) fn init(self, heap: &mut Heap, class: ClassId) {
        heap.write_u16(self.0.addr(), class.0);
    }

    #[inline]
    fn field_addr(self, index: u16) -> u32 {
        self.0.addr() + OBJECT_HEADER + index as u32 * REF_SIZE as u32
    }

    pub fn field(self, heap: &Heap, index: u16) -> Ref {
        heap.read_ref(self.field_addr(index))
    }

    pub fn set_field(self, heap: &mut Heap, index: u16, value: Ref) {
        heap.write_ref(self.field_addr(index), value);
    }

    /// Address of primitive byte `offset`.
    fn primitive_addr(self, class: &ClassDescriptor, offset: u16) -> u32 {
        debug_assert!(offset < class.primitive_bytes);
        self.field_addr(class.ref_fields) + offset as u32
    }

    pub fn read_int(self, heap: &Heap, class: &ClassDescriptor, offset: u16) -> i32 {
        heap.read_u32(self.primitive_addr(class, offset)) as i32
    }

    pub fn write_int(self, heap: &mut Heap, class: &ClassDescriptor, offset: u16, value: i32) {
        heap.write_u32(self.primitive_addr(class, offset), value as u32);
    }
}

pub(crate) fn trace(heap: &Heap, metadata: &dyn Metadata, obj: Object, visitor: &mut dyn FnMut(Ref)) {
    let class = metadata.class_or_abort(obj.class(heap));
    for i in 0..class.ref_fields {
        visitor(obj.field(heap, i));
    }
}

pub(crate) fn relocate(heap: &mut Heap, metadata: &dyn Metadata, obj: Object) {
    let class = metadata.class_or_abort(obj.class(heap));
    for i in 0..class.ref_fields {
        heap.relocate_slot(obj.field_addr(i));
    }
}
