//! Int and reference arrays.
//!
//! Both kinds start with the element count so that bounds can be checked
//! without knowing which kind an array is.

use heap::Heap;
use log::trace;
use object::{ChunkKind, ClassId, ElementType, REF_SIZE, Ref};

use crate::error::{Fault, Violation};
use crate::metadata::Metadata;

/// `[length u32][element type u8 | element class u16][pad]`.
pub const ARRAY_HEADER: u32 = 8;

const LENGTH: u32 = 0;
const ELEMENT: u32 = 4;

#[inline]
fn length_of(heap: &Heap, array: Ref) -> u32 {
    heap.read_u32(array.addr() + LENGTH)
}

#[inline]
fn check_index(length: u32, index: i32) -> Result<u32, Fault> {
    if index < 0 || index as u32 >= length {
        return Err(Fault::IndexOutOfBounds);
    }
    Ok(index as u32)
}

pub fn int_array_size(element: ElementType, length: u32) -> usize {
    ARRAY_HEADER as usize + element.width() * length as usize
}

pub fn ref_array_size(length: u32) -> usize {
    ARRAY_HEADER as usize + REF_SIZE * length as usize
}

/// View over an `IntArray` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntArray(pub Ref);

impl IntArray {
    pub(crate) fn init(self, heap: &mut Heap, element: ElementType, length: u32) {
        heap.write_u32(self.0.addr() + LENGTH, length);
        heap.write_u8(self.0.addr() + ELEMENT, element as u8);
    }

    pub fn length(self, heap: &Heap) -> u32 {
        length_of(heap, self.0)
    }

    pub fn element_type(self, heap: &Heap) -> ElementType {
        ElementType::from_code(heap.read_u8(self.0.addr() + ELEMENT))
            .unwrap_or_else(|| Violation::CorruptChunk(self.0).abort())
    }

    #[inline]
    fn data(self) -> u32 {
        self.0.addr() + ARRAY_HEADER
    }

    /// Element `index`, widened to 64 bits. Floating point elements come
    /// back as their raw bits.
    pub fn get(self, heap: &Heap, index: i32) -> Result<i64, Fault> {
        let index = check_index(self.length(heap), index)?;
        let element = self.element_type(heap);
        let addr = self.data() + index * element.width() as u32;
        Ok(match element {
            ElementType::Boolean | ElementType::Char => heap.read_u8(addr) as i64,
            ElementType::Byte => heap.read_u8(addr) as i8 as i64,
            ElementType::Short => heap.read_u16(addr) as i16 as i64,
            ElementType::Int | ElementType::Float => heap.read_u32(addr) as i32 as i64,
            ElementType::Long | ElementType::Double => heap.read_i64(addr),
        })
    }

    /// Store `value` truncated to the element width.
    pub fn set(self, heap: &mut Heap, index: i32, value: i64) -> Result<(), Fault> {
        let index = check_index(self.length(heap), index)?;
        let element = self.element_type(heap);
        let addr = self.data() + index * element.width() as u32;
        match element.width() {
            1 => heap.write_u8(addr, value as u8),
            2 => heap.write_u16(addr, value as u16),
            4 => heap.write_u32(addr, value as u32),
            _ => heap.write_i64(addr, value),
        }
        Ok(())
    }
}

/// View over a `RefArray` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefArray(pub Ref);

impl RefArray {
    pub(crate) fn init(self, heap: &mut Heap, class: ClassId, length: u32) {
        heap.write_u32(self.0.addr() + LENGTH, length);
        heap.write_u16(self.0.addr() + ELEMENT, class.0);
    }

    pub fn length(self, heap: &Heap) -> u32 {
        length_of(heap, self.0)
    }

    pub fn element_class(self, heap: &Heap) -> ClassId {
        ClassId(heap.read_u16(self.0.addr() + ELEMENT))
    }

    #[inline]
    fn slot(self, index: u32) -> u32 {
        self.0.addr() + ARRAY_HEADER + index * REF_SIZE as u32
    }

    pub fn get(self, heap: &Heap, index: i32) -> Result<Ref, Fault> {
        let index = check_index(self.length(heap), index)?;
        Ok(heap.read_ref(self.slot(index)))
    }

    pub fn set(self, heap: &mut Heap, index: i32, value: Ref) -> Result<(), Fault> {
        let index = check_index(self.length(heap), index)?;
        heap.write_ref(self.slot(index), value);
        Ok(())
    }
}

pub(crate) fn trace_refs(heap: &Heap, array: RefArray, visitor: &mut dyn FnMut(Ref)) {
    for i in 0..array.length(heap) {
        visitor(heap.read_ref(array.slot(i)));
    }
}

pub(crate) fn relocate_refs(heap: &mut Heap, array: RefArray) {
    for i in 0..array.length(heap) {
        heap.relocate_slot(array.slot(i));
    }
}

/// Copy `length` elements from `src[src_pos..]` to `dst[dst_pos..]`.
///
/// Checks run in a fixed order and all of them before any byte moves:
/// null arrays, then bounds, then chunk kind, then element type or class
/// compatibility. Copying within one array behaves as if through a
/// temporary buffer.
pub fn copy(
    heap: &mut Heap,
    metadata: &dyn Metadata,
    src: Ref,
    src_pos: i32,
    dst: Ref,
    dst_pos: i32,
    length: i32,
) -> Result<(), Fault> {
    if src.is_null() || dst.is_null() {
        return Err(Fault::NullPointer);
    }
    let src_kind = heap.chunk_kind(src);
    let dst_kind = heap.chunk_kind(dst);
    if !src_kind.is_array() || !dst_kind.is_array() {
        return Err(Fault::ArrayStore);
    }

    let (src_pos, dst_pos, length) = (src_pos as i64, dst_pos as i64, length as i64);
    if src_pos < 0
        || src_pos + length > length_of(heap, src) as i64
        || dst_pos < 0
        || dst_pos + length > length_of(heap, dst) as i64
        || length < 0
    {
        return Err(Fault::IndexOutOfBounds);
    }

    if src_kind != dst_kind {
        return Err(Fault::ArrayStore);
    }
    let width = match src_kind {
        ChunkKind::IntArray => {
            let element = IntArray(src).element_type(heap);
            if element != IntArray(dst).element_type(heap) {
                return Err(Fault::ArrayStore);
            }
            element.width()
        }
        _ => {
            let src_class = RefArray(src).element_class(heap);
            let dst_class = RefArray(dst).element_class(heap);
            if !metadata.is_subtype_of(src_class, dst_class) {
                return Err(Fault::ArrayStore);
            }
            REF_SIZE
        }
    };

    let bytes = length as usize * width;
    let from = src.addr() + ARRAY_HEADER + (src_pos as usize * width) as u32;
    let to = dst.addr() + ARRAY_HEADER + (dst_pos as usize * width) as u32;
    if src == dst {
        heap.copy_within(from, to, bytes);
    } else {
        heap.copy_disjoint(from, to, bytes);
    }
    trace!("arraycopy {src:?}[{src_pos}..] -> {dst:?}[{dst_pos}..], {length} elements");
    Ok(())
}
