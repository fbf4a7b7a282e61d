//! Reference maps for every chunk kind the VM allocates.

use std::sync::Arc;

use heap::{ChunkLayout, Heap};
use object::{ChunkKind, Ref};

use crate::arrays::{self, RefArray};
use crate::frame::{self, Frame};
use crate::metadata::Metadata;
use crate::monitor::{self, MonitorBlock};
use crate::objects::{self, Object};
use crate::threading::{self, Thread};

pub struct VmLayout {
    metadata: Arc<dyn Metadata>,
}

impl VmLayout {
    pub fn new(metadata: Arc<dyn Metadata>) -> Self {
        Self { metadata }
    }
}

impl ChunkLayout for VmLayout {
    fn trace(&self, heap: &Heap, chunk: Ref, visitor: &mut dyn FnMut(Ref)) {
        let metadata = &*self.metadata;
        match heap.chunk_kind(chunk) {
            ChunkKind::Object => objects::trace(heap, metadata, Object(chunk), visitor),
            ChunkKind::IntArray => {}
            ChunkKind::RefArray => arrays::trace_refs(heap, RefArray(chunk), visitor),
            ChunkKind::Thread => threading::trace(heap, Thread(chunk), visitor),
            ChunkKind::Frame => frame::trace(heap, metadata, Frame(chunk), visitor),
            ChunkKind::MonitorBlock => monitor::trace(heap, MonitorBlock(chunk), visitor),
        }
    }

    fn relocate(&self, heap: &mut Heap, chunk: Ref) {
        let metadata = &*self.metadata;
        match heap.chunk_kind(chunk) {
            ChunkKind::Object => objects::relocate(heap, metadata, Object(chunk)),
            ChunkKind::IntArray => {}
            ChunkKind::RefArray => arrays::relocate_refs(heap, RefArray(chunk)),
            ChunkKind::Thread => threading::relocate(heap, Thread(chunk)),
            ChunkKind::Frame => frame::relocate(heap, metadata, Frame(chunk)),
            ChunkKind::MonitorBlock => monitor::relocate(heap, MonitorBlock(chunk)),
        }
    }
}
