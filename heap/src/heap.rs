//! Chunk heap.
//!
//! One contiguous arena carved into tagged chunks by a bump pointer. The
//! arena never grows: when a request does not fit, the heap runs one full
//! mark-compact cycle (see `collector.rs`) and retries once.
//!
//! The heap only knows chunk identity (kind and size) and mark color.
//! Consumers provide:
//! - A [`ChunkLayout`] that enumerates and rewrites the references stored
//!   inside each chunk kind.
//! - A [`RootProvider`] that marks and relocates everything reachable from
//!   outside the arena.

use std::sync::Arc;

use log::{trace, warn};
use object::{CHUNK_ALIGN, ChunkHeader, ChunkKind, Color, HEADER_SIZE, REF_SIZE, Ref, align_chunk};

// ── Public API types ──────────────────────────────────────────────────

/// Knows where references live inside each chunk kind.
pub trait ChunkLayout {
    /// Call `visitor` for every reference currently stored in `chunk`.
    fn trace(&self, heap: &Heap, chunk: Ref, visitor: &mut dyn FnMut(Ref));

    /// Rewrite every reference stored in `chunk` with
    /// [`Heap::updated_ref`], plus any interior pointer the chunk keeps
    /// into itself.
    ///
    /// Runs after shifts are computed and before anything moves, so every
    /// address read here is still an old address.
    fn relocate(&self, heap: &mut Heap, chunk: Ref);
}

/// Consumers implement this to provide GC roots.
pub trait RootProvider {
    /// Color the root set: chunks that are roots themselves go black
    /// ([`Heap::mark_black`]), chunks they reference go gray
    /// ([`Heap::mark_gray_if_white`]).
    fn mark_roots(&mut self, heap: &mut Heap);

    /// Rewrite every reference held outside the arena. Same timing as
    /// [`ChunkLayout::relocate`].
    fn relocate_roots(&mut self, heap: &Heap);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("out of memory: requested {requested} bytes, {available} available after collection")]
    OutOfMemory { requested: usize, available: usize },
}

/// Counters updated by every collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub collections: usize,
    pub bytes_reclaimed: usize,
    pub chunks_reclaimed: usize,
    /// Bytes in use right after the last collection.
    pub live_bytes: usize,
}

// ── Heap settings ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Arena size in bytes. Must be a non-zero multiple of the chunk alignment.
    pub heap_size: usize,
    /// Address of the first arena byte. Address 0 is null, so this must be
    /// non-zero, and the arena must end below `u32::MAX`.
    pub base_address: u32,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: 4096,
            base_address: 0x1000,
        }
    }
}

impl HeapSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size == 0 {
            return Err("heap_size must be > 0");
        }
        if align_chunk(self.heap_size) != self.heap_size {
            return Err("heap_size must be a multiple of the chunk alignment");
        }
        if self.base_address == 0 {
            return Err("base_address must not be the null address");
        }
        if align_chunk(self.base_address as usize) != self.base_address as usize {
            return Err("base_address must be chunk aligned");
        }
        if (self.base_address as u64) + (self.heap_size as u64) > u32::MAX as u64 {
            return Err("arena does not fit in the 32-bit address space");
        }
        Ok(())
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

pub struct Heap {
    settings: HeapSettings,
    memory: Box<[u8]>,
    /// Arena offset of the first free byte.
    pub(crate) top: usize,
    pub(crate) layout: Arc<dyn ChunkLayout>,
    /// Gray chunks whose children are not yet queued.
    pub(crate) gray: Vec<Ref>,
    pub(crate) collecting: bool,
    pub stats: GcStats,
}

impl core::fmt::Debug for Heap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("settings", &self.settings)
            .field("top", &self.top)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Heap {
    pub fn new(settings: HeapSettings, layout: Arc<dyn ChunkLayout>) -> Self {
        settings.validate().expect("Invalid Heap Settings");
        let memory = vec![0u8; settings.heap_size].into_boxed_slice();
        Self {
            settings,
            memory,
            top: 0,
            layout,
            gray: Vec::new(),
            collecting: false,
            stats: GcStats::default(),
        }
    }

    #[inline]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Bytes occupied by chunks, headers included.
    #[inline]
    pub fn used(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.capacity() - self.top
    }

    /// First address of the arena.
    #[inline]
    pub fn base(&self) -> u32 {
        self.settings.base_address
    }

    /// One past the last address of the arena.
    #[inline]
    pub fn end(&self) -> u32 {
        self.settings.base_address + self.capacity() as u32
    }

    /// Whether `addr` lies inside the arena. Anything else (null, native
    /// buffers, stacks) is off-heap and never touched by the collector.
    #[inline(always)]
    pub fn is_heap_pointer(&self, addr: u32) -> bool {
        addr >= self.base() && addr < self.end()
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocate a chunk with `size` payload bytes.
    ///
    /// The payload is zeroed and the chunk starts white. When the arena is
    /// exhausted the heap collects once using `roots` and retries; any
    /// `Ref` the caller holds outside `roots` is invalid after this call.
    pub fn allocate(
        &mut self,
        size: usize,
        kind: ChunkKind,
        roots: &mut dyn RootProvider,
    ) -> Result<Ref, HeapError> {
        let Some(total) = HEADER_SIZE
            .checked_add(size)
            .and_then(|n| n.checked_next_multiple_of(CHUNK_ALIGN))
        else {
            warn!("out of memory: {kind:?} chunk of {size} payload bytes");
            return Err(HeapError::OutOfMemory {
                requested: size,
                available: self.available(),
            });
        };
        if let Some(chunk) = self.try_allocate(total, kind) {
            return Ok(chunk);
        }

        self.collect(roots);

        if let Some(chunk) = self.try_allocate(total, kind) {
            return Ok(chunk);
        }
        warn!(
            "out of memory: {kind:?} chunk of {total} bytes, {} available",
            self.available()
        );
        Err(HeapError::OutOfMemory {
            requested: total,
            available: self.available(),
        })
    }

    fn try_allocate(&mut self, total: usize, kind: ChunkKind) -> Option<Ref> {
        if total > self.available() {
            return None;
        }
        let offset = self.top;
        let header = ChunkHeader::new(kind, total as u32);
        self.memory[offset..offset + HEADER_SIZE].copy_from_slice(&header.encode());
        self.memory[offset + HEADER_SIZE..offset + total].fill(0);
        self.top += total;

        let chunk = Ref::from_addr(self.base() + (offset + HEADER_SIZE) as u32);
        trace!("allocated {kind:?} {chunk:?} ({total} bytes)");
        Some(chunk)
    }

    // ── Chunk headers ─────────────────────────────────────────────────

    #[inline(always)]
    fn offset_of(&self, addr: u32) -> usize {
        debug_assert!(self.is_heap_pointer(addr), "address 0x{addr:x} is off-heap");
        (addr - self.base()) as usize
    }

    pub(crate) fn header_at(&self, offset: usize) -> ChunkHeader {
        ChunkHeader::decode(&self.memory[offset..offset + HEADER_SIZE])
            .unwrap_or_else(|| panic!("corrupt chunk header at arena offset {offset}"))
    }

    pub(crate) fn write_header_at(&mut self, offset: usize, header: ChunkHeader) {
        self.memory[offset..offset + HEADER_SIZE].copy_from_slice(&header.encode());
    }

    #[inline]
    pub fn header(&self, chunk: Ref) -> ChunkHeader {
        self.header_at(self.offset_of(chunk.addr()) - HEADER_SIZE)
    }

    #[inline]
    fn write_header(&mut self, chunk: Ref, header: ChunkHeader) {
        let offset = self.offset_of(chunk.addr()) - HEADER_SIZE;
        self.write_header_at(offset, header);
    }

    #[inline]
    pub fn chunk_kind(&self, chunk: Ref) -> ChunkKind {
        self.header(chunk).kind
    }

    /// Payload size of `chunk`, without the header.
    #[inline]
    pub fn chunk_size(&self, chunk: Ref) -> usize {
        self.header(chunk).payload_size() as usize
    }

    #[inline]
    pub fn color(&self, chunk: Ref) -> Color {
        self.header(chunk).color
    }

    pub fn set_color(&mut self, chunk: Ref, color: Color) {
        let mut header = self.header(chunk);
        header.color = color;
        self.write_header(chunk, header);
    }

    /// Bytes `chunk` will move down during the current compaction.
    #[inline]
    pub fn chunk_shift(&self, chunk: Ref) -> u32 {
        self.header(chunk).shift
    }

    /// Mark a chunk that is itself a root. Its references are the root
    /// provider's business, so it is not queued for tracing.
    pub fn mark_black(&mut self, chunk: Ref) {
        if chunk.is_null() || !self.is_heap_pointer(chunk.addr()) {
            return;
        }
        self.set_color(chunk, Color::Black);
    }

    /// Gray a white chunk and queue it for tracing. Null, off-heap and
    /// already colored references are ignored.
    pub fn mark_gray_if_white(&mut self, r: Ref) {
        if r.is_null() || !self.is_heap_pointer(r.addr()) {
            return;
        }
        if self.color(r) == Color::White {
            self.set_color(r, Color::Gray);
            self.gray.push(r);
        }
    }

    /// Post-compaction address of `r`.
    ///
    /// Only valid during the relocation step of a collection. Null and
    /// off-heap references come back unchanged; a reference to a chunk
    /// reclaimed in this cycle comes back null.
    pub fn updated_ref(&self, r: Ref) -> Ref {
        if r.is_null() || !self.is_heap_pointer(r.addr()) {
            return r;
        }
        let header = self.header(r);
        if header.color == Color::White {
            trace!("dropping reference to reclaimed chunk {r:?}");
            return Ref::NULL;
        }
        Ref::from_addr(r.addr() - header.shift)
    }

    /// Whether `r` survives the current collection. Null and off-heap
    /// references trivially do.
    pub fn survives(&self, r: Ref) -> bool {
        r.is_null() || !self.is_heap_pointer(r.addr()) || self.color(r) != Color::White
    }

    /// Live chunks in address order.
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks { heap: self, offset: 0 }
    }

    // ── Raw access ────────────────────────────────────────────────────

    #[inline]
    pub fn bytes(&self, addr: u32, len: usize) -> &[u8] {
        let offset = self.offset_of(addr);
        &self.memory[offset..offset + len]
    }

    #[inline]
    pub fn bytes_mut(&mut self, addr: u32, len: usize) -> &mut [u8] {
        let offset = self.offset_of(addr);
        &mut self.memory[offset..offset + len]
    }

    #[inline]
    fn read_array<const N: usize>(&self, addr: u32) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(addr, N));
        out
    }

    #[inline]
    pub fn read_u8(&self, addr: u32) -> u8 {
        self.memory[self.offset_of(addr)]
    }

    #[inline]
    pub fn write_u8(&mut self, addr: u32, value: u8) {
        let offset = self.offset_of(addr);
        self.memory[offset] = value;
    }

    #[inline]
    pub fn read_u16(&self, addr: u32) -> u16 {
        u16::from_le_bytes(self.read_array(addr))
    }

    #[inline]
    pub fn write_u16(&mut self, addr: u32, value: u16) {
        self.bytes_mut(addr, 2).copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn read_u32(&self, addr: u32) -> u32 {
        u32::from_le_bytes(self.read_array(addr))
    }

    #[inline]
    pub fn write_u32(&mut self, addr: u32, value: u32) {
        self.bytes_mut(addr, 4).copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn read_i64(&self, addr: u32) -> i64 {
        i64::from_le_bytes(self.read_array(addr))
    }

    #[inline]
    pub fn write_i64(&mut self, addr: u32, value: i64) {
        self.bytes_mut(addr, 8).copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn read_ref(&self, addr: u32) -> Ref {
        Ref::from_le_bytes(self.read_array(addr))
    }

    #[inline]
    pub fn write_ref(&mut self, addr: u32, value: Ref) {
        self.bytes_mut(addr, REF_SIZE).copy_from_slice(&value.to_le_bytes());
    }

    /// Replace the reference stored at `addr` with its updated value.
    #[inline]
    pub fn relocate_slot(&mut self, addr: u32) {
        let old = self.read_ref(addr);
        let new = self.updated_ref(old);
        if new != old {
            self.write_ref(addr, new);
        }
    }

    /// Copy `len` bytes; the ranges may overlap.
    pub fn copy_within(&mut self, src: u32, dst: u32, len: usize) {
        if len == 0 {
            return;
        }
        let src = self.offset_of(src);
        let dst = self.offset_of(dst);
        self.memory.copy_within(src..src + len, dst);
    }

    /// Copy `len` bytes between ranges the caller guarantees are disjoint.
    pub fn copy_disjoint(&mut self, src: u32, dst: u32, len: usize) {
        if len == 0 {
            return;
        }
        let src = self.offset_of(src);
        let dst = self.offset_of(dst);
        debug_assert!(src + len <= dst || dst + len <= src, "overlapping copy");
        if src < dst {
            let (low, high) = self.memory.split_at_mut(dst);
            high[..len].copy_from_slice(&low[src..src + len]);
        } else {
            let (low, high) = self.memory.split_at_mut(src);
            low[dst..dst + len].copy_from_slice(&high[..len]);
        }
    }

    #[cfg(test)]
    pub(crate) fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub(crate) fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }
}

/// Iterator over `(payload ref, header)` pairs. See [`Heap::chunks`].
pub struct Chunks<'a> {
    heap: &'a Heap,
    offset: usize,
}

impl Iterator for Chunks<'_> {
    type Item = (Ref, ChunkHeader);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.heap.top {
            return None;
        }
        let header = self.heap.header_at(self.offset);
        let chunk = Ref::from_addr(self.heap.base() + (self.offset + HEADER_SIZE) as u32);
        self.offset += header.size as usize;
        Some((chunk, header))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Test layout: every `Object` payload is `[count u32][count refs]`.
    pub(crate) struct CellLayout;

    impl ChunkLayout for CellLayout {
        fn trace(&self, heap: &Heap, chunk: Ref, visitor: &mut dyn FnMut(Ref)) {
            let count = heap.read_u32(chunk.addr());
            for i in 0..count {
                visitor(heap.read_ref(chunk.addr() + 4 + i * 4));
            }
        }

        fn relocate(&self, heap: &mut Heap, chunk: Ref) {
            let count = heap.read_u32(chunk.addr());
            for i in 0..count {
                heap.relocate_slot(chunk.addr() + 4 + i * 4);
            }
        }
    }

    /// A simple root provider that holds a list of references.
    #[derive(Default)]
    pub(crate) struct TestRoots {
        pub(crate) roots: Vec<Ref>,
    }

    impl RootProvider for TestRoots {
        fn mark_roots(&mut self, heap: &mut Heap) {
            for &root in &self.roots {
                heap.mark_gray_if_white(root);
            }
        }

        fn relocate_roots(&mut self, heap: &Heap) {
            for root in &mut self.roots {
                *root = heap.updated_ref(*root);
            }
        }
    }

    pub(crate) fn create_test_heap(heap_size: usize) -> Heap {
        let settings = HeapSettings {
            heap_size,
            base_address: 0x1000,
        };
        Heap::new(settings, Arc::new(CellLayout))
    }

    /// Allocate a cell with `slots` reference slots and store `tag` after them.
    pub(crate) fn cell(heap: &mut Heap, roots: &mut TestRoots, slots: u32, tag: u32) -> Ref {
        let chunk = heap
            .allocate(4 + slots as usize * 4 + 4, ChunkKind::Object, roots)
            .expect("allocation failed");
        heap.write_u32(chunk.addr(), slots);
        heap.write_u32(chunk.addr() + 4 + slots * 4, tag);
        chunk
    }

    pub(crate) fn tag(heap: &Heap, chunk: Ref) -> u32 {
        let slots = heap.read_u32(chunk.addr());
        heap.read_u32(chunk.addr() + 4 + slots * 4)
    }

    #[test]
    fn test_settings_validation() {
        assert!(HeapSettings::default().validate().is_ok());
        let bad = HeapSettings { heap_size: 0, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = HeapSettings { heap_size: 4097, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = HeapSettings { base_address: 0, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = HeapSettings { base_address: u32::MAX - 16, ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_allocation_basic() {
        let mut heap = create_test_heap(256);
        let mut roots = TestRoots::default();

        let a = heap.allocate(8, ChunkKind::Object, &mut roots).unwrap();
        let b = heap.allocate(5, ChunkKind::IntArray, &mut roots).unwrap();

        assert_eq!(a.addr(), 0x1000 + HEADER_SIZE as u32);
        // 12 header + 8 payload
        assert_eq!(b.addr(), a.addr() + 20);
        assert_eq!(heap.chunk_kind(a), ChunkKind::Object);
        assert_eq!(heap.chunk_kind(b), ChunkKind::IntArray);
        assert_eq!(heap.chunk_size(a), 8);
        // 5 payload bytes round up to 8
        assert_eq!(heap.chunk_size(b), 8);
        assert_eq!(heap.used(), 40);
        assert_eq!(heap.color(a), Color::White);
        assert_eq!(heap.chunks().count(), 2);
    }

    #[test]
    fn test_allocation_zeroes_payload() {
        let mut heap = create_test_heap(64);
        let mut roots = TestRoots::default();

        let a = heap.allocate(16, ChunkKind::IntArray, &mut roots).unwrap();
        heap.bytes_mut(a.addr(), 16).fill(0xAB);
        // a is garbage: the next request collects and reuses its bytes
        let b = heap.allocate(40, ChunkKind::IntArray, &mut roots).unwrap();
        assert_eq!(b, a);
        assert!(heap.bytes(b.addr(), 40).iter().all(|&byte| byte == 0));
    }

    #[test]
    fn test_heap_pointer_range() {
        let heap = create_test_heap(128);
        assert!(!heap.is_heap_pointer(0));
        assert!(!heap.is_heap_pointer(0xfff));
        assert!(heap.is_heap_pointer(0x1000));
        assert!(heap.is_heap_pointer(0x107f));
        assert!(!heap.is_heap_pointer(0x1080));
    }

    #[test]
    fn test_raw_access() {
        let mut heap = create_test_heap(64);
        let mut roots = TestRoots::default();
        let a = heap.allocate(24, ChunkKind::IntArray, &mut roots).unwrap();

        heap.write_u8(a.addr(), 0x7f);
        heap.write_u16(a.addr() + 2, 0xbeef);
        heap.write_u32(a.addr() + 4, 0xdead_beef);
        heap.write_i64(a.addr() + 8, -5);
        heap.write_ref(a.addr() + 16, Ref::from_addr(0x2000));

        assert_eq!(heap.read_u8(a.addr()), 0x7f);
        assert_eq!(heap.read_u16(a.addr() + 2), 0xbeef);
        assert_eq!(heap.read_u32(a.addr() + 4), 0xdead_beef);
        assert_eq!(heap.read_i64(a.addr() + 8), -5);
        assert_eq!(heap.read_ref(a.addr() + 16), Ref::from_addr(0x2000));
        assert_eq!(&heap.memory()[HEADER_SIZE + 4..HEADER_SIZE + 8], &0xdead_beefu32.to_le_bytes());
    }

    #[test]
    fn test_copies() {
        let mut heap = create_test_heap(64);
        let mut roots = TestRoots::default();
        let a = heap.allocate(8, ChunkKind::IntArray, &mut roots).unwrap();
        let b = heap.allocate(8, ChunkKind::IntArray, &mut roots).unwrap();
        heap.bytes_mut(a.addr(), 8).copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        heap.copy_disjoint(a.addr(), b.addr(), 8);
        assert_eq!(heap.bytes(b.addr(), 8), &[1, 2, 3, 4, 5, 6, 7, 8]);

        heap.copy_within(a.addr(), a.addr() + 2, 6);
        assert_eq!(heap.bytes(a.addr(), 8), &[1, 2, 1, 2, 3, 4, 5, 6]);

        heap.copy_disjoint(b.addr() + 4, a.addr(), 4);
        assert_eq!(heap.bytes(a.addr(), 4), &[5, 6, 7, 8]);
    }

    #[test]
    fn test_out_of_memory() {
        let mut heap = create_test_heap(64);
        let mut roots = TestRoots::default();

        let a = cell(&mut heap, &mut roots, 0, 1);
        roots.roots.push(a);
        let err = heap.allocate(64, ChunkKind::Object, &mut roots).unwrap_err();
        assert_eq!(
            err,
            HeapError::OutOfMemory { requested: 76, available: 64 - 20 }
        );
        // the failed request still collected once
        assert_eq!(heap.stats.collections, 1);
        assert_eq!(tag(&heap, roots.roots[0]), 1);
    }

    #[test]
    fn test_oversized_request_is_out_of_memory() {
        let mut heap = create_test_heap(64);
        let mut roots = TestRoots::default();

        for size in [usize::MAX, usize::MAX - HEADER_SIZE, usize::MAX - HEADER_SIZE - 1] {
            let err = heap.allocate(size, ChunkKind::Object, &mut roots).unwrap_err();
            assert_eq!(err, HeapError::OutOfMemory { requested: size, available: 64 });
        }
        // rejected before collecting
        assert_eq!(heap.stats.collections, 0);
        assert_eq!(heap.used(), 0);
    }
}
