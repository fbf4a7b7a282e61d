//! Mark-compact collection.
//!
//! A cycle runs in five steps:
//! 1. The root provider colors the root set.
//! 2. Gray chunks are traced until none remain. Everything reachable is
//!    black, everything else is still white.
//! 3. One walk over the arena stores in each live chunk the number of
//!    white bytes below it (its shift).
//! 4. Every reference, inside live chunks and in the root set, is rewritten
//!    to its post-compaction address while all chunks are still in place.
//! 5. Live chunks slide down by their shift in address order, which
//!    preserves allocation order. Survivors end white with a zero shift.

use std::sync::Arc;

use log::debug;
use object::{Color, HEADER_SIZE, Ref};

use crate::{Heap, RootProvider};

impl Heap {
    /// Run one full collection.
    ///
    /// # Panics
    ///
    /// If called while a collection is already running, e.g. from inside
    /// a root provider or layout callback.
    pub fn collect(&mut self, roots: &mut dyn RootProvider) {
        assert!(!self.collecting, "garbage collection is not re-entrant");
        self.collecting = true;
        let used_before = self.top;

        roots.mark_roots(self);
        self.mark_transitive();

        let (bytes_reclaimed, chunks_reclaimed) = self.compute_shifts();

        self.relocate_chunks();
        roots.relocate_roots(self);

        self.slide(bytes_reclaimed);

        self.stats.collections += 1;
        self.stats.bytes_reclaimed += bytes_reclaimed;
        self.stats.chunks_reclaimed += chunks_reclaimed;
        self.stats.live_bytes = self.top;
        self.collecting = false;

        debug!(
            "gc #{}: {} -> {} bytes, reclaimed {} chunks ({} bytes)",
            self.stats.collections, used_before, self.top, chunks_reclaimed, bytes_reclaimed
        );
    }

    fn mark_transitive(&mut self) {
        let layout = Arc::clone(&self.layout);
        let mut children = Vec::new();
        while let Some(chunk) = self.gray.pop() {
            // roots may blacken a chunk after it was queued
            if self.color(chunk) != Color::Gray {
                continue;
            }
            self.set_color(chunk, Color::Black);
            layout.trace(self, chunk, &mut |child| children.push(child));
            for child in children.drain(..) {
                self.mark_gray_if_white(child);
            }
        }
    }

    /// Returns the bytes and number of chunks that will be reclaimed.
    fn compute_shifts(&mut self) -> (usize, usize) {
        let mut free = 0usize;
        let mut dead = 0usize;
        let mut offset = 0;
        while offset < self.top {
            let mut header = self.header_at(offset);
            debug_assert_ne!(header.color, Color::Gray, "gray chunk after marking");
            if header.color == Color::White {
                free += header.size as usize;
                dead += 1;
            } else {
                header.shift = free as u32;
                self.write_header_at(offset, header);
            }
            offset += header.size as usize;
        }
        (free, dead)
    }

    fn relocate_chunks(&mut self) {
        let layout = Arc::clone(&self.layout);
        let mut offset = 0;
        while offset < self.top {
            let header = self.header_at(offset);
            if header.color != Color::White {
                let chunk = Ref::from_addr(self.base() + (offset + HEADER_SIZE) as u32);
                layout.relocate(self, chunk);
            }
            offset += header.size as usize;
        }
    }

    fn slide(&mut self, free: usize) {
        let mut offset = 0;
        let end = self.top;
        while offset < end {
            let mut header = self.header_at(offset);
            let size = header.size as usize;
            if header.color != Color::White {
                let dst = offset - header.shift as usize;
                if dst != offset {
                    self.memory_mut().copy_within(offset..offset + size, dst);
                }
                header.color = Color::White;
                header.shift = 0;
                self.write_header_at(dst, header);
            }
            offset += size;
        }
        self.top = end - free;
        let top = self.top;
        self.memory_mut()[top..end].fill(0);
    }
}
