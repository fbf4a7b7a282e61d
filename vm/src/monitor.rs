//! Object monitors.
//!
//! Lock state lives in a linked list of fixed-size monitor blocks hanging
//! off the VM roots. An entry exists only while its object is locked or
//! has threads blocked on it.

use heap::{Heap, HeapError};
use log::{debug, trace};
use object::{ChunkKind, REF_SIZE, Ref};

use crate::Vm;
use crate::error::Fault;
use crate::handles::SafePointer;
use crate::threading::{Thread, ThreadStatus};

pub const MONITORS_PER_BLOCK: u16 = 4;

const COUNT: u32 = 0;
const NEXT: u32 = 4;
const ENTRIES: u32 = 8;
const ENTRY_SIZE: u32 = 2 * REF_SIZE as u32 + 4;

pub const MONITOR_BLOCK_SIZE: usize = (ENTRIES + ENTRY_SIZE * MONITORS_PER_BLOCK as u32) as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonitorEntry {
    pub object: Ref,
    pub owner: Ref,
    /// Re-entrant lock depth.
    pub count: u16,
    /// Threads blocked trying to enter.
    pub waiting: u16,
}

/// View over a `MonitorBlock` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorBlock(pub Ref);

impl MonitorBlock {
    pub fn count(self, heap: &Heap) -> u16 {
        heap.read_u16(self.0.addr() + COUNT)
    }

    fn set_count(self, heap: &mut Heap, count: u16) {
        heap.write_u16(self.0.addr() + COUNT, count);
    }

    pub fn next(self, heap: &Heap) -> Option<MonitorBlock> {
        heap.read_ref(self.0.addr() + NEXT).non_null().map(MonitorBlock)
    }

    fn set_next(self, heap: &mut Heap, next: Option<MonitorBlock>) {
        heap.write_ref(self.0.addr() + NEXT, next.map_or(Ref::NULL, |b| b.0));
    }

    #[inline]
    fn entry_addr(self, index: u16) -> u32 {
        self.0.addr() + ENTRIES + index as u32 * ENTRY_SIZE
    }

    pub fn entry(self, heap: &Heap, index: u16) -> MonitorEntry {
        let addr = self.entry_addr(index);
        MonitorEntry {
            object: heap.read_ref(addr),
            owner: heap.read_ref(addr + 4),
            count: heap.read_u16(addr + 8),
            waiting: heap.read_u16(addr + 10),
        }
    }

    fn set_entry(self, heap: &mut Heap, index: u16, entry: MonitorEntry) {
        let addr = self.entry_addr(index);
        heap.write_ref(addr, entry.object);
        heap.write_ref(addr + 4, entry.owner);
        heap.write_u16(addr + 8, entry.count);
        heap.write_u16(addr + 10, entry.waiting);
    }

    /// Drop entry `index`, filling the hole with the last entry.
    fn remove(self, heap: &mut Heap, index: u16) {
        let last = self.count(heap) - 1;
        if index != last {
            let moved = self.entry(heap, last);
            self.set_entry(heap, index, moved);
        }
        self.set_entry(heap, last, MonitorEntry::default());
        self.set_count(heap, last);
    }
}

pub(crate) fn mark_root_set(heap: &mut Heap, block: MonitorBlock) {
    heap.mark_black(block.0);
    for i in 0..block.count(heap) {
        let object = block.entry(heap, i).object;
        heap.mark_gray_if_white(object);
    }
}

pub(crate) fn trace(heap: &Heap, block: MonitorBlock, visitor: &mut dyn FnMut(Ref)) {
    if let Some(next) = block.next(heap) {
        visitor(next.0);
    }
    for i in 0..block.count(heap) {
        let entry = block.entry(heap, i);
        visitor(entry.object);
        visitor(entry.owner);
    }
}

/// An owner reclaimed in this cycle leaves its entry unowned with a zero
/// lock depth; [`Vm::release_orphaned_monitors`] settles it afterwards.
pub(crate) fn relocate(heap: &mut Heap, block: MonitorBlock) {
    heap.relocate_slot(block.0.addr() + NEXT);
    for i in 0..block.count(heap) {
        let addr = block.entry_addr(i);
        heap.relocate_slot(addr);
        let owner = heap.updated_ref(heap.read_ref(addr + 4));
        heap.write_ref(addr + 4, owner);
        if owner.is_null() {
            heap.write_u16(addr + 8, 0);
        }
    }
}

impl Vm {
    /// Monitor blocks, most recently created first.
    pub fn monitor_blocks(&self) -> impl Iterator<Item = MonitorBlock> + '_ {
        std::iter::successors(self.roots.monitors.non_null().map(MonitorBlock), move |b| {
            b.next(&self.heap)
        })
    }

    pub fn find_monitor(&self, object: Ref) -> Option<(MonitorBlock, u16)> {
        self.monitor_blocks().find_map(|block| {
            (0..block.count(&self.heap))
                .find(|&i| block.entry(&self.heap, i).object == object)
                .map(|i| (block, i))
        })
    }

    /// Entry for the protected `object`, created if missing. Creating a
    /// block may collect.
    fn monitor_for(&mut self, object: SafePointer) -> Result<(MonitorBlock, u16), HeapError> {
        if let Some(found) = self.find_monitor(self.protected(object)) {
            return Ok(found);
        }
        let free = self
            .monitor_blocks()
            .find(|b| b.count(&self.heap) < MONITORS_PER_BLOCK);
        let block = match free {
            Some(block) => block,
            None => {
                let block = MonitorBlock(self.allocate(MONITOR_BLOCK_SIZE, ChunkKind::MonitorBlock)?);
                let head = self.roots.monitors.non_null().map(MonitorBlock);
                block.set_next(&mut self.heap, head);
                self.roots.monitors = block.0;
                trace!("new monitor block {:?}", block.0);
                block
            }
        };
        let index = block.count(&self.heap);
        let entry = MonitorEntry {
            object: self.protected(object),
            ..Default::default()
        };
        block.set_entry(&mut self.heap, index, entry);
        block.set_count(&mut self.heap, index + 1);
        Ok((block, index))
    }

    fn remove_monitor(&mut self, block: MonitorBlock, index: u16) {
        block.remove(&mut self.heap, index);
        if block.count(&self.heap) > 0 {
            return;
        }
        let next = block.next(&self.heap);
        if self.roots.monitors == block.0 {
            self.roots.monitors = next.map_or(Ref::NULL, |b| b.0);
            return;
        }
        let prev = self
            .monitor_blocks()
            .find(|b| b.next(&self.heap) == Some(block));
        if let Some(prev) = prev {
            prev.set_next(&mut self.heap, next);
        }
    }

    /// Enter `object`'s monitor. Returns `false` when another thread owns
    /// it; `thread` is then `BlockedForMonitor` until the owner exits.
    pub fn monitor_enter(&mut self, thread: Thread, object: Ref) -> Result<bool, Fault> {
        if object.is_null() {
            return Err(Fault::NullPointer);
        }
        let thread_slot = self.protect(thread.0);
        let object_slot = self.protect(object);
        let found = self.monitor_for(object_slot);
        let thread = Thread(self.protected(thread_slot));
        let object = self.protected(object_slot);
        self.release(thread_slot);
        let (block, index) = found?;

        let mut entry = block.entry(&self.heap, index);
        let acquired = if entry.owner.is_null() || entry.owner == thread.0 {
            entry.owner = thread.0;
            entry.count += 1;
            true
        } else {
            entry.waiting += 1;
            self.set_status(thread, ThreadStatus::BlockedForMonitor);
            thread.set_monitor_object(&mut self.heap, object);
            false
        };
        block.set_entry(&mut self.heap, index, entry);
        Ok(acquired)
    }

    /// Leave `object`'s monitor. When the lock depth reaches zero the
    /// monitor passes to the first blocked thread, if any.
    pub fn monitor_exit(&mut self, thread: Thread, object: Ref) -> Result<(), Fault> {
        if object.is_null() {
            return Err(Fault::NullPointer);
        }
        let Some((block, index)) = self.find_monitor(object) else {
            return Err(Fault::IllegalMonitorState);
        };
        let mut entry = block.entry(&self.heap, index);
        if entry.owner != thread.0 {
            return Err(Fault::IllegalMonitorState);
        }

        entry.count -= 1;
        if entry.count == 0 {
            self.release_entry(block, index, entry);
        } else {
            block.set_entry(&mut self.heap, index, entry);
        }
        Ok(())
    }

    /// Pass an unlocked entry to the first thread blocked on its object, or
    /// drop the entry when there is none.
    fn release_entry(&mut self, block: MonitorBlock, index: u16, mut entry: MonitorEntry) {
        entry.owner = Ref::NULL;
        entry.count = 0;
        if entry.waiting > 0 {
            let object = entry.object;
            let blocked = self.threads().find(|t| {
                t.status(&self.heap) == ThreadStatus::BlockedForMonitor
                    && t.monitor_object(&self.heap) == object
            });
            match blocked {
                Some(next) => {
                    entry.owner = next.0;
                    entry.count = 1;
                    entry.waiting -= 1;
                    next.set_monitor_object(&mut self.heap, Ref::NULL);
                    self.set_status(next, ThreadStatus::Runnable);
                }
                // blocked threads were destroyed
                None => entry.waiting = 0,
            }
        }

        if entry.owner.is_null() {
            self.remove_monitor(block, index);
        } else {
            block.set_entry(&mut self.heap, index, entry);
        }
    }

    /// Release every monitor whose owner was reclaimed by a collection.
    pub(crate) fn release_orphaned_monitors(&mut self) {
        loop {
            let orphan = self.monitor_blocks().find_map(|block| {
                (0..block.count(&self.heap))
                    .find(|&i| block.entry(&self.heap, i).owner.is_null())
                    .map(|i| (block, i))
            });
            let Some((block, index)) = orphan else {
                return;
            };
            let entry = block.entry(&self.heap, index);
            debug!("releasing monitor of {:?}, owner reclaimed", entry.object);
            self.release_entry(block, index, entry);
        }
    }

    fn check_owner(&self, thread: Thread, object: Ref) -> Result<(), Fault> {
        if object.is_null() {
            return Err(Fault::NullPointer);
        }
        match self.find_monitor(object) {
            Some((block, index)) if block.entry(&self.heap, index).owner == thread.0 => Ok(()),
            _ => Err(Fault::IllegalMonitorState),
        }
    }

    fn waiters(&self, object: Ref) -> Vec<Thread> {
        self.threads()
            .filter(|t| {
                t.status(&self.heap) == ThreadStatus::WaitingForMonitor
                    && t.monitor_object(&self.heap) == object
            })
            .collect()
    }

    fn wake_waiter(&mut self, waiter: Thread) {
        waiter.set_monitor_object(&mut self.heap, Ref::NULL);
        waiter.set_schedule_time(&mut self.heap, 0);
        self.set_status(waiter, ThreadStatus::Runnable);
    }

    /// Wake one thread waiting on `object`. `thread` must own its monitor.
    pub fn notify(&mut self, thread: Thread, object: Ref) -> Result<bool, Fault> {
        self.check_owner(thread, object)?;
        let Some(&waiter) = self.waiters(object).first() else {
            return Ok(false);
        };
        self.wake_waiter(waiter);
        Ok(true)
    }

    /// Wake every thread waiting on `object`. `thread` must own its monitor.
    pub fn notify_all(&mut self, thread: Thread, object: Ref) -> Result<usize, Fault> {
        self.check_owner(thread, object)?;
        let waiters = self.waiters(object);
        for &waiter in &waiters {
            self.wake_waiter(waiter);
        }
        Ok(waiters.len())
    }
}
