//! Cooperative threads.
//!
//! A thread is a 28-byte heap chunk:
//!
//! ```text
//! [status u8][priority u8][id u16][frame_stack Ref][next Ref]
//! [monitor_object Ref][runnable Ref][schedule_time i64]
//! ```
//!
//! Nothing here blocks. Every suspension is a status change that an
//! external scheduler observes through [`Thread::status`] and
//! [`Thread::schedule_time`].

use heap::{Heap, HeapError};
use log::{debug, trace};
use object::{ChunkKind, Ref};

use crate::Vm;
use crate::error::Violation;
use crate::frame::{self, Frame};
use crate::metadata::Metadata;

pub const THREAD_SIZE: usize = 28;

const STATUS: u32 = 0;
const PRIORITY: u32 = 1;
const ID: u32 = 2;
const FRAME_STACK: u32 = 4;
const NEXT: u32 = 8;
const MONITOR_OBJECT: u32 = 12;
const RUNNABLE: u32 = 16;
const SCHEDULE_TIME: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadStatus {
    Created = 0,
    Runnable,
    Sleeping,
    /// In `Object.wait`, until notified or timed out.
    WaitingForMonitor,
    /// Trying to enter a monitor owned by another thread.
    BlockedForMonitor,
    Finished,
}

impl ThreadStatus {
    pub const fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Created,
            1 => Self::Runnable,
            2 => Self::Sleeping,
            3 => Self::WaitingForMonitor,
            4 => Self::BlockedForMonitor,
            5 => Self::Finished,
            _ => return None,
        })
    }
}

/// View over a `Thread` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thread(pub Ref);

impl Thread {
    #[inline]
    fn addr(self, offset: u32) -> u32 {
        self.0.addr() + offset
    }

    pub fn status(self, heap: &Heap) -> ThreadStatus {
        ThreadStatus::from_u8(heap.read_u8(self.addr(STATUS)))
            .unwrap_or_else(|| Violation::CorruptChunk(self.0).abort())
    }

    pub fn set_status(self, heap: &mut Heap, status: ThreadStatus) {
        heap.write_u8(self.addr(STATUS), status as u8);
    }

    pub fn is_finished(self, heap: &Heap) -> bool {
        self.status(heap) == ThreadStatus::Finished
    }

    pub fn priority(self, heap: &Heap) -> u8 {
        heap.read_u8(self.addr(PRIORITY))
    }

    pub fn set_priority(self, heap: &mut Heap, priority: u8) {
        heap.write_u8(self.addr(PRIORITY), priority);
    }

    pub fn id(self, heap: &Heap) -> u16 {
        heap.read_u16(self.addr(ID))
    }

    pub fn top_frame(self, heap: &Heap) -> Option<Frame> {
        heap.read_ref(self.addr(FRAME_STACK)).non_null().map(Frame)
    }

    fn set_top_frame(self, heap: &mut Heap, frame: Option<Frame>) {
        heap.write_ref(self.addr(FRAME_STACK), frame.map_or(Ref::NULL, |f| f.0));
    }

    /// Frames on the chain, top first.
    pub fn frames(self, heap: &Heap) -> impl Iterator<Item = Frame> + '_ {
        std::iter::successors(self.top_frame(heap), move |f| f.parent(heap))
    }

    pub fn frame_count(self, heap: &Heap) -> usize {
        self.frames(heap).count()
    }

    /// Scheduler link.
    pub fn next(self, heap: &Heap) -> Option<Thread> {
        heap.read_ref(self.addr(NEXT)).non_null().map(Thread)
    }

    pub fn set_next(self, heap: &mut Heap, next: Option<Thread>) {
        heap.write_ref(self.addr(NEXT), next.map_or(Ref::NULL, |t| t.0));
    }

    pub fn monitor_object(self, heap: &Heap) -> Ref {
        heap.read_ref(self.addr(MONITOR_OBJECT))
    }

    pub fn set_monitor_object(self, heap: &mut Heap, object: Ref) {
        heap.write_ref(self.addr(MONITOR_OBJECT), object);
    }

    pub fn runnable(self, heap: &Heap) -> Ref {
        heap.read_ref(self.addr(RUNNABLE))
    }

    pub fn set_runnable(self, heap: &mut Heap, runnable: Ref) {
        heap.write_ref(self.addr(RUNNABLE), runnable);
    }

    /// Absolute wake time in milliseconds, 0 for none.
    pub fn schedule_time(self, heap: &Heap) -> i64 {
        heap.read_i64(self.addr(SCHEDULE_TIME))
    }

    pub fn set_schedule_time(self, heap: &mut Heap, time: i64) {
        heap.write_i64(self.addr(SCHEDULE_TIME), time);
    }
}

/// A live thread is a black root together with its whole frame chain.
/// Finished threads contribute nothing and are reclaimed once nothing
/// else refers to them.
pub(crate) fn mark_root_set(heap: &mut Heap, metadata: &dyn Metadata, thread: Thread) {
    if thread.is_finished(heap) {
        return;
    }
    heap.mark_black(thread.0);
    heap.mark_gray_if_white(thread.monitor_object(heap));
    heap.mark_gray_if_white(thread.runnable(heap));

    let mut frame = thread.top_frame(heap);
    while let Some(f) = frame {
        frame::mark_root_set(heap, metadata, f);
        frame = f.parent(heap);
    }
}

/// Used when a thread is reached through the heap rather than the thread
/// table. The scheduler link is not followed.
pub(crate) fn trace(heap: &Heap, thread: Thread, visitor: &mut dyn FnMut(Ref)) {
    if let Some(frame) = thread.top_frame(heap) {
        visitor(frame.0);
    }
    visitor(thread.monitor_object(heap));
    visitor(thread.runnable(heap));
}

pub(crate) fn relocate(heap: &mut Heap, thread: Thread) {
    heap.relocate_slot(thread.addr(FRAME_STACK));
    heap.relocate_slot(thread.addr(NEXT));
    heap.relocate_slot(thread.addr(MONITOR_OBJECT));
    heap.relocate_slot(thread.addr(RUNNABLE));
}

impl Vm {
    /// Create a thread in `Created` state with an empty frame chain and
    /// register it in the thread table.
    pub fn create_thread(&mut self) -> Result<Thread, HeapError> {
        let thread = Thread(self.allocate(THREAD_SIZE, ChunkKind::Thread)?);
        let id = self.next_thread_id;
        self.next_thread_id = self.next_thread_id.wrapping_add(1);
        self.heap.write_u16(thread.addr(ID), id);
        self.roots.threads.push(thread.0);
        debug!("created thread {id} at {:?}", thread.0);
        Ok(thread)
    }

    /// Drop `thread` from the thread table and mark it finished. Its chunk
    /// is reclaimed by the next collection that finds it unreachable.
    pub fn destroy_thread(&mut self, thread: Thread) {
        thread.set_status(&mut self.heap, ThreadStatus::Finished);
        self.roots.threads.retain(|&t| t != thread.0);
        if self.roots.current_thread == thread.0 {
            self.roots.current_thread = Ref::NULL;
        }
        debug!("destroyed thread {}", thread.id(&self.heap));
    }

    /// Make `thread` runnable with `runnable` as its entry task.
    pub fn start_thread(&mut self, thread: Thread, runnable: Ref) {
        thread.set_runnable(&mut self.heap, runnable);
        self.set_status(thread, ThreadStatus::Runnable);
    }

    pub fn set_status(&mut self, thread: Thread, status: ThreadStatus) {
        debug!(
            "thread {}: {:?} -> {status:?}",
            thread.id(&self.heap),
            thread.status(&self.heap)
        );
        thread.set_status(&mut self.heap, status);
    }

    /// Thread with `id` in the thread table, at its current address.
    pub fn thread(&self, id: u16) -> Option<Thread> {
        self.threads().find(|t| t.id(&self.heap) == id)
    }

    pub fn threads(&self) -> impl Iterator<Item = Thread> + '_ {
        self.roots.threads.iter().map(|&t| Thread(t))
    }

    pub fn current_thread(&self) -> Option<Thread> {
        self.roots.current_thread.non_null().map(Thread)
    }

    pub fn set_current_thread(&mut self, thread: Option<Thread>) {
        self.roots.current_thread = thread.map_or(Ref::NULL, |t| t.0);
    }

    /// Make `frame` the top of `thread`'s chain.
    pub fn push_frame(&mut self, thread: Thread, frame: Frame) {
        if let Err(violation) = self.probe.check() {
            violation.abort();
        }
        let parent = thread.top_frame(&self.heap);
        frame.set_parent(&mut self.heap, parent);
        thread.set_top_frame(&mut self.heap, Some(frame));
        trace!("thread {}: push {:?}", thread.id(&self.heap), frame.0);
    }

    /// Unlink and return the top frame. A thread whose chain becomes empty
    /// is finished. Aborts on an empty chain.
    pub fn pop_frame(&mut self, thread: Thread) -> Frame {
        let Some(frame) = thread.top_frame(&self.heap) else {
            Violation::EmptyFrameChain.abort();
        };
        let parent = frame.parent(&self.heap);
        thread.set_top_frame(&mut self.heap, parent);
        trace!("thread {}: pop {:?}", thread.id(&self.heap), frame.0);
        if parent.is_none() {
            self.set_status(thread, ThreadStatus::Finished);
        }
        frame
    }

    /// Sleep for `millis` from now.
    pub fn sleep(&mut self, thread: Thread, millis: i64) {
        let wake = self.clock.now_millis() + millis;
        self.set_status(thread, ThreadStatus::Sleeping);
        thread.set_schedule_time(&mut self.heap, wake);
    }

    /// Wait on `object` for `timeout` milliseconds; 0 waits until notified.
    pub fn wait(&mut self, thread: Thread, object: Ref, timeout: i64) {
        let wake = if timeout == 0 {
            0
        } else {
            self.clock.now_millis() + timeout
        };
        self.set_status(thread, ThreadStatus::WaitingForMonitor);
        thread.set_schedule_time(&mut self.heap, wake);
        thread.set_monitor_object(&mut self.heap, object);
    }

    /// Wake sleeping threads and timed waiters whose deadline is at or
    /// before `now`. Returns how many threads woke.
    pub fn poll_timeouts(&mut self, now: i64) -> usize {
        let due: Vec<Thread> = self
            .threads()
            .filter(|&t| {
                let wake = t.schedule_time(&self.heap);
                match t.status(&self.heap) {
                    ThreadStatus::Sleeping => wake <= now,
                    ThreadStatus::WaitingForMonitor => wake != 0 && wake <= now,
                    _ => false,
                }
            })
            .collect();
        for &thread in &due {
            self.set_status(thread, ThreadStatus::Runnable);
            thread.set_schedule_time(&mut self.heap, 0);
            thread.set_monitor_object(&mut self.heap, Ref::NULL);
        }
        due.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestRuntime, method};
    use object::HEADER_SIZE;

    #[test]
    fn new_thread_is_created_and_empty() {
        let mut rt = TestRuntime::with_methods(512, []);
        let thread = rt.vm.create_thread().unwrap();
        let heap = &rt.vm.heap;

        assert_eq!(heap.chunk_kind(thread.0), ChunkKind::Thread);
        assert_eq!(heap.chunk_size(thread.0), THREAD_SIZE);
        assert_eq!(thread.status(heap), ThreadStatus::Created);
        assert_eq!(thread.top_frame(heap), None);
        assert_eq!(thread.priority(heap), 0);
        assert_eq!(thread.schedule_time(heap), 0);
        assert_eq!(thread.monitor_object(heap), Ref::NULL);
        assert_eq!(thread.runnable(heap), Ref::NULL);
        assert_eq!(thread.next(heap), None);
        assert_eq!(rt.vm.thread(0), Some(thread));
    }

    #[test]
    fn thread_ids_are_sequential() {
        let mut rt = TestRuntime::with_methods(512, []);
        let a = rt.vm.create_thread().unwrap();
        let b = rt.vm.create_thread().unwrap();
        assert_eq!(a.id(&rt.vm.heap), 0);
        assert_eq!(b.id(&rt.vm.heap), 1);
        assert_eq!(rt.vm.threads().count(), 2);
    }

    #[test]
    fn frame_stack_discipline() {
        let mut rt = TestRuntime::with_methods(2048, [method(1, 1, 1, 1)]);
        let m = rt.methods[0];
        let thread = rt.vm.create_thread().unwrap();
        rt.vm.start_thread(thread, Ref::NULL);

        let mut pushed = Vec::new();
        for _ in 0..5 {
            let frame = rt.vm.create_frame(m).unwrap();
            rt.vm.push_frame(thread, frame);
            pushed.push(frame);
        }
        assert_eq!(thread.frame_count(&rt.vm.heap), 5);
        assert_eq!(thread.top_frame(&rt.vm.heap), pushed.last().copied());

        for popped in 1..=3 {
            let top = rt.vm.pop_frame(thread);
            assert_eq!(Some(top), pushed.pop());
            assert_eq!(thread.frame_count(&rt.vm.heap), 5 - popped);
            assert_eq!(thread.top_frame(&rt.vm.heap), pushed.last().copied());
        }
        assert_eq!(thread.status(&rt.vm.heap), ThreadStatus::Runnable);

        rt.vm.pop_frame(thread);
        rt.vm.pop_frame(thread);
        assert_eq!(thread.top_frame(&rt.vm.heap), None);
        assert_eq!(thread.status(&rt.vm.heap), ThreadStatus::Finished);
    }

    #[test]
    #[should_panic(expected = "fatal error 1")]
    fn popping_empty_chain_aborts() {
        let mut rt = TestRuntime::with_methods(512, []);
        let thread = rt.vm.create_thread().unwrap();
        rt.vm.pop_frame(thread);
    }

    #[test]
    fn sleep_sets_wake_time() {
        let mut rt = TestRuntime::with_methods(512, []);
        rt.clock.set(5_000);
        let thread = rt.vm.create_thread().unwrap();

        rt.vm.sleep(thread, 1000);

        assert_eq!(thread.status(&rt.vm.heap), ThreadStatus::Sleeping);
        assert_eq!(thread.schedule_time(&rt.vm.heap), 6_000);
    }

    #[test]
    fn wait_records_object_and_deadline() {
        let mut rt = TestRuntime::with_methods(512, []);
        rt.clock.set(100);
        let thread = rt.vm.create_thread().unwrap();
        let obj = rt.vm.new_object(rt.node).unwrap();

        rt.vm.wait(thread, obj.0, 0);
        assert_eq!(thread.status(&rt.vm.heap), ThreadStatus::WaitingForMonitor);
        assert_eq!(thread.schedule_time(&rt.vm.heap), 0);
        assert_eq!(thread.monitor_object(&rt.vm.heap), obj.0);

        rt.vm.wait(thread, obj.0, 250);
        assert_eq!(thread.schedule_time(&rt.vm.heap), 350);
    }

    #[test]
    fn poll_timeouts_wakes_due_threads() {
        let mut rt = TestRuntime::with_methods(1024, []);
        rt.clock.set(0);
        let sleeper = rt.vm.create_thread().unwrap();
        let late = rt.vm.create_thread().unwrap();
        let forever = rt.vm.create_thread().unwrap();
        let timed = rt.vm.create_thread().unwrap();
        let obj = rt.vm.new_object(rt.node).unwrap();
        rt.vm.sleep(sleeper, 10);
        rt.vm.sleep(late, 100);
        rt.vm.wait(forever, obj.0, 0);
        rt.vm.wait(timed, obj.0, 20);

        assert_eq!(rt.vm.poll_timeouts(5), 0);
        assert_eq!(rt.vm.poll_timeouts(20), 2);

        let heap = &rt.vm.heap;
        assert_eq!(sleeper.status(heap), ThreadStatus::Runnable);
        assert_eq!(timed.status(heap), ThreadStatus::Runnable);
        assert_eq!(timed.monitor_object(heap), Ref::NULL);
        assert_eq!(late.status(heap), ThreadStatus::Sleeping);
        assert_eq!(forever.status(heap), ThreadStatus::WaitingForMonitor);
    }

    #[test]
    fn finished_thread_is_reclaimed_lazily() {
        let mut rt = TestRuntime::with_methods(1024, [method(1, 1, 1, 1)]);
        let m = rt.methods[0];
        let done = rt.vm.create_thread().unwrap();
        let alive = rt.vm.create_thread().unwrap();
        rt.vm.start_thread(alive, Ref::NULL);
        let frame = rt.vm.create_frame(m).unwrap();
        rt.vm.push_frame(done, frame);
        rt.vm.pop_frame(done);
        assert!(done.is_finished(&rt.vm.heap));
        // still registered until a collection proves it unreachable
        assert_eq!(rt.vm.threads().count(), 2);

        rt.vm.collect();

        assert_eq!(rt.vm.threads().count(), 1);
        let alive = rt.vm.thread(1).unwrap();
        assert_eq!(alive.status(&rt.vm.heap), ThreadStatus::Runnable);
        assert_eq!(rt.vm.thread(0), None);
        // finished thread and its popped frame are both gone
        assert_eq!(rt.vm.heap.stats.chunks_reclaimed, 2);
    }

    #[test]
    fn finished_thread_kept_while_referenced() {
        let mut rt = TestRuntime::with_methods(1024, []);
        let done = rt.vm.create_thread().unwrap();
        let alive = rt.vm.create_thread().unwrap();
        rt.vm.set_status(done, ThreadStatus::Finished);
        rt.vm.roots.globals.push(done.0);
        alive.set_next(&mut rt.vm.heap, Some(done));

        rt.vm.collect();

        assert_eq!(rt.vm.threads().count(), 2);
        let alive = rt.vm.thread(1).unwrap();
        assert_eq!(alive.next(&rt.vm.heap).map(|t| t.0), Some(rt.vm.roots.globals[0]));
    }

    #[test]
    fn dangling_scheduler_link_becomes_null() {
        let mut rt = TestRuntime::with_methods(1024, []);
        let done = rt.vm.create_thread().unwrap();
        let alive = rt.vm.create_thread().unwrap();
        alive.set_next(&mut rt.vm.heap, Some(done));
        rt.vm.set_status(done, ThreadStatus::Finished);

        rt.vm.collect();

        let alive = rt.vm.thread(1).unwrap();
        assert_eq!(alive.next(&rt.vm.heap), None);
    }

    #[test]
    fn destroyed_thread_leaves_table() {
        let mut rt = TestRuntime::with_methods(512, []);
        let thread = rt.vm.create_thread().unwrap();
        rt.vm.set_current_thread(Some(thread));

        rt.vm.destroy_thread(thread);

        assert_eq!(rt.vm.threads().count(), 0);
        assert_eq!(rt.vm.current_thread(), None);
        rt.vm.collect();
        assert_eq!(rt.vm.heap.used(), 0);
    }

    #[test]
    fn runnable_survives_compaction() {
        let mut rt = TestRuntime::with_methods(1024, []);
        rt.vm.new_int_array(object::ElementType::Int, 8).unwrap();
        let thread = rt.vm.create_thread().unwrap();
        rt.vm.new_int_array(object::ElementType::Int, 8).unwrap();
        let node = rt.vm.metadata.class_or_abort(rt.node).clone();
        let task = rt.vm.new_object(rt.node).unwrap();
        let payload = rt.vm.new_object(rt.node).unwrap();
        task.write_int(&mut rt.vm.heap, &node, 0, 77);
        task.set_field(&mut rt.vm.heap, 0, payload.0);
        rt.vm.start_thread(thread, task.0);

        rt.vm.collect();

        assert_eq!(rt.vm.stats().chunks_reclaimed, 2);
        let heap = &rt.vm.heap;
        let thread = rt.vm.thread(0).unwrap();
        let task = crate::objects::Object(thread.runnable(heap));
        assert_eq!(thread.0.addr(), heap.base() + HEADER_SIZE as u32);
        assert_eq!(task.0.addr(), thread.0.addr() + THREAD_SIZE as u32 + HEADER_SIZE as u32);
        assert_eq!(heap.chunk_kind(task.0), ChunkKind::Object);
        assert_eq!(task.read_int(heap, &node, 0), 77);
        let payload = task.field(heap, 0);
        assert_eq!(heap.chunk_kind(payload), ChunkKind::Object);
        assert_eq!(payload.addr(), task.0.addr() + 24);
    }
}
