//! # Render Queue
//!
//! Double-buffered FIFO of render commands plus the deferred resource-free
//! queue.
//!
//! Producers append to the pending half under a short lock. Once per frame
//! the render thread swaps the halves and runs the now-active half in
//! submission order, so producers never wait on a drain in progress.
//!
//! Resource frees are tagged with the frame being assembled when they were
//! submitted. A free tagged `F` runs during the drain of frame
//! `F + frames_in_flight` or later, once the GPU can no longer be reading
//! the resource.
//!
//! Two counters track frames. The assembly counter moves on the producer
//! side when a frame is handed off ([`RenderQueue::end_assembly`]); the
//! drain counter moves on the render thread. A slow drain therefore never
//! lets a free from the next frame inherit the tag of the frame being
//! drained.

mod bounded;
mod render_thread;

pub use bounded::BoundedCommandBuffer;
pub use render_thread::RenderThread;

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::foundation::logging::TARGET;

/// A type-erased unit of work executed on the render thread
pub type RenderCommand = Box<dyn FnOnce() + Send + 'static>;

/// Statistics for one drained frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Index of the drained frame
    pub frame_index: u64,
    /// Render commands executed
    pub commands_executed: usize,
    /// Resource frees executed
    pub resources_freed: usize,
    /// Resource frees still waiting for their frame
    pub resources_pending: usize,
    /// CPU time spent draining
    pub cpu_time: Duration,
}

struct FreeEntry {
    frame: u64,
    command: RenderCommand,
}

/// Command queue and resource-free queue
pub struct RenderQueue {
    pending: Mutex<Vec<RenderCommand>>,
    active: Mutex<Vec<RenderCommand>>,
    frees: Mutex<VecDeque<FreeEntry>>,
    assembling: AtomicU64,
    drained: AtomicU64,
    frames_in_flight: u64,
    render_thread: OnceLock<ThreadId>,
    last_stats: Mutex<FrameStats>,
    closed: AtomicBool,
}

impl RenderQueue {
    /// Create a queue; each half starts with room for `capacity` commands
    pub fn new(frames_in_flight: u32, capacity: usize) -> Self {
        Self {
            pending: Mutex::new(Vec::with_capacity(capacity)),
            active: Mutex::new(Vec::with_capacity(capacity)),
            frees: Mutex::new(VecDeque::new()),
            assembling: AtomicU64::new(0),
            drained: AtomicU64::new(0),
            frames_in_flight: u64::from(frames_in_flight),
            render_thread: OnceLock::new(),
            last_stats: Mutex::new(FrameStats::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Append a command. Never waits for a drain.
    pub fn submit(&self, command: RenderCommand) {
        if self.is_closed() {
            log::warn!(target: TARGET, "Render command submitted after shutdown; dropped");
            return;
        }

        let mut pending = self.pending.lock();
        if pending.len() == pending.capacity() {
            let old = pending.capacity();
            let new = (old + old / 2).max(1);
            log::warn!(target: TARGET, "Resizing render command queue {} -> {}", old, new);
            let len = pending.len();
            pending.reserve_exact(new - len);
        }
        pending.push(command);
    }

    /// Queue a resource release for the current frame + frames in flight.
    /// After shutdown the GPU is idle and the release runs immediately.
    pub fn submit_resource_free(&self, command: RenderCommand) {
        if self.is_closed() {
            command();
            return;
        }

        let frame = self.assembling.load(Ordering::Acquire);
        self.frees.lock().push_back(FreeEntry { frame, command });
    }

    /// Stop accepting work. Later frees run on the caller; later commands
    /// are dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the queue was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record the calling thread as the render thread
    ///
    /// # Panics
    ///
    /// In debug builds, if a different thread was already bound.
    pub fn bind_render_thread(&self) {
        let current = thread::current().id();
        let bound = *self.render_thread.get_or_init(|| current);
        debug_assert_eq!(bound, current, "render queue bound to two different threads");
    }

    /// Whether the caller is the render thread
    pub fn is_on_render_thread(&self) -> bool {
        self.render_thread.get() == Some(&thread::current().id())
    }

    fn assert_render_thread(&self) {
        debug_assert!(
            self.render_thread.get().map_or(true, |id| *id == thread::current().id()),
            "render queue drained off the render thread"
        );
    }

    /// Index of the frame currently being assembled
    pub fn current_frame(&self) -> u64 {
        self.assembling.load(Ordering::Acquire)
    }

    /// Close the frame being assembled and return its index. Work submitted
    /// afterwards belongs to the next frame.
    pub fn end_assembly(&self) -> u64 {
        self.assembling.fetch_add(1, Ordering::AcqRel)
    }

    /// Index of the next frame the render thread will drain
    pub fn drained_frame(&self) -> u64 {
        self.drained.load(Ordering::Acquire)
    }

    /// Frames a free is held back
    pub fn frames_in_flight(&self) -> u64 {
        self.frames_in_flight
    }

    /// Commands waiting for the next drain
    pub fn pending_commands(&self) -> usize {
        self.pending.lock().len()
    }

    /// Frees not executed yet
    pub fn pending_frees(&self) -> usize {
        self.frees.lock().len()
    }

    /// Statistics of the most recent drain
    pub fn last_frame_stats(&self) -> FrameStats {
        *self.last_stats.lock()
    }

    /// Drain one frame: run every pending command in order, then every free
    /// old enough, then advance the drain index. Render thread only.
    ///
    /// A frame drained without an [`end_assembly`](Self::end_assembly) call
    /// closes its own assembly.
    pub fn drain_frame(&self) -> FrameStats {
        self.assert_render_thread();
        let start = Instant::now();
        let frame = self.drained.load(Ordering::Acquire);
        self.assembling.fetch_max(frame + 1, Ordering::AcqRel);

        let commands_executed = self.execute_pending();
        let frames_in_flight = self.frames_in_flight;
        let resources_freed = self.execute_frees(|tag| tag + frames_in_flight <= frame);

        self.drained.store(frame + 1, Ordering::Release);
        self.finish_stats(FrameStats {
            frame_index: frame,
            commands_executed,
            resources_freed,
            resources_pending: 0,
            cpu_time: start.elapsed(),
        })
    }

    /// Run pending commands until none remain, including commands submitted
    /// by the commands themselves. The frame indices are not advanced.
    pub fn drain_commands(&self) -> usize {
        self.assert_render_thread();
        let mut executed = 0;
        loop {
            let count = self.execute_pending();
            if count == 0 {
                return executed;
            }
            executed += count;
        }
    }

    /// Run every queued free regardless of its frame. Only valid once the
    /// GPU is idle.
    pub fn flush_frees(&self) -> usize {
        self.assert_render_thread();
        let mut freed = 0;
        loop {
            let count = self.execute_frees(|_| true);
            if count == 0 {
                return freed;
            }
            freed += count;
        }
    }

    pub(crate) fn record_flush(&self, commands_executed: usize, resources_freed: usize, cpu_time: Duration) {
        self.finish_stats(FrameStats {
            frame_index: self.drained_frame(),
            commands_executed,
            resources_freed,
            resources_pending: 0,
            cpu_time,
        });
    }

    fn finish_stats(&self, mut stats: FrameStats) -> FrameStats {
        stats.resources_pending = self.pending_frees();
        *self.last_stats.lock() = stats;
        log::trace!(
            target: TARGET,
            "Frame {} drained: {} commands, {} frees ({} pending) in {:?}",
            stats.frame_index,
            stats.commands_executed,
            stats.resources_freed,
            stats.resources_pending,
            stats.cpu_time
        );
        stats
    }

    fn execute_pending(&self) -> usize {
        let mut active = self.active.lock();
        mem::swap(&mut *self.pending.lock(), &mut *active);

        let count = active.len();
        for command in active.drain(..) {
            command();
        }
        count
    }

    fn execute_frees(&self, ready: impl Fn(u64) -> bool) -> usize {
        // Frees may submit further frees; run them without holding the lock
        let due: Vec<FreeEntry> = {
            let mut frees = self.frees.lock();
            let mut due = Vec::new();
            while frees.front().is_some_and(|entry| ready(entry.frame)) {
                if let Some(entry) = frees.pop_front() {
                    due.push(entry);
                }
            }
            due
        };

        let count = due.len();
        for entry in due {
            (entry.command)();
        }
        count
    }
}
