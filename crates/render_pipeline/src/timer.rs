//! # GPU Timer
//!
//! Measures GPU-side durations without ever waiting for the GPU.
//!
//! A timer owns a ring of `N` start/end timestamp query pairs. Each
//! measurement writes slot `index`; right after the end timestamp is issued
//! the timer tries to read slot `data_index = index + 1 (mod N)`, which was
//! written a full ring cycle earlier. If either timestamp of that slot has
//! not resolved yet, or the GPU frequency is unknown for the current frame,
//! the previous reading is kept.
//!
//! Timers are only driven from the render thread.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{ContextTarget, QueryData, QueryHandle, QueryKind};
use crate::error::{BackendResult, RenderResult};
use crate::renderer::RenderContext;

#[derive(Debug)]
struct TimerRing {
    starts: Vec<QueryHandle>,
    ends: Vec<QueryHandle>,
    index: usize,
    data_index: usize,
    tick_count: u64,
    frequency: u64,
}

impl TimerRing {
    fn advance(&mut self) {
        let size = self.starts.len();
        self.index = (self.index + 1) % size;
        self.data_index = (self.index + 1) % size;
    }
}

/// Asynchronous GPU duration measurement
pub struct GpuTimer {
    context: RenderContext,
    ring: Mutex<TimerRing>,
}

impl GpuTimer {
    /// Create a timer with the configured ring size
    pub fn new(context: &RenderContext) -> RenderResult<Self> {
        Self::with_ring_size(context, context.timer_ring_size())
    }

    /// Create a timer with `size` query pairs
    ///
    /// # Panics
    ///
    /// If `size` is smaller than 2.
    pub fn with_ring_size(context: &RenderContext, size: usize) -> RenderResult<Self> {
        assert!(size >= 2, "GPU timer ring needs at least two slots");

        let backend = context.backend();
        let mut starts = Vec::with_capacity(size);
        let mut ends = Vec::with_capacity(size);
        let created = (0..size).try_for_each(|_| -> BackendResult<()> {
            starts.push(backend.create_query(QueryKind::Timestamp)?);
            ends.push(backend.create_query(QueryKind::Timestamp)?);
            Ok(())
        });

        if let Err(err) = created {
            for query in starts.into_iter().chain(ends) {
                backend.release_query(query);
            }
            return context.device().errors().check(Err(err));
        }

        Ok(Self {
            context: context.clone(),
            ring: Mutex::new(TimerRing {
                starts,
                ends,
                index: 0,
                data_index: 1,
                tick_count: 0,
                frequency: 0,
            }),
        })
    }

    /// Number of query pairs in the ring
    pub fn ring_size(&self) -> usize {
        self.ring.lock().starts.len()
    }

    /// Issue the start timestamp of the current slot
    pub fn start_query(&self, target: ContextTarget) {
        debug_assert!(self.context.is_on_render_thread(), "GPU timer used off the render thread");
        let ring = self.ring.lock();
        let query = ring.starts[ring.index];
        self.issue(target, query);
    }

    /// Issue the end timestamp of the current slot, read the oldest slot
    /// and advance the ring
    pub fn end_query(&self, target: ContextTarget) {
        debug_assert!(self.context.is_on_render_thread(), "GPU timer used off the render thread");
        let mut ring = self.ring.lock();
        let query = ring.ends[ring.index];
        self.issue(target, query);
        self.update_time(&mut ring);
        ring.advance();
    }

    fn issue(&self, target: ContextTarget, query: QueryHandle) {
        let device = self.context.device();
        let result = match target {
            ContextTarget::Immediate => device.with_immediate(|backend| backend.end_query(target, query)),
            ContextTarget::Deferred(_) => device.backend().end_query(target, query),
        };
        device.errors().report(result);
    }

    fn update_time(&self, ring: &mut TimerRing) {
        let device = self.context.device();
        let Some(frequency) = device.gpu_frequency() else {
            return;
        };

        let start = ring.starts[ring.data_index];
        let end = ring.ends[ring.data_index];
        let read = device.with_immediate(|backend| -> BackendResult<Option<(u64, u64)>> {
            let (QueryData::Timestamp(start), QueryData::Timestamp(end)) =
                (backend.query_data(start)?, backend.query_data(end)?)
            else {
                return Ok(None);
            };
            Ok(Some((start, end)))
        });

        if let Some(Some((start, end))) = device.errors().report(read) {
            ring.tick_count = end.saturating_sub(start);
            ring.frequency = frequency;
        }
    }

    /// Last resolved duration in seconds
    pub fn time(&self) -> f64 {
        let ring = self.ring.lock();
        if ring.frequency == 0 {
            return 0.0;
        }
        ring.tick_count as f64 / ring.frequency as f64
    }

    /// Last resolved duration in milliseconds
    pub fn time_ms(&self) -> f64 {
        self.time() * 1000.0
    }

    /// Last resolved duration in GPU ticks
    pub fn tick_count(&self) -> u64 {
        self.ring.lock().tick_count
    }

    /// Frequency the last duration was measured with
    pub fn frequency(&self) -> u64 {
        self.ring.lock().frequency
    }
}

impl Drop for GpuTimer {
    fn drop(&mut self) {
        let ring = self.ring.get_mut();
        let queries: Vec<QueryHandle> = ring.starts.drain(..).chain(ring.ends.drain(..)).collect();
        let backend = Arc::clone(self.context.backend());
        self.context.submit_resource_free(move || {
            for query in queries {
                backend.release_query(query);
            }
        });
    }
}
