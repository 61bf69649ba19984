//! GPU clock frequency tracking
//!
//! One disjoint query brackets each frame on the immediate context. Its
//! result is polled without blocking at the end of every frame; a new query
//! is only issued once the previous one resolved. A disjoint interval
//! invalidates the frequency until the next clean sample arrives.

use parking_lot::Mutex;

use crate::backend::{ContextTarget, GpuBackend, QueryData, QueryHandle, QueryKind};
use crate::error::BackendResult;
use crate::foundation::logging::TARGET;

#[derive(Debug, Default)]
struct FrequencyState {
    issue_next: bool,
    active: bool,
    frequency: u64,
    valid: bool,
}

/// Tracks the GPU timestamp frequency
pub struct FrequencyTracker {
    query: QueryHandle,
    state: Mutex<FrequencyState>,
}

impl FrequencyTracker {
    pub(crate) fn new(backend: &dyn GpuBackend) -> BackendResult<Self> {
        let query = backend.create_query(QueryKind::TimestampDisjoint)?;
        Ok(Self {
            query,
            state: Mutex::new(FrequencyState {
                issue_next: true,
                ..FrequencyState::default()
            }),
        })
    }

    /// Begin the frame's query if no earlier query is outstanding.
    /// Caller holds the immediate-context lock.
    pub(crate) fn begin(&self, backend: &dyn GpuBackend) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.issue_next && !state.active {
            backend.begin_query(ContextTarget::Immediate, self.query)?;
            state.active = true;
        }
        Ok(())
    }

    /// End the frame's query and poll the outstanding result.
    /// Caller holds the immediate-context lock.
    pub(crate) fn end(&self, backend: &dyn GpuBackend) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.active {
            backend.end_query(ContextTarget::Immediate, self.query)?;
            state.active = false;
            state.issue_next = false;
        }

        if state.issue_next {
            return Ok(());
        }

        match backend.query_data(self.query)? {
            QueryData::Disjoint { frequency, disjoint } => {
                if disjoint {
                    log::debug!(target: TARGET, "Disjoint GPU timeline; frequency sample discarded");
                }
                state.frequency = frequency;
                state.valid = !disjoint && frequency > 0;
                state.issue_next = true;
            }
            QueryData::NotReady => {}
            QueryData::Timestamp(_) => {
                log::warn!(target: TARGET, "Frequency query returned timestamp data");
                state.issue_next = true;
            }
        }
        Ok(())
    }

    /// Ticks per second, or `None` while no clean sample is available
    pub fn frequency(&self) -> Option<u64> {
        let state = self.state.lock();
        state.valid.then_some(state.frequency)
    }

    pub(crate) fn query(&self) -> QueryHandle {
        self.query
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    fn frame(tracker: &FrequencyTracker, backend: &HeadlessBackend) {
        tracker.begin(backend).unwrap();
        tracker.end(backend).unwrap();
        backend.flush().unwrap();
    }

    #[test]
    fn test_frequency_resolves_one_frame_later() {
        let backend = HeadlessBackend::new();
        let tracker = FrequencyTracker::new(&backend).unwrap();
        assert_eq!(tracker.frequency(), None);

        frame(&tracker, &backend);
        assert_eq!(tracker.frequency(), None);

        frame(&tracker, &backend);
        assert_eq!(tracker.frequency(), Some(1_000_000));
    }

    #[test]
    fn test_no_new_query_while_outstanding() {
        let backend = HeadlessBackend::new();
        backend.set_queries_stalled(true);
        let tracker = FrequencyTracker::new(&backend).unwrap();

        for _ in 0..4 {
            frame(&tracker, &backend);
        }
        assert_eq!(tracker.frequency(), None);
        assert!(!tracker.state.lock().issue_next);

        backend.set_queries_stalled(false);
        frame(&tracker, &backend);
        assert_eq!(tracker.frequency(), Some(1_000_000));
    }

    #[test]
    fn test_disjoint_sample_invalidates_frequency() {
        let backend = HeadlessBackend::new();
        let tracker = FrequencyTracker::new(&backend).unwrap();
        frame(&tracker, &backend);
        frame(&tracker, &backend);
        assert!(tracker.frequency().is_some());

        // The query issued during the last frame resolves as disjoint
        backend.inject_disjoint();
        frame(&tracker, &backend);
        frame(&tracker, &backend);
        assert_eq!(tracker.frequency(), None);

        frame(&tracker, &backend);
        frame(&tracker, &backend);
        assert_eq!(tracker.frequency(), Some(1_000_000));
    }
}
