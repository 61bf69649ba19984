//! Dedicated render thread
//!
//! The thread sleeps until kicked, runs one unit of work (a frame drain or a
//! full flush), and goes back to idle. Producers wait for idle before kicking
//! the next frame, so the CPU is never more than one frame ahead of the
//! render thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{RenderError, RenderResult};
use crate::foundation::logging::TARGET;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Kicked { flush: bool },
    Busy,
    Stopped,
}

struct Shared {
    phase: Mutex<Phase>,
    changed: Condvar,
}

/// Handle to the render thread
pub struct RenderThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl RenderThread {
    /// Spawn the thread. `init` runs once on the new thread before any work;
    /// `work` is called once per kick with whether a full flush was requested.
    pub fn spawn<I, W>(init: I, work: W) -> RenderResult<Self>
    where
        I: FnOnce() + Send + 'static,
        W: FnMut(bool) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            phase: Mutex::new(Phase::Idle),
            changed: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("render".to_string())
            .spawn(move || {
                init();
                run(&thread_shared, work);
            })
            .map_err(RenderError::ThreadSpawn)?;

        log::debug!(target: TARGET, "Render thread started");
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Wait for the previous unit of work, then start the next
    pub fn kick(&self, flush: bool) -> RenderResult<()> {
        let mut phase = self.wait_idle_locked();
        if *phase == Phase::Stopped {
            return Err(RenderError::ShutDown);
        }
        *phase = Phase::Kicked { flush };
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Block until the thread has finished all kicked work
    pub fn wait_until_idle(&self) {
        drop(self.wait_idle_locked());
    }

    /// Whether the thread is still accepting work
    pub fn is_running(&self) -> bool {
        *self.shared.phase.lock() != Phase::Stopped
    }

    fn wait_idle_locked(&self) -> MutexGuard<'_, Phase> {
        let mut phase = self.shared.phase.lock();
        while matches!(*phase, Phase::Kicked { .. } | Phase::Busy) {
            self.shared.changed.wait(&mut phase);
        }
        phase
    }

    /// Finish outstanding work, stop the thread and join it. Idempotent.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        {
            let mut phase = self.wait_idle_locked();
            *phase = Phase::Stopped;
            self.shared.changed.notify_all();
        }

        if handle.join().is_err() {
            log::error!(target: TARGET, "Render thread panicked during shutdown");
        } else {
            log::debug!(target: TARGET, "Render thread stopped");
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared, mut work: impl FnMut(bool)) {
    let mut phase = shared.phase.lock();
    loop {
        match *phase {
            Phase::Kicked { flush } => {
                *phase = Phase::Busy;
                let outcome = MutexGuard::unlocked(&mut phase, || panic::catch_unwind(AssertUnwindSafe(|| work(flush))));
                if outcome.is_err() {
                    log::error!(target: TARGET, "Render thread panicked; no further frames will be drained");
                    *phase = Phase::Stopped;
                    shared.changed.notify_all();
                    return;
                }
                *phase = Phase::Idle;
                shared.changed.notify_all();
            }
            Phase::Stopped => return,
            Phase::Idle | Phase::Busy => shared.changed.wait(&mut phase),
        }
    }
}
