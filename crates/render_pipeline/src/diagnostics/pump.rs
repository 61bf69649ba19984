//! Diagnostic message pump
//!
//! A background thread that periodically drains the backend debug queue into
//! the `log` facade. It runs independently of the render thread: a slow or
//! stalled frame never delays driver diagnostics, and the pump never touches
//! the immediate context.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;

use super::severity::{DebugMessage, Severity, SeverityFilter};
use crate::backend::GpuBackend;
use crate::error::{RenderError, RenderResult};
use crate::foundation::logging::TARGET;

/// Per-severity message counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    forwarded: [u64; 5],
    filtered: [u64; 5],
    /// Number of drain passes performed
    pub drains: u64,
}

impl PumpStats {
    /// Messages of `severity` forwarded to the log
    pub fn forwarded(&self, severity: Severity) -> u64 {
        self.forwarded[severity.index()]
    }

    /// Messages of `severity` dropped by the filter
    pub fn filtered(&self, severity: Severity) -> u64 {
        self.filtered[severity.index()]
    }

    /// Messages forwarded across all severities
    pub fn total_forwarded(&self) -> u64 {
        self.forwarded.iter().sum()
    }
}

/// Drains the backend debug queue into the log
///
/// Shared between the pump thread and the error handler, which flushes
/// synchronously when a backend call fails. Drain passes are serialized so a
/// message is never forwarded twice.
pub struct MessageDrain {
    backend: Arc<dyn GpuBackend>,
    filter: SeverityFilter,
    stats: Mutex<PumpStats>,
}

impl MessageDrain {
    /// Create a drain over `backend`, dropping severities in `filter`
    pub fn new(backend: Arc<dyn GpuBackend>, filter: SeverityFilter) -> Self {
        Self {
            backend,
            filter,
            stats: Mutex::new(PumpStats::default()),
        }
    }

    /// Forward every stored message and clear the backend queue.
    /// Returns the number of messages read.
    pub fn drain(&self) -> usize {
        let mut stats = self.stats.lock();
        stats.drains += 1;

        let count = self.backend.stored_message_count();
        if count == 0 {
            return 0;
        }

        for index in 0..count {
            match self.backend.message(index) {
                Ok(message) if self.filter.denies(message.severity) => {
                    stats.filtered[message.severity.index()] += 1;
                }
                Ok(message) => {
                    forward(&message);
                    stats.forwarded[message.severity.index()] += 1;
                }
                Err(err) => {
                    log::warn!(target: TARGET, "Failed to read debug message {}: {}", index, err);
                }
            }
        }

        self.backend.clear_stored_messages();
        count
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> PumpStats {
        *self.stats.lock()
    }
}

fn forward(message: &DebugMessage) {
    let level = message.severity.log_level();
    if message.severity == Severity::Corruption {
        log::log!(target: TARGET, level, "corruption: [{}] {}", message.id, message.description);
    } else {
        log::log!(target: TARGET, level, "[{}] {}", message.id, message.description);
    }
}

enum PumpSignal {
    Wake,
    Stop,
}

/// Background thread forwarding driver messages to the log
pub struct MessagePump {
    drain: Arc<MessageDrain>,
    signal: Sender<PumpSignal>,
    handle: Option<JoinHandle<()>>,
}

impl MessagePump {
    /// Start the pump thread, draining every `poll_interval` or when woken
    pub fn spawn(drain: Arc<MessageDrain>, poll_interval: Duration) -> RenderResult<Self> {
        let (signal, receiver) = bounded(4);
        let thread_drain = Arc::clone(&drain);

        let handle = thread::Builder::new()
            .name("gpu-message-pump".to_string())
            .spawn(move || pump_loop(&thread_drain, &receiver, poll_interval))
            .map_err(RenderError::ThreadSpawn)?;

        log::debug!(target: TARGET, "Message pump started (poll interval {:?})", poll_interval);

        Ok(Self {
            drain,
            signal,
            handle: Some(handle),
        })
    }

    /// Interrupt the current wait and drain immediately
    pub fn wake(&self) {
        match self.signal.try_send(PumpSignal::Wake) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                log::trace!(target: TARGET, "Message pump woken after it stopped");
            }
        }
    }

    /// Drain on the calling thread
    pub fn flush(&self) -> usize {
        self.drain.drain()
    }

    /// Counters since the pump started
    pub fn stats(&self) -> PumpStats {
        self.drain.stats()
    }

    /// Whether the pump thread is still running
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop the thread and wait for it. Pending messages are drained one last
    /// time before the thread exits. Idempotent.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        // A disconnected channel means the thread already exited
        let _ = self.signal.send(PumpSignal::Stop);
        if handle.join().is_err() {
            log::error!(target: TARGET, "Message pump thread panicked");
        } else {
            log::debug!(target: TARGET, "Message pump stopped");
        }
    }
}

impl Drop for MessagePump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump_loop(drain: &MessageDrain, receiver: &Receiver<PumpSignal>, poll_interval: Duration) {
    loop {
        match receiver.recv_timeout(poll_interval) {
            Ok(PumpSignal::Wake) | Err(RecvTimeoutError::Timeout) => {
                drain.drain();
            }
            Ok(PumpSignal::Stop) | Err(RecvTimeoutError::Disconnected) => {
                drain.drain();
                break;
            }
        }
    }
}
