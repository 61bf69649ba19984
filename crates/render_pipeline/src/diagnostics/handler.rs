//! Backend error classification
//!
//! Every failing backend status passes through [`ErrorHandler::handle_error`].
//! Device loss is latched and reported as fatal; anything else flushes the
//! driver's debug messages (which usually explain the failure) and is treated
//! as transient. Nothing is retried.

use std::sync::Arc;

use parking_lot::Mutex;

use super::pump::MessageDrain;
use crate::backend::GpuBackend;
use crate::error::{BackendError, BackendResult, RenderError, RenderResult};
use crate::foundation::logging::TARGET;

/// Outcome of classifying a backend error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// The device is gone; the renderer must be recreated
    Fatal,
    /// The call failed but the device is still usable
    Transient,
}

/// Single classification point for backend failures
pub struct ErrorHandler {
    backend: Arc<dyn GpuBackend>,
    messages: Arc<MessageDrain>,
    break_on_error: bool,
    lost_reason: Mutex<Option<String>>,
}

impl ErrorHandler {
    /// Create a handler flushing messages through `messages`
    pub fn new(backend: Arc<dyn GpuBackend>, messages: Arc<MessageDrain>, break_on_error: bool) -> Self {
        Self {
            backend,
            messages,
            break_on_error,
            lost_reason: Mutex::new(None),
        }
    }

    /// Classify a failed backend call
    ///
    /// # Panics
    ///
    /// In debug builds with break-on-error enabled, a transient error panics
    /// after the driver messages were flushed.
    pub fn handle_error(&self, error: &BackendError) -> ErrorDisposition {
        if error.is_device_lost() {
            let reason = self
                .backend
                .device_removed_reason()
                .unwrap_or_else(|| error.clone())
                .to_string();

            let mut lost = self.lost_reason.lock();
            if lost.is_none() {
                log::error!(target: TARGET, "Device lost: {} (reason: {})", error, reason);
                *lost = Some(reason);
            }
            drop(lost);

            self.messages.drain();
            return ErrorDisposition::Fatal;
        }

        log::error!(target: TARGET, "Backend call failed: {}", error);
        self.messages.drain();

        if self.break_on_error && cfg!(debug_assertions) {
            panic!("break on GPU error: {error}");
        }

        ErrorDisposition::Transient
    }

    /// Classify `result` and convert it into a renderer result
    pub fn check<T>(&self, result: BackendResult<T>) -> RenderResult<T> {
        result.map_err(|error| match self.handle_error(&error) {
            ErrorDisposition::Fatal => RenderError::DeviceLost {
                reason: self.lost_reason().unwrap_or_else(|| error.to_string()),
            },
            ErrorDisposition::Transient => RenderError::Backend(error),
        })
    }

    /// Classify `result`, logging and discarding the error.
    /// Returns `None` when the call failed.
    pub fn report<T>(&self, result: BackendResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.handle_error(&error);
                None
            }
        }
    }

    /// Whether a fatal error has been observed
    pub fn is_lost(&self) -> bool {
        self.lost_reason.lock().is_some()
    }

    /// Reason recorded when the device was lost
    pub fn lost_reason(&self) -> Option<String> {
        self.lost_reason.lock().clone()
    }
}
