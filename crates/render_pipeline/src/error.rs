//! Error types for the render pipeline
//!
//! GPU errors are not exceptions: backends report a [`BackendError`] status at
//! the call site and the caller funnels it into
//! [`ErrorHandler`](crate::diagnostics::ErrorHandler) for classification.
//! [`RenderError`] is what the public API returns.

use thiserror::Error;

use crate::core::config::ConfigError;

/// Result type for backend calls
pub type BackendResult<T> = Result<T, BackendError>;

/// Result type for renderer-level operations
pub type RenderResult<T> = Result<T, RenderError>;

/// Status codes a graphics backend call can fail with
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The device was physically removed or the driver was upgraded
    #[error("GPU device removed: {0}")]
    DeviceRemoved(String),

    /// The device stopped responding to commands
    #[error("GPU device hung")]
    DeviceHung,

    /// The device was reset by the driver
    #[error("GPU device reset")]
    DeviceReset,

    /// The backend could not allocate memory for the request
    #[error("Out of memory")]
    OutOfMemory,

    /// A handle did not refer to a live backend object
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// A call was made with invalid arguments or in an invalid state
    #[error("Invalid call: {0}")]
    InvalidCall(String),

    /// The backend does not support the requested feature
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Any other driver-reported failure
    #[error("Backend failure: {0}")]
    Internal(String),
}

impl BackendError {
    /// Whether this status means the device is gone and the renderer must be recreated
    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            BackendError::DeviceRemoved(_) | BackendError::DeviceHung | BackendError::DeviceReset
        )
    }
}

/// Renderer-level errors
#[derive(Error, Debug)]
pub enum RenderError {
    /// A backend call failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// The device was lost; the renderer must be torn down and recreated
    #[error("GPU device lost: {reason}")]
    DeviceLost {
        /// Reason reported by the backend
        reason: String,
    },

    /// Loading or saving configuration failed
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Configuration values are out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A pipeline thread could not be spawned
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// The renderer has already been shut down
    #[error("Renderer has been shut down")]
    ShutDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_classification() {
        assert!(BackendError::DeviceRemoved("driver upgrade".into()).is_device_lost());
        assert!(BackendError::DeviceHung.is_device_lost());
        assert!(BackendError::DeviceReset.is_device_lost());

        assert!(!BackendError::OutOfMemory.is_device_lost());
        assert!(!BackendError::InvalidCall("map twice".into()).is_device_lost());
    }

    #[test]
    fn test_backend_error_converts_into_render_error() {
        let err: RenderError = BackendError::OutOfMemory.into();
        assert!(matches!(err, RenderError::Backend(BackendError::OutOfMemory)));
        assert_eq!(err.to_string(), "Backend error: Out of memory");
    }
}
