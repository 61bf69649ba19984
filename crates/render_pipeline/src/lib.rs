//! # Render Pipeline
//!
//! Render-command submission and execution pipeline: work-producing
//! threads queue closures and record GPU commands, while a single render
//! thread owns the immediate GPU context and executes everything in order.
//!
//! ## Features
//!
//! - **Command Queue**: double-buffered FIFO of render commands, drained once per frame
//! - **Deferred Frees**: resource releases held back by the frames in flight
//! - **Command Pools**: lazily created per-thread deferred recording contexts
//! - **Command Buffers**: recordable units of GPU work with their own GPU timer
//! - **GPU Timers**: non-blocking timestamp measurement over a query ring
//! - **Diagnostics**: background pump forwarding driver messages to `log`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use render_pipeline::prelude::*;
//!
//! fn main() -> RenderResult<()> {
//!     let config = RendererConfig::default();
//!     render_pipeline::foundation::logging::init(&config.logging);
//!
//!     let mut renderer = Renderer::new(config, Arc::new(HeadlessBackend::new()))?;
//!     let buffer = CommandBuffer::new(&renderer.context())?;
//!
//!     renderer.begin_frame();
//!     buffer.begin();
//!     buffer.record(GpuCommand::new("clear"));
//!     buffer.end();
//!     buffer.execute();
//!     renderer.end_frame()?;
//!
//!     renderer.shutdown()
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::cast_precision_loss)]

pub mod backend;
pub mod core;
pub mod device;
pub mod diagnostics;
pub mod foundation;
pub mod queue;

mod command_buffer;
mod error;
mod renderer;
mod timer;

#[cfg(test)]
mod tests;

pub use command_buffer::{CommandBuffer, CommandBufferState};
pub use error::{BackendError, BackendResult, RenderError, RenderResult};
pub use renderer::{RenderContext, Renderer};
pub use timer::GpuTimer;

/// Common imports for pipeline users
pub mod prelude {
    pub use crate::{
        backend::{ContextTarget, GpuBackend, GpuCommand, HeadlessBackend},
        core::{Config, RendererConfig, ThreadingPolicy},
        queue::{BoundedCommandBuffer, FrameStats},
        BackendError, CommandBuffer, GpuTimer, RenderContext, RenderError, RenderResult, Renderer,
    };
}
