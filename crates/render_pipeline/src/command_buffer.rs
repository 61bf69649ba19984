//! # Command Buffer
//!
//! A recordable, executable unit of GPU work. Any thread may create a
//! command buffer and call its methods; every method only queues a render
//! command, and the state transitions happen on the render thread in queue
//! order:
//!
//! ```text
//! Idle --begin--> Recording --end--> Finalized --execute--> Executing --> Idle
//! ```
//!
//! `begin` checks a deferred context out of the render thread's command
//! pool and starts the buffer's GPU timer; `end` stops the timer and
//! finishes the recorded commands into a command list; `execute` runs the
//! list under the device lock, returns the context to the pool and releases
//! the list.
//!
//! Calling the methods out of order is a programming error: it asserts in
//! debug builds and is logged and ignored in release builds.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{CommandList, ContextTarget, DeferredContext, GpuBackend, GpuCommand};
use crate::device::CommandPool;
use crate::error::RenderResult;
use crate::foundation::logging::TARGET;
use crate::renderer::RenderContext;
use crate::timer::GpuTimer;

/// Lifecycle state of a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    /// Not recording; no context held
    Idle,
    /// Commands are being recorded into a deferred context
    Recording,
    /// A command list is ready for execution
    Finalized,
    /// The command list is being submitted
    Executing,
}

struct Inner {
    state: CommandBufferState,
    pool: Option<CommandPool>,
    context: Option<DeferredContext>,
    list: Option<CommandList>,
}

impl Inner {
    fn expect_state(&self, expected: CommandBufferState, operation: &str) -> bool {
        if self.state == expected {
            return true;
        }
        if cfg!(debug_assertions) {
            panic!(
                "command buffer {operation} called in state {:?} (expected {:?})",
                self.state, expected
            );
        }
        log::error!(
            target: TARGET,
            "Command buffer {} ignored in state {:?} (expected {:?})",
            operation,
            self.state,
            expected
        );
        false
    }

    fn recording_context(&self) -> Option<DeferredContext> {
        match (self.state, self.context) {
            (CommandBufferState::Recording, Some(context)) => Some(context),
            _ => None,
        }
    }
}

/// A recordable, executable unit of GPU work
pub struct CommandBuffer {
    context: RenderContext,
    inner: Arc<Mutex<Inner>>,
    timer: Arc<GpuTimer>,
}

impl CommandBuffer {
    /// Create an idle command buffer with its own GPU timer
    pub fn new(context: &RenderContext) -> RenderResult<Self> {
        Ok(Self {
            context: context.clone(),
            inner: Arc::new(Mutex::new(Inner {
                state: CommandBufferState::Idle,
                pool: None,
                context: None,
                list: None,
            })),
            timer: Arc::new(GpuTimer::new(context)?),
        })
    }

    /// State after all commands executed so far on the render thread
    pub fn state(&self) -> CommandBufferState {
        self.inner.lock().state
    }

    /// Queue the transition to `Recording`
    pub fn begin(&self) {
        let inner = Arc::clone(&self.inner);
        let device = Arc::clone(self.context.device());
        let timer = Arc::clone(&self.timer);
        self.context.submit(move || {
            let mut inner = inner.lock();
            if !inner.expect_state(CommandBufferState::Idle, "begin") {
                return;
            }

            let checked_out = device
                .get_or_create_thread_local_command_pool()
                .and_then(|pool| device.allocate_command_buffer(&pool).map(|context| (pool, context)));
            let (pool, context) = match checked_out {
                Ok(checked_out) => checked_out,
                Err(err) => {
                    log::error!(target: TARGET, "Command buffer begin failed: {}", err);
                    return;
                }
            };

            timer.start_query(ContextTarget::Deferred(context));
            inner.pool = Some(pool);
            inner.context = Some(context);
            inner.state = CommandBufferState::Recording;
        });
    }

    /// Queue a command to be recorded
    pub fn record(&self, command: GpuCommand) {
        self.record_with(move |backend, context| {
            let label = command.label.clone();
            if let Err(err) = backend.record(context, command) {
                log::error!(target: TARGET, "Failed to record {}: {}", label, err);
            }
        });
    }

    /// Queue arbitrary recording against the buffer's deferred context
    pub fn record_with<F>(&self, f: F)
    where
        F: FnOnce(&dyn GpuBackend, DeferredContext) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let device = Arc::clone(self.context.device());
        self.context.submit(move || {
            let inner = inner.lock();
            if !inner.expect_state(CommandBufferState::Recording, "record") {
                return;
            }
            if let Some(context) = inner.recording_context() {
                f(device.backend().as_ref(), context);
            }
        });
    }

    /// Queue the transition to `Finalized`
    pub fn end(&self) {
        let inner = Arc::clone(&self.inner);
        let device = Arc::clone(self.context.device());
        let timer = Arc::clone(&self.timer);
        self.context.submit(move || {
            let mut inner = inner.lock();
            if !inner.expect_state(CommandBufferState::Recording, "end") {
                return;
            }
            let Some(context) = inner.context else {
                return;
            };

            timer.end_query(ContextTarget::Deferred(context));
            let Some(list) = device.errors().report(device.backend().finish_command_list(context)) else {
                return;
            };
            if let Some(previous) = inner.list.replace(list) {
                device.backend().release_command_list(previous);
            }
            inner.state = CommandBufferState::Finalized;
        });
    }

    /// Queue execution of the finalized list; returns to `Idle`
    pub fn execute(&self) {
        let inner = Arc::clone(&self.inner);
        let device = Arc::clone(self.context.device());
        self.context.submit(move || {
            let mut inner = inner.lock();
            if !inner.expect_state(CommandBufferState::Finalized, "execute") {
                return;
            }
            let (Some(list), Some(context), Some(pool)) = (inner.list.take(), inner.context.take(), inner.pool.take())
            else {
                log::error!(target: TARGET, "Finalized command buffer holds no command list");
                return;
            };

            inner.state = CommandBufferState::Executing;
            if let Err(err) = device.execute_command_list(list) {
                log::trace!(target: TARGET, "Command list not executed: {}", err);
            }
            device.release_command_buffer(&pool, context);
            device.backend().release_command_list(list);
            inner.state = CommandBufferState::Idle;
        });
    }

    /// Queue a start timestamp for `timer` into the recording context
    pub fn begin_time_query(&self, timer: &Arc<GpuTimer>) {
        let timer = Arc::clone(timer);
        self.record_with(move |_, context| timer.start_query(ContextTarget::Deferred(context)));
    }

    /// Queue an end timestamp for `timer` into the recording context
    pub fn end_time_query(&self, timer: &Arc<GpuTimer>) {
        let timer = Arc::clone(timer);
        self.record_with(move |_, context| timer.end_query(ContextTarget::Deferred(context)));
    }

    /// GPU time of a recent begin/end cycle, in seconds
    pub fn gpu_time(&self) -> f64 {
        self.timer.time()
    }

    /// The buffer's own timer
    pub fn timer(&self) -> &Arc<GpuTimer> {
        &self.timer
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        let inner = Arc::clone(&self.inner);
        let device = Arc::clone(self.context.device());
        self.context.submit_resource_free(move || {
            let mut inner = inner.lock();
            if let (Some(pool), Some(context)) = (inner.pool.take(), inner.context.take()) {
                device.release_command_buffer(&pool, context);
            }
            if let Some(list) = inner.list.take() {
                device.backend().release_command_list(list);
            }
            inner.state = CommandBufferState::Idle;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::core::config::{RendererConfig, ThreadingPolicy};
    use crate::renderer::Renderer;

    fn renderer(backend: &Arc<HeadlessBackend>) -> Renderer {
        let config = RendererConfig::new()
            .with_threading(ThreadingPolicy::SingleThreaded)
            .with_break_on_error(false);
        Renderer::new(config, backend.clone()).unwrap()
    }

    #[test]
    fn test_state_changes_only_on_render_thread_drain() {
        let backend = Arc::new(HeadlessBackend::new());
        let renderer = renderer(&backend);
        let buffer = CommandBuffer::new(&renderer.context()).unwrap();

        buffer.begin();
        assert_eq!(buffer.state(), CommandBufferState::Idle);
        renderer.end_frame().unwrap();
        assert_eq!(buffer.state(), CommandBufferState::Recording);

        buffer.record(GpuCommand::new("draw"));
        buffer.end();
        renderer.end_frame().unwrap();
        assert_eq!(buffer.state(), CommandBufferState::Finalized);
        assert!(backend.executed_labels().is_empty());

        buffer.execute();
        renderer.end_frame().unwrap();
        assert_eq!(buffer.state(), CommandBufferState::Idle);
        assert_eq!(backend.executed_labels(), vec!["draw"]);
    }

    #[test]
    fn test_reuse_across_cycles() {
        let backend = Arc::new(HeadlessBackend::new());
        let renderer = renderer(&backend);
        let buffer = CommandBuffer::new(&renderer.context()).unwrap();

        for i in 0..4 {
            buffer.begin();
            buffer.record(GpuCommand::new(format!("pass {i}")));
            buffer.end();
            buffer.execute();
            renderer.end_frame().unwrap();
            assert_eq!(buffer.state(), CommandBufferState::Idle);
        }

        assert_eq!(backend.executed_count(), 4);
        assert_eq!(backend.total_list_releases(), 4);
        assert_eq!(backend.live_command_lists(), 0);
        // All cycles reused the render thread's primary context
        assert_eq!(backend.contexts_created(), 1);
    }

    #[test]
    fn test_interleaved_buffers_grow_the_pool() {
        let backend = Arc::new(HeadlessBackend::new());
        let renderer = renderer(&backend);
        let first = CommandBuffer::new(&renderer.context()).unwrap();
        let second = CommandBuffer::new(&renderer.context()).unwrap();

        first.begin();
        second.begin();
        second.record(GpuCommand::new("second"));
        first.record(GpuCommand::new("first"));
        first.end();
        second.end();
        // Execution follows queue order, not creation order
        second.execute();
        first.execute();
        renderer.end_frame().unwrap();

        assert_eq!(backend.executed_labels(), vec!["second", "first"]);
        assert_eq!(backend.contexts_created(), 2);
    }

    #[test]
    fn test_gpu_time_from_own_timer() {
        let backend = Arc::new(HeadlessBackend::new());
        let renderer = renderer(&backend);
        let buffer = CommandBuffer::new(&renderer.context()).unwrap();

        for _ in 0..8 {
            renderer.begin_frame();
            buffer.begin();
            buffer.record(GpuCommand::new("a"));
            buffer.record(GpuCommand::new("b"));
            buffer.end();
            buffer.execute();
            renderer.end_frame().unwrap();
        }

        let expected = 2.0 * backend.settings().ticks_per_command as f64 / 1_000_000.0;
        approx::assert_relative_eq!(buffer.gpu_time(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_drop_while_recording_returns_context() {
        let backend = Arc::new(HeadlessBackend::new());
        let renderer = renderer(&backend);
        let pool_owner = renderer.context();

        let buffer = CommandBuffer::new(&pool_owner).unwrap();
        buffer.begin();
        renderer.end_frame().unwrap();
        drop(buffer);
        renderer.wait_and_render().unwrap();

        // The primary context is free again
        let device = pool_owner.device();
        let pool = device.thread_local_command_pool().unwrap();
        let context = device.allocate_command_buffer(&pool).unwrap();
        assert_eq!(context, pool.context());
        device.release_command_buffer(&pool, context);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "command buffer end called in state Idle")]
    fn test_end_without_begin_asserts() {
        let backend = Arc::new(HeadlessBackend::new());
        let renderer = renderer(&backend);
        let buffer = CommandBuffer::new(&renderer.context()).unwrap();

        buffer.end();
        renderer.end_frame().unwrap();
    }
}
