//! # Renderer
//!
//! Entry point of the submission pipeline. The renderer wires a backend to
//! a [`Device`], a [`RenderQueue`], the render thread and the diagnostic
//! message pump, and exposes the submission API.
//!
//! Components that need the pipeline hold a [`RenderContext`]: a cheap,
//! cloneable handle to the device and the queue. There is no global
//! renderer instance.
//!
//! ## Frame loop
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use render_pipeline::prelude::*;
//! # fn main() -> RenderResult<()> {
//! let mut renderer = Renderer::new(RendererConfig::default(), Arc::new(HeadlessBackend::new()))?;
//! for _ in 0..3 {
//!     renderer.begin_frame();
//!     renderer.submit(|| { /* runs on the render thread */ });
//!     renderer.end_frame()?;
//! }
//! renderer.shutdown()
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::GpuBackend;
use crate::core::config::{RendererConfig, ThreadingPolicy};
use crate::device::Device;
use crate::diagnostics::{ErrorHandler, MessageDrain, MessagePump, PumpStats};
use crate::error::{RenderError, RenderResult};
use crate::foundation::logging::TARGET;
use crate::queue::{BoundedCommandBuffer, FrameStats, RenderQueue, RenderThread};

/// Shared handle to the pipeline
///
/// Cloning is cheap; every clone refers to the same device and queue.
#[derive(Clone)]
pub struct RenderContext {
    device: Arc<Device>,
    queue: Arc<RenderQueue>,
    timer_ring_size: usize,
}

impl RenderContext {
    /// The device
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// The render queue
    pub fn queue(&self) -> &Arc<RenderQueue> {
        &self.queue
    }

    /// The backend behind the device
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        self.device.backend()
    }

    /// Ring size used for GPU timers
    pub fn timer_ring_size(&self) -> usize {
        self.timer_ring_size
    }

    /// Queue `command` for the render thread
    pub fn submit<F>(&self, command: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.submit(Box::new(command));
    }

    /// Queue a resource release, delayed by the frames in flight
    pub fn submit_resource_free<F>(&self, command: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.submit_resource_free(Box::new(command));
    }

    /// Whether the caller is the render thread
    pub fn is_on_render_thread(&self) -> bool {
        self.queue.is_on_render_thread()
    }
}

/// The submission pipeline
pub struct Renderer {
    config: RendererConfig,
    context: RenderContext,
    render_thread: Option<RenderThread>,
    pump: MessagePump,
    shut_down: bool,
}

impl Renderer {
    /// Build the pipeline over `backend`
    ///
    /// With [`ThreadingPolicy::SingleThreaded`] the calling thread becomes
    /// the render thread and drains frames inline in [`end_frame`](Self::end_frame).
    pub fn new(config: RendererConfig, backend: Arc<dyn GpuBackend>) -> RenderResult<Self> {
        config.validate().map_err(RenderError::InvalidConfig)?;
        log::info!(
            target: TARGET,
            "Creating renderer: {:?}, {} frames in flight, timer ring {}",
            config.threading,
            config.frames_in_flight,
            config.timer_ring_size
        );

        let messages = Arc::new(MessageDrain::new(Arc::clone(&backend), config.message_filter));
        let errors = Arc::new(ErrorHandler::new(
            Arc::clone(&backend),
            Arc::clone(&messages),
            config.break_on_error,
        ));
        let device = Arc::new(Device::new(backend, errors)?);
        let queue = Arc::new(RenderQueue::new(config.frames_in_flight, config.command_queue_capacity));

        let pump = MessagePump::spawn(messages, Duration::from_millis(config.message_poll_interval_ms))?;

        let render_thread = match config.threading {
            ThreadingPolicy::SingleThreaded => {
                queue.bind_render_thread();
                None
            }
            ThreadingPolicy::MultiThreaded => {
                let init_queue = Arc::clone(&queue);
                let work_queue = Arc::clone(&queue);
                let work_device = Arc::clone(&device);
                Some(RenderThread::spawn(
                    move || init_queue.bind_render_thread(),
                    move |flush| render_work(&work_device, &work_queue, flush),
                )?)
            }
        };

        Ok(Self {
            context: RenderContext {
                device,
                queue,
                timer_ring_size: config.timer_ring_size,
            },
            config,
            render_thread,
            pump,
            shut_down: false,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Shared handle for components
    pub fn context(&self) -> RenderContext {
        self.context.clone()
    }

    /// The device
    pub fn device(&self) -> &Arc<Device> {
        &self.context.device
    }

    /// Queue `command` for the render thread. Returns immediately.
    pub fn submit<F>(&self, command: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.context.submit(command);
    }

    /// Queue a resource release, run no earlier than `frames_in_flight`
    /// frames after the current one
    pub fn submit_resource_free<F>(&self, command: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.context.submit_resource_free(command);
    }

    /// Queue a whole fixed-budget batch as one command
    pub fn submit_batch(&self, mut batch: BoundedCommandBuffer) {
        self.submit(move || batch.execute());
    }

    /// Whether the caller is the render thread
    pub fn is_on_render_thread(&self) -> bool {
        self.context.is_on_render_thread()
    }

    /// Queue the start-of-frame work
    pub fn begin_frame(&self) {
        let device = Arc::clone(&self.context.device);
        self.submit(move || {
            if let Err(err) = device.begin_frame() {
                log::trace!(target: TARGET, "Frame begin skipped: {}", err);
            }
        });
    }

    /// Queue the end-of-frame work and hand the frame to the render thread.
    ///
    /// Frees submitted after this call belong to the next frame, even while
    /// the render thread is still draining this one. In multi-threaded mode
    /// this waits for the previous frame to finish draining, keeping the
    /// producer at most one frame ahead.
    pub fn end_frame(&self) -> RenderResult<()> {
        if self.shut_down {
            return Err(RenderError::ShutDown);
        }

        let device = Arc::clone(&self.context.device);
        self.submit(move || {
            if let Err(err) = device.end_frame() {
                log::trace!(target: TARGET, "Frame end skipped: {}", err);
            }
        });
        self.context.queue.end_assembly();

        match &self.render_thread {
            Some(render_thread) => render_thread.kick(false)?,
            None => {
                self.context.queue.drain_frame();
            }
        }

        self.check_device()
    }

    /// Block until every pending command and every resource free has run
    pub fn wait_and_render(&self) -> RenderResult<()> {
        match &self.render_thread {
            Some(render_thread) => {
                render_thread.kick(true)?;
                render_thread.wait_until_idle();
            }
            None => render_work(&self.context.device, &self.context.queue, true),
        }
        Ok(())
    }

    /// Statistics of the most recently drained frame
    pub fn last_frame_stats(&self) -> FrameStats {
        self.context.queue.last_frame_stats()
    }

    /// Message pump counters
    pub fn message_stats(&self) -> PumpStats {
        self.pump.stats()
    }

    /// Wake the message pump so pending driver messages are logged now
    pub fn flush_messages(&self) {
        self.pump.wake();
    }

    /// GPU timestamp frequency, once known
    pub fn gpu_frequency(&self) -> Option<u64> {
        self.context.device.gpu_frequency()
    }

    fn check_device(&self) -> RenderResult<()> {
        let errors = self.context.device.errors();
        match errors.lost_reason() {
            Some(reason) => Err(RenderError::DeviceLost { reason }),
            None => Ok(()),
        }
    }

    /// Drain everything, stop the render thread and the message pump.
    /// Idempotent; also run on drop.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let drained = self.wait_and_render();
        if let Some(mut render_thread) = self.render_thread.take() {
            render_thread.stop();
        }
        self.context.queue.close();
        self.pump.stop();

        log::info!(target: TARGET, "Renderer shut down");
        drained
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!(target: TARGET, "Renderer shutdown failed: {}", err);
        }
    }
}

fn render_work(device: &Device, queue: &RenderQueue, flush: bool) {
    if !flush {
        queue.drain_frame();
        return;
    }

    let start = Instant::now();
    let mut commands = queue.drain_commands();
    if let Err(err) = device.wait_idle() {
        log::trace!(target: TARGET, "Flushing without GPU idle: {}", err);
    }

    let mut freed = 0;
    loop {
        let frees = queue.flush_frees();
        let more = queue.drain_commands();
        freed += frees;
        commands += more;
        if frees == 0 && more == 0 {
            break;
        }
    }
    queue.record_flush(commands, freed, start.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::error::BackendError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(threading: ThreadingPolicy) -> RendererConfig {
        RendererConfig::new().with_threading(threading).with_break_on_error(false)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Renderer::new(
            RendererConfig::new().with_frames_in_flight(0),
            Arc::new(HeadlessBackend::new()),
        );
        assert!(matches!(result, Err(RenderError::InvalidConfig(_))));
    }

    #[test]
    fn test_single_threaded_drains_inline() {
        let renderer = Renderer::new(config(ThreadingPolicy::SingleThreaded), Arc::new(HeadlessBackend::new())).unwrap();
        assert!(renderer.is_on_render_thread());

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        renderer.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        renderer.begin_frame();
        renderer.end_frame().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // The submitted command plus begin/end frame
        assert_eq!(renderer.last_frame_stats().commands_executed, 3);
        assert_eq!(renderer.last_frame_stats().frame_index, 0);
    }

    #[test]
    fn test_multi_threaded_runs_on_render_thread() {
        let renderer = Renderer::new(config(ThreadingPolicy::MultiThreaded), Arc::new(HeadlessBackend::new())).unwrap();
        assert!(!renderer.is_on_render_thread());

        let context = renderer.context();
        let on_render_thread = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&on_render_thread);
        renderer.submit(move || {
            if context.is_on_render_thread() {
                flag.fetch_add(1, Ordering::SeqCst);
            }
        });

        renderer.end_frame().unwrap();
        renderer.wait_and_render().unwrap();
        assert_eq!(on_render_thread.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_frequency_becomes_known() {
        let renderer = Renderer::new(config(ThreadingPolicy::SingleThreaded), Arc::new(HeadlessBackend::new())).unwrap();
        assert_eq!(renderer.gpu_frequency(), None);

        for _ in 0..2 {
            renderer.begin_frame();
            renderer.end_frame().unwrap();
        }
        assert_eq!(renderer.gpu_frequency(), Some(1_000_000));
    }

    #[test]
    fn test_device_loss_reported_by_end_frame() {
        let backend = Arc::new(HeadlessBackend::new());
        let renderer = Renderer::new(config(ThreadingPolicy::SingleThreaded), backend.clone()).unwrap();

        renderer.begin_frame();
        renderer.end_frame().unwrap();

        backend.remove_device(BackendError::DeviceRemoved("driver update".into()));
        renderer.begin_frame();
        let result = renderer.end_frame();
        match result {
            Err(RenderError::DeviceLost { reason }) => assert!(reason.contains("driver update")),
            other => panic!("expected device loss, got {other:?}"),
        }
    }

    #[test]
    fn test_batch_runs_as_one_command() {
        let renderer = Renderer::new(config(ThreadingPolicy::SingleThreaded), Arc::new(HeadlessBackend::new())).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let mut batch = BoundedCommandBuffer::new(256);
        for _ in 0..4 {
            let c = Arc::clone(&counter);
            batch.push(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        renderer.submit_batch(batch);
        renderer.wait_and_render().unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(renderer.last_frame_stats().commands_executed, 1);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_closes_queue() {
        let backend = Arc::new(HeadlessBackend::new());
        let mut renderer = Renderer::new(config(ThreadingPolicy::MultiThreaded), backend.clone()).unwrap();
        let context = renderer.context();

        let freed = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&freed);
        renderer.submit_resource_free(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        renderer.shutdown().unwrap();
        renderer.shutdown().unwrap();
        assert_eq!(freed.load(Ordering::SeqCst), 1);
        assert!(matches!(renderer.end_frame(), Err(RenderError::ShutDown)));

        // Releases after shutdown run immediately
        let f = Arc::clone(&freed);
        context.submit_resource_free(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(freed.load(Ordering::SeqCst), 2);
    }
}
