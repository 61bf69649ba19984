//! # Device
//!
//! The device owns the backend's single immediate context and serializes
//! every operation on it behind one coarse lock: command-list execution,
//! resource mapping, updates and copies, and the per-frame frequency query.
//!
//! It also owns the registry of thread-local [`CommandPool`]s. Deferred
//! recording needs no lock; only the finalize + execute step funnels through
//! the immediate-context lock.
//!
//! ## Usage
//!
//! ```no_run
//! # use render_pipeline::backend::GpuCommand;
//! # fn example(device: &render_pipeline::device::Device) -> render_pipeline::RenderResult<()> {
//! let pool = device.get_or_create_thread_local_command_pool()?;
//! let context = device.allocate_command_buffer(&pool)?;
//! device.backend().record(context, GpuCommand::new("blit"))?;
//! device.flush_command_buffer(&pool, context)?;
//! # Ok(())
//! # }
//! ```

mod frequency;
mod pool;

pub use frequency::FrequencyTracker;
pub use pool::{CommandPool, CommandPoolKey};

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use self::pool::PoolRegistry;
use crate::backend::{CommandList, DeferredContext, GpuBackend, MapMode, ResourceHandle};
use crate::diagnostics::ErrorHandler;
use crate::error::{BackendError, RenderError, RenderResult};
use crate::foundation::logging::TARGET;

/// Owner of the immediate context and the command-pool registry
pub struct Device {
    backend: Arc<dyn GpuBackend>,
    errors: Arc<ErrorHandler>,
    immediate: Mutex<()>,
    pools: Mutex<PoolRegistry>,
    frequency: FrequencyTracker,
}

impl Device {
    /// Create a device over `backend`, reporting failures through `errors`
    pub fn new(backend: Arc<dyn GpuBackend>, errors: Arc<ErrorHandler>) -> RenderResult<Self> {
        let frequency = errors.check(FrequencyTracker::new(backend.as_ref()))?;
        log::info!(target: TARGET, "Device created on {} backend", backend.name());

        Ok(Self {
            backend,
            errors,
            immediate: Mutex::new(()),
            pools: Mutex::new(PoolRegistry::default()),
            frequency,
        })
    }

    /// The backend this device drives
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// The error classification point
    pub fn errors(&self) -> &ErrorHandler {
        &self.errors
    }

    /// Whether a fatal backend error has been observed
    pub fn is_lost(&self) -> bool {
        self.errors.is_lost()
    }

    // === Command pools ===

    /// Return the calling thread's pool, creating it on first use
    pub fn get_or_create_thread_local_command_pool(&self) -> RenderResult<CommandPool> {
        let thread = thread::current().id();

        // The registry lock is held across creation so two new threads
        // cannot both miss and register
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.lookup(thread) {
            return Ok(pool);
        }

        let context = self.errors.check(self.backend.create_deferred_context())?;
        let pool = pools.register(thread, context);
        log::debug!(target: TARGET, "Created command pool for thread {:?}", thread);
        Ok(pool)
    }

    /// The calling thread's pool, if one was created
    pub fn thread_local_command_pool(&self) -> Option<CommandPool> {
        self.pools.lock().lookup(thread::current().id())
    }

    /// Number of registered pools
    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Number of deferred contexts owned by `pool`, overflow contexts included
    pub fn pool_size(&self, pool: &CommandPool) -> usize {
        self.pools.lock().entry(pool.key()).map_or(0, |entry| entry.len())
    }

    /// Check out a deferred context from `pool` for recording.
    /// Creates an overflow context when every pooled context is in use.
    pub fn allocate_command_buffer(&self, pool: &CommandPool) -> RenderResult<DeferredContext> {
        debug_assert_eq!(
            thread::current().id(),
            pool.owner(),
            "command pool used from a thread that does not own it"
        );

        let mut pools = self.pools.lock();
        let entry = pools
            .entry_mut(pool.key())
            .ok_or_else(|| RenderError::Backend(BackendError::InvalidHandle("command pool".to_string())))?;

        if let Some(context) = entry.acquire() {
            return Ok(context);
        }

        log::warn!(target: TARGET, "Creating deferred context (pool size: {})", entry.len() + 1);
        let context = self.errors.check(self.backend.create_deferred_context())?;
        entry.push_in_use(context);
        Ok(context)
    }

    /// Return a checked-out context to `pool` without executing it.
    /// Anything recorded is discarded.
    pub fn release_command_buffer(&self, pool: &CommandPool, context: DeferredContext) {
        self.backend.clear_state(context);
        self.return_context(pool, context);
    }

    /// Finish `context` into a command list, execute it under the device
    /// lock, then return the context to `pool`
    pub fn flush_command_buffer(&self, pool: &CommandPool, context: DeferredContext) -> RenderResult<()> {
        let list = match self.errors.check(self.backend.finish_command_list(context)) {
            Ok(list) => list,
            Err(err) => {
                self.release_command_buffer(pool, context);
                return Err(err);
            }
        };

        let executed = self.execute_command_list(list);
        self.backend.release_command_list(list);
        self.backend.clear_state(context);
        self.return_context(pool, context);
        executed
    }

    fn return_context(&self, pool: &CommandPool, context: DeferredContext) {
        let returned = self
            .pools
            .lock()
            .entry_mut(pool.key())
            .is_some_and(|entry| entry.release(context));
        debug_assert!(returned, "deferred context returned to a pool it does not belong to");
        if !returned {
            log::error!(target: TARGET, "Deferred context {:?} does not belong to pool {:?}", context, pool.key());
        }
    }

    // === Immediate context ===

    /// Run `f` with exclusive access to the immediate context
    pub fn with_immediate<R>(&self, f: impl FnOnce(&dyn GpuBackend) -> R) -> R {
        let _guard = self.immediate.lock();
        f(self.backend.as_ref())
    }

    /// Execute a finished command list on the immediate context
    pub fn execute_command_list(&self, list: CommandList) -> RenderResult<()> {
        let result = self.with_immediate(|backend| backend.execute_command_list(list));
        self.errors.check(result)
    }

    /// Map a subresource, hand its bytes to `f`, and unmap it
    pub fn map_memory<R>(
        &self,
        resource: ResourceHandle,
        subresource: u32,
        mode: MapMode,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> RenderResult<R> {
        let _guard = self.immediate.lock();
        let mut data = self.errors.check(self.backend.map(resource, subresource, mode))?;
        let value = f(&mut data);
        self.errors.check(self.backend.unmap(resource, subresource, data))?;
        Ok(value)
    }

    /// Overwrite a subresource
    pub fn update_subresource(&self, resource: ResourceHandle, subresource: u32, data: &[u8]) -> RenderResult<()> {
        let result = self.with_immediate(|backend| backend.update_subresource(resource, subresource, data));
        self.errors.check(result)
    }

    /// Copy one subresource into another
    pub fn copy_subresource(
        &self,
        destination: ResourceHandle,
        destination_subresource: u32,
        source: ResourceHandle,
        source_subresource: u32,
    ) -> RenderResult<()> {
        let result = self.with_immediate(|backend| {
            backend.copy_subresource(destination, destination_subresource, source, source_subresource)
        });
        self.errors.check(result)
    }

    /// Block until the GPU finished all submitted work
    pub fn wait_idle(&self) -> RenderResult<()> {
        let result = self.with_immediate(|backend| backend.wait_idle());
        self.errors.check(result)
    }

    // === Frame boundaries ===

    /// Start-of-frame work on the immediate context
    pub fn begin_frame(&self) -> RenderResult<()> {
        let result = self.with_immediate(|backend| self.frequency.begin(backend));
        self.errors.check(result)
    }

    /// End-of-frame work: resolve the frequency query and submit
    pub fn end_frame(&self) -> RenderResult<()> {
        let result = self.with_immediate(|backend| {
            self.frequency.end(backend)?;
            backend.flush()
        });
        self.errors.check(result)
    }

    /// GPU timestamp frequency, or `None` while no clean sample is available
    pub fn gpu_frequency(&self) -> Option<u64> {
        self.frequency.frequency()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let (contexts, in_use) = self.pools.get_mut().drain();
        if in_use > 0 {
            log::error!(target: TARGET, "Device destroyed with {} deferred contexts in use", in_use);
            if !thread::panicking() {
                debug_assert_eq!(in_use, 0, "device destroyed while deferred contexts are in use");
            }
        }

        for context in contexts {
            self.backend.destroy_deferred_context(context);
        }
        self.backend.release_query(self.frequency.query());
        log::debug!(target: TARGET, "Device destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GpuCommand, HeadlessBackend};
    use crate::diagnostics::{MessageDrain, SeverityFilter};

    fn device() -> (Arc<HeadlessBackend>, Device) {
        let backend = Arc::new(HeadlessBackend::new());
        let drain = Arc::new(MessageDrain::new(backend.clone(), SeverityFilter::empty()));
        let errors = Arc::new(ErrorHandler::new(backend.clone(), drain, false));
        let device = Device::new(backend.clone(), errors).unwrap();
        (backend, device)
    }

    #[test]
    fn test_pool_lookup_is_idempotent() {
        let (backend, device) = device();
        assert!(device.thread_local_command_pool().is_none());

        let first = device.get_or_create_thread_local_command_pool().unwrap();
        for _ in 0..10 {
            assert_eq!(device.get_or_create_thread_local_command_pool().unwrap(), first);
        }
        assert_eq!(device.thread_local_command_pool(), Some(first));
        assert_eq!(device.pool_count(), 1);
        assert_eq!(backend.contexts_created(), 1);
    }

    #[test]
    fn test_distinct_threads_get_distinct_pools() {
        let (_backend, device) = device();
        let device = Arc::new(device);

        let mine = device.get_or_create_thread_local_command_pool().unwrap();
        let other_device = Arc::clone(&device);
        let theirs = thread::spawn(move || other_device.get_or_create_thread_local_command_pool().unwrap())
            .join()
            .unwrap();

        assert_ne!(mine.key(), theirs.key());
        assert_ne!(mine.context(), theirs.context());
        assert_eq!(device.pool_count(), 2);
    }

    #[test]
    fn test_flush_executes_and_returns_context() {
        let (backend, device) = device();
        let pool = device.get_or_create_thread_local_command_pool().unwrap();

        let context = device.allocate_command_buffer(&pool).unwrap();
        assert_eq!(context, pool.context());
        backend.record(context, GpuCommand::new("draw")).unwrap();
        device.flush_command_buffer(&pool, context).unwrap();

        assert_eq!(backend.executed_labels(), vec!["draw"]);
        assert_eq!(backend.total_list_releases(), 1);
        assert_eq!(backend.live_command_lists(), 0);

        // Returned to the pool: the next allocation reuses it
        assert_eq!(device.allocate_command_buffer(&pool).unwrap(), context);
        device.release_command_buffer(&pool, context);
    }

    #[test]
    fn test_pool_grows_when_exhausted() {
        let (backend, device) = device();
        let pool = device.get_or_create_thread_local_command_pool().unwrap();

        let first = device.allocate_command_buffer(&pool).unwrap();
        let second = device.allocate_command_buffer(&pool).unwrap();
        assert_ne!(first, second);
        assert_eq!(device.pool_size(&pool), 2);
        assert_eq!(backend.contexts_created(), 2);

        device.release_command_buffer(&pool, second);
        assert_eq!(device.allocate_command_buffer(&pool).unwrap(), second);
        assert_eq!(backend.contexts_created(), 2);

        device.release_command_buffer(&pool, first);
        device.release_command_buffer(&pool, second);
    }

    #[test]
    fn test_map_memory_writes_back() {
        let (backend, device) = device();
        let buffer = backend.create_buffer(4).unwrap();

        let sum = device
            .map_memory(buffer, 0, MapMode::ReadWrite, |bytes| {
                bytes.copy_from_slice(&[1, 2, 3, 4]);
                bytes.iter().map(|&b| u32::from(b)).sum::<u32>()
            })
            .unwrap();
        assert_eq!(sum, 10);
        assert_eq!(backend.resource_contents(buffer).unwrap(), vec![1, 2, 3, 4]);

        let copy = backend.create_buffer(4).unwrap();
        device.copy_subresource(copy, 0, buffer, 0).unwrap();
        assert_eq!(backend.resource_contents(copy).unwrap(), vec![1, 2, 3, 4]);

        device.update_subresource(copy, 0, &[9, 9]).unwrap();
        assert_eq!(backend.resource_contents(copy).unwrap(), vec![9, 9]);
    }

    #[test]
    fn test_device_loss_surfaces_as_render_error() {
        let (backend, device) = device();
        backend.remove_device(BackendError::DeviceReset);

        let result = device.end_frame();
        assert!(matches!(result, Err(RenderError::DeviceLost { .. })));
        assert!(device.is_lost());
    }

    #[test]
    fn test_drop_destroys_contexts() {
        let (backend, device) = device();
        device.get_or_create_thread_local_command_pool().unwrap();
        assert_eq!(backend.live_contexts(), 1);
        assert_eq!(backend.live_queries(), 1);

        drop(device);
        assert_eq!(backend.live_contexts(), 0);
        assert_eq!(backend.live_queries(), 0);
    }
}
