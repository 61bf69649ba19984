//! Backend abstraction for the submission pipeline
//!
//! This module defines the trait a graphics backend must implement for the
//! pipeline to drive it. The pipeline needs very little from a backend:
//! deferred recording contexts that finish into command lists, one immediate
//! context that executes them, timestamp and disjoint queries, and a debug
//! message queue.
//!
//! All methods take `&self`; a backend is shared between the producer threads
//! (which record into their own deferred contexts) and the render thread
//! (which owns the immediate context). Immediate-context methods are only
//! called while the [`Device`](crate::device::Device) lock is held.

mod handles;
mod headless;

pub use handles::{CommandList, DeferredContext, QueryHandle, ResourceHandle};
pub use headless::{HeadlessBackend, HeadlessSettings};

use std::borrow::Cow;

use crate::diagnostics::DebugMessage;
use crate::error::{BackendError, BackendResult};

/// An opaque unit of recorded GPU work
///
/// The pipeline never inspects commands; it only moves them from a deferred
/// context into a command list and onto the immediate context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuCommand {
    /// Human-readable name, used in logs and debug markers
    pub label: Cow<'static, str>,
    /// Backend-specific encoded arguments
    pub payload: Vec<u8>,
}

impl GpuCommand {
    /// Create a command with no payload
    pub fn new(label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            label: label.into(),
            payload: Vec::new(),
        }
    }

    /// Attach encoded arguments
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// Which context a query operation is issued on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextTarget {
    /// The immediate context owned by the render thread
    Immediate,
    /// A deferred recording context
    Deferred(DeferredContext),
}

/// Kind of GPU query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Writes the GPU clock when the query is ended
    Timestamp,
    /// Brackets a frame and reports the clock frequency and whether the
    /// timeline was disjoint
    TimestampDisjoint,
}

/// Result of a non-blocking query read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryData {
    /// The GPU has not resolved the query yet
    NotReady,
    /// GPU clock value in ticks
    Timestamp(u64),
    /// Clock frequency for the bracketed interval
    Disjoint {
        /// Ticks per second
        frequency: u64,
        /// Whether the clock changed during the interval (frequency unusable)
        disjoint: bool,
    },
}

/// Access mode when mapping a resource on the immediate context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// CPU reads only
    Read,
    /// CPU writes; previous content preserved
    Write,
    /// CPU reads and writes
    ReadWrite,
    /// CPU writes; previous content may be discarded
    WriteDiscard,
}

/// Downward interface the pipeline drives
pub trait GpuBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    // === Deferred recording ===

    /// Create a new deferred recording context
    fn create_deferred_context(&self) -> BackendResult<DeferredContext>;

    /// Destroy a deferred context
    fn destroy_deferred_context(&self, context: DeferredContext);

    /// Append a command to a deferred context
    fn record(&self, context: DeferredContext, command: GpuCommand) -> BackendResult<()>;

    /// Finish the recorded commands into an immutable command list.
    /// The context is left empty and ready to record again.
    fn finish_command_list(&self, context: DeferredContext) -> BackendResult<CommandList>;

    /// Release a command list
    fn release_command_list(&self, list: CommandList);

    /// Reset a deferred context's pipeline state and discard unfinished commands
    fn clear_state(&self, context: DeferredContext);

    // === Immediate context (Device lock held) ===

    /// Execute a finished command list on the immediate context
    fn execute_command_list(&self, list: CommandList) -> BackendResult<()>;

    /// Map a subresource and return a CPU copy of its bytes
    fn map(&self, resource: ResourceHandle, subresource: u32, mode: MapMode) -> BackendResult<Vec<u8>>;

    /// Unmap a subresource, writing back `data`
    fn unmap(&self, resource: ResourceHandle, subresource: u32, data: Vec<u8>) -> BackendResult<()>;

    /// Overwrite a subresource with `data`
    fn update_subresource(&self, resource: ResourceHandle, subresource: u32, data: &[u8]) -> BackendResult<()>;

    /// Copy one subresource into another
    fn copy_subresource(
        &self,
        destination: ResourceHandle,
        destination_subresource: u32,
        source: ResourceHandle,
        source_subresource: u32,
    ) -> BackendResult<()>;

    /// Submit all queued immediate work; called once at the end of every frame
    fn flush(&self) -> BackendResult<()>;

    /// Block until the GPU has finished all submitted work
    fn wait_idle(&self) -> BackendResult<()>;

    // === Resources ===

    /// Create a GPU buffer of `size` bytes
    fn create_buffer(&self, size: usize) -> BackendResult<ResourceHandle>;

    /// Release a resource
    fn release_resource(&self, resource: ResourceHandle);

    // === Queries ===

    /// Create a query object
    fn create_query(&self, kind: QueryKind) -> BackendResult<QueryHandle>;

    /// Release a query object
    fn release_query(&self, query: QueryHandle);

    /// Begin a query (only meaningful for disjoint queries)
    fn begin_query(&self, target: ContextTarget, query: QueryHandle) -> BackendResult<()>;

    /// End a query; timestamps are written here
    fn end_query(&self, target: ContextTarget, query: QueryHandle) -> BackendResult<()>;

    /// Read a query without blocking
    fn query_data(&self, query: QueryHandle) -> BackendResult<QueryData>;

    // === Debug message queue ===

    /// Number of messages stored in the debug queue
    fn stored_message_count(&self) -> usize;

    /// Retrieve a stored message
    fn message(&self, index: usize) -> BackendResult<DebugMessage>;

    /// Drop all stored messages
    fn clear_stored_messages(&self);

    /// Why the device was removed, if it was
    fn device_removed_reason(&self) -> Option<BackendError>;
}
