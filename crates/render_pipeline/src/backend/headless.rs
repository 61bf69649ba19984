//! Headless software backend
//!
//! Implements [`GpuBackend`] without a GPU. Commands are "executed" by
//! appending them to a log and advancing a simulated GPU clock; queries
//! resolve a configurable number of flushes after they were issued. The
//! backend keeps enough bookkeeping (release counts, live objects, executed
//! commands) to observe the pipeline from tests and the demo.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use slotmap::SlotMap;

use super::{
    CommandList, ContextTarget, DeferredContext, GpuBackend, GpuCommand, MapMode, QueryData, QueryHandle, QueryKind,
    ResourceHandle,
};
use crate::diagnostics::{DebugMessage, Severity};
use crate::error::{BackendError, BackendResult};

/// Tunables of the simulated GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadlessSettings {
    /// Flushes between issuing a query and its data becoming available
    pub query_latency: u64,
    /// Simulated clock frequency in ticks per second
    pub timestamp_frequency: u64,
    /// Clock ticks consumed by each executed command
    pub ticks_per_command: u64,
}

impl Default for HeadlessSettings {
    fn default() -> Self {
        Self {
            query_latency: 1,
            timestamp_frequency: 1_000_000,
            ticks_per_command: 1_000,
        }
    }
}

#[derive(Debug, Clone)]
enum RecordedOp {
    Command(GpuCommand),
    BeginQuery(QueryHandle),
    EndQuery(QueryHandle),
}

#[derive(Debug)]
struct Query {
    kind: QueryKind,
    issued: Option<IssuedQuery>,
}

#[derive(Debug, Clone, Copy)]
struct IssuedQuery {
    resolve_at: u64,
    timestamp: u64,
    disjoint: bool,
}

#[derive(Default)]
struct State {
    contexts: SlotMap<DeferredContext, Vec<RecordedOp>>,
    lists: SlotMap<CommandList, Vec<RecordedOp>>,
    list_releases: HashMap<CommandList, u32>,
    resources: SlotMap<ResourceHandle, Vec<u8>>,
    mapped: HashSet<(ResourceHandle, u32)>,
    queries: SlotMap<QueryHandle, Query>,
    executed: Vec<GpuCommand>,
    messages: Vec<DebugMessage>,
    removed: Option<BackendError>,
    gpu_clock: u64,
    flushes: u64,
    contexts_created: usize,
    state_clears: usize,
    queries_stalled: bool,
    disjoint_pending: bool,
}

impl State {
    fn check_removed(&self) -> BackendResult<()> {
        match &self.removed {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    fn invalid(&mut self, what: &str) -> BackendError {
        self.messages
            .push(DebugMessage::new(Severity::Error, 1, format!("invalid handle passed to {what}")));
        BackendError::InvalidHandle(what.to_string())
    }

    fn apply(&mut self, op: RecordedOp, settings: &HeadlessSettings) {
        match op {
            RecordedOp::Command(command) => {
                self.gpu_clock += settings.ticks_per_command;
                self.executed.push(command);
            }
            RecordedOp::BeginQuery(_) => {}
            RecordedOp::EndQuery(handle) => {
                let disjoint = std::mem::take(&mut self.disjoint_pending);
                let issued = IssuedQuery {
                    resolve_at: self.flushes + settings.query_latency,
                    timestamp: self.gpu_clock,
                    disjoint,
                };
                if let Some(query) = self.queries.get_mut(handle) {
                    if query.kind == QueryKind::Timestamp {
                        // Only disjoint queries consume an injected disjoint event
                        self.disjoint_pending = disjoint;
                    }
                    query.issued = Some(issued);
                }
            }
        }
    }
}

/// Software backend for tests, tools and the demo
pub struct HeadlessBackend {
    settings: HeadlessSettings,
    state: Mutex<State>,
}

impl HeadlessBackend {
    /// Create a backend with default settings
    pub fn new() -> Self {
        Self::with_settings(HeadlessSettings::default())
    }

    /// Create a backend with custom settings
    pub fn with_settings(settings: HeadlessSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(State::default()),
        }
    }

    /// Simulation settings
    pub fn settings(&self) -> HeadlessSettings {
        self.settings
    }

    /// Append a message to the debug queue
    pub fn push_message(&self, message: DebugMessage) {
        self.state.lock().messages.push(message);
    }

    /// Simulate device removal; every later fallible call fails with `reason`
    pub fn remove_device(&self, reason: BackendError) {
        self.state.lock().removed = Some(reason);
    }

    /// While stalled, every query reads as not ready
    pub fn set_queries_stalled(&self, stalled: bool) {
        self.state.lock().queries_stalled = stalled;
    }

    /// Mark the next ended disjoint query as disjoint
    pub fn inject_disjoint(&self) {
        self.state.lock().disjoint_pending = true;
    }

    /// How many times `list` was released (more than one is a double release)
    pub fn release_count(&self, list: CommandList) -> u32 {
        self.state.lock().list_releases.get(&list).copied().unwrap_or(0)
    }

    /// Total command-list releases
    pub fn total_list_releases(&self) -> u32 {
        self.state.lock().list_releases.values().sum()
    }

    /// Labels of every executed command, in execution order
    pub fn executed_labels(&self) -> Vec<String> {
        self.state
            .lock()
            .executed
            .iter()
            .map(|command| command.label.to_string())
            .collect()
    }

    /// Number of executed commands
    pub fn executed_count(&self) -> usize {
        self.state.lock().executed.len()
    }

    /// Deferred contexts created so far
    pub fn contexts_created(&self) -> usize {
        self.state.lock().contexts_created
    }

    /// Deferred contexts not yet destroyed
    pub fn live_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    /// Command lists not yet released
    pub fn live_command_lists(&self) -> usize {
        self.state.lock().lists.len()
    }

    /// Query objects not yet released
    pub fn live_queries(&self) -> usize {
        self.state.lock().queries.len()
    }

    /// Resources not yet released
    pub fn live_resources(&self) -> usize {
        self.state.lock().resources.len()
    }

    /// Whether `resource` is still alive
    pub fn is_resource_alive(&self, resource: ResourceHandle) -> bool {
        self.state.lock().resources.contains_key(resource)
    }

    /// Current bytes of a resource
    pub fn resource_contents(&self, resource: ResourceHandle) -> Option<Vec<u8>> {
        self.state.lock().resources.get(resource).cloned()
    }

    /// Number of `clear_state` calls
    pub fn state_clears(&self) -> usize {
        self.state.lock().state_clears
    }

    /// Number of end-of-frame flushes
    pub fn flushes(&self) -> u64 {
        self.state.lock().flushes
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn create_deferred_context(&self) -> BackendResult<DeferredContext> {
        let mut state = self.state.lock();
        state.check_removed()?;
        state.contexts_created += 1;
        Ok(state.contexts.insert(Vec::new()))
    }

    fn destroy_deferred_context(&self, context: DeferredContext) {
        let mut state = self.state.lock();
        if state.contexts.remove(context).is_none() {
            state.invalid("destroy_deferred_context");
        }
    }

    fn record(&self, context: DeferredContext, command: GpuCommand) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_removed()?;
        match state.contexts.get_mut(context) {
            Some(ops) => {
                ops.push(RecordedOp::Command(command));
                Ok(())
            }
            None => Err(state.invalid("record")),
        }
    }

    fn finish_command_list(&self, context: DeferredContext) -> BackendResult<CommandList> {
        let mut state = self.state.lock();
        state.check_removed()?;
        let Some(ops) = state.contexts.get_mut(context) else {
            return Err(state.invalid("finish_command_list"));
        };
        let ops = std::mem::take(ops);
        Ok(state.lists.insert(ops))
    }

    fn release_command_list(&self, list: CommandList) {
        let mut state = self.state.lock();
        *state.list_releases.entry(list).or_insert(0) += 1;
        if state.lists.remove(list).is_none() {
            state.invalid("release_command_list");
        }
    }

    fn clear_state(&self, context: DeferredContext) {
        let mut state = self.state.lock();
        state.state_clears += 1;
        match state.contexts.get_mut(context) {
            Some(ops) => ops.clear(),
            None => {
                state.invalid("clear_state");
            }
        }
    }

    fn execute_command_list(&self, list: CommandList) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_removed()?;
        let Some(ops) = state.lists.get(list).cloned() else {
            return Err(state.invalid("execute_command_list"));
        };
        for op in ops {
            state.apply(op, &self.settings);
        }
        Ok(())
    }

    fn map(&self, resource: ResourceHandle, subresource: u32, _mode: MapMode) -> BackendResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.check_removed()?;
        let Some(data) = state.resources.get(resource).cloned() else {
            return Err(state.invalid("map"));
        };
        if !state.mapped.insert((resource, subresource)) {
            state
                .messages
                .push(DebugMessage::new(Severity::Error, 2, "subresource is already mapped"));
            return Err(BackendError::InvalidCall("subresource is already mapped".to_string()));
        }
        Ok(data)
    }

    fn unmap(&self, resource: ResourceHandle, subresource: u32, data: Vec<u8>) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_removed()?;
        if !state.mapped.remove(&(resource, subresource)) {
            return Err(BackendError::InvalidCall("subresource is not mapped".to_string()));
        }
        match state.resources.get_mut(resource) {
            Some(contents) => {
                *contents = data;
                Ok(())
            }
            None => Err(state.invalid("unmap")),
        }
    }

    fn update_subresource(&self, resource: ResourceHandle, _subresource: u32, data: &[u8]) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_removed()?;
        match state.resources.get_mut(resource) {
            Some(contents) => {
                contents.clear();
                contents.extend_from_slice(data);
                Ok(())
            }
            None => Err(state.invalid("update_subresource")),
        }
    }

    fn copy_subresource(
        &self,
        destination: ResourceHandle,
        _destination_subresource: u32,
        source: ResourceHandle,
        _source_subresource: u32,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_removed()?;
        let Some(data) = state.resources.get(source).cloned() else {
            return Err(state.invalid("copy_subresource"));
        };
        match state.resources.get_mut(destination) {
            Some(contents) => {
                *contents = data;
                Ok(())
            }
            None => Err(state.invalid("copy_subresource")),
        }
    }

    fn flush(&self) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_removed()?;
        state.flushes += 1;
        Ok(())
    }

    fn wait_idle(&self) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_removed()?;
        for (_, query) in &mut state.queries {
            if let Some(issued) = &mut query.issued {
                issued.resolve_at = 0;
            }
        }
        Ok(())
    }

    fn create_buffer(&self, size: usize) -> BackendResult<ResourceHandle> {
        let mut state = self.state.lock();
        state.check_removed()?;
        if size == 0 {
            state
                .messages
                .push(DebugMessage::new(Severity::Error, 3, "buffer size must be non-zero"));
            return Err(BackendError::InvalidCall("buffer size must be non-zero".to_string()));
        }
        Ok(state.resources.insert(vec![0; size]))
    }

    fn release_resource(&self, resource: ResourceHandle) {
        let mut state = self.state.lock();
        if state.resources.remove(resource).is_none() {
            state.invalid("release_resource");
        }
    }

    fn create_query(&self, kind: QueryKind) -> BackendResult<QueryHandle> {
        let mut state = self.state.lock();
        state.check_removed()?;
        Ok(state.queries.insert(Query { kind, issued: None }))
    }

    fn release_query(&self, query: QueryHandle) {
        let mut state = self.state.lock();
        if state.queries.remove(query).is_none() {
            state.invalid("release_query");
        }
    }

    fn begin_query(&self, target: ContextTarget, query: QueryHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_removed()?;
        if !state.queries.contains_key(query) {
            return Err(state.invalid("begin_query"));
        }
        match target {
            ContextTarget::Immediate => {
                state.apply(RecordedOp::BeginQuery(query), &self.settings);
                Ok(())
            }
            ContextTarget::Deferred(context) => match state.contexts.get_mut(context) {
                Some(ops) => {
                    ops.push(RecordedOp::BeginQuery(query));
                    Ok(())
                }
                None => Err(state.invalid("begin_query")),
            },
        }
    }

    fn end_query(&self, target: ContextTarget, query: QueryHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check_removed()?;
        if !state.queries.contains_key(query) {
            return Err(state.invalid("end_query"));
        }
        match target {
            ContextTarget::Immediate => {
                state.apply(RecordedOp::EndQuery(query), &self.settings);
                Ok(())
            }
            ContextTarget::Deferred(context) => match state.contexts.get_mut(context) {
                Some(ops) => {
                    ops.push(RecordedOp::EndQuery(query));
                    Ok(())
                }
                None => Err(state.invalid("end_query")),
            },
        }
    }

    fn query_data(&self, query: QueryHandle) -> BackendResult<QueryData> {
        let mut state = self.state.lock();
        state.check_removed()?;
        let Some(entry) = state.queries.get(query) else {
            return Err(state.invalid("query_data"));
        };
        let Some(issued) = entry.issued else {
            return Ok(QueryData::NotReady);
        };
        if state.queries_stalled || state.flushes < issued.resolve_at {
            return Ok(QueryData::NotReady);
        }
        Ok(match entry.kind {
            QueryKind::Timestamp => QueryData::Timestamp(issued.timestamp),
            QueryKind::TimestampDisjoint => QueryData::Disjoint {
                frequency: self.settings.timestamp_frequency,
                disjoint: issued.disjoint,
            },
        })
    }

    fn stored_message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    fn message(&self, index: usize) -> BackendResult<DebugMessage> {
        self.state
            .lock()
            .messages
            .get(index)
            .cloned()
            .ok_or_else(|| BackendError::InvalidCall(format!("no stored message at index {index}")))
    }

    fn clear_stored_messages(&self) {
        self.state.lock().messages.clear();
    }

    fn device_removed_reason(&self) -> Option<BackendError> {
        self.state.lock().removed.clone()
    }
}
