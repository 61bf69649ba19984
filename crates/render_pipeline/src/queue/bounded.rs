//! Fixed-budget command buffer
//!
//! A batch of render commands with a byte budget decided up front. Every
//! entry is charged a header plus the size of the closure's captures.
//! Overflowing the budget is a capacity-planning bug and panics instead of
//! reallocating or truncating.

use std::mem;

use super::RenderCommand;

/// Bytes charged per entry on top of its captures
pub const ENTRY_HEADER_SIZE: usize = mem::size_of::<fn()>() + mem::size_of::<u32>();

/// Byte-budgeted list of render commands
pub struct BoundedCommandBuffer {
    capacity: usize,
    used: usize,
    commands: Vec<RenderCommand>,
}

impl BoundedCommandBuffer {
    /// Create a buffer with a budget of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            commands: Vec::new(),
        }
    }

    /// Bytes `F` would be charged
    pub fn entry_size<F>() -> usize {
        ENTRY_HEADER_SIZE + mem::size_of::<F>()
    }

    /// Append a command
    ///
    /// # Panics
    ///
    /// If the entry does not fit in the remaining budget.
    pub fn push<F>(&mut self, command: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let size = Self::entry_size::<F>();
        assert!(
            size <= self.remaining(),
            "bounded command buffer too small: need {} bytes, {} of {} left",
            size,
            self.remaining(),
            self.capacity
        );
        self.used += size;
        self.commands.push(Box::new(command));
    }

    /// Run every command in order and reset the budget
    pub fn execute(&mut self) {
        for command in self.commands.drain(..) {
            command();
        }
        self.used = 0;
    }

    /// Total budget in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes charged so far
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes left
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether no command is queued
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
