//! Thread-local command pools
//!
//! Each thread that records GPU work owns one pool. A pool starts with a
//! single deferred context (its identity) and grows with overflow contexts
//! when every pooled context is checked out. Pools live in an arena owned by
//! the device; callers hold a copyable [`CommandPool`] descriptor.

use std::collections::HashMap;
use std::thread::ThreadId;

use slotmap::{new_key_type, SlotMap};

use crate::backend::DeferredContext;

new_key_type! {
    /// Identifier of a command pool in the device's registry
    pub struct CommandPoolKey;
}

/// Handle to a thread's command pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPool {
    key: CommandPoolKey,
    owner: ThreadId,
    context: DeferredContext,
}

impl CommandPool {
    /// Registry key
    pub fn key(&self) -> CommandPoolKey {
        self.key
    }

    /// Thread this pool belongs to
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// The pool's primary deferred context
    pub fn context(&self) -> DeferredContext {
        self.context
    }
}

#[derive(Debug)]
struct PooledContext {
    context: DeferredContext,
    in_use: bool,
}

#[derive(Debug)]
pub(crate) struct PoolEntry {
    owner: ThreadId,
    contexts: Vec<PooledContext>,
}

impl PoolEntry {
    fn descriptor(&self, key: CommandPoolKey) -> CommandPool {
        CommandPool {
            key,
            owner: self.owner,
            context: self.contexts[0].context,
        }
    }

    /// Check out a free context, if any
    pub(crate) fn acquire(&mut self) -> Option<DeferredContext> {
        let slot = self.contexts.iter_mut().find(|slot| !slot.in_use)?;
        slot.in_use = true;
        Some(slot.context)
    }

    /// Add a freshly created context, already checked out
    pub(crate) fn push_in_use(&mut self, context: DeferredContext) {
        self.contexts.push(PooledContext { context, in_use: true });
    }

    /// Return a context; false if it does not belong to this pool
    pub(crate) fn release(&mut self, context: DeferredContext) -> bool {
        match self.contexts.iter_mut().find(|slot| slot.context == context) {
            Some(slot) => {
                slot.in_use = false;
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.contexts.len()
    }

    pub(crate) fn in_use(&self) -> usize {
        self.contexts.iter().filter(|slot| slot.in_use).count()
    }
}

/// Arena of pools plus the thread lookup
#[derive(Debug, Default)]
pub(crate) struct PoolRegistry {
    pools: SlotMap<CommandPoolKey, PoolEntry>,
    by_thread: HashMap<ThreadId, CommandPoolKey>,
}

impl PoolRegistry {
    pub(crate) fn lookup(&self, thread: ThreadId) -> Option<CommandPool> {
        let key = *self.by_thread.get(&thread)?;
        self.pools.get(key).map(|entry| entry.descriptor(key))
    }

    pub(crate) fn register(&mut self, thread: ThreadId, context: DeferredContext) -> CommandPool {
        let key = self.pools.insert(PoolEntry {
            owner: thread,
            contexts: vec![PooledContext { context, in_use: false }],
        });
        self.by_thread.insert(thread, key);
        self.pools[key].descriptor(key)
    }

    pub(crate) fn entry_mut(&mut self, key: CommandPoolKey) -> Option<&mut PoolEntry> {
        self.pools.get_mut(key)
    }

    pub(crate) fn entry(&self, key: CommandPoolKey) -> Option<&PoolEntry> {
        self.pools.get(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.pools.len()
    }

    /// Remove every pool, yielding all contexts and how many were still checked out
    pub(crate) fn drain(&mut self) -> (Vec<DeferredContext>, usize) {
        self.by_thread.clear();
        let mut contexts = Vec::new();
        let mut in_use = 0;
        for (_, entry) in self.pools.drain() {
            in_use += entry.in_use();
            contexts.extend(entry.contexts.into_iter().map(|slot| slot.context));
        }
        (contexts, in_use)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::KeyData;

    fn context(n: u64) -> DeferredContext {
        DeferredContext::from(KeyData::from_ffi(n | (1 << 32)))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = PoolRegistry::default();
        let thread = std::thread::current().id();
        assert!(registry.lookup(thread).is_none());

        let pool = registry.register(thread, context(1));
        assert_eq!(registry.lookup(thread), Some(pool));
        assert_eq!(pool.context(), context(1));
        assert_eq!(pool.owner(), thread);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_acquire_release_overflow() {
        let mut registry = PoolRegistry::default();
        let pool = registry.register(std::thread::current().id(), context(1));
        let entry = registry.entry_mut(pool.key()).unwrap();

        assert_eq!(entry.acquire(), Some(context(1)));
        assert_eq!(entry.acquire(), None);

        entry.push_in_use(context(2));
        assert_eq!(entry.len(), 2);
        assert_eq!(entry.in_use(), 2);

        assert!(entry.release(context(1)));
        assert!(!entry.release(context(3)));
        assert_eq!(entry.acquire(), Some(context(1)));

        let (contexts, in_use) = registry.drain();
        assert_eq!(contexts.len(), 2);
        assert_eq!(in_use, 2);
        assert_eq!(registry.len(), 0);
    }
}
