//! Opaque backend object handles
//!
//! Handles are generational slot-map keys: backends keep their objects in
//! arenas and the pipeline only ever holds indices. A stale handle cannot
//! alias a newer object.

use slotmap::new_key_type;

new_key_type! {
    /// A deferred recording context
    pub struct DeferredContext;

    /// A finished, immutable list of recorded commands
    pub struct CommandList;

    /// A timestamp or disjoint query object
    pub struct QueryHandle;

    /// A GPU resource (buffer or texture)
    pub struct ResourceHandle;
}
