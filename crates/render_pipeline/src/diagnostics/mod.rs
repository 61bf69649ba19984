//! # Diagnostics
//!
//! Driver message severities, the background message pump, and the error
//! classification point every backend failure funnels into.

mod handler;
mod pump;
mod severity;

pub use handler::{ErrorDisposition, ErrorHandler};
pub use pump::{MessageDrain, MessagePump, PumpStats};
pub use severity::{DebugMessage, Severity, SeverityFilter};
