//! Foundation module - low-level utilities shared by the pipeline
//!
//! - Logging setup and the pipeline log target

pub mod logging;
