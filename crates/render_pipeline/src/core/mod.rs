//! # Core Pipeline Module
//!
//! Shared configuration used by every pipeline component.

pub mod config;

pub use config::{Config, ConfigError, LoggingConfig, RendererConfig, ThreadingPolicy};
