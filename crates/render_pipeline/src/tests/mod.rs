//! Cross-module pipeline scenarios

mod gpu_timing;

use std::sync::Arc;

use crate::backend::HeadlessBackend;
use crate::core::config::{RendererConfig, ThreadingPolicy};
use crate::renderer::Renderer;

fn renderer_with(backend: &Arc<HeadlessBackend>, config: RendererConfig) -> Renderer {
    Renderer::new(config.with_break_on_error(false), backend.clone()).expect("create renderer")
}

fn single_threaded(backend: &Arc<HeadlessBackend>) -> Renderer {
    renderer_with(backend, RendererConfig::new().with_threading(ThreadingPolicy::SingleThreaded))
}

fn multi_threaded(backend: &Arc<HeadlessBackend>) -> Renderer {
    renderer_with(backend, RendererConfig::new().with_threading(ThreadingPolicy::MultiThreaded))
}
