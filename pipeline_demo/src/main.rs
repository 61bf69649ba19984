//! Submission pipeline demo
//!
//! Drives the pipeline over the headless backend: long-lived producer
//! threads submit render commands and record into their own command pools
//! every frame, a command buffer is replayed every frame, and canary
//! buffers are released through the deferred free queue.
//!
//! Usage: `pipeline_demo [config.toml|config.ron]`

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use render_pipeline::core::ConfigError;
use render_pipeline::foundation::logging;
use render_pipeline::prelude::*;

const FRAMES: u64 = 12;
const PRODUCERS: usize = 3;
const COMMANDS_PER_PRODUCER: usize = 8;

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to spawn producer thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("Producer thread panicked")]
    ProducerPanicked,
}

/// A producer thread fed one frame index per frame
struct Producer {
    frames: Sender<u64>,
    handle: JoinHandle<()>,
}

fn spawn_producers(context: &RenderContext, done: Sender<RenderResult<()>>) -> Result<Vec<Producer>, DemoError> {
    (0..PRODUCERS)
        .map(|producer| {
            let (frames, jobs) = channel::bounded::<u64>(1);
            let context = context.clone();
            let done = done.clone();
            let handle = thread::Builder::new()
                .name(format!("producer-{producer}"))
                .spawn(move || {
                    for frame in jobs {
                        if done.send(produce(&context, producer, frame)).is_err() {
                            break;
                        }
                    }
                })?;
            Ok(Producer { frames, handle })
        })
        .collect()
}

/// Hand `frame` to every producer and wait for all of them
fn run_producers(producers: &[Producer], done: &Receiver<RenderResult<()>>, frame: u64) -> Result<(), DemoError> {
    for producer in producers {
        producer.frames.send(frame).map_err(|_| DemoError::ProducerPanicked)?;
    }
    for _ in producers {
        done.recv().map_err(|_| DemoError::ProducerPanicked)??;
    }
    Ok(())
}

fn join_producers(producers: Vec<Producer>) -> Result<(), DemoError> {
    for Producer { frames, handle } in producers {
        drop(frames);
        handle.join().map_err(|_| DemoError::ProducerPanicked)?;
    }
    Ok(())
}

fn load_config() -> Result<RendererConfig, DemoError> {
    match std::env::args().nth(1) {
        Some(path) => Ok(RendererConfig::load_from_file(&path)?),
        None => Ok(RendererConfig::default()),
    }
}

/// Producer work: record into this thread's pool and flush it
fn produce(context: &RenderContext, producer: usize, frame: u64) -> RenderResult<()> {
    let device = context.device();
    let pool = device.get_or_create_thread_local_command_pool()?;
    let recording = device.allocate_command_buffer(&pool)?;
    for i in 0..COMMANDS_PER_PRODUCER {
        device
            .backend()
            .record(recording, GpuCommand::new(format!("frame {frame} producer {producer} draw {i}")))?;
    }
    device.flush_command_buffer(&pool, recording)?;

    context.submit(move || {
        log::trace!("Producer {} finished frame {}", producer, frame);
    });
    Ok(())
}

fn run(config: RendererConfig) -> Result<(), DemoError> {
    let backend = Arc::new(HeadlessBackend::new());
    let mut renderer = Renderer::new(config, backend.clone())?;
    let context = renderer.context();

    let frame_timer = Arc::new(GpuTimer::new(&context)?);
    let pass_timer = Arc::new(GpuTimer::new(&context)?);
    let scene = CommandBuffer::new(&context)?;

    let (done_tx, done_rx) = channel::unbounded();
    let producers = spawn_producers(&context, done_tx)?;

    for frame in 0..FRAMES {
        renderer.begin_frame();

        let timer = Arc::clone(&frame_timer);
        renderer.submit(move || timer.start_query(ContextTarget::Immediate));

        run_producers(&producers, &done_rx, frame)?;

        scene.begin();
        scene.record(GpuCommand::new(format!("scene setup {frame}")));
        scene.begin_time_query(&pass_timer);
        scene.record(GpuCommand::new(format!("scene pass {frame}")));
        scene.end_time_query(&pass_timer);
        scene.end();
        scene.execute();

        let mut batch = BoundedCommandBuffer::new(512);
        let canary = backend.create_buffer(256)?;
        let releaser = Arc::clone(&backend);
        batch.push(move || log::trace!("Canary {:?} in use", canary));
        renderer.submit_batch(batch);
        renderer.submit_resource_free(move || releaser.release_resource(canary));

        let timer = Arc::clone(&frame_timer);
        renderer.submit(move || timer.end_query(ContextTarget::Immediate));
        renderer.end_frame()?;

        let stats = renderer.last_frame_stats();
        log::info!(
            "Frame {}: {} commands, {} freed, {} pending, cpu {:?}, gpu {:.3} ms, scene {:.3} ms, pass {:.3} ms",
            stats.frame_index,
            stats.commands_executed,
            stats.resources_freed,
            stats.resources_pending,
            stats.cpu_time,
            frame_timer.time_ms(),
            scene.gpu_time() * 1000.0,
            pass_timer.time_ms()
        );
    }

    join_producers(producers)?;
    renderer.wait_and_render()?;
    log::info!(
        "Executed {} GPU commands from {} command pools; {} live buffers; {} driver messages forwarded",
        backend.executed_count(),
        context.device().pool_count(),
        backend.live_resources(),
        renderer.message_stats().total_forwarded()
    );

    drop(scene);
    drop(frame_timer);
    drop(pass_timer);
    renderer.shutdown()?;
    Ok(())
}

fn main() -> Result<(), DemoError> {
    let config = load_config()?;
    logging::init(&config.logging);
    log::info!("Starting pipeline demo");

    run(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producers_reuse_their_pools_across_frames() {
        const TEST_FRAMES: u64 = 4;

        let backend = Arc::new(HeadlessBackend::new());
        let config = RendererConfig::new().with_break_on_error(false);
        let mut renderer = Renderer::new(config, backend.clone()).unwrap();
        let context = renderer.context();

        let (done_tx, done_rx) = channel::unbounded();
        let producers = spawn_producers(&context, done_tx).unwrap();
        for frame in 0..TEST_FRAMES {
            renderer.begin_frame();
            run_producers(&producers, &done_rx, frame).unwrap();
            renderer.end_frame().unwrap();
        }
        join_producers(producers).unwrap();
        renderer.wait_and_render().unwrap();

        assert_eq!(context.device().pool_count(), PRODUCERS);
        assert_eq!(backend.contexts_created(), PRODUCERS);
        assert_eq!(
            backend.executed_count(),
            TEST_FRAMES as usize * PRODUCERS * COMMANDS_PER_PRODUCER
        );
        renderer.shutdown().unwrap();
    }
}
