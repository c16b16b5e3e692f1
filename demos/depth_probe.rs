//! Depth probe example
//!
//! Grabs frames from a simulated camera and prints the depth under a few
//! viewport positions while the capture loop runs.
//!
//! Usage:
//!   cargo run --example depth_probe -- [seconds]

use glam::{UVec2, Vec2};
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_capture::{
    CaptureContext, CaptureLoop, MeasureBufferPool, MeasureConfig, SimulatedCamera,
    SimulatedCameraConfig,
};
use strata_core::RateLimiter;
use tracing::{info, warn};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let seconds: f32 = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 3.0,
    };

    let camera = SimulatedCamera::new(SimulatedCameraConfig {
        pace: true,
        ..Default::default()
    });
    let context = CaptureContext::new(camera);
    context.set_retrieve_resolution(UVec2::new(32, 24));

    let mut measures = MeasureBufferPool::new(
        Arc::clone(&context),
        MeasureConfig::default().with_normals(true),
    );
    measures.enable()?;

    let mut capture = CaptureLoop::new(Arc::clone(&context));
    capture.enable()?;

    // Center and two corners of the viewport.
    let viewport = Vec2::new(640.0, 480.0);
    let probes = [viewport / 2.0, Vec2::new(40.0, 40.0), viewport - 40.0];

    let started = Instant::now();
    let mut limiter = RateLimiter::new(4.0);
    while started.elapsed() < Duration::from_secs_f32(seconds) {
        limiter.start();
        for position in probes {
            match measures.depth_at_viewport(position, viewport) {
                Ok(sample) => info!(
                    "Depth at ({:.0}, {:.0}): {:.3} m [frame {}]",
                    position.x, position.y, sample.value, sample.timestamp
                ),
                Err(err) => warn!("No depth at {}: {}", position, err),
            }
        }
        if let Ok(sample) = measures.normal_at(measures.resolution() / 2) {
            info!("Normal at center: {}", sample.value);
        }
        limiter.stop();
        if limiter.can_sleep() {
            std::thread::sleep(limiter.sleep_duration());
        }
    }

    capture.disable();
    measures.disable();

    let stats = context.stats();
    let pool = measures.stats();
    info!(
        "Captured {} frames, refreshed {} snapshots, skipped {} writes",
        stats.frames, pool.refreshed, pool.skipped
    );
    Ok(())
}
