extern crate nalgebra as na;
extern crate nalgebra_glm as glm;

mod camera;
mod config;
mod frame_loop;
mod renderer;
mod scene;
mod window;

use std::path::Path;

use anyhow::{bail, Context};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{
    config::RuntimeConfiguration,
    frame_loop::FrameLoop,
    renderer::{
        device::{SoftwareDevice, SoftwareDeviceConfig},
        human_size,
    },
    scene::cornell_box,
    window::HeadlessWindow,
};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

fn capture(device: &SoftwareDevice, path: &Path) -> anyhow::Result<()> {
    let (extent, pixels) = match device.capture_last_present() {
        Some(capture) => capture,
        None => bail!("nothing was presented"),
    };
    image::save_buffer(path, &pixels, extent.width, extent.height, image::ColorType::Rgba8)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(
        path = %path.display(),
        width = extent.width,
        height = extent.height,
        size = %human_size(pixels.len() as u64),
        "captured last frame"
    );
    Ok(())
}

fn run(config: RuntimeConfiguration) -> anyhow::Result<()> {
    let device = SoftwareDevice::new(&SoftwareDeviceConfig {
        extent: config.extent,
        // one spare image so acquiring never waits on a present
        swapchain_images: config.flights + 1,
        ..Default::default()
    })
    .context("failed to create the device")?;

    let (pool, mut scene) = cornell_box(&*device).context("failed to load the scene")?;
    let mut frame_loop = FrameLoop::new(&*device, &config).context("failed to initialize the renderer")?;
    let mut window = HeadlessWindow::new(&config);

    frame_loop
        .run(&*device, &mut window, &mut scene, &pool)
        .context("frame loop failed")?;

    if let Some(ref path) = config.capture {
        capture(&device, path)?;
    }

    let frames = frame_loop.frames();
    let extent = frame_loop.renderer().extent();
    frame_loop.destroy(&*device).context("failed to shut down")?;
    pool.destroy(&*device);

    let stats = device.stats();
    info!(
        frames,
        width = extent.width,
        height = extent.height,
        submissions = stats.submissions,
        executed_submissions = stats.executed_submissions,
        presents = stats.presents,
        fence_waits = stats.fence_waits,
        command_pool_resets = stats.command_pool_resets,
        descriptor_pool_resets = stats.descriptor_pool_resets,
        staged_uploads = stats.staged_uploads,
        barriers = stats.barriers,
        acceleration_structure_builds = stats.acceleration_structure_builds,
        trace_dispatches = stats.trace_dispatches,
        draws = stats.draws,
        live_objects = device.live_objects(),
        "shut down"
    );
    Ok(())
}

fn main() {
    init_tracing();

    let config = RuntimeConfiguration::try_from_args(std::env::args_os()).unwrap_or_else(|err| err.exit());

    if let Err(err) = run(config) {
        error!("{:#}", err);
        std::process::exit(1);
    }
}
