//! Drives the renderer one flight at a time: wait for the flight, recycle its resources, acquire a
//! swapchain image, record, submit, present, advance.

use std::time::Instant;

use ash::vk;
use profiling::scope;
use tracing::{debug, info};

#[cfg(feature = "shader_reload")]
use crate::renderer::shader_reload::ShaderReload;
use crate::{
    camera::{CameraInput, FpsCamera},
    config::RuntimeConfiguration,
    renderer::{
        device::{CommandRecorder, Device, DeviceError, Submission},
        flight_ring::FlightRing,
        retirement::RetirementQueue,
        Renderer, RendererError,
    },
    scene::{AssetPool, Scene},
    window::{Window, WindowEvent},
};

pub(crate) struct FrameTiming {
    pub(crate) previous_frame: Instant,
    pub(crate) time_delta: f32,
}

impl Default for FrameTiming {
    fn default() -> FrameTiming {
        FrameTiming {
            previous_frame: Instant::now(),
            time_delta: 0.0,
        }
    }
}

impl FrameTiming {
    fn calculate(&mut self) {
        let now = Instant::now();
        let duration = now - self.previous_frame;
        self.time_delta = duration.as_secs() as f32 + (duration.subsec_micros() as f32 / 1e6);
        self.previous_frame = now;
    }
}

/// What the window asked for since the previous iteration.
#[derive(Default)]
struct PendingRequests {
    close: bool,
    resize: Option<vk::Extent2D>,
    reload_shaders: bool,
}

pub(crate) struct FrameLoop {
    ring: FlightRing,
    retirement: RetirementQueue,
    renderer: Renderer,
    camera: FpsCamera,
    input: CameraInput,
    timing: FrameTiming,
    flight_index: u32,
    frames: u64,
    #[cfg(feature = "shader_reload")]
    shader_reload: Option<ShaderReload>,
}

impl FrameLoop {
    pub(crate) fn new(device: &Device, config: &RuntimeConfiguration) -> Result<FrameLoop, RendererError> {
        let ring = FlightRing::new(device, config.flights)?;
        let renderer = match Renderer::new(device, config, device.swapchain_extent()) {
            Ok(renderer) => renderer,
            Err(err) => {
                ring.destroy(device);
                return Err(err);
            }
        };

        #[cfg(feature = "shader_reload")]
        let shader_reload = match ShaderReload::new(&config.shader_dir) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                tracing::warn!(%err, "shader hot reload is unavailable");
                None
            }
        };

        Ok(FrameLoop {
            ring,
            retirement: RetirementQueue::new(),
            renderer,
            camera: FpsCamera::default(),
            input: CameraInput::default(),
            timing: FrameTiming::default(),
            flight_index: 0,
            frames: 0,
            #[cfg(feature = "shader_reload")]
            shader_reload,
        })
    }

    pub(crate) fn frames(&self) -> u64 {
        self.frames
    }

    pub(crate) fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// Renders until the window asks to close.
    pub(crate) fn run<W: Window>(
        &mut self,
        device: &Device,
        window: &mut W,
        scene: &mut Scene,
        pool: &AssetPool,
    ) -> Result<(), RendererError> {
        while self.iteration(device, window, scene, pool)? {}
        info!(frames = self.frames, "window closed");
        Ok(())
    }

    fn poll<W: Window>(&mut self, window: &mut W) -> PendingRequests {
        let mut requests = PendingRequests::default();
        for event in window.poll_events() {
            match event {
                WindowEvent::CloseRequested => requests.close = true,
                WindowEvent::Resized(extent) => requests.resize = Some(extent),
                WindowEvent::ReloadShaders => requests.reload_shaders = true,
                WindowEvent::Input(input) => self.input = input,
            }
        }
        #[cfg(feature = "shader_reload")]
        if let Some(ref watcher) = self.shader_reload {
            requests.reload_shaders |= watcher.poll();
        }
        requests
    }

    /// One frame for the current flight. Returns `false` once the window closed.
    pub(crate) fn iteration<W: Window>(
        &mut self,
        device: &Device,
        window: &mut W,
        scene: &mut Scene,
        pool: &AssetPool,
    ) -> Result<bool, RendererError> {
        scope!("frame_loop::iteration");

        let requests = self.poll(window);
        if requests.close {
            return Ok(false);
        }
        self.timing.calculate();
        self.camera.advance(&self.input, self.timing.time_delta);

        let flight_index = self.flight_index;
        let slot = self.ring.begin_iteration(device, flight_index)?;
        self.retirement.collect(device, &self.ring);

        if let Some(extent) = requests.resize.filter(|&extent| extent != self.renderer.extent()) {
            self.ring.wait_all(device)?;
            device.recreate_swapchain(extent)?;
            let retired = self.renderer.resize(device, extent)?;
            self.retirement.retire(retired, self.ring.outstanding());
            self.retirement.collect(device, &self.ring);
        }

        let image_index = device.acquire_next_image(slot.image_acquired)?;
        let target = device
            .swapchain_images()
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| DeviceError::InvalidHandle(format!("swapchain image {}", image_index)))?;

        let list = device.allocate_command_list(slot.command_pool, &format!("Frame command list - {}", flight_index))?;
        let recorder = CommandRecorder::begin(device, list)?;
        // everything replaced this frame may still be used by these
        let marks = self.ring.outstanding();
        let mut retired = self.renderer.ensure_scene(device, &recorder, scene, pool)?;
        if requests.reload_shaders {
            retired.extend(self.renderer.reload_shaders(device)?);
        }
        let camera = self.camera.params(self.renderer.extent());
        self.renderer.render(
            device,
            &recorder,
            flight_index,
            slot.descriptor_pool,
            pool,
            target,
            &camera,
        )?;
        let list = recorder.end()?;

        device.submit(&Submission {
            command_list: list,
            wait_semaphore: Some(slot.image_acquired),
            signal_semaphore: Some(slot.image_presentable),
            fence: Some(slot.fence),
        })?;
        self.ring.mark_submitted(flight_index);
        device.present(image_index, slot.image_presentable)?;
        self.retirement.retire(retired, marks);

        debug!(
            frame = self.frames,
            flight = flight_index,
            image = image_index,
            pending_retirement = self.retirement.len(),
            "presented"
        );
        window.set_title(&format!(
            "restir - {:.2} ms - frame {}",
            self.timing.time_delta * 1000.0,
            self.frames
        ));
        self.frames += 1;
        self.flight_index = (flight_index + 1) % self.ring.len();

        Ok(true)
    }

    /// Waits for the device and releases everything the loop owns.
    pub(crate) fn destroy(mut self, device: &Device) -> Result<(), RendererError> {
        device.wait_idle()?;
        self.ring.wait_all(device)?;
        self.retirement.drain(device);
        self.renderer.destroy(device);
        self.ring.destroy(device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        renderer::device::{GpuBackend, SoftwareDevice, SoftwareDeviceConfig},
        scene::cornell_box,
        window::HeadlessWindow,
    };

    fn small_config(frames: u64) -> RuntimeConfiguration {
        RuntimeConfiguration {
            extent: vk::Extent2D { width: 32, height: 24 },
            frames,
            initial_candidates: 2,
            ..Default::default()
        }
    }

    fn software_device(config: &RuntimeConfiguration) -> Arc<SoftwareDevice> {
        SoftwareDevice::new(&SoftwareDeviceConfig {
            extent: config.extent,
            swapchain_images: config.flights + 1,
            ..Default::default()
        })
        .unwrap()
    }

    /// Runs the loop to completion and checks that shutdown releases every object.
    fn run_to_completion(device: &SoftwareDevice, config: &RuntimeConfiguration, window: &mut HeadlessWindow) -> u64 {
        let (pool, mut scene) = cornell_box(device).unwrap();
        let mut frame_loop = FrameLoop::new(device, config).unwrap();
        frame_loop.run(device, window, &mut scene, &pool).unwrap();
        let frames = frame_loop.frames();
        frame_loop.destroy(device).unwrap();
        pool.destroy(device);
        assert_eq!(device.live_objects(), 0);
        assert_eq!(device.lost(), None);
        frames
    }

    #[test]
    fn renders_until_the_window_closes() {
        let config = small_config(5);
        let device = software_device(&config);
        let mut window = HeadlessWindow::new(&config);

        assert_eq!(run_to_completion(&device, &config, &mut window), 5);
        let stats = device.stats();
        assert_eq!((stats.submissions, stats.executed_submissions, stats.presents), (5, 5, 5));
        // the static scene is built once
        assert_eq!(stats.acceleration_structure_builds, 3);
        assert_eq!(stats.command_pool_resets, 5);
        assert!(window.title().contains("frame 4"));

        let (extent, pixels) = device.capture_last_present().unwrap();
        assert_eq!(extent, config.extent);
        assert!(pixels.chunks_exact(4).any(|pixel| pixel[0] > 0));
    }

    #[test]
    fn resolution_change_recreates_the_swapchain() {
        let resized = vk::Extent2D { width: 16, height: 12 };
        let config = RuntimeConfiguration {
            resize_schedule: vec![(2, resized)],
            ..small_config(4)
        };
        let device = software_device(&config);
        let (pool, mut scene) = cornell_box(&*device).unwrap();
        let mut frame_loop = FrameLoop::new(&*device, &config).unwrap();
        let mut window = HeadlessWindow::new(&config);

        frame_loop.run(&*device, &mut window, &mut scene, &pool).unwrap();
        assert_eq!(device.swapchain_extent(), resized);
        assert_eq!(frame_loop.renderer().extent(), resized);
        assert_eq!(device.capture_last_present().unwrap().0, resized);

        frame_loop.destroy(&*device).unwrap();
        pool.destroy(&*device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn scene_and_shader_changes_go_through_retirement() {
        let config = RuntimeConfiguration {
            flights: 3,
            reservoir_slots: 3,
            reload_schedule: vec![2, 4],
            ..small_config(6)
        };
        let device = software_device(&config);
        let (pool, mut scene) = cornell_box(&*device).unwrap();
        let mut frame_loop = FrameLoop::new(&*device, &config).unwrap();
        let mut window = HeadlessWindow::new(&config).with_input(CameraInput {
            forward: 0.5,
            yaw: 0.2,
            ..Default::default()
        });

        for _ in 0..3 {
            assert!(frame_loop.iteration(&*device, &mut window, &mut scene, &pool).unwrap());
        }
        scene.mark_dirty();
        frame_loop.run(&*device, &mut window, &mut scene, &pool).unwrap();
        assert_eq!(frame_loop.frames(), 6);
        assert_eq!(device.stats().acceleration_structure_builds, 6);

        frame_loop.destroy(&*device).unwrap();
        pool.destroy(&*device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn temporal_reuse_can_be_disabled() {
        let config = RuntimeConfiguration {
            temporal_reuse: false,
            ..small_config(3)
        };
        let device = software_device(&config);
        let mut window = HeadlessWindow::new(&config);
        assert_eq!(run_to_completion(&device, &config, &mut window), 3);
    }
}
