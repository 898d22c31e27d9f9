#![allow(clippy::too_many_arguments)]

pub(crate) mod acceleration_structures;
pub(crate) mod device;
mod errors;
pub(crate) mod flight_ring;
pub(crate) mod reservoir;
pub(crate) mod retirement;
#[cfg(feature = "shader_reload")]
pub(crate) mod shader_reload;
pub(crate) mod shaders;

use std::path::PathBuf;

use ash::vk;
use humansize::{file_size_opts, FileSize};
use itertools::Itertools;
use profiling::scope;
use tracing::{debug, info};

pub(crate) use self::errors::RendererError;
use self::{
    acceleration_structures::{SceneAcceleration, SceneAccelerationBuilder},
    device::{
        BufferDesc, BufferHandle, CommandRecorder, DescriptorPoolHandle, DescriptorResource, DescriptorSetHandle,
        DescriptorWrite, Device, MemoryBarrier, MemoryLocation, PerFlight, SamplerHandle, TextureDesc, TextureHandle,
    },
    reservoir::ReservoirExchange,
    retirement::Retired,
    shaders::{
        beauty_set, frame_set, geometry_set, material_set, vertex_set, CameraParams, DirectLightParams,
        RendererPipelines, ShaderCompileOutcome,
    },
};
use crate::{
    config::RuntimeConfiguration,
    scene::{AssetPool, Scene},
};

pub(crate) fn human_size(bytes: u64) -> String {
    bytes
        .file_size(file_size_opts::BINARY)
        .unwrap_or_else(|_| format!("{} B", bytes))
}

/// Host written uniforms of one frame in flight.
#[derive(Clone, Copy, Debug)]
struct FrameUniforms {
    camera: BufferHandle,
    params: BufferHandle,
}

/// Owns everything the direct lighting and composite passes bind, except for the scene assets.
pub(crate) struct Renderer {
    pipelines: RendererPipelines,
    shader_dir: PathBuf,
    color_format: vk::Format,
    builder: SceneAccelerationBuilder,
    acceleration: Option<SceneAcceleration>,
    reservoirs: ReservoirExchange,
    rt_outputs: PerFlight<TextureHandle>,
    uniforms: PerFlight<FrameUniforms>,
    sampler: SamplerHandle,
    /// Pads the bindless texture array.
    dummy_texture: TextureHandle,
    /// Pads the bindless index and vertex buffer arrays.
    dummy_buffer: BufferHandle,
    light_params: DirectLightParams,
    extent: vk::Extent2D,
    frame_number: u32,
}

impl Renderer {
    /// A failure to compile the shaders here is fatal, there are no pipelines to fall back to.
    pub(crate) fn new(
        device: &Device,
        config: &RuntimeConfiguration,
        extent: vk::Extent2D,
    ) -> Result<Renderer, RendererError> {
        scope!("renderer::new");

        let mut created = vec![];
        match Renderer::create(device, config, extent, &mut created) {
            Ok(renderer) => Ok(renderer),
            Err(err) => {
                created.into_iter().for_each(|resource| resource.destroy(device));
                Err(err)
            }
        }
    }

    fn create(
        device: &Device,
        config: &RuntimeConfiguration,
        extent: vk::Extent2D,
        created: &mut Vec<Retired>,
    ) -> Result<Renderer, RendererError> {
        let color_format = device.swapchain_format();
        let sampler = device.create_sampler("Renderer sampler")?;
        created.push(Retired::Sampler(sampler));

        let dummy_texture = device.create_texture(&TextureDesc {
            name: "Dummy texture",
            extent: vk::Extent2D { width: 1, height: 1 },
            format: vk::Format::R8G8B8A8_SRGB,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            initial_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        })?;
        created.push(Retired::Texture(dummy_texture));
        device.stage_texture_upload(dummy_texture, &[255; 4])?;
        let dummy_buffer = device.create_buffer(&BufferDesc {
            name: "Dummy buffer",
            size: 16,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            location: MemoryLocation::GpuOnly,
        })?;
        created.push(Retired::Buffer(dummy_buffer));

        let uniforms = PerFlight::try_new(config.flights, |ix| -> Result<FrameUniforms, RendererError> {
            let mut uniform = |name: String, size: usize| -> Result<BufferHandle, RendererError> {
                let buffer = device.create_buffer(&BufferDesc {
                    name: &name,
                    size: size as u64,
                    usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                    location: MemoryLocation::CpuToGpu,
                })?;
                created.push(Retired::Buffer(buffer));
                Ok(buffer)
            };
            Ok(FrameUniforms {
                camera: uniform(format!("Camera buffer - {}", ix), std::mem::size_of::<CameraParams>())?,
                params: uniform(
                    format!("Direct light params buffer - {}", ix),
                    std::mem::size_of::<DirectLightParams>(),
                )?,
            })
        })?;
        let rt_outputs = create_rt_outputs(device, config.flights, extent, created)?;

        let reservoirs = ReservoirExchange::new(device, config.reservoir_slots, config.flights, extent)?;
        created.extend(reservoirs.buffers().iter().copied().map(Retired::Buffer));

        let result = RendererPipelines::compile(device, &config.shader_dir, config.bindless_capacity, color_format);
        let pipelines = match ShaderCompileOutcome::from_result(result, true) {
            ShaderCompileOutcome::Success(pipelines) => pipelines,
            ShaderCompileOutcome::RecoverableFailure(err) | ShaderCompileOutcome::FatalFailure(err) => {
                return Err(err.into())
            }
        };

        info!(
            flights = config.flights,
            reservoir_slots = config.reservoir_slots,
            bindless_capacity = config.bindless_capacity,
            width = extent.width,
            height = extent.height,
            "created renderer"
        );

        Ok(Renderer {
            pipelines,
            shader_dir: config.shader_dir.clone(),
            color_format,
            builder: SceneAccelerationBuilder::new(config.bindless_capacity),
            acceleration: None,
            reservoirs,
            rt_outputs,
            uniforms,
            sampler,
            dummy_texture,
            dummy_buffer,
            light_params: DirectLightParams {
                rng_stream_id: 0,
                initial_candidates: config.initial_candidates,
                history_cap: config.history_cap,
                flags: if config.temporal_reuse {
                    DirectLightParams::TEMPORAL_REUSE
                } else {
                    0
                },
                ambient: [config.ambient[0], config.ambient[1], config.ambient[2], 0.0],
            },
            extent,
            frame_number: 0,
        })
    }

    pub(crate) fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Rebuilds the acceleration structures when the scene is dirty or was never built. Returns the
    /// replaced structures, the caller retires them.
    pub(crate) fn ensure_scene(
        &mut self,
        device: &Device,
        recorder: &CommandRecorder,
        scene: &mut Scene,
        pool: &AssetPool,
    ) -> Result<Vec<Retired>, RendererError> {
        if !scene.is_dirty() && self.acceleration.is_some() {
            return Ok(vec![]);
        }

        let acceleration = self.builder.rebuild(device, recorder, scene.objects(), pool)?;
        scene.clear_dirty();
        Ok(self
            .acceleration
            .replace(acceleration)
            .map_or_else(Vec::new, SceneAcceleration::retire))
    }

    /// Recompiles the pipelines. A failure keeps the current ones and is only logged.
    pub(crate) fn reload_shaders(&mut self, device: &Device) -> Result<Vec<Retired>, RendererError> {
        scope!("renderer::reload_shaders");

        match self.pipelines.reload(
            device,
            &self.shader_dir,
            self.builder.bindless_capacity(),
            self.color_format,
        ) {
            ShaderCompileOutcome::Success(old) => {
                info!("reloaded shaders");
                Ok(old)
            }
            ShaderCompileOutcome::RecoverableFailure(_) => Ok(vec![]),
            ShaderCompileOutcome::FatalFailure(err) => Err(err.into()),
        }
    }

    /// Reallocates the reservoirs and the ray traced outputs for a new resolution.
    pub(crate) fn resize(&mut self, device: &Device, extent: vk::Extent2D) -> Result<Vec<Retired>, RendererError> {
        if extent == self.extent {
            return Ok(vec![]);
        }

        let mut created = vec![];
        let rt_outputs = match create_rt_outputs(device, self.rt_outputs.len(), extent, &mut created) {
            Ok(outputs) => outputs,
            Err(err) => {
                created.into_iter().for_each(|resource| resource.destroy(device));
                return Err(err);
            }
        };
        let mut retired = match self.reservoirs.resize(device, extent) {
            Ok(retired) => retired,
            Err(err) => {
                created.into_iter().for_each(|resource| resource.destroy(device));
                return Err(err);
            }
        };
        let old_outputs = std::mem::replace(&mut self.rt_outputs, rt_outputs);
        retired.extend(old_outputs.into_iter().map(Retired::Texture));
        info!(
            from_width = self.extent.width,
            from_height = self.extent.height,
            width = extent.width,
            height = extent.height,
            "resized renderer targets"
        );
        self.extent = extent;

        Ok(retired)
    }

    /// Records the direct lighting dispatch and the composite into `target`, a presentable image
    /// in `PRESENT_SRC_KHR` layout. `descriptor_pool` must belong to `flight_index`.
    pub(crate) fn render(
        &mut self,
        device: &Device,
        recorder: &CommandRecorder,
        flight_index: u32,
        descriptor_pool: DescriptorPoolHandle,
        pool: &AssetPool,
        target: TextureHandle,
        camera: &CameraParams,
    ) -> Result<(), RendererError> {
        scope!("renderer::render");

        if self.acceleration.is_none() {
            return Err(RendererError::SceneNotBuilt);
        }
        let rt_output = *self.rt_outputs.get(flight_index).ok_or(RendererError::FlightIndex {
            index: flight_index,
            count: self.rt_outputs.len(),
        })?;
        let uniforms = self.uniforms[flight_index];

        self.reservoirs.record_clear(recorder)?;
        let flushed = device.flush_staging()?;
        if flushed > 0 {
            recorder.barrier(MemoryBarrier::UPLOAD_TO_CONSUMERS)?;
        }

        let params = DirectLightParams {
            rng_stream_id: self.frame_number,
            ..self.light_params
        };
        device.write_mapped(uniforms.camera, 0, bytemuck::bytes_of(camera))?;
        device.write_mapped(uniforms.params, 0, bytemuck::bytes_of(&params))?;

        let sets = self.ray_tracing_sets(
            device,
            descriptor_pool,
            pool,
            rt_output,
            uniforms,
            self.reservoirs.pair(flight_index),
        )?;

        let bind_point = vk::PipelineBindPoint::RAY_TRACING_KHR;
        recorder.bind_pipeline(bind_point, self.pipelines.direct_light)?;
        recorder.bind_descriptor_sets(bind_point, &sets)?;
        recorder.trace_rays(self.extent.width, self.extent.height)?;

        recorder.transition(
            rt_output,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        recorder.transition(
            target,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )?;
        let beauty = descriptor_set(device, descriptor_pool, beauty_set::INDEX, "Beauty set", &[
            (beauty_set::SAMPLER, DescriptorResource::Sampler(self.sampler)),
            (beauty_set::RT_OUTPUT, DescriptorResource::SampledImage(rt_output)),
        ])?;
        recorder.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, self.pipelines.beauty)?;
        recorder.bind_descriptor_sets(vk::PipelineBindPoint::GRAPHICS, &[beauty])?;
        // fullscreen triangle
        recorder.render_pass(target, 3)?;
        recorder.transition(
            target,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )?;
        recorder.transition(
            rt_output,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::GENERAL,
        )?;

        debug!(
            frame = self.frame_number,
            flight = flight_index,
            flushed_uploads = flushed,
            "recorded frame"
        );
        self.frame_number = self.frame_number.wrapping_add(1);

        Ok(())
    }

    /// The four sets the direct lighting pipeline binds, reading `history` and writing
    /// `reservoirs_out`.
    fn ray_tracing_sets(
        &self,
        device: &Device,
        descriptor_pool: DescriptorPoolHandle,
        pool: &AssetPool,
        rt_output: TextureHandle,
        uniforms: FrameUniforms,
        (history, reservoirs_out): (BufferHandle, BufferHandle),
    ) -> Result<[DescriptorSetHandle; 4], RendererError> {
        let acceleration = self.acceleration.as_ref().ok_or(RendererError::SceneNotBuilt)?;
        let capacity = self.builder.bindless_capacity();
        let textures = padded("textures", pool.textures(), capacity, self.dummy_texture)?;
        let index_buffers = padded("index buffers", pool.index_buffers(), capacity, self.dummy_buffer)?;
        let vertex_buffers = padded("vertex buffers", pool.vertex_buffers(), capacity, self.dummy_buffer)?;

        Ok([
            descriptor_set(device, descriptor_pool, frame_set::INDEX, "Frame set", &[
                (frame_set::CAMERA, DescriptorResource::UniformBuffer(uniforms.camera)),
                (frame_set::DIRECT_LIGHT_PARAMS, DescriptorResource::UniformBuffer(uniforms.params)),
                (frame_set::RESERVOIR_HISTORY, DescriptorResource::ReadOnlyStorageBuffer(history)),
                (frame_set::RT_OUTPUT, DescriptorResource::StorageImage(rt_output)),
                (frame_set::RESERVOIR_OUT, DescriptorResource::StorageBuffer(reservoirs_out)),
            ])?,
            descriptor_set(device, descriptor_pool, material_set::INDEX, "Material set", &[
                (material_set::SAMPLER, DescriptorResource::Sampler(self.sampler)),
                (
                    material_set::MATERIALS,
                    DescriptorResource::ReadOnlyStorageBuffer(acceleration.materials),
                ),
                (
                    material_set::MATERIAL_IDS,
                    DescriptorResource::ReadOnlyStorageBuffer(acceleration.material_ids),
                ),
                (
                    material_set::EMISSIVES,
                    DescriptorResource::ReadOnlyStorageBuffer(acceleration.emissives),
                ),
                (material_set::TEXTURES, DescriptorResource::SampledImageArray(textures)),
            ])?,
            descriptor_set(device, descriptor_pool, geometry_set::INDEX, "Geometry set", &[
                (
                    geometry_set::TLAS,
                    DescriptorResource::AccelerationStructure(acceleration.tlas),
                ),
                (
                    geometry_set::OBJECT_TABLE,
                    DescriptorResource::UniformBuffer(acceleration.object_table),
                ),
                (
                    geometry_set::TRIANGLE_COUNTS,
                    DescriptorResource::ReadOnlyStorageBuffer(acceleration.triangle_counts),
                ),
                (
                    geometry_set::GEOMETRY_RECORDS,
                    DescriptorResource::ReadOnlyStorageBuffer(acceleration.geometry_records),
                ),
                (geometry_set::INDEX_BUFFERS, DescriptorResource::StorageBufferArray(index_buffers)),
            ])?,
            descriptor_set(device, descriptor_pool, vertex_set::INDEX, "Vertex set", &[(
                vertex_set::VERTEX_BUFFERS,
                DescriptorResource::StorageBufferArray(vertex_buffers),
            )])?,
        ])
    }

    /// The device must be idle.
    pub(crate) fn destroy(self, device: &Device) {
        self.pipelines
            .retire()
            .into_iter()
            .chain(self.acceleration.map_or_else(Vec::new, SceneAcceleration::retire))
            .chain(self.reservoirs.retire())
            .chain(self.rt_outputs.into_iter().map(Retired::Texture))
            .chain(
                self.uniforms
                    .into_iter()
                    .flat_map(|uniforms| [Retired::Buffer(uniforms.camera), Retired::Buffer(uniforms.params)]),
            )
            .chain([
                Retired::Sampler(self.sampler),
                Retired::Texture(self.dummy_texture),
                Retired::Buffer(self.dummy_buffer),
            ])
            .for_each(|resource| resource.destroy(device));
    }
}

fn create_rt_outputs(
    device: &Device,
    flights: u32,
    extent: vk::Extent2D,
    created: &mut Vec<Retired>,
) -> Result<PerFlight<TextureHandle>, RendererError> {
    let outputs = PerFlight::try_new(flights, |ix| -> Result<TextureHandle, RendererError> {
        let texture = device.create_texture(&TextureDesc {
            name: &format!("RT output - {}", ix),
            extent,
            format: vk::Format::R32G32B32A32_SFLOAT,
            usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            initial_layout: vk::ImageLayout::GENERAL,
        })?;
        created.push(Retired::Texture(texture));
        Ok(texture)
    })?;
    debug!(
        flights,
        size = %human_size(u64::from(extent.width) * u64::from(extent.height) * 16 * u64::from(flights)),
        "allocated ray traced outputs"
    );
    Ok(outputs)
}

/// Fills a bindless array up to `capacity` with `dummy`.
fn padded<T: Copy>(what: &'static str, items: &[T], capacity: u32, dummy: T) -> Result<Vec<T>, RendererError> {
    if items.len() > capacity as usize {
        return Err(RendererError::BindlessCapacity {
            what,
            count: items.len(),
            capacity,
        });
    }
    Ok(items.iter().copied().pad_using(capacity as usize, |_| dummy).collect())
}

fn descriptor_set(
    device: &Device,
    pool: DescriptorPoolHandle,
    set_index: u32,
    name: &str,
    bindings: &[(u32, DescriptorResource)],
) -> Result<DescriptorSetHandle, RendererError> {
    let set = device.allocate_descriptor_set(pool, set_index, name)?;
    let writes = bindings
        .iter()
        .map(|(binding, resource)| DescriptorWrite {
            binding: *binding,
            resource: resource.clone(),
        })
        .collect::<Vec<_>>();
    device.update_descriptor_set(set, &writes)?;
    Ok(set)
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path, sync::Arc};

    use super::*;
    use crate::{
        camera::FpsCamera,
        renderer::{
            device::{CommandPoolHandle, DeviceError, GpuBackend, SoftwareDevice, SoftwareDeviceConfig, Submission},
            reservoir::Reservoir,
        },
        scene::cornell_box,
    };

    const EXTENT: vk::Extent2D = vk::Extent2D { width: 48, height: 32 };

    struct Fixture {
        device: Arc<SoftwareDevice>,
        pool: AssetPool,
        scene: Scene,
        renderer: Renderer,
        command_pool: CommandPoolHandle,
        descriptor_pool: DescriptorPoolHandle,
    }

    impl Fixture {
        fn new(shader_dir: &Path) -> Fixture {
            let device = SoftwareDevice::new(&SoftwareDeviceConfig {
                extent: EXTENT,
                ..Default::default()
            })
            .unwrap();
            let config = RuntimeConfiguration {
                shader_dir: shader_dir.to_owned(),
                ..Default::default()
            };
            let (pool, scene) = cornell_box(&*device).unwrap();
            let renderer = Renderer::new(&*device, &config, EXTENT).unwrap();
            let command_pool = device.create_command_pool("test pool").unwrap();
            let descriptor_pool = device.create_descriptor_pool("test descriptor pool").unwrap();
            Fixture {
                device,
                pool,
                scene,
                renderer,
                command_pool,
                descriptor_pool,
            }
        }

        /// Records, submits and waits for one frame, returning what it replaced.
        fn frame(&mut self, flight_index: u32) -> Vec<Retired> {
            let device = &*self.device;
            device.reset_command_pool(self.command_pool).unwrap();
            device.reset_descriptor_pool(self.descriptor_pool).unwrap();
            let list = device.allocate_command_list(self.command_pool, "frame").unwrap();
            let recorder = CommandRecorder::begin(device, list).unwrap();
            let retired = self
                .renderer
                .ensure_scene(device, &recorder, &mut self.scene, &self.pool)
                .unwrap();
            let target = device.swapchain_images()[0];
            let camera = FpsCamera::default().params(self.renderer.extent());
            self.renderer
                .render(
                    device,
                    &recorder,
                    flight_index,
                    self.descriptor_pool,
                    &self.pool,
                    target,
                    &camera,
                )
                .unwrap();
            let list = recorder.end().unwrap();
            device
                .submit(&Submission {
                    command_list: list,
                    wait_semaphore: None,
                    signal_semaphore: None,
                    fence: None,
                })
                .unwrap();
            device.wait_idle().unwrap();
            assert_eq!(device.lost(), None);
            retired
        }

        /// Records only the direct lighting dispatch with the given reservoir buffers, returning
        /// the error that lost the device, if any.
        fn trace_with(&self, history: BufferHandle, reservoirs_out: BufferHandle) -> Option<DeviceError> {
            let device = &*self.device;
            device.reset_command_pool(self.command_pool).unwrap();
            device.reset_descriptor_pool(self.descriptor_pool).unwrap();
            let list = device.allocate_command_list(self.command_pool, "dispatch").unwrap();
            let recorder = CommandRecorder::begin(device, list).unwrap();
            let sets = self
                .renderer
                .ray_tracing_sets(
                    device,
                    self.descriptor_pool,
                    &self.pool,
                    self.renderer.rt_outputs[0],
                    self.renderer.uniforms[0],
                    (history, reservoirs_out),
                )
                .unwrap();
            let bind_point = vk::PipelineBindPoint::RAY_TRACING_KHR;
            recorder.bind_pipeline(bind_point, self.renderer.pipelines.direct_light).unwrap();
            recorder.bind_descriptor_sets(bind_point, &sets).unwrap();
            recorder.trace_rays(EXTENT.width, EXTENT.height).unwrap();
            let list = recorder.end().unwrap();
            device
                .submit(&Submission {
                    command_list: list,
                    wait_semaphore: None,
                    signal_semaphore: None,
                    fence: None,
                })
                .unwrap();
            let idle = device.wait_idle();
            let lost = device.lost();
            assert_eq!(idle.is_err(), lost.is_some());
            lost
        }

        fn shutdown(self) {
            let device = &*self.device;
            device.wait_idle().unwrap();
            device.destroy_command_pool(self.command_pool);
            device.destroy_descriptor_pool(self.descriptor_pool);
            self.renderer.destroy(device);
            self.pool.destroy(device);
            assert_eq!(device.live_objects(), 0);
        }
    }

    fn shader_dir() -> PathBuf {
        PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders"))
    }

    /// A private copy of the shaders that a test can break.
    fn scratch_shader_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("restir-shaders-{}-{}", std::process::id(), name));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(shaders::DIRECT_LIGHT_SHADER), include_str!("../shaders/direct_light.hlsl")).unwrap();
        fs::write(dir.join(shaders::BEAUTY_SHADER), include_str!("../shaders/beauty.hlsl")).unwrap();
        dir
    }

    #[test]
    fn rendered_frame_reaches_the_swapchain_image() {
        let mut fixture = Fixture::new(&shader_dir());
        assert!(fixture.frame(0).is_empty());

        let device = &*fixture.device;
        let output = fixture.renderer.rt_outputs[0];
        assert_eq!(device.texture_layout(output), Some(vk::ImageLayout::GENERAL));
        let target = device.swapchain_images()[0];
        assert_eq!(device.texture_layout(target), Some(vk::ImageLayout::PRESENT_SRC_KHR));

        let texels = device.read_rgba32f(output).unwrap();
        assert_eq!(texels.len(), (EXTENT.width * EXTENT.height) as usize);
        assert!(texels.iter().all(|texel| texel.iter().all(|c| c.is_finite() && *c >= 0.0)));
        // the ceiling light is in view
        assert!(texels.iter().any(|texel| texel[0] > 1.0));

        let stats = device.stats();
        assert_eq!((stats.trace_dispatches, stats.draws), (1, 1));
        fixture.shutdown();
    }

    #[test]
    fn clean_scene_keeps_its_acceleration_structures() {
        let mut fixture = Fixture::new(&shader_dir());
        fixture.frame(0);
        let tlas = fixture.renderer.acceleration.as_ref().unwrap().tlas;
        let materials = fixture.renderer.acceleration.as_ref().unwrap().materials;

        assert!(fixture.frame(1).is_empty());
        assert!(fixture.frame(0).is_empty());
        let acceleration = fixture.renderer.acceleration.as_ref().unwrap();
        assert_eq!((acceleration.tlas, acceleration.materials), (tlas, materials));
        assert_eq!(fixture.device.stats().acceleration_structure_builds, 3);

        fixture.scene.mark_dirty();
        let retired = fixture.frame(1);
        assert!(retired.contains(&Retired::AccelerationStructure(tlas)));
        assert_ne!(fixture.renderer.acceleration.as_ref().unwrap().tlas, tlas);
        assert!(!fixture.scene.is_dirty());
        retired.into_iter().for_each(|resource| resource.destroy(&*fixture.device));
        fixture.shutdown();
    }

    #[test]
    fn resize_replaces_reservoirs_and_outputs() {
        let mut fixture = Fixture::new(&shader_dir());
        fixture.frame(0);
        let device = &*fixture.device;

        let smaller = vk::Extent2D { width: 24, height: 16 };
        let old_reservoirs = fixture.renderer.reservoirs.buffers().to_vec();
        let retired = fixture.renderer.resize(device, smaller).unwrap();
        // two reservoir buffers and one output per flight
        assert_eq!(retired.len(), 2 + 2);
        for buffer in old_reservoirs {
            assert!(retired.contains(&Retired::Buffer(buffer)));
        }
        for &buffer in fixture.renderer.reservoirs.buffers() {
            assert_eq!(device.buffer_size(buffer).unwrap(), 24 * 16 * 32);
        }
        for &output in fixture.renderer.rt_outputs.iter() {
            assert_eq!(device.texture_extent(output).unwrap(), smaller);
        }
        assert!(fixture.renderer.resize(device, smaller).unwrap().is_empty());
        retired.into_iter().for_each(|resource| resource.destroy(device));

        fixture.frame(1);
        fixture.shutdown();
    }

    #[test]
    fn broken_reload_keeps_the_previous_pipelines() {
        let dir = scratch_shader_dir("reload");
        let mut fixture = Fixture::new(&dir);
        let direct_light = fixture.renderer.pipelines.direct_light;

        fs::write(dir.join(shaders::DIRECT_LIGHT_SHADER), "[shader(\"raygeneration\")] void RayGen() {").unwrap();
        assert!(fixture.renderer.reload_shaders(&*fixture.device).unwrap().is_empty());
        assert_eq!(fixture.renderer.pipelines.direct_light, direct_light);
        fixture.frame(0);

        fs::write(dir.join(shaders::DIRECT_LIGHT_SHADER), include_str!("../shaders/direct_light.hlsl")).unwrap();
        let retired = fixture.renderer.reload_shaders(&*fixture.device).unwrap();
        assert_eq!(retired.len(), 2);
        assert!(retired.contains(&Retired::Pipeline(direct_light)));
        assert_ne!(fixture.renderer.pipelines.direct_light, direct_light);
        retired.into_iter().for_each(|resource| resource.destroy(&*fixture.device));

        fixture.frame(1);
        fixture.shutdown();
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn broken_first_load_is_fatal_and_leaks_nothing() {
        let dir = scratch_shader_dir("first-load");
        fs::write(dir.join(shaders::BEAUTY_SHADER), "float4 FsMain() : SV_Target { return 1; }").unwrap();
        let device = SoftwareDevice::new(&Default::default()).unwrap();
        let config = RuntimeConfiguration {
            shader_dir: dir.clone(),
            ..Default::default()
        };

        assert!(matches!(
            Renderer::new(&*device, &config, EXTENT),
            Err(RendererError::Shader(_))
        ));
        assert_eq!(device.live_objects(), 0);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn temporal_reuse_accumulates_up_to_the_history_cap() {
        let mut fixture = Fixture::new(&shader_dir());
        let mut max_counts = vec![];
        for flight in [0, 1, 0, 1, 0] {
            fixture.frame(flight);
            let (_, written) = fixture.renderer.reservoirs.pair(flight);
            let bytes = fixture.device.read_buffer(written).unwrap();
            let max = bytes
                .chunks_exact(Reservoir::SIZE as usize)
                .map(bytemuck::pod_read_unaligned::<Reservoir>)
                .map(|reservoir| reservoir.sample_count)
                .max()
                .unwrap();
            max_counts.push(max);
        }
        // 8 fresh candidates per frame plus a history capped at 20
        assert_eq!(max_counts, vec![8, 16, 24, 28, 28]);
        fixture.shutdown();
    }

    #[test]
    fn dispatch_rejects_aliased_reservoirs() {
        let mut fixture = Fixture::new(&shader_dir());
        fixture.frame(0);
        let (history, _) = fixture.renderer.reservoirs.pair(0);
        assert!(matches!(
            fixture.trace_with(history, history),
            Some(DeviceError::AliasedBinding { .. })
        ));
    }

    #[test]
    fn dispatch_rejects_reservoirs_of_another_resolution() {
        let mut fixture = Fixture::new(&shader_dir());
        fixture.frame(0);
        let (history, _) = fixture.renderer.reservoirs.pair(0);
        let short = fixture
            .device
            .create_buffer(&BufferDesc {
                name: "Short reservoirs",
                size: Reservoir::SIZE * 10,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                location: MemoryLocation::GpuOnly,
            })
            .unwrap();
        assert!(matches!(
            fixture.trace_with(history, short),
            Some(DeviceError::InvalidDescriptor {
                binding: frame_set::RESERVOIR_OUT,
                ..
            })
        ));
    }

    #[test]
    fn bindless_arrays_are_padded_to_capacity() {
        assert_eq!(padded("buffers", &[1, 2], 4, 0).unwrap(), vec![1, 2, 0, 0]);
        assert!(matches!(
            padded("buffers", &[1, 2, 3], 2, 0),
            Err(RendererError::BindlessCapacity { count: 3, capacity: 2, .. })
        ));
    }

    #[test]
    fn sizes_are_human_readable() {
        assert!(human_size(3 * 1024 * 1024).contains("MiB"));
    }
}
