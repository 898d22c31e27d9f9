//! Headless implementation of [`GpuBackend`] executing command lists on the CPU.
//!
//! Submissions and presents go through one in-order queue. Besides executing the work it checks
//! the synchronization contract a real driver would only report through validation layers: staged
//! uploads consumed before a flush and a transfer barrier, image layout mismatches, semaphores
//! waited on without a signal, command pools reset while their lists are pending, and destroyed
//! objects referenced by queued work. A failure while executing the queue loses the device.

use std::{collections::VecDeque, sync::Arc};

use ash::vk;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use profiling::scope;
use tracing::{debug, warn};

use super::{
    AccelerationStructureHandle, BufferDesc, BufferHandle, Command, CommandListHandle, CommandPoolHandle,
    DescriptorPoolHandle, DescriptorResource, DescriptorSetHandle, DescriptorWrite, DeviceError, FenceHandle,
    GeometryDesc, GpuBackend, InstanceDesc, MemoryLocation, PipelineHandle, RasterPipelineDesc,
    RayTracingPipelineDesc, SamplerHandle, SemaphoreHandle, ShaderModule, ShaderModuleDesc, Submission,
    TextureDesc, TextureHandle,
};

mod beauty;
mod direct_light;
mod geometry;
mod queue;
mod resources;
mod shader_compiler;

use self::{
    geometry::{AccelerationKind, SoftAccelerationStructure},
    queue::{PendingSubmission, QueueOp},
    resources::{SoftBuffer, SoftTexture},
};

pub(crate) struct SoftwareDeviceConfig {
    pub(crate) extent: vk::Extent2D,
    pub(crate) swapchain_images: u32,
    pub(crate) swapchain_format: vk::Format,
}

impl Default for SoftwareDeviceConfig {
    fn default() -> SoftwareDeviceConfig {
        SoftwareDeviceConfig {
            extent: vk::Extent2D {
                width: 640,
                height: 360,
            },
            swapchain_images: 3,
            swapchain_format: vk::Format::R8G8B8A8_UNORM,
        }
    }
}

/// Counters for tests and the shutdown log line.
#[derive(Clone, Debug, Default)]
pub(crate) struct DeviceStats {
    pub(crate) submissions: u64,
    pub(crate) executed_submissions: u64,
    pub(crate) presents: u64,
    pub(crate) fence_waits: u64,
    pub(crate) command_pool_resets: u64,
    pub(crate) descriptor_pool_resets: u64,
    pub(crate) staged_uploads: u64,
    pub(crate) barriers: u64,
    pub(crate) acceleration_structure_builds: u64,
    pub(crate) trace_dispatches: u64,
    pub(crate) draws: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum ResourceKey {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

struct PendingUpload {
    target: ResourceKey,
    offset: u64,
    data: Vec<u8>,
}

struct SoftFence {
    name: String,
    signaled: bool,
}

struct SoftSemaphore {
    name: String,
    signaled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListState {
    Initial,
    Recording,
    Executable,
    Submitted,
}

impl ListState {
    fn name(self) -> &'static str {
        match self {
            ListState::Initial => "initial",
            ListState::Recording => "recording",
            ListState::Executable => "executable",
            ListState::Submitted => "submitted",
        }
    }
}

struct SoftCommandPool {
    name: String,
    lists: Vec<CommandListHandle>,
    pending: u32,
}

struct SoftCommandList {
    name: String,
    pool: CommandPoolHandle,
    state: ListState,
    commands: Vec<Command>,
}

struct SoftDescriptorPool {
    name: String,
    sets: Vec<DescriptorSetHandle>,
}

struct SoftDescriptorSet {
    name: String,
    set_index: u32,
    bindings: HashMap<u32, DescriptorResource>,
}

enum PipelineKind {
    Raster { color_format: vk::Format },
    RayTracing { bindless_capacity: u32 },
}

struct SoftPipeline {
    name: String,
    kind: PipelineKind,
}

#[derive(Default)]
struct SoftSwapchain {
    extent: vk::Extent2D,
    format: vk::Format,
    images: Vec<TextureHandle>,
    acquired: Vec<bool>,
    next: u32,
    last_presented: Option<u32>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    buffers: HashMap<BufferHandle, SoftBuffer>,
    textures: HashMap<TextureHandle, SoftTexture>,
    samplers: HashMap<SamplerHandle, String>,
    fences: HashMap<FenceHandle, SoftFence>,
    semaphores: HashMap<SemaphoreHandle, SoftSemaphore>,
    command_pools: HashMap<CommandPoolHandle, SoftCommandPool>,
    command_lists: HashMap<CommandListHandle, SoftCommandList>,
    descriptor_pools: HashMap<DescriptorPoolHandle, SoftDescriptorPool>,
    descriptor_sets: HashMap<DescriptorSetHandle, SoftDescriptorSet>,
    pipelines: HashMap<PipelineHandle, SoftPipeline>,
    acceleration_structures: HashMap<AccelerationStructureHandle, SoftAccelerationStructure>,
    staging: Vec<PendingUpload>,
    /// Targets of staged uploads that were not flushed yet.
    unflushed: HashSet<ResourceKey>,
    /// Targets of transfers that no barrier has made visible yet.
    invisible: HashSet<ResourceKey>,
    queue: VecDeque<QueueOp>,
    stalled: bool,
    lost: Option<DeviceError>,
    swapchain: SoftSwapchain,
    stats: DeviceStats,
}

pub(crate) struct SoftwareDevice {
    state: Mutex<State>,
    queue_progress: Condvar,
}

impl State {
    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&SoftBuffer, DeviceError> {
        self.buffers
            .get(&handle)
            .ok_or_else(|| DeviceError::InvalidHandle(handle.to_string()))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut SoftBuffer, DeviceError> {
        self.buffers
            .get_mut(&handle)
            .ok_or_else(|| DeviceError::InvalidHandle(handle.to_string()))
    }

    fn texture(&self, handle: TextureHandle) -> Result<&SoftTexture, DeviceError> {
        self.textures
            .get(&handle)
            .ok_or_else(|| DeviceError::InvalidHandle(handle.to_string()))
    }

    fn texture_mut(&mut self, handle: TextureHandle) -> Result<&mut SoftTexture, DeviceError> {
        self.textures
            .get_mut(&handle)
            .ok_or_else(|| DeviceError::InvalidHandle(handle.to_string()))
    }

    fn descriptor_set(&self, handle: DescriptorSetHandle) -> Result<&SoftDescriptorSet, DeviceError> {
        self.descriptor_sets
            .get(&handle)
            .ok_or_else(|| DeviceError::InvalidHandle(handle.to_string()))
    }

    fn pipeline(&self, handle: PipelineHandle) -> Result<&SoftPipeline, DeviceError> {
        self.pipelines
            .get(&handle)
            .ok_or_else(|| DeviceError::InvalidHandle(handle.to_string()))
    }

    fn resource_name(&self, key: ResourceKey) -> String {
        match key {
            ResourceKey::Buffer(handle) => self.buffers.get(&handle).map(|b| b.name.clone()),
            ResourceKey::Texture(handle) => self.textures.get(&handle).map(|t| t.name.clone()),
        }
        .unwrap_or_else(|| format!("{:?}", key))
    }

    /// Consumers of a staged resource need a flush and a transfer barrier in between.
    fn check_visible(&self, key: ResourceKey) -> Result<(), DeviceError> {
        if self.unflushed.contains(&key) {
            Err(DeviceError::UnflushedUpload {
                name: self.resource_name(key),
            })
        } else if self.invisible.contains(&key) {
            Err(DeviceError::UploadHazard {
                name: self.resource_name(key),
            })
        } else {
            Ok(())
        }
    }

    fn check_lost(&self) -> Result<(), DeviceError> {
        match self.lost {
            Some(ref err) => Err(DeviceError::DeviceLost(err.to_string())),
            None => Ok(()),
        }
    }

    fn validate_descriptor(&self, set_index: u32, write: &DescriptorWrite) -> Result<(), DeviceError> {
        let invalid = |reason: String| DeviceError::InvalidDescriptor {
            set: set_index,
            binding: write.binding,
            reason,
        };
        let buffer_usage = |buffer: BufferHandle, usage: vk::BufferUsageFlags| -> Result<(), DeviceError> {
            let entry = self.buffer(buffer).map_err(|err| invalid(err.to_string()))?;
            if entry.usage.contains(usage) {
                Ok(())
            } else {
                Err(invalid(format!("{} lacks {:?} usage", entry.name, usage)))
            }
        };
        let texture_usage = |texture: TextureHandle, usage: vk::ImageUsageFlags| -> Result<(), DeviceError> {
            let entry = self.texture(texture).map_err(|err| invalid(err.to_string()))?;
            if entry.usage.contains(usage) {
                Ok(())
            } else {
                Err(invalid(format!("{} lacks {:?} usage", entry.name, usage)))
            }
        };

        match write.resource {
            DescriptorResource::UniformBuffer(buffer) => buffer_usage(buffer, vk::BufferUsageFlags::UNIFORM_BUFFER),
            DescriptorResource::ReadOnlyStorageBuffer(buffer) | DescriptorResource::StorageBuffer(buffer) => {
                buffer_usage(buffer, vk::BufferUsageFlags::STORAGE_BUFFER)
            }
            DescriptorResource::StorageBufferArray(ref buffers) => buffers
                .iter()
                .try_for_each(|&buffer| buffer_usage(buffer, vk::BufferUsageFlags::STORAGE_BUFFER)),
            DescriptorResource::StorageImage(texture) => texture_usage(texture, vk::ImageUsageFlags::STORAGE),
            DescriptorResource::SampledImage(texture) => texture_usage(texture, vk::ImageUsageFlags::SAMPLED),
            DescriptorResource::SampledImageArray(ref textures) => textures
                .iter()
                .try_for_each(|&texture| texture_usage(texture, vk::ImageUsageFlags::SAMPLED)),
            DescriptorResource::Sampler(sampler) if self.samplers.contains_key(&sampler) => Ok(()),
            DescriptorResource::Sampler(sampler) => Err(invalid(format!("{} is not a live object", sampler))),
            DescriptorResource::AccelerationStructure(accel) => match self.acceleration_structures.get(&accel) {
                Some(SoftAccelerationStructure {
                    kind: AccelerationKind::Top { .. },
                    ..
                }) => Ok(()),
                Some(entry) => Err(invalid(format!("{} is not a top level structure", entry.name))),
                None => Err(invalid(format!("{} is not a live object", accel))),
            },
        }
    }

    fn forget_resource(&mut self, key: ResourceKey) {
        self.unflushed.remove(&key);
        self.invisible.remove(&key);
        self.staging.retain(|upload| upload.target != key);
    }

    fn create_swapchain_images(
        &mut self,
        extent: vk::Extent2D,
        count: u32,
        format: vk::Format,
    ) -> Result<(), DeviceError> {
        let images = (0..count)
            .map(|ix| -> Result<TextureHandle, DeviceError> {
                let texture = SoftTexture::new(&TextureDesc {
                    name: &format!("Swapchain image - {}", ix),
                    extent,
                    format,
                    usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                    initial_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                })?;
                let handle = TextureHandle(self.allocate_handle());
                self.textures.insert(handle, texture);
                Ok(handle)
            })
            .collect::<Result<Vec<_>, DeviceError>>()?;

        self.swapchain = SoftSwapchain {
            extent,
            format,
            acquired: vec![false; images.len()],
            images,
            next: 0,
            last_presented: None,
        };
        Ok(())
    }
}

impl SoftwareDevice {
    pub(crate) fn new(config: &SoftwareDeviceConfig) -> Result<Arc<SoftwareDevice>, DeviceError> {
        if config.swapchain_images < 2 {
            return Err(DeviceError::InvalidCreateInfo {
                name: "swapchain".to_owned(),
                reason: format!("{} images cannot be double buffered", config.swapchain_images),
            });
        }
        let mut state = State::default();
        state.create_swapchain_images(config.extent, config.swapchain_images, config.swapchain_format)?;
        debug!(
            width = config.extent.width,
            height = config.extent.height,
            images = config.swapchain_images,
            "created software device"
        );

        Ok(Arc::new(SoftwareDevice {
            state: Mutex::new(state),
            queue_progress: Condvar::new(),
        }))
    }

    pub(crate) fn stats(&self) -> DeviceStats {
        self.state.lock().stats.clone()
    }

    /// Objects alive on the device, not counting swapchain images.
    pub(crate) fn live_objects(&self) -> usize {
        let state = self.state.lock();
        state.buffers.len() + state.textures.len() - state.swapchain.images.len()
            + state.samplers.len()
            + state.fences.len()
            + state.semaphores.len()
            + state.command_pools.len()
            + state.descriptor_pools.len()
            + state.pipelines.len()
            + state.acceleration_structures.len()
    }

    /// RGBA8 contents of the most recently presented image.
    pub(crate) fn capture_last_present(&self) -> Option<(vk::Extent2D, Vec<u8>)> {
        let state = self.state.lock();
        let index = state.swapchain.last_presented?;
        let texture = state.textures.get(&state.swapchain.images[index as usize])?;
        Some((texture.extent, texture.bytes().to_vec()))
    }

    fn enqueue(&self, op: QueueOp) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.check_lost()?;
        state.queue.push_back(op);
        state.drain_queue();
        drop(state);
        self.queue_progress.notify_all();
        Ok(())
    }
}

#[cfg(test)]
impl SoftwareDevice {
    /// Holds back queue execution, as if the GPU stopped making progress.
    pub(crate) fn stall_queue(&self) {
        self.state.lock().stalled = true;
    }

    pub(crate) fn resume_queue(&self) {
        let mut state = self.state.lock();
        state.stalled = false;
        state.drain_queue();
        drop(state);
        self.queue_progress.notify_all();
    }

    pub(crate) fn pending_queue_ops(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub(crate) fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.state.lock().buffers.get(&buffer).map(|buffer| buffer.size)
    }

    /// Whole buffer contents regardless of memory location, as a debugger would show them.
    pub(crate) fn read_buffer(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).map(|buffer| buffer.bytes().to_vec())
    }

    pub(crate) fn texture_extent(&self, texture: TextureHandle) -> Option<vk::Extent2D> {
        self.state.lock().textures.get(&texture).map(|texture| texture.extent)
    }

    pub(crate) fn contains_buffer(&self, buffer: BufferHandle) -> bool {
        self.state.lock().buffers.contains_key(&buffer)
    }

    pub(crate) fn contains_acceleration_structure(&self, accel: AccelerationStructureHandle) -> bool {
        self.state.lock().acceleration_structures.contains_key(&accel)
    }

    pub(crate) fn texture_layout(&self, texture: TextureHandle) -> Option<vk::ImageLayout> {
        self.state.lock().textures.get(&texture).map(|t| t.layout)
    }

    pub(crate) fn read_rgba32f(&self, texture: TextureHandle) -> Option<Vec<[f32; 4]>> {
        let state = self.state.lock();
        state.textures.get(&texture)?.rgba32f().ok().map(|texels| texels.to_vec())
    }

    pub(crate) fn built_geometry_count(&self, accel: AccelerationStructureHandle) -> Option<usize> {
        let state = self.state.lock();
        match state.acceleration_structures.get(&accel)?.kind {
            AccelerationKind::Bottom {
                built: Some(ref built), ..
            } => Some(built.len()),
            _ => None,
        }
    }

    pub(crate) fn lost(&self) -> Option<DeviceError> {
        self.state.lock().lost.clone()
    }
}

impl GpuBackend for SoftwareDevice {
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferHandle, DeviceError> {
        let buffer = SoftBuffer::new(desc)?;
        let mut state = self.state.lock();
        let handle = BufferHandle(state.allocate_handle());
        state.buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer).is_none() {
            warn!(%buffer, "destroying unknown buffer");
        }
        state.forget_resource(ResourceKey::Buffer(buffer));
    }

    fn write_mapped(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let buffer = state.buffer_mut(buffer)?;
        if buffer.location != MemoryLocation::CpuToGpu {
            return Err(DeviceError::NotHostVisible {
                name: buffer.name.clone(),
            });
        }
        buffer.write(offset, data)
    }

    fn create_texture(&self, desc: &TextureDesc<'_>) -> Result<TextureHandle, DeviceError> {
        let texture = SoftTexture::new(desc)?;
        let mut state = self.state.lock();
        let handle = TextureHandle(state.allocate_handle());
        state.textures.insert(handle, texture);
        Ok(handle)
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        let mut state = self.state.lock();
        if state.swapchain.images.contains(&texture) {
            warn!(%texture, "swapchain images are owned by the swapchain");
            return;
        }
        if state.textures.remove(&texture).is_none() {
            warn!(%texture, "destroying unknown texture");
        }
        state.forget_resource(ResourceKey::Texture(texture));
    }

    fn create_sampler(&self, name: &str) -> Result<SamplerHandle, DeviceError> {
        let mut state = self.state.lock();
        let handle = SamplerHandle(state.allocate_handle());
        state.samplers.insert(handle, name.to_owned());
        Ok(handle)
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        if self.state.lock().samplers.remove(&sampler).is_none() {
            warn!(%sampler, "destroying unknown sampler");
        }
    }

    fn stage_buffer_upload(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let target = state.buffer(buffer)?;
        if !target.usage.contains(vk::BufferUsageFlags::TRANSFER_DST) {
            return Err(DeviceError::InvalidCommand {
                name: target.name.clone(),
                reason: "staged upload into a buffer without TRANSFER_DST usage".to_owned(),
            });
        }
        // bounds are checked now rather than at flush time
        target.read(offset, data.len() as u64)?;

        let key = ResourceKey::Buffer(buffer);
        state.staging.push(PendingUpload {
            target: key,
            offset,
            data: data.to_vec(),
        });
        state.unflushed.insert(key);
        Ok(())
    }

    fn stage_texture_upload(&self, texture: TextureHandle, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let target = state.texture(texture)?;
        if data.len() != target.byte_len() {
            return Err(DeviceError::OutOfBounds {
                name: target.name.clone(),
                offset: 0,
                len: data.len() as u64,
                size: target.byte_len() as u64,
            });
        }

        let key = ResourceKey::Texture(texture);
        state.staging.push(PendingUpload {
            target: key,
            offset: 0,
            data: data.to_vec(),
        });
        state.unflushed.insert(key);
        Ok(())
    }

    fn flush_staging(&self) -> Result<usize, DeviceError> {
        scope!("software::flush_staging");

        let mut state = self.state.lock();
        state.check_lost()?;
        let uploads = std::mem::take(&mut state.staging);
        let count = uploads.len();
        for upload in uploads {
            match upload.target {
                ResourceKey::Buffer(buffer) => state.buffer_mut(buffer)?.write(upload.offset, &upload.data)?,
                ResourceKey::Texture(texture) => state.texture_mut(texture)?.write(&upload.data)?,
            }
            state.unflushed.remove(&upload.target);
            state.invisible.insert(upload.target);
        }
        state.stats.staged_uploads += count as u64;
        Ok(count)
    }

    fn create_fence(&self, name: &str, signaled: bool) -> Result<FenceHandle, DeviceError> {
        let mut state = self.state.lock();
        let handle = FenceHandle(state.allocate_handle());
        state.fences.insert(
            handle,
            SoftFence {
                name: name.to_owned(),
                signaled,
            },
        );
        Ok(handle)
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        if self.state.lock().fences.remove(&fence).is_none() {
            warn!(%fence, "destroying unknown fence");
        }
    }

    fn wait_for_fence(&self, fence: FenceHandle) -> Result<(), DeviceError> {
        scope!("software::wait_for_fence");

        let mut state = self.state.lock();
        state.stats.fence_waits += 1;
        loop {
            state.check_lost()?;
            let signaled = state
                .fences
                .get(&fence)
                .ok_or_else(|| DeviceError::InvalidHandle(fence.to_string()))?
                .signaled;
            if signaled {
                return Ok(());
            }
            self.queue_progress.wait(&mut state);
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let pending = state.queue.iter().any(|op| op.signals_fence(fence));
        let entry = state
            .fences
            .get_mut(&fence)
            .ok_or_else(|| DeviceError::InvalidHandle(fence.to_string()))?;
        if pending {
            return Err(DeviceError::InvalidCommand {
                name: entry.name.clone(),
                reason: "fence reset while a pending submission signals it".to_owned(),
            });
        }
        entry.signaled = false;
        Ok(())
    }

    fn create_semaphore(&self, name: &str) -> Result<SemaphoreHandle, DeviceError> {
        let mut state = self.state.lock();
        let handle = SemaphoreHandle(state.allocate_handle());
        state.semaphores.insert(
            handle,
            SoftSemaphore {
                name: name.to_owned(),
                signaled: false,
            },
        );
        Ok(handle)
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        if self.state.lock().semaphores.remove(&semaphore).is_none() {
            warn!(%semaphore, "destroying unknown semaphore");
        }
    }

    fn create_command_pool(&self, name: &str) -> Result<CommandPoolHandle, DeviceError> {
        let mut state = self.state.lock();
        let handle = CommandPoolHandle(state.allocate_handle());
        state.command_pools.insert(
            handle,
            SoftCommandPool {
                name: name.to_owned(),
                lists: vec![],
                pending: 0,
            },
        );
        Ok(handle)
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        let mut state = self.state.lock();
        match state.command_pools.remove(&pool) {
            Some(pool) => pool.lists.iter().for_each(|list| {
                state.command_lists.remove(list);
            }),
            None => warn!(%pool, "destroying unknown command pool"),
        }
    }

    fn reset_command_pool(&self, pool: CommandPoolHandle) -> Result<(), DeviceError> {
        scope!("software::reset_command_pool");

        let mut state = self.state.lock();
        let entry = state
            .command_pools
            .get_mut(&pool)
            .ok_or_else(|| DeviceError::InvalidHandle(pool.to_string()))?;
        if entry.pending > 0 {
            return Err(DeviceError::InvalidCommand {
                name: entry.name.clone(),
                reason: format!("reset while {} submissions are pending", entry.pending),
            });
        }
        let lists = std::mem::take(&mut entry.lists);
        lists.iter().for_each(|list| {
            state.command_lists.remove(list);
        });
        state.stats.command_pool_resets += 1;
        Ok(())
    }

    fn allocate_command_list(&self, pool: CommandPoolHandle, name: &str) -> Result<CommandListHandle, DeviceError> {
        let mut state = self.state.lock();
        let handle = CommandListHandle(state.allocate_handle());
        state
            .command_pools
            .get_mut(&pool)
            .ok_or_else(|| DeviceError::InvalidHandle(pool.to_string()))?
            .lists
            .push(handle);
        state.command_lists.insert(
            handle,
            SoftCommandList {
                name: name.to_owned(),
                pool,
                state: ListState::Initial,
                commands: vec![],
            },
        );
        Ok(handle)
    }

    fn begin_command_list(&self, list: CommandListHandle) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let entry = state
            .command_lists
            .get_mut(&list)
            .ok_or_else(|| DeviceError::InvalidHandle(list.to_string()))?;
        if entry.state != ListState::Initial {
            return Err(DeviceError::CommandListState {
                name: entry.name.clone(),
                expected: ListState::Initial.name(),
                actual: entry.state.name(),
            });
        }
        entry.state = ListState::Recording;
        Ok(())
    }

    fn record(&self, list: CommandListHandle, command: Command) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let entry = state
            .command_lists
            .get_mut(&list)
            .ok_or_else(|| DeviceError::InvalidHandle(list.to_string()))?;
        if entry.state != ListState::Recording {
            return Err(DeviceError::CommandListState {
                name: entry.name.clone(),
                expected: ListState::Recording.name(),
                actual: entry.state.name(),
            });
        }
        entry.commands.push(command);
        Ok(())
    }

    fn end_command_list(&self, list: CommandListHandle) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let entry = state
            .command_lists
            .get_mut(&list)
            .ok_or_else(|| DeviceError::InvalidHandle(list.to_string()))?;
        if entry.state != ListState::Recording {
            return Err(DeviceError::CommandListState {
                name: entry.name.clone(),
                expected: ListState::Recording.name(),
                actual: entry.state.name(),
            });
        }
        entry.state = ListState::Executable;
        Ok(())
    }

    fn submit(&self, submission: &Submission) -> Result<(), DeviceError> {
        scope!("software::submit");

        let pending = {
            let mut state = self.state.lock();
            if let Some(fence) = submission.fence {
                let fence = state
                    .fences
                    .get(&fence)
                    .ok_or_else(|| DeviceError::InvalidHandle(fence.to_string()))?;
                if fence.signaled {
                    return Err(DeviceError::InvalidCommand {
                        name: fence.name.clone(),
                        reason: "submitted with a fence that was not reset".to_owned(),
                    });
                }
            }
            let entry = state
                .command_lists
                .get_mut(&submission.command_list)
                .ok_or_else(|| DeviceError::InvalidHandle(submission.command_list.to_string()))?;
            if entry.state != ListState::Executable {
                return Err(DeviceError::CommandListState {
                    name: entry.name.clone(),
                    expected: ListState::Executable.name(),
                    actual: entry.state.name(),
                });
            }
            entry.state = ListState::Submitted;
            let pending = PendingSubmission {
                list: submission.command_list,
                name: entry.name.clone(),
                pool: entry.pool,
                commands: entry.commands.clone(),
                wait_semaphore: submission.wait_semaphore,
                signal_semaphore: submission.signal_semaphore,
                fence: submission.fence,
            };
            if let Some(pool) = state.command_pools.get_mut(&pending.pool) {
                pool.pending += 1;
            }
            state.stats.submissions += 1;
            pending
        };

        self.enqueue(QueueOp::Submit(pending))
    }

    fn create_descriptor_pool(&self, name: &str) -> Result<DescriptorPoolHandle, DeviceError> {
        let mut state = self.state.lock();
        let handle = DescriptorPoolHandle(state.allocate_handle());
        state.descriptor_pools.insert(
            handle,
            SoftDescriptorPool {
                name: name.to_owned(),
                sets: vec![],
            },
        );
        Ok(handle)
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        let mut state = self.state.lock();
        match state.descriptor_pools.remove(&pool) {
            Some(pool) => pool.sets.iter().for_each(|set| {
                state.descriptor_sets.remove(set);
            }),
            None => warn!(%pool, "destroying unknown descriptor pool"),
        }
    }

    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let entry = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| DeviceError::InvalidHandle(pool.to_string()))?;
        let sets = std::mem::take(&mut entry.sets);
        sets.iter().for_each(|set| {
            state.descriptor_sets.remove(set);
        });
        state.stats.descriptor_pool_resets += 1;
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        set_index: u32,
        name: &str,
    ) -> Result<DescriptorSetHandle, DeviceError> {
        let mut state = self.state.lock();
        let handle = DescriptorSetHandle(state.allocate_handle());
        state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| DeviceError::InvalidHandle(pool.to_string()))?
            .sets
            .push(handle);
        state.descriptor_sets.insert(
            handle,
            SoftDescriptorSet {
                name: name.to_owned(),
                set_index,
                bindings: HashMap::new(),
            },
        );
        Ok(handle)
    }

    fn update_descriptor_set(&self, set: DescriptorSetHandle, writes: &[DescriptorWrite]) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let set_index = state.descriptor_set(set)?.set_index;
        for write in writes {
            state.validate_descriptor(set_index, write)?;
        }
        let entry = state
            .descriptor_sets
            .get_mut(&set)
            .ok_or_else(|| DeviceError::InvalidHandle(set.to_string()))?;
        for write in writes {
            entry.bindings.insert(write.binding, write.resource.clone());
        }
        Ok(())
    }

    fn compile_shader(&self, desc: &ShaderModuleDesc<'_>) -> Result<ShaderModule, DeviceError> {
        shader_compiler::compile(desc)
    }

    fn create_raster_pipeline(&self, desc: &RasterPipelineDesc<'_>) -> Result<PipelineHandle, DeviceError> {
        let invalid = |reason: &str| DeviceError::InvalidCreateInfo {
            name: desc.name.to_owned(),
            reason: reason.to_owned(),
        };
        if desc.vertex.stage != vk::ShaderStageFlags::VERTEX {
            return Err(invalid("vertex stage expected"));
        }
        if desc.fragment.stage != vk::ShaderStageFlags::FRAGMENT {
            return Err(invalid("fragment stage expected"));
        }

        let mut state = self.state.lock();
        let handle = PipelineHandle(state.allocate_handle());
        state.pipelines.insert(
            handle,
            SoftPipeline {
                name: desc.name.to_owned(),
                kind: PipelineKind::Raster {
                    color_format: desc.color_format,
                },
            },
        );
        Ok(handle)
    }

    fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc<'_>) -> Result<PipelineHandle, DeviceError> {
        let invalid = |reason: String| DeviceError::InvalidCreateInfo {
            name: desc.name.to_owned(),
            reason,
        };
        if desc.raygen.stage != vk::ShaderStageFlags::RAYGEN_KHR {
            return Err(invalid(format!("{} is not a ray generation shader", desc.raygen.entry)));
        }
        if let Some(module) = desc.miss.iter().find(|m| m.stage != vk::ShaderStageFlags::MISS_KHR) {
            return Err(invalid(format!("{} is not a miss shader", module.entry)));
        }
        if let Some(module) = desc
            .closest_hit_groups
            .iter()
            .find(|m| m.stage != vk::ShaderStageFlags::CLOSEST_HIT_KHR)
        {
            return Err(invalid(format!("{} is not a closest hit shader", module.entry)));
        }
        if desc.miss.is_empty() || desc.closest_hit_groups.is_empty() {
            return Err(invalid("at least one miss shader and hit group are required".to_owned()));
        }
        if desc.max_recursion_depth == 0 || desc.max_payload_size == 0 {
            return Err(invalid("recursion depth and payload size must be non zero".to_owned()));
        }
        // triangle hits report two barycentrics, 32 bytes is the smallest limit devices guarantee
        if desc.max_attribute_size < 8 || desc.max_attribute_size > 32 {
            return Err(invalid(format!(
                "hit attributes of {} bytes cannot carry triangle barycentrics",
                desc.max_attribute_size
            )));
        }
        if desc.bindless_capacity == 0 {
            return Err(invalid("bindless arrays need at least one slot".to_owned()));
        }

        let mut state = self.state.lock();
        let handle = PipelineHandle(state.allocate_handle());
        state.pipelines.insert(
            handle,
            SoftPipeline {
                name: desc.name.to_owned(),
                kind: PipelineKind::RayTracing {
                    bindless_capacity: desc.bindless_capacity,
                },
            },
        );
        Ok(handle)
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        if self.state.lock().pipelines.remove(&pipeline).is_none() {
            warn!(%pipeline, "destroying unknown pipeline");
        }
    }

    fn create_bottom_level(
        &self,
        name: &str,
        geometries: &[GeometryDesc],
    ) -> Result<AccelerationStructureHandle, DeviceError> {
        geometries
            .iter()
            .try_for_each(|geometry| geometry::validate_geometry(name, geometry))?;

        let mut state = self.state.lock();
        for geometry in geometries {
            state.buffer(geometry.index_buffer)?;
            state.buffer(geometry.vertex_buffer)?;
        }
        let handle = AccelerationStructureHandle(state.allocate_handle());
        state.acceleration_structures.insert(
            handle,
            SoftAccelerationStructure {
                name: name.to_owned(),
                kind: AccelerationKind::Bottom {
                    geometries: geometries.to_vec(),
                    built: None,
                },
            },
        );
        Ok(handle)
    }

    fn create_top_level(
        &self,
        name: &str,
        instances: &[InstanceDesc],
    ) -> Result<AccelerationStructureHandle, DeviceError> {
        let mut state = self.state.lock();
        if let Some(instance) = instances
            .iter()
            .find(|instance| !state.acceleration_structures.contains_key(&instance.blas))
        {
            return Err(DeviceError::InvalidHandle(instance.blas.to_string()));
        }
        let handle = AccelerationStructureHandle(state.allocate_handle());
        state.acceleration_structures.insert(
            handle,
            SoftAccelerationStructure {
                name: name.to_owned(),
                kind: AccelerationKind::Top {
                    instances: instances.to_vec(),
                    built: None,
                },
            },
        );
        Ok(handle)
    }

    fn destroy_acceleration_structure(&self, accel: AccelerationStructureHandle) {
        if self.state.lock().acceleration_structures.remove(&accel).is_none() {
            warn!(%accel, "destroying unknown acceleration structure");
        }
    }

    fn swapchain_extent(&self) -> vk::Extent2D {
        self.state.lock().swapchain.extent
    }

    fn swapchain_format(&self) -> vk::Format {
        self.state.lock().swapchain.format
    }

    fn swapchain_images(&self) -> Vec<TextureHandle> {
        self.state.lock().swapchain.images.clone()
    }

    fn acquire_next_image(&self, signal: SemaphoreHandle) -> Result<u32, DeviceError> {
        let mut state = self.state.lock();
        state.check_lost()?;
        let semaphore = state
            .semaphores
            .get(&signal)
            .ok_or_else(|| DeviceError::InvalidHandle(signal.to_string()))?;
        if semaphore.signaled {
            return Err(DeviceError::SemaphoreProtocol {
                name: semaphore.name.clone(),
                reason: "signaled again before anything waited on it".to_owned(),
            });
        }

        let count = state.swapchain.images.len() as u32;
        let start = state.swapchain.next;
        let index = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&ix| !state.swapchain.acquired[ix as usize])
            .ok_or(DeviceError::SwapchainExhausted)?;
        state.swapchain.acquired[index as usize] = true;
        state.swapchain.next = (index + 1) % count;
        if let Some(semaphore) = state.semaphores.get_mut(&signal) {
            semaphore.signaled = true;
        }
        Ok(index)
    }

    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> Result<(), DeviceError> {
        {
            let state = self.state.lock();
            match state.swapchain.acquired.get(image_index as usize) {
                Some(true) => {}
                Some(false) => {
                    return Err(DeviceError::InvalidCommand {
                        name: format!("Swapchain image - {}", image_index),
                        reason: "presented without being acquired".to_owned(),
                    })
                }
                None => return Err(DeviceError::InvalidHandle(format!("swapchain image {}", image_index))),
            }
            if !state.semaphores.contains_key(&wait) {
                return Err(DeviceError::InvalidHandle(wait.to_string()));
            }
        }

        self.enqueue(QueueOp::Present { image_index, wait })
    }

    fn recreate_swapchain(&self, extent: vk::Extent2D) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if !state.queue.is_empty() {
            return Err(DeviceError::InvalidCommand {
                name: "swapchain".to_owned(),
                reason: "recreated while queued work may reference its images".to_owned(),
            });
        }
        let old = std::mem::take(&mut state.swapchain);
        old.images.iter().for_each(|image| {
            state.textures.remove(image);
        });
        state.create_swapchain_images(extent, old.images.len() as u32, old.format)?;
        debug!(width = extent.width, height = extent.height, "recreated swapchain");
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), DeviceError> {
        scope!("software::wait_idle");

        let mut state = self.state.lock();
        loop {
            state.check_lost()?;
            if state.queue.is_empty() {
                return Ok(());
            }
            self.queue_progress.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::device::{CommandRecorder, MemoryBarrier};

    fn triangle_geometry(device: &SoftwareDevice) -> GeometryDesc {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        let index_buffer = device
            .create_buffer(&BufferDesc {
                name: "indices",
                size: 12,
                usage,
                location: MemoryLocation::GpuOnly,
            })
            .unwrap();
        let vertex_buffer = device
            .create_buffer(&BufferDesc {
                name: "positions",
                size: 36,
                usage,
                location: MemoryLocation::GpuOnly,
            })
            .unwrap();
        let positions: [[f32; 3]; 3] = [[0.0, 0.0, 1.0], [1.0, 0.0, 1.0], [0.0, 1.0, 1.0]];
        device
            .stage_buffer_upload(index_buffer, 0, bytemuck::cast_slice(&[0u32, 1, 2]))
            .unwrap();
        device
            .stage_buffer_upload(vertex_buffer, 0, bytemuck::cast_slice(&positions))
            .unwrap();

        GeometryDesc {
            index_buffer,
            index_offset: 0,
            index_type: vk::IndexType::UINT32,
            vertex_buffer,
            vertex_offset: 0,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            vertex_stride: 12,
            triangle_count: 1,
            flags: vk::GeometryFlagsKHR::OPAQUE,
        }
    }

    fn submit_build(device: &SoftwareDevice, blas: AccelerationStructureHandle, barrier: bool) {
        let pool = device.create_command_pool("build pool").unwrap();
        let list = device.allocate_command_list(pool, "build").unwrap();
        let recorder = CommandRecorder::begin(device, list).unwrap();
        if barrier {
            recorder.barrier(MemoryBarrier::UPLOAD_TO_CONSUMERS).unwrap();
        }
        recorder.build_acceleration_structure(blas).unwrap();
        let list = recorder.end().unwrap();
        device
            .submit(&Submission {
                command_list: list,
                wait_semaphore: None,
                signal_semaphore: None,
                fence: None,
            })
            .unwrap();
    }

    #[test]
    fn unflushed_upload_loses_the_device() {
        let device = SoftwareDevice::new(&Default::default()).unwrap();
        let geometry = triangle_geometry(&device);
        let blas = device.create_bottom_level("blas", &[geometry]).unwrap();

        submit_build(&device, blas, true);
        assert!(matches!(device.lost(), Some(DeviceError::UnflushedUpload { ref name }) if name == "indices"));
        assert!(matches!(device.flush_staging(), Err(DeviceError::DeviceLost(_))));
    }

    #[test]
    fn flushed_upload_still_needs_a_barrier() {
        let device = SoftwareDevice::new(&Default::default()).unwrap();
        let geometry = triangle_geometry(&device);
        let blas = device.create_bottom_level("blas", &[geometry]).unwrap();
        assert_eq!(device.flush_staging().unwrap(), 2);

        submit_build(&device, blas, false);
        assert!(matches!(device.lost(), Some(DeviceError::UploadHazard { .. })));
        assert_eq!(device.stats().acceleration_structure_builds, 0);
    }

    #[test]
    fn flush_and_barrier_make_uploads_visible() {
        let device = SoftwareDevice::new(&Default::default()).unwrap();
        let geometry = triangle_geometry(&device);
        let blas = device.create_bottom_level("blas", &[geometry]).unwrap();
        device.flush_staging().unwrap();

        submit_build(&device, blas, true);
        assert!(device.lost().is_none());
        assert_eq!(device.built_geometry_count(blas), Some(1));
        assert_eq!(device.stats().acceleration_structure_builds, 1);
    }

    #[test]
    fn non_opaque_geometry_is_rejected() {
        let device = SoftwareDevice::new(&Default::default()).unwrap();
        let geometry = GeometryDesc {
            flags: vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION,
            ..triangle_geometry(&device)
        };
        assert!(matches!(
            device.create_bottom_level("blas", &[geometry]),
            Err(DeviceError::InvalidCreateInfo { .. })
        ));
    }

    #[test]
    fn hit_attributes_must_hold_barycentrics() {
        let device = SoftwareDevice::new(&Default::default()).unwrap();
        let module = |entry: &str, stage| ShaderModule {
            entry: entry.to_owned(),
            stage,
            defines: vec![],
        };
        let raygen = module("RayGen", vk::ShaderStageFlags::RAYGEN_KHR);
        let miss = module("Miss", vk::ShaderStageFlags::MISS_KHR);
        let hit = module("ClosestHit", vk::ShaderStageFlags::CLOSEST_HIT_KHR);
        let misses = [&miss];
        let hits = [&hit];
        let desc = RayTracingPipelineDesc {
            name: "rt",
            raygen: &raygen,
            miss: &misses,
            closest_hit_groups: &hits,
            max_payload_size: 16,
            max_attribute_size: 8,
            max_recursion_depth: 1,
            bindless_capacity: 4,
        };

        for max_attribute_size in [4, 64] {
            assert!(device
                .create_ray_tracing_pipeline(&RayTracingPipelineDesc {
                    max_attribute_size,
                    ..desc
                })
                .is_err());
        }
        let pipeline = device.create_ray_tracing_pipeline(&desc).unwrap();
        device.destroy_pipeline(pipeline);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn pending_lists_block_pool_resets() {
        let device = SoftwareDevice::new(&Default::default()).unwrap();
        let pool = device.create_command_pool("pool").unwrap();
        let list = device.allocate_command_list(pool, "list").unwrap();
        let list = CommandRecorder::begin(&*device, list).unwrap().end().unwrap();

        device.stall_queue();
        device
            .submit(&Submission {
                command_list: list,
                wait_semaphore: None,
                signal_semaphore: None,
                fence: None,
            })
            .unwrap();
        assert_eq!(device.pending_queue_ops(), 1);
        assert!(device.reset_command_pool(pool).is_err());

        device.resume_queue();
        assert_eq!(device.pending_queue_ops(), 0);
        device.reset_command_pool(pool).unwrap();
        assert!(matches!(device.begin_command_list(list), Err(DeviceError::InvalidHandle(_))));
    }

    #[test]
    fn presenting_requires_an_acquired_image_in_present_layout() {
        let device = SoftwareDevice::new(&Default::default()).unwrap();
        let acquired = device.create_semaphore("acquired").unwrap();
        assert!(device.present(0, acquired).is_err());

        let index = device.acquire_next_image(acquired).unwrap();
        assert!(device.acquire_next_image(acquired).is_err());
        device.present(index, acquired).unwrap();
        assert!(device.lost().is_none());
        assert_eq!(device.stats().presents, 1);
        assert!(device.capture_last_present().is_some());
    }
}
