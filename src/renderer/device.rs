use std::{fmt, path::Path};

use ash::vk;
use thiserror::Error;

mod commands;
mod per_flight;
pub(crate) mod software;

pub(crate) use self::{
    commands::{Command, CommandRecorder, MemoryBarrier},
    per_flight::PerFlight,
    software::{SoftwareDevice, SoftwareDeviceConfig},
};

/// The capability surface the renderer programs against.
///
/// Mirrors the shape of a Vulkan device: objects are opaque handles, command lists are recorded
/// and submitted explicitly, and nothing is ordered unless a barrier, semaphore or fence says so.
pub(crate) type Device = dyn GpuBackend;

macro_rules! define_handles {
    ($($name:ident),+ $(,)?) => {
        $(
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub(crate) struct $name(pub(crate) u64);

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}({})", stringify!($name), self.0)
                }
            }
        )+
    };
}

define_handles!(
    BufferHandle,
    TextureHandle,
    SamplerHandle,
    FenceHandle,
    SemaphoreHandle,
    CommandPoolHandle,
    CommandListHandle,
    DescriptorPoolHandle,
    DescriptorSetHandle,
    PipelineHandle,
    AccelerationStructureHandle,
);

#[derive(Error, Debug, Clone, PartialEq)]
pub(crate) enum DeviceError {
    /// The handle was never created, was destroyed, or was invalidated by a pool reset.
    #[error("{0} is not a live object")]
    InvalidHandle(String),
    #[error("{name}: {reason}")]
    InvalidCreateInfo { name: String, reason: String },
    #[error("{name}: access of {len} bytes at offset {offset} exceeds size {size}")]
    OutOfBounds { name: String, offset: u64, len: u64, size: u64 },
    #[error("{name} is not host visible")]
    NotHostVisible { name: String },
    /// A resource was consumed while a staged upload to it was still pending.
    #[error("{name} has a pending staged upload that was never flushed")]
    UnflushedUpload { name: String },
    /// A resource was consumed after its upload was flushed but before a transfer barrier.
    #[error("{name} was read without a barrier after its staged upload")]
    UploadHazard { name: String },
    #[error("{name} is in layout {actual:?}, expected {expected:?}")]
    LayoutMismatch {
        name: String,
        expected: vk::ImageLayout,
        actual: vk::ImageLayout,
    },
    #[error("descriptor set {set} binding {binding}: {reason}")]
    InvalidDescriptor { set: u32, binding: u32, reason: String },
    #[error("{name} is bound as both an input and an output of one dispatch")]
    AliasedBinding { name: String },
    #[error("{name}: {reason}")]
    SemaphoreProtocol { name: String, reason: String },
    #[error("{name} is {actual}, expected {expected}")]
    CommandListState {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("{name}: {reason}")]
    InvalidCommand { name: String, reason: String },
    #[error("{path}: {reason}")]
    ShaderCompilation { path: String, reason: String },
    #[error("every swapchain image is already acquired")]
    SwapchainExhausted,
    #[error("device lost: {0}")]
    DeviceLost(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MemoryLocation {
    GpuOnly,
    CpuToGpu,
}

pub(crate) struct BufferDesc<'a> {
    pub(crate) name: &'a str,
    pub(crate) size: u64,
    pub(crate) usage: vk::BufferUsageFlags,
    pub(crate) location: MemoryLocation,
}

pub(crate) struct TextureDesc<'a> {
    pub(crate) name: &'a str,
    pub(crate) extent: vk::Extent2D,
    pub(crate) format: vk::Format,
    pub(crate) usage: vk::ImageUsageFlags,
    pub(crate) initial_layout: vk::ImageLayout,
}

/// Triangle geometry input of a bottom level acceleration structure.
#[derive(Clone, Debug)]
pub(crate) struct GeometryDesc {
    pub(crate) index_buffer: BufferHandle,
    pub(crate) index_offset: u64,
    pub(crate) index_type: vk::IndexType,
    pub(crate) vertex_buffer: BufferHandle,
    pub(crate) vertex_offset: u64,
    pub(crate) vertex_format: vk::Format,
    pub(crate) vertex_stride: u64,
    pub(crate) triangle_count: u32,
    pub(crate) flags: vk::GeometryFlagsKHR,
}

#[derive(Clone, Debug)]
pub(crate) struct InstanceDesc {
    pub(crate) blas: AccelerationStructureHandle,
    pub(crate) custom_index: u32,
    pub(crate) mask: u8,
    /// Row-major 3x4 object to world transform.
    pub(crate) transform: [[f32; 4]; 3],
}

impl InstanceDesc {
    pub(crate) const IDENTITY: [[f32; 4]; 3] = [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]];
}

pub(crate) struct ShaderModuleDesc<'a> {
    pub(crate) path: &'a Path,
    pub(crate) source: &'a str,
    pub(crate) entry: &'a str,
    pub(crate) stage: vk::ShaderStageFlags,
    pub(crate) defines: &'a [String],
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ShaderModule {
    pub(crate) entry: String,
    pub(crate) stage: vk::ShaderStageFlags,
    pub(crate) defines: Vec<String>,
}

pub(crate) struct RasterPipelineDesc<'a> {
    pub(crate) name: &'a str,
    pub(crate) vertex: &'a ShaderModule,
    pub(crate) fragment: &'a ShaderModule,
    pub(crate) color_format: vk::Format,
}

pub(crate) struct RayTracingPipelineDesc<'a> {
    pub(crate) name: &'a str,
    pub(crate) raygen: &'a ShaderModule,
    pub(crate) miss: &'a [&'a ShaderModule],
    pub(crate) closest_hit_groups: &'a [&'a ShaderModule],
    pub(crate) max_payload_size: u32,
    pub(crate) max_attribute_size: u32,
    pub(crate) max_recursion_depth: u32,
    /// Length every bindless array bound to this pipeline must have.
    pub(crate) bindless_capacity: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum DescriptorResource {
    UniformBuffer(BufferHandle),
    ReadOnlyStorageBuffer(BufferHandle),
    StorageBuffer(BufferHandle),
    StorageImage(TextureHandle),
    SampledImage(TextureHandle),
    Sampler(SamplerHandle),
    AccelerationStructure(AccelerationStructureHandle),
    SampledImageArray(Vec<TextureHandle>),
    StorageBufferArray(Vec<BufferHandle>),
}

impl DescriptorResource {
    pub(crate) fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            DescriptorResource::UniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorResource::ReadOnlyStorageBuffer(_)
            | DescriptorResource::StorageBuffer(_)
            | DescriptorResource::StorageBufferArray(_) => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorResource::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorResource::SampledImage(_) | DescriptorResource::SampledImageArray(_) => {
                vk::DescriptorType::SAMPLED_IMAGE
            }
            DescriptorResource::Sampler(_) => vk::DescriptorType::SAMPLER,
            DescriptorResource::AccelerationStructure(_) => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct DescriptorWrite {
    pub(crate) binding: u32,
    pub(crate) resource: DescriptorResource,
}

pub(crate) struct Submission {
    pub(crate) command_list: CommandListHandle,
    pub(crate) wait_semaphore: Option<SemaphoreHandle>,
    pub(crate) signal_semaphore: Option<SemaphoreHandle>,
    pub(crate) fence: Option<FenceHandle>,
}

pub(crate) trait GpuBackend: Send + Sync {
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferHandle, DeviceError>;
    fn destroy_buffer(&self, buffer: BufferHandle);
    /// Writes through the persistent mapping of a `CpuToGpu` buffer.
    fn write_mapped(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError>;

    fn create_texture(&self, desc: &TextureDesc<'_>) -> Result<TextureHandle, DeviceError>;
    fn destroy_texture(&self, texture: TextureHandle);
    fn create_sampler(&self, name: &str) -> Result<SamplerHandle, DeviceError>;
    fn destroy_sampler(&self, sampler: SamplerHandle);

    /// Queues a copy into a device local buffer. Not visible to any command until
    /// [`GpuBackend::flush_staging`] runs and a transfer barrier is recorded.
    fn stage_buffer_upload(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError>;
    fn stage_texture_upload(&self, texture: TextureHandle, data: &[u8]) -> Result<(), DeviceError>;
    /// Submits every pending upload, returns how many were flushed.
    fn flush_staging(&self) -> Result<usize, DeviceError>;

    fn create_fence(&self, name: &str, signaled: bool) -> Result<FenceHandle, DeviceError>;
    fn destroy_fence(&self, fence: FenceHandle);
    /// Blocks until the fence signals. There is no timeout.
    fn wait_for_fence(&self, fence: FenceHandle) -> Result<(), DeviceError>;
    fn reset_fence(&self, fence: FenceHandle) -> Result<(), DeviceError>;
    fn create_semaphore(&self, name: &str) -> Result<SemaphoreHandle, DeviceError>;
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    fn create_command_pool(&self, name: &str) -> Result<CommandPoolHandle, DeviceError>;
    fn destroy_command_pool(&self, pool: CommandPoolHandle);
    /// Invalidates every command list allocated from the pool.
    fn reset_command_pool(&self, pool: CommandPoolHandle) -> Result<(), DeviceError>;
    fn allocate_command_list(&self, pool: CommandPoolHandle, name: &str) -> Result<CommandListHandle, DeviceError>;
    fn begin_command_list(&self, list: CommandListHandle) -> Result<(), DeviceError>;
    fn record(&self, list: CommandListHandle, command: Command) -> Result<(), DeviceError>;
    fn end_command_list(&self, list: CommandListHandle) -> Result<(), DeviceError>;
    fn submit(&self, submission: &Submission) -> Result<(), DeviceError>;

    fn create_descriptor_pool(&self, name: &str) -> Result<DescriptorPoolHandle, DeviceError>;
    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);
    /// Frees every descriptor set allocated from the pool.
    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> Result<(), DeviceError>;
    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        set_index: u32,
        name: &str,
    ) -> Result<DescriptorSetHandle, DeviceError>;
    fn update_descriptor_set(&self, set: DescriptorSetHandle, writes: &[DescriptorWrite]) -> Result<(), DeviceError>;

    fn compile_shader(&self, desc: &ShaderModuleDesc<'_>) -> Result<ShaderModule, DeviceError>;
    fn create_raster_pipeline(&self, desc: &RasterPipelineDesc<'_>) -> Result<PipelineHandle, DeviceError>;
    fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc<'_>) -> Result<PipelineHandle, DeviceError>;
    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    fn create_bottom_level(
        &self,
        name: &str,
        geometries: &[GeometryDesc],
    ) -> Result<AccelerationStructureHandle, DeviceError>;
    fn create_top_level(
        &self,
        name: &str,
        instances: &[InstanceDesc],
    ) -> Result<AccelerationStructureHandle, DeviceError>;
    fn destroy_acceleration_structure(&self, accel: AccelerationStructureHandle);

    fn swapchain_extent(&self) -> vk::Extent2D;
    fn swapchain_format(&self) -> vk::Format;
    fn swapchain_images(&self) -> Vec<TextureHandle>;
    /// Returns the index of the next presentable image and signals `signal` once it is usable.
    fn acquire_next_image(&self, signal: SemaphoreHandle) -> Result<u32, DeviceError>;
    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> Result<(), DeviceError>;
    /// Callers must make sure no submitted work references the old images.
    fn recreate_swapchain(&self, extent: vk::Extent2D) -> Result<(), DeviceError>;

    fn wait_idle(&self) -> Result<(), DeviceError>;
}
