use ash::vk;
use profiling::scope;

use super::{
    AccelerationStructureHandle, BufferHandle, CommandListHandle, DescriptorSetHandle, Device, DeviceError,
    PipelineHandle, TextureHandle,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MemoryBarrier {
    pub(crate) src_stage: vk::PipelineStageFlags,
    pub(crate) src_access: vk::AccessFlags,
    pub(crate) dst_stage: vk::PipelineStageFlags,
    pub(crate) dst_access: vk::AccessFlags,
}

impl MemoryBarrier {
    /// Staged uploads → acceleration structure builds and ray tracing shader reads.
    pub(crate) const UPLOAD_TO_CONSUMERS: MemoryBarrier = MemoryBarrier {
        src_stage: vk::PipelineStageFlags::TRANSFER,
        src_access: vk::AccessFlags::TRANSFER_WRITE,
        dst_stage: vk::PipelineStageFlags::from_raw(
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR.as_raw()
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR.as_raw(),
        ),
        dst_access: vk::AccessFlags::from_raw(
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR.as_raw() | vk::AccessFlags::SHADER_READ.as_raw(),
        ),
    };

    /// Bottom level builds → top level build.
    pub(crate) const BLAS_TO_TLAS: MemoryBarrier = MemoryBarrier {
        src_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        src_access: vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        dst_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        dst_access: vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
    };

    /// Top level build → traversal.
    pub(crate) const TLAS_TO_TRACE: MemoryBarrier = MemoryBarrier {
        src_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        src_access: vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        dst_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        dst_access: vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
    };

    /// Buffer fills → ray tracing shader reads and writes.
    pub(crate) const FILL_TO_TRACE: MemoryBarrier = MemoryBarrier {
        src_stage: vk::PipelineStageFlags::TRANSFER,
        src_access: vk::AccessFlags::TRANSFER_WRITE,
        dst_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        dst_access: vk::AccessFlags::from_raw(
            vk::AccessFlags::SHADER_READ.as_raw() | vk::AccessFlags::SHADER_WRITE.as_raw(),
        ),
    };

    pub(crate) fn makes_transfers_visible(&self) -> bool {
        self.src_access.contains(vk::AccessFlags::TRANSFER_WRITE)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Command {
    PipelineBarrier(MemoryBarrier),
    TransitionImage {
        texture: TextureHandle,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },
    FillBuffer {
        buffer: BufferHandle,
        value: u32,
    },
    BuildAccelerationStructure(AccelerationStructureHandle),
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineHandle,
    },
    BindDescriptorSet {
        bind_point: vk::PipelineBindPoint,
        index: u32,
        set: DescriptorSetHandle,
    },
    TraceRays {
        width: u32,
        height: u32,
    },
    BeginRenderPass {
        target: TextureHandle,
    },
    Draw {
        vertex_count: u32,
    },
    EndRenderPass,
}

/// A command list between `begin` and `end`.
pub(crate) struct CommandRecorder<'d> {
    device: &'d Device,
    handle: CommandListHandle,
}

impl<'d> CommandRecorder<'d> {
    pub(crate) fn begin(device: &'d Device, handle: CommandListHandle) -> Result<CommandRecorder<'d>, DeviceError> {
        scope!("commands::begin");

        device.begin_command_list(handle)?;
        Ok(CommandRecorder { device, handle })
    }

    pub(crate) fn barrier(&self, barrier: MemoryBarrier) -> Result<(), DeviceError> {
        self.device.record(self.handle, Command::PipelineBarrier(barrier))
    }

    pub(crate) fn transition(
        &self,
        texture: TextureHandle,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    ) -> Result<(), DeviceError> {
        self.device
            .record(self.handle, Command::TransitionImage { texture, from, to })
    }

    pub(crate) fn fill_buffer(&self, buffer: BufferHandle, value: u32) -> Result<(), DeviceError> {
        self.device.record(self.handle, Command::FillBuffer { buffer, value })
    }

    pub(crate) fn build_acceleration_structure(&self, accel: AccelerationStructureHandle) -> Result<(), DeviceError> {
        self.device
            .record(self.handle, Command::BuildAccelerationStructure(accel))
    }

    pub(crate) fn bind_pipeline(
        &self,
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineHandle,
    ) -> Result<(), DeviceError> {
        self.device
            .record(self.handle, Command::BindPipeline { bind_point, pipeline })
    }

    pub(crate) fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        sets: &[DescriptorSetHandle],
    ) -> Result<(), DeviceError> {
        sets.iter().enumerate().try_for_each(|(index, &set)| {
            self.device.record(
                self.handle,
                Command::BindDescriptorSet {
                    bind_point,
                    index: index as u32,
                    set,
                },
            )
        })
    }

    pub(crate) fn trace_rays(&self, width: u32, height: u32) -> Result<(), DeviceError> {
        self.device.record(self.handle, Command::TraceRays { width, height })
    }

    /// Records a render pass drawing `vertex_count` vertices into `target`.
    pub(crate) fn render_pass(&self, target: TextureHandle, vertex_count: u32) -> Result<(), DeviceError> {
        self.device.record(self.handle, Command::BeginRenderPass { target })?;
        self.device.record(self.handle, Command::Draw { vertex_count })?;
        self.device.record(self.handle, Command::EndRenderPass)
    }

    pub(crate) fn end(self) -> Result<CommandListHandle, DeviceError> {
        scope!("commands::end");

        self.device.end_command_list(self.handle)?;
        Ok(self.handle)
    }
}
