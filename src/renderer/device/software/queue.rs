use ash::vk;
use hashbrown::HashMap;
use profiling::scope;
use tracing::error;

use super::{ListState, PipelineKind, ResourceKey, State};
use crate::renderer::device::{
    Command, CommandListHandle, CommandPoolHandle, DescriptorSetHandle, DeviceError, FenceHandle, PipelineHandle,
    SemaphoreHandle, TextureHandle,
};

pub(super) struct PendingSubmission {
    pub(super) list: CommandListHandle,
    pub(super) name: String,
    pub(super) pool: CommandPoolHandle,
    pub(super) commands: Vec<Command>,
    pub(super) wait_semaphore: Option<SemaphoreHandle>,
    pub(super) signal_semaphore: Option<SemaphoreHandle>,
    pub(super) fence: Option<FenceHandle>,
}

pub(super) enum QueueOp {
    Submit(PendingSubmission),
    Present { image_index: u32, wait: SemaphoreHandle },
}

impl QueueOp {
    pub(super) fn signals_fence(&self, fence: FenceHandle) -> bool {
        matches!(self, QueueOp::Submit(submission) if submission.fence == Some(fence))
    }
}

/// Bind state of one command list, it does not carry over between submissions.
#[derive(Default)]
pub(super) struct Bindings {
    pipelines: HashMap<vk::PipelineBindPoint, PipelineHandle>,
    sets: HashMap<(vk::PipelineBindPoint, u32), DescriptorSetHandle>,
    render_target: Option<TextureHandle>,
}

impl Bindings {
    pub(super) fn set(
        &self,
        bind_point: vk::PipelineBindPoint,
        index: u32,
    ) -> Result<DescriptorSetHandle, DeviceError> {
        self.sets
            .get(&(bind_point, index))
            .copied()
            .ok_or_else(|| DeviceError::InvalidDescriptor {
                set: index,
                binding: 0,
                reason: format!("no descriptor set bound at {:?}", bind_point),
            })
    }

    fn pipeline(&self, bind_point: vk::PipelineBindPoint, list: &str) -> Result<PipelineHandle, DeviceError> {
        self.pipelines
            .get(&bind_point)
            .copied()
            .ok_or_else(|| DeviceError::InvalidCommand {
                name: list.to_owned(),
                reason: format!("no {:?} pipeline bound", bind_point),
            })
    }
}

impl State {
    /// Executes queued work in order until the queue is empty, stalled or the device is lost.
    pub(super) fn drain_queue(&mut self) {
        while !self.stalled && self.lost.is_none() {
            let op = match self.queue.pop_front() {
                Some(op) => op,
                None => break,
            };
            let result = match op {
                QueueOp::Submit(submission) => self.execute_submission(submission),
                QueueOp::Present { image_index, wait } => self.execute_present(image_index, wait),
            };
            if let Err(err) = result {
                error!(%err, "software device lost");
                self.lost = Some(err);
                self.queue.clear();
            }
        }
    }

    fn signal_semaphore(&mut self, semaphore: SemaphoreHandle) -> Result<(), DeviceError> {
        let entry = self
            .semaphores
            .get_mut(&semaphore)
            .ok_or_else(|| DeviceError::InvalidHandle(semaphore.to_string()))?;
        if entry.signaled {
            return Err(DeviceError::SemaphoreProtocol {
                name: entry.name.clone(),
                reason: "signaled again before anything waited on it".to_owned(),
            });
        }
        entry.signaled = true;
        Ok(())
    }

    fn consume_semaphore(&mut self, semaphore: SemaphoreHandle, waiter: &str) -> Result<(), DeviceError> {
        let entry = self
            .semaphores
            .get_mut(&semaphore)
            .ok_or_else(|| DeviceError::InvalidHandle(semaphore.to_string()))?;
        if !entry.signaled {
            return Err(DeviceError::SemaphoreProtocol {
                name: entry.name.clone(),
                reason: format!("{} waits on it without a pending signal", waiter),
            });
        }
        entry.signaled = false;
        Ok(())
    }

    fn execute_submission(&mut self, submission: PendingSubmission) -> Result<(), DeviceError> {
        scope!("software::execute_submission");

        if let Some(wait) = submission.wait_semaphore {
            self.consume_semaphore(wait, &submission.name)?;
        }

        let mut bindings = Bindings::default();
        for command in &submission.commands {
            self.execute_command(&submission.name, &mut bindings, command)?;
        }
        if bindings.render_target.is_some() {
            return Err(DeviceError::InvalidCommand {
                name: submission.name,
                reason: "render pass was never ended".to_owned(),
            });
        }

        if let Some(signal) = submission.signal_semaphore {
            self.signal_semaphore(signal)?;
        }
        if let Some(fence) = submission.fence {
            self.fences
                .get_mut(&fence)
                .ok_or_else(|| DeviceError::InvalidHandle(fence.to_string()))?
                .signaled = true;
        }
        if let Some(pool) = self.command_pools.get_mut(&submission.pool) {
            pool.pending = pool.pending.saturating_sub(1);
        }
        if let Some(list) = self.command_lists.get_mut(&submission.list) {
            list.state = ListState::Executable;
        }
        self.stats.executed_submissions += 1;

        Ok(())
    }

    fn execute_present(&mut self, image_index: u32, wait: SemaphoreHandle) -> Result<(), DeviceError> {
        self.consume_semaphore(wait, "present")?;

        let image = *self
            .swapchain
            .images
            .get(image_index as usize)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("swapchain image {}", image_index)))?;
        let texture = self.texture(image)?;
        if texture.layout != vk::ImageLayout::PRESENT_SRC_KHR {
            return Err(DeviceError::LayoutMismatch {
                name: texture.name.clone(),
                expected: vk::ImageLayout::PRESENT_SRC_KHR,
                actual: texture.layout,
            });
        }

        self.swapchain.acquired[image_index as usize] = false;
        self.swapchain.last_presented = Some(image_index);
        self.stats.presents += 1;
        Ok(())
    }

    fn execute_command(&mut self, list: &str, bindings: &mut Bindings, command: &Command) -> Result<(), DeviceError> {
        match *command {
            Command::PipelineBarrier(barrier) => {
                if barrier.makes_transfers_visible() {
                    self.invisible.clear();
                }
                self.stats.barriers += 1;
            }
            Command::TransitionImage { texture, from, to } => {
                let texture = self.texture_mut(texture)?;
                if from != vk::ImageLayout::UNDEFINED && texture.layout != from {
                    return Err(DeviceError::LayoutMismatch {
                        name: texture.name.clone(),
                        expected: from,
                        actual: texture.layout,
                    });
                }
                texture.layout = to;
            }
            Command::FillBuffer { buffer, value } => {
                let entry = self.buffer_mut(buffer)?;
                if !entry.usage.contains(vk::BufferUsageFlags::TRANSFER_DST) {
                    return Err(DeviceError::InvalidCommand {
                        name: entry.name.clone(),
                        reason: "filled without TRANSFER_DST usage".to_owned(),
                    });
                }
                entry.fill(value);
                self.invisible.insert(ResourceKey::Buffer(buffer));
            }
            Command::BuildAccelerationStructure(accel) => self.build_acceleration_structure(accel)?,
            Command::BindPipeline { bind_point, pipeline } => {
                let entry = self.pipeline(pipeline)?;
                let compatible = match entry.kind {
                    PipelineKind::Raster { .. } => bind_point == vk::PipelineBindPoint::GRAPHICS,
                    PipelineKind::RayTracing { .. } => bind_point == vk::PipelineBindPoint::RAY_TRACING_KHR,
                };
                if !compatible {
                    return Err(DeviceError::InvalidCommand {
                        name: list.to_owned(),
                        reason: format!("{} cannot be bound at {:?}", entry.name, bind_point),
                    });
                }
                bindings.pipelines.insert(bind_point, pipeline);
            }
            Command::BindDescriptorSet { bind_point, index, set } => {
                let entry = self.descriptor_set(set)?;
                if entry.set_index != index {
                    return Err(DeviceError::InvalidDescriptor {
                        set: index,
                        binding: 0,
                        reason: format!("{} was allocated for set {}", entry.name, entry.set_index),
                    });
                }
                bindings.sets.insert((bind_point, index), set);
            }
            Command::TraceRays { width, height } => {
                let pipeline = bindings.pipeline(vk::PipelineBindPoint::RAY_TRACING_KHR, list)?;
                self.trace_rays(pipeline, bindings, width, height)?;
                self.stats.trace_dispatches += 1;
            }
            Command::BeginRenderPass { target } => {
                if bindings.render_target.is_some() {
                    return Err(DeviceError::InvalidCommand {
                        name: list.to_owned(),
                        reason: "render passes cannot nest".to_owned(),
                    });
                }
                let texture = self.texture(target)?;
                if texture.layout != vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
                    return Err(DeviceError::LayoutMismatch {
                        name: texture.name.clone(),
                        expected: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        actual: texture.layout,
                    });
                }
                bindings.render_target = Some(target);
            }
            Command::Draw { vertex_count } => {
                let target = bindings.render_target.ok_or_else(|| DeviceError::InvalidCommand {
                    name: list.to_owned(),
                    reason: "draw outside of a render pass".to_owned(),
                })?;
                if vertex_count != 3 {
                    return Err(DeviceError::InvalidCommand {
                        name: list.to_owned(),
                        reason: format!("only fullscreen triangles are rasterized, got {} vertices", vertex_count),
                    });
                }
                let pipeline = bindings.pipeline(vk::PipelineBindPoint::GRAPHICS, list)?;
                self.composite(pipeline, bindings, target)?;
                self.stats.draws += 1;
            }
            Command::EndRenderPass => {
                if bindings.render_target.take().is_none() {
                    return Err(DeviceError::InvalidCommand {
                        name: list.to_owned(),
                        reason: "no render pass to end".to_owned(),
                    });
                }
            }
        }

        Ok(())
    }
}
