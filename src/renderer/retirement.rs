use tracing::debug;

use super::{
    device::{AccelerationStructureHandle, BufferHandle, Device, PipelineHandle, SamplerHandle, TextureHandle},
    flight_ring::{FlightRing, SubmissionMark},
};

/// A device object that was replaced but may still be referenced by submitted work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Retired {
    Buffer(BufferHandle),
    Texture(TextureHandle),
    AccelerationStructure(AccelerationStructureHandle),
    Pipeline(PipelineHandle),
    Sampler(SamplerHandle),
}

impl Retired {
    pub(crate) fn destroy(self, device: &Device) {
        match self {
            Retired::Buffer(buffer) => device.destroy_buffer(buffer),
            Retired::Texture(texture) => device.destroy_texture(texture),
            Retired::AccelerationStructure(accel) => device.destroy_acceleration_structure(accel),
            Retired::Pipeline(pipeline) => device.destroy_pipeline(pipeline),
            Retired::Sampler(sampler) => device.destroy_sampler(sampler),
        }
    }
}

struct RetiredBatch {
    resources: Vec<Retired>,
    /// Submissions that were in flight when the batch was retired.
    marks: Vec<SubmissionMark>,
}

/// Defers destruction until every submission that could reference a resource has completed.
#[derive(Default)]
pub(crate) struct RetirementQueue {
    batches: Vec<RetiredBatch>,
}

impl RetirementQueue {
    pub(crate) fn new() -> RetirementQueue {
        RetirementQueue::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.batches.iter().map(|batch| batch.resources.len()).sum()
    }

    pub(crate) fn retire(&mut self, resources: Vec<Retired>, marks: Vec<SubmissionMark>) {
        if resources.is_empty() {
            return;
        }
        self.batches.push(RetiredBatch { resources, marks });
    }

    /// Destroys every batch whose submissions are all known to be complete.
    pub(crate) fn collect(&mut self, device: &Device, ring: &FlightRing) -> usize {
        let mut destroyed = 0;
        self.batches.retain(|batch| {
            if batch.marks.iter().all(|&mark| ring.is_complete(mark)) {
                batch.resources.iter().for_each(|resource| resource.destroy(device));
                destroyed += batch.resources.len();
                false
            } else {
                true
            }
        });
        if destroyed > 0 {
            debug!(destroyed, "collected retired resources");
        }
        destroyed
    }

    /// Destroys everything unconditionally, the device must be idle.
    pub(crate) fn drain(&mut self, device: &Device) {
        self.batches
            .drain(..)
            .flat_map(|batch| batch.resources)
            .for_each(|resource| resource.destroy(device));
    }
}
