//! Streaming light sample reservoirs and the buffers that carry them from one frame to the next.
//!
//! Each pixel owns one [`Reservoir`]. The ray tracing pass reads last frame's reservoir from the
//! history buffer and writes the merged result into the output buffer. With `K` buffers, flight `f`
//! writes buffer `f % K` and reads buffer `(f + K - 1) % K`, which is exactly what flight `f - 1`
//! wrote as long as the flight count is a multiple of `K`.

use std::mem::size_of;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use tracing::debug;

use super::{
    device::{BufferDesc, BufferHandle, CommandRecorder, Device, MemoryBarrier, MemoryLocation},
    human_size,
    retirement::Retired,
    RendererError,
};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub(crate) struct LightSample {
    /// Slot of the emissive object inside the emissive range of the object table.
    pub(crate) light: u32,
    pub(crate) triangle: u32,
    pub(crate) barycentrics: [f32; 2],
}

/// Weighted reservoir over light samples. The all-zero value is the empty reservoir.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub(crate) struct Reservoir {
    pub(crate) sample: LightSample,
    /// Target pdf of `sample` at the pixel that owns the reservoir.
    pub(crate) target_pdf: f32,
    pub(crate) weight_sum: f32,
    /// Number of candidates seen, `M`.
    pub(crate) sample_count: u32,
    /// Unbiased contribution weight `W`, valid after [`Reservoir::finalize`].
    pub(crate) contribution_weight: f32,
}

const_assert_eq!(size_of::<Reservoir>(), 32);

impl Reservoir {
    pub(crate) const SIZE: u64 = size_of::<Reservoir>() as u64;

    pub(crate) fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    /// Streams one candidate in. `u` is uniform in `[0, 1)`. Returns whether the candidate was kept.
    pub(crate) fn update(&mut self, sample: LightSample, target_pdf: f32, weight: f32, u: f32) -> bool {
        self.sample_count += 1;
        if weight.is_nan() || weight <= 0.0 {
            return false;
        }
        self.weight_sum += weight;
        if u * self.weight_sum < weight {
            self.sample = sample;
            self.target_pdf = target_pdf;
            true
        } else {
            false
        }
    }

    /// Merges a finalized reservoir. `target_pdf` is the target pdf of `other.sample` re-evaluated
    /// at this reservoir's pixel. Works on finalized reservoirs too since `W * M * p̂` restores their
    /// weight sum.
    pub(crate) fn combine(&mut self, other: &Reservoir, target_pdf: f32, u: f32) -> bool {
        let sample_count = self.sample_count;
        let weight = target_pdf * other.contribution_weight * other.sample_count as f32;
        let picked = self.update(other.sample, target_pdf, weight, u);
        self.sample_count = sample_count + other.sample_count;
        picked
    }

    pub(crate) fn finalize(&mut self) {
        self.contribution_weight = if self.target_pdf > 0.0 && self.sample_count > 0 {
            self.weight_sum / (self.sample_count as f32 * self.target_pdf)
        } else {
            0.0
        };
    }

    /// Bounds how much a history reservoir can outweigh fresh candidates.
    pub(crate) fn cap_history(&mut self, cap: u32) {
        if self.sample_count > cap {
            self.weight_sum *= cap as f32 / self.sample_count as f32;
            self.sample_count = cap;
        }
    }
}

/// The `K` reservoir buffers, all sized to the current output resolution.
pub(crate) struct ReservoirExchange {
    buffers: Vec<BufferHandle>,
    needs_clear: bool,
}

impl ReservoirExchange {
    pub(crate) fn validate_slot_count(slot_count: u32, flight_count: u32) -> Result<(), RendererError> {
        if slot_count < 2 || flight_count % slot_count != 0 {
            return Err(RendererError::ReservoirSlots {
                slots: slot_count,
                flights: flight_count,
            });
        }
        Ok(())
    }

    pub(crate) fn new(
        device: &Device,
        slot_count: u32,
        flight_count: u32,
        extent: vk::Extent2D,
    ) -> Result<ReservoirExchange, RendererError> {
        ReservoirExchange::validate_slot_count(slot_count, flight_count)?;

        Ok(ReservoirExchange {
            buffers: allocate(device, slot_count, extent)?,
            needs_clear: true,
        })
    }

    pub(crate) fn slot_count(&self) -> u32 {
        self.buffers.len() as u32
    }

    pub(crate) fn buffers(&self) -> &[BufferHandle] {
        &self.buffers
    }

    /// `(read, write)` buffer indices for a flight.
    pub(crate) fn indices(&self, flight_index: u32) -> (usize, usize) {
        let k = self.slot_count();
        let write = flight_index % k;
        let read = (flight_index + k - 1) % k;
        (read as usize, write as usize)
    }

    /// `(history, output)` buffers for a flight.
    pub(crate) fn pair(&self, flight_index: u32) -> (BufferHandle, BufferHandle) {
        let (read, write) = self.indices(flight_index);
        (self.buffers[read], self.buffers[write])
    }

    /// Reallocates every buffer for the new resolution. History does not survive, the new buffers
    /// are cleared by the next [`ReservoirExchange::record_clear`]. Returns the old buffers.
    pub(crate) fn resize(&mut self, device: &Device, extent: vk::Extent2D) -> Result<Vec<Retired>, RendererError> {
        let buffers = allocate(device, self.slot_count(), extent)?;
        let old = std::mem::replace(&mut self.buffers, buffers);
        self.needs_clear = true;

        Ok(old.into_iter().map(Retired::Buffer).collect())
    }

    /// Records a zero fill of every buffer if they were just (re)allocated.
    pub(crate) fn record_clear(&mut self, recorder: &CommandRecorder) -> Result<(), RendererError> {
        if !self.needs_clear {
            return Ok(());
        }
        for &buffer in &self.buffers {
            recorder.fill_buffer(buffer, 0)?;
        }
        recorder.barrier(MemoryBarrier::FILL_TO_TRACE)?;
        self.needs_clear = false;
        Ok(())
    }

    pub(crate) fn retire(self) -> Vec<Retired> {
        self.buffers.into_iter().map(Retired::Buffer).collect()
    }
}

fn allocate(device: &Device, slot_count: u32, extent: vk::Extent2D) -> Result<Vec<BufferHandle>, RendererError> {
    let size = u64::from(extent.width) * u64::from(extent.height) * Reservoir::SIZE;
    let mut buffers = Vec::with_capacity(slot_count as usize);
    for ix in 0..slot_count {
        match device.create_buffer(&BufferDesc {
            name: &format!("Reservoir buffer - {}", ix),
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::GpuOnly,
        }) {
            Ok(buffer) => buffers.push(buffer),
            Err(err) => {
                buffers.into_iter().for_each(|buffer| device.destroy_buffer(buffer));
                return Err(err.into());
            }
        }
    }
    debug!(
        slots = slot_count,
        width = extent.width,
        height = extent.height,
        size = %human_size(size),
        "allocated reservoir buffers"
    );

    Ok(buffers)
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::renderer::device::{GpuBackend, SoftwareDevice};

    fn sample(light: u32) -> LightSample {
        LightSample {
            light,
            triangle: 0,
            barycentrics: [0.25, 0.25],
        }
    }

    #[test]
    fn read_and_write_never_alias() {
        let device = SoftwareDevice::new(&Default::default()).unwrap();
        let extent = vk::Extent2D { width: 4, height: 4 };
        for (flights, slots) in [(2, 2), (3, 3), (4, 2), (6, 3), (8, 4)] {
            let exchange = ReservoirExchange::new(&*device, slots, flights, extent).unwrap();
            for f in 0..flights {
                let (read, write) = exchange.indices(f);
                assert_ne!(read, write);
                // history of flight f is what the previous flight wrote
                let previous = (f + flights - 1) % flights;
                assert_eq!(read, exchange.indices(previous).1);
            }
            exchange.retire().into_iter().for_each(|retired| retired.destroy(&*device));
        }
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn two_slots_read_the_other_buffer() {
        let device = SoftwareDevice::new(&Default::default()).unwrap();
        let exchange = ReservoirExchange::new(&*device, 2, 2, vk::Extent2D { width: 2, height: 2 }).unwrap();
        assert_eq!(exchange.indices(0), (1, 0));
        assert_eq!(exchange.indices(1), (0, 1));
        let (history, output) = exchange.pair(0);
        assert_eq!(exchange.pair(1), (output, history));
    }

    #[test]
    fn slot_count_must_divide_flight_count() {
        assert!(ReservoirExchange::validate_slot_count(2, 2).is_ok());
        assert!(ReservoirExchange::validate_slot_count(2, 4).is_ok());
        assert!(ReservoirExchange::validate_slot_count(1, 2).is_err());
        assert!(ReservoirExchange::validate_slot_count(2, 3).is_err());
        assert!(ReservoirExchange::validate_slot_count(4, 2).is_err());
    }

    #[test]
    fn resize_reallocates_every_buffer() {
        let device = SoftwareDevice::new(&Default::default()).unwrap();
        let mut exchange = ReservoirExchange::new(
            &*device,
            2,
            2,
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        )
        .unwrap();
        let before = exchange.buffers().to_vec();
        for &buffer in &before {
            assert_eq!(device.buffer_size(buffer).unwrap(), 1920 * 1080 * 32);
        }

        let retired = exchange
            .resize(
                &*device,
                vk::Extent2D {
                    width: 1280,
                    height: 720,
                },
            )
            .unwrap();
        assert_eq!(retired.len(), 2);
        for &buffer in exchange.buffers() {
            assert!(!before.contains(&buffer));
            assert_eq!(device.buffer_size(buffer).unwrap(), 1280 * 720 * 32);
        }
        retired.into_iter().for_each(|retired| retired.destroy(&*device));
        for buffer in before {
            assert!(!device.contains_buffer(buffer));
        }
    }

    #[test]
    fn single_candidate_reservoir_is_unbiased() {
        let mut reservoir = Reservoir::default();
        assert!(reservoir.is_empty());
        // source pdf 0.5, target pdf 2.0
        assert!(reservoir.update(sample(3), 2.0, 2.0 / 0.5, 0.9));
        reservoir.finalize();
        assert_eq!(reservoir.sample.light, 3);
        assert!((reservoir.contribution_weight - 2.0).abs() < 1e-6);
    }

    #[test]
    fn selection_frequency_follows_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        let trials = 20_000;
        let mut picked_heavy = 0;
        for _ in 0..trials {
            let mut reservoir = Reservoir::default();
            reservoir.update(sample(0), 1.0, 1.0, rng.gen());
            reservoir.update(sample(1), 3.0, 3.0, rng.gen());
            reservoir.update(sample(2), 0.0, 0.0, rng.gen());
            assert_eq!(reservoir.sample_count, 3);
            if reservoir.sample.light == 1 {
                picked_heavy += 1;
            }
        }
        let ratio = picked_heavy as f64 / trials as f64;
        assert!((ratio - 0.75).abs() < 0.02, "ratio {}", ratio);
    }

    #[test]
    fn combine_accumulates_sample_counts() {
        let mut history = Reservoir::default();
        for _ in 0..40 {
            history.update(sample(1), 1.0, 1.0, 0.0);
        }
        history.finalize();
        history.cap_history(20);
        assert_eq!(history.sample_count, 20);

        let mut current = Reservoir::default();
        current.update(sample(0), 1.0, 1.0, 0.0);
        current.finalize();
        current.combine(&history, 1.0, 0.5);
        current.finalize();
        assert_eq!(current.sample_count, 21);
        assert_eq!(current.sample.light, 1);
        assert!((current.contribution_weight - 1.0).abs() < 1e-5);
    }

    #[test]
    fn combining_an_empty_reservoir_keeps_the_current_sample() {
        let mut current = Reservoir::default();
        current.update(sample(5), 2.0, 4.0, 0.5);
        current.finalize();
        let weight = current.contribution_weight;
        current.combine(&Reservoir::default(), 0.0, 0.0);
        current.finalize();
        assert_eq!(current.sample.light, 5);
        assert_eq!(current.sample_count, 1);
        assert_eq!(current.contribution_weight, weight);
    }
}
