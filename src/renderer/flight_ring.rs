use profiling::scope;
use tracing::debug;

use super::{
    device::{CommandPoolHandle, DescriptorPoolHandle, Device, DeviceError, FenceHandle, PerFlight, SemaphoreHandle},
    RendererError,
};

pub(crate) const MAX_FLIGHTS: u32 = 8;

/// Everything one frame in flight records into and synchronizes on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FlightSlot {
    pub(crate) fence: FenceHandle,
    pub(crate) command_pool: CommandPoolHandle,
    pub(crate) descriptor_pool: DescriptorPoolHandle,
    pub(crate) image_acquired: SemaphoreHandle,
    pub(crate) image_presentable: SemaphoreHandle,
}

/// Identifies one submission of a flight, see [`FlightRing::outstanding`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SubmissionMark {
    pub(crate) flight: u32,
    pub(crate) serial: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct SlotProgress {
    submitted: u64,
    /// Only advances when the host observes the fence, so it can lag behind the device.
    completed: u64,
}

pub(crate) struct FlightRing {
    slots: PerFlight<FlightSlot>,
    progress: PerFlight<SlotProgress>,
}

impl FlightSlot {
    fn new(device: &Device, ix: u32) -> Result<FlightSlot, DeviceError> {
        Ok(FlightSlot {
            // signaled so the first wait on every slot returns immediately
            fence: device.create_fence(&format!("Flight fence - {}", ix), true)?,
            command_pool: device.create_command_pool(&format!("Flight command pool - {}", ix))?,
            descriptor_pool: device.create_descriptor_pool(&format!("Flight descriptor pool - {}", ix))?,
            image_acquired: device.create_semaphore(&format!("Image acquired semaphore - {}", ix))?,
            image_presentable: device.create_semaphore(&format!("Image presentable semaphore - {}", ix))?,
        })
    }

    fn destroy(self, device: &Device) {
        device.destroy_fence(self.fence);
        device.destroy_command_pool(self.command_pool);
        device.destroy_descriptor_pool(self.descriptor_pool);
        device.destroy_semaphore(self.image_acquired);
        device.destroy_semaphore(self.image_presentable);
    }
}

impl FlightRing {
    pub(crate) fn new(device: &Device, count: u32) -> Result<FlightRing, RendererError> {
        if count == 0 || count > MAX_FLIGHTS {
            return Err(RendererError::FlightCount(count));
        }

        let mut created = vec![];
        let slots = PerFlight::try_new(count, |ix| {
            let slot = FlightSlot::new(device, ix)?;
            created.push(slot);
            Ok::<_, DeviceError>(slot)
        });
        let slots = match slots {
            Ok(slots) => slots,
            Err(err) => {
                created.into_iter().for_each(|slot| slot.destroy(device));
                return Err(err.into());
            }
        };
        debug!(count, "created flight ring");

        Ok(FlightRing {
            slots,
            progress: PerFlight::new(count, |_| SlotProgress::default()),
        })
    }

    pub(crate) fn len(&self) -> u32 {
        self.slots.len()
    }

    pub(crate) fn acquire(&self, flight_index: u32) -> Result<FlightSlot, RendererError> {
        self.slots.get(flight_index).copied().ok_or(RendererError::FlightIndex {
            index: flight_index,
            count: self.len(),
        })
    }

    /// Blocks until the slot's previous work has completed, then recycles its fence and pools.
    /// There is no timeout, a device that never signals blocks this forever.
    pub(crate) fn begin_iteration(&mut self, device: &Device, flight_index: u32) -> Result<FlightSlot, RendererError> {
        scope!("flight_ring::begin_iteration");

        let slot = self.acquire(flight_index)?;
        device.wait_for_fence(slot.fence)?;
        let progress = &mut self.progress[flight_index];
        progress.completed = progress.submitted;

        device.reset_fence(slot.fence)?;
        device.reset_command_pool(slot.command_pool)?;
        device.reset_descriptor_pool(slot.descriptor_pool)?;

        Ok(slot)
    }

    pub(crate) fn mark_submitted(&mut self, flight_index: u32) -> SubmissionMark {
        let progress = &mut self.progress[flight_index];
        progress.submitted += 1;
        SubmissionMark {
            flight: flight_index,
            serial: progress.submitted,
        }
    }

    /// Latest submission of every slot that is not known to be complete.
    pub(crate) fn outstanding(&self) -> Vec<SubmissionMark> {
        self.progress
            .iter()
            .enumerate()
            .filter(|(_, progress)| progress.submitted > progress.completed)
            .map(|(flight, progress)| SubmissionMark {
                flight: flight as u32,
                serial: progress.submitted,
            })
            .collect()
    }

    pub(crate) fn is_complete(&self, mark: SubmissionMark) -> bool {
        self.progress
            .get(mark.flight)
            .map_or(true, |progress| progress.completed >= mark.serial)
    }

    /// Waits for every slot with outstanding work. Fences stay signaled.
    pub(crate) fn wait_all(&mut self, device: &Device) -> Result<(), RendererError> {
        scope!("flight_ring::wait_all");

        for flight in 0..self.len() {
            let progress = self.progress[flight];
            if progress.submitted > progress.completed {
                device.wait_for_fence(self.slots[flight].fence)?;
                self.progress[flight].completed = progress.submitted;
            }
        }
        Ok(())
    }

    pub(crate) fn destroy(self, device: &Device) {
        self.slots.into_iter().for_each(|slot| slot.destroy(device));
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use super::*;
    use crate::renderer::device::{CommandRecorder, GpuBackend, SoftwareDevice, Submission};

    fn submit_empty(device: &Device, ring: &mut FlightRing, slot: FlightSlot, flight: u32) {
        let list = device.allocate_command_list(slot.command_pool, "empty").unwrap();
        let list = CommandRecorder::begin(device, list).unwrap().end().unwrap();
        device
            .submit(&Submission {
                command_list: list,
                wait_semaphore: None,
                signal_semaphore: None,
                fence: Some(slot.fence),
            })
            .unwrap();
        ring.mark_submitted(flight);
    }

    #[test]
    fn creates_one_slot_per_flight() {
        let device = SoftwareDevice::new(&Default::default()).unwrap();
        for count in 1..=MAX_FLIGHTS {
            let ring = FlightRing::new(&*device, count).unwrap();
            assert_eq!(ring.len(), count);
            let slots = (0..count).map(|ix| ring.acquire(ix).unwrap()).collect::<Vec<_>>();
            for (ix, slot) in slots.iter().enumerate() {
                assert!(slots[ix + 1..].iter().all(|other| other.fence != slot.fence));
            }
            assert!(matches!(
                ring.acquire(count),
                Err(RendererError::FlightIndex { index, .. }) if index == count
            ));
            // five objects per slot
            assert_eq!(device.live_objects(), 5 * count as usize);
            ring.destroy(&*device);
        }
        assert_eq!(device.live_objects(), 0);
        assert!(FlightRing::new(&*device, 0).is_err());
        assert!(FlightRing::new(&*device, MAX_FLIGHTS + 1).is_err());
    }

    #[test]
    fn tracks_outstanding_submissions() {
        let device = SoftwareDevice::new(&Default::default()).unwrap();
        let mut ring = FlightRing::new(&*device, 2).unwrap();
        assert!(ring.outstanding().is_empty());

        let slot = ring.begin_iteration(&*device, 0).unwrap();
        submit_empty(&*device, &mut ring, slot, 0);
        let slot = ring.begin_iteration(&*device, 1).unwrap();
        submit_empty(&*device, &mut ring, slot, 1);
        assert_eq!(
            ring.outstanding(),
            vec![
                SubmissionMark { flight: 0, serial: 1 },
                SubmissionMark { flight: 1, serial: 1 }
            ]
        );

        ring.wait_all(&*device).unwrap();
        assert!(ring.outstanding().is_empty());
        assert!(ring.is_complete(SubmissionMark { flight: 1, serial: 1 }));
        assert!(!ring.is_complete(SubmissionMark { flight: 1, serial: 2 }));

        // fences stay signaled after wait_all, so the next iteration does not block
        ring.begin_iteration(&*device, 0).unwrap();
        ring.destroy(&*device);
    }

    #[test]
    fn stuck_fence_blocks_the_reset() {
        let device = SoftwareDevice::new(&Default::default()).unwrap();
        let mut ring = FlightRing::new(&*device, 2).unwrap();
        let slot = ring.begin_iteration(&*device, 0).unwrap();

        device.stall_queue();
        submit_empty(&*device, &mut ring, slot, 0);
        let list = device.allocate_command_list(slot.command_pool, "check").unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let waiter = {
            let device = device.clone();
            thread::spawn(move || {
                let result = ring.begin_iteration(&*device, 0).map(|_| ring);
                done_tx.send(()).unwrap();
                result
            })
        };

        assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
        // the pool was not reset, so its command lists are still alive
        assert!(device.begin_command_list(list).is_ok());
        assert!(device.reset_command_pool(slot.command_pool).is_err());

        device.resume_queue();
        done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let ring = waiter.join().unwrap().unwrap();
        assert!(device.begin_command_list(list).is_err());
        ring.destroy(&*device);
        assert_eq!(device.live_objects(), 0);
    }
}
