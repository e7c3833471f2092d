// Synchronization primitives
//
// One FrameSync per frame in flight. Besides the usual fence and the
// acquire/render semaphores it hands out "queued work done" semaphores for
// deferred transfer/compute submits. Those cycle through three lists:
// spare -> pending (signaled by a queued submit, not yet waited on) ->
// in flight (waited on by a primary submit, reusable once the fence is seen).

use ash::prelude::VkResult;
use ash::vk;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    spare: Vec<vk::Semaphore>,
    pending: Vec<vk::Semaphore>,
    in_flight: Vec<vk::Semaphore>,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> VkResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on a fresh slot returns at once
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            let image_available = device.create_semaphore(&semaphore_info, None)?;
            let render_finished = device
                .create_semaphore(&semaphore_info, None)
                .map_err(|err| {
                    device.destroy_semaphore(image_available, None);
                    err
                })?;
            let in_flight_fence = device.create_fence(&fence_info, None).map_err(|err| {
                device.destroy_semaphore(image_available, None);
                device.destroy_semaphore(render_finished, None);
                err
            })?;

            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
                spare: Vec::new(),
                pending: Vec::new(),
                in_flight: Vec::new(),
            })
        }
    }

    /// Block until the slot's last submission has finished
    pub fn wait(&self, device: &ash::Device) -> VkResult<()> {
        unsafe { device.wait_for_fences(&[self.in_flight_fence], true, u64::MAX) }
    }

    /// Reset the fence; only call right before the submit that signals it
    pub fn reset(&self, device: &ash::Device) -> VkResult<()> {
        unsafe { device.reset_fences(&[self.in_flight_fence]) }
    }

    /// A semaphore for a queued submit to signal; the next primary submit waits on it
    pub fn signal_queued(&mut self, device: &ash::Device) -> VkResult<vk::Semaphore> {
        let semaphore = match self.spare.pop() {
            Some(semaphore) => semaphore,
            None => unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)? },
        };
        self.pending.push(semaphore);
        Ok(semaphore)
    }

    /// Return a semaphore whose signaling submit never happened
    pub fn cancel_queued(&mut self, semaphore: vk::Semaphore) {
        if let Some(position) = self.pending.iter().position(|&s| s == semaphore) {
            self.pending.remove(position);
            self.spare.push(semaphore);
        }
    }

    /// Hand the pending queued-work semaphores to a primary submit
    pub fn take_pending(&mut self) -> Vec<vk::Semaphore> {
        let waits = self.pending.clone();
        self.in_flight.append(&mut self.pending);
        waits
    }

    /// Recycle semaphores waited on by the previous submission of this slot.
    ///
    /// Only valid after `wait` returned.
    pub fn recycle(&mut self) {
        self.spare.append(&mut self.in_flight);
    }

    /// Replace every primitive after a failed submit left them in an unknown state.
    ///
    /// The device must be idle.
    pub fn recreate(&mut self, device: &ash::Device) -> VkResult<()> {
        let fresh = Self::new(device)?;
        let old = std::mem::replace(self, fresh);
        old.destroy(device);
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
            for &semaphore in self.spare.iter().chain(&self.pending).chain(&self.in_flight) {
                device.destroy_semaphore(semaphore, None);
            }
        }
    }
}
