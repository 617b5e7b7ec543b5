// Synchronization primitives
//
// One FrameSync per frame in flight: acquire/present semaphores plus the
// fence gating reuse of the slot.

use super::VulkanDevice;
use anyhow::Result;
use ash::vk;
use std::sync::Arc;

pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Signaled, so the first frame does not wait on a fence nobody
        // submitted.
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                image_available: device.device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.device.create_semaphore(&semaphore_info, None)?,
                in_flight_fence: device.device.create_fence(&fence_info, None)?,
            })
        }
    }

    /// One sync slot per frame in flight.
    pub fn for_frames(device: &Arc<VulkanDevice>, count: usize) -> Result<Vec<Self>> {
        (0..count).map(|_| Self::new(device)).collect()
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
