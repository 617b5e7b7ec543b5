// GPU image bound to manager-owned memory
//
// Same lifecycle as DeviceBuffer. The logical size is derived from the
// image attributes by the driver, so the region's requested size stays 0
// and the required size from the requirements query is authoritative.

use super::object::{MemoryBoundObject, MemoryRegion, ObjectState};
use crate::backend::VulkanDevice;
use crate::error::MemoryError;
use ash::vk;
use std::sync::Arc;

pub struct DeviceImage {
    device: Arc<VulkanDevice>,
    region: MemoryRegion,
    extent: vk::Extent2D,
    format: vk::Format,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    image: vk::Image,
}

impl DeviceImage {
    /// Create a 2D image with its native handle in place (`Recreated`).
    pub fn create(
        device: &Arc<VulkanDevice>,
        debug_name: impl Into<String>,
        extent: vk::Extent2D,
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self, MemoryError> {
        let mut image = Self {
            device: device.clone(),
            region: MemoryRegion::new(debug_name, 0),
            extent,
            format,
            tiling,
            usage,
            image: vk::Image::null(),
        };
        image.recreate_handle()?;
        Ok(image)
    }

    /// Current native handle. Invalidated by `unbind` and `recreate`.
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn recreate_handle(&mut self) -> Result<(), MemoryError> {
        self.destroy_handle();

        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(self.format)
            .tiling(self.tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(self.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        self.image = unsafe {
            self.device
                .device
                .create_image(&create_info, None)
                .map_err(|result| MemoryError::NativeCall {
                    call: "vkCreateImage",
                    result,
                })?
        };
        self.region.set_state(ObjectState::Recreated);

        let requirements = unsafe { self.device.device.get_image_memory_requirements(self.image) };
        self.region.record_requirements(requirements);
        Ok(())
    }

    fn destroy_handle(&mut self) {
        if self.region.state() >= ObjectState::Recreated {
            unsafe { self.device.device.destroy_image(self.image, None) };
            self.image = vk::Image::null();
        }
        self.region.set_state(ObjectState::NotCreated);
        self.region.set_mapped(None);
    }
}

impl MemoryBoundObject for DeviceImage {
    fn region(&self) -> &MemoryRegion {
        &self.region
    }

    fn region_mut(&mut self) -> &mut MemoryRegion {
        &mut self.region
    }

    fn calculate_memory_type_index(
        &mut self,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32, MemoryError> {
        self.region.assert_state_past(ObjectState::Recreated);
        let requirements = unsafe { self.device.device.get_image_memory_requirements(self.image) };
        self.region.record_requirements(requirements);
        self.device
            .find_memory_type(requirements.memory_type_bits, flags)
    }

    fn bind(&mut self, memory: vk::DeviceMemory, offset: u64) -> Result<(), MemoryError> {
        self.region.assert_state(ObjectState::Recreated);
        unsafe {
            self.device
                .device
                .bind_image_memory(self.image, memory, offset)
                .map_err(|result| MemoryError::NativeCall {
                    call: "vkBindImageMemory",
                    result,
                })?;
        }
        self.region.set_state(ObjectState::Bound);
        Ok(())
    }

    fn unbind(&mut self) -> Result<(), MemoryError> {
        self.region.assert_state(ObjectState::Bound);
        self.recreate_handle()
    }

    /// Images size themselves from their attributes; the handle is simply
    /// recreated and the fresh requirements recorded.
    fn recreate(&mut self, _new_size: u64) -> Result<(), MemoryError> {
        self.recreate_handle()
    }
}

impl Drop for DeviceImage {
    fn drop(&mut self) {
        self.destroy_handle();
    }
}
