// GPU buffer bound to manager-owned memory
//
// The buffer owns only its native handle; its backing memory belongs to
// the MemoryTypeManager that holds the object. Rebinding requires a fresh
// handle, so unbind destroys and recreates it.

use super::object::{MemoryBoundObject, MemoryRegion, ObjectState};
use crate::backend::VulkanDevice;
use crate::error::MemoryError;
use ash::vk;
use std::sync::Arc;

pub struct DeviceBuffer {
    device: Arc<VulkanDevice>,
    region: MemoryRegion,
    usage: vk::BufferUsageFlags,
    buffer: vk::Buffer,
}

impl DeviceBuffer {
    /// Create the buffer with its native handle in place (`Recreated`).
    pub fn create(
        device: &Arc<VulkanDevice>,
        debug_name: impl Into<String>,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self, MemoryError> {
        let mut buffer = Self {
            device: device.clone(),
            region: MemoryRegion::new(debug_name, size),
            usage,
            buffer: vk::Buffer::null(),
        };
        buffer.recreate_handle()?;
        Ok(buffer)
    }

    /// Current native handle. Invalidated by `unbind` and `recreate`.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    fn recreate_handle(&mut self) -> Result<(), MemoryError> {
        self.destroy_handle();

        let create_info = vk::BufferCreateInfo::builder()
            .size(self.region.size())
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        self.buffer = unsafe {
            self.device
                .device
                .create_buffer(&create_info, None)
                .map_err(|result| MemoryError::NativeCall {
                    call: "vkCreateBuffer",
                    result,
                })?
        };
        self.region.set_state(ObjectState::Recreated);

        // Requirements can change with the handle; record them fresh.
        let requirements = unsafe { self.device.device.get_buffer_memory_requirements(self.buffer) };
        self.region.record_requirements(requirements);
        Ok(())
    }

    fn destroy_handle(&mut self) {
        if self.region.state() >= ObjectState::Recreated {
            unsafe { self.device.device.destroy_buffer(self.buffer, None) };
            self.buffer = vk::Buffer::null();
        }
        self.region.set_state(ObjectState::NotCreated);
        self.region.set_mapped(None);
    }
}

impl MemoryBoundObject for DeviceBuffer {
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
        let requirements = unsafe { self.device.device.get_buffer_memory_requirements(self.buffer) };
        self.region.record_requirements(requirements);
        self.device
            .find_memory_type(requirements.memory_type_bits, flags)
    }

    fn bind(&mut self, memory: vk::DeviceMemory, offset: u64) -> Result<(), MemoryError> {
        self.region.assert_state(ObjectState::Recreated);
        unsafe {
            self.device
                .device
                .bind_buffer_memory(self.buffer, memory, offset)
                .map_err(|result| MemoryError::NativeCall {
                    call: "vkBindBufferMemory",
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

    fn recreate(&mut self, new_size: u64) -> Result<(), MemoryError> {
        self.region.set_size(new_size);
        self.recreate_handle()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.destroy_handle();
    }
}
