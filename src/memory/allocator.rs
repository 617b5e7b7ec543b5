// Device-memory allocator
//
// Routes memory-bound objects to one MemoryTypeManager per compatible
// memory-type index, created on first use. Callers keep an ObjectKey
// instead of a pointer to the object: the manager owns the object, the
// key is the back-reference into it.

use super::manager::MemoryTypeManager;
use super::object::{MappedSlice, MemoryBoundObject, MemoryRequirementsChange};
use super::MemoryOps;
use crate::backend::VulkanDevice;
use crate::error::MemoryError;
use crate::memory::{DeviceBuffer, DeviceImage};
use ash::vk;
use std::sync::Arc;

/// Stable lookup key for an object placed through the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectKey {
    memory_type_index: u32,
    member: usize,
}

impl ObjectKey {
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }
}

pub struct DeviceMemoryAllocator {
    memory_ops: Arc<dyn MemoryOps>,
    debug_name: String,
    /// One slot per possible memory-type index.
    managers: [Option<MemoryTypeManager>; vk::MAX_MEMORY_TYPES],
}

impl DeviceMemoryAllocator {
    pub fn new(memory_ops: Arc<dyn MemoryOps>, debug_name: impl Into<String>) -> Self {
        Self {
            memory_ops,
            debug_name: debug_name.into(),
            managers: std::array::from_fn(|_| None),
        }
    }

    /// Place `object` with the manager for its compatible memory type,
    /// creating the manager on first use. The object's memory is not
    /// allocated until the next [`allocate_all`](Self::allocate_all).
    pub fn add(
        &mut self,
        mut object: Box<dyn MemoryBoundObject>,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<ObjectKey, MemoryError> {
        let memory_type_index = object.calculate_memory_type_index(flags)?;
        log::debug!(
            "allocator '{}': placing '{}' in memory type {}",
            self.debug_name,
            object.debug_name(),
            memory_type_index
        );

        let manager = self.managers[memory_type_index as usize].get_or_insert_with(|| {
            MemoryTypeManager::new(self.memory_ops.clone(), memory_type_index)
        });
        let member = manager.add_object(object);
        Ok(ObjectKey {
            memory_type_index,
            member,
        })
    }

    /// Create a buffer and place it. Convenience in front of
    /// [`DeviceBuffer::create`] + [`add`](Self::add).
    pub fn create_buffer(
        &mut self,
        device: &Arc<VulkanDevice>,
        debug_name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<ObjectKey, MemoryError> {
        let buffer = DeviceBuffer::create(device, debug_name, size, usage)?;
        self.add(Box::new(buffer), flags)
    }

    /// Create a 2D image and place it.
    pub fn create_image(
        &mut self,
        device: &Arc<VulkanDevice>,
        debug_name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<ObjectKey, MemoryError> {
        let image = DeviceImage::create(device, debug_name, extent, format, tiling, usage)?;
        self.add(Box::new(image), flags)
    }

    /// Run the allocation pass of every manager that needs one.
    pub fn allocate_all(&mut self) -> Result<(), MemoryError> {
        for manager in self.managers.iter_mut().flatten() {
            manager.allocate()?;
        }
        Ok(())
    }

    /// Recreate an object's handle at a new logical size and let its
    /// manager decide between an in-place rebind and a full reallocation
    /// (one-shot evaluation, no retry loop).
    pub fn resize_object(&mut self, key: ObjectKey, new_size: u64) -> Result<(), MemoryError> {
        let manager = self.manager_mut(key);

        let region = manager.object(key.member).region();
        let change = MemoryRequirementsChange {
            old_offset: region.offset(),
            old_required_size: region.required_size(),
            old_required_alignment: region.required_alignment(),
            new_required_size: 0,
            new_required_alignment: 0,
        };

        manager.object_mut(key.member).recreate(new_size)?;

        let region = manager.object(key.member).region();
        let change = MemoryRequirementsChange {
            new_required_size: region.required_size(),
            new_required_alignment: region.required_alignment(),
            ..change
        };
        manager.on_changed(key.member, Some(change))
    }

    /// Recreate an object's handle without a size change and rebind it at
    /// its existing offset.
    pub fn rebind_object(&mut self, key: ObjectKey) -> Result<(), MemoryError> {
        let manager = self.manager_mut(key);
        let size = manager.object(key.member).region().size();
        manager.object_mut(key.member).recreate(size)?;
        manager.on_changed(key.member, None)
    }

    pub fn object(&self, key: ObjectKey) -> &dyn MemoryBoundObject {
        self.managers[key.memory_type_index as usize]
            .as_ref()
            .expect("no manager for object key")
            .object(key.member)
    }

    /// Host mapping of an object's slot, if its memory type is
    /// host-visible and allocated.
    pub fn mapped(&self, key: ObjectKey) -> Option<MappedSlice> {
        self.object(key).region().mapped()
    }

    pub fn manager(&self, memory_type_index: u32) -> Option<&MemoryTypeManager> {
        self.managers[memory_type_index as usize].as_ref()
    }

    fn manager_mut(&mut self, key: ObjectKey) -> &mut MemoryTypeManager {
        self.managers[key.memory_type_index as usize]
            .as_mut()
            .expect("no manager for object key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::manager::tests::{FakeDevice, FakeObject};
    use crate::memory::object::ObjectState;

    #[test]
    fn objects_group_by_memory_type_index() {
        let device = FakeDevice::new(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        let mut allocator = DeviceMemoryAllocator::new(device.clone(), "test");

        let a = allocator
            .add(
                FakeObject::recreated_with_type("a", 64, 16, 0),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap();
        let b = allocator
            .add(
                FakeObject::recreated_with_type("b", 64, 16, 0),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap();
        let c = allocator
            .add(
                FakeObject::recreated_with_type("c", 64, 16, 3),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap();

        assert_eq!(a.memory_type_index(), 0);
        assert_eq!(b.memory_type_index(), 0);
        assert_eq!(c.memory_type_index(), 3);

        allocator.allocate_all().unwrap();
        // One block per distinct memory type.
        assert_eq!(device.allocation_count(), 2);
        assert_eq!(allocator.manager(0).unwrap().len(), 2);
        assert_eq!(allocator.manager(3).unwrap().len(), 1);
        assert!(allocator.manager(1).is_none());
    }

    #[test]
    fn resize_grow_reallocates_through_owning_manager() {
        let device = FakeDevice::new(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        let mut allocator = DeviceMemoryAllocator::new(device.clone(), "test");

        let key = allocator
            .add(
                FakeObject::recreated("a", 100, 16),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap();
        allocator.allocate_all().unwrap();
        let old_block = allocator.manager(0).unwrap().memory();

        allocator.resize_object(key, 150).unwrap();
        assert!(allocator.manager(0).unwrap().requires_allocation());

        allocator.allocate_all().unwrap();
        assert_ne!(allocator.manager(0).unwrap().memory(), old_block);
        assert_eq!(device.last_allocated_size(), 150);
    }

    #[test]
    fn resize_shrink_rebinds_without_reallocation() {
        let device = FakeDevice::new(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        let mut allocator = DeviceMemoryAllocator::new(device.clone(), "test");

        let key = allocator
            .add(
                FakeObject::recreated("a", 100, 16),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap();
        allocator.allocate_all().unwrap();

        allocator.resize_object(key, 80).unwrap();
        assert!(!allocator.manager(0).unwrap().requires_allocation());
        assert_eq!(device.allocation_count(), 1);
        assert_eq!(allocator.object(key).state(), ObjectState::Bound);
    }

    #[test]
    fn rebind_keeps_offset_and_block() {
        let device = FakeDevice::new(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        let mut allocator = DeviceMemoryAllocator::new(device.clone(), "test");

        allocator
            .add(
                FakeObject::recreated("a", 64, 16),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap();
        let key = allocator
            .add(
                FakeObject::recreated("b", 64, 16),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .unwrap();
        allocator.allocate_all().unwrap();
        let offset = allocator.object(key).region().offset();

        allocator.rebind_object(key).unwrap();
        assert_eq!(allocator.object(key).region().offset(), offset);
        assert_eq!(allocator.object(key).state(), ObjectState::Bound);
        assert_eq!(device.allocation_count(), 1);
    }
}
