// Memory-type manager
//
// Owns exactly one native memory block per memory-type index and lays out
// all member objects inside it. Member order is insertion order and is
// never resorted, so offsets are deterministic.
//
// Layout invariant: total block size = sum over members of
// align(running_offset, member.alignment) + member.required_size, and each
// member's offset is exactly that alignment point.

use super::object::{align_up, MappedSlice, MemoryBoundObject, MemoryRequirementsChange, ObjectState};
use super::MemoryOps;
use crate::error::MemoryError;
use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

pub struct MemoryTypeManager {
    device: Arc<dyn MemoryOps>,
    memory_type_index: u32,
    memory_flags: vk::MemoryPropertyFlags,
    /// Members in insertion order.
    objects: Vec<Box<dyn MemoryBoundObject>>,
    requires_allocation: bool,
    /// The single native block; null until the first allocation pass.
    memory: vk::DeviceMemory,
    /// Whole-block mapping when the memory type is host-visible.
    mapped_base: Option<MappedSlice>,
}

impl MemoryTypeManager {
    pub fn new(device: Arc<dyn MemoryOps>, memory_type_index: u32) -> Self {
        let memory_flags = device.memory_type_properties(memory_type_index);
        Self {
            device,
            memory_type_index,
            memory_flags,
            objects: Vec::new(),
            requires_allocation: true,
            memory: vk::DeviceMemory::null(),
            mapped_base: None,
        }
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn host_visible(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Current native block. Null before the first allocation pass.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn requires_allocation(&self) -> bool {
        self.requires_allocation
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn object(&self, member: usize) -> &dyn MemoryBoundObject {
        self.objects[member].as_ref()
    }

    pub fn object_mut(&mut self, member: usize) -> &mut dyn MemoryBoundObject {
        self.objects[member].as_mut()
    }

    /// Append a member. Its offset becomes valid with the next
    /// [`allocate`](Self::allocate) pass.
    pub fn add_object(&mut self, object: Box<dyn MemoryBoundObject>) -> usize {
        self.requires_allocation = true;
        self.objects.push(object);
        self.objects.len() - 1
    }

    /// React to a member whose requirements may have changed.
    ///
    /// With a pending reallocation the call coalesces into it. A `None`
    /// change rebinds at the existing offset. Otherwise the slack rule
    /// decides: `old_size - (new_size + alignment_fix) >= 0` means the
    /// object still fits its slot and rebinds in place; a negative slack
    /// makes a full relayout unavoidable.
    pub fn on_changed(
        &mut self,
        member: usize,
        change: Option<MemoryRequirementsChange>,
    ) -> Result<(), MemoryError> {
        if self.requires_allocation {
            return Ok(());
        }

        match change {
            None => self.rebind_in_place(member),
            Some(change) if change.still_fits() => self.rebind_in_place(member),
            Some(change) => {
                log::debug!(
                    "'{}' no longer fits its slot (slack {}), scheduling reallocation",
                    self.objects[member].debug_name(),
                    change.slack()
                );
                self.requires_allocation = true;
                Ok(())
            }
        }
    }

    fn rebind_in_place(&mut self, member: usize) -> Result<(), MemoryError> {
        // A null block would mean requires_allocation was still set, which
        // the coalescing path already handled.
        let memory = self.memory;
        let object = self.objects[member].as_mut();
        let offset = object.region().offset();
        object.bind(memory, offset)?;
        if self.mapped_base.is_some() {
            self.map_member(member);
        }
        Ok(())
    }

    /// Run an allocation pass: free the previous block, lay out all
    /// members in insertion order, allocate and bind, and map host-visible
    /// blocks once. A no-op unless an allocation is required.
    pub fn allocate(&mut self) -> Result<(), MemoryError> {
        if !self.requires_allocation {
            return Ok(());
        }
        self.requires_allocation = false;

        if self.memory != vk::DeviceMemory::null() {
            self.release_block();
        }

        // Compute the layout: advance to each member's alignment, record
        // the offset, add its required size.
        let mut size: u64 = 0;
        for object in &mut self.objects {
            size = align_up(size, object.region().required_alignment());
            object.region_mut().set_offset(size);
            size += object.region().required_size();
        }

        if size == 0 {
            return Ok(());
        }

        log::debug!(
            "allocating {} bytes, memory type index {} ({:?})",
            size,
            self.memory_type_index,
            self.memory_flags
        );
        self.memory = self.device.allocate_memory(size, self.memory_type_index)?;

        for object in &mut self.objects {
            if object.state() >= ObjectState::Bound {
                object.unbind()?;
            }
            let offset = object.region().offset();
            log::debug!("binding '{}' at offset {}", object.debug_name(), offset);
            object.bind(self.memory, offset)?;
        }

        if self.host_visible() {
            let base = self.device.map_memory(self.memory, size)?;
            log::debug!("mapped {} bytes of memory type {}", size, self.memory_type_index);
            self.mapped_base = Some(MappedSlice {
                ptr: base,
                len: size,
            });
            for member in 0..self.objects.len() {
                self.map_member(member);
            }
        }

        Ok(())
    }

    /// Hand a member its sub-pointer into the block mapping. The slice
    /// length is the logical size, falling back to the required size for
    /// objects that compute their size from other attributes.
    fn map_member(&mut self, member: usize) {
        let base = self
            .mapped_base
            .expect("map_member requires a mapped block");
        let object = self.objects[member].as_mut();
        let offset = object.region().offset();
        let len = match object.region().size() {
            0 => object.region().required_size(),
            size => size,
        };
        // Offset stays within the block: the layout pass sized the block
        // as last offset + size.
        let ptr = unsafe { NonNull::new_unchecked(base.ptr.as_ptr().add(offset as usize)) };
        object.on_mapped(MappedSlice { ptr, len });
    }

    fn release_block(&mut self) {
        for object in &mut self.objects {
            object.region_mut().set_mapped(None);
        }
        self.mapped_base = None;
        self.device.free_memory(self.memory);
        self.memory = vk::DeviceMemory::null();
    }
}

impl Drop for MemoryTypeManager {
    fn drop(&mut self) {
        // Members destroy their own handles on drop; the manager owns only
        // the block.
        if self.memory != vk::DeviceMemory::null() {
            self.release_block();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::object::MemoryRegion;
    use ash::vk::Handle;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Driver stand-in recording every allocation and free.
    pub(crate) struct FakeDevice {
        pub flags: vk::MemoryPropertyFlags,
        next_handle: AtomicU64,
        pub allocated: Mutex<Vec<(u64, u64)>>, // (handle, size)
        pub freed: Mutex<Vec<u64>>,
        /// Backing storage for mappings, keyed by handle.
        mappings: Mutex<Vec<(u64, Box<[u8]>)>>,
    }

    impl FakeDevice {
        pub fn new(flags: vk::MemoryPropertyFlags) -> Arc<Self> {
            Arc::new(Self {
                flags,
                next_handle: AtomicU64::new(1),
                allocated: Mutex::new(Vec::new()),
                freed: Mutex::new(Vec::new()),
                mappings: Mutex::new(Vec::new()),
            })
        }

        pub fn allocation_count(&self) -> usize {
            self.allocated.lock().len()
        }

        pub fn last_allocated_size(&self) -> u64 {
            self.allocated.lock().last().expect("no allocation").1
        }
    }

    impl MemoryOps for FakeDevice {
        fn allocate_memory(
            &self,
            size: u64,
            _memory_type_index: u32,
        ) -> Result<vk::DeviceMemory, MemoryError> {
            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            self.allocated.lock().push((handle, size));
            Ok(vk::DeviceMemory::from_raw(handle))
        }

        fn free_memory(&self, memory: vk::DeviceMemory) {
            self.freed.lock().push(memory.as_raw());
            self.mappings.lock().retain(|(h, _)| *h != memory.as_raw());
        }

        fn map_memory(
            &self,
            memory: vk::DeviceMemory,
            size: u64,
        ) -> Result<NonNull<u8>, MemoryError> {
            let mut mappings = self.mappings.lock();
            mappings.push((memory.as_raw(), vec![0u8; size as usize].into_boxed_slice()));
            let ptr = mappings.last_mut().unwrap().1.as_mut_ptr();
            Ok(NonNull::new(ptr).unwrap())
        }

        fn memory_type_properties(&self, _memory_type_index: u32) -> vk::MemoryPropertyFlags {
            self.flags
        }
    }

    /// Resource stand-in tracking bind calls through a shared recorder.
    pub(crate) struct FakeObject {
        region: MemoryRegion,
        type_index: u32,
        bound_to: Arc<Mutex<Option<(u64, u64)>>>, // (memory handle, offset)
    }

    impl FakeObject {
        /// A fake whose handle already exists with known requirements.
        pub fn recreated(name: &str, size: u64, alignment: u64) -> Box<Self> {
            Self::recreated_with_type(name, size, alignment, 0)
        }

        /// Same, pinned to a specific compatible memory-type index.
        pub fn recreated_with_type(
            name: &str,
            size: u64,
            alignment: u64,
            type_index: u32,
        ) -> Box<Self> {
            let mut region = MemoryRegion::new(name, size);
            region.set_state(ObjectState::Recreated);
            region.record_requirements(vk::MemoryRequirements {
                size,
                alignment,
                memory_type_bits: 1 << type_index,
            });
            Box::new(Self {
                region,
                type_index,
                bound_to: Arc::new(Mutex::new(None)),
            })
        }

        pub fn recorder(&self) -> Arc<Mutex<Option<(u64, u64)>>> {
            self.bound_to.clone()
        }
    }

    impl MemoryBoundObject for FakeObject {
        fn region(&self) -> &MemoryRegion {
            &self.region
        }

        fn region_mut(&mut self) -> &mut MemoryRegion {
            &mut self.region
        }

        fn calculate_memory_type_index(
            &mut self,
            _flags: vk::MemoryPropertyFlags,
        ) -> Result<u32, MemoryError> {
            self.region.assert_state_past(ObjectState::Recreated);
            Ok(self.type_index)
        }

        fn bind(&mut self, memory: vk::DeviceMemory, offset: u64) -> Result<(), MemoryError> {
            self.region.assert_state(ObjectState::Recreated);
            self.region.set_state(ObjectState::Bound);
            *self.bound_to.lock() = Some((memory.as_raw(), offset));
            Ok(())
        }

        fn unbind(&mut self) -> Result<(), MemoryError> {
            self.region.assert_state(ObjectState::Bound);
            self.region.set_state(ObjectState::Recreated);
            Ok(())
        }

        fn recreate(&mut self, new_size: u64) -> Result<(), MemoryError> {
            self.region.set_size(new_size);
            self.region.set_state(ObjectState::Recreated);
            self.region.record_requirements(vk::MemoryRequirements {
                size: new_size,
                alignment: self.region.required_alignment(),
                memory_type_bits: self.region.memory_type_bits(),
            });
            Ok(())
        }
    }

    fn device_local_manager(device: Arc<FakeDevice>) -> MemoryTypeManager {
        MemoryTypeManager::new(device, 0)
    }

    /// Capture the change record for a member resized through the fake.
    fn resize_member(
        manager: &mut MemoryTypeManager,
        member: usize,
        new_size: u64,
    ) -> MemoryRequirementsChange {
        let region = manager.object(member).region();
        let old = MemoryRequirementsChange {
            old_offset: region.offset(),
            old_required_size: region.required_size(),
            old_required_alignment: region.required_alignment(),
            new_required_size: 0,
            new_required_alignment: 0,
        };
        manager.object_mut(member).recreate(new_size).unwrap();
        let region = manager.object(member).region();
        MemoryRequirementsChange {
            new_required_size: region.required_size(),
            new_required_alignment: region.required_alignment(),
            ..old
        }
    }

    #[test]
    fn layout_aligns_every_member_and_sums_total() {
        let device = FakeDevice::new(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        let mut manager = device_local_manager(device.clone());

        manager.add_object(FakeObject::recreated("a", 100, 16));
        manager.add_object(FakeObject::recreated("b", 10, 64));
        manager.add_object(FakeObject::recreated("c", 30, 32));
        manager.allocate().unwrap();

        // a: 0, b: align(100, 64) = 128, c: align(138, 32) = 160.
        assert_eq!(manager.object(0).region().offset(), 0);
        assert_eq!(manager.object(1).region().offset(), 128);
        assert_eq!(manager.object(2).region().offset(), 160);
        // Total = last offset + size, no gaps beyond alignment padding.
        assert_eq!(device.last_allocated_size(), 190);
    }

    #[test]
    fn members_bind_at_their_recorded_offsets() {
        let device = FakeDevice::new(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        let mut manager = device_local_manager(device);

        let (a, b) = (
            FakeObject::recreated("a", 64, 16),
            FakeObject::recreated("b", 64, 16),
        );
        let recorders = [a.recorder(), b.recorder()];
        manager.add_object(a);
        manager.add_object(b);
        manager.allocate().unwrap();

        let memory = manager.memory().as_raw();
        for (member, recorder) in recorders.iter().enumerate() {
            let offset = manager.object(member).region().offset();
            assert_eq!(*recorder.lock(), Some((memory, offset)));
            assert_eq!(manager.object(member).state(), ObjectState::Bound);
        }
    }

    #[test]
    fn allocate_twice_without_changes_is_idempotent() {
        let device = FakeDevice::new(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        let mut manager = device_local_manager(device.clone());

        manager.add_object(FakeObject::recreated("a", 128, 16));
        manager.allocate().unwrap();
        let block = manager.memory();

        manager.allocate().unwrap();
        assert_eq!(manager.memory(), block);
        assert_eq!(device.allocation_count(), 1);
        assert!(device.freed.lock().is_empty());
    }

    #[test]
    fn growing_member_triggers_reallocation() {
        let device = FakeDevice::new(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        let mut manager = device_local_manager(device.clone());

        let member = manager.add_object(FakeObject::recreated("a", 100, 16));
        manager.allocate().unwrap();
        let old_block = manager.memory();

        let change = resize_member(&mut manager, member, 150);
        assert_eq!(change.slack(), -50);
        manager.on_changed(member, Some(change)).unwrap();
        assert!(manager.requires_allocation());

        manager.allocate().unwrap();
        assert_ne!(manager.memory(), old_block);
        assert_eq!(device.freed.lock().as_slice(), &[old_block.as_raw()]);
        assert_eq!(device.last_allocated_size(), 150);
    }

    #[test]
    fn shrinking_member_rebinds_in_place() {
        let device = FakeDevice::new(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        let mut manager = device_local_manager(device.clone());

        let member = manager.add_object(FakeObject::recreated("a", 100, 16));
        manager.allocate().unwrap();
        let block = manager.memory();

        let change = resize_member(&mut manager, member, 80);
        assert_eq!(change.slack(), 20);
        manager.on_changed(member, Some(change)).unwrap();

        // No reallocation: same block, object bound again at its old offset.
        assert!(!manager.requires_allocation());
        assert_eq!(manager.memory(), block);
        assert_eq!(device.allocation_count(), 1);
        assert_eq!(manager.object(member).region().offset(), 0);
        assert_eq!(manager.object(member).state(), ObjectState::Bound);
    }

    #[test]
    fn change_while_reallocation_pending_is_coalesced() {
        let device = FakeDevice::new(vk::MemoryPropertyFlags::DEVICE_LOCAL);
        let mut manager = device_local_manager(device);

        let member = manager.add_object(FakeObject::recreated("a", 100, 16));
        // No allocate yet, so requires_allocation is still pending.
        manager.on_changed(member, None).unwrap();
        assert_eq!(manager.object(member).state(), ObjectState::Recreated);
    }

    #[test]
    fn host_visible_block_maps_every_member_once() {
        let device = FakeDevice::new(
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        let mut manager = device_local_manager(device);

        manager.add_object(FakeObject::recreated("a", 100, 16));
        manager.add_object(FakeObject::recreated("b", 50, 64));
        manager.allocate().unwrap();

        let base = manager.mapped_base.unwrap().ptr.as_ptr() as usize;
        for member in 0..2 {
            let region = manager.object(member).region();
            let mapped = region.mapped().expect("member not mapped");
            assert_eq!(mapped.ptr.as_ptr() as usize, base + region.offset() as usize);
            assert_eq!(mapped.len, region.size());
        }
    }

    #[test]
    fn reallocation_invalidates_previous_mappings() {
        let device = FakeDevice::new(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let mut manager = device_local_manager(device);

        let member = manager.add_object(FakeObject::recreated("a", 100, 16));
        manager.allocate().unwrap();

        let change = resize_member(&mut manager, member, 150);
        manager.on_changed(member, Some(change)).unwrap();
        manager.allocate().unwrap();

        // Mapped again against the new block.
        assert!(manager.object(member).region().mapped().is_some());
        assert_eq!(manager.object(member).region().mapped().unwrap().len, 150);
    }
}
