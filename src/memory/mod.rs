// Device-memory allocator core
//
// Groups many GPU-resident resources (buffers, images) into one shared
// memory block per memory-type index, tracks their offsets and alignment,
// and rebinds them when their requirements change. Not a general-purpose
// allocator: there is no free/reuse of sub-ranges within a block, only
// whole-object reallocation.

pub mod allocator;
pub mod buffer;
pub mod image;
pub mod manager;
pub mod object;

pub use allocator::{DeviceMemoryAllocator, ObjectKey};
pub use buffer::DeviceBuffer;
pub use image::DeviceImage;
pub use manager::MemoryTypeManager;
pub use object::{
    MappedSlice, MemoryBoundObject, MemoryRegion, MemoryRequirementsChange, ObjectState,
};

use crate::error::MemoryError;
use ash::vk;
use std::ptr::NonNull;

/// Native memory operations the manager needs from the driver. Implemented
/// by [`VulkanDevice`](crate::backend::VulkanDevice); tests supply fakes so
/// the layout logic runs without a GPU.
pub trait MemoryOps: Send + Sync {
    /// Allocate a memory block tagged with a memory-type index. Failure is
    /// fatal for the calling manager.
    fn allocate_memory(
        &self,
        size: u64,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, MemoryError>;

    /// Free a block previously returned by `allocate_memory`. Any mapping
    /// of the block becomes invalid.
    fn free_memory(&self, memory: vk::DeviceMemory);

    /// Map an entire host-visible block. Called at most once per block.
    fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> Result<NonNull<u8>, MemoryError>;

    /// Property flags of a memory-type index.
    fn memory_type_properties(&self, memory_type_index: u32) -> vk::MemoryPropertyFlags;
}
