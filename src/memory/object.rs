// Memory-bound object lifecycle
//
// A GPU resource (buffer or image) that needs backing memory from a
// specific memory-type index before use. The state machine is strictly
// increasing except for the explicit unbind reset:
//
//   NotCreated -> Recreated -> Bound
//                     ^          |
//                     +----------+  unbind (handle destroyed + recreated)
//
// Lifecycle violations are programming errors and fail with a fatal
// assertion, mirroring the state checks the driver itself would trip over.

use crate::error::MemoryError;
use ash::vk;
use std::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObjectState {
    /// Nothing has been created yet.
    NotCreated,
    /// The native handle exists; no memory is bound. `bind` may be called.
    Recreated,
    /// Memory has been bound. `bind` may not be called again.
    Bound,
}

/// Pointer into the host-visible mapping of an owning memory block,
/// already offset to this object's slot.
#[derive(Debug, Clone, Copy)]
pub struct MappedSlice {
    pub ptr: NonNull<u8>,
    pub len: u64,
}

// The pointer targets driver-mapped memory owned by the manager, not
// thread-local state.
unsafe impl Send for MappedSlice {}

/// Bookkeeping shared by every memory-bound object, embedded in each
/// concrete resource type.
#[derive(Debug)]
pub struct MemoryRegion {
    debug_name: String,
    /// Requested logical size in bytes.
    size: u64,
    /// Driver-required size; may exceed `size`.
    required_size: u64,
    /// Driver-required alignment.
    required_alignment: u64,
    /// Compatible memory-type bitmask from the driver.
    memory_type_bits: u32,
    /// Offset within the owning block. Valid only once the owning manager
    /// has returned from an allocation pass.
    offset: u64,
    state: ObjectState,
    mapped: Option<MappedSlice>,
}

impl MemoryRegion {
    pub fn new(debug_name: impl Into<String>, size: u64) -> Self {
        Self {
            debug_name: debug_name.into(),
            size,
            required_size: 0,
            required_alignment: 1,
            memory_type_bits: 0,
            offset: 0,
            state: ObjectState::NotCreated,
            mapped: None,
        }
    }

    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn required_size(&self) -> u64 {
        self.required_size
    }

    pub fn required_alignment(&self) -> u64 {
        self.required_alignment
    }

    pub fn memory_type_bits(&self) -> u32 {
        self.memory_type_bits
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub fn mapped(&self) -> Option<MappedSlice> {
        self.mapped
    }

    pub(crate) fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub(crate) fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub(crate) fn set_state(&mut self, state: ObjectState) {
        self.state = state;
    }

    pub(crate) fn set_mapped(&mut self, mapped: Option<MappedSlice>) {
        self.mapped = mapped;
    }

    /// Record the driver's answer to a memory-requirements query.
    pub(crate) fn record_requirements(&mut self, requirements: vk::MemoryRequirements) {
        self.required_size = requirements.size;
        self.required_alignment = requirements.alignment.max(1);
        self.memory_type_bits = requirements.memory_type_bits;
    }

    pub(crate) fn assert_state(&self, expected: ObjectState) {
        assert!(
            self.state == expected,
            "'{}' must be in state {:?} for this call, but is in {:?}",
            self.debug_name,
            expected,
            self.state
        );
    }

    pub(crate) fn assert_state_past(&self, expected: ObjectState) {
        assert!(
            self.state >= expected,
            "'{}' must be past state {:?} for this call, but is in {:?}",
            self.debug_name,
            expected,
            self.state
        );
    }
}

/// Round `value` up to the next multiple of `alignment`.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 || value % alignment == 0 {
        value
    } else {
        value + alignment - value % alignment
    }
}

/// Old and newly queried requirements of one object, captured when its
/// handle is recreated. Used only to decide, without a full reallocation,
/// whether the object still fits in its current slot. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirementsChange {
    pub old_offset: u64,
    pub old_required_size: u64,
    pub old_required_alignment: u64,
    pub new_required_size: u64,
    pub new_required_alignment: u64,
}

impl MemoryRequirementsChange {
    /// Extra bytes needed to realign the old offset to the new alignment.
    pub fn alignment_fix(&self) -> u64 {
        align_up(self.old_offset, self.new_required_alignment) - self.old_offset
    }

    /// `old_size - (new_size + alignment_fix)`; negative means the object
    /// no longer fits in its current slot.
    pub fn slack(&self) -> i64 {
        self.old_required_size as i64 - (self.new_required_size + self.alignment_fix()) as i64
    }

    pub fn still_fits(&self) -> bool {
        self.slack() >= 0
    }
}

/// Seam between the memory-type manager and a concrete GPU resource.
///
/// The manager owns objects of this trait, lays them out inside its memory
/// block, and binds them; the object owns only its native handle. Concrete
/// implementations are [`DeviceBuffer`](super::DeviceBuffer) and
/// [`DeviceImage`](super::DeviceImage).
pub trait MemoryBoundObject: Send {
    fn region(&self) -> &MemoryRegion;
    fn region_mut(&mut self) -> &mut MemoryRegion;

    /// Query driver requirements and pick a memory-type index satisfying
    /// both the resource's type bitmask and `flags`. Requires the native
    /// handle to exist (state at least `Recreated`).
    fn calculate_memory_type_index(
        &mut self,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32, MemoryError>;

    /// Bind the native handle at `offset` into `memory`. Requires exactly
    /// `Recreated`; binding twice without an intervening unbind is a fatal
    /// assertion.
    fn bind(&mut self, memory: vk::DeviceMemory, offset: u64) -> Result<(), MemoryError>;

    /// Release the current binding by destroying and recreating the native
    /// handle (a once-bound Vulkan handle cannot be rebound). Requires
    /// `Bound`; returns the object to `Recreated`.
    fn unbind(&mut self) -> Result<(), MemoryError>;

    /// Destroy and recreate the native handle with a new logical size,
    /// returning the object to `Recreated` with freshly recorded
    /// requirements.
    fn recreate(&mut self, new_size: u64) -> Result<(), MemoryError>;

    fn debug_name(&self) -> &str {
        self.region().debug_name()
    }

    fn state(&self) -> ObjectState {
        self.region().state()
    }

    /// Called by the manager after mapping a host-visible block; `slice`
    /// is already offset to this object's slot.
    fn on_mapped(&mut self, slice: MappedSlice) {
        self.region_mut().set_mapped(Some(slice));
    }
}
