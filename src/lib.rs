// thinvk - thin Vulkan engine core
//
// Two pillars: an explicit device-memory allocator that packs whole
// resource groups into one vkAllocateMemory block per memory type, and
// a dedicated render thread driven by a cross-thread task queue.

pub mod backend;
pub mod config;
pub mod error;
pub mod memory;
pub mod render;
pub mod task;

pub use config::Config;
pub use error::{EngineError, EngineResult, MemoryError, TaskError};
