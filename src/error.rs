// Error taxonomy for the engine core
//
// Memory errors split recoverable (NoCompatibleMemoryType) from fatal
// (allocation / native-call failures). Task errors separate policy
// cancellation from real failures. All variants are Clone so a terminal
// error can be handed to every waiter of the same future.

use ash::vk;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the device-memory subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// No memory type satisfies both the resource's type bitmask and the
    /// requested property flags. Recoverable: pick different usage flags.
    #[error(
        "no compatible memory type for type bits {type_bits:#b} with properties {flags:?}"
    )]
    NoCompatibleMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    /// vkAllocateMemory failed. Fatal: indicates device/driver exhaustion.
    #[error("device memory allocation of {size} bytes failed: {result:?}")]
    AllocationFailure { size: u64, result: vk::Result },

    /// Any other native call (bind, map, handle creation) failed. Fatal.
    #[error("native call {call} failed: {result:?}")]
    NativeCall {
        call: &'static str,
        result: vk::Result,
    },
}

/// Top-level error type carried by futures and the thread-death future.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("native call {call} failed: {result:?}")]
    Native {
        call: &'static str,
        result: vk::Result,
    },

    #[error("renderer error: {0}")]
    Renderer(String),
}

impl EngineError {
    /// Shorthand for wrapping a raw Vulkan result from a named call.
    pub fn native(call: &'static str, result: vk::Result) -> Self {
        EngineError::Native { call, result }
    }
}

// Backend setup paths report through anyhow; flatten the context chain
// when such an error crosses into a task future.
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Renderer(format!("{err:#}"))
    }
}

/// Error side of a task future.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The submission was rejected by the at-most-one-pending-per-id policy.
    /// Not a failure.
    #[error("task cancelled")]
    Cancelled,

    /// The task's work returned an error. Attached to this task's future
    /// only; never aborts the drain loop.
    #[error("task failed: {0}")]
    Failed(#[source] EngineError),
}
