use crate::error::EngineResult;

/// Outcome of a swapchain rebuild attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStatus {
    /// Swapchain rebuilt and ready for rendering.
    Ok,
    /// The drawable area is zero (window minimized or collapsed);
    /// no swapchain exists and rendering must pause.
    ZeroArea,
}

/// What the render thread drives. One `render` call produces one frame.
///
/// Implementations own the swapchain and all per-frame resources; the
/// render thread only decides *when* to call each method.
pub trait Renderer: Send + 'static {
    /// Record and submit one frame.
    fn render(&mut self) -> EngineResult<()>;

    /// Tear down and rebuild the swapchain for the current window size.
    fn recreate_swapchain(&mut self) -> EngineResult<SwapchainStatus>;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&mut self) -> EngineResult<()>;

    /// Release resources. Called once, after the final `wait_idle`.
    fn close(&mut self) -> EngineResult<()>;
}
