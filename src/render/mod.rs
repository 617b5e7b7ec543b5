// Render module - the dedicated render thread and what it drives

pub mod clear;
pub mod renderer;
pub mod thread;

pub use clear::ClearRenderer;
pub use renderer::{Renderer, SwapchainStatus};
pub use thread::{RenderContext, RenderThread, ThreadState};
