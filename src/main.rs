// =============================================================================
// DEMO BINARY - clear renderer on the dedicated render thread
// =============================================================================
//
// The event-loop thread only creates the window and forwards window events
// to the render thread; all Vulkan work happens over there.
//
// FLOW:
// 1. Create window, device and surface on the event-loop thread
// 2. Spawn the render thread; the renderer is built on that thread
// 3. During warm-up, upload demo resources through the task queue
// 4. End warm-up; the render thread clears and presents continuously
// 5. On close, a blocking stop task drains the GPU and releases resources
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;
use thinvk::backend::{VulkanDevice, WindowSurface};
use thinvk::config::Config;
use thinvk::memory::{DeviceMemoryAllocator, MemoryOps, ObjectKey};
use thinvk::render::{ClearRenderer, RenderThread};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

fn main() -> Result<()> {
    let config = Config::load();

    init_logging();
    log::info!("Starting thinvk demo");
    log::info!("Window: {}x{}", config.window.width, config.window.height);
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

/// Event-loop side of the application. Everything Vulkan lives on the
/// render thread; this struct only holds the handles to reach it.
struct App {
    config: Config,
    window: Option<Arc<Window>>,
    device: Option<Arc<VulkanDevice>>,
    render_thread: Option<RenderThread<ClearRenderer>>,
    allocator: Option<Arc<Mutex<DeviceMemoryAllocator>>>,
    demo_buffers: Vec<ObjectKey>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            window: None,
            device: None,
            render_thread: None,
            allocator: None,
            demo_buffers: Vec::new(),
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        let window = Arc::new(event_loop.create_window(window_attributes)?);

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(&self.config.window.title, enable_validation)?;

        let entry = unsafe { ash::Entry::load()? };
        let surface = WindowSurface::new(&entry, &device, &window)?;

        // The renderer itself is built on the render thread.
        let render_config = self.config.clone();
        let render_device = device.clone();
        let render_window = window.clone();
        let render_thread =
            RenderThread::spawn(self.config.render_thread.task_budget(), move || {
                ClearRenderer::new(render_device, render_window, surface, &render_config)
            })?;
        render_thread
            .created()
            .wait()
            .context("renderer construction failed")?;

        // Warm-up: group a couple of demo buffers into shared memory blocks
        // through the task queue, so the uploads run on the render thread.
        let allocator = Arc::new(Mutex::new(DeviceMemoryAllocator::new(
            device.clone() as Arc<dyn MemoryOps>,
            "demo",
        )));
        let task_allocator = allocator.clone();
        let task_device = device.clone();
        let upload = render_thread.queue().queue_for_execution(move |_ctx| {
            let mut allocator = task_allocator.lock();
            let vertex = allocator.create_buffer(
                &task_device,
                "demo/vertex",
                64 * 1024,
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            let staging = allocator.create_buffer(
                &task_device,
                "demo/staging",
                64 * 1024,
                vk::BufferUsageFlags::TRANSFER_SRC,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            allocator.allocate_all()?;
            Ok(vec![vertex, staging])
        });

        render_thread.end_warm_up();
        render_thread
            .warmed_up()
            .wait()
            .context("render thread warm-up failed")?;
        self.demo_buffers = upload.get().context("demo resource upload failed")?;
        log::info!(
            "Warm-up complete, {} demo buffers allocated",
            self.demo_buffers.len()
        );

        self.window = Some(window);
        self.device = Some(device);
        self.render_thread = Some(render_thread);
        self.allocator = Some(allocator);
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(render_thread) = self.render_thread.take() {
            log::info!("Stopping render thread...");
            if !render_thread.death().is_done() {
                // Allocator blocks must be released on the render thread,
                // before the renderer closes the device-adjacent resources.
                if let Some(allocator) = self.allocator.take() {
                    render_thread.queue().queue_for_execution(move |_ctx| {
                        drop(allocator);
                        Ok(())
                    });
                }
                if let Err(e) = render_thread.on_close().wait() {
                    log::error!("Stop task failed: {e}");
                }
            }
            if let Err(e) = render_thread.join() {
                log::error!("Render thread died with error: {e}");
            }
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            log::error!("Failed to initialize: {e:?}");
            event_loop.exit();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(render_thread) = &self.render_thread {
                    render_thread.on_framebuffer_size(size.width, size.height);
                }
            }

            WindowEvent::Occluded(occluded) => {
                if let Some(render_thread) = &self.render_thread {
                    render_thread.on_iconify(occluded);
                }
            }

            WindowEvent::RedrawRequested => {
                // The render thread draws continuously; a refresh forces a
                // frame ahead of the regular cadence so the surface is not
                // presented stale mid-resize. Cancelled means one is
                // already queued.
                if let Some(render_thread) = &self.render_thread {
                    if let Err(e) = render_thread.on_refresh().wait() {
                        log::debug!("refresh task skipped: {e}");
                    }
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(KeyCode::Escape) = event.physical_key {
                        log::info!("ESC pressed, exiting...");
                        self.shutdown();
                        event_loop.exit();
                    }
                }
            }

            _ => {}
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
    }
}
