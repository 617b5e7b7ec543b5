// Clear-screen renderer
//
// The simplest full Renderer: pre-records one command buffer per
// swapchain image that transitions the image, clears it to the
// configured color and hands it to present. Static content, so the
// buffers are recorded once per swapchain and resubmitted every frame.

use crate::backend::sync::FrameSync;
use crate::backend::{Swapchain, VulkanDevice, WindowSurface};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::render::renderer::{Renderer, SwapchainStatus};
use ash::vk;
use std::sync::Arc;
use winit::window::Window;

pub struct ClearRenderer {
    device: Arc<VulkanDevice>,
    window: Arc<Window>,
    surface: WindowSurface,

    clear_color: [f32; 4],
    preferred_present_mode: vk::PresentModeKHR,
    max_frames_in_flight: usize,
    wait_stages: [vk::PipelineStageFlags; 1],

    swapchain: Option<Swapchain>,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    frame_sync: Vec<FrameSync>,
    current_frame: usize,
    needs_resize: bool,
    closed: bool,
}

impl ClearRenderer {
    pub fn new(
        device: Arc<VulkanDevice>,
        window: Arc<Window>,
        surface: WindowSurface,
        config: &Config,
    ) -> EngineResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .map_err(|r| EngineError::native("vkCreateCommandPool", r))?;

        let frame_sync = FrameSync::for_frames(&device, config.graphics.max_frames_in_flight)?;

        let mut renderer = Self {
            device,
            window,
            surface,
            clear_color: config.graphics.clear_color,
            preferred_present_mode: config.get_present_mode(),
            max_frames_in_flight: config.graphics.max_frames_in_flight,
            wait_stages: [vk::PipelineStageFlags::TRANSFER],
            swapchain: None,
            command_pool,
            command_buffers: Vec::new(),
            frame_sync,
            current_frame: 0,
            needs_resize: false,
            closed: false,
        };
        renderer.rebuild_swapchain()?;
        Ok(renderer)
    }

    /// Drop the old swapchain, build one for the current window size and
    /// re-record the command buffers. The surface can only carry one
    /// swapchain at a time, so the old one goes first.
    fn rebuild_swapchain(&mut self) -> EngineResult<SwapchainStatus> {
        self.swapchain = None;

        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            return Ok(SwapchainStatus::ZeroArea);
        }

        let swapchain = Swapchain::new(
            self.device.clone(),
            self.surface.surface,
            &self.surface.loader,
            size.width,
            size.height,
            self.preferred_present_mode,
        )?;

        self.free_command_buffers();
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(swapchain.images.len() as u32);
        self.command_buffers =
            unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
                .map_err(|r| EngineError::native("vkAllocateCommandBuffers", r))?;

        self.record_command_buffers(&swapchain)?;

        log::info!(
            "Recorded {} clear command buffers for {}x{}",
            self.command_buffers.len(),
            swapchain.extent.width,
            swapchain.extent.height
        );

        self.swapchain = Some(swapchain);
        self.needs_resize = false;
        Ok(SwapchainStatus::Ok)
    }

    fn record_command_buffers(&self, swapchain: &Swapchain) -> EngineResult<()> {
        let device = &self.device.device;
        let clear_color = vk::ClearColorValue {
            float32: self.clear_color,
        };
        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        for (i, &cmd) in self.command_buffers.iter().enumerate() {
            let image = swapchain.images[i];

            unsafe {
                let begin_info = vk::CommandBufferBeginInfo::builder();
                device
                    .begin_command_buffer(cmd, &begin_info)
                    .map_err(|r| EngineError::native("vkBeginCommandBuffer", r))?;

                // UNDEFINED -> TRANSFER_DST so the image can be cleared
                let barrier_to_transfer = vk::ImageMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(subresource_range)
                    .build();

                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier_to_transfer],
                );

                device.cmd_clear_color_image(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &clear_color,
                    &[subresource_range],
                );

                // TRANSFER_DST -> PRESENT_SRC for presentation
                let barrier_to_present = vk::ImageMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::empty())
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(subresource_range)
                    .build();

                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier_to_present],
                );

                device
                    .end_command_buffer(cmd)
                    .map_err(|r| EngineError::native("vkEndCommandBuffer", r))?;
            }
        }

        Ok(())
    }

    fn free_command_buffers(&mut self) {
        if !self.command_buffers.is_empty() {
            unsafe {
                self.device
                    .device
                    .free_command_buffers(self.command_pool, &self.command_buffers);
            }
            self.command_buffers.clear();
        }
    }

    fn release_resources(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.swapchain = None;
        self.free_command_buffers();
        for sync in self.frame_sync.drain(..) {
            sync.destroy(&self.device.device);
        }
        unsafe {
            self.device
                .device
                .destroy_command_pool(self.command_pool, None);
        }
    }
}

impl Renderer for ClearRenderer {
    fn render(&mut self) -> EngineResult<()> {
        // A mid-frame out-of-date from the previous render is fixed here,
        // without waiting for an external resize notification.
        if self.needs_resize {
            self.wait_idle()?;
            if self.rebuild_swapchain()? == SwapchainStatus::ZeroArea {
                return Ok(());
            }
        }
        let Some(swapchain) = self.swapchain.as_ref() else {
            return Ok(());
        };
        let device = &self.device;
        let sync = &self.frame_sync[self.current_frame];

        // Acquire before the fence wait: the GPU can start acquiring
        // while the CPU waits for the previous frame in this slot.
        let Some((image_index, suboptimal)) =
            swapchain.acquire_next_image(u64::MAX, sync.image_available)?
        else {
            self.needs_resize = true;
            return Ok(());
        };
        if suboptimal {
            self.needs_resize = true;
        }

        unsafe {
            device
                .device
                .wait_for_fences(&[sync.in_flight_fence], true, u64::MAX)
                .map_err(|r| EngineError::native("vkWaitForFences", r))?;
            device
                .device
                .reset_fences(&[sync.in_flight_fence])
                .map_err(|r| EngineError::native("vkResetFences", r))?;
        }

        let wait_semaphores = [sync.image_available];
        let signal_semaphores = [sync.render_finished];
        let command_buffers = [self.command_buffers[image_index as usize]];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device
                .device
                .queue_submit(
                    device.graphics_queue,
                    &[submit_info.build()],
                    sync.in_flight_fence,
                )
                .map_err(|r| EngineError::native("vkQueueSubmit", r))?;
        }

        // Suboptimal and out-of-date both come back as `true`; anything
        // else is a real device failure and must reach the caller.
        if swapchain.present(device.graphics_queue, image_index, &signal_semaphores)? {
            self.needs_resize = true;
        }

        self.current_frame = (self.current_frame + 1) % self.max_frames_in_flight;
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> EngineResult<SwapchainStatus> {
        self.rebuild_swapchain()
    }

    fn wait_idle(&mut self) -> EngineResult<()> {
        self.device
            .wait_idle()
            .map_err(|r| EngineError::native("vkDeviceWaitIdle", r))
    }

    fn close(&mut self) -> EngineResult<()> {
        self.release_resources();
        Ok(())
    }
}

impl Drop for ClearRenderer {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.release_resources();
    }
}
