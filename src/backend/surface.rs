// Surface creation - platform-specific window connection
//
// ash-window lags behind winit's raw-window-handle revision, so the
// per-platform create-info plumbing is done by hand here.

use super::VulkanDevice;
use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use winit::window::Window;

/// Owned surface plus its loader, destroyed on drop.
pub struct WindowSurface {
    pub surface: vk::SurfaceKHR,
    pub loader: ash::extensions::khr::Surface,
}

impl WindowSurface {
    pub fn new(entry: &ash::Entry, device: &VulkanDevice, window: &Window) -> Result<Self> {
        let loader = ash::extensions::khr::Surface::new(entry, &device.instance);

        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();
        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();

        let surface = create_raw_surface(entry, device, display_handle, window_handle)?;

        // Verify the GPU supports presenting to this surface
        let supported = unsafe {
            loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )?
        };
        if !supported {
            unsafe { loader.destroy_surface(surface, None) };
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        Ok(Self { surface, loader })
    }
}

impl Drop for WindowSurface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

#[cfg(target_os = "windows")]
fn create_raw_surface(
    entry: &ash::Entry,
    device: &VulkanDevice,
    display_handle: RawDisplayHandle,
    window_handle: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    match (display_handle, window_handle) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance =
                handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            let loader = ash::extensions::khr::Win32Surface::new(entry, &device.instance);
            Ok(unsafe { loader.create_win32_surface(&create_info, None) }?)
        }
        _ => anyhow::bail!("Unsupported window handle type"),
    }
}

#[cfg(target_os = "linux")]
fn create_raw_surface(
    entry: &ash::Entry,
    device: &VulkanDevice,
    display_handle: RawDisplayHandle,
    window_handle: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    match (display_handle, window_handle) {
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(
                    display
                        .display
                        .map(|d| d.as_ptr())
                        .unwrap_or(std::ptr::null_mut()) as *mut _,
                )
                .window(window.window);
            let loader = ash::extensions::khr::XlibSurface::new(entry, &device.instance);
            Ok(unsafe { loader.create_xlib_surface(&create_info, None) }?)
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(window.surface.as_ptr());
            let loader = ash::extensions::khr::WaylandSurface::new(entry, &device.instance);
            Ok(unsafe { loader.create_wayland_surface(&create_info, None) }?)
        }
        _ => anyhow::bail!("Unsupported window handle type"),
    }
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
fn create_raw_surface(
    _entry: &ash::Entry,
    _device: &VulkanDevice,
    _display_handle: RawDisplayHandle,
    _window_handle: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    anyhow::bail!("Platform not supported")
}
