use ash::vk;
use winit::dpi::PhysicalSize;
use winit::event_loop::EventLoop;
use winit::window::WindowBuilder;

use super::{GpuError, Result};

/// Creation parameters for the renderer's window.
#[derive(Clone, Debug)]
pub struct WindowInfo {
    pub title: String,
    pub size: [u32; 2],
    pub resizable: bool,
}

impl Default for WindowInfo {
    fn default() -> Self {
        Self {
            title: "kiln".to_string(),
            size: [1700, 900],
            resizable: true,
        }
    }
}

pub(super) fn create_window(
    entry: &ash::Entry,
    instance: &ash::Instance,
    info: &WindowInfo,
) -> Result<(EventLoop<()>, winit::window::Window, vk::SurfaceKHR)> {
    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title(info.title.clone())
        .with_inner_size(PhysicalSize::new(info.size[0], info.size[1]))
        .with_resizable(info.resizable)
        .build(&event_loop)
        .map_err(|_| GpuError::Window("failed to create window"))?;

    let surface = unsafe { ash_window::create_surface(entry, instance, &window, None)? };

    Ok((event_loop, window, surface))
}
