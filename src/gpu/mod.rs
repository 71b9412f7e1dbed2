mod error;
pub use error::*;

pub mod commands;

mod deletion;
pub use deletion::*;

mod descriptors;
pub use descriptors::*;

mod resources;
pub use resources::*;

mod immediate;
pub use immediate::*;

mod frame;
pub use frame::*;

mod swapchain;
pub use swapchain::*;

mod draw;
pub use draw::*;

mod device;
pub use device::*;

#[cfg(feature = "kiln-winit")]
mod window;
#[cfg(feature = "kiln-winit")]
pub use window::WindowInfo;

#[cfg(feature = "kiln-winit")]
mod engine;
#[cfg(feature = "kiln-winit")]
pub use engine::*;
