use ash::vk;
use std::fmt;

/// Crate-wide error type.
///
/// Swapchain out-of-date conditions never appear here; they are absorbed by
/// the frame ring and turned into a rebuild request. What does appear is
/// either a raw Vulkan failure or an exhaustion condition with enough context
/// to diagnose it (which allocation, what size, what pool state).
#[derive(Debug)]
pub enum GpuError {
    Vulkan(vk::Result),
    Loading(ash::LoadingError),
    Window(&'static str),
    NoSuitableGpu,
    SlotExhausted(&'static str),
    BufferWriteOverflow {
        len: u64,
        capacity: u64,
    },
    AllocationFailed {
        what: &'static str,
        size: u64,
        cause: vk::Result,
    },
    DescriptorPoolExhausted {
        sets_per_pool: u32,
        cause: vk::Result,
    },
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::Vulkan(res) => write!(f, "Vulkan error: {}", res),
            GpuError::Loading(err) => write!(f, "failed to load Vulkan library: {}", err),
            GpuError::Window(msg) => write!(f, "window error: {}", msg),
            GpuError::NoSuitableGpu => write!(f, "no physical device with a graphics queue"),
            GpuError::SlotExhausted(what) => write!(f, "ran out of {} slots", what),
            GpuError::BufferWriteOverflow { len, capacity } => write!(
                f,
                "write of {} bytes exceeds buffer capacity of {} bytes",
                len, capacity
            ),
            GpuError::AllocationFailed { what, size, cause } => {
                write!(f, "failed to allocate {} of {} bytes: {}", what, size, cause)
            }
            GpuError::DescriptorPoolExhausted {
                sets_per_pool,
                cause,
            } => write!(
                f,
                "descriptor allocation failed even from a fresh pool ({} sets): {}",
                sets_per_pool, cause
            ),
        }
    }
}

impl std::error::Error for GpuError {}

impl From<vk::Result> for GpuError {
    fn from(res: vk::Result) -> Self {
        GpuError::Vulkan(res)
    }
}

impl From<ash::LoadingError> for GpuError {
    fn from(err: ash::LoadingError) -> Self {
        GpuError::Loading(err)
    }
}

/// Convenient crate-wide result type.
pub type Result<T, E = GpuError> = std::result::Result<T, E>;
