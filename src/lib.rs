pub mod utils;
pub mod gpu;

pub use gpu::*;
