mod handle;
pub use handle::*;
