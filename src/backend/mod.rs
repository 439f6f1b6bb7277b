// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. The device context outlives everything; the
// swap chain and the resources sized to it are rebuilt when the window
// changes.

pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::DeviceContext;
pub use error::{BackendError, Result};
pub use swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
