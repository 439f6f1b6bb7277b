// Backend error taxonomy
//
// One variant per distinct failure site, so a failure anywhere in the
// multi-step initializers is attributable without string matching.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    // Device Context
    #[error("failed to load the Vulkan library")]
    LibraryLoad(#[from] ash::LoadingError),
    #[error("validation layer {0} is not available")]
    MissingValidationLayer(String),
    #[error("failed to create Vulkan instance")]
    InstanceCreation(#[source] vk::Result),
    #[error("failed to create debug messenger")]
    DebugMessengerCreation(#[source] vk::Result),
    #[error("failed to create window surface")]
    SurfaceCreation(#[source] vk::Result),
    #[error("no Vulkan-capable devices detected")]
    NoDevices,
    #[error("no suitable Vulkan device")]
    NoSuitableDevice,
    #[error("failed to create logical device")]
    DeviceCreation(#[source] vk::Result),
    #[error("failed to create command pool")]
    CommandPoolCreation(#[source] vk::Result),

    // Resource primitives
    #[error("no memory type satisfies filter {type_filter:#b} with properties {properties:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    },
    #[error("failed to create buffer")]
    BufferCreation(#[source] vk::Result),
    #[error("failed to allocate device memory")]
    MemoryAllocation(#[source] vk::Result),
    #[error("failed to bind device memory")]
    MemoryBind(#[source] vk::Result),
    #[error("failed to map device memory")]
    MemoryMap(#[source] vk::Result),
    #[error("failed to create image")]
    ImageCreation(#[source] vk::Result),
    #[error("failed to create image view")]
    ImageViewCreation(#[source] vk::Result),
    #[error("unsupported image layout transition {0:?} -> {1:?}")]
    UnsupportedLayoutTransition(vk::ImageLayout, vk::ImageLayout),
    #[error("failed to create sampler")]
    SamplerCreation(#[source] vk::Result),
    #[error("one-shot command buffer failed")]
    OneShotCommand(#[source] vk::Result),

    // Swap chain core
    #[error("surface query failed")]
    SurfaceQuery(#[source] vk::Result),
    #[error("surface reports no formats")]
    NoSurfaceFormats,
    #[error("failed to create swap chain")]
    SwapchainCreation(#[source] vk::Result),
    #[error("no supported depth format")]
    NoDepthFormat,
    #[error("failed to create render pass")]
    RenderPassCreation(#[source] vk::Result),
    #[error("failed to create framebuffer")]
    FramebufferCreation(#[source] vk::Result),
    #[error("failed to create synchronization primitives")]
    SyncCreation(#[source] vk::Result),

    // Connection layer
    #[error("failed to read shader {path}")]
    ShaderRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create shader module")]
    ShaderModuleCreation(#[source] vk::Result),
    #[error("failed to create descriptor set layout")]
    DescriptorLayoutCreation(#[source] vk::Result),
    #[error("failed to create descriptor pool")]
    DescriptorPoolCreation(#[source] vk::Result),
    #[error("failed to allocate descriptor sets")]
    DescriptorSetAllocation(#[source] vk::Result),
    #[error("failed to create pipeline layout")]
    PipelineLayoutCreation(#[source] vk::Result),
    #[error("failed to create graphics pipeline")]
    PipelineCreation(#[source] vk::Result),
    #[error("failed to allocate command buffers")]
    CommandBufferAllocation(#[source] vk::Result),
    #[error("command buffer recording failed")]
    CommandRecording(#[source] vk::Result),

    // Presentation cycle
    #[error("fence wait failed")]
    FenceWait(#[source] vk::Result),
    #[error("fence reset failed")]
    FenceReset(#[source] vk::Result),
    #[error("image acquisition returned {0:?}")]
    Acquire(vk::Result),
    #[error("queue submission failed")]
    Submit(#[source] vk::Result),
    #[error("presentation returned {0:?}")]
    Present(vk::Result),
    #[error("device wait idle failed")]
    DeviceWaitIdle(#[source] vk::Result),

    // Rebuild
    #[error("swap chain rebuild failed")]
    Rebuild(#[source] Box<BackendError>),
}

impl BackendError {
    /// A failed rebuild leaves no well-defined state to fall back to, so the
    /// frame loop must terminate instead of retrying. Every other frame-level
    /// error is logged and the loop continues.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Rebuild(_))
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuild_errors_are_fatal() {
        let inner = BackendError::NoDepthFormat;
        assert!(!inner.is_fatal());
        assert!(BackendError::Rebuild(Box::new(inner)).is_fatal());
    }

    #[test]
    fn hard_frame_errors_are_not_fatal() {
        assert!(!BackendError::Acquire(vk::Result::ERROR_DEVICE_LOST).is_fatal());
        assert!(!BackendError::Present(vk::Result::ERROR_SURFACE_LOST_KHR).is_fatal());
        assert!(!BackendError::Submit(vk::Result::ERROR_OUT_OF_HOST_MEMORY).is_fatal());
    }
}
