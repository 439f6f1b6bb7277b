// Swap chain core
//
// Owns everything sized to the presentable-image count N or to the window:
// images, views, depth buffer, render pass, framebuffers, and the per-frame
// synchronization state. The whole struct is rebuilt from the surviving
// device context whenever the surface changes out from under us.

use ash::vk;
use std::sync::Arc;

use super::device::DeviceContext;
use super::error::{BackendError, Result};
use super::image;
use super::sync::{FrameRing, ImagesInFlight};

const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Result of trying to acquire the next presentable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is available. `suboptimal` means the frame should still be
    /// drawn and presented, but the caller should rebuild afterwards.
    Image { index: u32, suboptimal: bool },
    /// The swap chain no longer matches the surface. Nothing was acquired;
    /// rebuild and skip this frame.
    OutOfDate,
}

/// Result of queueing a presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented (or dropped) a stale frame; rebuild before the next one.
    NeedsRebuild,
}

pub struct Swapchain {
    device: Arc<DeviceContext>,
    pub loader: ash::extensions::khr::Swapchain,
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,

    pub depth_format: vk::Format,
    depth_image: vk::Image,
    depth_memory: vk::DeviceMemory,
    pub depth_view: vk::ImageView,

    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,

    pub frames: FrameRing,
    images_in_flight: ImagesInFlight,
}

impl Swapchain {
    /// Builds the full swap chain stack against the current surface state.
    /// `window_extent` is only consulted when the surface leaves the extent
    /// up to us. Fields are filled in creation order; on failure the struct
    /// drops with null placeholders in the not-yet-created slots, which
    /// Vulkan treats as no-ops to destroy.
    pub fn new(
        device: Arc<DeviceContext>,
        window_extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let support = device.query_swapchain_support()?;
        let surface_format = choose_surface_format(&support.formats)?;
        let present_mode = choose_present_mode(&support.present_modes, preferred_present_mode);
        let extent = choose_extent(&support.capabilities, window_extent);
        let image_count = choose_image_count(&support.capabilities);

        log::info!(
            "Creating swap chain: {}x{}, {:?}, {:?}, requesting {} images",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            image_count
        );

        let loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(BackendError::SwapchainCreation)?;
        let images = match unsafe { loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(BackendError::SwapchainCreation(e));
            }
        };
        log::info!("Swap chain delivered {} images", images.len());

        let image_count = images.len();
        let frames = match FrameRing::new(&device, frames_in_flight) {
            Ok(frames) => frames,
            Err(e) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(e);
            }
        };
        let mut swapchain = Self {
            device: device.clone(),
            loader,
            handle,
            images,
            image_views: Vec::new(),
            format: surface_format.format,
            extent,
            depth_format: vk::Format::UNDEFINED,
            depth_image: vk::Image::null(),
            depth_memory: vk::DeviceMemory::null(),
            depth_view: vk::ImageView::null(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            frames,
            images_in_flight: ImagesInFlight::new(image_count),
        };

        for &image in &swapchain.images {
            let view = image::create_image_view(
                &device,
                image,
                surface_format.format,
                vk::ImageAspectFlags::COLOR,
            )?;
            swapchain.image_views.push(view);
        }

        swapchain.depth_format = find_depth_format(&device)?;
        let (depth_image, depth_memory) = image::create_image(
            &device,
            extent.width,
            extent.height,
            swapchain.depth_format,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;
        swapchain.depth_image = depth_image;
        swapchain.depth_memory = depth_memory;
        swapchain.depth_view = image::create_image_view(
            &device,
            depth_image,
            swapchain.depth_format,
            vk::ImageAspectFlags::DEPTH,
        )?;
        image::transition_image_layout(
            &device,
            depth_image,
            swapchain.depth_format,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )?;

        swapchain.render_pass =
            create_render_pass(&device, surface_format.format, swapchain.depth_format)?;

        for &view in &swapchain.image_views {
            let attachments = [view, swapchain.depth_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(swapchain.render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let framebuffer = unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
                .map_err(BackendError::FramebufferCreation)?;
            swapchain.framebuffers.push(framebuffer);
        }

        Ok(swapchain)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Step 1 of the frame: block until the current slot's previous
    /// submission has retired.
    pub fn wait_for_current_frame(&self) -> Result<()> {
        let fence = self.frames.current().in_flight;
        unsafe {
            self.device
                .device
                .wait_for_fences(&[fence], true, u64::MAX)
        }
        .map_err(BackendError::FenceWait)
    }

    /// Step 2: acquire the next image, signaling the current slot's
    /// image-available semaphore once the image is really free.
    pub fn acquire(&self) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.handle,
                u64::MAX,
                self.frames.current().image_available,
                vk::Fence::null(),
            )
        };
        classify_acquire(result)
    }

    /// Step 3: claim the acquired image for the current slot, waiting out
    /// any other slot still rendering into it.
    pub fn claim_image(&mut self, image_index: u32) -> Result<()> {
        let fence = self.frames.current().in_flight;
        if let Some(prior) = self.images_in_flight.claim(image_index as usize, fence) {
            unsafe {
                self.device
                    .device
                    .wait_for_fences(&[prior], true, u64::MAX)
            }
            .map_err(BackendError::FenceWait)?;
        }
        Ok(())
    }

    /// Step 5: reset the slot fence and submit the frame's command buffer.
    /// The submission waits for the acquire semaphore at color-output so the
    /// vertex stages may start before the image is free.
    ///
    /// A failed submission leaves the already-reset fence with nothing to
    /// signal it, so the step-3 image claim is rolled back and the slot gets
    /// a fresh signaled fence; otherwise the next pass of this slot (and any
    /// later claimer of the image) would wait forever.
    pub fn submit(&mut self, image_index: u32, command_buffer: vk::CommandBuffer) -> Result<()> {
        let sync = self.frames.current();
        let in_flight = sync.in_flight;
        let wait_semaphores = [sync.image_available];
        let signal_semaphores = [sync.render_done];

        unsafe { self.device.device.reset_fences(&[in_flight]) }
            .map_err(BackendError::FenceReset)?;

        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        match unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info], in_flight)
        } {
            Ok(()) => Ok(()),
            Err(e) => {
                self.images_in_flight.release(image_index as usize, in_flight);
                self.frames
                    .replace_current_fence(&self.device.device)
                    .map_err(|fence_err| BackendError::Rebuild(Box::new(fence_err)))?;
                Err(BackendError::Submit(e))
            }
        }
    }

    /// Step 6: queue the image for presentation once rendering signals.
    pub fn present(&self, image_index: u32) -> Result<PresentOutcome> {
        let wait_semaphores = [self.frames.current().render_done];
        let swapchains = [self.handle];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let result = unsafe {
            self.loader
                .queue_present(self.device.present_queue, &present_info)
        };
        classify_present(result)
    }

    /// Step 7: move on to the next frame slot.
    pub fn advance_frame(&mut self) {
        self.frames.advance();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        log::debug!("Destroying swap chain");
        unsafe {
            self.frames.destroy(&self.device.device);
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            self.device.device.destroy_render_pass(self.render_pass, None);
            self.device.device.destroy_image_view(self.depth_view, None);
            self.device.device.destroy_image(self.depth_image, None);
            self.device.device.free_memory(self.depth_memory, None);
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.handle, None);
        }
    }
}

/// Prefers B8G8R8A8_SRGB in the sRGB nonlinear color space; otherwise the
/// first format the surface offers.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
        .ok_or(BackendError::NoSurfaceFormats)
}

/// Uses the preferred mode if the surface supports it, falling back to FIFO,
/// which every conformant driver provides.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface dictates the extent unless it reports the u32::MAX sentinel,
/// in which case the window size is clamped into the supported range.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: window_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: window_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more than the driver minimum so acquire rarely blocks, clamped to the
/// driver maximum when one exists (zero means unlimited).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && count > capabilities.max_image_count {
        count = capabilities.max_image_count;
    }
    count
}

/// First candidate format supporting optimal-tiling depth attachment.
pub fn select_depth_format<F>(format_properties: F) -> Result<vk::Format>
where
    F: Fn(vk::Format) -> vk::FormatProperties,
{
    DEPTH_FORMAT_CANDIDATES
        .iter()
        .copied()
        .find(|&format| {
            format_properties(format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or(BackendError::NoDepthFormat)
}

fn find_depth_format(device: &DeviceContext) -> Result<vk::Format> {
    select_depth_format(|format| unsafe {
        device
            .instance
            .get_physical_device_format_properties(device.physical_device, format)
    })
}

fn classify_acquire(result: std::result::Result<(u32, bool), vk::Result>) -> Result<AcquireOutcome> {
    match result {
        Ok((index, suboptimal)) => Ok(AcquireOutcome::Image { index, suboptimal }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
        Err(e) => Err(BackendError::Acquire(e)),
    }
}

fn classify_present(result: std::result::Result<bool, vk::Result>) -> Result<PresentOutcome> {
    match result {
        Ok(false) => Ok(PresentOutcome::Presented),
        Ok(true) => Ok(PresentOutcome::NeedsRebuild),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::NeedsRebuild),
        Err(e) => Err(BackendError::Present(e)),
    }
}

fn create_render_pass(
    device: &DeviceContext,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();
    // Depth contents are not needed after the pass, so they are discarded.
    let depth_attachment = vk::AttachmentDescription::builder()
        .format(depth_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let color_refs = [color_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref)
        .build();

    // Don't write attachments until the acquire semaphore lets the image go.
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();

    let attachments = [color_attachment, depth_attachment];
    let subpasses = [subpass];
    let dependencies = [dependency];
    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    unsafe { device.device.create_render_pass(&render_pass_info, None) }
        .map_err(BackendError::RenderPassCreation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn prefers_bgra_srgb() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [format(
            vk::Format::R8G8B8A8_UNORM,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn empty_format_list_is_an_error() {
        assert!(matches!(
            choose_surface_format(&[]),
            Err(BackendError::NoSurfaceFormats)
        ));
    }

    #[test]
    fn present_mode_honors_preference_when_available() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn surface_extent_wins_when_fixed() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let extent = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        );
        assert_eq!(extent.width, 800);
        assert_eq!(extent.height, 600);
    }

    #[test]
    fn window_extent_clamped_when_surface_defers() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..Default::default()
        };
        let extent = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 1920,
                height: 50,
            },
        );
        assert_eq!(extent.width, 1280);
        assert_eq!(extent.height, 100);
    }

    #[test]
    fn image_count_is_min_plus_one() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities), 3);
    }

    #[test]
    fn image_count_respects_driver_maximum() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities), 3);
    }

    #[test]
    fn depth_format_prefers_d32() {
        let all_support = |_| vk::FormatProperties {
            optimal_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            ..Default::default()
        };
        assert_eq!(
            select_depth_format(all_support).unwrap(),
            vk::Format::D32_SFLOAT
        );
    }

    #[test]
    fn depth_format_falls_through_candidates() {
        let only_d24 = |format| vk::FormatProperties {
            optimal_tiling_features: if format == vk::Format::D24_UNORM_S8_UINT {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::FormatFeatureFlags::empty()
            },
            ..Default::default()
        };
        assert_eq!(
            select_depth_format(only_d24).unwrap(),
            vk::Format::D24_UNORM_S8_UINT
        );
    }

    #[test]
    fn no_depth_format_is_an_error() {
        let none = |_| vk::FormatProperties::default();
        assert!(matches!(
            select_depth_format(none),
            Err(BackendError::NoDepthFormat)
        ));
    }

    #[test]
    fn acquire_out_of_date_is_recoverable() {
        let outcome = classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap();
        assert_eq!(outcome, AcquireOutcome::OutOfDate);
    }

    #[test]
    fn acquire_suboptimal_still_delivers_an_image() {
        let outcome = classify_acquire(Ok((1, true))).unwrap();
        assert_eq!(
            outcome,
            AcquireOutcome::Image {
                index: 1,
                suboptimal: true
            }
        );
    }

    #[test]
    fn acquire_hard_errors_propagate() {
        let err = classify_acquire(Err(vk::Result::ERROR_DEVICE_LOST)).unwrap_err();
        assert!(matches!(
            err,
            BackendError::Acquire(vk::Result::ERROR_DEVICE_LOST)
        ));
    }

    #[test]
    fn present_maps_stale_results_to_rebuild() {
        assert_eq!(
            classify_present(Ok(true)).unwrap(),
            PresentOutcome::NeedsRebuild
        );
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            PresentOutcome::NeedsRebuild
        );
        assert_eq!(
            classify_present(Ok(false)).unwrap(),
            PresentOutcome::Presented
        );
    }

    #[test]
    fn present_hard_errors_propagate() {
        let err = classify_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR)).unwrap_err();
        assert!(matches!(
            err,
            BackendError::Present(vk::Result::ERROR_SURFACE_LOST_KHR)
        ));
    }
}
