// Device context - the one GPU connection
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Surface creation through ash-window
// - Physical device selection (first suitable device in enumeration order)
// - Logical device + graphics/present queue creation
// - The shared command pool

use ash::{vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;
use winit::window::Window;

use super::error::{BackendError, Result};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 1] = [vk::KhrSwapchainFn::name()];

/// Everything a physical device reports about presenting to a surface.
/// Consulted once during device selection and again on every swap chain
/// (re)construction, because the capabilities change with the window.
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

#[derive(Clone, Copy, Default)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }
}

/// Vulkan device wrapper with automatic cleanup.
pub struct DeviceContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::extensions::khr::Surface,

    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilyIndices,
    pub command_pool: vk::CommandPool,

    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Cached so callers don't re-query per frame
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub anisotropy_enabled: bool,
}

impl DeviceContext {
    /// Establishes the whole GPU connection: instance, surface, physical
    /// device, logical device, queues, and command pool. Any failure releases
    /// whatever was already constructed before returning.
    pub fn new(window: &Window, enable_validation: bool, anisotropy: bool) -> Result<Arc<Self>> {
        let entry = unsafe { Entry::load()? };

        if enable_validation {
            check_validation_layer(&entry)?;
        }

        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        let instance = create_instance(&entry, display_handle, enable_validation)?;

        // Drop only runs on the finished struct, so until the end of this
        // function every failure path releases handles by hand.
        let debug_utils = if enable_validation {
            match create_debug_messenger(&entry, &instance) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);
        let surface = match unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        } {
            Ok(surface) => surface,
            Err(e) => {
                destroy_partial(&instance, debug_utils, None, None);
                return Err(BackendError::SurfaceCreation(e));
            }
        };

        let (physical_device, queue_families) =
            match pick_physical_device(&instance, &surface_loader, surface, anisotropy) {
                Ok(picked) => picked,
                Err(e) => {
                    destroy_partial(&instance, debug_utils, Some((&surface_loader, surface)), None);
                    return Err(e);
                }
            };

        let (device, graphics_queue, present_queue) =
            match create_logical_device(&instance, physical_device, queue_families, anisotropy) {
                Ok(created) => created,
                Err(e) => {
                    destroy_partial(&instance, debug_utils, Some((&surface_loader, surface)), None);
                    return Err(e);
                }
            };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_families.graphics.unwrap_or(0))
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                destroy_partial(
                    &instance,
                    debug_utils,
                    Some((&surface_loader, surface)),
                    Some(&device),
                );
                return Err(BackendError::CommandPoolCreation(e));
            }
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            surface,
            surface_loader,
            graphics_queue,
            present_queue,
            queue_families,
            command_pool,
            debug_utils,
            properties,
            memory_properties,
            anisotropy_enabled: anisotropy,
        }))
    }

    /// Queries capabilities, formats, and present modes for this device's
    /// surface. Re-run on every swap chain rebuild.
    pub fn query_swapchain_support(&self) -> Result<SwapchainSupport> {
        query_swapchain_support(&self.surface_loader, self.physical_device, self.surface)
    }

    /// Wait for the device to finish all outstanding work.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.map_err(BackendError::DeviceWaitIdle)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying device context");
        let _ = self.wait_idle();
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Unwinds a partially constructed context, innermost handles first.
fn destroy_partial(
    instance: &ash::Instance,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    surface: Option<(&ash::extensions::khr::Surface, vk::SurfaceKHR)>,
    device: Option<&ash::Device>,
) {
    unsafe {
        if let Some(device) = device {
            device.destroy_device(None);
        }
        if let Some((loader, surface)) = surface {
            loader.destroy_surface(surface, None);
        }
        if let Some((utils, messenger)) = debug_utils {
            utils.destroy_debug_utils_messenger(messenger, None);
        }
        instance.destroy_instance(None);
    }
}

fn check_validation_layer(entry: &Entry) -> Result<()> {
    let available = entry
        .enumerate_instance_layer_properties()
        .map_err(BackendError::InstanceCreation)?;
    let found = available
        .iter()
        .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
    if found {
        Ok(())
    } else {
        Err(BackendError::MissingValidationLayer(
            VALIDATION_LAYER.to_string_lossy().into_owned(),
        ))
    }
}

fn create_instance(
    entry: &Entry,
    display_handle: raw_window_handle::RawDisplayHandle,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_info = vk::ApplicationInfo::builder()
        .application_name(c"vkscene")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"No Engine")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_0);

    let mut extensions = ash_window::enumerate_required_extensions(display_handle)
        .map_err(BackendError::InstanceCreation)?
        .to_vec();
    if enable_validation {
        extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
    }

    let layer_names = if enable_validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    unsafe { entry.create_instance(&create_info, None) }.map_err(BackendError::InstanceCreation)
}

fn create_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));
    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .map_err(BackendError::DebugMessengerCreation)?;
    Ok((debug_utils, messenger))
}

fn find_queue_families(
    instance: &ash::Instance,
    surface_loader: &ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics = Some(i);
        }
        let present_support =
            unsafe { surface_loader.get_physical_device_surface_support(device, i, surface) }
                .unwrap_or(false);
        if present_support {
            indices.present = Some(i);
        }
    }
    indices
}

fn query_swapchain_support(
    surface_loader: &ash::extensions::khr::Surface,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Result<SwapchainSupport> {
    let capabilities =
        unsafe { surface_loader.get_physical_device_surface_capabilities(device, surface) }
            .map_err(BackendError::SurfaceQuery)?;
    let formats = unsafe { surface_loader.get_physical_device_surface_formats(device, surface) }
        .map_err(BackendError::SurfaceQuery)?;
    let present_modes =
        unsafe { surface_loader.get_physical_device_surface_present_modes(device, surface) }
            .map_err(BackendError::SurfaceQuery)?;
    Ok(SwapchainSupport {
        capabilities,
        formats,
        present_modes,
    })
}

fn supports_required_extensions(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let available = match unsafe { instance.enumerate_device_extension_properties(device) } {
        Ok(ext) => ext,
        Err(_) => return false,
    };
    REQUIRED_DEVICE_EXTENSIONS.iter().all(|required| {
        available
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == *required)
    })
}

fn is_device_suitable(
    instance: &ash::Instance,
    surface_loader: &ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
    anisotropy: bool,
) -> Option<QueueFamilyIndices> {
    let indices = find_queue_families(instance, surface_loader, surface, device);
    if !indices.is_complete() {
        return None;
    }
    if !supports_required_extensions(instance, device) {
        return None;
    }
    // The device must expose at least one format and one present mode.
    let support = query_swapchain_support(surface_loader, device, surface).ok()?;
    if support.formats.is_empty() || support.present_modes.is_empty() {
        return None;
    }
    if anisotropy {
        let features = unsafe { instance.get_physical_device_features(device) };
        if features.sampler_anisotropy != vk::TRUE {
            return None;
        }
    }
    Some(indices)
}

fn pick_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
    anisotropy: bool,
) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
    let devices =
        unsafe { instance.enumerate_physical_devices() }.map_err(BackendError::InstanceCreation)?;
    if devices.is_empty() {
        return Err(BackendError::NoDevices);
    }
    // First suitable device in enumeration order wins.
    for device in devices {
        if let Some(indices) =
            is_device_suitable(instance, surface_loader, surface, device, anisotropy)
        {
            return Ok((device, indices));
        }
    }
    Err(BackendError::NoSuitableDevice)
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: QueueFamilyIndices,
    anisotropy: bool,
) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
    let graphics_family = queue_families.graphics.unwrap_or(0);
    let present_family = queue_families.present.unwrap_or(0);

    let mut unique_families = vec![graphics_family];
    if present_family != graphics_family {
        unique_families.push(present_family);
    }

    let queue_priorities = [1.0];
    let queue_create_infos: Vec<_> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
                .build()
        })
        .collect();

    let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(anisotropy);
    let extensions: Vec<_> = REQUIRED_DEVICE_EXTENSIONS
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features);

    let device = unsafe { instance.create_device(physical_device, &create_info, None) }
        .map_err(BackendError::DeviceCreation)?;
    let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
    let present_queue = unsafe { device.get_device_queue(present_family, 0) };
    Ok((device, graphics_queue, present_queue))
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_window_handle::{RawDisplayHandle, XlibDisplayHandle};

    // The extension list depends only on the handle variant, so this runs
    // without a live display. It also pins the handle types ash-window
    // accepts to the ones the windowing layer hands out.
    #[test]
    fn xlib_display_requires_the_surface_extension() {
        let handle = RawDisplayHandle::Xlib(XlibDisplayHandle::empty());
        let extensions = ash_window::enumerate_required_extensions(handle).unwrap();
        let names: Vec<&CStr> = extensions
            .iter()
            .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
            .collect();
        assert!(names.contains(&ash::extensions::khr::Surface::name()));
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }
    vk::FALSE
}
