// SPIR-V shader module loading
//
// Shaders are compiled to .spv by the build script and read at startup, so
// a shader edit only needs a rebuild, not a code change.

use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::device::DeviceContext;
use super::error::{BackendError, Result};

/// Reads a compiled SPIR-V file and wraps it in a shader module.
pub fn load_shader_module(device: &DeviceContext, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path).map_err(|source| BackendError::ShaderRead {
        path: path.display().to_string(),
        source,
    })?;
    // read_spv handles the byte-to-word conversion and validates alignment.
    let words = ash::util::read_spv(&mut Cursor::new(&bytes)).map_err(|source| {
        BackendError::ShaderRead {
            path: path.display().to_string(),
            source,
        }
    })?;
    create_shader_module(device, &words)
}

pub fn create_shader_module(device: &DeviceContext, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
    unsafe { device.device.create_shader_module(&create_info, None) }
        .map_err(BackendError::ShaderModuleCreation)
}
