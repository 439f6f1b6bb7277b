// Texture upload and sampling
//
// The scene uses one procedurally generated checkerboard so the renderer
// has no asset files to ship. Upload goes staging buffer -> image with the
// standard transfer-dst / shader-read transitions.

use ash::vk;
use std::sync::Arc;

use crate::backend::{buffer, image};
use crate::backend::{DeviceContext, Result};
use crate::backend::error::BackendError;

const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Tightly packed RGBA8 checkerboard, `tile` pixels per square.
pub fn checkerboard(width: u32, height: u32, tile: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let on = ((x / tile) + (y / tile)) % 2 == 0;
            let value = if on { 230 } else { 60 };
            pixels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    pixels
}

pub struct Texture {
    device: Arc<DeviceContext>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

impl Texture {
    /// Uploads RGBA8 pixel data and builds a view and sampler over it.
    pub fn from_pixels(
        device: Arc<DeviceContext>,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Self> {
        let size = pixels.len() as vk::DeviceSize;
        let (staging_buffer, staging_memory) = buffer::create_buffer(
            &device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let destroy_staging = |device: &DeviceContext| unsafe {
            device.device.destroy_buffer(staging_buffer, None);
            device.device.free_memory(staging_memory, None);
        };
        if let Err(e) = buffer::write_memory(&device, staging_memory, pixels) {
            destroy_staging(&device);
            return Err(e);
        }

        let upload = || -> Result<(vk::Image, vk::DeviceMemory)> {
            let (texture_image, texture_memory) = image::create_image(
                &device,
                width,
                height,
                TEXTURE_FORMAT,
                vk::ImageTiling::OPTIMAL,
                vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            )?;
            let filled = image::transition_image_layout(
                &device,
                texture_image,
                TEXTURE_FORMAT,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )
            .and_then(|_| {
                image::copy_buffer_to_image(&device, staging_buffer, texture_image, width, height)
            })
            .and_then(|_| {
                image::transition_image_layout(
                    &device,
                    texture_image,
                    TEXTURE_FORMAT,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
            });
            if let Err(e) = filled {
                unsafe {
                    device.device.destroy_image(texture_image, None);
                    device.device.free_memory(texture_memory, None);
                }
                return Err(e);
            }
            Ok((texture_image, texture_memory))
        };
        let result = upload();
        destroy_staging(&device);
        let (texture_image, texture_memory) = result?;

        let view = match image::create_image_view(
            &device,
            texture_image,
            TEXTURE_FORMAT,
            vk::ImageAspectFlags::COLOR,
        ) {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.device.destroy_image(texture_image, None);
                    device.device.free_memory(texture_memory, None);
                }
                return Err(e);
            }
        };

        let sampler = match create_sampler(&device) {
            Ok(sampler) => sampler,
            Err(e) => {
                unsafe {
                    device.device.destroy_image_view(view, None);
                    device.device.destroy_image(texture_image, None);
                    device.device.free_memory(texture_memory, None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            device,
            image: texture_image,
            memory: texture_memory,
            view,
            sampler,
        })
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_sampler(self.sampler, None);
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

fn create_sampler(device: &DeviceContext) -> Result<vk::Sampler> {
    let max_anisotropy = device.properties.limits.max_sampler_anisotropy;
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(device.anisotropy_enabled)
        .max_anisotropy(if device.anisotropy_enabled {
            max_anisotropy
        } else {
            1.0
        })
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .mip_lod_bias(0.0)
        .min_lod(0.0)
        .max_lod(0.0);
    unsafe { device.device.create_sampler(&sampler_info, None) }
        .map_err(BackendError::SamplerCreation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_is_rgba8() {
        let pixels = checkerboard(8, 4, 2);
        assert_eq!(pixels.len(), 8 * 4 * 4);
        assert!(pixels.chunks(4).all(|p| p[3] == 255));
    }

    #[test]
    fn checkerboard_alternates_per_tile() {
        let pixels = checkerboard(4, 4, 2);
        let luminance = |x: usize, y: usize| pixels[(y * 4 + x) * 4];
        assert_eq!(luminance(0, 0), luminance(1, 1));
        assert_ne!(luminance(0, 0), luminance(2, 0));
        assert_ne!(luminance(0, 0), luminance(0, 2));
        assert_eq!(luminance(0, 0), luminance(2, 2));
    }
}
