// Descriptor sets for the scene pipeline
//
// One descriptor set per swap chain image, all cut from one pool:
//   binding 0: scene-wide uniforms        (vertex + fragment)
//   binding 1: per-body uniforms, dynamic (vertex + fragment)
//   binding 2: combined image sampler     (fragment)

use ash::vk;

use super::device::DeviceContext;
use super::error::{BackendError, Result};

pub const SCENE_UNIFORM_BINDING: u32 = 0;
pub const BODY_UNIFORM_BINDING: u32 = 1;
pub const TEXTURE_BINDING: u32 = 2;

pub fn create_descriptor_set_layout(device: &DeviceContext) -> Result<vk::DescriptorSetLayout> {
    let bindings = [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(SCENE_UNIFORM_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(BODY_UNIFORM_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(TEXTURE_BINDING)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ];
    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
    unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
        .map_err(BackendError::DescriptorLayoutCreation)
}

pub fn create_descriptor_pool(device: &DeviceContext, set_count: u32) -> Result<vk::DescriptorPool> {
    let pool_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: set_count,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            descriptor_count: set_count,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: set_count,
        },
    ];
    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .pool_sizes(&pool_sizes)
        .max_sets(set_count);
    unsafe { device.device.create_descriptor_pool(&pool_info, None) }
        .map_err(BackendError::DescriptorPoolCreation)
}

/// Buffer and image sources for the descriptor set of one swap chain image.
pub struct DescriptorSources {
    pub scene_buffer: vk::Buffer,
    pub scene_range: vk::DeviceSize,
    pub body_buffer: vk::Buffer,
    /// Aligned size of one body entry; the dynamic offset selects the body.
    pub body_range: vk::DeviceSize,
    pub texture_view: vk::ImageView,
    pub sampler: vk::Sampler,
}

/// Allocates one set per source and points each at its image's buffers.
/// The sets are freed implicitly when the pool is destroyed.
pub fn allocate_descriptor_sets(
    device: &DeviceContext,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    sources: &[DescriptorSources],
) -> Result<Vec<vk::DescriptorSet>> {
    let layouts = vec![layout; sources.len()];
    let alloc_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    let sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
        .map_err(BackendError::DescriptorSetAllocation)?;

    for (set, source) in sets.iter().zip(sources) {
        let scene_info = [vk::DescriptorBufferInfo {
            buffer: source.scene_buffer,
            offset: 0,
            range: source.scene_range,
        }];
        let body_info = [vk::DescriptorBufferInfo {
            buffer: source.body_buffer,
            offset: 0,
            range: source.body_range,
        }];
        let image_info = [vk::DescriptorImageInfo {
            sampler: source.sampler,
            image_view: source.texture_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(*set)
                .dst_binding(SCENE_UNIFORM_BINDING)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&scene_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(*set)
                .dst_binding(BODY_UNIFORM_BINDING)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .buffer_info(&body_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(*set)
                .dst_binding(TEXTURE_BINDING)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_info)
                .build(),
        ];
        unsafe { device.device.update_descriptor_sets(&writes, &[]) };
    }

    Ok(sets)
}
