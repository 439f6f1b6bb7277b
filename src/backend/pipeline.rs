// Graphics pipeline construction
//
// Vertex layouts are derived from per-attribute dimensions so meshes with
// different attribute sets share one code path. All remaining pipeline state
// is fixed: filled triangles, back-face culling, depth test, no blending.

use ash::vk;

use super::device::DeviceContext;
use super::error::{BackendError, Result};

/// Interleaved vertex layout built from attribute dimensions, e.g.
/// `[3, 2, 3]` for position, texture coordinate, color.
pub struct VertexLayout {
    pub binding: vk::VertexInputBindingDescription,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VertexLayout {
    pub fn new(attribute_dims: &[u32]) -> Self {
        let float_size = std::mem::size_of::<f32>() as u32;
        let total_dim: u32 = attribute_dims.iter().sum();
        let binding = vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(total_dim * float_size)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build();

        let mut attributes = Vec::with_capacity(attribute_dims.len());
        let mut offset = 0;
        for (location, &dim) in attribute_dims.iter().enumerate() {
            let format = match dim {
                1 => vk::Format::R32_SFLOAT,
                2 => vk::Format::R32G32_SFLOAT,
                3 => vk::Format::R32G32B32_SFLOAT,
                _ => vk::Format::R32G32B32A32_SFLOAT,
            };
            attributes.push(
                vk::VertexInputAttributeDescription::builder()
                    .binding(0)
                    .location(location as u32)
                    .format(format)
                    .offset(offset)
                    .build(),
            );
            offset += dim * float_size;
        }

        Self {
            binding,
            attributes,
        }
    }

    /// Floats per vertex across all attributes.
    pub fn total_dim(&self) -> u32 {
        self.binding.stride / std::mem::size_of::<f32>() as u32
    }
}

/// Builds the one graphics pipeline the renderer uses. The viewport and
/// scissor are baked to the swap chain extent, so the pipeline is rebuilt
/// along with the swap chain.
pub fn create_graphics_pipeline(
    device: &DeviceContext,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    layout: vk::PipelineLayout,
    vertex_layout: &VertexLayout,
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,
) -> Result<vk::Pipeline> {
    let entry_point = c"main";
    let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vert_shader)
        .name(entry_point)
        .build();
    let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(frag_shader)
        .name(entry_point)
        .build();
    let shader_stages = [vert_stage, frag_stage];

    let bindings = [vertex_layout.binding];
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&vertex_layout.attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    let viewports = [viewport];
    let scissors = [scissor];
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(&viewports)
        .scissors(&scissors);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();
    let color_blend_attachments = [color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device.device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        )
    }
    .map_err(|(_, e)| BackendError::PipelineCreation(e))?;
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_covers_all_attributes() {
        let layout = VertexLayout::new(&[3, 2, 3]);
        assert_eq!(layout.binding.stride, 8 * 4);
        assert_eq!(layout.total_dim(), 8);
    }

    #[test]
    fn attribute_formats_follow_dimensions() {
        let layout = VertexLayout::new(&[1, 2, 3, 4]);
        let formats: Vec<_> = layout.attributes.iter().map(|a| a.format).collect();
        assert_eq!(
            formats,
            vec![
                vk::Format::R32_SFLOAT,
                vk::Format::R32G32_SFLOAT,
                vk::Format::R32G32B32_SFLOAT,
                vk::Format::R32G32B32A32_SFLOAT,
            ]
        );
    }

    #[test]
    fn offsets_accumulate_in_order() {
        let layout = VertexLayout::new(&[3, 2, 3]);
        let offsets: Vec<_> = layout.attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 20]);
    }

    #[test]
    fn locations_are_sequential() {
        let layout = VertexLayout::new(&[3, 2]);
        let locations: Vec<_> = layout.attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![0, 1]);
    }
}
