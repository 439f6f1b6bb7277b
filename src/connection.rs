// Connection layer: everything sized to the swap chain image count
//
// Uniform buffers, descriptor sets, the pipeline, and the pre-recorded
// command buffers all exist once per presentable image, so a swap chain
// rebuild tears this whole layer down and builds it again. The device
// context and scene geometry survive rebuilds untouched.

use ash::vk;
use std::path::Path;
use std::sync::Arc;

use crate::backend::descriptor::{self, DescriptorSources};
use crate::backend::error::BackendError;
use crate::backend::{buffer, pipeline, shader};
use crate::backend::{DeviceContext, Result, Swapchain};
use crate::scene::uniform::{AlignedArray, BodyUniforms, SceneUniforms};
use crate::scene::Scene;

pub struct Connection {
    device: Arc<DeviceContext>,
    extent: vk::Extent2D,

    scene_buffers: Vec<(vk::Buffer, vk::DeviceMemory)>,
    body_buffers: Vec<(vk::Buffer, vk::DeviceMemory)>,
    body_uniforms: AlignedArray<BodyUniforms>,

    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,

    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,

    command_buffers: Vec<vk::CommandBuffer>,
}

impl Connection {
    /// Builds the full connection against the current swap chain. Fields are
    /// filled in creation order over null placeholders; if any step fails,
    /// the partially built value drops and releases what exists so far.
    pub fn new(
        device: Arc<DeviceContext>,
        swapchain: &Swapchain,
        scene: &Scene,
        clear_color: [f32; 4],
        shader_dir: &Path,
    ) -> Result<Self> {
        let image_count = swapchain.image_count();
        let min_alignment =
            device.properties.limits.min_uniform_buffer_offset_alignment as usize;
        let body_uniforms = AlignedArray::new(scene.body_count(), min_alignment);
        let scene_size = std::mem::size_of::<SceneUniforms>() as vk::DeviceSize;
        let body_size = body_uniforms.bytes().len() as vk::DeviceSize;

        let mut conn = Self {
            device: device.clone(),
            extent: swapchain.extent,
            scene_buffers: Vec::new(),
            body_buffers: Vec::new(),
            body_uniforms,
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_sets: Vec::new(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            command_buffers: Vec::new(),
        };

        // Uniform buffers stay host-visible: they are rewritten every frame.
        for _ in 0..image_count {
            conn.scene_buffers.push(buffer::create_buffer(
                &device,
                scene_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?);
            conn.body_buffers.push(buffer::create_buffer(
                &device,
                body_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?);
        }

        conn.descriptor_set_layout = descriptor::create_descriptor_set_layout(&device)?;
        conn.descriptor_pool = descriptor::create_descriptor_pool(&device, image_count as u32)?;
        let sources: Vec<DescriptorSources> = (0..image_count)
            .map(|i| DescriptorSources {
                scene_buffer: conn.scene_buffers[i].0,
                scene_range: scene_size,
                body_buffer: conn.body_buffers[i].0,
                body_range: conn.body_uniforms.stride() as vk::DeviceSize,
                texture_view: scene.texture.view,
                sampler: scene.texture.sampler,
            })
            .collect();
        conn.descriptor_sets = descriptor::allocate_descriptor_sets(
            &device,
            conn.descriptor_pool,
            conn.descriptor_set_layout,
            &sources,
        )?;

        let set_layouts = [conn.descriptor_set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        conn.pipeline_layout =
            unsafe { device.device.create_pipeline_layout(&layout_info, None) }
                .map_err(BackendError::PipelineLayoutCreation)?;

        let vert = shader::load_shader_module(&device, &shader_dir.join("scene.vert.spv"))?;
        let frag = match shader::load_shader_module(&device, &shader_dir.join("scene.frag.spv")) {
            Ok(frag) => frag,
            Err(e) => {
                unsafe { device.device.destroy_shader_module(vert, None) };
                return Err(e);
            }
        };
        let vertex_layout = pipeline::VertexLayout::new(&[3, 2, 3]);
        let pipeline_result = pipeline::create_graphics_pipeline(
            &device,
            swapchain.render_pass,
            swapchain.extent,
            conn.pipeline_layout,
            &vertex_layout,
            vert,
            frag,
        );
        unsafe {
            device.device.destroy_shader_module(vert, None);
            device.device.destroy_shader_module(frag, None);
        }
        conn.pipeline = pipeline_result?;

        conn.record_command_buffers(swapchain, scene, clear_color)?;
        Ok(conn)
    }

    /// Allocates and records one command buffer per swap chain image. The
    /// buffers are recorded once here and replayed every frame.
    fn record_command_buffers(
        &mut self,
        swapchain: &Swapchain,
        scene: &Scene,
        clear_color: [f32; 4],
    ) -> Result<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.device.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(swapchain.image_count() as u32);
        self.command_buffers =
            unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
                .map_err(BackendError::CommandBufferAllocation)?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        for (i, &cmd) in self.command_buffers.iter().enumerate() {
            let begin_info = vk::CommandBufferBeginInfo::builder();
            unsafe { self.device.device.begin_command_buffer(cmd, &begin_info) }
                .map_err(BackendError::CommandRecording)?;

            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(swapchain.render_pass)
                .framebuffer(swapchain.framebuffers[i])
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: swapchain.extent,
                })
                .clear_values(&clear_values);

            unsafe {
                self.device.device.cmd_begin_render_pass(
                    cmd,
                    &render_pass_info,
                    vk::SubpassContents::INLINE,
                );
                self.device.device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline,
                );
                for (body_index, body) in scene.bodies.iter().enumerate() {
                    let dynamic_offset = self.body_uniforms.offset_of(body_index) as u32;
                    self.device.device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.pipeline_layout,
                        0,
                        &[self.descriptor_sets[i]],
                        &[dynamic_offset],
                    );
                    scene.meshes[body.mesh].record_draw(cmd);
                }
                self.device.device.cmd_end_render_pass(cmd);
            }

            unsafe { self.device.device.end_command_buffer(cmd) }
                .map_err(BackendError::CommandRecording)?;
        }
        Ok(())
    }

    pub fn command_buffer(&self, image_index: u32) -> vk::CommandBuffer {
        self.command_buffers[image_index as usize]
    }

    /// Step 4 of the frame: refresh the uniforms backing the image about to
    /// be rendered. Only this image's buffers are touched, so frames still
    /// in flight keep reading their own.
    pub fn update_uniforms(
        &mut self,
        image_index: u32,
        scene: &Scene,
        elapsed_secs: f32,
    ) -> Result<()> {
        let i = image_index as usize;
        let aspect = self.extent.width as f32 / self.extent.height.max(1) as f32;

        let scene_uniforms = scene.scene_uniforms(aspect);
        buffer::write_memory(&self.device, self.scene_buffers[i].1, &[scene_uniforms])?;

        scene.fill_body_uniforms(elapsed_secs, &mut self.body_uniforms);
        buffer::write_memory_bytes(
            &self.device,
            self.body_buffers[i].1,
            0,
            self.body_uniforms.bytes(),
        )
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        unsafe {
            if !self.command_buffers.is_empty() {
                self.device
                    .device
                    .free_command_buffers(self.device.command_pool, &self.command_buffers);
            }
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None);
            self.device
                .device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.device
                .device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            for &(buffer, memory) in self.scene_buffers.iter().chain(&self.body_buffers) {
                self.device.device.destroy_buffer(buffer, None);
                self.device.device.free_memory(memory, None);
            }
        }
    }
}
