// Meshes, CPU-side and GPU-side
//
// A Mesh is plain interleaved float data plus u16 triangle indices. A
// GpuMesh is the same data uploaded into device-local vertex and index
// buffers; once uploaded, the CPU copy can be dropped.

use ash::vk;
use std::sync::Arc;

use crate::backend::buffer;
use crate::backend::{DeviceContext, Result};

/// CPU-side mesh with interleaved attributes. `attribute_dims` describes
/// the floats per vertex per attribute, e.g. `[3, 2, 3]` for position,
/// texture coordinate, color.
pub struct Mesh {
    pub attribute_dims: Vec<u32>,
    pub vertices: Vec<f32>,
    pub indices: Vec<u16>,
}

impl Mesh {
    pub fn total_dim(&self) -> u32 {
        self.attribute_dims.iter().sum()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / self.total_dim() as usize
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Axis-aligned unit cube centered at the origin, with per-face texture
    /// coordinates and per-face colors. Attributes: position, uv, color.
    pub fn cube() -> Self {
        let faces: [([f32; 3], [f32; 3], [f32; 3], [f32; 3]); 6] = [
            // (outward normal, in-face u axis, in-face v axis, color)
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 0.3, 0.3]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.3, 1.0, 0.3]),
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [0.3, 0.3, 1.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 1.0, 0.3]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.3, 1.0, 1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.3, 1.0]),
        ];

        let mut vertices = Vec::with_capacity(6 * 4 * 8);
        let mut indices = Vec::with_capacity(6 * 6);
        for (face, (normal, u, v, color)) in faces.iter().enumerate() {
            let base = (face * 4) as u16;
            let corners = [(-0.5, -0.5, 0.0, 0.0), (0.5, -0.5, 1.0, 0.0), (0.5, 0.5, 1.0, 1.0), (-0.5, 0.5, 0.0, 1.0)];
            for &(a, b, s, t) in &corners {
                for i in 0..3 {
                    vertices.push(normal[i] * 0.5 + u[i] * a + v[i] * b);
                }
                vertices.push(s);
                vertices.push(t);
                vertices.extend_from_slice(color);
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        Self {
            attribute_dims: vec![3, 2, 3],
            vertices,
            indices,
        }
    }

    /// Flat rectangular ground plane spanning `size` in x and z.
    pub fn plane(size: f32) -> Self {
        let h = size / 2.0;
        #[rustfmt::skip]
        let vertices = vec![
            -h, 0.0, -h,  0.0, 0.0,  0.5, 0.5, 0.5,
             h, 0.0, -h,  4.0, 0.0,  0.5, 0.5, 0.5,
             h, 0.0,  h,  4.0, 4.0,  0.5, 0.5, 0.5,
            -h, 0.0,  h,  0.0, 4.0,  0.5, 0.5, 0.5,
        ];
        Self {
            attribute_dims: vec![3, 2, 3],
            vertices,
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }
}

/// Mesh data resident in device-local memory.
pub struct GpuMesh {
    device: Arc<DeviceContext>,
    vertex_buffer: vk::Buffer,
    vertex_memory: vk::DeviceMemory,
    index_buffer: vk::Buffer,
    index_memory: vk::DeviceMemory,
    index_count: u32,
}

impl GpuMesh {
    /// Uploads the mesh through staging buffers. Blocks until the transfer
    /// queue drains, which is fine at load time.
    pub fn new(device: Arc<DeviceContext>, mesh: &Mesh) -> Result<Self> {
        let (index_buffer, index_memory) = buffer::create_device_local_buffer(
            &device,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &mesh.indices,
        )?;
        let (vertex_buffer, vertex_memory) = match buffer::create_device_local_buffer(
            &device,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &mesh.vertices,
        ) {
            Ok(created) => created,
            Err(e) => {
                unsafe {
                    device.device.destroy_buffer(index_buffer, None);
                    device.device.free_memory(index_memory, None);
                }
                return Err(e);
            }
        };
        Ok(Self {
            device,
            vertex_buffer,
            vertex_memory,
            index_buffer,
            index_memory,
            index_count: mesh.indices.len() as u32,
        })
    }

    /// Records bind + draw commands for this mesh.
    pub fn record_draw(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device
                .device
                .cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer], &[0]);
            self.device
                .device
                .cmd_bind_index_buffer(cmd, self.index_buffer, 0, vk::IndexType::UINT16);
            self.device
                .device
                .cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
        }
    }
}

impl Drop for GpuMesh {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.vertex_buffer, None);
            self.device.device.free_memory(self.vertex_memory, None);
            self.device.device.destroy_buffer(self.index_buffer, None);
            self.device.device.free_memory(self.index_memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_has_four_vertices_per_face() {
        let cube = Mesh::cube();
        assert_eq!(cube.total_dim(), 8);
        assert_eq!(cube.vertex_count(), 24);
        assert_eq!(cube.triangle_count(), 12);
    }

    #[test]
    fn cube_indices_stay_in_range() {
        let cube = Mesh::cube();
        let max = *cube.indices.iter().max().unwrap() as usize;
        assert!(max < cube.vertex_count());
    }

    #[test]
    fn cube_corners_lie_on_the_half_unit_box() {
        let cube = Mesh::cube();
        let dim = cube.total_dim() as usize;
        for vertex in cube.vertices.chunks(dim) {
            for &coord in &vertex[..3] {
                assert!((coord.abs() - 0.5).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn plane_spans_requested_size() {
        let plane = Mesh::plane(10.0);
        assert_eq!(plane.vertex_count(), 4);
        assert_eq!(plane.triangle_count(), 2);
        let dim = plane.total_dim() as usize;
        let xs: Vec<f32> = plane.vertices.chunks(dim).map(|v| v[0]).collect();
        assert_eq!(xs.iter().cloned().fold(f32::MIN, f32::max), 5.0);
        assert_eq!(xs.iter().cloned().fold(f32::MAX, f32::min), -5.0);
    }
}
