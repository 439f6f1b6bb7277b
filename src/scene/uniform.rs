// Uniform data layouts
//
// SceneUniforms is bound once per frame; BodyUniforms is an array bound
// with a dynamic offset, one entry per body. Dynamic-offset entries must
// start at multiples of the device's minimum uniform alignment, which is
// what AlignedArray encapsulates.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Scene-wide uniforms, bound at descriptor binding 0.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct SceneUniforms {
    pub view_proj: Mat4,
}

/// Per-body uniforms, bound at descriptor binding 1 with a dynamic offset.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct BodyUniforms {
    pub model: Mat4,
}

/// Least multiple of `alignment` that is >= `size`. An alignment of zero
/// means the device imposes no requirement.
pub fn aligned_size(size: usize, alignment: usize) -> usize {
    if alignment == 0 || size % alignment == 0 {
        size
    } else {
        (size / alignment + 1) * alignment
    }
}

/// A CPU-side array of UBO entries padded out to the device's minimum
/// uniform buffer offset alignment. The whole backing store is uploaded in
/// one write; dynamic offsets of `stride * i` select entry i on the GPU.
pub struct AlignedArray<T: Pod> {
    data: Vec<u8>,
    stride: usize,
    len: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Pod> AlignedArray<T> {
    pub fn new(len: usize, min_alignment: usize) -> Self {
        let stride = aligned_size(std::mem::size_of::<T>(), min_alignment);
        Self {
            data: vec![0; stride * len],
            stride,
            len,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte distance between consecutive entries; also the dynamic-offset
    /// unit and the descriptor range for one entry.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Byte offset of entry `index`, always a multiple of the alignment.
    pub fn offset_of(&self, index: usize) -> usize {
        index * self.stride
    }

    pub fn set(&mut self, index: usize, value: T) {
        let offset = self.offset_of(index);
        let size = std::mem::size_of::<T>();
        self.data[offset..offset + size].copy_from_slice(bytemuck::bytes_of(&value));
    }

    pub fn get(&self, index: usize) -> T {
        let offset = self.offset_of(index);
        let size = std::mem::size_of::<T>();
        *bytemuck::from_bytes(&self.data[offset..offset + size])
    }

    /// The full backing store, padding included, ready for upload.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_size_rounds_up() {
        assert_eq!(aligned_size(64, 256), 256);
        assert_eq!(aligned_size(256, 256), 256);
        assert_eq!(aligned_size(300, 256), 512);
    }

    #[test]
    fn aligned_size_without_requirement() {
        assert_eq!(aligned_size(64, 0), 64);
        assert_eq!(aligned_size(300, 1), 300);
    }

    #[test]
    fn entries_land_on_stride_boundaries() {
        let mut array: AlignedArray<BodyUniforms> = AlignedArray::new(3, 256);
        assert_eq!(array.stride(), 256);
        assert_eq!(array.bytes().len(), 3 * 256);

        let m = Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0));
        array.set(2, BodyUniforms { model: m });
        assert_eq!(array.get(2).model, m);
        // Entry 1 stays untouched.
        assert_eq!(array.get(1).model, Mat4::ZERO);
    }

    #[test]
    fn tight_packing_when_already_aligned() {
        let array: AlignedArray<BodyUniforms> = AlignedArray::new(4, 64);
        assert_eq!(array.stride(), std::mem::size_of::<BodyUniforms>());
        assert_eq!(array.bytes().len(), 4 * 64);
    }
}
