// The scene: geometry, texture, and animated bodies
//
// Content is deliberately small (a ground plane and a pair of spinning
// cubes) because the interesting machinery lives below, in the swap chain
// and presentation cycle. Bodies share meshes; each body gets its own
// entry in the dynamic uniform array.

pub mod mesh;
pub mod texture;
pub mod uniform;

use glam::{Mat4, Vec3};
use std::sync::Arc;

use crate::backend::{DeviceContext, Result};
use mesh::{GpuMesh, Mesh};
use texture::Texture;
use uniform::{AlignedArray, BodyUniforms, SceneUniforms};

const FOV_Y_RADIANS: f32 = std::f32::consts::FRAC_PI_4;
const NEAR_PLANE: f32 = 0.1;
const FAR_PLANE: f32 = 100.0;

/// One renderable instance: a mesh reference plus its animated transform.
pub struct Body {
    pub mesh: usize,
    translation: Vec3,
    spin_axis: Vec3,
    spin_rate: f32,
}

impl Body {
    pub fn model_matrix(&self, elapsed_secs: f32) -> Mat4 {
        let rotation = if self.spin_rate == 0.0 {
            Mat4::IDENTITY
        } else {
            Mat4::from_axis_angle(self.spin_axis.normalize(), self.spin_rate * elapsed_secs)
        };
        Mat4::from_translation(self.translation) * rotation
    }
}

pub struct Scene {
    pub meshes: Vec<GpuMesh>,
    pub texture: Texture,
    pub bodies: Vec<Body>,
}

impl Scene {
    pub fn load(device: Arc<DeviceContext>) -> Result<Self> {
        let cube = GpuMesh::new(device.clone(), &Mesh::cube())?;
        let plane = GpuMesh::new(device.clone(), &Mesh::plane(8.0))?;
        let pixels = texture::checkerboard(256, 256, 32);
        let texture = Texture::from_pixels(device, 256, 256, &pixels)?;

        let bodies = vec![
            Body {
                mesh: 1,
                translation: Vec3::new(0.0, -0.5, 0.0),
                spin_axis: Vec3::Y,
                spin_rate: 0.0,
            },
            Body {
                mesh: 0,
                translation: Vec3::new(-1.0, 0.2, 0.0),
                spin_axis: Vec3::Y,
                spin_rate: 0.8,
            },
            Body {
                mesh: 0,
                translation: Vec3::new(1.2, 0.4, -0.5),
                spin_axis: Vec3::new(1.0, 1.0, 0.0),
                spin_rate: 1.3,
            },
        ];

        Ok(Self {
            meshes: vec![cube, plane],
            texture,
            bodies,
        })
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn scene_uniforms(&self, aspect_ratio: f32) -> SceneUniforms {
        SceneUniforms {
            view_proj: camera_matrix(aspect_ratio),
        }
    }

    /// Writes every body's current model matrix into the aligned array.
    pub fn fill_body_uniforms(&self, elapsed_secs: f32, out: &mut AlignedArray<BodyUniforms>) {
        for (i, body) in self.bodies.iter().enumerate() {
            out.set(
                i,
                BodyUniforms {
                    model: body.model_matrix(elapsed_secs),
                },
            );
        }
    }
}

/// Fixed orbit camera. The projection's Y axis is negated because Vulkan
/// clip space points Y down, unlike the GL convention glam assumes.
pub fn camera_matrix(aspect_ratio: f32) -> Mat4 {
    let view = Mat4::look_at_rh(
        Vec3::new(3.0, 2.2, 3.0),
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::Y,
    );
    let mut proj = Mat4::perspective_rh(FOV_Y_RADIANS, aspect_ratio, NEAR_PLANE, FAR_PLANE);
    proj.y_axis.y *= -1.0;
    proj * view
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_body_keeps_its_translation() {
        let body = Body {
            mesh: 0,
            translation: Vec3::new(0.0, -0.5, 0.0),
            spin_axis: Vec3::Y,
            spin_rate: 0.0,
        };
        assert_eq!(body.model_matrix(0.0), body.model_matrix(10.0));
        let origin = body.model_matrix(3.0).transform_point3(Vec3::ZERO);
        assert_eq!(origin, Vec3::new(0.0, -0.5, 0.0));
    }

    #[test]
    fn spinning_body_rotates_about_its_own_center() {
        let body = Body {
            mesh: 0,
            translation: Vec3::new(2.0, 0.0, 0.0),
            spin_axis: Vec3::Y,
            spin_rate: 1.0,
        };
        // The center never moves while the surface points orbit it.
        let center_then = body.model_matrix(0.0).transform_point3(Vec3::ZERO);
        let center_now = body.model_matrix(5.0).transform_point3(Vec3::ZERO);
        assert!((center_then - center_now).length() < 1e-5);

        let surface = Vec3::new(0.5, 0.0, 0.0);
        let p0 = body.model_matrix(0.0).transform_point3(surface);
        let p1 = body.model_matrix(1.0).transform_point3(surface);
        assert!((p0 - p1).length() > 1e-3);
    }

    #[test]
    fn projection_flips_y_for_vulkan_clip_space() {
        let proj_view = camera_matrix(16.0 / 9.0);
        // A point above the camera target should land in the upper half of
        // clip space, which in Vulkan means negative y.
        let clip = proj_view * Vec3::new(0.0, 1.0, 0.0).extend(1.0);
        assert!(clip.y / clip.w < 0.0);
    }
}
