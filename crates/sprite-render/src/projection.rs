// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::RenderSize;

/// Uniform block at set 0, binding 0 of the sprite vertex shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ProjectionUniform {
    pub ortho: [[f32; 4]; 4],
}

impl ProjectionUniform {
    pub fn for_size(size: RenderSize) -> Self {
        Self {
            ortho: orthographic(size).to_cols_array_2d(),
        }
    }
}

/// Maps pixel coordinates (origin top-left, y down) onto Vulkan clip space.
/// Vulkan's clip-space y already points down, so no flip is needed.
pub fn orthographic(size: RenderSize) -> Mat4 {
    let w = size.width.max(1) as f32;
    let h = size.height.max(1) as f32;
    Mat4::orthographic_rh(0.0, w, 0.0, h, 0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).abs().max_element() < 1e-6
    }

    #[test]
    fn corners_map_to_clip_space_corners() {
        let m = orthographic(RenderSize {
            width: 800,
            height: 600,
        });
        assert!(approx(m.project_point3(Vec3::ZERO), Vec3::new(-1.0, -1.0, 0.0)));
        assert!(approx(
            m.project_point3(Vec3::new(800.0, 600.0, 0.0)),
            Vec3::new(1.0, 1.0, 0.0)
        ));
        assert!(approx(
            m.project_point3(Vec3::new(400.0, 300.0, 0.0)),
            Vec3::ZERO
        ));
    }

    #[test]
    fn zero_size_does_not_produce_nan() {
        let m = orthographic(RenderSize {
            width: 0,
            height: 0,
        });
        assert!(m.is_finite());
    }

    #[test]
    fn uniform_is_column_major() {
        let size = RenderSize {
            width: 200,
            height: 100,
        };
        let u = ProjectionUniform::for_size(size);
        let close = |a: f32, b: f32| (a - b).abs() < 1e-6;
        assert!(close(u.ortho[0][0], 2.0 / 200.0));
        assert!(close(u.ortho[1][1], 2.0 / 100.0));
        // translation lives in the last column
        assert!(close(u.ortho[3][0], -1.0));
        assert!(close(u.ortho[3][1], -1.0));
    }
}
