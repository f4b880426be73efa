// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use glam::Vec2;

use crate::TextureId;

/// Layout shared with the vertex shader: location 0 = position, 1 = color, 2 = uv.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub color: [f32; 4],
    pub uv: [f32; 2],
}

impl Vertex {
    pub const POSITION_OFFSET: u32 = std::mem::offset_of!(Vertex, position) as u32;
    pub const COLOR_OFFSET: u32 = std::mem::offset_of!(Vertex, color) as u32;
    pub const UV_OFFSET: u32 = std::mem::offset_of!(Vertex, uv) as u32;
    pub const STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quad {
    /// Pixel coordinates, origin top-left, y down.
    pub center: Vec2,
    pub half_extent: Vec2,
    pub texture: TextureId,
    pub color: [f32; 4],
}

impl Quad {
    pub const WHITE: [f32; 4] = [1.0, 1.0, 1.0, 1.0];
    pub const VERTEX_COUNT: usize = 6;

    pub fn new(center: Vec2, half_extent: Vec2, texture: TextureId) -> Self {
        Self {
            center,
            half_extent,
            texture,
            color: Self::WHITE,
        }
    }

    pub fn with_color(mut self, rgba: [f32; 4]) -> Self {
        self.color = rgba;
        self
    }

    /// Two triangles: (top-left, top-right, bottom-right) and (bottom-right, bottom-left, top-left).
    pub fn vertices(&self) -> [Vertex; Self::VERTEX_COUNT] {
        let min = self.center - self.half_extent;
        let max = self.center + self.half_extent;
        let corner = |x: f32, y: f32, u: f32, v: f32| Vertex {
            position: [x, y],
            color: self.color,
            uv: [u, v],
        };
        let tl = corner(min.x, min.y, 0.0, 0.0);
        let tr = corner(max.x, min.y, 1.0, 0.0);
        let br = corner(max.x, max.y, 1.0, 1.0);
        let bl = corner(min.x, max.y, 0.0, 1.0);
        [tl, tr, br, br, bl, tl]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_shader_locations() {
        assert_eq!(Vertex::POSITION_OFFSET, 0);
        assert_eq!(Vertex::COLOR_OFFSET, 8);
        assert_eq!(Vertex::UV_OFFSET, 24);
        assert_eq!(Vertex::STRIDE, 32);
    }

    #[test]
    fn quad_expands_to_two_triangles_covering_its_bounds() {
        let quad = Quad::new(Vec2::new(10.0, 10.0), Vec2::new(4.0, 4.0), TextureId(7));
        let v = quad.vertices();

        assert_eq!(v[0].position, [6.0, 6.0]);
        assert_eq!(v[1].position, [14.0, 6.0]);
        assert_eq!(v[2].position, [14.0, 14.0]);
        assert_eq!(v[4].position, [6.0, 14.0]);
        // shared diagonal
        assert_eq!(v[2], v[3]);
        assert_eq!(v[0], v[5]);
        assert_eq!(v[2].uv, [1.0, 1.0]);
        assert!(v.iter().all(|x| x.color == Quad::WHITE));
    }

    #[test]
    fn tint_is_carried_by_every_vertex() {
        let red = [1.0, 0.0, 0.0, 0.5];
        let quad = Quad::new(Vec2::ZERO, Vec2::ONE, TextureId(1)).with_color(red);
        assert!(quad.vertices().iter().all(|v| v.color == red));
    }
}
