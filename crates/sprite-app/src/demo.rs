// SPDX-License-Identifier: CEPL-1.0
//! Stand-in for asset loading: procedural checkerboard textures and a field of bouncing
//! sprites, enough to exercise batching with many quads over a few textures.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sprite_render::glam::Vec2;
use sprite_render::{PendingImage, Quad, RenderSize, Renderer, SpriteError, TextureId};

use crate::config::DemoCfg;

/// `size` x `size` RGBA8 checkerboard with 4x4 pixel cells.
pub fn checkerboard(
    id: TextureId,
    size: u32,
    a: [u8; 4],
    b: [u8; 4],
) -> Result<PendingImage, SpriteError> {
    const CELL: u32 = 4;
    let mut pixels = Vec::with_capacity((size * size) as usize * PendingImage::BYTES_PER_PIXEL);
    for y in 0..size {
        for x in 0..size {
            let even = (x / CELL + y / CELL) % 2 == 0;
            pixels.extend_from_slice(if even { &a } else { &b });
        }
    }
    PendingImage::new(id, size, size, pixels)
}

#[derive(Clone, Copy, Debug)]
struct Sprite {
    pos: [f32; 2],
    vel: [f32; 2],
    half: f32,
    texture: TextureId,
    tint: [f32; 4],
}

pub struct DemoScene {
    sprites: Vec<Sprite>,
    textures: u32,
    texture_size: u32,
    rng: StdRng,
}

impl DemoScene {
    pub fn new(cfg: &DemoCfg, bounds: RenderSize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let textures = cfg.textures.max(1);
        let w = bounds.width.max(1) as f32;
        let h = bounds.height.max(1) as f32;
        let sprites = (0..cfg.quads)
            .map(|_| Sprite {
                pos: [rng.gen_range(0.0..w), rng.gen_range(0.0..h)],
                vel: [rng.gen_range(-120.0..120.0), rng.gen_range(-120.0..120.0)],
                half: rng.gen_range(6.0..24.0),
                texture: TextureId(rng.gen_range(0..textures)),
                tint: [1.0, 1.0, 1.0, rng.gen_range(0.6..1.0)],
            })
            .collect();
        Self {
            sprites,
            textures,
            texture_size: cfg.texture_size.max(1),
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.sprites.len()
    }

    /// Enqueues one checkerboard per texture id.
    pub fn upload_textures<R: Renderer>(&mut self, renderer: &mut R) -> anyhow::Result<()> {
        for id in 0..self.textures {
            let a = [self.rng.gen(), self.rng.gen(), self.rng.gen(), 255];
            let b = [a[0] / 3, a[1] / 3, a[2] / 3, 255];
            renderer.enqueue_image(checkerboard(TextureId(id), self.texture_size, a, b)?)?;
        }
        Ok(())
    }

    /// Moves every sprite by `dt` seconds, bouncing off the edges of `bounds`.
    pub fn update(&mut self, dt: f32, bounds: RenderSize) {
        let limits = [bounds.width as f32, bounds.height as f32];
        for s in &mut self.sprites {
            for axis in 0..2 {
                s.pos[axis] += s.vel[axis] * dt;
                if s.pos[axis] < 0.0 {
                    s.pos[axis] = -s.pos[axis];
                    s.vel[axis] = s.vel[axis].abs();
                }
                if s.pos[axis] > limits[axis] {
                    s.pos[axis] = (2.0 * limits[axis] - s.pos[axis]).max(0.0);
                    s.vel[axis] = -s.vel[axis].abs();
                }
            }
        }
    }

    pub fn quads(&self) -> impl Iterator<Item = Quad> + '_ {
        self.sprites.iter().map(|s| {
            Quad::new(Vec2::from(s.pos), Vec2::splat(s.half), s.texture).with_color(s.tint)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> RenderSize {
        RenderSize {
            width: 200,
            height: 100,
        }
    }

    fn cfg(quads: u32, textures: u32) -> DemoCfg {
        DemoCfg {
            quads,
            textures,
            texture_size: 8,
        }
    }

    #[test]
    fn checkerboard_alternates_cells() {
        let white = [255, 255, 255, 255];
        let black = [0, 0, 0, 255];
        let img = checkerboard(TextureId(1), 8, white, black).unwrap();
        let px = |x: usize, y: usize| &img.pixels()[(y * 8 + x) * 4..(y * 8 + x) * 4 + 4];

        assert_eq!(img.byte_len(), 8 * 8 * 4);
        assert_eq!(px(0, 0), white);
        assert_eq!(px(3, 3), white);
        assert_eq!(px(4, 0), black);
        assert_eq!(px(4, 4), white);
    }

    #[test]
    fn zero_sized_checkerboard_is_rejected() {
        assert!(checkerboard(TextureId(0), 0, [0; 4], [0; 4]).is_err());
    }

    #[test]
    fn scene_only_references_its_textures() {
        let scene = DemoScene::new(&cfg(300, 3), bounds(), 7);
        assert_eq!(scene.len(), 300);
        assert!(scene.quads().all(|q| q.texture.0 < 3));
    }

    #[test]
    fn sprites_stay_inside_bounds() {
        let mut scene = DemoScene::new(&cfg(100, 2), bounds(), 1);
        for _ in 0..500 {
            scene.update(1.0 / 30.0, bounds());
        }
        for q in scene.quads() {
            assert!((0.0..=200.0).contains(&q.center.x), "{q:?}");
            assert!((0.0..=100.0).contains(&q.center.y), "{q:?}");
        }
    }

    #[test]
    fn same_seed_same_scene() {
        let a: Vec<_> = DemoScene::new(&cfg(20, 2), bounds(), 42).quads().collect();
        let b: Vec<_> = DemoScene::new(&cfg(20, 2), bounds(), 42).quads().collect();
        assert_eq!(a, b);
    }
}
