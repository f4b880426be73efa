// SPDX-License-Identifier: CEPL-1.0
//! Quad accumulation and texture batching.
//!
//! Quads are expanded into vertices as they arrive, with one sort key per triangle.
//! Before recording, triangles are stably sorted by texture so that every texture
//! forms one contiguous run, and each run becomes a single draw call. A texture switch
//! costs a descriptor rebind, so the number of rebinds per frame drops from one per quad
//! to one per distinct texture.

use crate::{Quad, TextureId, Vertex};

/// Per-triangle ordering key, parallel to the vertex buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey {
    pub texture: TextureId,
}

/// Maximal range of same-texture vertices, drawn with one call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawRun {
    pub texture: TextureId,
    pub first_vertex: u32,
    pub vertex_count: u32,
}

/// Sink for the draw stream of one frame. The Vulkan backend records into a command
/// buffer; tests record into a log.
pub trait DrawRecorder {
    type Error;

    fn bind_texture(&mut self, texture: TextureId) -> Result<(), Self::Error>;
    fn draw(&mut self, first_vertex: u32, vertex_count: u32) -> Result<(), Self::Error>;
}

#[derive(Debug, Default)]
pub struct SpriteBatch {
    vertices: Vec<Vertex>,
    keys: Vec<SortKey>,
    runs: Vec<DrawRun>,
}

const TRIANGLE: usize = 3;

impl SpriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, quad: &Quad) {
        let key = SortKey {
            texture: quad.texture,
        };
        self.vertices.extend_from_slice(&quad.vertices());
        self.keys.extend([key, key]);
        self.runs.clear();
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    /// Run table from the last [`SpriteBatch::prepare`]; empty if quads were pushed since.
    pub fn runs(&self) -> &[DrawRun] {
        &self.runs
    }

    pub fn triangle_count(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Sorts triangles by texture and rebuilds the run table.
    pub fn prepare(&mut self) -> &[DrawRun] {
        self.sort_by_texture();
        self.build_runs();
        &self.runs
    }

    /// Stable: triangles sharing a texture keep their submission order.
    pub fn sort_by_texture(&mut self) {
        if self.keys.windows(2).all(|w| w[0] <= w[1]) {
            return;
        }

        let mut order: Vec<usize> = (0..self.keys.len()).collect();
        // slice::sort_by_key is a stable sort
        order.sort_by_key(|&tri| self.keys[tri]);

        let mut vertices = Vec::with_capacity(self.vertices.len());
        for &tri in &order {
            let first = tri * TRIANGLE;
            vertices.extend_from_slice(&self.vertices[first..first + TRIANGLE]);
        }
        self.keys = order.iter().map(|&tri| self.keys[tri]).collect();
        self.vertices = vertices;
    }

    fn build_runs(&mut self) {
        self.runs.clear();
        for (tri, key) in self.keys.iter().enumerate() {
            match self.runs.last_mut() {
                Some(run) if run.texture == key.texture => run.vertex_count += TRIANGLE as u32,
                _ => self.runs.push(DrawRun {
                    texture: key.texture,
                    first_vertex: (tri * TRIANGLE) as u32,
                    vertex_count: TRIANGLE as u32,
                }),
            }
        }
    }

    /// Emits one bind + one draw per run. Returns the number of draw calls.
    pub fn record_draws<R: DrawRecorder>(&self, recorder: &mut R) -> Result<usize, R::Error> {
        for run in &self.runs {
            recorder.bind_texture(run.texture)?;
            recorder.draw(run.first_vertex, run.vertex_count)?;
        }
        Ok(self.runs.len())
    }

    /// Drops all vertices, keys and runs but keeps the allocations for the next frame.
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.keys.clear();
        self.runs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec2;

    #[derive(Debug, PartialEq)]
    enum Op {
        Bind(TextureId),
        Draw(u32, u32),
    }

    #[derive(Default)]
    struct Log(Vec<Op>);

    impl DrawRecorder for Log {
        type Error = ();

        fn bind_texture(&mut self, texture: TextureId) -> Result<(), ()> {
            self.0.push(Op::Bind(texture));
            Ok(())
        }

        fn draw(&mut self, first_vertex: u32, vertex_count: u32) -> Result<(), ()> {
            self.0.push(Op::Draw(first_vertex, vertex_count));
            Ok(())
        }
    }

    fn quad_at(x: f32, texture: u32) -> Quad {
        Quad::new(Vec2::new(x, 0.0), Vec2::splat(1.0), TextureId(texture))
    }

    fn batch_of(textures: &[u32]) -> SpriteBatch {
        let mut batch = SpriteBatch::new();
        for (i, &t) in textures.iter().enumerate() {
            batch.push(&quad_at(i as f32, t));
        }
        batch
    }

    fn distinct(textures: &[u32]) -> usize {
        let mut v = textures.to_vec();
        v.sort_unstable();
        v.dedup();
        v.len()
    }

    #[test]
    fn push_emits_six_vertices_and_two_keys() {
        let batch = batch_of(&[3]);
        assert_eq!(batch.vertices().len(), 6);
        assert_eq!(batch.keys(), &[SortKey { texture: TextureId(3) }; 2]);
    }

    #[test]
    fn single_quad_scenario_draws_once_after_binding() {
        let mut batch = SpriteBatch::new();
        batch.push(&Quad::new(
            Vec2::new(10.0, 10.0),
            Vec2::new(4.0, 4.0),
            TextureId(7),
        ));
        batch.prepare();

        let mut log = Log::default();
        let draws = batch.record_draws(&mut log).unwrap();

        assert_eq!(draws, 1);
        assert_eq!(log.0, vec![Op::Bind(TextureId(7)), Op::Draw(0, 6)]);
    }

    #[test]
    fn alternating_textures_collapse_into_two_runs() {
        let textures: Vec<u32> = (0..100).map(|i| 1 + i % 2).collect();
        let mut batch = batch_of(&textures);
        let runs = batch.prepare().to_vec();

        assert_eq!(
            runs,
            vec![
                DrawRun {
                    texture: TextureId(1),
                    first_vertex: 0,
                    vertex_count: 300,
                },
                DrawRun {
                    texture: TextureId(2),
                    first_vertex: 300,
                    vertex_count: 300,
                },
            ]
        );
    }

    #[test]
    fn draw_count_equals_distinct_textures_for_any_order() {
        let orders: [&[u32]; 4] = [
            &[5, 1, 5, 3, 1, 1, 9],
            &[1, 1, 1, 3, 5, 5, 9],
            &[9, 5, 3, 1, 5, 1, 1],
            &[2, 2, 2, 2],
        ];
        for textures in orders {
            let mut batch = batch_of(textures);
            batch.prepare();
            let mut log = Log::default();
            assert_eq!(batch.record_draws(&mut log).unwrap(), distinct(textures));
        }
    }

    #[test]
    fn sort_is_stable_within_a_texture() {
        // x position encodes submission order
        let mut batch = batch_of(&[2, 1, 2, 1, 2]);
        batch.prepare();

        let firsts: Vec<(u32, f32)> = batch
            .keys()
            .iter()
            .zip(batch.vertices().chunks(3))
            .map(|(k, tri)| (k.texture.0, tri[0].position[0]))
            .collect();

        let tex1: Vec<f32> = firsts.iter().filter(|f| f.0 == 1).map(|f| f.1).collect();
        let tex2: Vec<f32> = firsts.iter().filter(|f| f.0 == 2).map(|f| f.1).collect();
        assert!(tex1.windows(2).all(|w| w[0] <= w[1]));
        assert!(tex2.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(tex1.first(), Some(&0.0)); // quad 1 center x=1, half 1 -> min 0
        assert_eq!(tex2.first(), Some(&-1.0)); // quad 0 center x=0 -> min -1
    }

    #[test]
    fn triangles_stay_paired_with_their_keys() {
        let mut batch = batch_of(&[4, 1]);
        batch.prepare();
        // texture 1 was submitted second, at x = 1 -> its triangles start at x = 0
        assert_eq!(batch.keys()[0].texture, TextureId(1));
        assert_eq!(batch.vertices()[0].position, [0.0, -1.0]);
        assert_eq!(batch.keys()[2].texture, TextureId(4));
        assert_eq!(batch.vertices()[6].position, [-1.0, -1.0]);
    }

    #[test]
    fn runs_cover_every_vertex_exactly_once() {
        let mut batch = batch_of(&[3, 8, 3, 3, 8, 1]);
        let runs = batch.prepare().to_vec();
        let mut next = 0;
        for run in &runs {
            assert_eq!(run.first_vertex, next);
            next += run.vertex_count;
        }
        assert_eq!(next as usize, batch.vertices().len());
    }

    #[test]
    fn push_after_prepare_invalidates_runs() {
        let mut batch = batch_of(&[1]);
        batch.prepare();
        assert_eq!(batch.runs().len(), 1);
        batch.push(&quad_at(0.0, 2));
        assert!(batch.runs().is_empty());
    }

    #[test]
    fn clear_resets_everything() {
        let mut batch = batch_of(&[1, 2]);
        batch.prepare();
        batch.clear();
        assert!(batch.is_empty());
        assert!(batch.vertices().is_empty());
        assert!(batch.runs().is_empty());

        let mut log = Log::default();
        assert_eq!(batch.record_draws(&mut log).unwrap(), 0);
        assert!(log.0.is_empty());
    }

    #[test]
    fn recorder_error_stops_recording() {
        struct FailOnBind;
        impl DrawRecorder for FailOnBind {
            type Error = TextureId;
            fn bind_texture(&mut self, texture: TextureId) -> Result<(), TextureId> {
                Err(texture)
            }
            fn draw(&mut self, _: u32, _: u32) -> Result<(), TextureId> {
                panic!("draw after failed bind");
            }
        }

        let mut batch = batch_of(&[6]);
        batch.prepare();
        assert_eq!(batch.record_draws(&mut FailOnBind), Err(TextureId(6)));
    }
}
