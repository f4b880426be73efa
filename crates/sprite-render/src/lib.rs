// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use glam::Vec2;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

mod batch;
mod config;
mod error;
mod image;
mod projection;
mod quad;

pub use glam;

pub use batch::{DrawRecorder, DrawRun, SortKey, SpriteBatch};
pub use config::{PresentModePreference, RendererConfig, ShaderBytecode};
pub use error::SpriteError;
pub use image::{ImageQueue, PendingImage};
pub use projection::{orthographic, ProjectionUniform};
pub use quad::{Quad, Vertex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Caller-chosen texture identity. The id is the only key the renderer knows a texture by.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TextureId(pub u32);

impl std::fmt::Display for TextureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immediate-mode sprite renderer bound to one surface.
///
/// Per frame the host enqueues any first-seen textures, submits quads, then calls
/// [`Renderer::end_frame`], which uploads the queued textures, draws the batch and
/// presents. All batch state is cleared once the frame is submitted.
pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        config: RendererConfig,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Records the new drawable size. The swapchain is rebuilt before the next frame.
    fn resize(&mut self, size: RenderSize) -> Result<()>;

    /// Hands decoded RGBA8 pixels to the renderer. Each id may be enqueued once.
    fn enqueue_image(&mut self, image: PendingImage) -> Result<()>;

    fn submit(&mut self, quad: Quad);

    fn submit_quad(&mut self, center: Vec2, half_extent: Vec2, texture: TextureId) {
        self.submit(Quad::new(center, half_extent, texture));
    }

    fn end_frame(&mut self) -> Result<()>;

    fn set_clear_color(&mut self, rgba: [f32; 4]);
}
