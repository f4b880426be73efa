// SPDX-License-Identifier: CEPL-1.0
use ash::prelude::VkResult;
use ash::vk;
use sprite_render::{SpriteError, TextureId};

use crate::frame::FramePhase;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    // configuration faults, raised while loading
    #[error("no physical device offers graphics + present queues and the required extensions")]
    NoSuitableDevice,
    #[error("no memory type in filter {filter:#b} has {required:?}")]
    NoMemoryType {
        filter: u32,
        required: vk::MemoryPropertyFlags,
    },
    #[error("surface images cannot be used as {0:?}")]
    MissingSurfaceUsage(vk::ImageUsageFlags),
    #[error("surface reports no formats")]
    NoSurfaceFormat,

    // protocol faults
    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    // logic faults
    #[error("texture {0} was drawn but never uploaded")]
    MissingTexture(TextureId),
    #[error("no barrier for layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    #[error("frame stepped from {from:?} to {to:?}")]
    FrameOrder { from: FramePhase, to: FramePhase },
    #[error(transparent)]
    Sprite(#[from] SpriteError),
}

/// Tags a raw `VkResult` with the name of the call that produced it.
pub(crate) trait VkCall<T> {
    fn vk(self, call: &'static str) -> Result<T, RenderError>;
}

impl<T> VkCall<T> for VkResult<T> {
    fn vk(self, call: &'static str) -> Result<T, RenderError> {
        self.map_err(|result| RenderError::Vulkan { call, result })
    }
}
