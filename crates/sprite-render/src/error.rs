// SPDX-License-Identifier: CEPL-1.0
use crate::TextureId;

/// Contract violations that can be detected before anything reaches the GPU.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpriteError {
    #[error("texture {0} was already enqueued")]
    DuplicateTexture(TextureId),
    #[error("texture {id}: expected {expected} bytes of RGBA8 for {width}x{height}, got {actual}")]
    PixelSizeMismatch {
        id: TextureId,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("texture {0} has zero width or height")]
    EmptyImage(TextureId),
}
