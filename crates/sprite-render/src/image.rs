// SPDX-License-Identifier: CEPL-1.0
use std::collections::{HashSet, VecDeque};

use tracing::warn;

use crate::{SpriteError, TextureId};

/// Decoded RGBA8 pixels waiting to become a GPU texture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingImage {
    id: TextureId,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl PendingImage {
    pub const BYTES_PER_PIXEL: usize = 4;

    pub fn new(id: TextureId, width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, SpriteError> {
        if width == 0 || height == 0 {
            return Err(SpriteError::EmptyImage(id));
        }
        let expected = width as usize * height as usize * Self::BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(SpriteError::PixelSizeMismatch {
                id,
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            id,
            width,
            height,
            pixels,
        })
    }

    /// Single-colour image, mostly useful for placeholders and tests.
    pub fn solid(id: TextureId, width: u32, height: u32, rgba: [u8; 4]) -> Result<Self, SpriteError> {
        let count = width as usize * height as usize;
        let pixels = rgba.iter().copied().cycle().take(count * Self::BYTES_PER_PIXEL).collect();
        Self::new(id, width, height, pixels)
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

/// FIFO of textures to materialize at the start of the next frame.
///
/// Every id is accepted once for the lifetime of the queue; a second enqueue of the
/// same id is rejected whether the first copy is still pending or already uploaded.
#[derive(Debug, Default)]
pub struct ImageQueue {
    pending: VecDeque<PendingImage>,
    known: HashSet<TextureId>,
}

impl ImageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, image: PendingImage) -> Result<(), SpriteError> {
        if !self.known.insert(image.id) {
            warn!("rejecting duplicate enqueue of texture {}", image.id);
            return Err(SpriteError::DuplicateTexture(image.id));
        }
        self.pending.push_back(image);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<PendingImage> {
        self.pending.pop_front()
    }

    pub fn is_known(&self, id: TextureId) -> bool {
        self.known.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_pixel_count() {
        let err = PendingImage::new(TextureId(3), 2, 2, vec![0; 15]).unwrap_err();
        assert_eq!(
            err,
            SpriteError::PixelSizeMismatch {
                id: TextureId(3),
                width: 2,
                height: 2,
                expected: 16,
                actual: 15,
            }
        );
    }

    #[test]
    fn rejects_empty_image() {
        assert_eq!(
            PendingImage::new(TextureId(1), 0, 4, Vec::new()).unwrap_err(),
            SpriteError::EmptyImage(TextureId(1))
        );
    }

    #[test]
    fn solid_fills_every_pixel() {
        let img = PendingImage::solid(TextureId(7), 2, 2, [255, 0, 0, 255]).unwrap();
        assert_eq!(img.byte_len(), 16);
        assert!(img.pixels().chunks(4).all(|p| p == [255, 0, 0, 255]));
    }

    #[test]
    fn queue_is_fifo() {
        let mut q = ImageQueue::new();
        for id in [4, 2, 9] {
            q.enqueue(PendingImage::solid(TextureId(id), 1, 1, [0; 4]).unwrap())
                .unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| q.pop()).map(|i| i.id().0).collect();
        assert_eq!(order, vec![4, 2, 9]);
        assert!(q.is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected_even_after_drain() {
        let mut q = ImageQueue::new();
        let img = PendingImage::solid(TextureId(5), 1, 1, [1; 4]).unwrap();
        q.enqueue(img.clone()).unwrap();
        assert_eq!(q.enqueue(img.clone()), Err(SpriteError::DuplicateTexture(TextureId(5))));
        assert_eq!(q.len(), 1);

        q.pop();
        assert_eq!(q.enqueue(img), Err(SpriteError::DuplicateTexture(TextureId(5))));
        assert!(q.is_known(TextureId(5)));
        assert!(q.is_empty());
    }
}
