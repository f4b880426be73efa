// SPDX-License-Identifier: CEPL-1.0
use std::collections::HashMap;

use anyhow::{Context, Result};
use ash::vk;
use sprite_render::{ImageQueue, PendingImage, SpriteError, TextureId};
use tracing::debug;

use crate::alloc::{self, GpuImage, UploadTarget};
use crate::device::DeviceContext;
use crate::error::RenderError;

/// Pending images are RGBA8 with sRGB-encoded colour.
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

#[derive(Clone, Copy, Debug)]
pub struct GpuTexture {
    pub image: GpuImage,
    pub view: vk::ImageView,
    pub width: u32,
    pub height: u32,
}

impl GpuTexture {
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_image_view(self.view, None);
        self.image.destroy(device);
    }
}

/// Uploads one pending image: staging copy into a fresh device-local image, then a
/// shader-readable view.
pub fn materialize(ctx: &DeviceContext, pending: &PendingImage) -> Result<GpuTexture> {
    let (width, height) = (pending.width(), pending.height());
    let image = unsafe {
        alloc::allocate_image(
            ctx,
            width,
            height,
            TEXTURE_FORMAT,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        )?
    };

    alloc::transition_layout(
        ctx,
        image.image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    )?;
    alloc::upload_via_staging(
        ctx,
        pending.pixels(),
        UploadTarget::Image {
            image: image.image,
            width,
            height,
        },
    )?;
    alloc::transition_layout(
        ctx,
        image.image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    )?;

    let view = unsafe {
        alloc::create_view(
            &ctx.device,
            image.image,
            TEXTURE_FORMAT,
            vk::ImageAspectFlags::COLOR,
        )?
    };
    debug!("vk: texture {} resident ({}x{})", pending.id(), width, height);
    Ok(GpuTexture {
        image,
        view,
        width,
        height,
    })
}

/// Append-only map from texture id to its GPU resource.
///
/// Entries are never replaced or removed; they are released together at shutdown via
/// [`TextureCache::into_resources`]. The id space is assumed finite and small.
#[derive(Debug)]
pub struct TextureCache<T> {
    entries: HashMap<TextureId, T>,
}

impl<T> Default for TextureCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> TextureCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: TextureId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Draw-time lookup. A miss means a quad referenced an id that was never enqueued.
    pub fn get(&self, id: TextureId) -> Result<&T, RenderError> {
        self.entries.get(&id).ok_or(RenderError::MissingTexture(id))
    }

    pub fn insert(&mut self, id: TextureId, resource: T) -> Result<(), RenderError> {
        if self.contains(id) {
            return Err(SpriteError::DuplicateTexture(id).into());
        }
        self.entries.insert(id, resource);
        Ok(())
    }

    /// Runs `create` only the first time an id is seen.
    pub fn get_or_create<F>(&mut self, pending: &PendingImage, create: F) -> Result<&T>
    where
        F: FnOnce(&PendingImage) -> Result<T>,
    {
        let id = pending.id();
        if !self.contains(id) {
            let resource =
                create(pending).with_context(|| format!("materializing texture {id}"))?;
            self.insert(id, resource)?;
        }
        Ok(self.get(id)?)
    }

    /// Materializes every queued image. Returns how many were created.
    pub fn drain_pending<F>(&mut self, queue: &mut ImageQueue, mut create: F) -> Result<usize>
    where
        F: FnMut(&PendingImage) -> Result<T>,
    {
        let before = self.len();
        while let Some(pending) = queue.pop() {
            self.get_or_create(&pending, &mut create)?;
        }
        Ok(self.len() - before)
    }

    pub fn into_resources(self) -> impl Iterator<Item = T> {
        self.entries.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counts creations and hands out sequential fake handles.
    #[derive(Default)]
    struct FakeCreator {
        created: Vec<TextureId>,
    }

    impl FakeCreator {
        fn create(&mut self, pending: &PendingImage) -> Result<u32> {
            self.created.push(pending.id());
            Ok(self.created.len() as u32)
        }
    }

    fn red(id: u32) -> PendingImage {
        PendingImage::solid(TextureId(id), 2, 2, [255, 0, 0, 255]).unwrap()
    }

    #[test]
    fn one_entry_per_id_regardless_of_requests() {
        let mut cache = TextureCache::new();
        let mut fake = FakeCreator::default();
        let image = red(7);

        for _ in 0..50 {
            let handle = *cache.get_or_create(&image, |p| fake.create(p)).unwrap();
            assert_eq!(handle, 1);
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(fake.created, vec![TextureId(7)]);
    }

    #[test]
    fn drain_empties_the_queue_in_order() {
        let mut queue = ImageQueue::new();
        for id in [3, 1, 2] {
            queue.enqueue(red(id)).unwrap();
        }
        let mut cache = TextureCache::new();
        let mut fake = FakeCreator::default();

        let created = cache.drain_pending(&mut queue, |p| fake.create(p)).unwrap();

        assert_eq!(created, 3);
        assert!(queue.is_empty());
        assert_eq!(fake.created, vec![TextureId(3), TextureId(1), TextureId(2)]);
        assert_eq!(*cache.get(TextureId(1)).unwrap(), 2);
    }

    #[test]
    fn draining_an_empty_queue_creates_nothing() {
        let mut cache: TextureCache<u32> = TextureCache::new();
        let created = cache
            .drain_pending(&mut ImageQueue::new(), |_| unreachable!())
            .unwrap();
        assert_eq!(created, 0);
    }

    #[test]
    fn lookup_of_unknown_id_fails() {
        let cache: TextureCache<u32> = TextureCache::new();
        assert!(matches!(
            cache.get(TextureId(9)),
            Err(RenderError::MissingTexture(TextureId(9)))
        ));
    }

    #[test]
    fn insert_refuses_to_overwrite() {
        let mut cache = TextureCache::new();
        cache.insert(TextureId(1), "first").unwrap();
        let err = cache.insert(TextureId(1), "second").unwrap_err();
        assert!(matches!(
            err,
            RenderError::Sprite(SpriteError::DuplicateTexture(TextureId(1)))
        ));
        assert_eq!(*cache.get(TextureId(1)).unwrap(), "first");
    }

    #[test]
    fn failed_creation_leaves_no_entry() {
        let mut cache: TextureCache<u32> = TextureCache::new();
        let result = cache.get_or_create(&red(4), |_| Err(anyhow::anyhow!("out of memory")));
        assert!(result.is_err());
        assert!(!cache.contains(TextureId(4)));
    }

    #[test]
    fn teardown_yields_every_resource() {
        let mut cache = TextureCache::new();
        for id in 0..4 {
            cache.insert(TextureId(id), id * 10).unwrap();
        }
        let mut all: Vec<u32> = cache.into_resources().collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 10, 20, 30]);
    }
}
