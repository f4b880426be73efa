// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use sprite_render::{
    ImageQueue, PendingImage, PresentModePreference, ProjectionUniform, Quad, RenderSize,
    Renderer, RendererConfig, SpriteBatch,
};
use tracing::{debug, info, trace};

mod alloc;
mod device;
mod error;
mod frame;
mod pipeline;
mod swapchain;
mod texture;

pub use device::{DeviceContext, QueueFamilies};
pub use error::RenderError;
pub use frame::{FrameCycle, FramePhase};
pub use texture::{GpuTexture, TextureCache};

use error::VkCall;
use frame::{FrameSync, FrameTargets, UniformBuffer, VertexStream};
use pipeline::SpritePipeline;
use swapchain::Swapchain;

/// Vulkan sprite renderer. One frame in flight at a time.
///
/// Device children are destroyed explicitly in `Drop`; `ctx` drops itself afterwards.
pub struct VkRenderer {
    swapchain: Swapchain,
    pipeline: SpritePipeline,
    sync: FrameSync,
    cycle: FrameCycle,
    cmd: vk::CommandBuffer,
    vertices: VertexStream,
    uniform: UniformBuffer,
    textures: TextureCache<GpuTexture>,

    images: ImageQueue,
    batch: SpriteBatch,
    size: RenderSize,
    clear_color: [f32; 4],
    present_mode: PresentModePreference,

    ctx: DeviceContext,
}

impl VkRenderer {
    pub fn extent(&self) -> RenderSize {
        RenderSize {
            width: self.swapchain.extent.width,
            height: self.swapchain.extent.height,
        }
    }

    pub fn swapchain_image_count(&self) -> usize {
        self.swapchain.images.len()
    }

    pub fn resident_textures(&self) -> usize {
        self.textures.len()
    }

    // Stop-the-world: nothing may reference the old images, views or depth buffer.
    fn rebuild_swapchain(&mut self) -> Result<()> {
        unsafe {
            self.ctx
                .device
                .device_wait_idle()
                .vk("device_wait_idle")?;
        }
        info!(
            "vk: rebuilding swapchain for {}x{}",
            self.size.width, self.size.height
        );
        let pass_changed = self
            .swapchain
            .rebuild(&self.ctx, self.size, self.present_mode)
            .context("swapchain rebuild")?;
        if pass_changed {
            self.pipeline
                .rebuild(&self.ctx.device, self.swapchain.render_pass)
                .context("pipeline rebuild")?;
        }
        Ok(())
    }

    // STRICT PER-FRAME ORDER:
    // wait fence -> drain uploads -> acquire -> record -> submit -> present.
    // The fence wait is what makes it safe to overwrite the staging, vertex and
    // uniform buffers below.
    fn draw_frame(&mut self) -> Result<()> {
        let device = &self.ctx.device;

        self.cycle.advance(FramePhase::WaitForPrevious)?;
        unsafe {
            device
                .wait_for_fences(&[self.sync.in_flight], true, u64::MAX)
                .vk("wait_for_fences")?;
            device
                .reset_fences(&[self.sync.in_flight])
                .vk("reset_fences")?;
        }

        self.cycle.advance(FramePhase::DrainPendingUploads)?;
        let ctx = &self.ctx;
        let uploaded = self
            .textures
            .drain_pending(&mut self.images, |pending| texture::materialize(ctx, pending))?;
        if uploaded > 0 {
            debug!("vk: {uploaded} texture(s) uploaded this frame");
        }

        self.cycle.advance(FramePhase::Acquire)?;
        let (image_index, _suboptimal) = unsafe {
            self.ctx
                .swapchain_loader
                .acquire_next_image(
                    self.swapchain.handle,
                    u64::MAX,
                    self.sync.image_available,
                    vk::Fence::null(),
                )
                .vk("acquire_next_image")?
        };
        let framebuffer = self
            .swapchain
            .images
            .get(image_index)
            .map(|per| per.framebuffer)
            .with_context(|| format!("acquired image {image_index} out of range"))?;

        self.cycle.advance(FramePhase::Record)?;
        self.batch.prepare();
        self.vertices
            .reserve(&self.ctx, self.batch.vertices().len())?;
        self.vertices.write(self.batch.vertices());
        let extent = self.extent();
        self.uniform.write(&ProjectionUniform::for_size(extent));
        let targets = FrameTargets {
            render_pass: self.swapchain.render_pass,
            framebuffer,
            extent: self.swapchain.extent,
            clear_color: self.clear_color,
            vertices: &self.vertices,
            uniform: &self.uniform,
        };
        let draws = frame::record_frame(
            &self.ctx,
            self.cmd,
            &self.pipeline,
            &self.textures,
            &self.batch,
            &targets,
        )?;

        self.cycle.advance(FramePhase::Submit)?;
        let device = &self.ctx.device;
        let wait = [self.sync.image_available];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let cmds = [self.cmd];
        let signal = [self.sync.render_finished];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signal);
        unsafe {
            device
                .queue_submit(self.ctx.graphics_queue, &[submit], self.sync.in_flight)
                .vk("queue_submit")?;
        }

        self.cycle.advance(FramePhase::Present)?;
        let swapchains = [self.swapchain.handle];
        let indices = [image_index];
        let present = vk::PresentInfoKHR::default()
            .wait_semaphores(&signal)
            .swapchains(&swapchains)
            .image_indices(&indices);
        unsafe {
            self.ctx
                .swapchain_loader
                .queue_present(self.ctx.present_queue, &present)
                .vk("queue_present")?;
        }

        trace!(
            "vk: frame with {} triangles in {draws} draw(s)",
            self.batch.triangle_count()
        );
        Ok(())
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        config: RendererConfig,
    ) -> Result<Self> {
        let ctx = DeviceContext::new(window, display, &config).context("device bootstrap")?;
        let swapchain =
            Swapchain::new(&ctx, size, config.present_mode).context("initial swapchain")?;
        let pipeline = SpritePipeline::new(&ctx, config.shaders, swapchain.render_pass)
            .context("sprite pipeline")?;
        let sync = FrameSync::new(&ctx.device)?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(ctx.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe {
            ctx.device
                .allocate_command_buffers(&alloc_info)
                .vk("allocate_command_buffers")?[0]
        };

        let vertices = VertexStream::new(&ctx, config.initial_vertex_capacity)?;
        let uniform = UniformBuffer::new(&ctx)?;

        info!(
            "vk: renderer ready, {}x{}, vertex capacity {}",
            swapchain.extent.width,
            swapchain.extent.height,
            vertices.capacity()
        );

        Ok(Self {
            swapchain,
            pipeline,
            sync,
            cycle: FrameCycle::default(),
            cmd,
            vertices,
            uniform,
            textures: TextureCache::new(),
            images: ImageQueue::new(),
            batch: SpriteBatch::new(),
            size,
            clear_color: config.clear_color,
            present_mode: config.present_mode,
            ctx,
        })
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        if size.is_empty() && !self.size.is_empty() {
            info!("vk: resize to 0x0, paused");
        } else if !size.is_empty() && self.size.is_empty() {
            info!("vk: resize to {}x{}, resumed", size.width, size.height);
        }
        self.size = size;
        Ok(())
    }

    fn enqueue_image(&mut self, image: PendingImage) -> Result<()> {
        Ok(self.images.enqueue(image)?)
    }

    fn submit(&mut self, quad: Quad) {
        self.batch.push(&quad);
    }

    fn end_frame(&mut self) -> Result<()> {
        let result = if self.size.is_empty() {
            Ok(())
        } else if self.swapchain.needs_rebuild(self.size) {
            self.rebuild_swapchain().and_then(|_| self.draw_frame())
        } else {
            self.draw_frame()
        };
        self.batch.clear();
        result
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = rgba;
    }
}

// STRICT TEARDOWN ORDER:
// - device idle (no frame may still read anything)
// - textures, vertex/uniform streams, sync, command buffer
// - pipeline (uses the render pass), then swapchain + render pass
// - DeviceContext drops last: pool, device, surface, messenger, instance
impl Drop for VkRenderer {
    fn drop(&mut self) {
        unsafe {
            let d = &self.ctx.device;
            d.device_wait_idle().ok();

            for texture in std::mem::take(&mut self.textures).into_resources() {
                texture.destroy(d);
            }
            self.vertices.destroy(d);
            self.uniform.destroy(d);
            self.sync.destroy(d);
            d.free_command_buffers(self.ctx.command_pool, &[self.cmd]);

            self.pipeline.destroy(d);
            self.swapchain.destroy(&self.ctx);
        }
    }
}
