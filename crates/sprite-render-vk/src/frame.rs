// SPDX-License-Identifier: CEPL-1.0
//! Frame Engine pieces: synchronization objects, the per-frame phase machine, the
//! vertex and uniform streams, and command recording.

use std::ffi::c_void;

use anyhow::Result;
use ash::vk;
use sprite_render::{DrawRecorder, ProjectionUniform, SpriteBatch, TextureId, Vertex};

use crate::alloc::{self, GpuBuffer, HOST_VISIBLE};
use crate::device::DeviceContext;
use crate::error::{RenderError, VkCall};
use crate::pipeline::{SpritePipeline, TEXTURE_BINDING, UNIFORM_BINDING};
use crate::texture::{GpuTexture, TextureCache};

/// One frame's worth of synchronization. Single-buffered: the fence guards everything the
/// frame touches, so only one frame is ever in flight.
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        unsafe {
            let sem = vk::SemaphoreCreateInfo::default();
            // signaled so the first frame does not wait forever
            let fence = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            Ok(Self {
                image_available: device.create_semaphore(&sem, None).vk("create_semaphore")?,
                render_finished: device.create_semaphore(&sem, None).vk("create_semaphore")?,
                in_flight: device.create_fence(&fence, None).vk("create_fence")?,
            })
        }
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.render_finished, None);
        device.destroy_fence(self.in_flight, None);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePhase {
    WaitForPrevious,
    DrainPendingUploads,
    Acquire,
    Record,
    Submit,
    Present,
}

impl FramePhase {
    pub fn next(self) -> Self {
        match self {
            Self::WaitForPrevious => Self::DrainPendingUploads,
            Self::DrainPendingUploads => Self::Acquire,
            Self::Acquire => Self::Record,
            Self::Record => Self::Submit,
            Self::Submit => Self::Present,
            Self::Present => Self::WaitForPrevious,
        }
    }
}

/// Enforces the per-frame step order. Starts as if a frame had just been presented.
#[derive(Debug)]
pub struct FrameCycle {
    phase: FramePhase,
}

impl Default for FrameCycle {
    fn default() -> Self {
        Self {
            phase: FramePhase::Present,
        }
    }
}

impl FrameCycle {
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn advance(&mut self, to: FramePhase) -> Result<(), RenderError> {
        if self.phase.next() != to {
            return Err(RenderError::FrameOrder {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }
}

/// Next power of two that holds `needed`, never below the current capacity.
pub fn grown_capacity(current: usize, needed: usize) -> usize {
    if needed <= current {
        current
    } else {
        needed.next_power_of_two()
    }
}

/// Device-local vertex buffer fed from a persistently mapped staging buffer.
pub struct VertexStream {
    staging: GpuBuffer,
    mapped: *mut c_void,
    device_local: GpuBuffer,
    capacity: usize,
}

impl VertexStream {
    pub fn new(ctx: &DeviceContext, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let bytes = (capacity * Vertex::STRIDE as usize) as vk::DeviceSize;
        unsafe {
            let staging = alloc::allocate_buffer(
                ctx,
                bytes,
                vk::BufferUsageFlags::TRANSFER_SRC,
                vk::SharingMode::EXCLUSIVE,
                HOST_VISIBLE,
            )?;
            let mapped = ctx
                .device
                .map_memory(staging.memory, 0, bytes, vk::MemoryMapFlags::empty())
                .vk("map_memory")?;
            let device_local = alloc::allocate_buffer(
                ctx,
                bytes,
                vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER,
                vk::SharingMode::EXCLUSIVE,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            Ok(Self {
                staging,
                mapped,
                device_local,
                capacity,
            })
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.device_local.buffer
    }

    /// Reallocates both buffers when `needed` vertices do not fit. Only call while the
    /// device is not reading either buffer.
    pub fn reserve(&mut self, ctx: &DeviceContext, needed: usize) -> Result<()> {
        let capacity = grown_capacity(self.capacity, needed);
        if capacity == self.capacity {
            return Ok(());
        }
        tracing::debug!("vk: vertex buffer {} -> {} vertices", self.capacity, capacity);
        let grown = Self::new(ctx, capacity)?;
        unsafe { self.destroy(&ctx.device) };
        *self = grown;
        Ok(())
    }

    pub fn write(&mut self, vertices: &[Vertex]) {
        let bytes: &[u8] = bytemuck::cast_slice(vertices);
        let len = bytes.len().min(self.capacity * Vertex::STRIDE as usize);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.mapped.cast::<u8>(), len);
        }
    }

    /// Staging -> device-local copy for `count` vertices, then a barrier so the vertex
    /// input stage sees the transfer. Must be recorded outside a render pass.
    pub unsafe fn record_upload(&self, device: &ash::Device, cmd: vk::CommandBuffer, count: usize) {
        if count == 0 {
            return;
        }
        let size = (count * Vertex::STRIDE as usize) as vk::DeviceSize;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        device.cmd_copy_buffer(cmd, self.staging.buffer, self.device_local.buffer, &[region]);

        let barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::VERTEX_ATTRIBUTE_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.device_local.buffer)
            .offset(0)
            .size(size);
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::DependencyFlags::empty(),
            &[],
            &[barrier],
            &[],
        );
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.unmap_memory(self.staging.memory);
        self.staging.destroy(device);
        self.device_local.destroy(device);
    }
}

/// Host-visible uniform buffer holding the projection, mapped for its whole life.
pub struct UniformBuffer {
    buffer: GpuBuffer,
    mapped: *mut c_void,
}

impl UniformBuffer {
    pub fn new(ctx: &DeviceContext) -> Result<Self> {
        let size = std::mem::size_of::<ProjectionUniform>() as vk::DeviceSize;
        unsafe {
            let buffer = alloc::allocate_buffer(
                ctx,
                size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::SharingMode::EXCLUSIVE,
                HOST_VISIBLE,
            )?;
            let mapped = ctx
                .device
                .map_memory(buffer.memory, 0, size, vk::MemoryMapFlags::empty())
                .vk("map_memory")?;
            Ok(Self { buffer, mapped })
        }
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    pub fn write(&mut self, uniform: &ProjectionUniform) {
        let bytes = bytemuck::bytes_of(uniform);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.mapped.cast::<u8>(), bytes.len());
        }
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.unmap_memory(self.buffer.memory);
        self.buffer.destroy(device);
    }
}

/// Records a batch's draw stream into a command buffer. Each bind re-pushes set 0 with
/// the run's texture.
pub struct VkDrawRecorder<'a> {
    pub ctx: &'a DeviceContext,
    pub cmd: vk::CommandBuffer,
    pub pipeline: &'a SpritePipeline,
    pub textures: &'a TextureCache<GpuTexture>,
    pub uniform: vk::Buffer,
}

impl DrawRecorder for VkDrawRecorder<'_> {
    type Error = RenderError;

    fn bind_texture(&mut self, texture: TextureId) -> Result<(), RenderError> {
        let view = self.textures.get(texture)?.view;
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: self.uniform,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let image_info = [vk::DescriptorImageInfo {
            sampler: self.pipeline.sampler,
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_binding(UNIFORM_BINDING)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info),
            vk::WriteDescriptorSet::default()
                .dst_binding(TEXTURE_BINDING)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_info),
        ];
        unsafe {
            self.ctx.push_descriptor.cmd_push_descriptor_set(
                self.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &writes,
            );
        }
        Ok(())
    }

    fn draw(&mut self, first_vertex: u32, vertex_count: u32) -> Result<(), RenderError> {
        unsafe {
            self.ctx
                .device
                .cmd_draw(self.cmd, vertex_count, 1, first_vertex, 0);
        }
        Ok(())
    }
}

/// Everything [`record_frame`] needs besides the batch.
pub struct FrameTargets<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub vertices: &'a VertexStream,
    pub uniform: &'a UniformBuffer,
}

/// Records one frame: vertex upload, then a single render pass with one draw per run.
/// The batch must already be prepared and its vertices written to the stream.
pub fn record_frame(
    ctx: &DeviceContext,
    cmd: vk::CommandBuffer,
    pipeline: &SpritePipeline,
    textures: &TextureCache<GpuTexture>,
    batch: &SpriteBatch,
    targets: &FrameTargets<'_>,
) -> Result<usize> {
    let device = &ctx.device;
    unsafe {
        device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .vk("reset_command_buffer")?;
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device
            .begin_command_buffer(cmd, &begin)
            .vk("begin_command_buffer")?;

        targets
            .vertices
            .record_upload(device, cmd, batch.vertices().len());

        let clear = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: targets.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: targets.extent,
        };
        let pass = vk::RenderPassBeginInfo::default()
            .render_pass(targets.render_pass)
            .framebuffer(targets.framebuffer)
            .render_area(area)
            .clear_values(&clear);
        device.cmd_begin_render_pass(cmd, &pass, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: targets.extent.width as f32,
            height: targets.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.cmd_set_scissor(cmd, 0, &[area]);
        device.cmd_bind_vertex_buffers(cmd, 0, &[targets.vertices.buffer()], &[0]);

        let mut recorder = VkDrawRecorder {
            ctx,
            cmd,
            pipeline,
            textures,
            uniform: targets.uniform.buffer(),
        };
        let draws = batch.record_draws(&mut recorder)?;

        device.cmd_end_render_pass(cmd);
        device.end_command_buffer(cmd).vk("end_command_buffer")?;
        Ok(draws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: [FramePhase; 6] = [
        FramePhase::WaitForPrevious,
        FramePhase::DrainPendingUploads,
        FramePhase::Acquire,
        FramePhase::Record,
        FramePhase::Submit,
        FramePhase::Present,
    ];

    #[test]
    fn full_cycles_are_legal() {
        let mut cycle = FrameCycle::default();
        for _ in 0..3 {
            for phase in ORDER {
                cycle.advance(phase).unwrap();
            }
        }
        assert_eq!(cycle.phase(), FramePhase::Present);
    }

    #[test]
    fn recording_before_the_fence_wait_is_rejected() {
        let mut cycle = FrameCycle::default();
        let err = cycle.advance(FramePhase::Record).unwrap_err();
        assert!(matches!(
            err,
            RenderError::FrameOrder {
                from: FramePhase::Present,
                to: FramePhase::Record
            }
        ));
        // a rejected step does not move the machine
        assert_eq!(cycle.phase(), FramePhase::Present);
    }

    #[test]
    fn next_frame_cannot_start_before_present() {
        let mut cycle = FrameCycle::default();
        for phase in &ORDER[..5] {
            cycle.advance(*phase).unwrap();
        }
        assert!(cycle.advance(FramePhase::WaitForPrevious).is_err());
        cycle.advance(FramePhase::Present).unwrap();
        cycle.advance(FramePhase::WaitForPrevious).unwrap();
    }

    #[test]
    fn skipping_the_upload_drain_is_rejected() {
        let mut cycle = FrameCycle::default();
        cycle.advance(FramePhase::WaitForPrevious).unwrap();
        assert!(cycle.advance(FramePhase::Acquire).is_err());
    }

    #[test]
    fn capacity_grows_to_next_power_of_two() {
        assert_eq!(grown_capacity(4096, 100), 4096);
        assert_eq!(grown_capacity(4096, 4096), 4096);
        assert_eq!(grown_capacity(4096, 4097), 8192);
        assert_eq!(grown_capacity(4096, 20_000), 32_768);
        assert_eq!(grown_capacity(1, 6), 8);
    }
}
