// SPDX-License-Identifier: CEPL-1.0
//! Buffer and image allocation, staging uploads and layout transitions.
//!
//! Uploads are synchronous: every one-shot command is recorded in a [`TransferSession`],
//! submitted on the graphics queue and waited on before returning. They happen once per
//! distinct texture, never per frame.

use anyhow::{Context, Result};
use ash::vk;

use crate::device::DeviceContext;
use crate::error::{RenderError, VkCall};

/// First memory type allowed by `filter` whose flags are a superset of `required`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    filter: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, RenderError> {
    (0..props.memory_type_count)
        .find(|&i| {
            filter & (1 << i) != 0 && props.memory_types[i as usize].property_flags.contains(required)
        })
        .ok_or(RenderError::NoMemoryType { filter, required })
}

pub const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

#[derive(Clone, Copy, Debug)]
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl GpuBuffer {
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_buffer(self.buffer, None);
        device.free_memory(self.memory, None);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GpuImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
}

impl GpuImage {
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_image(self.image, None);
        device.free_memory(self.memory, None);
    }
}

unsafe fn allocate_for(
    ctx: &DeviceContext,
    requirements: vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let type_index = find_memory_type(&ctx.memory, requirements.memory_type_bits, flags)?;
    let info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(type_index);
    Ok(ctx.device.allocate_memory(&info, None).vk("allocate_memory")?)
}

/// Creates a buffer, allocates memory of the first matching type and binds it.
///
/// With `CONCURRENT` sharing the buffer is shared across the graphics and present families.
pub unsafe fn allocate_buffer(
    ctx: &DeviceContext,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    sharing: vk::SharingMode,
    flags: vk::MemoryPropertyFlags,
) -> Result<GpuBuffer> {
    let families = ctx.sharing_families();
    let mut info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(sharing);
    if sharing == vk::SharingMode::CONCURRENT {
        info = info.queue_family_indices(&families);
    }
    let buffer = ctx.device.create_buffer(&info, None).vk("create_buffer")?;

    let requirements = ctx.device.get_buffer_memory_requirements(buffer);
    let memory = allocate_for(ctx, requirements, flags)?;
    ctx.device
        .bind_buffer_memory(buffer, memory, 0)
        .vk("bind_buffer_memory")?;
    Ok(GpuBuffer {
        buffer,
        memory,
        size,
    })
}

/// 2D, one mip, one layer, optimal tiling, device-local.
pub unsafe fn allocate_image(
    ctx: &DeviceContext,
    width: u32,
    height: u32,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
) -> Result<GpuImage> {
    let info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let image = ctx.device.create_image(&info, None).vk("create_image")?;

    let requirements = ctx.device.get_image_memory_requirements(image);
    let memory = allocate_for(ctx, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
    ctx.device
        .bind_image_memory(image, memory, 0)
        .vk("bind_image_memory")?;
    Ok(GpuImage { image, memory })
}

pub unsafe fn create_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(subresource(aspect));
    Ok(device.create_image_view(&info, None).vk("create_image_view")?)
}

pub fn subresource(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Host-visible, coherent transfer source. Freed on drop.
pub struct StagingBuffer<'a> {
    device: &'a ash::Device,
    inner: GpuBuffer,
}

impl<'a> StagingBuffer<'a> {
    pub fn with_bytes(ctx: &'a DeviceContext, bytes: &[u8]) -> Result<Self> {
        unsafe {
            let inner = allocate_buffer(
                ctx,
                bytes.len() as vk::DeviceSize,
                vk::BufferUsageFlags::TRANSFER_SRC,
                vk::SharingMode::EXCLUSIVE,
                HOST_VISIBLE,
            )?;
            let staging = Self {
                device: &ctx.device,
                inner,
            };
            let ptr = ctx
                .device
                .map_memory(inner.memory, 0, inner.size, vk::MemoryMapFlags::empty())
                .vk("map_memory")?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            ctx.device.unmap_memory(inner.memory);
            Ok(staging)
        }
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.inner.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }
}

impl Drop for StagingBuffer<'_> {
    fn drop(&mut self) {
        unsafe { self.inner.destroy(self.device) }
    }
}

/// One-shot command buffer on the graphics queue.
///
/// `begin` allocates and starts recording, `submit_and_wait` ends, submits and blocks until
/// the queue is idle. The command buffer is freed on drop, whether or not it was submitted.
pub struct TransferSession<'a> {
    ctx: &'a DeviceContext,
    cmd: vk::CommandBuffer,
}

impl<'a> TransferSession<'a> {
    pub fn begin(ctx: &'a DeviceContext) -> Result<Self> {
        unsafe {
            let alloc = vk::CommandBufferAllocateInfo::default()
                .command_pool(ctx.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = ctx
                .device
                .allocate_command_buffers(&alloc)
                .vk("allocate_command_buffers")?[0];
            let session = Self { ctx, cmd };

            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            ctx.device
                .begin_command_buffer(cmd, &begin)
                .vk("begin_command_buffer")?;
            Ok(session)
        }
    }

    pub fn cmd(&self) -> vk::CommandBuffer {
        self.cmd
    }

    pub fn device(&self) -> &ash::Device {
        &self.ctx.device
    }

    pub fn submit_and_wait(self) -> Result<()> {
        let device = &self.ctx.device;
        unsafe {
            device.end_command_buffer(self.cmd).vk("end_command_buffer")?;
            let cmds = [self.cmd];
            let submit = vk::SubmitInfo::default().command_buffers(&cmds);
            device
                .queue_submit(self.ctx.graphics_queue, &[submit], vk::Fence::null())
                .vk("queue_submit")?;
            device
                .queue_wait_idle(self.ctx.graphics_queue)
                .vk("queue_wait_idle")?;
        }
        Ok(())
    }
}

impl Drop for TransferSession<'_> {
    fn drop(&mut self) {
        unsafe {
            self.ctx
                .device
                .free_command_buffers(self.ctx.command_pool, &[self.cmd]);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// The only transitions a one-time texture upload needs.
pub fn barrier_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<BarrierMasks, RenderError> {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Ok(BarrierMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Ok(BarrierMasks {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            })
        }
        _ => Err(RenderError::UnsupportedLayoutTransition { old, new }),
    }
}

pub unsafe fn record_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<(), RenderError> {
    let masks = barrier_masks(old, new)?;
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource(vk::ImageAspectFlags::COLOR))
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access);
    device.cmd_pipeline_barrier(
        cmd,
        masks.src_stage,
        masks.dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
    Ok(())
}

/// Moves a color image between layouts with a one-shot barrier.
pub fn transition_layout(
    ctx: &DeviceContext,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let session = TransferSession::begin(ctx)?;
    unsafe { record_transition(session.device(), session.cmd(), image, old, new)? };
    session
        .submit_and_wait()
        .with_context(|| format!("layout transition {old:?} -> {new:?}"))
}

#[derive(Clone, Copy, Debug)]
pub enum UploadTarget {
    Buffer(vk::Buffer),
    /// Must already be in `TRANSFER_DST_OPTIMAL`.
    Image {
        image: vk::Image,
        width: u32,
        height: u32,
    },
}

/// Copies `bytes` into device-local memory through a temporary staging buffer.
pub fn upload_via_staging(ctx: &DeviceContext, bytes: &[u8], target: UploadTarget) -> Result<()> {
    let staging = StagingBuffer::with_bytes(ctx, bytes)?;
    let session = TransferSession::begin(ctx)?;
    unsafe {
        match target {
            UploadTarget::Buffer(dst) => {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: staging.size(),
                };
                session
                    .device()
                    .cmd_copy_buffer(session.cmd(), staging.buffer(), dst, &[region]);
            }
            UploadTarget::Image {
                image,
                width,
                height,
            } => {
                let region = vk::BufferImageCopy::default()
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_extent(vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    });
                session.device().cmd_copy_buffer_to_image(
                    session.cmd(),
                    staging.buffer(),
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
        }
    }
    // staging outlives the wait
    session.submit_and_wait().context("staging upload")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            *slot = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        props
    }

    fn typical() -> vk::PhysicalDeviceMemoryProperties {
        memory(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | HOST_VISIBLE,
        ])
    }

    #[test]
    fn picks_first_type_with_superset_flags() {
        let props = typical();
        assert_eq!(find_memory_type(&props, 0b1111, HOST_VISIBLE).unwrap(), 2);
        assert_eq!(
            find_memory_type(&props, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn respects_the_filter_mask() {
        let props = typical();
        // type 0 filtered out, type 3 is device-local too
        assert_eq!(
            find_memory_type(&props, 0b1000, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            3
        );
    }

    #[test]
    fn result_always_satisfies_filter_and_flags() {
        let props = typical();
        let wanted = [
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            HOST_VISIBLE,
        ];
        for filter in 0..16u32 {
            for &flags in &wanted {
                if let Ok(i) = find_memory_type(&props, filter, flags) {
                    assert_ne!(filter & (1 << i), 0);
                    assert!(props.memory_types[i as usize].property_flags.contains(flags));
                }
            }
        }
    }

    #[test]
    fn no_match_is_an_error_not_an_index() {
        let props = memory(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = find_memory_type(&props, 0b1, HOST_VISIBLE).unwrap_err();
        assert!(matches!(
            err,
            RenderError::NoMemoryType { filter: 1, required } if required == HOST_VISIBLE
        ));
        // types beyond memory_type_count are never considered
        assert!(find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::empty()).is_err());
    }

    #[test]
    fn upload_transitions_are_in_the_table() {
        let to_dst = barrier_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_dst.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);

        let to_read = barrier_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_read.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn other_transitions_are_rejected() {
        let pairs = [
            (
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
            (
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
            (
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ),
        ];
        for (old, new) in pairs {
            assert!(matches!(
                barrier_masks(old, new),
                Err(RenderError::UnsupportedLayoutTransition { .. })
            ));
        }
    }
}
