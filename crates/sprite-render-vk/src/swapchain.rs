// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::vk;
use sprite_render::{PresentModePreference, RenderSize};
use tracing::info;

use crate::alloc::{self, GpuImage};
use crate::device::DeviceContext;
use crate::error::{RenderError, VkCall};

pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

fn same_format(a: &vk::SurfaceFormatKHR, b: &vk::SurfaceFormatKHR) -> bool {
    a.format == b.format && a.color_space == b.color_space
}

/// sRGB BGRA8 if offered, otherwise whatever the driver lists first. A lone `UNDEFINED`
/// entry means the surface takes any format.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Result<vk::SurfaceFormatKHR, RenderError> {
    match formats {
        [] => Err(RenderError::NoSurfaceFormat),
        [only] if only.format == vk::Format::UNDEFINED => Ok(PREFERRED_FORMAT),
        _ => Ok(formats
            .iter()
            .copied()
            .find(|f| same_format(f, &PREFERRED_FORMAT))
            .unwrap_or(formats[0])),
    }
}

pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preference: PresentModePreference,
) -> vk::PresentModeKHR {
    match preference {
        PresentModePreference::Mailbox if modes.contains(&vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        // FIFO is always available
        _ => vk::PresentModeKHR::FIFO,
    }
}

/// Requested size clamped into the surface's supported range.
pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    vk::Extent2D {
        width: want
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: want
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum (0 = no maximum).
pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        wanted
    } else {
        wanted.min(caps.max_image_count)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PerImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
}

/// Presentable images with their view and framebuffer.
///
/// Only ever built whole from the swapchain's image list and replaced whole on rebuild.
#[derive(Debug, Default)]
pub struct SwapchainImages {
    per_image: Vec<PerImage>,
}

impl SwapchainImages {
    pub fn build<E>(
        images: &[vk::Image],
        mut attach: impl FnMut(vk::Image) -> Result<(vk::ImageView, vk::Framebuffer), E>,
    ) -> Result<Self, E> {
        let per_image = images
            .iter()
            .map(|&image| {
                let (view, framebuffer) = attach(image)?;
                Ok(PerImage {
                    image,
                    view,
                    framebuffer,
                })
            })
            .collect::<Result<_, E>>()?;
        Ok(Self { per_image })
    }

    pub fn len(&self) -> usize {
        self.per_image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_image.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&PerImage> {
        self.per_image.get(index as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PerImage> {
        self.per_image.iter()
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        for per in self.per_image.drain(..) {
            device.destroy_framebuffer(per.framebuffer, None);
            device.destroy_image_view(per.view, None);
        }
    }
}

pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

unsafe fn pick_depth_format(ctx: &DeviceContext) -> vk::Format {
    // Prefer 32f -> 24+S8 -> 32f+S8 -> 16
    let candidates = [
        vk::Format::D32_SFLOAT,
        vk::Format::D24_UNORM_S8_UINT,
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D16_UNORM,
    ];
    candidates
        .into_iter()
        .find(|&format| {
            ctx.instance
                .get_physical_device_format_properties(ctx.phys, format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .unwrap_or(vk::Format::D16_UNORM) // D16 support is mandatory
}

pub struct DepthBuffer {
    pub image: GpuImage,
    pub view: vk::ImageView,
}

impl DepthBuffer {
    unsafe fn new(ctx: &DeviceContext, extent: vk::Extent2D, format: vk::Format) -> Result<Self> {
        let image = alloc::allocate_image(
            ctx,
            extent.width,
            extent.height,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;
        let view = alloc::create_view(&ctx.device, image.image, format, depth_aspect(format))?;
        Ok(Self { image, view })
    }

    unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_image_view(self.view, None);
        self.image.destroy(device);
    }
}

unsafe fn create_render_pass(
    device: &ash::Device,
    color: vk::Format,
    depth: vk::Format,
) -> Result<vk::RenderPass> {
    let attachments = [
        vk::AttachmentDescription::default()
            .format(color)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
        vk::AttachmentDescription::default()
            .format(depth)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
    ];
    let color_ref = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_ref)
        .depth_stencil_attachment(&depth_ref);

    // Acquire semaphore waits at COLOR_ATTACHMENT_OUTPUT; the layout change from UNDEFINED
    // must wait for it too. Depth is reused every frame and needs the same ordering.
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .dst_stage_mask(stages)
        .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

    let subpasses = [subpass];
    let dependencies = [dependency];
    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    Ok(device
        .create_render_pass(&info, None)
        .vk("create_render_pass")?)
}

/// Swapchain, per-image views and framebuffers, depth buffer and the render pass they
/// share.
///
/// Rebuilt whole when the drawable size changes. The render pass survives a rebuild unless
/// the surface format changes.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub render_pass: vk::RenderPass,
    pub images: SwapchainImages,
    depth_format: vk::Format,
    depth: Option<DepthBuffer>,
    built_for: RenderSize,
}

impl Swapchain {
    pub fn new(ctx: &DeviceContext, size: RenderSize, pref: PresentModePreference) -> Result<Self> {
        let mut swapchain = Self {
            handle: vk::SwapchainKHR::null(),
            format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            render_pass: vk::RenderPass::null(),
            images: SwapchainImages::default(),
            depth_format: unsafe { pick_depth_format(ctx) },
            depth: None,
            built_for: size,
        };
        unsafe { swapchain.build(ctx, size, pref)? };
        Ok(swapchain)
    }

    pub fn needs_rebuild(&self, size: RenderSize) -> bool {
        self.built_for != size
    }

    /// Tears everything down and builds again at `size`. Returns `true` when the render
    /// pass was replaced, in which case pipelines built against it are stale.
    ///
    /// The caller must make sure the device no longer uses any swapchain resource.
    pub fn rebuild(
        &mut self,
        ctx: &DeviceContext,
        size: RenderSize,
        pref: PresentModePreference,
    ) -> Result<bool> {
        unsafe {
            self.destroy_targets(&ctx.device);
            self.build(ctx, size, pref)
        }
    }

    unsafe fn build(
        &mut self,
        ctx: &DeviceContext,
        size: RenderSize,
        pref: PresentModePreference,
    ) -> Result<bool> {
        let surface = &ctx.surface_loader;
        let caps = surface
            .get_physical_device_surface_capabilities(ctx.phys, ctx.surface)
            .vk("get_physical_device_surface_capabilities")?;
        if !caps
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        {
            return Err(
                RenderError::MissingSurfaceUsage(vk::ImageUsageFlags::COLOR_ATTACHMENT).into(),
            );
        }
        let formats = surface
            .get_physical_device_surface_formats(ctx.phys, ctx.surface)
            .vk("get_physical_device_surface_formats")?;
        let modes = surface
            .get_physical_device_surface_present_modes(ctx.phys, ctx.surface)
            .vk("get_physical_device_surface_present_modes")?;

        let format = choose_surface_format(&formats)?;
        let pass_changed =
            self.render_pass == vk::RenderPass::null() || format.format != self.format.format;
        self.format = format;
        self.present_mode = choose_present_mode(&modes, pref);
        self.extent = extent_from_caps(&caps, size);

        if pass_changed {
            if self.render_pass != vk::RenderPass::null() {
                ctx.device.destroy_render_pass(self.render_pass, None);
            }
            self.render_pass =
                create_render_pass(&ctx.device, self.format.format, self.depth_format)?;
        }

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let families = ctx.queues.unique();
        let mut info = vk::SwapchainCreateInfoKHR::default()
            .surface(ctx.surface)
            .min_image_count(image_count(&caps))
            .image_format(self.format.format)
            .image_color_space(self.format.color_space)
            .image_extent(self.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(self.handle);
        info = if ctx.queues.is_shared() {
            info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            info.image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        };

        let handle = ctx
            .swapchain_loader
            .create_swapchain(&info, None)
            .vk("create_swapchain")?;
        if self.handle != vk::SwapchainKHR::null() {
            ctx.swapchain_loader.destroy_swapchain(self.handle, None);
        }
        self.handle = handle;

        self.depth = Some(
            DepthBuffer::new(ctx, self.extent, self.depth_format).context("depth buffer")?,
        );
        self.images = self.attach_targets(ctx)?;
        self.built_for = size;

        info!(
            "vk: swapchain {:?}/{:?}, {:?}, {}x{}, {} images (min {})",
            self.format.format,
            self.format.color_space,
            self.present_mode,
            self.extent.width,
            self.extent.height,
            self.images.len(),
            caps.min_image_count
        );
        Ok(pass_changed)
    }

    unsafe fn attach_targets(&self, ctx: &DeviceContext) -> Result<SwapchainImages> {
        let depth_view = self
            .depth
            .as_ref()
            .map(|d| d.view)
            .context("depth buffer missing")?;
        let images = ctx
            .swapchain_loader
            .get_swapchain_images(self.handle)
            .vk("get_swapchain_images")?;

        SwapchainImages::build(&images, |image| -> Result<_> {
            let view = alloc::create_view(
                &ctx.device,
                image,
                self.format.format,
                vk::ImageAspectFlags::COLOR,
            )?;
            let attachments = [view, depth_view];
            let info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            let framebuffer = ctx
                .device
                .create_framebuffer(&info, None)
                .vk("create_framebuffer")?;
            Ok((view, framebuffer))
        })
    }

    unsafe fn destroy_targets(&mut self, device: &ash::Device) {
        self.images.destroy(device);
        if let Some(depth) = self.depth.take() {
            depth.destroy(device);
        }
    }

    pub unsafe fn destroy(&mut self, ctx: &DeviceContext) {
        self.destroy_targets(&ctx.device);
        ctx.swapchain_loader.destroy_swapchain(self.handle, None);
        ctx.device.destroy_render_pass(self.render_pass, None);
        self.handle = vk::SwapchainKHR::null();
    }
}
