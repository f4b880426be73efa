// SPDX-License-Identifier: CEPL-1.0
use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use ash::util::read_spv;
use ash::vk;
use sprite_render::{ShaderBytecode, Vertex};

use crate::device::DeviceContext;
use crate::error::VkCall;

pub const UNIFORM_BINDING: u32 = 0;
pub const TEXTURE_BINDING: u32 = 1;

pub fn vertex_binding() -> vk::VertexInputBindingDescription {
    vk::VertexInputBindingDescription {
        binding: 0,
        stride: Vertex::STRIDE,
        input_rate: vk::VertexInputRate::VERTEX,
    }
}

/// Locations 0, 1, 2 = position, color, uv.
pub fn vertex_attributes() -> [vk::VertexInputAttributeDescription; 3] {
    [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: Vertex::POSITION_OFFSET,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32A32_SFLOAT,
            offset: Vertex::COLOR_OFFSET,
        },
        vk::VertexInputAttributeDescription {
            location: 2,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: Vertex::UV_OFFSET,
        },
    ]
}

unsafe fn shader_module(device: &ash::Device, bytes: &[u8], stage: &str) -> Result<vk::ShaderModule> {
    if bytes.is_empty() {
        return Err(anyhow!("{stage} shader bytecode is empty"));
    }
    let code = read_spv(&mut Cursor::new(bytes)).with_context(|| format!("{stage} shader is not SPIR-V"))?;
    let info = vk::ShaderModuleCreateInfo::default().code(&code);
    Ok(device
        .create_shader_module(&info, None)
        .vk("create_shader_module")?)
}

/// Set 0: the projection uniform for the vertex stage and one combined image sampler
/// for the fragment stage. Pushed into the command buffer, never allocated from a pool.
unsafe fn create_set_layout(device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
    let bindings = [
        vk::DescriptorSetLayoutBinding::default()
            .binding(UNIFORM_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX),
        vk::DescriptorSetLayoutBinding::default()
            .binding(TEXTURE_BINDING)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT),
    ];
    let info = vk::DescriptorSetLayoutCreateInfo::default()
        .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
        .bindings(&bindings);
    Ok(device
        .create_descriptor_set_layout(&info, None)
        .vk("create_descriptor_set_layout")?)
}

unsafe fn create_sampler(ctx: &DeviceContext) -> Result<vk::Sampler> {
    let anisotropy = ctx.max_anisotropy > 0.0;
    let info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(anisotropy)
        .max_anisotropy(if anisotropy { ctx.max_anisotropy } else { 1.0 })
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .compare_op(vk::CompareOp::ALWAYS);
    Ok(ctx.device.create_sampler(&info, None).vk("create_sampler")?)
}

/// The one graphics pipeline, its layout and the shared texture sampler.
pub struct SpritePipeline {
    pub set_layout: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub sampler: vk::Sampler,
    shaders: ShaderBytecode,
}

impl SpritePipeline {
    pub fn new(
        ctx: &DeviceContext,
        shaders: ShaderBytecode,
        render_pass: vk::RenderPass,
    ) -> Result<Self> {
        unsafe {
            let set_layout = create_set_layout(&ctx.device)?;
            let set_layouts = [set_layout];
            let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
            let layout = ctx
                .device
                .create_pipeline_layout(&layout_info, None)
                .vk("create_pipeline_layout")?;
            let sampler = create_sampler(ctx)?;

            let mut pipeline = Self {
                set_layout,
                layout,
                pipeline: vk::Pipeline::null(),
                sampler,
                shaders,
            };
            pipeline.pipeline = pipeline.create_pipeline(&ctx.device, render_pass)?;
            Ok(pipeline)
        }
    }

    /// Replaces the pipeline after the render pass changed. Layouts and sampler are kept.
    pub fn rebuild(&mut self, device: &ash::Device, render_pass: vk::RenderPass) -> Result<()> {
        unsafe {
            let pipeline = self.create_pipeline(device, render_pass)?;
            device.destroy_pipeline(self.pipeline, None);
            self.pipeline = pipeline;
        }
        Ok(())
    }

    unsafe fn create_pipeline(
        &self,
        device: &ash::Device,
        render_pass: vk::RenderPass,
    ) -> Result<vk::Pipeline> {
        let vs = shader_module(device, &self.shaders.vertex, "vertex")?;
        let fs = match shader_module(device, &self.shaders.fragment, "fragment") {
            Ok(fs) => fs,
            Err(e) => {
                device.destroy_shader_module(vs, None);
                return Err(e);
            }
        };

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vs)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fs)
                .name(c"main"),
        ];

        let bindings = [vertex_binding()];
        let attributes = vertex_attributes();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        // viewport and scissor follow the swapchain extent
        let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dyn_states);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let raster = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

        let blend = [vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(self.layout)
            .render_pass(render_pass)
            .subpass(0);

        let created =
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None);
        device.destroy_shader_module(vs, None);
        device.destroy_shader_module(fs, None);

        match created {
            Ok(pipelines) => pipelines
                .into_iter()
                .next()
                .context("create_graphics_pipelines returned nothing"),
            Err((_, result)) => Err(anyhow!("create_graphics_pipelines failed: {result}")),
        }
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
        device.destroy_descriptor_set_layout(self.set_layout, None);
        device.destroy_sampler(self.sampler, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format_size(format: vk::Format) -> u32 {
        match format {
            vk::Format::R32G32_SFLOAT => 8,
            vk::Format::R32G32B32A32_SFLOAT => 16,
            other => panic!("unexpected attribute format {other:?}"),
        }
    }

    #[test]
    fn attributes_tile_the_vertex_without_gaps() {
        let mut attributes = vertex_attributes().to_vec();
        attributes.sort_by_key(|a| a.offset);

        let mut end = 0;
        for a in &attributes {
            assert_eq!(a.offset, end, "location {}", a.location);
            end += format_size(a.format);
        }
        assert_eq!(end, vertex_binding().stride);
    }

    #[test]
    fn locations_are_position_color_uv() {
        let a = vertex_attributes();
        assert_eq!(
            a.map(|x| (x.location, x.offset)),
            [
                (0, Vertex::POSITION_OFFSET),
                (1, Vertex::COLOR_OFFSET),
                (2, Vertex::UV_OFFSET)
            ]
        );
    }
}
