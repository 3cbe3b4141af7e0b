//! Graphics pipeline construction for dynamic rendering

use std::ffi::CString;

use ash::{vk, Device};

use super::to_vk_format;
use crate::render::error::{RenderError, RenderResult};
use crate::render::hal::{CullMode, PipelineDesc};
use crate::scene::Vertex;

/// Camera view-projection push constant size
pub const PUSH_CONSTANT_SIZE: u32 = 64;

/// Native objects backing one pipeline handle
pub(crate) struct GpuPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
    pub cull_mode: CullMode,
    pub texture_slots: u32,
}

impl GpuPipeline {
    pub(crate) unsafe fn destroy(&self, device: &Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
        device.destroy_descriptor_set_layout(self.set_layout, None);
    }
}

pub(crate) fn to_vk_cull(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Back => vk::CullModeFlags::BACK,
        CullMode::Front => vk::CullModeFlags::FRONT,
    }
}

/// Binding 0 uniform block, then one combined sampler per texture slot
fn create_set_layout(device: &Device, texture_slots: u32) -> RenderResult<vk::DescriptorSetLayout> {
    let mut bindings = vec![vk::DescriptorSetLayoutBinding::builder()
        .binding(0)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
        .build()];
    for slot in 0..texture_slots {
        bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(slot + 1)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .build(),
        );
    }
    let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
    Ok(unsafe { device.create_descriptor_set_layout(&info, None)? })
}

fn create_module(device: &Device, words: &[u32]) -> RenderResult<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::builder().code(words);
    Ok(unsafe { device.create_shader_module(&info, None)? })
}

pub(crate) fn create_pipeline(device: &Device, desc: &PipelineDesc) -> RenderResult<GpuPipeline> {
    if desc.vertex_spirv.is_empty() || desc.fragment_spirv.is_empty() {
        return Err(RenderError::InvalidArgument(format!("pipeline '{}' has an empty stage", desc.label)));
    }
    let vertex_entry = CString::new(desc.vertex_entry.as_str())
        .map_err(|_| RenderError::InvalidArgument("vertex entry point contains NUL".into()))?;
    let fragment_entry = CString::new(desc.fragment_entry.as_str())
        .map_err(|_| RenderError::InvalidArgument("fragment entry point contains NUL".into()))?;

    let set_layout = create_set_layout(device, desc.texture_slots)?;
    let push_constant_ranges = [vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX,
        offset: 0,
        size: PUSH_CONSTANT_SIZE,
    }];
    let set_layouts = [set_layout];
    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_constant_ranges);
    let layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
        Ok(layout) => layout,
        Err(e) => {
            unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
            return Err(e.into());
        }
    };

    let result = build(device, desc, layout, &vertex_entry, &fragment_entry);
    match result {
        Ok(pipeline) => Ok(GpuPipeline {
            pipeline,
            layout,
            set_layout,
            cull_mode: desc.cull_mode,
            texture_slots: desc.texture_slots,
        }),
        Err(e) => {
            unsafe {
                device.destroy_pipeline_layout(layout, None);
                device.destroy_descriptor_set_layout(set_layout, None);
            }
            Err(e)
        }
    }
}

fn build(
    device: &Device,
    desc: &PipelineDesc,
    layout: vk::PipelineLayout,
    vertex_entry: &CString,
    fragment_entry: &CString,
) -> RenderResult<vk::Pipeline> {
    let vertex_module = create_module(device, &desc.vertex_spirv)?;
    let fragment_module = match create_module(device, &desc.fragment_spirv) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.destroy_shader_module(vertex_module, None) };
            return Err(e);
        }
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(vertex_entry)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment_module)
            .name(fragment_entry)
            .build(),
    ];

    let vertex_bindings = [vk::VertexInputBindingDescription {
        binding: 0,
        stride: Vertex::STRIDE,
        input_rate: vk::VertexInputRate::VERTEX,
    }];
    let vertex_attributes = [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: 0,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: Vertex::NORMAL_OFFSET,
        },
        vk::VertexInputAttributeDescription {
            location: 2,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: Vertex::UV_OFFSET,
        },
    ];
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&vertex_bindings)
        .vertex_attribute_descriptions(&vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Viewport, scissor and cull mode are set while recording
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [
        vk::DynamicState::VIEWPORT,
        vk::DynamicState::SCISSOR,
        vk::DynamicState::CULL_MODE,
    ];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(to_vk_cull(desc.cull_mode))
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_enabled = desc.depth_format.is_some();
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(depth_enabled)
        .depth_write_enable(depth_enabled)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build()];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let color_formats = [to_vk_format(desc.color_format)];
    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(desc.depth_format.map_or(vk::Format::UNDEFINED, to_vk_format));

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .push_next(&mut rendering_info)
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout);

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
    };
    unsafe {
        device.destroy_shader_module(vertex_module, None);
        device.destroy_shader_module(fragment_module, None);
    }
    let pipelines = pipelines.map_err(|(_, err)| RenderError::Api(err))?;
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| RenderError::Api(vk::Result::ERROR_INITIALIZATION_FAILED))
}
