//! Per-slot frame synchronization and command recording

use ash::{vk, Device};

use super::driver::VulkanDevice;
use super::pipeline::to_vk_cull;
use crate::render::error::{RenderError, RenderResult};
use crate::render::hal::{BindingSetHandle, BufferHandle, CommandRecorder, CullMode, PipelineHandle};

/// Objects owned by one frame in flight
pub(crate) struct FrameSync {
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSync {
    pub(crate) fn new(device: &Device, pool: vk::CommandPool) -> RenderResult<Self> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.allocate_command_buffers(&allocate_info)? }
            .into_iter()
            .next()
            .ok_or(RenderError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))?;

        let image_available = match unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) } {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { device.free_command_buffers(pool, &[command_buffer]) };
                return Err(e.into());
            }
        };
        // Signalled so the first wait on a fresh slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let in_flight = match unsafe { device.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe {
                    device.destroy_semaphore(image_available, None);
                    device.free_command_buffers(pool, &[command_buffer]);
                }
                return Err(e.into());
            }
        };
        Ok(Self {
            command_buffer,
            image_available,
            in_flight,
        })
    }

    pub(crate) unsafe fn destroy(&self, device: &Device, pool: vk::CommandPool) {
        device.destroy_fence(self.in_flight, None);
        device.destroy_semaphore(self.image_available, None);
        device.free_command_buffers(pool, &[self.command_buffer]);
    }
}

/// Native handles of the image being rendered
#[derive(Clone, Copy)]
pub(crate) struct RenderTarget {
    pub color_image: vk::Image,
    pub color_view: vk::ImageView,
    pub depth_image: vk::Image,
    pub depth_view: vk::ImageView,
    pub extent: vk::Extent2D,
}

fn layout_barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src: (vk::PipelineStageFlags2, vk::AccessFlags2),
    dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
) -> vk::ImageMemoryBarrier2 {
    vk::ImageMemoryBarrier2::builder()
        .src_stage_mask(src.0)
        .src_access_mask(src.1)
        .dst_stage_mask(dst.0)
        .dst_access_mask(dst.1)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build()
}

/// Begin `command_buffer`, transition the attachments and open a dynamic rendering pass
pub(crate) fn begin_frame(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    target: &RenderTarget,
    clear_color: [f32; 4],
    clear_depth: f32,
) -> RenderResult<()> {
    unsafe {
        device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device.begin_command_buffer(command_buffer, &begin_info)?;

        let barriers = [
            layout_barrier(
                target.color_image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                (vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT, vk::AccessFlags2::NONE),
                (
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                ),
            ),
            layout_barrier(
                target.depth_image,
                vk::ImageAspectFlags::DEPTH,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                (vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS, vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE),
                (
                    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                ),
            ),
        ];
        let dependency = vk::DependencyInfo::builder().image_memory_barriers(&barriers);
        device.cmd_pipeline_barrier2(command_buffer, &dependency);

        let color_attachments = [vk::RenderingAttachmentInfo::builder()
            .image_view(target.color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue { float32: clear_color },
            })
            .build()];
        let depth_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(target.depth_view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: clear_depth,
                    stencil: 0,
                },
            });
        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        };
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(area)
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);
        device.cmd_begin_rendering(command_buffer, &rendering_info);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: target.extent.width as f32,
            height: target.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        device.cmd_set_viewport(command_buffer, 0, &[viewport]);
        device.cmd_set_scissor(command_buffer, 0, &[area]);
        device.cmd_set_cull_mode(command_buffer, vk::CullModeFlags::NONE);
    }
    Ok(())
}

/// Records into one frame slot's command buffer
pub(crate) struct VulkanRecorder<'a> {
    pub device: &'a VulkanDevice,
    pub command_buffer: vk::CommandBuffer,
    pub target: RenderTarget,
}

impl VulkanRecorder<'_> {
    fn pipeline(&self, handle: PipelineHandle) -> RenderResult<(vk::Pipeline, vk::PipelineLayout, CullMode)> {
        self.device
            .pipeline_info(handle)
            .ok_or_else(|| self.device.unknown("pipeline"))
    }
}

impl CommandRecorder for VulkanRecorder<'_> {
    fn bind_pipeline(&mut self, pipeline: PipelineHandle) -> RenderResult<()> {
        let (native, _, cull) = self.pipeline(pipeline)?;
        let device = self.device.raw();
        unsafe {
            device.cmd_bind_pipeline(self.command_buffer, vk::PipelineBindPoint::GRAPHICS, native);
            device.cmd_set_cull_mode(self.command_buffer, to_vk_cull(cull));
        }
        Ok(())
    }

    fn push_constants(&mut self, pipeline: PipelineHandle, data: &[u8]) -> RenderResult<()> {
        let (_, layout, _) = self.pipeline(pipeline)?;
        unsafe {
            self.device
                .raw()
                .cmd_push_constants(self.command_buffer, layout, vk::ShaderStageFlags::VERTEX, 0, data);
        }
        Ok(())
    }

    fn bind_binding_set(&mut self, pipeline: PipelineHandle, set: BindingSetHandle) -> RenderResult<()> {
        let (_, layout, _) = self.pipeline(pipeline)?;
        let native = self
            .device
            .binding_set(set)
            .ok_or_else(|| self.device.unknown("binding set"))?;
        unsafe {
            self.device.raw().cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[native],
                &[],
            );
        }
        Ok(())
    }

    fn bind_vertex_buffer(&mut self, buffer: BufferHandle) -> RenderResult<()> {
        let native = self.device.buffer(buffer).ok_or_else(|| self.device.unknown("buffer"))?;
        unsafe {
            self.device
                .raw()
                .cmd_bind_vertex_buffers(self.command_buffer, 0, &[native], &[0]);
        }
        Ok(())
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle) -> RenderResult<()> {
        let native = self.device.buffer(buffer).ok_or_else(|| self.device.unknown("buffer"))?;
        unsafe {
            self.device
                .raw()
                .cmd_bind_index_buffer(self.command_buffer, native, 0, vk::IndexType::UINT32);
        }
        Ok(())
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32) {
        unsafe {
            self.device
                .raw()
                .cmd_draw_indexed(self.command_buffer, index_count, 1, first_index, 0, 0);
        }
    }

    fn finish(self: Box<Self>) -> RenderResult<()> {
        let device = self.device.raw();
        unsafe {
            device.cmd_end_rendering(self.command_buffer);
            let barriers = [layout_barrier(
                self.target.color_image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                (
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                ),
                (vk::PipelineStageFlags2::BOTTOM_OF_PIPE, vk::AccessFlags2::NONE),
            )];
            let dependency = vk::DependencyInfo::builder().image_memory_barriers(&barriers);
            device.cmd_pipeline_barrier2(self.command_buffer, &dependency);
            device.end_command_buffer(self.command_buffer)?;
        }
        Ok(())
    }
}
