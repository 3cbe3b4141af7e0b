//! Logical Vulkan device implementing [`DeviceDriver`]

use std::mem::ManuallyDrop;
use std::os::raw::c_char;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::extensions::khr::Swapchain;
use ash::{vk, Device};
use slotmap::SlotMap;
use vk_mem::Alloc;

use super::frame::{begin_frame, FrameSync, RenderTarget, VulkanRecorder};
use super::instance::{to_cstrings, VulkanInstance};
use super::pipeline::{create_pipeline, GpuPipeline};
use super::swapchain::{create_swapchain, SwapchainState, SwapchainTarget};
use super::to_vk_format;
use crate::render::capabilities::CapabilityChain;
use crate::render::device::PhysicalDeviceInfo;
use crate::render::error::{RenderError, RenderResult};
use crate::render::hal::{
    AcquireOutcome, AddressMode, Binding, BindingSetHandle, BufferDesc, BufferHandle, BufferUsage, ClearValues,
    CommandRecorder, CullMode, DeviceDriver, FilterMode, ImageDesc, ImageHandle, ImageUsage, MemoryMode,
    PipelineDesc, PipelineHandle, PresentOutcome, SamplerDesc, SamplerHandle, SwapchainInfo, SwapchainRequest,
};

const DESCRIPTOR_POOL_SETS: u32 = 1024;

/// Host address of a persistently mapped allocation
struct MappedPtr(*mut u8);

// The mapping lives as long as the allocation and all access goes through the resource lock
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

struct GpuBuffer {
    buffer: vk::Buffer,
    allocation: vk_mem::Allocation,
    size: u64,
    label: String,
    mapped: Option<MappedPtr>,
}

struct GpuImage {
    image: vk::Image,
    view: vk::ImageView,
    allocation: vk_mem::Allocation,
}

#[derive(Default)]
struct Resources {
    buffers: SlotMap<BufferHandle, GpuBuffer>,
    images: SlotMap<ImageHandle, GpuImage>,
    samplers: SlotMap<SamplerHandle, vk::Sampler>,
    pipelines: SlotMap<PipelineHandle, GpuPipeline>,
    binding_sets: SlotMap<BindingSetHandle, vk::DescriptorSet>,
}

#[derive(Default)]
struct Presentation {
    swapchain: Option<SwapchainState>,
    frames: Vec<FrameSync>,
}

/// One opened GPU
///
/// Creation, destruction and submission run on the owning worker thread.
/// Recording into a frame slot happens on the render thread while the
/// worker is idle for that slot, so the frame command pool is never touched
/// from two threads at once.
pub struct VulkanDevice {
    label: String,
    physical: vk::PhysicalDevice,
    device: Device,
    allocator: ManuallyDrop<vk_mem::Allocator>,
    swapchain_loader: Swapchain,
    queue: vk::Queue,
    queue_lock: Mutex<()>,
    frame_pool: vk::CommandPool,
    upload_pool: Mutex<vk::CommandPool>,
    descriptor_pool: vk::DescriptorPool,
    max_anisotropy: Option<f32>,
    resources: Mutex<Resources>,
    presentation: Mutex<Presentation>,
    // Dropped last: the surface and instance must outlive the device
    instance: Arc<VulkanInstance>,
}

fn create_pool(device: &Device, family: u32) -> RenderResult<vk::CommandPool> {
    let info = vk::CommandPoolCreateInfo::builder()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(family);
    Ok(unsafe { device.create_command_pool(&info, None)? })
}

fn create_descriptor_pool(device: &Device) -> RenderResult<vk::DescriptorPool> {
    let sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: DESCRIPTOR_POOL_SETS,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: DESCRIPTOR_POOL_SETS * 4,
        },
    ];
    let info = vk::DescriptorPoolCreateInfo::builder()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(DESCRIPTOR_POOL_SETS)
        .pool_sizes(&sizes);
    Ok(unsafe { device.create_descriptor_pool(&info, None)? })
}

fn to_vk_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    for (ours, theirs) in [
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

fn color_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl VulkanDevice {
    /// Open a logical device with one graphics+present queue
    pub(crate) fn open(
        instance: Arc<VulkanInstance>,
        physical: vk::PhysicalDevice,
        info: &PhysicalDeviceInfo,
        features: &CapabilityChain,
        device_extensions: &[String],
    ) -> RenderResult<Self> {
        let family = info.graphics_present_queue().ok_or_else(|| RenderError::Device {
            device: info.index,
            reason: "no graphics+present queue family".into(),
        })?;
        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(family)
            .queue_priorities(&priorities)
            .build()];
        let extensions = to_cstrings(device_extensions)?;
        let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();

        let core_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(features.sampler_anisotropy)
            .geometry_shader(features.geometry_shader);
        let mut vulkan13 = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(features.dynamic_rendering)
            .synchronization2(true);
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&core_features)
            .push_next(&mut vulkan13);

        let device = unsafe { instance.instance.create_device(physical, &create_info, None)? };
        let queue = unsafe { device.get_device_queue(family, 0) };

        let allocator = match vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
            &instance.instance,
            &device,
            physical,
        )) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        let pools = (|| -> RenderResult<(vk::CommandPool, vk::CommandPool, vk::DescriptorPool)> {
            let frame_pool = create_pool(&device, family)?;
            let upload_pool = match create_pool(&device, family) {
                Ok(pool) => pool,
                Err(e) => {
                    unsafe { device.destroy_command_pool(frame_pool, None) };
                    return Err(e);
                }
            };
            match create_descriptor_pool(&device) {
                Ok(descriptor_pool) => Ok((frame_pool, upload_pool, descriptor_pool)),
                Err(e) => {
                    unsafe {
                        device.destroy_command_pool(upload_pool, None);
                        device.destroy_command_pool(frame_pool, None);
                    }
                    Err(e)
                }
            }
        })();
        let (frame_pool, upload_pool, descriptor_pool) = match pools {
            Ok(pools) => pools,
            Err(e) => {
                drop(allocator);
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let swapchain_loader = Swapchain::new(&instance.instance, &device);
        let max_anisotropy = features
            .sampler_anisotropy
            .then(|| info.limits.max_sampler_anisotropy.min(16.0));
        log::info!("Opened Vulkan device '{}' (queue family {})", info.name, family);

        Ok(Self {
            label: format!("{} #{}", info.name, info.index),
            physical,
            device,
            allocator: ManuallyDrop::new(allocator),
            swapchain_loader,
            queue,
            queue_lock: Mutex::new(()),
            frame_pool,
            upload_pool: Mutex::new(upload_pool),
            descriptor_pool,
            max_anisotropy,
            resources: Mutex::new(Resources::default()),
            presentation: Mutex::new(Presentation::default()),
            instance,
        })
    }

    pub(crate) fn raw(&self) -> &Device {
        &self.device
    }

    pub(crate) fn unknown(&self, kind: &'static str) -> RenderError {
        RenderError::UnknownHandle {
            kind,
            device: self.label.clone(),
        }
    }

    fn resources(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn presentation(&self) -> MutexGuard<'_, Presentation> {
        self.presentation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn pipeline_info(&self, handle: PipelineHandle) -> Option<(vk::Pipeline, vk::PipelineLayout, CullMode)> {
        self.resources()
            .pipelines
            .get(handle)
            .map(|p| (p.pipeline, p.layout, p.cull_mode))
    }

    pub(crate) fn binding_set(&self, handle: BindingSetHandle) -> Option<vk::DescriptorSet> {
        self.resources().binding_sets.get(handle).copied()
    }

    pub(crate) fn buffer(&self, handle: BufferHandle) -> Option<vk::Buffer> {
        self.resources().buffers.get(handle).map(|b| b.buffer)
    }

    fn allocate_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> RenderResult<(vk::Buffer, vk_mem::Allocation)> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let allocation_info = if host_visible {
            vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                ..Default::default()
            }
        } else {
            vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            }
        };
        Ok(unsafe { self.allocator.create_buffer(&buffer_info, &allocation_info)? })
    }

    /// Record, submit and wait for a one-shot transfer
    fn one_shot<F>(&self, record: F) -> RenderResult<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let pool = self.upload_pool.lock().unwrap_or_else(PoisonError::into_inner);
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&allocate_info)? }
            .into_iter()
            .next()
            .ok_or(RenderError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))?;

        let result = unsafe {
            (|| -> RenderResult<()> {
                let begin_info =
                    vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                self.device.begin_command_buffer(command_buffer, &begin_info)?;
                record(command_buffer);
                self.device.end_command_buffer(command_buffer)?;
                let command_buffers = [command_buffer];
                let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                let _queue = self.queue_lock.lock().unwrap_or_else(PoisonError::into_inner);
                self.device.queue_submit(self.queue, &[submit.build()], vk::Fence::null())?;
                self.device.queue_wait_idle(self.queue)?;
                Ok(())
            })()
        };
        unsafe { self.device.free_command_buffers(*pool, &[command_buffer]) };
        result
    }

    /// Copy `data` into a temporary host-visible buffer and run `record` with it
    fn with_staging<F>(&self, data: &[u8], record: F) -> RenderResult<()>
    where
        F: FnOnce(vk::CommandBuffer, vk::Buffer),
    {
        let (staging, mut allocation) =
            self.allocate_buffer(data.len() as u64, vk::BufferUsageFlags::TRANSFER_SRC, true)?;
        let result = unsafe {
            match self.allocator.map_memory(&mut allocation) {
                Ok(mapped) => {
                    ptr::copy_nonoverlapping(data.as_ptr(), mapped, data.len());
                    self.allocator.unmap_memory(&mut allocation);
                    self.one_shot(|command_buffer| record(command_buffer, staging))
                }
                Err(e) => Err(e.into()),
            }
        };
        unsafe { self.allocator.destroy_buffer(staging, &mut allocation) };
        result
    }

    fn transition(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src: (vk::PipelineStageFlags, vk::AccessFlags),
        dst: (vk::PipelineStageFlags, vk::AccessFlags),
    ) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_range(vk::ImageAspectFlags::COLOR))
            .src_access_mask(src.1)
            .dst_access_mask(dst.1)
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                src.0,
                dst.0,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn upload_image(&self, image: vk::Image, desc: &ImageDesc, pixels: Option<&[u8]>) -> RenderResult<()> {
        let to_transfer = (
            (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
        );
        let to_shader = (
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
            (vk::PipelineStageFlags::FRAGMENT_SHADER, vk::AccessFlags::SHADER_READ),
        );
        match pixels {
            Some(pixels) => self.with_staging(pixels, |command_buffer, staging| {
                self.transition(
                    command_buffer,
                    image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    to_transfer.0,
                    to_transfer.1,
                );
                let region = vk::BufferImageCopy::builder()
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_extent(vk::Extent3D {
                        width: desc.width,
                        height: desc.height,
                        depth: 1,
                    })
                    .build();
                unsafe {
                    self.device.cmd_copy_buffer_to_image(
                        command_buffer,
                        staging,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
                self.transition(
                    command_buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    to_shader.0,
                    to_shader.1,
                );
            }),
            None => self.one_shot(|command_buffer| {
                self.transition(
                    command_buffer,
                    image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
                    to_shader.1,
                );
            }),
        }
    }

    fn swapchain_target(&self) -> SwapchainTarget<'_> {
        SwapchainTarget {
            instance: &self.instance,
            physical: self.physical,
            device: &self.device,
            allocator: &self.allocator,
            loader: &self.swapchain_loader,
        }
    }
}

impl DeviceDriver for VulkanDevice {
    fn label(&self) -> &str {
        &self.label
    }

    fn create_buffer(&self, desc: &BufferDesc, initial_data: Option<&[u8]>) -> RenderResult<BufferHandle> {
        if desc.size == 0 {
            return Err(RenderError::InvalidArgument(format!("buffer '{}' has zero size", desc.label)));
        }
        if let Some(initial) = initial_data {
            if initial.len() as u64 > desc.size {
                return Err(RenderError::InvalidArgument(format!(
                    "initial data for '{}' exceeds buffer size",
                    desc.label
                )));
            }
        }

        let usage = to_vk_usage(desc.usage);
        let entry = match desc.mode {
            MemoryMode::Dynamic => {
                let (buffer, mut allocation) = self.allocate_buffer(desc.size, usage, true)?;
                let mapped = match unsafe { self.allocator.map_memory(&mut allocation) } {
                    Ok(mapped) => mapped,
                    Err(e) => {
                        unsafe { self.allocator.destroy_buffer(buffer, &mut allocation) };
                        return Err(e.into());
                    }
                };
                if let Some(initial) = initial_data {
                    unsafe { ptr::copy_nonoverlapping(initial.as_ptr(), mapped, initial.len()) };
                }
                GpuBuffer {
                    buffer,
                    allocation,
                    size: desc.size,
                    label: desc.label.clone(),
                    mapped: Some(MappedPtr(mapped)),
                }
            }
            MemoryMode::Static => {
                let (buffer, mut allocation) =
                    self.allocate_buffer(desc.size, usage | vk::BufferUsageFlags::TRANSFER_DST, false)?;
                if let Some(initial) = initial_data {
                    let uploaded = self.with_staging(initial, |command_buffer, staging| {
                        let region = vk::BufferCopy {
                            src_offset: 0,
                            dst_offset: 0,
                            size: initial.len() as u64,
                        };
                        unsafe { self.device.cmd_copy_buffer(command_buffer, staging, buffer, &[region]) };
                    });
                    if let Err(e) = uploaded {
                        unsafe { self.allocator.destroy_buffer(buffer, &mut allocation) };
                        return Err(e);
                    }
                }
                GpuBuffer {
                    buffer,
                    allocation,
                    size: desc.size,
                    label: desc.label.clone(),
                    mapped: None,
                }
            }
        };
        Ok(self.resources().buffers.insert(entry))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RenderResult<()> {
        let resources = self.resources();
        let entry = resources.buffers.get(buffer).ok_or_else(|| self.unknown("buffer"))?;
        let mapped = entry
            .mapped
            .as_ref()
            .ok_or_else(|| RenderError::StaticBufferUpdate { id: entry.label.clone() })?;
        let end = offset.checked_add(data.len() as u64).filter(|&end| end <= entry.size);
        if end.is_none() {
            return Err(RenderError::OutOfBounds {
                id: entry.label.clone(),
                offset,
                size: data.len() as u64,
                capacity: entry.size,
            });
        }
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), mapped.0.add(offset as usize), data.len()) };
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: u64) -> RenderResult<Vec<u8>> {
        let resources = self.resources();
        let entry = resources.buffers.get(buffer).ok_or_else(|| self.unknown("buffer"))?;
        let mapped = entry.mapped.as_ref().ok_or_else(|| {
            RenderError::InvalidArgument(format!("buffer '{}' is not host visible", entry.label))
        })?;
        let end = offset.checked_add(len).filter(|&end| end <= entry.size);
        if end.is_none() {
            return Err(RenderError::OutOfBounds {
                id: entry.label.clone(),
                offset,
                size: len,
                capacity: entry.size,
            });
        }
        let mut out = vec![0u8; len as usize];
        unsafe { ptr::copy_nonoverlapping(mapped.0.add(offset as usize), out.as_mut_ptr(), out.len()) };
        Ok(out)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let removed = self.resources().buffers.remove(buffer);
        if let Some(mut entry) = removed {
            unsafe {
                if entry.mapped.take().is_some() {
                    self.allocator.unmap_memory(&mut entry.allocation);
                }
                self.allocator.destroy_buffer(entry.buffer, &mut entry.allocation);
            }
        }
    }

    fn create_image(&self, desc: &ImageDesc, pixels: Option<&[u8]>) -> RenderResult<ImageHandle> {
        if let Some(pixels) = pixels {
            if pixels.len() as u64 != desc.byte_size() {
                return Err(RenderError::InvalidArgument(format!(
                    "image '{}' expects {} bytes, got {}",
                    desc.label,
                    desc.byte_size(),
                    pixels.len()
                )));
            }
        }
        let (usage, aspect) = match desc.usage {
            ImageUsage::Sampled => (
                vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
                vk::ImageAspectFlags::COLOR,
            ),
            ImageUsage::DepthAttachment => (
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                vk::ImageAspectFlags::DEPTH,
            ),
        };
        let format = to_vk_format(desc.format);
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let allocation_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };
        let (image, mut allocation) = unsafe { self.allocator.create_image(&image_info, &allocation_info)? };

        let finish = (|| -> RenderResult<vk::ImageView> {
            if desc.usage == ImageUsage::Sampled {
                self.upload_image(image, desc, pixels)?;
            }
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(color_range(aspect));
            Ok(unsafe { self.device.create_image_view(&view_info, None)? })
        })();
        match finish {
            Ok(view) => Ok(self.resources().images.insert(GpuImage { image, view, allocation })),
            Err(e) => {
                unsafe { self.allocator.destroy_image(image, &mut allocation) };
                Err(e)
            }
        }
    }

    fn destroy_image(&self, image: ImageHandle) {
        let removed = self.resources().images.remove(image);
        if let Some(mut entry) = removed {
            unsafe {
                self.device.destroy_image_view(entry.view, None);
                self.allocator.destroy_image(entry.image, &mut entry.allocation);
            }
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> RenderResult<SamplerHandle> {
        let filter = match desc.filter {
            FilterMode::Nearest => vk::Filter::NEAREST,
            FilterMode::Linear => vk::Filter::LINEAR,
        };
        let address = match desc.address_mode {
            AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        };
        let anisotropy = self.max_anisotropy.filter(|_| desc.anisotropy);
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter)
            .min_filter(filter)
            .address_mode_u(address)
            .address_mode_v(address)
            .address_mode_w(address)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR);
        let sampler = unsafe { self.device.create_sampler(&info, None)? };
        Ok(self.resources().samplers.insert(sampler))
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        if let Some(native) = self.resources().samplers.remove(sampler) {
            unsafe { self.device.destroy_sampler(native, None) };
        }
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> RenderResult<PipelineHandle> {
        let pipeline = create_pipeline(&self.device, desc)?;
        log::debug!("Pipeline '{}' created on {}", desc.label, self.label);
        Ok(self.resources().pipelines.insert(pipeline))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        if let Some(entry) = self.resources().pipelines.remove(pipeline) {
            unsafe { entry.destroy(&self.device) };
        }
    }

    fn create_binding_set(&self, pipeline: PipelineHandle, bindings: &[Binding]) -> RenderResult<BindingSetHandle> {
        let mut resources = self.resources();
        let layout = {
            let entry = resources.pipelines.get(pipeline).ok_or_else(|| self.unknown("pipeline"))?;
            if bindings.len() != 1 + entry.texture_slots as usize {
                return Err(RenderError::InvalidArgument(format!(
                    "pipeline expects {} bindings, got {}",
                    1 + entry.texture_slots,
                    bindings.len()
                )));
            }
            entry.set_layout
        };

        let mut buffer_infos = Vec::with_capacity(bindings.len());
        let mut image_infos = Vec::with_capacity(bindings.len());
        for binding in bindings {
            match *binding {
                Binding::Uniform { buffer, size } => {
                    let native = resources.buffers.get(buffer).ok_or_else(|| self.unknown("buffer"))?;
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: native.buffer,
                        offset: 0,
                        range: size,
                    });
                }
                Binding::Texture { image, sampler } => {
                    let view = resources.images.get(image).ok_or_else(|| self.unknown("image"))?.view;
                    let sampler = *resources.samplers.get(sampler).ok_or_else(|| self.unknown("sampler"))?;
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler,
                        image_view: view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    });
                }
            }
        }

        let set_layouts = [layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        let set = unsafe { self.device.allocate_descriptor_sets(&allocate_info)? }
            .into_iter()
            .next()
            .ok_or(RenderError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY))?;

        let (mut next_buffer, mut next_image) = (0, 0);
        let mut writes = Vec::with_capacity(bindings.len());
        for (index, binding) in bindings.iter().enumerate() {
            let write = vk::WriteDescriptorSet::builder().dst_set(set).dst_binding(index as u32);
            let write = match binding {
                Binding::Uniform { .. } => {
                    next_buffer += 1;
                    write
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(&buffer_infos[next_buffer - 1..next_buffer])
                }
                Binding::Texture { .. } => {
                    next_image += 1;
                    write
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(&image_infos[next_image - 1..next_image])
                }
            };
            writes.push(write.build());
        }
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
        Ok(resources.binding_sets.insert(set))
    }

    fn destroy_binding_set(&self, set: BindingSetHandle) {
        if let Some(native) = self.resources().binding_sets.remove(set) {
            if let Err(e) = unsafe { self.device.free_descriptor_sets(self.descriptor_pool, &[native]) } {
                log::warn!("Failed to free descriptor set on {}: {:?}", self.label, e);
            }
        }
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> RenderResult<SwapchainInfo> {
        let mut presentation = self.presentation();
        let old = presentation.swapchain.take();
        let state = create_swapchain(&self.swapchain_target(), request, old)?;
        let info = state.info();
        presentation.swapchain = Some(state);
        info
    }

    fn destroy_swapchain(&self) {
        let mut presentation = self.presentation();
        if let Some(state) = presentation.swapchain.take() {
            unsafe {
                if let Err(e) = self.device.device_wait_idle() {
                    log::warn!("Wait idle before swapchain destruction failed on {}: {:?}", self.label, e);
                }
                state.destroy(&self.device, &self.allocator, &self.swapchain_loader);
            }
        }
    }

    fn recreate_frame_sync(&self, frames_in_flight: usize) -> RenderResult<()> {
        if frames_in_flight == 0 {
            return Err(RenderError::InvalidArgument("frames in flight must be non-zero".into()));
        }
        let mut presentation = self.presentation();
        unsafe {
            self.device.device_wait_idle()?;
            for frame in presentation.frames.drain(..) {
                frame.destroy(&self.device, self.frame_pool);
            }
        }
        for _ in 0..frames_in_flight {
            let frame = FrameSync::new(&self.device, self.frame_pool)?;
            presentation.frames.push(frame);
        }
        Ok(())
    }

    fn acquire_frame(&self, frame_slot: usize) -> RenderResult<AcquireOutcome> {
        let presentation = self.presentation();
        let frame = presentation
            .frames
            .get(frame_slot)
            .ok_or_else(|| RenderError::InvalidArgument(format!("frame slot {} out of range", frame_slot)))?;
        let swapchain = presentation.swapchain.as_ref().ok_or(RenderError::SwapchainOutOfDate)?;
        unsafe {
            self.device.wait_for_fences(&[frame.in_flight], true, u64::MAX)?;
            match self.swapchain_loader.acquire_next_image(
                swapchain.swapchain,
                u64::MAX,
                frame.image_available,
                vk::Fence::null(),
            ) {
                Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                    image_index,
                    suboptimal,
                }),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
                Err(e) => Err(e.into()),
            }
        }
    }

    fn begin_commands(
        &self,
        frame_slot: usize,
        image_index: u32,
        clear: &ClearValues,
    ) -> RenderResult<Box<dyn CommandRecorder + '_>> {
        let (command_buffer, target) = {
            let presentation = self.presentation();
            let swapchain = presentation.swapchain.as_ref().ok_or(RenderError::SwapchainOutOfDate)?;
            let frame = presentation.frames.get(frame_slot);
            let image = swapchain.images.get(image_index as usize);
            let view = swapchain.views.get(image_index as usize);
            match (frame, image, view) {
                (Some(frame), Some(image), Some(view)) => (
                    frame.command_buffer,
                    RenderTarget {
                        color_image: *image,
                        color_view: *view,
                        depth_image: swapchain.depth_image,
                        depth_view: swapchain.depth_view,
                        extent: swapchain.extent,
                    },
                ),
                _ => {
                    return Err(RenderError::InvalidArgument(format!(
                        "frame slot {} / image {} out of range",
                        frame_slot, image_index
                    )))
                }
            }
        };
        begin_frame(&self.device, command_buffer, &target, clear.color, clear.depth)?;
        Ok(Box::new(VulkanRecorder {
            device: self,
            command_buffer,
            target,
        }))
    }

    fn submit_and_present(&self, frame_slot: usize, image_index: u32) -> RenderResult<PresentOutcome> {
        let presentation = self.presentation();
        let Some(swapchain) = presentation.swapchain.as_ref() else {
            return Ok(PresentOutcome::OutOfDate);
        };
        let frame = presentation
            .frames
            .get(frame_slot)
            .ok_or_else(|| RenderError::InvalidArgument(format!("frame slot {} out of range", frame_slot)))?;
        let render_finished = *swapchain
            .render_finished
            .get(image_index as usize)
            .ok_or_else(|| RenderError::InvalidArgument(format!("image {} out of range", image_index)))?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer];
        let signal_semaphores = [render_finished];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        let swapchains = [swapchain.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let _queue = self.queue_lock.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe {
            self.device.reset_fences(&[frame.in_flight])?;
            self.device.queue_submit(self.queue, &[submit.build()], frame.in_flight)?;
            match self.swapchain_loader.queue_present(self.queue, &present_info) {
                Ok(false) => Ok(PresentOutcome::Presented),
                Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => Ok(PresentOutcome::Suboptimal),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
                Err(e) => Err(e.into()),
            }
        }
    }

    fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("Wait idle on drop failed for {}: {:?}", self.label, e);
            }

            let presentation = self.presentation.get_mut().unwrap_or_else(PoisonError::into_inner);
            for frame in presentation.frames.drain(..) {
                frame.destroy(&self.device, self.frame_pool);
            }
            if let Some(state) = presentation.swapchain.take() {
                state.destroy(&self.device, &self.allocator, &self.swapchain_loader);
            }

            let resources = self.resources.get_mut().unwrap_or_else(PoisonError::into_inner);
            let leftovers = resources.buffers.len() + resources.images.len() + resources.pipelines.len();
            if leftovers > 0 {
                log::debug!("Releasing {} leftover resources on {}", leftovers, self.label);
            }
            resources.binding_sets.clear();
            for (_, pipeline) in resources.pipelines.drain() {
                pipeline.destroy(&self.device);
            }
            for (_, sampler) in resources.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, mut image) in resources.images.drain() {
                self.device.destroy_image_view(image.view, None);
                self.allocator.destroy_image(image.image, &mut image.allocation);
            }
            for (_, mut buffer) in resources.buffers.drain() {
                if buffer.mapped.take().is_some() {
                    self.allocator.unmap_memory(&mut buffer.allocation);
                }
                self.allocator.destroy_buffer(buffer.buffer, &mut buffer.allocation);
            }

            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            let upload_pool = *self.upload_pool.get_mut().unwrap_or_else(PoisonError::into_inner);
            self.device.destroy_command_pool(upload_pool, None);
            self.device.destroy_command_pool(self.frame_pool, None);
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}
