//! Swapchain, per-image views and the shared depth attachment

use ash::extensions::khr::Swapchain;
use ash::{vk, Device};
use vk_mem::Alloc;

use super::instance::VulkanInstance;
use super::{from_vk_format, to_vk_format};
use crate::render::error::{RenderError, RenderResult};
use crate::render::hal::{Extent2D, ImageFormat, SwapchainInfo, SwapchainRequest};

/// Depth format used by every swapchain
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Swapchain and everything sized by it
pub(crate) struct SwapchainState {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    /// Signalled by rendering, waited on by presentation; one per image
    pub render_finished: Vec<vk::Semaphore>,
    pub depth_image: vk::Image,
    pub depth_view: vk::ImageView,
    pub depth_allocation: vk_mem::Allocation,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

impl SwapchainState {
    pub(crate) fn info(&self) -> RenderResult<SwapchainInfo> {
        Ok(SwapchainInfo {
            extent: Extent2D::new(self.extent.width, self.extent.height),
            format: from_vk_format(self.format)?,
            image_count: self.images.len() as u32,
        })
    }

    /// Destroy everything except the swapchain handle itself
    unsafe fn destroy_attachments(&mut self, device: &Device, allocator: &vk_mem::Allocator) {
        for semaphore in self.render_finished.drain(..) {
            device.destroy_semaphore(semaphore, None);
        }
        for view in self.views.drain(..) {
            device.destroy_image_view(view, None);
        }
        device.destroy_image_view(self.depth_view, None);
        allocator.destroy_image(self.depth_image, &mut self.depth_allocation);
    }

    pub(crate) unsafe fn destroy(mut self, device: &Device, allocator: &vk_mem::Allocator, loader: &Swapchain) {
        self.destroy_attachments(device, allocator);
        loader.destroy_swapchain(self.swapchain, None);
    }
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR], forced: Option<ImageFormat>) -> RenderResult<vk::SurfaceFormatKHR> {
    let wanted = forced.map_or(vk::Format::B8G8R8A8_SRGB, to_vk_format);
    if let Some(format) = formats.iter().find(|f| f.format == wanted) {
        return Ok(*format);
    }
    if forced.is_some() {
        return Err(RenderError::InvalidArgument(format!("surface does not offer format {:?}", wanted)));
    }
    formats
        .iter()
        .find(|f| from_vk_format(f.format).is_ok())
        .copied()
        .ok_or_else(|| RenderError::InvalidArgument("surface offers no usable color format".into()))
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync && modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, requested: Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: requested
            .width
            .clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
        height: requested
            .height
            .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
    }
}

fn create_view(device: &Device, image: vk::Image, format: vk::Format, aspect: vk::ImageAspectFlags) -> RenderResult<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    Ok(unsafe { device.create_image_view(&info, None)? })
}

pub(crate) struct SwapchainTarget<'a> {
    pub instance: &'a VulkanInstance,
    pub physical: vk::PhysicalDevice,
    pub device: &'a Device,
    pub allocator: &'a vk_mem::Allocator,
    pub loader: &'a Swapchain,
}

/// Create a swapchain, retiring `old` if present
///
/// The old swapchain and its attachments are destroyed once the new one exists;
/// callers wait for the device to go idle first.
pub(crate) fn create_swapchain(
    target: &SwapchainTarget<'_>,
    request: &SwapchainRequest,
    old: Option<SwapchainState>,
) -> RenderResult<SwapchainState> {
    if request.extent.is_empty() {
        return Err(RenderError::InvalidArgument("swapchain extent is empty".into()));
    }
    let surface_loader = &target.instance.surface_loader;
    let surface = target.instance.surface;
    let (capabilities, formats, modes) = unsafe {
        (
            surface_loader.get_physical_device_surface_capabilities(target.physical, surface)?,
            surface_loader.get_physical_device_surface_formats(target.physical, surface)?,
            surface_loader.get_physical_device_surface_present_modes(target.physical, surface)?,
        )
    };
    let surface_format = choose_surface_format(&formats, request.format)?;
    let present_mode = choose_present_mode(&modes, request.vsync);
    let extent = choose_extent(&capabilities, request.extent);
    let mut image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        image_count = image_count.min(capabilities.max_image_count);
    }

    let old_handle = old.as_ref().map_or(vk::SwapchainKHR::null(), |s| s.swapchain);
    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old_handle);

    let created = unsafe { target.loader.create_swapchain(&create_info, None) };
    if let Some(old) = old {
        unsafe { old.destroy(target.device, target.allocator, target.loader) };
    }
    let swapchain = created?;

    match build_attachments(target, swapchain, surface_format.format, extent) {
        Ok(state) => {
            log::debug!(
                "Swapchain {}x{} {:?} {:?} with {} images",
                extent.width,
                extent.height,
                surface_format.format,
                present_mode,
                state.images.len()
            );
            Ok(state)
        }
        Err(e) => {
            unsafe { target.loader.destroy_swapchain(swapchain, None) };
            Err(e)
        }
    }
}

fn build_attachments(
    target: &SwapchainTarget<'_>,
    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
) -> RenderResult<SwapchainState> {
    let device = target.device;
    let images = unsafe { target.loader.get_swapchain_images(swapchain)? };

    let depth_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(DEPTH_FORMAT)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let allocation_info = vk_mem::AllocationCreateInfo {
        usage: vk_mem::MemoryUsage::AutoPreferDevice,
        ..Default::default()
    };
    let (depth_image, depth_allocation) = unsafe { target.allocator.create_image(&depth_info, &allocation_info)? };

    let mut state = SwapchainState {
        swapchain,
        images,
        views: Vec::new(),
        render_finished: Vec::new(),
        depth_image,
        depth_view: vk::ImageView::null(),
        depth_allocation,
        extent,
        format,
    };

    let result = (|| -> RenderResult<()> {
        state.depth_view = create_view(device, depth_image, DEPTH_FORMAT, vk::ImageAspectFlags::DEPTH)?;
        for image in &state.images {
            let view = create_view(device, *image, format, vk::ImageAspectFlags::COLOR)?;
            state.views.push(view);
            let semaphore = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };
            state.render_finished.push(semaphore);
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(state),
        Err(e) => {
            unsafe { state.destroy_attachments(device, target.allocator) };
            Err(e)
        }
    }
}
