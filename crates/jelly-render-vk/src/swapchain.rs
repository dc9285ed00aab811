// SPDX-License-Identifier: CEPL-1.0
//! Surface negotiation and swapchain generations.

use ash::khr::{surface, swapchain};
use ash::vk;
use tracing::{debug, info};

use crate::device::QueueFamilies;
use crate::error::{init_vk, InitError};
use crate::sync::FrameSyncSet;

/// Format preference, highest priority first.
pub const PREFERRED_FORMATS: [vk::Format; 4] = [
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::B8G8R8_UNORM,
    vk::Format::R8G8B8_UNORM,
];

pub const PREFERRED_COLOR_SPACE: vk::ColorSpaceKHR = vk::ColorSpaceKHR::SRGB_NONLINEAR;

/// Inputs to [`SurfaceNegotiation::negotiate`] that do not come from the driver.
#[derive(Clone, Debug)]
pub struct SwapchainPreferences {
    pub formats: Vec<vk::Format>,
    pub color_space: vk::ColorSpaceKHR,
    pub present_modes: Vec<vk::PresentModeKHR>,
    /// Used only when the surface leaves the extent to the swapchain.
    pub extent: vk::Extent2D,
}

impl Default for SwapchainPreferences {
    fn default() -> Self {
        Self {
            formats: PREFERRED_FORMATS.to_vec(),
            color_space: PREFERRED_COLOR_SPACE,
            present_modes: vec![vk::PresentModeKHR::FIFO],
            extent: vk::Extent2D {
                width: 0,
                height: 0,
            },
        }
    }
}

/// `u32::MAX` in `current_extent` means the surface size follows the
/// swapchain.
pub fn select_surface_extent(
    requested: vk::Extent2D,
    caps: &vk::SurfaceCapabilitiesKHR,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    let min = caps.min_image_extent;
    let max = caps.max_image_extent;
    vk::Extent2D {
        width: requested.width.clamp(min.width, max.width),
        height: requested.height.clamp(min.height, max.height),
    }
}

/// First-match over `requested`, not best-match over the device list.
/// Returns `None` only when the device reports nothing.
pub fn select_surface_format(
    available: &[vk::SurfaceFormatKHR],
    requested: &[vk::Format],
    color_space: vk::ColorSpaceKHR,
) -> Option<vk::SurfaceFormatKHR> {
    let first = *available.first()?;

    if available.len() == 1 {
        if first.format == vk::Format::UNDEFINED {
            // Surface takes any format.
            return Some(vk::SurfaceFormatKHR {
                format: requested.first().copied().unwrap_or(PREFERRED_FORMATS[0]),
                color_space,
            });
        }
        return Some(first);
    }

    requested
        .iter()
        .find_map(|&want| {
            available
                .iter()
                .copied()
                .find(|f| f.format == want && f.color_space == color_space)
        })
        .or(Some(first))
}

/// FIFO is guaranteed by the platform, so it is the fallback.
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    requested: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    requested
        .iter()
        .copied()
        .find(|m| available.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn image_count_for_present_mode(mode: vk::PresentModeKHR) -> u32 {
    match mode {
        vk::PresentModeKHR::IMMEDIATE => 1,
        vk::PresentModeKHR::FIFO | vk::PresentModeKHR::FIFO_RELAXED => 2,
        vk::PresentModeKHR::MAILBOX => 3,
        _ => 1,
    }
}

/// `max_image_count == 0` means no upper bound.
pub fn clamp_image_count(desired: u32, caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = desired.max(caps.min_image_count);
    if caps.max_image_count != 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// Exclusive when one family does both jobs, otherwise concurrent across the
/// pair. The returned indices are empty for exclusive mode.
pub fn sharing_mode(families: &QueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, families.unique())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SurfaceNegotiation {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub min_image_count: u32,
}

impl SurfaceNegotiation {
    pub fn negotiate(
        caps: &vk::SurfaceCapabilitiesKHR,
        formats: &[vk::SurfaceFormatKHR],
        present_modes: &[vk::PresentModeKHR],
        prefs: &SwapchainPreferences,
    ) -> Result<Self, InitError> {
        let surface_format = select_surface_format(formats, &prefs.formats, prefs.color_space)
            .ok_or(InitError::NoSurfaceFormats)?;
        let present_mode = select_present_mode(present_modes, &prefs.present_modes);
        let extent = select_surface_extent(prefs.extent, caps);
        if extent.width == 0 || extent.height == 0 {
            return Err(InitError::ZeroExtent);
        }
        Ok(Self {
            extent,
            format: surface_format.format,
            color_space: surface_format.color_space,
            present_mode,
            min_image_count: clamp_image_count(image_count_for_present_mode(present_mode), caps),
        })
    }
}

/// One swapchain generation: the swapchain plus everything sized by its image
/// count. Index `i` names the same image in every per-image vector.
#[derive(Debug)]
pub struct Swapchain {
    handle: vk::SwapchainKHR,
    negotiation: SurfaceNegotiation,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    sync: FrameSyncSet,
    cmd_pools: Vec<vk::CommandPool>,
}

impl Swapchain {
    /// Build a complete generation. `old` is retired by the driver and must
    /// still be destroyed by the caller.
    ///
    /// # Safety
    /// All handles must belong to the same live instance/device.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn new(
        device: &ash::Device,
        loader: &swapchain::Device,
        surface_loader: &surface::Instance,
        phys: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        families: &QueueFamilies,
        prefs: &SwapchainPreferences,
        old: vk::SwapchainKHR,
    ) -> Result<Self, InitError> {
        let caps = unsafe { surface_loader.get_physical_device_surface_capabilities(phys, surface) }
            .map_err(init_vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;
        let formats = unsafe { surface_loader.get_physical_device_surface_formats(phys, surface) }
            .map_err(init_vk("vkGetPhysicalDeviceSurfaceFormatsKHR"))?;
        let modes =
            unsafe { surface_loader.get_physical_device_surface_present_modes(phys, surface) }
                .map_err(init_vk("vkGetPhysicalDeviceSurfacePresentModesKHR"))?;

        let negotiation = SurfaceNegotiation::negotiate(&caps, &formats, &modes, prefs)?;
        debug!("surface negotiation: {negotiation:?}");

        let mut sc = Swapchain {
            handle: vk::SwapchainKHR::null(),
            negotiation,
            images: Vec::new(),
            views: Vec::new(),
            sync: FrameSyncSet::default(),
            cmd_pools: Vec::new(),
        };
        if let Err(e) = unsafe { sc.populate(device, loader, surface, &caps, families, old) } {
            unsafe { sc.destroy(device, loader) };
            return Err(e);
        }

        info!(
            "swapchain ready ({}x{}, {:?}/{:?}, {:?}, {} images)",
            negotiation.extent.width,
            negotiation.extent.height,
            negotiation.format,
            negotiation.color_space,
            negotiation.present_mode,
            sc.images.len()
        );
        Ok(sc)
    }

    // STRICT ORDER: swapchain → images → views → sync → pools. `destroy`
    // copes with any prefix of this having happened.
    unsafe fn populate(
        &mut self,
        device: &ash::Device,
        loader: &swapchain::Device,
        surface: vk::SurfaceKHR,
        caps: &vk::SurfaceCapabilitiesKHR,
        families: &QueueFamilies,
        old: vk::SwapchainKHR,
    ) -> Result<(), InitError> {
        let n = self.negotiation;
        let (sharing, family_indices) = sharing_mode(families);

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(n.min_image_count)
            .image_format(n.format)
            .image_color_space(n.color_space)
            .image_extent(n.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing)
            .queue_family_indices(&family_indices)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(n.present_mode)
            .clipped(true)
            .old_swapchain(old);

        self.handle = unsafe { loader.create_swapchain(&info, None) }
            .map_err(init_vk("vkCreateSwapchainKHR"))?;
        self.images = unsafe { loader.get_swapchain_images(self.handle) }
            .map_err(init_vk("vkGetSwapchainImagesKHR"))?;
        if self.images.is_empty() {
            return Err(InitError::NoSwapchainImages);
        }

        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(n.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { device.create_image_view(&view_info, None) }
                .map_err(init_vk("vkCreateImageView"))?;
            self.views.push(view);
        }

        self.sync = unsafe { FrameSyncSet::new(device, self.images.len()) }?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(families.graphics);
        for _ in 0..self.images.len() {
            let pool = unsafe { device.create_command_pool(&pool_info, None) }
                .map_err(init_vk("vkCreateCommandPool"))?;
            self.cmd_pools.push(pool);
        }
        Ok(())
    }

    /// Tear the generation down in reverse creation order. Command buffers go
    /// with their pools.
    ///
    /// # Safety
    /// The GPU must be done with every object of this generation.
    pub unsafe fn destroy(&mut self, device: &ash::Device, loader: &swapchain::Device) {
        unsafe {
            for pool in self.cmd_pools.drain(..) {
                device.destroy_command_pool(pool, None);
            }
            self.sync.destroy(device);
            for view in self.views.drain(..) {
                device.destroy_image_view(view, None);
            }
            if self.handle != vk::SwapchainKHR::null() {
                loader.destroy_swapchain(self.handle, None);
                self.handle = vk::SwapchainKHR::null();
            }
        }
        self.images.clear();
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn negotiation(&self) -> &SurfaceNegotiation {
        &self.negotiation
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.negotiation.extent
    }

    pub fn format(&self) -> vk::Format {
        self.negotiation.format
    }

    /// Image count N actually returned by the driver.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn sync(&self) -> &FrameSyncSet {
        &self.sync
    }

    pub fn cmd_pool(&self, image: usize) -> vk::CommandPool {
        self.cmd_pools[image]
    }
}
