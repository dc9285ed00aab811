// SPDX-License-Identifier: CEPL-1.0
//! Physical device selection and logical device creation.

use ash::khr::{surface, swapchain};
use ash::{vk, Instance};
use tracing::{debug, info};

use crate::error::{init_vk, InitError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// The device the engine runs on. Fixed for the lifetime of an [`Engine`].
///
/// [`Engine`]: crate::Engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalDeviceChoice<D = vk::PhysicalDevice> {
    pub device: D,
    pub families: QueueFamilies,
}

/// Per-device surface queries used by [`select_physical_device`].
pub trait SurfaceProbe {
    type Device: Copy;

    fn devices(&self) -> Result<Vec<Self::Device>, InitError>;
    fn queue_families(&self, device: Self::Device) -> Vec<vk::QueueFamilyProperties>;
    /// A failed query counts as unsupported.
    fn supports_present(&self, device: Self::Device, family: u32) -> bool;
    fn has_surface_formats(&self, device: Self::Device) -> bool;
    fn has_present_modes(&self, device: Self::Device) -> bool;
}

/// Single forward scan over the queue families. Keeps the most recent
/// graphics-capable and present-capable index and stops at the first point
/// where both are known, so the pair is valid but not necessarily shared.
pub fn find_queue_families(
    props: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> Option<QueueFamilies> {
    let mut graphics = None;
    let mut present = None;
    for (i, family) in props.iter().enumerate() {
        let i = i as u32;
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            graphics = Some(i);
        }
        if supports_present(i) {
            present = Some(i);
        }
        if let (Some(graphics), Some(present)) = (graphics, present) {
            return Some(QueueFamilies { graphics, present });
        }
    }
    None
}

/// First enumerated device with a queue family pair, at least one surface
/// format and at least one present mode.
pub fn select_physical_device<P: SurfaceProbe>(
    probe: &P,
) -> Result<PhysicalDeviceChoice<P::Device>, InitError> {
    for (n, device) in probe.devices()?.into_iter().enumerate() {
        let props = probe.queue_families(device);
        let Some(families) = find_queue_families(&props, |i| probe.supports_present(device, i))
        else {
            debug!("device #{n}: no graphics/present queue family pair");
            continue;
        };
        if !probe.has_surface_formats(device) {
            debug!("device #{n}: no surface formats");
            continue;
        }
        if !probe.has_present_modes(device) {
            debug!("device #{n}: no present modes");
            continue;
        }
        return Ok(PhysicalDeviceChoice { device, families });
    }
    Err(InitError::NoSuitableDevice)
}

/// [`SurfaceProbe`] over a live instance and surface.
pub struct VkSurfaceProbe<'a> {
    pub instance: &'a Instance,
    pub surface_loader: &'a surface::Instance,
    pub surface: vk::SurfaceKHR,
}

impl SurfaceProbe for VkSurfaceProbe<'_> {
    type Device = vk::PhysicalDevice;

    fn devices(&self) -> Result<Vec<vk::PhysicalDevice>, InitError> {
        unsafe { self.instance.enumerate_physical_devices() }
            .map_err(init_vk("vkEnumeratePhysicalDevices"))
    }

    fn queue_families(&self, device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
        unsafe {
            self.instance
                .get_physical_device_queue_family_properties(device)
        }
    }

    fn supports_present(&self, device: vk::PhysicalDevice, family: u32) -> bool {
        match unsafe {
            self.surface_loader
                .get_physical_device_surface_support(device, family, self.surface)
        } {
            Ok(supported) => supported,
            Err(e) => {
                debug!("surface support query for family {family} failed: {e}");
                false
            }
        }
    }

    fn has_surface_formats(&self, device: vk::PhysicalDevice) -> bool {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(device, self.surface)
        }
        .map(|f| !f.is_empty())
        .unwrap_or(false)
    }

    fn has_present_modes(&self, device: vk::PhysicalDevice) -> bool {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(device, self.surface)
        }
        .map(|m| !m.is_empty())
        .unwrap_or(false)
    }
}

pub(crate) fn device_name(instance: &Instance, device: vk::PhysicalDevice) -> String {
    let props = unsafe { instance.get_physical_device_properties(device) };
    props
        .device_name_as_c_str()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "<unnamed>".to_owned())
}

/// Logical device with one queue per distinct family and the swapchain
/// extension. Wireframe fill and anisotropy are enabled when supported.
pub(crate) unsafe fn create_logical_device(
    instance: &Instance,
    choice: &PhysicalDeviceChoice,
) -> Result<(ash::Device, vk::Queue, vk::Queue), InitError> {
    let priorities = [1.0_f32];
    let queue_infos: Vec<_> = choice
        .families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&priorities)
        })
        .collect();

    let supported = unsafe { instance.get_physical_device_features(choice.device) };
    let features = vk::PhysicalDeviceFeatures::default()
        .fill_mode_non_solid(supported.fill_mode_non_solid == vk::TRUE)
        .sampler_anisotropy(supported.sampler_anisotropy == vk::TRUE);

    let extensions = [swapchain::NAME.as_ptr()];
    let info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features);

    let device = unsafe { instance.create_device(choice.device, &info, None) }
        .map_err(init_vk("vkCreateDevice"))?;
    let graphics = unsafe { device.get_device_queue(choice.families.graphics, 0) };
    let present = unsafe { device.get_device_queue(choice.families.present, 0) };

    info!(
        "device \"{}\" (graphics family {}, present family {})",
        device_name(instance, choice.device),
        choice.families.graphics,
        choice.families.present
    );
    Ok((device, graphics, present))
}
