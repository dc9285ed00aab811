// SPDX-License-Identifier: CEPL-1.0
use std::ffi::{c_char, c_void, CStr};

use ash::ext::debug_utils;
use ash::{vk, Entry, Instance};
use jelly_render::WindowHost;
use tracing::{debug, error, trace, warn};

use crate::error::{init_vk, InitError};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const ENGINE_NAME: &CStr = c"Jelly";

/// What the core needs from the window system to talk to the GPU.
pub trait SurfaceSource {
    /// Instance extensions the platform surface requires.
    fn required_instance_extensions(&self) -> Result<Vec<*const c_char>, InitError>;

    /// # Safety
    /// The returned surface must be destroyed before `instance`.
    unsafe fn create_surface(
        &self,
        entry: &Entry,
        instance: &Instance,
    ) -> Result<vk::SurfaceKHR, InitError>;
}

impl<T: WindowHost + ?Sized> SurfaceSource for T {
    fn required_instance_extensions(&self) -> Result<Vec<*const c_char>, InitError> {
        let dh = self.display_handle()?.as_raw();
        let exts = ash_window::enumerate_required_extensions(dh)
            .map_err(init_vk("ash_window::enumerate_required_extensions"))?;
        Ok(exts.to_vec())
    }

    unsafe fn create_surface(
        &self,
        entry: &Entry,
        instance: &Instance,
    ) -> Result<vk::SurfaceKHR, InitError> {
        let dh = self.display_handle()?.as_raw();
        let wh = self.window_handle()?.as_raw();
        // SAFETY: handles come from a live window; the caller owns teardown order.
        unsafe { ash_window::create_surface(entry, instance, dh, wh, None) }
            .map_err(init_vk("vkCreateSurfaceKHR"))
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    // SAFETY: the loader hands us either null or a valid callback payload.
    let Some(data) = (unsafe { data.as_ref() }) else {
        return vk::FALSE;
    };
    if data.p_message.is_null() {
        return vk::FALSE;
    }
    // SAFETY: checked non-null; the loader hands over a NUL-terminated message.
    let msg = unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!("[vulkan] {msg}");
    } else {
        trace!("[vulkan] {msg}");
    }
    vk::FALSE
}

pub(crate) struct DebugMessenger {
    loader: debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    unsafe fn new(entry: &Entry, instance: &Instance) -> Result<Self, InitError> {
        let loader = debug_utils::Instance::new(entry, instance);
        let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));
        let handle = unsafe { loader.create_debug_utils_messenger(&info, None) }
            .map_err(init_vk("vkCreateDebugUtilsMessengerEXT"))?;
        Ok(Self { loader, handle })
    }

    pub(crate) unsafe fn destroy(&self) {
        unsafe { self.loader.destroy_debug_utils_messenger(self.handle, None) };
    }
}

fn has_layer(entry: &Entry, name: &CStr) -> bool {
    // SAFETY: plain loader query.
    unsafe { entry.enumerate_instance_layer_properties() }
        .unwrap_or_default()
        .iter()
        .any(|l| l.layer_name_as_c_str() == Ok(name))
}

fn has_instance_extension(entry: &Entry, name: &CStr) -> bool {
    // SAFETY: plain loader query.
    unsafe { entry.enumerate_instance_extension_properties(None) }
        .unwrap_or_default()
        .iter()
        .any(|e| e.extension_name_as_c_str() == Ok(name))
}

/// Create the instance, optionally with the Khronos validation layer plus a
/// messenger that forwards into `tracing`.
///
/// Validation is silently skipped when the layer or `VK_EXT_debug_utils` is
/// not installed.
pub(crate) unsafe fn create_instance(
    entry: &Entry,
    app_name: &CStr,
    required_extensions: &[*const c_char],
    validation: bool,
) -> Result<(Instance, Option<DebugMessenger>), InitError> {
    let app_info = vk::ApplicationInfo::default()
        .application_name(app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(ENGINE_NAME)
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_2);

    let mut extensions = required_extensions.to_vec();
    extensions.push(ash::khr::get_physical_device_properties2::NAME.as_ptr());

    let validation = validation
        && if !has_layer(entry, VALIDATION_LAYER) {
            warn!("validation requested but {VALIDATION_LAYER:?} is not installed");
            false
        } else if !has_instance_extension(entry, debug_utils::NAME) {
            warn!("validation requested but {:?} is unavailable", debug_utils::NAME);
            false
        } else {
            true
        };

    let mut layers = Vec::new();
    if validation {
        layers.push(VALIDATION_LAYER.as_ptr());
        extensions.push(debug_utils::NAME.as_ptr());
    }

    let info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);

    let instance =
        unsafe { entry.create_instance(&info, None) }.map_err(init_vk("vkCreateInstance"))?;

    if !validation {
        return Ok((instance, None));
    }
    match unsafe { DebugMessenger::new(entry, &instance) } {
        Ok(messenger) => {
            debug!("validation layer enabled");
            Ok((instance, Some(messenger)))
        }
        Err(e) => {
            unsafe { instance.destroy_instance(None) };
            Err(e)
        }
    }
}
