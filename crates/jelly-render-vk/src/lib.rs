// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Vulkan frame lifecycle: device selection, swapchain generations, render
//! targets and the per-frame submit/present loop.

mod device;
mod engine;
mod error;
mod frame;
mod instance;
mod render_target;
mod swapchain;
mod sync;

pub use device::{
    find_queue_families, select_physical_device, PhysicalDeviceChoice, QueueFamilies,
    SurfaceProbe, VkSurfaceProbe,
};
pub use engine::{Engine, EngineConfig};
pub use error::{FrameError, InitError};
pub use frame::{
    run, Application, FrameBackend, FrameCursor, FrameDriver, OutOfDatePolicy, RenderFrame,
    SyncMode,
};
pub use instance::SurfaceSource;
pub use render_target::{color_attachment, RenderTargets};
pub use swapchain::{
    clamp_image_count, image_count_for_present_mode, select_present_mode, select_surface_extent,
    select_surface_format, sharing_mode, SurfaceNegotiation, Swapchain, SwapchainPreferences,
    PREFERRED_COLOR_SPACE, PREFERRED_FORMATS,
};
pub use sync::{fence_create_info, semaphore_create_info, FrameSync, FrameSyncSet, SyncFactory};

pub use ash::vk;
pub use gpu_allocator::vulkan::Allocator;
