// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use raw_window_handle::HandleError;
use thiserror::Error;

/// Startup and swapchain-generation failures. None of these leave partially
/// built graphics state behind.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("window handle unavailable: {0}")]
    Handle(#[from] HandleError),

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error(
        "no physical device offers graphics and present queues, \
         surface formats and present modes for this surface"
    )]
    NoSuitableDevice,

    #[error("surface reports no formats")]
    NoSurfaceFormats,

    #[error("surface extent has zero area (window minimized?)")]
    ZeroExtent,

    #[error("swapchain returned no images")]
    NoSwapchainImages,

    #[error("failed to create GPU allocator: {0}")]
    Allocator(#[from] gpu_allocator::AllocationError),
}

/// Errors raised while driving frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("swapchain out of date ({call})")]
    OutOfDate { call: &'static str },

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("swapchain rebuild failed: {0}")]
    Rebuild(#[source] InitError),
}

pub(crate) fn init_vk(call: &'static str) -> impl FnOnce(vk::Result) -> InitError {
    move |result| InitError::Vulkan { call, result }
}

/// Maps `ERROR_OUT_OF_DATE_KHR` to [`FrameError::OutOfDate`], anything else to
/// [`FrameError::Vulkan`].
pub(crate) fn frame_vk(call: &'static str) -> impl FnOnce(vk::Result) -> FrameError {
    move |result| match result {
        vk::Result::ERROR_OUT_OF_DATE_KHR => FrameError::OutOfDate { call },
        result => FrameError::Vulkan { call, result },
    }
}
