// SPDX-License-Identifier: CEPL-1.0
use ash::prelude::VkResult;
use ash::vk;

use crate::error::{init_vk, InitError};

/// Sync objects for one frame slot.
#[derive(Clone, Copy, Debug)]
pub struct FrameSync {
    /// Signaled when the slot's last submission finished.
    pub fence: vk::Fence,
    /// Signaled when the acquired image may be rendered into.
    pub acquire: vk::Semaphore,
    /// Signaled when rendering finished; gates presentation.
    pub complete: vk::Semaphore,
}

/// Creates and destroys sync objects. Implemented by `ash::Device`; tests
/// substitute a recorder.
pub trait SyncFactory {
    /// # Safety
    /// The underlying device must be alive.
    unsafe fn new_fence(&self, info: &vk::FenceCreateInfo<'_>) -> VkResult<vk::Fence>;
    /// # Safety
    /// The underlying device must be alive.
    unsafe fn new_semaphore(&self, info: &vk::SemaphoreCreateInfo<'_>) -> VkResult<vk::Semaphore>;
    /// # Safety
    /// `fence` must come from this factory and not be in use by the GPU.
    unsafe fn free_fence(&self, fence: vk::Fence);
    /// # Safety
    /// `semaphore` must come from this factory and not be in use by the GPU.
    unsafe fn free_semaphore(&self, semaphore: vk::Semaphore);
}

impl SyncFactory for ash::Device {
    unsafe fn new_fence(&self, info: &vk::FenceCreateInfo<'_>) -> VkResult<vk::Fence> {
        unsafe { self.create_fence(info, None) }
    }

    unsafe fn new_semaphore(&self, info: &vk::SemaphoreCreateInfo<'_>) -> VkResult<vk::Semaphore> {
        unsafe { self.create_semaphore(info, None) }
    }

    unsafe fn free_fence(&self, fence: vk::Fence) {
        unsafe { self.destroy_fence(fence, None) }
    }

    unsafe fn free_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.destroy_semaphore(semaphore, None) }
    }
}

/// Slot fences start signaled so the first wait on each slot returns at once.
pub fn fence_create_info() -> vk::FenceCreateInfo<'static> {
    vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED)
}

pub fn semaphore_create_info() -> vk::SemaphoreCreateInfo<'static> {
    vk::SemaphoreCreateInfo::default()
}

/// One [`FrameSync`] per swapchain image.
#[derive(Debug, Default)]
pub struct FrameSyncSet {
    slots: Vec<FrameSync>,
}

impl FrameSyncSet {
    /// Build `count` slots. On failure everything created so far is destroyed.
    ///
    /// # Safety
    /// See [`SyncFactory`].
    pub unsafe fn new<F: SyncFactory + ?Sized>(factory: &F, count: usize) -> Result<Self, InitError> {
        let mut set = Self {
            slots: Vec::with_capacity(count),
        };
        for _ in 0..count {
            match unsafe { Self::new_slot(factory) } {
                Ok(slot) => set.slots.push(slot),
                Err(e) => {
                    unsafe { set.destroy(factory) };
                    return Err(e);
                }
            }
        }
        Ok(set)
    }

    unsafe fn new_slot<F: SyncFactory + ?Sized>(factory: &F) -> Result<FrameSync, InitError> {
        let sem_info = semaphore_create_info();
        let fence = unsafe { factory.new_fence(&fence_create_info()) }
            .map_err(init_vk("vkCreateFence"))?;
        let acquire = match unsafe { factory.new_semaphore(&sem_info) } {
            Ok(s) => s,
            Err(e) => {
                unsafe { factory.free_fence(fence) };
                return Err(init_vk("vkCreateSemaphore")(e));
            }
        };
        let complete = match unsafe { factory.new_semaphore(&sem_info) } {
            Ok(s) => s,
            Err(e) => {
                unsafe {
                    factory.free_semaphore(acquire);
                    factory.free_fence(fence);
                }
                return Err(init_vk("vkCreateSemaphore")(e));
            }
        };
        Ok(FrameSync {
            fence,
            acquire,
            complete,
        })
    }

    /// # Safety
    /// No submission may still reference these objects.
    pub unsafe fn destroy<F: SyncFactory + ?Sized>(&mut self, factory: &F) {
        for slot in self.slots.drain(..) {
            unsafe {
                factory.free_semaphore(slot.complete);
                factory.free_semaphore(slot.acquire);
                factory.free_fence(slot.fence);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> &FrameSync {
        &self.slots[index]
    }

    pub fn fences(&self) -> impl Iterator<Item = vk::Fence> + '_ {
        self.slots.iter().map(|s| s.fence)
    }
}
