// SPDX-License-Identifier: CEPL-1.0
//! The engine context: instance, device, allocator and the current swapchain
//! generation, plus the Vulkan side of the frame loop.

use std::ffi::CString;
use std::sync::Mutex;

use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use jelly_render::{RenderSize, WindowHost};
use tracing::{debug, info};

use crate::device::{
    create_logical_device, select_physical_device, PhysicalDeviceChoice, VkSurfaceProbe,
};
use crate::error::{frame_vk, init_vk, FrameError, InitError};
use crate::frame::{self, Application, FrameBackend, OutOfDatePolicy, RenderFrame, SyncMode};
use crate::instance::{create_instance, DebugMessenger, SurfaceSource};
use crate::render_target::RenderTargets;
use crate::swapchain::{SurfaceNegotiation, Swapchain, SwapchainPreferences};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub app_name: String,
    pub clear_color: [f32; 4],
    pub sync_mode: SyncMode,
    pub out_of_date: OutOfDatePolicy,
    /// Present modes in preference order; FIFO is the fallback.
    pub present_modes: Vec<vk::PresentModeKHR>,
    /// Request the window size when the surface leaves the extent open.
    pub use_window_extent: bool,
    pub validation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: "Jelly".to_owned(),
            clear_color: [1.0, 0.0, 0.0, 1.0],
            sync_mode: SyncMode::default(),
            out_of_date: OutOfDatePolicy::default(),
            present_modes: vec![vk::PresentModeKHR::FIFO],
            use_window_extent: false,
            validation: cfg!(debug_assertions),
        }
    }
}

impl EngineConfig {
    fn preferences(&self, size: RenderSize) -> SwapchainPreferences {
        let extent = if self.use_window_extent {
            vk::Extent2D {
                width: size.width,
                height: size.height,
            }
        } else {
            vk::Extent2D::default()
        };
        SwapchainPreferences {
            present_modes: self.present_modes.clone(),
            extent,
            ..SwapchainPreferences::default()
        }
    }
}

struct InstanceContext {
    entry: Entry,
    instance: Instance,
    debug: Option<DebugMessenger>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
}

impl InstanceContext {
    unsafe fn new<S: SurfaceSource + ?Sized>(
        source: &S,
        app_name: &str,
        validation: bool,
    ) -> Result<Self, InitError> {
        let entry = Entry::linked();
        let app_name = CString::new(app_name).unwrap_or_else(|_| c"Jelly".to_owned());
        let extensions = source.required_instance_extensions()?;
        let (instance, debug) =
            unsafe { create_instance(&entry, &app_name, &extensions, validation) }?;
        let surface_loader = surface::Instance::new(&entry, &instance);

        let mut ctx = Self {
            entry,
            instance,
            debug,
            surface_loader,
            surface: vk::SurfaceKHR::null(),
        };
        ctx.surface = unsafe { source.create_surface(&ctx.entry, &ctx.instance) }?;
        Ok(ctx)
    }
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        unsafe {
            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            if let Some(debug) = self.debug.take() {
                debug.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

struct DeviceContext {
    device: ash::Device,
    allocator: Option<Mutex<Allocator>>,
    choice: PhysicalDeviceChoice,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    swapchain_loader: swapchain::Device,
}

impl DeviceContext {
    unsafe fn new(ictx: &InstanceContext) -> Result<Self, InitError> {
        let probe = VkSurfaceProbe {
            instance: &ictx.instance,
            surface_loader: &ictx.surface_loader,
            surface: ictx.surface,
        };
        let choice = select_physical_device(&probe)?;
        let (device, graphics_queue, present_queue) =
            unsafe { create_logical_device(&ictx.instance, &choice) }?;
        let swapchain_loader = swapchain::Device::new(&ictx.instance, &device);

        let mut ctx = Self {
            device,
            allocator: None,
            choice,
            graphics_queue,
            present_queue,
            swapchain_loader,
        };
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ictx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.choice.device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;
        ctx.allocator = Some(Mutex::new(allocator));
        Ok(ctx)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // Allocator memory must go back before the device does.
        self.allocator = None;
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingCmd {
    cmd: vk::CommandBuffer,
    slot: usize,
}

/// What has to happen before an image's pool is recorded into again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Release {
    /// Fence slot to wait on first. `None` when it is the current slot, whose
    /// fence the frame already waited on.
    wait_slot: Option<usize>,
    cmd: vk::CommandBuffer,
}

/// Pipelined mode: the last command buffer recorded into each image and the
/// slot whose fence guards it.
#[derive(Debug, Default)]
struct PendingCmds {
    entries: Vec<Option<PendingCmd>>,
}

impl PendingCmds {
    fn new(images: usize) -> Self {
        Self {
            entries: vec![None; images],
        }
    }

    fn park(&mut self, image: usize, slot: usize, cmd: vk::CommandBuffer) {
        if let Some(entry) = self.entries.get_mut(image) {
            *entry = Some(PendingCmd { cmd, slot });
        }
    }

    /// Take the buffer parked on `image` while frame slot `current` runs.
    fn release(&mut self, image: usize, current: usize) -> Option<Release> {
        let pending = self.entries.get_mut(image)?.take()?;
        Some(Release {
            wait_slot: (pending.slot != current).then_some(pending.slot),
            cmd: pending.cmd,
        })
    }

    /// Forget every parked buffer. Their pools free them.
    fn drain(&mut self) -> Vec<PendingCmd> {
        self.entries.iter_mut().filter_map(Option::take).collect()
    }
}

/// Swapchain plus everything sized or indexed by its images.
struct Generation {
    swapchain: Swapchain,
    targets: RenderTargets,
    pending: PendingCmds,
}

impl Generation {
    unsafe fn new(
        dctx: &DeviceContext,
        ictx: &InstanceContext,
        prefs: &SwapchainPreferences,
        old: vk::SwapchainKHR,
    ) -> Result<Self, InitError> {
        let mut swapchain = unsafe {
            Swapchain::new(
                &dctx.device,
                &dctx.swapchain_loader,
                &ictx.surface_loader,
                dctx.choice.device,
                ictx.surface,
                &dctx.choice.families,
                prefs,
                old,
            )
        }?;
        let targets = match unsafe {
            RenderTargets::new(
                &dctx.device,
                swapchain.format(),
                swapchain.extent(),
                swapchain.views(),
            )
        } {
            Ok(targets) => targets,
            Err(e) => {
                unsafe { swapchain.destroy(&dctx.device, &dctx.swapchain_loader) };
                return Err(e);
            }
        };
        let pending = PendingCmds::new(swapchain.len());
        Ok(Self {
            swapchain,
            targets,
            pending,
        })
    }

    /// Framebuffers and pass, then pools (freeing their buffers), sync,
    /// views and the swapchain itself.
    unsafe fn destroy(&mut self, dctx: &DeviceContext) {
        let parked = self.pending.drain().len();
        if parked > 0 {
            debug!("{parked} pending command buffers go with their pools");
        }
        unsafe {
            self.targets.destroy(&dctx.device);
            self.swapchain.destroy(&dctx.device, &dctx.swapchain_loader);
        }
    }
}

/// Owns every Vulkan object the frame loop touches.
///
/// Field order is drop order: the generation is torn down by hand in
/// [`Drop`], then the device context, then the instance context.
pub struct Engine {
    cfg: EngineConfig,
    generation: Generation,
    device: DeviceContext,
    instance: InstanceContext,
}

impl Engine {
    /// Build instance, surface, device, allocator and the first swapchain
    /// generation for `host`. Anything built before a failing step is
    /// destroyed before the error is returned.
    pub fn new<H: WindowHost + ?Sized>(host: &H, cfg: EngineConfig) -> Result<Self, InitError> {
        let instance = unsafe { InstanceContext::new(host, &cfg.app_name, cfg.validation) }?;
        let device = unsafe { DeviceContext::new(&instance) }?;
        let prefs = cfg.preferences(host.size());
        let generation =
            unsafe { Generation::new(&device, &instance, &prefs, vk::SwapchainKHR::null()) }?;

        info!(
            "engine ready (sync {:?}, out-of-date {:?})",
            cfg.sync_mode, cfg.out_of_date
        );
        Ok(Self {
            cfg,
            generation,
            device,
            instance,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device.device
    }

    pub fn physical_device(&self) -> &PhysicalDeviceChoice {
        &self.device.choice
    }

    /// Shared GPU memory allocator.
    pub fn allocator(&self) -> Option<&Mutex<Allocator>> {
        self.device.allocator.as_ref()
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.generation.swapchain
    }

    pub fn negotiation(&self) -> &SurfaceNegotiation {
        self.generation.swapchain.negotiation()
    }

    pub fn render_targets(&self) -> &RenderTargets {
        &self.generation.targets
    }

    /// Drive frames until `host` closes. See [`frame::run`].
    pub fn run<H, A>(&mut self, host: &mut H, app: &mut A) -> Result<u64, FrameError>
    where
        H: WindowHost + ?Sized,
        A: Application,
    {
        let policy = self.cfg.out_of_date;
        frame::run(host, self, app, policy)
    }

    /// Replace the current generation with one negotiated against the
    /// surface as it is now. The old generation survives a failed rebuild.
    pub fn rebuild_swapchain(&mut self, size: RenderSize) -> Result<(), InitError> {
        unsafe { self.device.device.device_wait_idle() }.map_err(init_vk("vkDeviceWaitIdle"))?;

        let prefs = self.cfg.preferences(size);
        let next = unsafe {
            Generation::new(
                &self.device,
                &self.instance,
                &prefs,
                self.generation.swapchain.handle(),
            )
        }?;
        let mut retired = std::mem::replace(&mut self.generation, next);
        unsafe { retired.destroy(&self.device) };
        Ok(())
    }

    /// Pipelined mode: free the buffer `image` last ran, once its slot fence
    /// says it is done.
    unsafe fn release_pending(&mut self, slot: usize, image: usize) -> Result<(), FrameError> {
        let Some(release) = self.generation.pending.release(image, slot) else {
            return Ok(());
        };
        let device = &self.device.device;
        if let Some(guard) = release.wait_slot {
            let fence = self.generation.swapchain.sync().slot(guard).fence;
            unsafe { device.wait_for_fences(&[fence], true, u64::MAX) }
                .map_err(frame_vk("vkWaitForFences"))?;
        }
        unsafe {
            device.free_command_buffers(self.generation.swapchain.cmd_pool(image), &[release.cmd])
        };
        Ok(())
    }

    unsafe fn record_into(
        &self,
        cmd: vk::CommandBuffer,
        slot: usize,
        image: u32,
        app: &mut dyn Application,
    ) -> Result<(), FrameError> {
        let device = &self.device.device;
        let extent = self.generation.swapchain.extent();

        let begin =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin) }
            .map_err(frame_vk("vkBeginCommandBuffer"))?;

        let clears = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.cfg.clear_color,
            },
        }];
        let pass = vk::RenderPassBeginInfo::default()
            .render_pass(self.generation.targets.render_pass)
            .framebuffer(self.generation.targets.framebuffers[image as usize])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .clear_values(&clears);
        unsafe { device.cmd_begin_render_pass(cmd, &pass, vk::SubpassContents::INLINE) };

        app.on_render(&RenderFrame {
            device,
            cmd,
            image_index: image,
            slot,
            extent,
        });

        unsafe {
            device.cmd_end_render_pass(cmd);
            device.end_command_buffer(cmd)
        }
        .map_err(frame_vk("vkEndCommandBuffer"))
    }
}

impl FrameBackend for Engine {
    fn slot_count(&self) -> usize {
        self.generation.swapchain.len()
    }

    fn wait_slot(&mut self, slot: usize) -> Result<(), FrameError> {
        let fence = self.generation.swapchain.sync().slot(slot).fence;
        let device = &self.device.device;
        unsafe {
            device
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(frame_vk("vkWaitForFences"))?;
            device
                .reset_fences(&[fence])
                .map_err(frame_vk("vkResetFences"))
        }
    }

    fn acquire(&mut self, slot: usize) -> Result<u32, FrameError> {
        let semaphore = self.generation.swapchain.sync().slot(slot).acquire;
        let (image, suboptimal) = unsafe {
            self.device.swapchain_loader.acquire_next_image(
                self.generation.swapchain.handle(),
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        }
        .map_err(frame_vk("vkAcquireNextImageKHR"))?;
        if suboptimal {
            debug!("acquire: swapchain suboptimal (image {image})");
        }
        Ok(image)
    }

    fn record(
        &mut self,
        slot: usize,
        image: u32,
        app: &mut dyn Application,
    ) -> Result<vk::CommandBuffer, FrameError> {
        if self.cfg.sync_mode == SyncMode::Pipelined {
            unsafe { self.release_pending(slot, image as usize) }?;
        }

        let pool = self.generation.swapchain.cmd_pool(image as usize);
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.device.allocate_command_buffers(&info) }
            .map_err(frame_vk("vkAllocateCommandBuffers"))?
            .into_iter()
            .next()
            .ok_or(FrameError::Vulkan {
                call: "vkAllocateCommandBuffers",
                result: vk::Result::ERROR_UNKNOWN,
            })?;

        if let Err(e) = unsafe { self.record_into(cmd, slot, image, app) } {
            unsafe { self.device.device.free_command_buffers(pool, &[cmd]) };
            return Err(e);
        }
        Ok(cmd)
    }

    fn submit(
        &mut self,
        slot: usize,
        _image: u32,
        cmd: vk::CommandBuffer,
    ) -> Result<(), FrameError> {
        let sync = self.generation.swapchain.sync().slot(slot);
        let wait = [sync.acquire];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let cmds = [cmd];
        let signal = [sync.complete];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signal);
        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit], sync.fence)
        }
        .map_err(frame_vk("vkQueueSubmit"))
    }

    fn present(&mut self, slot: usize, image: u32) -> Result<(), FrameError> {
        let wait = [self.generation.swapchain.sync().slot(slot).complete];
        let swapchains = [self.generation.swapchain.handle()];
        let images = [image];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&images);
        let suboptimal = unsafe {
            self.device
                .swapchain_loader
                .queue_present(self.device.present_queue, &info)
        }
        .map_err(frame_vk("vkQueuePresentKHR"))?;
        if suboptimal {
            debug!("present: swapchain suboptimal (image {image})");
        }

        if self.cfg.sync_mode == SyncMode::Strict {
            unsafe { self.device.device.queue_wait_idle(self.device.present_queue) }
                .map_err(frame_vk("vkQueueWaitIdle"))?;
        }
        Ok(())
    }

    fn reclaim(
        &mut self,
        slot: usize,
        image: u32,
        cmd: vk::CommandBuffer,
    ) -> Result<(), FrameError> {
        let image = image as usize;
        match self.cfg.sync_mode {
            SyncMode::Strict => unsafe {
                self.device
                    .device
                    .free_command_buffers(self.generation.swapchain.cmd_pool(image), &[cmd]);
            },
            SyncMode::Pipelined => {
                self.generation.pending.park(image, slot, cmd);
            }
        }
        Ok(())
    }

    fn rebuild(&mut self, size: RenderSize) -> Result<(), FrameError> {
        self.rebuild_swapchain(size).map_err(FrameError::Rebuild)
    }

    fn wait_idle(&mut self) -> Result<(), FrameError> {
        unsafe { self.device.device.device_wait_idle() }.map_err(frame_vk("vkDeviceWaitIdle"))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.generation.destroy(&self.device);
        }
        info!("engine shut down");
    }
}
