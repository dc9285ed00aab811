// SPDX-License-Identifier: CEPL-1.0
use ash::vk;

use crate::error::{init_vk, InitError};

/// The single color attachment: cleared on load, stored, and handed to the
/// presentation engine at the end of the pass.
pub fn color_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    }
}

/// Render pass plus one framebuffer per swapchain view. Lives and dies with a
/// swapchain generation.
#[derive(Debug, Default)]
pub struct RenderTargets {
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
}

impl RenderTargets {
    /// # Safety
    /// `views` must be live views of a swapchain created on `device`.
    pub unsafe fn new(
        device: &ash::Device,
        format: vk::Format,
        extent: vk::Extent2D,
        views: &[vk::ImageView],
    ) -> Result<Self, InitError> {
        let render_pass = unsafe { create_render_pass(device, format) }?;
        let framebuffers = create_framebuffers_with(
            render_pass,
            extent,
            views,
            |info| unsafe { device.create_framebuffer(info, None) },
            |fb| unsafe { device.destroy_framebuffer(fb, None) },
        );
        match framebuffers {
            Ok(framebuffers) => Ok(Self {
                render_pass,
                framebuffers,
            }),
            Err(e) => {
                unsafe { device.destroy_render_pass(render_pass, None) };
                Err(e)
            }
        }
    }

    /// Framebuffers first, then the pass they reference.
    ///
    /// # Safety
    /// No pending command buffer may reference these objects.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            for fb in self.framebuffers.drain(..) {
                device.destroy_framebuffer(fb, None);
            }
            if self.render_pass != vk::RenderPass::null() {
                device.destroy_render_pass(self.render_pass, None);
                self.render_pass = vk::RenderPass::null();
            }
        }
    }
}

unsafe fn create_render_pass(
    device: &ash::Device,
    format: vk::Format,
) -> Result<vk::RenderPass, InitError> {
    let attachments = [color_attachment(format)];
    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)];

    // No explicit subpass dependencies.
    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses);

    unsafe { device.create_render_pass(&info, None) }.map_err(init_vk("vkCreateRenderPass"))
}

fn create_framebuffers_with<FCreate, FDestroy>(
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    views: &[vk::ImageView],
    mut create: FCreate,
    mut destroy: FDestroy,
) -> Result<Vec<vk::Framebuffer>, InitError>
where
    FCreate: FnMut(&vk::FramebufferCreateInfo<'_>) -> Result<vk::Framebuffer, vk::Result>,
    FDestroy: FnMut(vk::Framebuffer),
{
    let mut framebuffers = Vec::with_capacity(views.len());
    for view in views {
        let attachments = std::slice::from_ref(view);
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        match create(&info) {
            Ok(fb) => framebuffers.push(fb),
            Err(e) => {
                for fb in framebuffers.drain(..) {
                    destroy(fb);
                }
                return Err(init_vk("vkCreateFramebuffer")(e));
            }
        }
    }
    Ok(framebuffers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;

    #[test]
    fn color_attachment_clears_stores_and_presents() {
        let a = color_attachment(vk::Format::B8G8R8A8_UNORM);
        assert_eq!(a.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(a.samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(a.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(a.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(a.stencil_load_op, vk::AttachmentLoadOp::DONT_CARE);
        assert_eq!(a.stencil_store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(a.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(a.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn one_framebuffer_per_view_sized_to_extent() {
        let views = [
            vk::ImageView::from_raw(10),
            vk::ImageView::from_raw(11),
            vk::ImageView::from_raw(12),
        ];
        let extent = vk::Extent2D {
            width: 640,
            height: 480,
        };
        let seen = RefCell::new(Vec::new());
        let fbs = create_framebuffers_with(
            vk::RenderPass::from_raw(1),
            extent,
            &views,
            |info| {
                // SAFETY: p_attachments points at one live view for the call.
                let view = unsafe { *info.p_attachments };
                seen.borrow_mut()
                    .push((view, info.width, info.height, info.layers, info.attachment_count));
                Ok(vk::Framebuffer::from_raw(100 + view.as_raw()))
            },
            |_| panic!("nothing to clean up on success"),
        )
        .unwrap();

        assert_eq!(fbs.len(), 3);
        assert_eq!(fbs[2], vk::Framebuffer::from_raw(112));
        for (i, (view, w, h, layers, count)) in seen.borrow().iter().enumerate() {
            assert_eq!(*view, views[i]);
            assert_eq!((*w, *h, *layers, *count), (640, 480, 1, 1));
        }
    }

    #[test]
    fn framebuffer_failure_destroys_earlier_ones() {
        let views = [vk::ImageView::from_raw(1), vk::ImageView::from_raw(2)];
        let calls = RefCell::new(0);
        let destroyed = RefCell::new(Vec::new());
        let result = create_framebuffers_with(
            vk::RenderPass::from_raw(1),
            vk::Extent2D {
                width: 1,
                height: 1,
            },
            &views,
            |_| {
                let mut n = calls.borrow_mut();
                *n += 1;
                if *n == 1 {
                    Ok(vk::Framebuffer::from_raw(50))
                } else {
                    Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
                }
            },
            |fb| destroyed.borrow_mut().push(fb),
        );
        assert!(matches!(
            result,
            Err(InitError::Vulkan {
                call: "vkCreateFramebuffer",
                ..
            })
        ));
        assert_eq!(destroyed.borrow().as_slice(), &[vk::Framebuffer::from_raw(50)]);
    }
}
