// SPDX-License-Identifier: CEPL-1.0
//! The per-frame state machine.
//!
//! One iteration: poll → update → wait+reset fence → acquire → record →
//! submit → present → reclaim → advance. Sync objects are picked by the frame
//! cursor, while command pools and framebuffers are picked by the acquired
//! image index. The two need not agree.

use std::time::Duration;

use ash::vk;
use jelly_render::{RenderSize, WindowHost};
use tracing::{error, info, warn};

use crate::error::FrameError;

/// Poll interval while a rebuild waits for a zero-area window to come back.
const MINIMIZED_POLL_INTERVAL: Duration = Duration::from_millis(16);

/// How presentation is serialized against the next frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// Wait for the present queue to go idle after every present.
    #[default]
    Strict,
    /// Rely on the slot fences only; command buffers are reclaimed lazily.
    Pipelined,
}

/// What the loop does when acquire or present reports `ERROR_OUT_OF_DATE_KHR`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutOfDatePolicy {
    /// Stop the loop with [`FrameError::OutOfDate`].
    #[default]
    Fatal,
    /// Rebuild the swapchain generation and carry on with the next frame.
    Rebuild,
}

/// Index into the ring of frame slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameCursor {
    current: usize,
    len: usize,
}

impl FrameCursor {
    /// A ring of `len` slots, starting at slot 0. A zero-length ring is
    /// treated as one slot.
    pub fn new(len: usize) -> Self {
        Self {
            current: 0,
            len: len.max(1),
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn slot_count(&self) -> usize {
        self.len
    }

    /// Step to the next slot and return it.
    pub fn advance(&mut self) -> usize {
        self.current = (self.current + 1) % self.len;
        self.current
    }
}

/// What the application sees while its draw commands are being recorded.
pub struct RenderFrame<'a> {
    pub device: &'a ash::Device,
    /// Primary command buffer with the render pass already begun.
    pub cmd: vk::CommandBuffer,
    pub image_index: u32,
    pub slot: usize,
    pub extent: vk::Extent2D,
}

/// Host application callbacks.
pub trait Application {
    /// Once, before the first frame.
    fn on_attach(&mut self) {}

    /// Once per frame, before rendering.
    fn on_update(&mut self) {}

    /// Once per frame, inside the render pass. Record drawing commands into
    /// `frame.cmd` only; synchronization belongs to the engine.
    fn on_render(&mut self, frame: &RenderFrame<'_>);

    /// Once, after the last frame.
    fn on_detach(&mut self) {}
}

/// GPU operations the driver sequences. [`Engine`](crate::Engine) is the real
/// implementation.
pub trait FrameBackend {
    /// Number of frame slots (= swapchain images) in the current generation.
    fn slot_count(&self) -> usize;

    /// Block on the slot fence, then reset it.
    fn wait_slot(&mut self, slot: usize) -> Result<(), FrameError>;

    /// Acquire the next image, signaling the slot's acquire semaphore.
    fn acquire(&mut self, slot: usize) -> Result<u32, FrameError>;

    /// Allocate and record the command buffer for `image`, calling
    /// [`Application::on_render`] inside the render pass.
    fn record(
        &mut self,
        slot: usize,
        image: u32,
        app: &mut dyn Application,
    ) -> Result<vk::CommandBuffer, FrameError>;

    fn submit(&mut self, slot: usize, image: u32, cmd: vk::CommandBuffer)
        -> Result<(), FrameError>;

    fn present(&mut self, slot: usize, image: u32) -> Result<(), FrameError>;

    fn reclaim(&mut self, slot: usize, image: u32, cmd: vk::CommandBuffer)
        -> Result<(), FrameError>;

    /// Replace the swapchain generation. `size` is the host's current size.
    fn rebuild(&mut self, size: RenderSize) -> Result<(), FrameError>;

    fn wait_idle(&mut self) -> Result<(), FrameError>;
}

/// Drives frames over a [`FrameBackend`] and owns the frame cursor.
#[derive(Debug)]
pub struct FrameDriver {
    cursor: FrameCursor,
    frames: u64,
}

impl FrameDriver {
    pub fn new(slot_count: usize) -> Self {
        Self {
            cursor: FrameCursor::new(slot_count),
            frames: 0,
        }
    }

    pub fn cursor(&self) -> FrameCursor {
        self.cursor
    }

    /// Frames completed so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Run one frame. The cursor only advances when the frame completed.
    pub fn frame<B>(&mut self, backend: &mut B, app: &mut dyn Application) -> Result<(), FrameError>
    where
        B: FrameBackend + ?Sized,
    {
        let slot = self.cursor.current();

        backend.wait_slot(slot)?;
        let image = backend.acquire(slot)?;
        let cmd = backend.record(slot, image, app)?;
        backend.submit(slot, image, cmd)?;
        backend.present(slot, image)?;
        backend.reclaim(slot, image, cmd)?;

        self.cursor.advance();
        self.frames += 1;
        Ok(())
    }

    /// Rebuild after an out-of-date swapchain and restart the ring at slot 0
    /// of the new generation.
    pub fn recover<B>(&mut self, backend: &mut B, size: RenderSize) -> Result<(), FrameError>
    where
        B: FrameBackend + ?Sized,
    {
        backend.rebuild(size)?;
        self.cursor = FrameCursor::new(backend.slot_count());
        Ok(())
    }
}

/// The main loop. Runs until `host` asks to close or a frame fails for good,
/// then waits for the GPU and detaches the application either way.
///
/// Under [`OutOfDatePolicy::Rebuild`] the rebuild happens at the start of the
/// next iteration, and is held back (skipping frames) while the host reports
/// a zero-area size.
///
/// Returns the number of completed frames.
pub fn run<H, B, A>(
    host: &mut H,
    backend: &mut B,
    app: &mut A,
    policy: OutOfDatePolicy,
) -> Result<u64, FrameError>
where
    H: WindowHost + ?Sized,
    B: FrameBackend + ?Sized,
    A: Application,
{
    let mut driver = FrameDriver::new(backend.slot_count());

    app.on_attach();
    info!("frame loop start ({} slots)", driver.cursor().slot_count());

    let mut rebuild_pending = false;
    let result = loop {
        if host.should_close() {
            break Ok(());
        }
        host.poll_events();
        app.on_update();

        if rebuild_pending {
            let size = host.size();
            if size.is_empty() {
                // No swapchain can exist for a zero-area surface.
                std::thread::sleep(MINIMIZED_POLL_INTERVAL);
                continue;
            }
            rebuild_pending = false;
            if let Err(e) = driver.recover(backend, size) {
                break Err(e);
            }
        }

        match driver.frame(backend, app) {
            Ok(()) => {}
            Err(FrameError::OutOfDate { call }) if policy == OutOfDatePolicy::Rebuild => {
                warn!("swapchain out of date ({call}), rebuilding");
                rebuild_pending = true;
            }
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = backend.wait_idle() {
        error!("wait idle after frame loop: {e}");
    }
    app.on_detach();

    match &result {
        Ok(()) => info!("frame loop end after {} frames", driver.frames()),
        Err(e) => error!("frame loop stopped after {} frames: {e}", driver.frames()),
    }
    result.map(|()| driver.frames())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use raw_window_handle::{
        DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
    };

    #[test]
    fn cursor_returns_to_start_after_n_advances() {
        for n in 1..=4 {
            let mut c = FrameCursor::new(n);
            let start = c.current();
            for _ in 0..n {
                c.advance();
            }
            assert_eq!(c.current(), start, "ring of {n}");
        }
    }

    #[test]
    fn cursor_visits_every_slot_once() {
        let n = 3;
        let mut c = FrameCursor::new(n);
        let mut seen = vec![c.current()];
        for _ in 0..n - 1 {
            seen.push(c.advance());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn zero_length_cursor_stays_at_zero() {
        let mut c = FrameCursor::new(0);
        assert_eq!(c.slot_count(), 1);
        assert_eq!(c.advance(), 0);
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        Wait(usize),
        Acquire(usize),
        Record(usize, u32),
        Submit(usize, u32),
        Present(usize, u32),
        Reclaim(usize, u32),
        Rebuild(RenderSize),
        Idle,
    }

    /// Hands out images in a fixed order so image and slot can diverge.
    struct FakeBackend {
        slots: usize,
        images: Vec<u32>,
        next: usize,
        ops: Vec<Op>,
        out_of_date_on_acquire: Option<usize>,
    }

    impl FakeBackend {
        fn new(slots: usize, images: Vec<u32>) -> Self {
            Self {
                slots,
                images,
                next: 0,
                ops: Vec::new(),
                out_of_date_on_acquire: None,
            }
        }
    }

    impl FrameBackend for FakeBackend {
        fn slot_count(&self) -> usize {
            self.slots
        }

        fn wait_slot(&mut self, slot: usize) -> Result<(), FrameError> {
            self.ops.push(Op::Wait(slot));
            Ok(())
        }

        fn acquire(&mut self, slot: usize) -> Result<u32, FrameError> {
            self.ops.push(Op::Acquire(slot));
            let call = self.next;
            self.next += 1;
            if self.out_of_date_on_acquire == Some(call) {
                return Err(FrameError::OutOfDate {
                    call: "vkAcquireNextImageKHR",
                });
            }
            Ok(self.images[call % self.images.len()])
        }

        fn record(
            &mut self,
            slot: usize,
            image: u32,
            _app: &mut dyn Application,
        ) -> Result<vk::CommandBuffer, FrameError> {
            self.ops.push(Op::Record(slot, image));
            Ok(vk::CommandBuffer::from_raw(1000 + image as u64))
        }

        fn submit(
            &mut self,
            slot: usize,
            image: u32,
            _cmd: vk::CommandBuffer,
        ) -> Result<(), FrameError> {
            self.ops.push(Op::Submit(slot, image));
            Ok(())
        }

        fn present(&mut self, slot: usize, image: u32) -> Result<(), FrameError> {
            self.ops.push(Op::Present(slot, image));
            Ok(())
        }

        fn reclaim(
            &mut self,
            slot: usize,
            image: u32,
            cmd: vk::CommandBuffer,
        ) -> Result<(), FrameError> {
            assert_eq!(cmd.as_raw(), 1000 + image as u64);
            self.ops.push(Op::Reclaim(slot, image));
            Ok(())
        }

        fn rebuild(&mut self, size: RenderSize) -> Result<(), FrameError> {
            self.ops.push(Op::Rebuild(size));
            Ok(())
        }

        fn wait_idle(&mut self) -> Result<(), FrameError> {
            self.ops.push(Op::Idle);
            Ok(())
        }
    }

    /// Closes after `frames` polls; reports 0x0 while the poll count is in
    /// `minimized`.
    struct FakeHost {
        polls: usize,
        frames: usize,
        minimized: std::ops::Range<usize>,
    }

    impl FakeHost {
        fn closing_after(frames: usize) -> Self {
            Self {
                polls: 0,
                frames,
                minimized: 0..0,
            }
        }
    }

    impl WindowHost for FakeHost {
        fn poll_events(&mut self) {
            self.polls += 1;
        }

        fn should_close(&self) -> bool {
            self.polls >= self.frames
        }

        fn size(&self) -> RenderSize {
            if self.minimized.contains(&self.polls) {
                RenderSize::ZERO
            } else {
                RenderSize::new(640, 480)
            }
        }
    }

    impl HasWindowHandle for FakeHost {
        fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
            Err(HandleError::Unavailable)
        }
    }

    impl HasDisplayHandle for FakeHost {
        fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
            Err(HandleError::Unavailable)
        }
    }

    #[derive(Default)]
    struct CountingApp {
        attached: u32,
        updates: u32,
        detached: u32,
    }

    impl Application for CountingApp {
        fn on_attach(&mut self) {
            self.attached += 1;
        }

        fn on_update(&mut self) {
            assert_eq!(self.attached, 1);
            self.updates += 1;
        }

        fn on_render(&mut self, _frame: &RenderFrame<'_>) {}

        fn on_detach(&mut self) {
            self.detached += 1;
        }
    }

    #[test]
    fn one_frame_runs_every_step_in_order() {
        let mut backend = FakeBackend::new(2, vec![1]);
        let mut driver = FrameDriver::new(2);
        let mut app = CountingApp::default();

        driver.frame(&mut backend, &mut app).unwrap();

        assert_eq!(
            backend.ops,
            vec![
                Op::Wait(0),
                Op::Acquire(0),
                Op::Record(0, 1),
                Op::Submit(0, 1),
                Op::Present(0, 1),
                Op::Reclaim(0, 1),
            ]
        );
        assert_eq!(driver.cursor().current(), 1);
        assert_eq!(driver.frames(), 1);
    }

    #[test]
    fn sync_follows_cursor_while_targets_follow_image() {
        // Driver hands back images out of round-robin order.
        let mut backend = FakeBackend::new(3, vec![2, 0, 0, 1]);
        let mut host = FakeHost::closing_after(4);
        let mut app = CountingApp::default();

        let frames = run(&mut host, &mut backend, &mut app, OutOfDatePolicy::Fatal).unwrap();
        assert_eq!(frames, 4);

        let waits: Vec<_> = backend
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Wait(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(waits, vec![0, 1, 2, 0]);

        let records: Vec<_> = backend
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Record(s, i) => Some((*s, *i)),
                _ => None,
            })
            .collect();
        assert_eq!(records, vec![(0, 2), (1, 0), (2, 0), (0, 1)]);
        assert_eq!(backend.ops.last(), Some(&Op::Idle));
    }

    #[test]
    fn callbacks_fire_once_around_the_loop() {
        let mut backend = FakeBackend::new(2, vec![0, 1]);
        let mut host = FakeHost::closing_after(3);
        let mut app = CountingApp::default();

        run(&mut host, &mut backend, &mut app, OutOfDatePolicy::Fatal).unwrap();
        assert_eq!(app.attached, 1);
        assert_eq!(app.updates, 3);
        assert_eq!(app.detached, 1);
    }

    #[test]
    fn closed_host_runs_no_frames() {
        let mut backend = FakeBackend::new(2, vec![0]);
        let mut host = FakeHost::closing_after(0);
        let mut app = CountingApp::default();

        let frames = run(&mut host, &mut backend, &mut app, OutOfDatePolicy::Fatal).unwrap();
        assert_eq!(frames, 0);
        assert_eq!(backend.ops, vec![Op::Idle]);
        assert_eq!((app.attached, app.detached), (1, 1));
    }

    #[test]
    fn out_of_date_is_fatal_by_default() {
        let mut backend = FakeBackend::new(2, vec![0, 1]);
        backend.out_of_date_on_acquire = Some(1);
        let mut host = FakeHost::closing_after(5);
        let mut app = CountingApp::default();

        let err = run(&mut host, &mut backend, &mut app, OutOfDatePolicy::Fatal).unwrap_err();
        assert!(matches!(err, FrameError::OutOfDate { .. }));
        assert!(!backend.ops.iter().any(|op| matches!(op, Op::Rebuild(_))));
        assert_eq!(app.detached, 1);
    }

    #[test]
    fn rebuild_policy_restarts_the_ring() {
        let mut backend = FakeBackend::new(3, vec![0, 1, 2]);
        backend.out_of_date_on_acquire = Some(1);
        let mut host = FakeHost::closing_after(3);
        let mut app = CountingApp::default();

        let frames = run(&mut host, &mut backend, &mut app, OutOfDatePolicy::Rebuild).unwrap();
        // Frame 2 was abandoned at acquire.
        assert_eq!(frames, 2);
        assert_eq!(
            &backend.ops[6..],
            &[
                Op::Wait(1),
                Op::Acquire(1),
                Op::Rebuild(RenderSize::new(640, 480)),
                Op::Wait(0),
                Op::Acquire(0),
                Op::Record(0, 2),
                Op::Submit(0, 2),
                Op::Present(0, 2),
                Op::Reclaim(0, 2),
                Op::Idle,
            ]
        );
    }

    #[test]
    fn rebuild_waits_while_host_is_minimized() {
        let mut backend = FakeBackend::new(2, vec![0, 1]);
        backend.out_of_date_on_acquire = Some(1);
        let mut host = FakeHost {
            minimized: 3..5,
            ..FakeHost::closing_after(6)
        };
        let mut app = CountingApp::default();

        let frames = run(&mut host, &mut backend, &mut app, OutOfDatePolicy::Rebuild).unwrap();
        // Polls 3 and 4 see a zero-area window and skip the frame.
        assert_eq!(frames, 3);
        assert_eq!(app.updates, 6);
        let rebuilds: Vec<_> = backend
            .ops
            .iter()
            .filter(|op| matches!(op, Op::Rebuild(_)))
            .collect();
        assert_eq!(rebuilds, vec![&Op::Rebuild(RenderSize::new(640, 480))]);
        assert_eq!(
            &backend.ops[6..9],
            &[
                Op::Wait(1),
                Op::Acquire(1),
                Op::Rebuild(RenderSize::new(640, 480)),
            ]
        );
    }
}
