// SPDX-License-Identifier: CEPL-1.0
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const ZERO: RenderSize = RenderSize {
        width: 0,
        height: 0,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A zero-area size means the window is minimized or not yet mapped.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// The window side of the engine: event pumping, the close signal, and the
/// raw handles a graphics backend needs to build its surface.
///
/// Implementations are driven from the thread that owns the frame loop.
pub trait WindowHost: HasWindowHandle + HasDisplayHandle {
    /// Drain pending platform events without blocking.
    fn poll_events(&mut self);

    /// True once the user or the platform has asked the window to close.
    fn should_close(&self) -> bool;

    /// Current drawable size in physical pixels.
    fn size(&self) -> RenderSize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_area_sizes_are_empty() {
        assert!(RenderSize::ZERO.is_empty());
        assert!(RenderSize::new(640, 0).is_empty());
        assert!(RenderSize::new(0, 480).is_empty());
        assert!(!RenderSize::new(1, 1).is_empty());
    }
}
