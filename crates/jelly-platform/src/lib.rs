// SPDX-License-Identifier: CEPL-1.0
//! winit-backed window host.
//!
//! The engine owns its frame loop, so instead of handing control to
//! `EventLoop::run_app` the display pumps the event loop once per frame
//! through `EventLoopExtPumpEvents`.

use std::time::Duration;

use jelly_render::{RenderSize, WindowHost};
use thiserror::Error;
use tracing::{debug, info};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::error::{EventLoopError, OsError};
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use winit::window::{Fullscreen, Window, WindowAttributes, WindowId};

pub use winit;

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("failed to create event loop: {0}")]
    EventLoop(#[from] EventLoopError),

    #[error("failed to create window: {0}")]
    CreateWindow(#[from] OsError),

    #[error("event loop exited with code {0} before the window was created")]
    ExitedEarly(i32),
}

#[derive(Clone, Debug)]
pub struct DisplayConfig {
    pub title: String,
    pub size: RenderSize,
    pub fullscreen: bool,
    pub resizable: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            title: "Jelly".to_owned(),
            size: RenderSize::new(1280, 720),
            fullscreen: false,
            // Resizing invalidates the swapchain; opt in where the engine
            // rebuilds it.
            resizable: false,
        }
    }
}

impl DisplayConfig {
    fn attributes(&self) -> WindowAttributes {
        let mut attrs = Window::default_attributes()
            .with_title(self.title.clone())
            .with_inner_size(PhysicalSize::new(self.size.width, self.size.height))
            .with_resizable(self.resizable);
        if self.fullscreen {
            attrs = attrs.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }
        attrs
    }
}

struct DisplayState {
    attributes: WindowAttributes,
    window: Option<Window>,
    create_error: Option<OsError>,
    close_requested: bool,
    size: PhysicalSize<u32>,
}

impl ApplicationHandler for DisplayState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => {
                self.size = window.inner_size();
                self.window = Some(window);
            }
            Err(e) => self.create_error = Some(e),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window.id() != id {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                info!("close requested");
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                debug!("resized → {}x{}", size.width, size.height);
                self.size = size;
            }
            _ => {}
        }
    }
}

/// A single native window plus the event loop that feeds it.
///
/// `state` is declared before `event_loop` so the window is dropped first.
pub struct Display {
    state: DisplayState,
    event_loop: EventLoop<()>,
}

impl Display {
    /// Create the event loop and pump it until the window exists.
    pub fn new(cfg: &DisplayConfig) -> Result<Self, DisplayError> {
        let mut event_loop = EventLoop::new()?;
        let mut state = DisplayState {
            attributes: cfg.attributes(),
            window: None,
            create_error: None,
            close_requested: false,
            size: PhysicalSize::new(cfg.size.width, cfg.size.height),
        };

        while state.window.is_none() {
            let status = event_loop.pump_app_events(Some(Duration::ZERO), &mut state);
            if let Some(e) = state.create_error.take() {
                return Err(DisplayError::CreateWindow(e));
            }
            if let PumpStatus::Exit(code) = status {
                return Err(DisplayError::ExitedEarly(code));
            }
        }

        info!(
            "window \"{}\" ready ({}x{})",
            cfg.title, state.size.width, state.size.height
        );
        Ok(Self { state, event_loop })
    }
}

impl WindowHost for Display {
    fn poll_events(&mut self) {
        if let PumpStatus::Exit(code) = self
            .event_loop
            .pump_app_events(Some(Duration::ZERO), &mut self.state)
        {
            debug!("event loop exit ({code})");
            self.state.close_requested = true;
        }
    }

    fn should_close(&self) -> bool {
        self.state.close_requested
    }

    fn size(&self) -> RenderSize {
        RenderSize::new(self.state.size.width, self.state.size.height)
    }
}

impl HasWindowHandle for Display {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.state
            .window
            .as_ref()
            .ok_or(HandleError::Unavailable)?
            .window_handle()
    }
}

impl HasDisplayHandle for Display {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.event_loop.display_handle()
    }
}
