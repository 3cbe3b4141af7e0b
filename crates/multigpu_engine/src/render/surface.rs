//! Presentation surface seam
//!
//! Windowing lives outside the library. The frame loop only needs the
//! framebuffer size, a way to drain window events and a close flag.

use std::collections::VecDeque;

use crate::render::hal::Extent2D;

/// Window events the frame loop reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// Framebuffer resized
    Resized(Extent2D),
    /// User asked to close the window
    CloseRequested,
}

/// Something frames are presented to
pub trait PresentationSurface {
    /// Current framebuffer size in pixels
    fn framebuffer_extent(&self) -> Extent2D;

    /// Poll the windowing system and return pending events
    fn pump_events(&mut self) -> Vec<SurfaceEvent>;

    /// Whether the surface has been closed
    fn should_close(&self) -> bool;

    /// Block until something happens; called while the surface is minimized
    fn wait_events(&mut self) {
        std::thread::yield_now();
    }
}

/// Scripted surface for offscreen runs
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    extent: Extent2D,
    events: VecDeque<SurfaceEvent>,
    close_after: Option<u64>,
    pumped: u64,
    closed: bool,
}

impl HeadlessSurface {
    /// Surface of the given size
    pub fn new(extent: Extent2D) -> Self {
        Self {
            extent,
            ..Self::default()
        }
    }

    /// Close once `pumps` event polls have happened
    pub fn close_after(mut self, pumps: u64) -> Self {
        self.close_after = Some(pumps);
        self
    }

    /// Queue a resize delivered on the next poll
    pub fn resize(&mut self, extent: Extent2D) {
        self.events.push_back(SurfaceEvent::Resized(extent));
    }

    /// Queue a close request
    pub fn request_close(&mut self) {
        self.events.push_back(SurfaceEvent::CloseRequested);
    }

    /// Number of event polls so far
    pub fn pump_count(&self) -> u64 {
        self.pumped
    }
}

impl PresentationSurface for HeadlessSurface {
    fn framebuffer_extent(&self) -> Extent2D {
        self.extent
    }

    fn pump_events(&mut self) -> Vec<SurfaceEvent> {
        self.pumped += 1;
        if self.close_after.is_some_and(|limit| self.pumped > limit) {
            self.closed = true;
        }
        let events: Vec<SurfaceEvent> = self.events.drain(..).collect();
        for event in &events {
            match event {
                SurfaceEvent::Resized(extent) => self.extent = *extent,
                SurfaceEvent::CloseRequested => self.closed = true,
            }
        }
        events
    }

    fn should_close(&self) -> bool {
        self.closed
    }
}
