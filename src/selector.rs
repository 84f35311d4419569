//! Interactive region selector.
//!
//! Runs inside the target surface: mounts a dimming overlay, tracks a pointer drag and emits
//! the resulting device-scaled rectangle to the capture relay. One selector per surface may be
//! active at a time; the shared `active` flag makes a second activation a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::geometry::{scale_selection_for_device_pixel_ratio, CssRect, Point, SelectionRect};
use crate::relay::{RelayEnvelope, RelayMessage};
use crate::system::SurfaceTarget;

/// Selections narrower or shorter than this (in CSS pixels) are treated as accidental clicks.
pub const MIN_SELECTION_SIZE: f64 = 10.0;

pub const INSTRUCTIONS: &str = "Drag to select a region to read. Press Esc to cancel.";

/// Logical size and pixel density of the surface the overlay covers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    pub device_pixel_ratio: f64,
}

/// Rendering primitives of the host surface.
///
/// `mount` puts up the dimming layer, crosshair cursor and instructions banner and starts
/// routing input to the selector; `unmount` must remove every element and input route again.
pub trait OverlayHost: Send {
    fn viewport(&self) -> Viewport;
    fn mount(&mut self, instructions: &str);
    fn draw_selection(&mut self, rect: CssRect);
    fn unmount(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointerEvent {
    Down(Point),
    Move(Point),
    Up(Point),
    Escape,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectorState {
    Idle,
    Dragging { anchor: Point },
    Committed(SelectionRect),
    Cancelled,
}

pub struct RegionSelector<H: OverlayHost> {
    host: H,
    state: SelectorState,
    active: Arc<AtomicBool>,
    mounted: bool,
    origin: SurfaceTarget,
    outbox: mpsc::Sender<RelayEnvelope>,
}

impl<H: OverlayHost> RegionSelector<H> {
    /// Mounts the overlay, or returns `None` when a selector is already active for `active`.
    pub fn activate(
        mut host: H,
        active: Arc<AtomicBool>,
        origin: SurfaceTarget,
        outbox: mpsc::Sender<RelayEnvelope>,
    ) -> Option<Self> {
        if active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(tab_id = origin.tab_id, "Region selector already active");
            return None;
        }

        host.mount(INSTRUCTIONS);
        debug!(tab_id = origin.tab_id, "Region selector activated");
        Some(Self {
            host,
            state: SelectorState::Idle,
            active,
            mounted: true,
            origin,
            outbox,
        })
    }

    pub fn state(&self) -> SelectorState {
        self.state
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            SelectorState::Committed(_) | SelectorState::Cancelled
        )
    }

    pub fn handle_event(&mut self, event: PointerEvent) -> SelectorState {
        // Input routes are gone once torn down.
        if !self.mounted {
            return self.state;
        }

        match (self.state, event) {
            (_, PointerEvent::Escape) => {
                debug!("Region selection cancelled with Escape");
                self.finish(SelectorState::Cancelled);
            }
            (SelectorState::Idle, PointerEvent::Down(point)) => {
                self.state = SelectorState::Dragging { anchor: point };
                self.host.draw_selection(CssRect::from_corners(point, point));
            }
            (SelectorState::Dragging { anchor }, PointerEvent::Move(point)) => {
                self.host.draw_selection(CssRect::from_corners(anchor, point));
            }
            (SelectorState::Dragging { anchor }, PointerEvent::Up(point)) => {
                self.commit(anchor, point);
            }
            _ => {}
        }
        self.state
    }

    fn commit(&mut self, anchor: Point, release: Point) {
        let rect = CssRect::from_corners(anchor, release);
        if rect.width < MIN_SELECTION_SIZE || rect.height < MIN_SELECTION_SIZE {
            debug!(
                width = rect.width,
                height = rect.height,
                "Selection too small, discarding"
            );
            self.finish(SelectorState::Cancelled);
            return;
        }

        let viewport = self.host.viewport();
        let clamped = rect.clamp_to(viewport.width, viewport.height);
        let selection = scale_selection_for_device_pixel_ratio(clamped, viewport.device_pixel_ratio);
        if selection.is_empty() {
            debug!("Selection lies outside the viewport, discarding");
            self.finish(SelectorState::Cancelled);
            return;
        }

        self.finish(SelectorState::Committed(selection));
        info!(
            rect = ?selection,
            device_pixel_ratio = viewport.device_pixel_ratio,
            "Region selected"
        );

        let envelope = RelayEnvelope {
            sender: self.origin.clone(),
            message: RelayMessage::RegionSelected { rect: selection },
        };
        if let Err(e) = self.outbox.try_send(envelope) {
            warn!(error = %e, "Failed to deliver selection to the capture relay");
        }
    }

    fn finish(&mut self, state: SelectorState) {
        self.teardown();
        self.state = state;
    }

    fn teardown(&mut self) {
        if self.mounted {
            self.host.unmount();
            self.mounted = false;
            self.active.store(false, Ordering::SeqCst);
        }
    }
}

impl<H: OverlayHost> Drop for RegionSelector<H> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Overlay with no display, for scripted selections. Records what would have been drawn.
#[derive(Debug, Clone)]
pub struct HeadlessOverlay {
    viewport: Viewport,
    mounted: bool,
    last_selection: Option<CssRect>,
}

impl HeadlessOverlay {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            viewport,
            mounted: false,
            last_selection: None,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn last_selection(&self) -> Option<CssRect> {
        self.last_selection
    }
}

impl OverlayHost for HeadlessOverlay {
    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn mount(&mut self, instructions: &str) {
        debug!(instructions, "Overlay mounted");
        self.mounted = true;
    }

    fn draw_selection(&mut self, rect: CssRect) {
        self.last_selection = Some(rect);
    }

    fn unmount(&mut self) {
        debug!("Overlay removed");
        self.mounted = false;
        self.last_selection = None;
    }
}
