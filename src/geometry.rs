//! Rectangle types and coordinate transforms shared by the selector, relay and controller.
//!
//! Two coordinate spaces exist: the logical (CSS) space the overlay measures pointer positions
//! in, and the physical raster space of a captured image. `CssRect` lives in the former,
//! `SelectionRect` in the latter; `scale_selection_for_device_pixel_ratio` is the only bridge.

use serde::{Deserialize, Serialize};

/// A point in logical (CSS) pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Rectangle in logical (CSS) pixels, as measured by the region overlay.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CssRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl CssRect {
    /// Normalized rectangle spanned by two corners, whichever direction the drag went.
    pub fn from_corners(a: Point, b: Point) -> Self {
        let left = a.x.min(b.x);
        let top = a.y.min(b.y);
        Self {
            x: left,
            y: top,
            width: a.x.max(b.x) - left,
            height: a.y.max(b.y) - top,
        }
    }

    /// Clips the rectangle to `[0, max_width] x [0, max_height]`.
    pub fn clamp_to(&self, max_width: f64, max_height: f64) -> Self {
        let x = self.x.clamp(0.0, max_width);
        let y = self.y.clamp(0.0, max_height);
        let right = (self.x + self.width).clamp(x, max_width);
        let bottom = (self.y + self.height).clamp(y, max_height);
        Self {
            x,
            y,
            width: right - x,
            height: bottom - y,
        }
    }
}

/// Rectangle in the pixel grid of a rasterized capture (device pixel ratio already applied).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SelectionRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SelectionRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Multiplies every field by `device_pixel_ratio` and rounds to the nearest integer.
///
/// Non-finite or non-positive ratios are treated as 1.0; negative coordinates saturate at 0.
pub fn scale_selection_for_device_pixel_ratio(
    css_rect: CssRect,
    device_pixel_ratio: f64,
) -> SelectionRect {
    let ratio = if device_pixel_ratio.is_finite() && device_pixel_ratio > 0.0 {
        device_pixel_ratio
    } else {
        1.0
    };
    let scale = |v: f64| -> u32 { (v * ratio).round().clamp(0.0, f64::from(u32::MAX)) as u32 };
    SelectionRect {
        x: scale(css_rect.x),
        y: scale(css_rect.y),
        width: scale(css_rect.width),
        height: scale(css_rect.height),
    }
}

/// Clamps `rect` so that it lies inside a `max_width x max_height` image.
///
/// The origin is pulled inside the bounds first; width and height are then cut so the far
/// edges do not pass `max_width` / `max_height`. The result may be empty when the origin sits
/// on the far edge.
pub fn clamp_rect_to_bounds(rect: SelectionRect, max_width: u32, max_height: u32) -> SelectionRect {
    let x = rect.x.min(max_width);
    let y = rect.y.min(max_height);
    SelectionRect {
        x,
        y,
        width: rect.width.min(max_width - x),
        height: rect.height.min(max_height - y),
    }
}
