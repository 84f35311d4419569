//! Encoded image payloads and the pure image operations applied to them before recognition.
//!
//! A `RasterPayload` is never edited in place: scaling and cropping decode it, operate on the
//! pixels and encode a new payload.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use base64::prelude::*;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use thiserror::Error;
use tracing::{debug, trace};

use crate::geometry::SelectionRect;

const DATA_URL_PREFIX: &str = "data:";
const BASE64_MARKER: &str = ";base64,";
const DEFAULT_MEDIA_TYPE: &str = "image/png";

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Failed to decode image: {0}")]
    Decode(String),
    #[error("Failed to render image: {0}")]
    Render(String),
}

/// Pixel width and height of a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Size limits applied before a full-surface capture is handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalePolicy {
    pub max_pixels: u64,
    pub max_dimension: u32,
}

impl ScalePolicy {
    pub const DEFAULT_MAX_PIXELS: u64 = 5_000_000;
    pub const DEFAULT_MAX_DIMENSION: u32 = 3000;
}

impl Default for ScalePolicy {
    fn default() -> Self {
        Self {
            max_pixels: Self::DEFAULT_MAX_PIXELS,
            max_dimension: Self::DEFAULT_MAX_DIMENSION,
        }
    }
}

/// An encoded image tagged with its media type. Cheap to clone.
#[derive(Clone, PartialEq, Eq)]
pub struct RasterPayload {
    media_type: String,
    bytes: Arc<[u8]>,
}

impl RasterPayload {
    pub fn new(media_type: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            media_type: media_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Wraps encoded bytes, sniffing the media type from their magic number.
    pub fn from_encoded(bytes: Vec<u8>) -> Result<Self, ImageError> {
        let format = image::guess_format(&bytes)
            .map_err(|e| ImageError::Decode(format!("Unknown image format: {e}")))?;
        Ok(Self::new(format.to_mime_type(), bytes))
    }

    /// Parses a `data:<media-type>;base64,<data>` URL.
    pub fn from_data_url(url: &str) -> Result<Self, ImageError> {
        let rest = url
            .strip_prefix(DATA_URL_PREFIX)
            .ok_or_else(|| ImageError::Decode("Not a data URL".into()))?;
        let (media_type, data) = rest
            .split_once(BASE64_MARKER)
            .ok_or_else(|| ImageError::Decode("Data URL is not base64 encoded".into()))?;
        let media_type = if media_type.is_empty() {
            DEFAULT_MEDIA_TYPE
        } else {
            media_type
        };
        let bytes = BASE64_STANDARD
            .decode(data.trim())
            .map_err(|e| ImageError::Decode(format!("Invalid base64 payload: {e}")))?;
        Ok(Self::new(media_type, bytes))
    }

    pub fn to_data_url(&self) -> String {
        format!(
            "{DATA_URL_PREFIX}{}{BASE64_MARKER}{}",
            self.media_type,
            BASE64_STANDARD.encode(&self.bytes)
        )
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn format(&self) -> Option<ImageFormat> {
        ImageFormat::from_mime_type(&self.media_type)
    }

    fn decode(&self) -> Result<DynamicImage, ImageError> {
        let mut reader = ImageReader::new(Cursor::new(self.bytes()));
        match self.format() {
            Some(format) => reader.set_format(format),
            None => {
                reader = reader
                    .with_guessed_format()
                    .map_err(|e| ImageError::Decode(e.to_string()))?;
            }
        }
        reader
            .decode()
            .map_err(|e| ImageError::Decode(e.to_string()))
    }
}

impl fmt::Debug for RasterPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasterPayload")
            .field("media_type", &self.media_type)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl serde::Serialize for RasterPayload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_data_url())
    }
}

impl<'de> serde::Deserialize<'de> for RasterPayload {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let url = String::deserialize(deserializer)?;
        Self::from_data_url(&url).map_err(serde::de::Error::custom)
    }
}

/// Reads the pixel size of `payload` from its header without decoding the pixels.
pub fn decode_image_dimensions(payload: &RasterPayload) -> Result<Dimensions, ImageError> {
    let mut reader = ImageReader::new(Cursor::new(payload.bytes()));
    match payload.format() {
        Some(format) => reader.set_format(format),
        None => {
            reader = reader
                .with_guessed_format()
                .map_err(|e| ImageError::Decode(e.to_string()))?;
        }
    }
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| ImageError::Decode(e.to_string()))?;
    Ok(Dimensions { width, height })
}

/// Scale factor in `(0, 1]` that brings an image within both limits.
///
/// The pixel budget is applied first, then each dimension limit independently, since a wide
/// and short image can overflow `max_dimension` while staying under `max_pixels`.
pub fn compute_downscale(width: u32, height: u32, max_pixels: u64, max_dimension: u32) -> f64 {
    if width == 0 || height == 0 {
        return 1.0;
    }
    let pixels = u64::from(width) * u64::from(height);
    if pixels <= max_pixels && width <= max_dimension && height <= max_dimension {
        return 1.0;
    }

    let max_dimension = f64::from(max_dimension.max(1));
    let (w, h) = (f64::from(width), f64::from(height));

    let mut scale = (max_pixels.max(1) as f64 / pixels as f64).sqrt().min(1.0);
    if w * scale > max_dimension {
        scale = max_dimension / w;
    }
    if h * scale > max_dimension {
        scale = max_dimension / h;
    }
    scale
}

/// Target size for `dimensions` under `scale`. Rounds down so the limits hold after rounding.
pub fn scaled_dimensions(dimensions: Dimensions, scale: f64) -> Dimensions {
    let apply = |v: u32| ((f64::from(v) * scale).floor() as u32).max(1);
    Dimensions {
        width: apply(dimensions.width),
        height: apply(dimensions.height),
    }
}

/// Produces a new payload resized to exactly `new_width x new_height`.
pub fn render_scaled(
    payload: &RasterPayload,
    new_width: u32,
    new_height: u32,
) -> Result<RasterPayload, ImageError> {
    if new_width == 0 || new_height == 0 {
        return Err(ImageError::Render(format!(
            "Cannot render to an empty {new_width}x{new_height} surface"
        )));
    }
    let image = payload.decode()?;
    debug!(
        from_width = image.width(),
        from_height = image.height(),
        to_width = new_width,
        to_height = new_height,
        "Scaling image"
    );
    let scaled = image.resize_exact(new_width, new_height, FilterType::Triangle);
    encode(&scaled, payload)
}

/// Produces a new payload holding exactly the pixels inside `rect`.
///
/// `rect` is in `payload`'s own pixel grid; callers apply the device pixel ratio beforehand.
pub fn crop_region(payload: &RasterPayload, rect: SelectionRect) -> Result<RasterPayload, ImageError> {
    let image = payload.decode()?;
    let fits = u64::from(rect.x) + u64::from(rect.width) <= u64::from(image.width())
        && u64::from(rect.y) + u64::from(rect.height) <= u64::from(image.height());
    if rect.is_empty() || !fits {
        return Err(ImageError::Render(format!(
            "Crop {}x{}+{}+{} does not fit a {}x{} image",
            rect.width,
            rect.height,
            rect.x,
            rect.y,
            image.width(),
            image.height()
        )));
    }
    trace!(?rect, "Cropping image");
    let cropped = image.crop_imm(rect.x, rect.y, rect.width, rect.height);
    encode(&cropped, payload)
}

/// Re-encodes in the source format when it can be written, PNG otherwise.
fn encode(image: &DynamicImage, source: &RasterPayload) -> Result<RasterPayload, ImageError> {
    let format = source
        .format()
        .filter(|f| matches!(f, ImageFormat::Png | ImageFormat::Jpeg))
        .unwrap_or(ImageFormat::Png);
    let image = if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(image.to_rgb8())
    } else {
        image.clone()
    };

    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), format)
        .map_err(|e| ImageError::Render(e.to_string()))?;
    Ok(RasterPayload::new(format.to_mime_type(), buf))
}

#[cfg(test)]
pub(crate) fn test_png(width: u32, height: u32) -> RasterPayload {
    let image = image::RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("encode test png");
    RasterPayload::new("image/png", buf)
}
