//! Filter Registry
//!
//! Maps filter identifiers to stateless per-frame transforms. The registry is
//! built once and shared (behind an `Arc`) by whoever needs it, so tests can
//! hand the pipeline a smaller or customised set.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Block factor used by `pixelate` unless configured otherwise.
pub const DEFAULT_PIXELATE_BLOCK: u32 = 12;

/// Hysteresis thresholds for the `canny` filter on a 0-255 scale.
pub const CANNY_LOW_THRESHOLD: f32 = 100.0;
pub const CANNY_HIGH_THRESHOLD: f32 = 200.0;

const SEPIA_KERNEL: [[f32; 3]; 3] = [
    [0.393, 0.769, 0.189],
    [0.349, 0.686, 0.168],
    [0.272, 0.534, 0.131],
];

/// Output of a transform. Single-channel results are widened back to RGB
/// before encoding.
#[derive(Debug, Clone)]
pub enum FilteredFrame {
    Rgb(RgbImage),
    Luma(GrayImage),
}

impl FilteredFrame {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            FilteredFrame::Rgb(img) => img.dimensions(),
            FilteredFrame::Luma(img) => img.dimensions(),
        }
    }

    /// Converts the frame to three channels, replicating luma if needed.
    pub fn into_rgb(self) -> RgbImage {
        match self {
            FilteredFrame::Rgb(img) => img,
            FilteredFrame::Luma(img) => DynamicImage::ImageLuma8(img).to_rgb8(),
        }
    }
}

/// A pure function from one decoded frame to another of the same size.
pub trait FrameFilter: Send + Sync {
    fn apply(&self, frame: &RgbImage) -> FilteredFrame;
}

impl<F> FrameFilter for F
where
    F: Fn(&RgbImage) -> FilteredFrame + Send + Sync,
{
    fn apply(&self, frame: &RgbImage) -> FilteredFrame {
        self(frame)
    }
}

/// Returned when a filter identifier is not registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFilter(pub String);

impl fmt::Display for UnknownFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown filter '{}'", self.0)
    }
}

impl std::error::Error for UnknownFilter {}

/// Immutable mapping from identifier to transform.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    filters: BTreeMap<String, Arc<dyn FrameFilter>>,
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.filters.keys()).finish()
    }
}

impl FilterRegistry {
    /// A registry with no filters at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The five stock filters, with the default pixelate block size.
    pub fn standard() -> Self {
        Self::with_pixelate_block(DEFAULT_PIXELATE_BLOCK)
    }

    pub fn with_pixelate_block(block: u32) -> Self {
        Self::empty()
            .register("grayscale", |frame: &RgbImage| FilteredFrame::Luma(grayscale(frame)))
            .register("canny", |frame: &RgbImage| FilteredFrame::Luma(canny(frame)))
            .register("sepia", |frame: &RgbImage| FilteredFrame::Rgb(sepia(frame)))
            .register("pixelate", move |frame: &RgbImage| {
                FilteredFrame::Rgb(pixelate(frame, block))
            })
            .register("invert", |frame: &RgbImage| FilteredFrame::Rgb(invert(frame)))
    }

    /// Adds (or replaces) a filter. Only used while building the registry.
    pub fn register<F>(mut self, name: &str, filter: F) -> Self
    where
        F: FrameFilter + 'static,
    {
        self.filters.insert(name.to_string(), Arc::new(filter));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    /// Looks up a filter, failing with `UnknownFilter` for unregistered ids.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn FrameFilter>, UnknownFilter> {
        self.filters
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownFilter(name.to_string()))
    }

    /// Applies the named filter and returns a full-colour frame.
    pub fn transform(&self, name: &str, frame: &RgbImage) -> Result<RgbImage, UnknownFilter> {
        Ok(self.resolve(name)?.apply(frame).into_rgb())
    }
}

/// ITU-R BT.601 luma.
pub fn grayscale(frame: &RgbImage) -> GrayImage {
    GrayImage::from_fn(frame.width(), frame.height(), |x, y| {
        let Rgb([r, g, b]) = *frame.get_pixel(x, y);
        let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        Luma([luma.round().min(255.0) as u8])
    })
}

/// Binary edge map (0 or 255) of the frame's luma.
pub fn canny(frame: &RgbImage) -> GrayImage {
    imageproc::edges::canny(&grayscale(frame), CANNY_LOW_THRESHOLD, CANNY_HIGH_THRESHOLD)
}

/// Classic sepia tone, weights applied in RGB order; channels saturate at 255
/// instead of wrapping.
pub fn sepia(frame: &RgbImage) -> RgbImage {
    let mut out = frame.clone();
    for pixel in out.pixels_mut() {
        let src = pixel.0.map(f32::from);
        for (channel, row) in pixel.0.iter_mut().zip(SEPIA_KERNEL.iter()) {
            let value = row[0] * src[0] + row[1] * src[1] + row[2] * src[2];
            *channel = value.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Linear downscale by `block`, then nearest-neighbour upscale back.
pub fn pixelate(frame: &RgbImage, block: u32) -> RgbImage {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return frame.clone();
    }
    let block = block.max(1);
    let small_w = (width / block).max(1);
    let small_h = (height / block).max(1);
    let small = imageops::resize(frame, small_w, small_h, FilterType::Triangle);
    imageops::resize(&small, width, height, FilterType::Nearest)
}

/// Complement of every sample.
pub fn invert(frame: &RgbImage) -> RgbImage {
    let mut out = frame.clone();
    imageops::invert(&mut out);
    out
}
