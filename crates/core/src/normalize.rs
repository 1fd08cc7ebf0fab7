//! Frame normalizer: decode any supported raster and contain it, centered,
//! inside a fixed canvas so every frame of an animation shares one size.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use tracing::debug;

use crate::error::DecodeError;
use crate::types::{Background, Frame, RasterBuffer};

const RESAMPLE_FILTER: FilterType = FilterType::Triangle;

/// Placement of a scaled image inside the target canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Largest aspect-preserving box that fits `target`, centered with
/// `floor((target - scaled) / 2)` offsets. Never collapses below 1 px.
pub fn contain_rect(src_w: u32, src_h: u32, target_w: u32, target_h: u32) -> ContainRect {
    let scale = f64::min(
        target_w as f64 / src_w.max(1) as f64,
        target_h as f64 / src_h.max(1) as f64,
    );
    let width = ((src_w as f64 * scale).round() as u32).clamp(1, target_w);
    let height = ((src_h as f64 * scale).round() as u32).clamp(1, target_h);

    ContainRect {
        x: (target_w - width) / 2,
        y: (target_h - height) / 2,
        width,
        height,
    }
}

/// Decode `frame.source` and letterbox it into a `target_w x target_h` canvas.
///
/// Deterministic for identical inputs; keeps no state between calls.
pub fn normalize(
    frame: &Frame,
    target_w: u32,
    target_h: u32,
    background: Background,
) -> Result<RasterBuffer, DecodeError> {
    let decoded = image::load_from_memory(&frame.source)
        .map_err(|source| DecodeError {
            frame_id: frame.id.clone(),
            source,
        })?
        .to_rgba8();

    let (src_w, src_h) = decoded.dimensions();
    let rect = contain_rect(src_w, src_h, target_w, target_h);
    debug!(
        frame_id = %frame.id,
        src_w,
        src_h,
        fit_w = rect.width,
        fit_h = rect.height,
        "Normalizing frame"
    );

    let scaled = if (rect.width, rect.height) == (src_w, src_h) {
        decoded
    } else {
        imageops::resize(&decoded, rect.width, rect.height, RESAMPLE_FILTER)
    };

    let mut canvas = RgbaImage::from_pixel(target_w, target_h, Rgba(background.rgba()));
    match background {
        // Copy pixels verbatim so source alpha survives on a transparent canvas.
        Background::Transparent => {
            imageops::replace(&mut canvas, &scaled, i64::from(rect.x), i64::from(rect.y))
        }
        Background::Rgb(_) => {
            imageops::overlay(&mut canvas, &scaled, i64::from(rect.x), i64::from(rect.y))
        }
    }

    let (width, height) = canvas.dimensions();
    RasterBuffer::from_rgba(width, height, canvas.into_raw()).ok_or_else(|| DecodeError {
        frame_id: frame.id.clone(),
        source: image::ImageError::Limits(image::error::LimitError::from_kind(
            image::error::LimitErrorKind::DimensionError,
        )),
    })
}
