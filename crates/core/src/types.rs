use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::PipelineError;

pub const DEFAULT_DELAY_MS: u32 = 100;
pub const DEFAULT_WIDTH: u32 = 500;
pub const DEFAULT_HEIGHT: u32 = 500;
pub const DEFAULT_QUALITY: u8 = 10;
pub const MIN_QUALITY: u8 = 1;
pub const MAX_QUALITY: u8 = 30;
/// GIF logical screen dimensions are 16-bit.
pub const MAX_DIMENSION: u32 = u16::MAX as u32;
/// Hard ceiling on `width * height`. Every normalized frame holds a full
/// RGBA canvas, so this bounds memory per frame at 64 MiB.
pub const MAX_CANVAS_PIXELS: u64 = 4096 * 4096;

/// Opaque frame identifier. Freshly generated ids are UUIDs, so an id is
/// never handed out twice even after the frame it named was removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(String);

impl FrameId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for FrameId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for FrameId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One input image plus its display delay.
///
/// The raw bytes are shared, not copied: the pipeline holds a clone of the
/// `Arc` only while a job runs and drops it when the job terminates.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub source: Arc<[u8]>,
    pub delay_ms: u32,
}

impl Frame {
    pub fn new(source: impl Into<Arc<[u8]>>, delay_ms: u32) -> Self {
        Self::with_id(FrameId::generate(), source, delay_ms)
    }

    pub fn with_id(id: FrameId, source: impl Into<Arc<[u8]>>, delay_ms: u32) -> Self {
        Self {
            id,
            source: source.into(),
            delay_ms,
        }
    }
}

/// Color-sampling interval for palette construction.
///
/// `1` examines every pixel (most accurate palette, slowest); larger values
/// sample sparser and run faster, up to `30`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Quality(u8);

impl Quality {
    pub fn new(value: u8) -> Result<Self, PipelineError> {
        if (MIN_QUALITY..=MAX_QUALITY).contains(&value) {
            Ok(Self(value))
        } else {
            Err(PipelineError::InvalidRequest(format!(
                "quality must be within {MIN_QUALITY}..={MAX_QUALITY}, got {value}"
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn sample_factor(self) -> i32 {
        i32::from(self.0)
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(DEFAULT_QUALITY)
    }
}

impl TryFrom<u8> for Quality {
    type Error = PipelineError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quality> for u8 {
    fn from(value: Quality) -> Self {
        value.0
    }
}

/// Per-job configuration shared by every frame of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeOptions {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub quality: Quality,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            quality: Quality::default(),
        }
    }
}

impl EncodeOptions {
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 || value > MAX_DIMENSION {
                return Err(PipelineError::InvalidRequest(format!(
                    "{name} must be within 1..={MAX_DIMENSION}, got {value}"
                )));
            }
        }
        self.check_canvas_budget(MAX_CANVAS_PIXELS)
    }

    pub fn canvas_pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Reject canvases larger than `max_pixels`.
    pub fn check_canvas_budget(&self, max_pixels: u64) -> Result<(), PipelineError> {
        let pixels = self.canvas_pixels();
        if pixels > max_pixels {
            return Err(PipelineError::InvalidRequest(format!(
                "canvas {}x{} has {pixels} pixels, limit is {max_pixels}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Letterbox fill used around a contained image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Background {
    #[default]
    Transparent,
    Rgb([u8; 3]),
}

impl Background {
    pub fn rgba(self) -> [u8; 4] {
        match self {
            Self::Transparent => [0, 0, 0, 0],
            Self::Rgb([r, g, b]) => [r, g, b, 0xFF],
        }
    }
}

impl FromStr for Background {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("transparent") || trimmed.is_empty() {
            return Ok(Self::Transparent);
        }

        let hex = trimmed
            .strip_prefix('#')
            .ok_or_else(|| format!("background must be 'transparent' or '#rrggbb', got '{raw}'"))?;
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(format!("background color must have 6 hex digits, got '{raw}'"));
        }

        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16)
                .map_err(|e| format!("invalid background color '{raw}': {e}"))
        };
        Ok(Self::Rgb([channel(0..2)?, channel(2..4)?, channel(4..6)?]))
    }
}

impl fmt::Display for Background {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transparent => f.write_str("transparent"),
            Self::Rgb([r, g, b]) => write!(f, "#{r:02x}{g:02x}{b:02x}"),
        }
    }
}

impl Serialize for Background {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Background {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Normalized RGBA8 pixels of exactly `width * height` pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterBuffer {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

impl RasterBuffer {
    pub fn from_rgba(width: u32, height: u32, rgba: Vec<u8>) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(4)?;
        (rgba.len() == expected).then_some(Self {
            width,
            height,
            rgba,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn rgba(&self) -> &[u8] {
        &self.rgba
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// A raster paired with the delay it is displayed for.
#[derive(Debug, Clone)]
pub struct NormalizedFrame {
    pub raster: RasterBuffer,
    pub delay_ms: u32,
}

/// Rejects requests the pipeline must never start on.
pub fn validate_request(frames: &[Frame], options: &EncodeOptions) -> Result<(), PipelineError> {
    if frames.is_empty() {
        return Err(PipelineError::InvalidRequest(
            "at least one frame is required".to_string(),
        ));
    }

    if let Some((index, frame)) = frames.iter().enumerate().find(|(_, f)| f.delay_ms == 0) {
        return Err(PipelineError::InvalidRequest(format!(
            "frame {index} ({}) has a zero delay; delays must be positive",
            frame.id
        )));
    }

    options.validate()
}
