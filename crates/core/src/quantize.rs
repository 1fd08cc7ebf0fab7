//! Palette construction and pixel-to-index mapping.

use std::collections::HashMap;

use color_quant::NeuQuant;
use tracing::trace;

use crate::types::{Quality, RasterBuffer};

pub const MAX_PALETTE_COLORS: usize = 256;
/// Pixels below this alpha map to the transparent index.
pub const ALPHA_THRESHOLD: u8 = 128;

/// A frame reduced to at most 256 colors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFrame {
    /// Packed RGB triplets.
    pub palette: Vec<u8>,
    pub indices: Vec<u8>,
    pub transparent: Option<u8>,
}

impl IndexedFrame {
    pub fn color_count(&self) -> usize {
        self.palette.len() / 3
    }
}

/// Build a local palette for `raster` and map every pixel onto it.
///
/// Rasters whose opaque colors fit in the palette get an exact palette;
/// anything else goes through NeuQuant with `quality` as its sampling factor.
pub fn quantize(raster: &RasterBuffer, quality: Quality) -> IndexedFrame {
    let pixels = raster.rgba();
    let has_transparency = pixels
        .chunks_exact(4)
        .any(|px| px[3] < ALPHA_THRESHOLD);
    let capacity = if has_transparency {
        MAX_PALETTE_COLORS - 1
    } else {
        MAX_PALETTE_COLORS
    };

    let mut indexed = match exact_palette(pixels, capacity) {
        Some(indexed) => {
            trace!(colors = indexed.color_count(), "Exact palette");
            indexed
        }
        None => {
            let indexed = neuquant_palette(pixels, capacity, quality);
            trace!(
                colors = indexed.color_count(),
                sample_factor = quality.sample_factor(),
                "NeuQuant palette"
            );
            indexed
        }
    };

    if has_transparency {
        let transparent = indexed.color_count() as u8;
        indexed.palette.extend_from_slice(&[0, 0, 0]);
        for (slot, px) in indexed.indices.iter_mut().zip(pixels.chunks_exact(4)) {
            if px[3] < ALPHA_THRESHOLD {
                *slot = transparent;
            }
        }
        indexed.transparent = Some(transparent);
    }

    indexed
}

fn exact_palette(pixels: &[u8], capacity: usize) -> Option<IndexedFrame> {
    let mut lookup: HashMap<[u8; 3], u8> = HashMap::new();
    let mut palette = Vec::new();
    let mut indices = Vec::with_capacity(pixels.len() / 4);

    for px in pixels.chunks_exact(4) {
        if px[3] < ALPHA_THRESHOLD {
            indices.push(0);
            continue;
        }

        let rgb = [px[0], px[1], px[2]];
        let index = match lookup.get(&rgb) {
            Some(index) => *index,
            None => {
                if lookup.len() == capacity {
                    return None;
                }
                let index = lookup.len() as u8;
                lookup.insert(rgb, index);
                palette.extend_from_slice(&rgb);
                index
            }
        };
        indices.push(index);
    }

    Some(IndexedFrame {
        palette,
        indices,
        transparent: None,
    })
}

fn neuquant_palette(pixels: &[u8], capacity: usize, quality: Quality) -> IndexedFrame {
    let opaque: Vec<u8> = pixels
        .chunks_exact(4)
        .filter(|px| px[3] >= ALPHA_THRESHOLD)
        .flat_map(|px| [px[0], px[1], px[2], 0xFF])
        .collect();

    let quantizer = NeuQuant::new(quality.sample_factor(), capacity, &opaque);
    let palette = quantizer.color_map_rgb();

    let mut memo: HashMap<[u8; 3], u8> = HashMap::new();
    let indices = pixels
        .chunks_exact(4)
        .map(|px| {
            if px[3] < ALPHA_THRESHOLD {
                return 0;
            }
            let rgb = [px[0], px[1], px[2]];
            *memo
                .entry(rgb)
                .or_insert_with(|| quantizer.index_of(&[rgb[0], rgb[1], rgb[2], 0xFF]) as u8)
        })
        .collect();

    IndexedFrame {
        palette,
        indices,
        transparent: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster_from_fn(w: u32, h: u32, f: impl Fn(u32, u32) -> [u8; 4]) -> RasterBuffer {
        let mut rgba = Vec::with_capacity((w * h * 4) as usize);
        for y in 0..h {
            for x in 0..w {
                rgba.extend_from_slice(&f(x, y));
            }
        }
        RasterBuffer::from_rgba(w, h, rgba).unwrap()
    }

    #[test]
    fn few_colors_get_an_exact_palette() {
        let raster = raster_from_fn(4, 4, |x, _| {
            if x < 2 {
                [255, 0, 0, 255]
            } else {
                [0, 0, 255, 255]
            }
        });

        let indexed = quantize(&raster, Quality::default());
        assert_eq!(indexed.palette, vec![255, 0, 0, 0, 0, 255]);
        assert_eq!(indexed.transparent, None);
        assert_eq!(&indexed.indices[..4], &[0, 0, 1, 1]);
    }

    #[test]
    fn transparent_pixels_map_to_reserved_index() {
        let raster = raster_from_fn(2, 2, |x, y| {
            if (x, y) == (0, 0) {
                [10, 20, 30, 0]
            } else {
                [200, 100, 50, 255]
            }
        });

        let indexed = quantize(&raster, Quality::default());
        assert_eq!(indexed.transparent, Some(1));
        assert_eq!(indexed.indices, vec![1, 0, 0, 0]);
        assert_eq!(indexed.color_count(), 2);
    }

    #[test]
    fn fully_transparent_raster_still_has_a_palette() {
        let raster = raster_from_fn(3, 3, |_, _| [0, 0, 0, 0]);
        let indexed = quantize(&raster, Quality::default());
        assert_eq!(indexed.transparent, Some(0));
        assert_eq!(indexed.palette, vec![0, 0, 0]);
        assert!(indexed.indices.iter().all(|i| *i == 0));
    }

    #[test]
    fn many_colors_are_reduced_to_palette_capacity() {
        let raster = raster_from_fn(64, 64, |x, y| [(x * 4) as u8, (y * 4) as u8, 128, 255]);

        let indexed = quantize(&raster, Quality::new(1).unwrap());
        assert!(indexed.color_count() <= MAX_PALETTE_COLORS);
        assert_eq!(indexed.indices.len(), 64 * 64);
        assert!(indexed
            .indices
            .iter()
            .all(|i| (*i as usize) < indexed.color_count()));
    }

    #[test]
    fn many_colors_with_transparency_leave_room_for_transparent_index() {
        let raster = raster_from_fn(64, 64, |x, y| {
            let alpha = if x == 0 { 0 } else { 255 };
            [(x * 4) as u8, (y * 4) as u8, 77, alpha]
        });

        let indexed = quantize(&raster, Quality::default());
        let transparent = indexed.transparent.unwrap();
        assert!(indexed.color_count() <= MAX_PALETTE_COLORS);
        assert_eq!(transparent as usize, indexed.color_count() - 1);
        assert_eq!(indexed.indices[0], transparent);
    }
}
