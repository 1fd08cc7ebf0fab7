//! Normalize-then-encode driver shared by the job controller and the
//! request/response endpoint.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::encoder::{self, EncodedStream};
use crate::error::{PipelineError, PipelineResult};
use crate::logging::{self, EncodeStage};
use crate::normalize::normalize;
use crate::types::{validate_request, Background, EncodeOptions, Frame, NormalizedFrame};

/// Run one complete encode over `frames`.
///
/// Every frame is decoded before the encoder sees any of them: a single
/// undecodable image fails the whole run. `cancel` is polled between frames
/// in both phases.
pub fn run_pipeline(
    frames: &[Frame],
    options: &EncodeOptions,
    background: Background,
    on_progress: &mut dyn FnMut(u8),
    cancel: &CancellationToken,
) -> PipelineResult<EncodedStream> {
    validate_request(frames, options)?;

    let normalized = normalize_all(frames, options, background, cancel)?;
    info!(
        total_frames = normalized.len(),
        width = options.width,
        height = options.height,
        quality = options.quality.get(),
        "Frames normalized, encoding"
    );

    encoder::encode(&normalized, options, on_progress, cancel)
}

fn normalize_all(
    frames: &[Frame],
    options: &EncodeOptions,
    background: Background,
    cancel: &CancellationToken,
) -> PipelineResult<Vec<NormalizedFrame>> {
    let mut normalized = Vec::with_capacity(frames.len());
    for (index, frame) in frames.iter().enumerate() {
        if cancel.is_cancelled() {
            debug!(frame_index = index, "Cancellation observed during normalization");
            return Err(PipelineError::Cancelled);
        }

        logging::mark_frame(EncodeStage::Normalize, Some(index));
        let raster = normalize(frame, options.width, options.height, background)
            .map_err(|source| PipelineError::Decode { index, source })?;
        normalized.push(NormalizedFrame {
            raster,
            delay_ms: frame.delay_ms,
        });
    }
    Ok(normalized)
}
