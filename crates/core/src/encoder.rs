//! Encoder session: streams normalized frames through a palette-based GIF
//! encoder, one frame at a time, in input order.

use std::borrow::Cow;

use gif::{DisposalMethod, Repeat};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::logging::{self, EncodeStage};
use crate::quantize::{quantize, IndexedFrame};
use crate::types::{EncodeOptions, NormalizedFrame, Quality};

/// GIF timing is in centiseconds; zero means "as fast as possible" to most
/// players, so it is never emitted.
pub const MIN_DELAY_CS: u16 = 1;

/// Round `delay_ms` half-up to centiseconds, clamped to `[1, 65535]`.
pub fn delay_ms_to_cs(delay_ms: u32) -> u16 {
    let rounded = (u64::from(delay_ms) + 5) / 10;
    rounded.clamp(u64::from(MIN_DELAY_CS), u64::from(u16::MAX)) as u16
}

/// `floor(100 * done / total)`.
pub fn percent_complete(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

/// A fully finalized GIF byte stream. Only a session that ran to completion
/// can produce one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedStream {
    bytes: Vec<u8>,
    width: u16,
    height: u16,
    delays_cs: Vec<u16>,
}

impl EncodedStream {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn delays_cs(&self) -> &[u16] {
        &self.delays_cs
    }

    pub fn frame_count(&self) -> usize {
        self.delays_cs.len()
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, u16, u16, Vec<u16>) {
        (self.bytes, self.width, self.height, self.delays_cs)
    }
}

/// One encoding job's compressor state.
pub struct EncoderSession {
    encoder: gif::Encoder<Vec<u8>>,
    width: u16,
    height: u16,
    quality: Quality,
    delays_cs: Vec<u16>,
    previous: Option<(NormalizedFrameKey, IndexedFrame)>,
}

/// Identity of the last quantized raster, so a repeated image reuses its palette.
struct NormalizedFrameKey(Vec<u8>);

impl EncoderSession {
    pub fn new(options: &EncodeOptions) -> PipelineResult<Self> {
        options.validate()?;
        let width = options.width as u16;
        let height = options.height as u16;

        let mut encoder = gif::Encoder::new(Vec::new(), width, height, &[])
            .map_err(|e| PipelineError::encode(None, format!("failed to write GIF header: {e}")))?;
        encoder
            .set_repeat(Repeat::Infinite)
            .map_err(|e| PipelineError::encode(None, format!("failed to write loop extension: {e}")))?;

        Ok(Self {
            encoder,
            width,
            height,
            quality: options.quality,
            delays_cs: Vec::new(),
            previous: None,
        })
    }

    pub fn frames_written(&self) -> usize {
        self.delays_cs.len()
    }

    /// Quantize and append one frame block.
    pub fn push_frame(&mut self, frame: &NormalizedFrame) -> PipelineResult<()> {
        let index = self.frames_written();
        let raster = &frame.raster;
        if raster.width() != u32::from(self.width) || raster.height() != u32::from(self.height) {
            return Err(PipelineError::encode(
                Some(index),
                format!(
                    "frame is {}x{} but the canvas is {}x{}",
                    raster.width(),
                    raster.height(),
                    self.width,
                    self.height
                ),
            ));
        }

        let indexed = match self.previous.take() {
            Some((key, indexed)) if key.0 == raster.rgba() => {
                debug!(frame_index = index, "Reusing previous palette for identical frame");
                self.previous = Some((key, indexed.clone()));
                indexed
            }
            _ => {
                let indexed = quantize(raster, self.quality);
                self.previous = Some((NormalizedFrameKey(raster.rgba().to_vec()), indexed.clone()));
                indexed
            }
        };

        let delay = delay_ms_to_cs(frame.delay_ms);
        let block = gif::Frame {
            width: self.width,
            height: self.height,
            delay,
            dispose: DisposalMethod::Background,
            transparent: indexed.transparent,
            palette: Some(indexed.palette),
            buffer: Cow::Owned(indexed.indices),
            ..gif::Frame::default()
        };

        self.encoder
            .write_frame(&block)
            .map_err(|e| PipelineError::encode(Some(index), e.to_string()))?;
        self.delays_cs.push(delay);

        debug!(frame_index = index, delay_cs = delay, "Frame committed");
        Ok(())
    }

    /// Write the trailer and hand back the finished stream.
    pub fn finish(self) -> PipelineResult<EncodedStream> {
        let bytes = self
            .encoder
            .into_inner()
            .map_err(|e| PipelineError::encode(None, format!("failed to finalize GIF: {e}")))?;

        Ok(EncodedStream {
            bytes,
            width: self.width,
            height: self.height,
            delays_cs: self.delays_cs,
        })
    }
}

/// Encode `frames` in order, reporting `floor(100 * done / total)` after
/// every committed frame and exactly 100 once the stream is finalized.
///
/// `cancel` is polled at frame boundaries only: before each frame and once
/// more before finalizing. A cancelled session discards everything it built.
pub fn encode(
    frames: &[NormalizedFrame],
    options: &EncodeOptions,
    on_progress: &mut dyn FnMut(u8),
    cancel: &CancellationToken,
) -> PipelineResult<EncodedStream> {
    if frames.is_empty() {
        return Err(PipelineError::InvalidRequest(
            "at least one frame is required".to_string(),
        ));
    }

    let total = frames.len();
    let mut session = EncoderSession::new(options)?;

    for frame in frames {
        if cancel.is_cancelled() {
            debug!(frames_written = session.frames_written(), "Cancellation observed");
            return Err(PipelineError::Cancelled);
        }

        logging::mark_frame(EncodeStage::Encode, Some(session.frames_written()));
        session.push_frame(frame)?;

        let done = session.frames_written();
        if done < total {
            on_progress(percent_complete(done, total));
        }
    }

    finish_unless_cancelled(session, on_progress, cancel)
}

/// Last frame boundary: a cancel that lands after the final frame still
/// discards the stream, and 100 is only reported for a written trailer.
fn finish_unless_cancelled(
    session: EncoderSession,
    on_progress: &mut dyn FnMut(u8),
    cancel: &CancellationToken,
) -> PipelineResult<EncodedStream> {
    if cancel.is_cancelled() {
        debug!(
            frames_written = session.frames_written(),
            "Cancellation observed before finalize"
        );
        return Err(PipelineError::Cancelled);
    }

    logging::mark_frame(EncodeStage::Finalize, None);
    let stream = session.finish()?;
    on_progress(100);
    Ok(stream)
}
