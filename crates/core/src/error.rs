use crate::types::FrameId;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// An input image that could not be rasterized.
#[derive(thiserror::Error, Debug)]
#[error("frame {frame_id} could not be decoded: {source}")]
pub struct DecodeError {
    pub frame_id: FrameId,
    #[source]
    pub source: image::ImageError,
}

/// Terminal error taxonomy of the encoding pipeline.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// An input image cannot be rasterized. The whole job fails.
    #[error("frame #{index}: {source}")]
    Decode {
        index: usize,
        #[source]
        source: DecodeError,
    },

    /// The GIF compressor failed mid-stream.
    #[error("encoding failed{}: {reason}", frame_suffix(.index))]
    Encode { index: Option<usize>, reason: String },

    /// Cancellation was observed at a frame boundary. Not a failure.
    #[error("encoding cancelled")]
    Cancelled,

    /// The controller was driven out of order (start while running, cancel while idle).
    #[error("{0}")]
    CallerMisuse(String),

    /// The request was rejected before any work started.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

fn frame_suffix(index: &Option<usize>) -> String {
    index.map(|i| format!(" at frame #{i}")).unwrap_or_default()
}

impl PipelineError {
    pub fn encode(index: Option<usize>, reason: impl Into<String>) -> Self {
        Self::Encode {
            index,
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Index and id of the offending frame, when the error is tied to one.
    pub fn frame(&self) -> Option<(usize, &FrameId)> {
        match self {
            Self::Decode { index, source } => Some((*index, &source.frame_id)),
            _ => None,
        }
    }
}
