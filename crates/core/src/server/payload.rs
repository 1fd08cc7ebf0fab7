//! Wire shapes of the encode endpoints and their conversion into pipeline
//! inputs.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::config::AppConfig;
use crate::controller::{JobOutcome, JobSnapshot, JobState};
use crate::types::{EncodeOptions, Frame, FrameId, Quality};

#[derive(Debug, Deserialize)]
pub struct EncodeRequest {
    pub images: Vec<ImagePayload>,
    #[serde(default)]
    pub options: Option<OptionsPayload>,
}

#[derive(Debug, Deserialize)]
pub struct ImagePayload {
    #[serde(default)]
    pub id: Option<String>,
    /// Base64 image bytes, optionally as a `data:<mime>;base64,` URL.
    pub image: String,
    #[serde(default, alias = "delay")]
    pub delay_ms: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OptionsPayload {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: Option<u8>,
}

/// Frames and options ready for the pipeline.
#[derive(Debug)]
pub struct DecodedRequest {
    pub frames: Vec<Frame>,
    pub options: EncodeOptions,
}

impl EncodeRequest {
    /// Decode the transport encoding and fill in configured defaults.
    /// Errors are human-readable and meant for a 400 response.
    pub fn into_pipeline_input(self, config: &AppConfig) -> Result<DecodedRequest, String> {
        if self.images.is_empty() {
            return Err("at least one image is required".to_string());
        }
        if self.images.len() > config.server.max_frames {
            return Err(format!(
                "too many images: {} (limit {})",
                self.images.len(),
                config.server.max_frames
            ));
        }

        let defaults = config.encode.options();
        let requested = self.options.unwrap_or_default();
        let quality = match requested.quality {
            Some(raw) => Quality::new(raw).map_err(|e| e.to_string())?,
            None => defaults.quality,
        };
        let options = EncodeOptions {
            width: requested.width.unwrap_or(defaults.width),
            height: requested.height.unwrap_or(defaults.height),
            quality,
        };
        options
            .validate()
            .and_then(|()| options.check_canvas_budget(config.encode.max_canvas_pixels))
            .map_err(|e| e.to_string())?;

        let frames = self
            .images
            .into_iter()
            .enumerate()
            .map(|(index, payload)| {
                let bytes = decode_image_field(&payload.image)
                    .map_err(|reason| format!("image #{index}: {reason}"))?;
                let id = payload.id.map(FrameId::from).unwrap_or_else(FrameId::generate);
                let delay_ms = payload.delay_ms.unwrap_or(config.encode.default_delay_ms);
                Ok(Frame::with_id(id, bytes, delay_ms))
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(DecodedRequest { frames, options })
    }
}

fn decode_image_field(raw: &str) -> Result<Vec<u8>, String> {
    let trimmed = raw.trim();
    let encoded = match trimmed.strip_prefix("data:") {
        Some(data_url) => {
            let (header, body) = data_url
                .split_once(',')
                .ok_or_else(|| "malformed data URL".to_string())?;
            if !header.ends_with(";base64") {
                return Err("data URL must be base64 encoded".to_string());
            }
            body
        }
        None => trimmed,
    };

    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| format!("invalid base64: {e}"))?;
    if bytes.is_empty() {
        return Err("image is empty".to_string());
    }
    Ok(bytes)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateGifResponse {
    /// Base64-encoded GIF bytes.
    pub gif: String,
    pub mime_type: String,
    pub frame_count: usize,
    pub width: u16,
    pub height: u16,
    pub size_bytes: usize,
}

impl From<&Artifact> for CreateGifResponse {
    fn from(artifact: &Artifact) -> Self {
        Self {
            gif: STANDARD.encode(artifact.bytes()),
            mime_type: artifact.mime_type().to_string(),
            frame_count: artifact.frame_count(),
            width: artifact.width(),
            height: artifact.height(),
            size_bytes: artifact.size_bytes(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub id: Uuid,
    pub state: JobState,
    pub total_frames: usize,
    pub created_at: DateTime<Utc>,
}

/// Terminal result of the most recent interactive job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub state: JobState,
    pub artifact: Option<crate::artifact::ArtifactSummary>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl JobSummary {
    pub fn from_outcome(id: Uuid, outcome: &JobOutcome) -> Self {
        Self {
            id,
            state: outcome.state(),
            artifact: outcome.artifact().map(Artifact::summary),
            error: match outcome {
                JobOutcome::Failed(err) => Some(err.to_string()),
                _ => None,
            },
            finished_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CurrentJobResponse {
    #[serde(flatten)]
    pub snapshot: JobSnapshot,
    pub last: Option<JobSummary>,
}
