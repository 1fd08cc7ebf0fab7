//! Core crate for gifsmith: turns an ordered list of still images into an
//! animated GIF, one job at a time.

pub mod artifact;
pub mod config;
pub mod controller;
pub mod encoder;
pub mod error;
pub mod logging;
pub mod normalize;
pub mod pipeline;
pub mod quantize;
pub mod server;
pub mod types;

pub use artifact::{Artifact, ArtifactHandle, ArtifactStore};
pub use controller::{JobController, JobEvent, JobHandle, JobOutcome, JobState};
pub use error::{DecodeError, PipelineError, PipelineResult};
pub use types::{Background, EncodeOptions, Frame, FrameId, Quality};
