//! Output assembler: wraps a finished GIF stream into an addressable artifact.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::encoder::EncodedStream;

pub const GIF_MIME_TYPE: &str = "image/gif";
pub const ARTIFACT_FILE_NAME: &str = "animation.gif";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactHandle(Uuid);

impl ArtifactHandle {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ArtifactHandle {
    type Err = uuid::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw).map(Self)
    }
}

/// A completed animation. Cloning shares the underlying bytes.
#[derive(Debug, Clone)]
pub struct Artifact {
    handle: ArtifactHandle,
    bytes: Arc<[u8]>,
    width: u16,
    height: u16,
    delays_cs: Arc<[u16]>,
}

impl Artifact {
    pub fn handle(&self) -> ArtifactHandle {
        self.handle
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Shared reference to the bytes, for handing to a response body.
    pub fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn frame_count(&self) -> usize {
        self.delays_cs.len()
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

    pub fn mime_type(&self) -> &'static str {
        GIF_MIME_TYPE
    }

    pub fn file_name(&self) -> &'static str {
        ARTIFACT_FILE_NAME
    }

    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            handle: self.handle,
            mime_type: GIF_MIME_TYPE.to_string(),
            file_name: ARTIFACT_FILE_NAME.to_string(),
            frame_count: self.frame_count(),
            width: self.width,
            height: self.height,
            size_bytes: self.size_bytes(),
        }
    }
}

/// Serializable description of an artifact, without its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub handle: ArtifactHandle,
    pub mime_type: String,
    pub file_name: String,
    pub frame_count: usize,
    pub width: u16,
    pub height: u16,
    pub size_bytes: usize,
}

/// Wrap a finalized stream. An `EncodedStream` only exists for sessions that
/// ran to completion, so cancelled or failed jobs can never reach here.
pub fn finalize(stream: EncodedStream) -> Artifact {
    let (bytes, width, height, delays_cs) = stream.into_parts();
    let artifact = Artifact {
        handle: ArtifactHandle::generate(),
        bytes: bytes.into(),
        width,
        height,
        delays_cs: delays_cs.into(),
    };
    debug!(
        handle = %artifact.handle,
        bytes = artifact.size_bytes(),
        frames = artifact.frame_count(),
        "Artifact assembled"
    );
    artifact
}

/// Holds artifacts until the consumer releases them.
#[derive(Debug, Default, Clone)]
pub struct ArtifactStore {
    entries: Arc<DashMap<ArtifactHandle, Artifact>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, artifact: Artifact) -> ArtifactHandle {
        let handle = artifact.handle();
        self.entries.insert(handle, artifact);
        handle
    }

    pub fn get(&self, handle: &ArtifactHandle) -> Option<Artifact> {
        self.entries.get(handle).map(|entry| entry.value().clone())
    }

    /// Drop the store's reference. Returns `false` if the handle is unknown
    /// or was already released.
    pub fn release(&self, handle: &ArtifactHandle) -> bool {
        let released = self.entries.remove(handle).is_some();
        if released {
            debug!(handle = %handle, "Artifact released");
        }
        released
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
