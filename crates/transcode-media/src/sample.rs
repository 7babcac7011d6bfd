use std::time::Duration;

use bytes::Bytes;

use crate::frame::Dimensions;

/// Format description attached to every encoded sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleFormat {
    /// Codec of the payload (e.g. `"h264"`, `"hevc"`).
    pub codec_name: &'static str,
    /// Dimensions the producing session was created with.
    pub dimensions: Dimensions,
    /// Whether the sample can be decoded without earlier samples.
    pub keyframe: bool,
}

/// One unit of compressed output.
///
/// Cheap to clone: the payload is reference counted, so fan-out to many
/// subscribers shares a single allocation.
#[derive(Debug, Clone)]
pub struct EncodedSample {
    /// Presentation timestamp of the source frame.
    pub presentation_time: Duration,
    /// Frame duration, `None` when the codec was left to infer it.
    pub duration: Option<Duration>,
    /// Compressed payload.
    pub data: Bytes,
    pub format: SampleFormat,
}

impl EncodedSample {
    #[must_use]
    pub fn is_keyframe(&self) -> bool {
        self.format.keyframe
    }
}

/// An accepted frame that the encoder later failed to produce output for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("encode failed with status {status}: {reason}")]
pub struct EncodeFailure {
    /// Presentation timestamp of the failed frame, when known.
    pub presentation_time: Option<Duration>,
    /// Backend-specific status code.
    pub status: i32,
    pub reason: String,
}

impl EncodeFailure {
    #[must_use]
    pub fn new(status: i32, reason: impl Into<String>) -> Self {
        Self {
            presentation_time: None,
            status,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn at(mut self, presentation_time: Duration) -> Self {
        self.presentation_time = Some(presentation_time);
        self
    }
}

/// What a subscriber receives for each completion callback.
pub type EncoderOutput = Result<EncodedSample, EncodeFailure>;
