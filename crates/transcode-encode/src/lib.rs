//! Encoder configuration and the hardware encoder capability.
//!
//! - [`config`]: encoder configuration, presets and TOML persistence
//! - [`backend`]: the handle contract every encoder backend implements
//! - [`backends`]: the null backend and the `GStreamer` backend
//!   (behind the `gstreamer` feature)

pub mod backend;
pub mod backends;
pub mod config;

pub use backend::{EncoderBackend, EncoderHandle, FrameTiming, OutputSink, SubmitOptions};
pub use config::{Codec, EncoderConfig, EncoderType, PropertyValue};

use transcode_media::{Dimensions, FrameLockError};

/// Errors raised while creating an encoder handle or submitting a frame.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("failed to initialize GStreamer: {0}")]
    GstInit(String),

    #[error("failed to create element '{name}': {reason}")]
    ElementCreate { name: String, reason: String },

    #[error("failed to link pipeline: {0}")]
    PipelineLink(String),

    #[error("pipeline state change failed: {0}")]
    StateChange(String),

    #[error("failed to push buffer: {0}")]
    PushBuffer(String),

    #[error("failed to map buffer memory")]
    BufferMap,

    #[error("{encoder} cannot encode {codec}")]
    Unsupported { codec: Codec, encoder: EncoderType },

    #[error("invalid frame dimensions {0}")]
    InvalidDimensions(Dimensions),

    #[error("encoder session could not be created: {0}")]
    Creation(String),

    #[error("frame rejected by encoder: {0}")]
    Rejected(String),

    #[error("encoder handle already destroyed")]
    Destroyed,

    #[error("frame buffer unavailable: {0}")]
    FrameLock(#[from] FrameLockError),
}
