//! Encoder backends.
//!
//! - [`null`]: in-process stand-in with its own completion thread
//! - `gstreamer_enc`: VAAPI / NVENC / software H.264 and HEVC pipelines
//!   (requires the `gstreamer` feature)

#[cfg(feature = "gstreamer")]
pub mod gstreamer_enc;
pub mod null;

#[cfg(feature = "gstreamer")]
pub use gstreamer_enc::{detect_best_encoder, GstBackend, GstHandle};
pub use null::{NullBackend, NullHandle, NullProbe};
