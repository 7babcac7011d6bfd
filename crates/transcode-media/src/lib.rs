// Media value types for the transcoding crates.
//
// - frame.rs: raw input frames, dimensions and pixel formats
// - sample.rs: encoded samples and encode failures delivered to subscribers

pub mod frame;
pub mod sample;

pub use frame::{Dimensions, FrameLock, FrameLockError, PixelFormat, RawFrame, VideoSample};
pub use sample::{EncodeFailure, EncodedSample, EncoderOutput, SampleFormat};
