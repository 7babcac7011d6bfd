//! The hardware encoder capability.
//!
//! A backend creates handles; a handle accepts frames and reports results
//! later, from its own thread, through the [`OutputSink`] it was created
//! with. Submission success and encode success are separate: a handle may
//! accept a frame and still report an [`EncodeFailure`] for it.

use std::time::Duration;

use tokio::sync::mpsc;
use transcode_media::{Dimensions, EncodeFailure, EncodedSample, EncoderOutput, FrameLock};

use crate::config::EncoderConfig;
use crate::EncodeError;

/// Timing of a submitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    pub presentation_time: Duration,
    /// `None` lets the codec infer the duration.
    pub duration: Option<Duration>,
}

/// Per-frame encode options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Encode this frame as a keyframe.
    pub force_keyframe: bool,
}

/// Completion channel handed to every handle at creation.
///
/// Handles call into it from whatever thread their encoder completes on.
/// Emitting never blocks; once the receiving side is gone, output is
/// discarded.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<EncoderOutput>,
}

impl OutputSink {
    /// Create a sink and the receiver that drains it.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EncoderOutput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report an encoded sample. Returns `false` if nobody is listening.
    pub fn emit_sample(&self, sample: EncodedSample) -> bool {
        self.tx.send(Ok(sample)).is_ok()
    }

    /// Report an encode failure. Returns `false` if nobody is listening.
    pub fn emit_failure(&self, failure: EncodeFailure) -> bool {
        self.tx.send(Err(failure)).is_ok()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A live encoder session.
///
/// [`destroy`](EncoderHandle::destroy) must be called once before the
/// handle is dropped and must tolerate repeated calls. Completions for
/// frames already in flight may still arrive after it returns.
pub trait EncoderHandle: Send {
    /// Dimensions the handle was created for.
    fn dimensions(&self) -> Dimensions;

    /// Hand a locked frame to the encoder.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle rejected this frame. The handle
    /// itself may still be usable.
    fn submit(
        &mut self,
        frame: &FrameLock<'_>,
        timing: FrameTiming,
        options: SubmitOptions,
    ) -> Result<(), EncodeError>;

    /// Release device resources.
    fn destroy(&mut self);
}

/// Factory for encoder handles.
pub trait EncoderBackend: Send + 'static {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Create and prepare a handle for `config` at `dimensions`.
    ///
    /// # Errors
    ///
    /// Returns an error if no session can be created for this
    /// configuration and size.
    fn create(
        &mut self,
        config: &EncoderConfig,
        dimensions: Dimensions,
        output: OutputSink,
    ) -> Result<Box<dyn EncoderHandle>, EncodeError>;
}

impl<B: EncoderBackend + ?Sized> EncoderBackend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn create(
        &mut self,
        config: &EncoderConfig,
        dimensions: Dimensions,
        output: OutputSink,
    ) -> Result<Box<dyn EncoderHandle>, EncodeError> {
        (**self).create(config, dimensions, output)
    }
}
