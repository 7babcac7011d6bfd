//! Session lifecycle manager.
//!
//! Owns at most one live encoder handle and decides, frame by frame,
//! whether it is still usable. Invalidation is lazy: configuration
//! changes, explicit requests and external triggers only mark the handle,
//! and the next frame pays for destroy + create.
//!
//! Everything here runs on the confinement thread; nothing in this module
//! is shared.

use std::time::Duration;

use transcode_encode::{
    EncoderBackend, EncoderConfig, EncoderHandle, FrameTiming, OutputSink, SubmitOptions,
};
use transcode_media::{Dimensions, RawFrame};

/// Observable state of the encoder session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handle exists.
    Absent,
    /// A handle exists and matches the current configuration.
    Valid,
    /// A handle exists but must be replaced before the next frame.
    Invalidated,
}

/// Why a live handle was marked for replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationCause {
    Configuration,
    Dimensions,
    Explicit,
    External,
}

impl InvalidationCause {
    /// Whether the handle must be replaced even if the configuration and
    /// dimensions end up matching it again.
    #[must_use]
    pub fn is_forced(self) -> bool {
        matches!(self, Self::Explicit | Self::External)
    }
}

impl std::fmt::Display for InvalidationCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration changed"),
            Self::Dimensions => write!(f, "frame dimensions changed"),
            Self::Explicit => write!(f, "invalidation requested"),
            Self::External => write!(f, "external trigger"),
        }
    }
}

/// Session counters, cumulative since construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub handles_created: u64,
    pub handles_destroyed: u64,
    pub frames_submitted: u64,
    /// Frames that never reached a handle, for any reason.
    pub frames_dropped: u64,
    pub creation_failures: u64,
    pub submission_failures: u64,
    pub lock_failures: u64,
    /// Creation failures since the last successful creation.
    pub consecutive_creation_failures: u64,
    pub external_triggers: u64,
}

/// The live handle plus what it was created from.
struct LiveHandle {
    handle: Box<dyn EncoderHandle>,
    dimensions: Dimensions,
    config: EncoderConfig,
}

/// What the next frame has to do before it can be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Renewal {
    /// No handle exists yet.
    Initial,
    /// The live handle is stale.
    Replace(InvalidationCause),
}

enum Slot {
    Absent,
    Valid(LiveHandle),
    Invalidated(LiveHandle, InvalidationCause),
}

/// Single-owner encoder session.
pub(crate) struct EncoderSession<B> {
    backend: B,
    config: EncoderConfig,
    output: OutputSink,
    slot: Slot,
    keyframe_requested: bool,
    stats: SessionStats,
}

impl<B: EncoderBackend> EncoderSession<B> {
    pub(crate) fn new(backend: B, config: EncoderConfig, output: OutputSink) -> Self {
        Self {
            backend,
            config,
            output,
            slot: Slot::Absent,
            keyframe_requested: false,
            stats: SessionStats::default(),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        match self.slot {
            Slot::Absent => SessionState::Absent,
            Slot::Valid(_) => SessionState::Valid,
            Slot::Invalidated(..) => SessionState::Invalidated,
        }
    }

    pub(crate) fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub(crate) fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Replace the configuration. An equal value changes nothing.
    pub(crate) fn set_config(&mut self, config: EncoderConfig) {
        if config == self.config {
            tracing::debug!("Encoder configuration unchanged, keeping session");
            return;
        }
        self.config = config;
        if self.settle() {
            tracing::debug!("Encoder configuration reverted, keeping session");
            return;
        }
        self.invalidate(InvalidationCause::Configuration);
    }

    /// Mark the live handle for replacement. No effect without a handle.
    pub(crate) fn invalidate(&mut self, cause: InvalidationCause) {
        if cause == InvalidationCause::External {
            self.stats.external_triggers += 1;
        }
        self.slot = match std::mem::replace(&mut self.slot, Slot::Absent) {
            Slot::Valid(live) => {
                tracing::debug!(%cause, dimensions = %live.dimensions, "Encoder session invalidated");
                Slot::Invalidated(live, cause)
            }
            // A forced cause outlives any configuration revert.
            Slot::Invalidated(live, previous) if cause.is_forced() && !previous.is_forced() => {
                Slot::Invalidated(live, cause)
            }
            other => other,
        };
    }

    pub(crate) fn request_keyframe(&mut self) {
        self.keyframe_requested = true;
    }

    /// Encode one frame, recreating the handle first if needed.
    ///
    /// Failures are logged and counted; the frame is dropped and the next
    /// one starts over.
    pub(crate) fn encode(
        &mut self,
        frame: &RawFrame,
        presentation_time: Duration,
        duration: Option<Duration>,
    ) {
        let dimensions = frame.dimensions();

        self.settle();
        if let Some(renewal) = self.renewal(dimensions) {
            self.renew(dimensions, renewal);
        }

        let Slot::Valid(live) = &mut self.slot else {
            self.stats.frames_dropped += 1;
            return;
        };

        let locked = match frame.lock() {
            Ok(locked) => locked,
            Err(e) => {
                tracing::warn!(%dimensions, "Dropping frame: {e}");
                self.stats.lock_failures += 1;
                self.stats.frames_dropped += 1;
                return;
            }
        };

        let timing = FrameTiming {
            presentation_time,
            duration,
        };
        let options = SubmitOptions {
            force_keyframe: self.keyframe_requested,
        };

        match live.handle.submit(&locked, timing, options) {
            Ok(()) => {
                self.keyframe_requested = false;
                self.stats.frames_submitted += 1;
                tracing::trace!(?presentation_time, "Frame submitted");
            }
            Err(e) => {
                tracing::error!(?presentation_time, "Failed to encode frame: {e}");
                self.stats.submission_failures += 1;
                self.stats.frames_dropped += 1;
            }
        }
    }

    /// Destroy the live handle, if any. Called once at teardown.
    pub(crate) fn shutdown(&mut self) {
        if let Some(live) = self.take_live() {
            self.destroy(live, "shutdown");
        }
    }

    /// Return a handle invalidated only by configuration drift to service
    /// once the configuration matches its snapshot again.
    fn settle(&mut self) -> bool {
        let matches = matches!(
            &self.slot,
            Slot::Invalidated(live, cause) if !cause.is_forced() && live.config == self.config
        );
        if matches {
            if let Slot::Invalidated(live, _) = std::mem::replace(&mut self.slot, Slot::Absent) {
                self.slot = Slot::Valid(live);
            }
        }
        matches
    }

    /// `None` when the next frame can use the current handle as is.
    fn renewal(&self, dimensions: Dimensions) -> Option<Renewal> {
        match &self.slot {
            Slot::Absent => Some(Renewal::Initial),
            Slot::Invalidated(_, cause) => Some(Renewal::Replace(*cause)),
            Slot::Valid(live) if live.dimensions != dimensions => {
                Some(Renewal::Replace(InvalidationCause::Dimensions))
            }
            Slot::Valid(live) if live.config != self.config => {
                Some(Renewal::Replace(InvalidationCause::Configuration))
            }
            Slot::Valid(_) => None,
        }
    }

    fn renew(&mut self, dimensions: Dimensions, renewal: Renewal) {
        if let Renewal::Replace(cause) = renewal {
            if let Some(live) = self.take_live() {
                tracing::info!(
                    %cause,
                    old = %live.dimensions,
                    new = %dimensions,
                    "Recreating encoder session"
                );
                self.destroy(live, "replaced");
            }
        }

        match self
            .backend
            .create(&self.config, dimensions, self.output.clone())
        {
            Ok(handle) => {
                self.stats.handles_created += 1;
                self.stats.consecutive_creation_failures = 0;
                tracing::info!(
                    backend = self.backend.name(),
                    codec = %self.config.codec,
                    %dimensions,
                    "Encoder session created"
                );
                self.slot = Slot::Valid(LiveHandle {
                    handle,
                    dimensions,
                    config: self.config.clone(),
                });
            }
            Err(e) => {
                self.stats.creation_failures += 1;
                self.stats.consecutive_creation_failures += 1;
                tracing::error!(
                    backend = self.backend.name(),
                    %dimensions,
                    consecutive = self.stats.consecutive_creation_failures,
                    "Failed to create encoder session: {e}"
                );
            }
        }
    }

    fn take_live(&mut self) -> Option<LiveHandle> {
        match std::mem::replace(&mut self.slot, Slot::Absent) {
            Slot::Absent => None,
            Slot::Valid(live) | Slot::Invalidated(live, _) => Some(live),
        }
    }

    fn destroy(&mut self, mut live: LiveHandle, reason: &'static str) {
        live.handle.destroy();
        self.stats.handles_destroyed += 1;
        tracing::debug!(reason, dimensions = %live.dimensions, "Encoder session destroyed");
    }
}

impl<B> Drop for EncoderSession<B> {
    fn drop(&mut self) {
        if let Slot::Valid(live) | Slot::Invalidated(live, _) = &mut self.slot {
            live.handle.destroy();
        }
    }
}
