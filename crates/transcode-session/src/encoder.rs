//! Public encoder controller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use transcode_encode::{EncoderBackend, EncoderConfig};
use transcode_media::{RawFrame, VideoSample};

use crate::hub::{BroadcastHub, Subscription, SubscriptionId};
use crate::session::{SessionState, SessionStats};
use crate::trigger::TriggerListener;
use crate::worker::{Command, Worker};
use crate::SessionError;

/// Encoder session controller.
///
/// Frames may be pushed from any thread. The controller creates the
/// hardware session on the first frame and recreates it lazily whenever
/// the configuration, the frame dimensions or the external trigger say
/// the current one is stale. Encoded output is broadcast to every
/// [`Subscription`].
///
/// Async methods have `blocking_` twins for callers outside a runtime;
/// those must not be called from within one.
///
/// ```no_run
/// # async fn demo() -> Result<(), transcode_session::SessionError> {
/// use transcode_encode::{backends::NullBackend, EncoderConfig};
/// use transcode_media::{PixelFormat, RawFrame};
/// use transcode_session::VideoEncoder;
///
/// let encoder = VideoEncoder::new(NullBackend::new(), EncoderConfig::ultra_low_latency())?;
/// let mut output = encoder.subscribe();
///
/// encoder
///     .push_frame(RawFrame::blank(640, 480, PixelFormat::Bgra), None, None)
///     .await?;
/// let sample = output.recv().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct VideoEncoder {
    worker: Worker,
    hub: Arc<BroadcastHub>,
    epoch: Instant,
}

impl VideoEncoder {
    /// Create a controller without an external trigger.
    ///
    /// # Errors
    ///
    /// Returns an error if the session threads cannot be started.
    pub fn new<B: EncoderBackend>(backend: B, config: EncoderConfig) -> Result<Self, SessionError> {
        Self::with_trigger(backend, config, TriggerListener::detached())
    }

    /// Create a controller that invalidates its session whenever `trigger`
    /// fires. The listener is dropped at teardown.
    ///
    /// # Errors
    ///
    /// Returns an error if the session threads cannot be started.
    pub fn with_trigger<B: EncoderBackend>(
        backend: B,
        config: EncoderConfig,
        trigger: TriggerListener,
    ) -> Result<Self, SessionError> {
        tracing::info!(
            backend = backend.name(),
            codec = %config.codec,
            real_time = config.is_real_time(),
            "Starting encoder controller"
        );

        let hub = BroadcastHub::new();
        let worker = Worker::spawn(backend, config, trigger, Arc::clone(&hub))?;

        Ok(Self {
            worker,
            hub,
            epoch: Instant::now(),
        })
    }

    /// Encode `frame`.
    ///
    /// Returns once the frame has been handed to the hardware session (or
    /// dropped); the result arrives through the subscriptions. A missing
    /// presentation time is taken from the controller's monotonic clock.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after shutdown.
    pub async fn push_frame(
        &self,
        frame: RawFrame,
        presentation_time: Option<Duration>,
        duration: Option<Duration>,
    ) -> Result<(), SessionError> {
        let presentation_time = self.stamp(presentation_time);
        self.worker
            .call(|reply| Command::PushFrame {
                frame,
                presentation_time,
                duration,
                reply,
            })
            .await
    }

    /// Blocking variant of [`push_frame`](VideoEncoder::push_frame).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after shutdown.
    pub fn blocking_push_frame(
        &self,
        frame: RawFrame,
        presentation_time: Option<Duration>,
        duration: Option<Duration>,
    ) -> Result<(), SessionError> {
        let presentation_time = self.stamp(presentation_time);
        self.worker.blocking_call(|reply| Command::PushFrame {
            frame,
            presentation_time,
            duration,
            reply,
        })
    }

    /// Encode the image carried by `sample`. Samples without an image are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after shutdown.
    pub async fn push_sample(&self, sample: VideoSample) -> Result<(), SessionError> {
        let Some(image) = sample.image else {
            tracing::trace!("Ignoring sample without an image");
            return Ok(());
        };
        self.push_frame(image, sample.presentation_time, sample.duration)
            .await
    }

    /// Blocking variant of [`push_sample`](VideoEncoder::push_sample).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after shutdown.
    pub fn blocking_push_sample(&self, sample: VideoSample) -> Result<(), SessionError> {
        let Some(image) = sample.image else {
            tracing::trace!("Ignoring sample without an image");
            return Ok(());
        };
        self.blocking_push_frame(image, sample.presentation_time, sample.duration)
    }

    /// Replace the configuration. The session is recreated on the next
    /// frame unless `config` equals the current one.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after shutdown.
    pub async fn set_configuration(&self, config: EncoderConfig) -> Result<(), SessionError> {
        self.worker
            .call(|reply| Command::SetConfiguration { config, reply })
            .await
    }

    /// Blocking variant of [`set_configuration`](VideoEncoder::set_configuration).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after shutdown.
    pub fn blocking_set_configuration(&self, config: EncoderConfig) -> Result<(), SessionError> {
        self.worker
            .blocking_call(|reply| Command::SetConfiguration { config, reply })
    }

    /// Force the session to be recreated on the next frame.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after shutdown.
    pub async fn invalidate(&self) -> Result<(), SessionError> {
        self.worker
            .call(|reply| Command::Invalidate { reply })
            .await
    }

    /// Blocking variant of [`invalidate`](VideoEncoder::invalidate).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after shutdown.
    pub fn blocking_invalidate(&self) -> Result<(), SessionError> {
        self.worker.blocking_call(|reply| Command::Invalidate { reply })
    }

    /// Encode the next submitted frame as a keyframe.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after shutdown.
    pub async fn request_keyframe(&self) -> Result<(), SessionError> {
        self.worker
            .call(|reply| Command::RequestKeyframe { reply })
            .await
    }

    /// Current session state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after shutdown.
    pub async fn state(&self) -> Result<SessionState, SessionError> {
        self.worker.call(|reply| Command::State { reply }).await
    }

    /// The configuration the next session will be created with.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after shutdown.
    pub async fn configuration(&self) -> Result<EncoderConfig, SessionError> {
        self.worker
            .call(|reply| Command::Configuration { reply })
            .await
    }

    /// Session counters.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after shutdown.
    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        self.worker.call(|reply| Command::Stats { reply }).await
    }

    /// Blocking variant of [`stats`](VideoEncoder::stats).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after shutdown.
    pub fn blocking_stats(&self) -> Result<SessionStats, SessionError> {
        self.worker.blocking_call(|reply| Command::Stats { reply })
    }

    /// Start observing encoder output from now on.
    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// Stop delivering to `id`. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    /// The hub this controller publishes to.
    #[must_use]
    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Destroy the session and finish every subscription.
    ///
    /// Completions still in flight are delivered before subscriptions see
    /// the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if already shut down.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.worker
            .call(|reply| Command::Shutdown { reply })
            .await?;
        self.hub.closed().await;
        tracing::info!("Encoder controller shut down");
        Ok(())
    }

    /// Blocking variant of [`shutdown`](VideoEncoder::shutdown). Also waits
    /// for the session threads to exit.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if already shut down.
    pub fn blocking_shutdown(&self) -> Result<(), SessionError> {
        self.worker
            .blocking_call(|reply| Command::Shutdown { reply })?;
        self.worker.join();
        tracing::info!("Encoder controller shut down");
        Ok(())
    }

    fn stamp(&self, presentation_time: Option<Duration>) -> Duration {
        presentation_time.unwrap_or_else(|| self.epoch.elapsed())
    }
}
