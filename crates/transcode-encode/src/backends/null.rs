//! Null encoder backend.
//!
//! Behaves like a hardware encoder from the controller's point of view:
//! each handle completes frames on its own thread and reports them
//! through the [`OutputSink`]. The payload is the raw frame bytes. Used in
//! tests and as a stand-in when no hardware encoder is present.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bytes::Bytes;
use tokio::sync::mpsc;
use transcode_media::{Dimensions, EncodeFailure, EncodedSample, FrameLock, SampleFormat};

use crate::backend::{EncoderBackend, EncoderHandle, FrameTiming, OutputSink, SubmitOptions};
use crate::config::{Codec, EncoderConfig};
use crate::EncodeError;

/// Status reported for injected encode failures.
pub const NULL_ENCODE_FAILURE_STATUS: i32 = -1;

/// Counters and fault injection shared between a [`NullBackend`] and
/// whoever wants to observe it.
#[derive(Debug, Default)]
pub struct NullProbe {
    created: AtomicU64,
    destroyed: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    creations: Mutex<Vec<(Dimensions, EncoderConfig)>>,
    fail_creations: AtomicU32,
    reject_submissions: AtomicBool,
    fail_encodes: AtomicBool,
}

impl NullProbe {
    /// Handles created so far.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    /// Handles destroyed so far.
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Handles created but not yet destroyed.
    pub fn live(&self) -> u64 {
        self.created().saturating_sub(self.destroyed())
    }

    /// Frames accepted by any handle.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Completions emitted by any handle (samples and failures).
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Dimensions and configuration of every successful creation, in order.
    pub fn creations(&self) -> Vec<(Dimensions, EncoderConfig)> {
        lock_creations(&self.creations).clone()
    }

    /// Make the next `count` creation attempts fail.
    pub fn fail_next_creations(&self, count: u32) {
        self.fail_creations.store(count, Ordering::SeqCst);
    }

    /// Reject every submission while `reject` is set.
    pub fn reject_submissions(&self, reject: bool) {
        self.reject_submissions.store(reject, Ordering::SeqCst);
    }

    /// Report accepted frames as encode failures while `fail` is set.
    pub fn fail_encodes(&self, fail: bool) {
        self.fail_encodes.store(fail, Ordering::SeqCst);
    }

    fn take_creation_failure(&self) -> bool {
        self.fail_creations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn lock_creations(
    creations: &Mutex<Vec<(Dimensions, EncoderConfig)>>,
) -> std::sync::MutexGuard<'_, Vec<(Dimensions, EncoderConfig)>> {
    creations.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Backend producing [`NullHandle`]s.
#[derive(Debug, Default)]
pub struct NullBackend {
    probe: Arc<NullProbe>,
}

impl NullBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counters for this backend's handles.
    #[must_use]
    pub fn probe(&self) -> Arc<NullProbe> {
        Arc::clone(&self.probe)
    }
}

impl EncoderBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn create(
        &mut self,
        config: &EncoderConfig,
        dimensions: Dimensions,
        output: OutputSink,
    ) -> Result<Box<dyn EncoderHandle>, EncodeError> {
        if dimensions.width == 0 || dimensions.height == 0 {
            return Err(EncodeError::InvalidDimensions(dimensions));
        }
        if self.probe.take_creation_failure() {
            return Err(EncodeError::Creation("injected creation failure".into()));
        }

        let handle = NullHandle::spawn(config, dimensions, output, Arc::clone(&self.probe))?;

        self.probe.created.fetch_add(1, Ordering::SeqCst);
        lock_creations(&self.probe.creations).push((dimensions, config.clone()));
        tracing::debug!(%dimensions, codec = %config.codec, "Null encoder handle created");

        Ok(Box::new(handle))
    }
}

struct Job {
    data: Bytes,
    timing: FrameTiming,
    keyframe: bool,
}

/// A handle whose "encoder" is a thread echoing frames back as samples.
pub struct NullHandle {
    dimensions: Dimensions,
    keyframe_interval: u64,
    frames: u64,
    jobs: Option<mpsc::UnboundedSender<Job>>,
    worker: Option<JoinHandle<()>>,
    probe: Arc<NullProbe>,
}

impl NullHandle {
    fn spawn(
        config: &EncoderConfig,
        dimensions: Dimensions,
        output: OutputSink,
        probe: Arc<NullProbe>,
    ) -> Result<Self, EncodeError> {
        let (jobs, rx) = mpsc::unbounded_channel();
        let codec = config.codec;
        let worker_probe = Arc::clone(&probe);

        let worker = std::thread::Builder::new()
            .name("null-encoder".into())
            .spawn(move || run_completions(rx, &output, codec, dimensions, &worker_probe))
            .map_err(|e| EncodeError::Creation(format!("failed to spawn encoder thread: {e}")))?;

        Ok(Self {
            dimensions,
            keyframe_interval: config.keyframe_interval.map_or(0, u64::from),
            frames: 0,
            jobs: Some(jobs),
            worker: Some(worker),
            probe,
        })
    }
}

impl EncoderHandle for NullHandle {
    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    fn submit(
        &mut self,
        frame: &FrameLock<'_>,
        timing: FrameTiming,
        options: SubmitOptions,
    ) -> Result<(), EncodeError> {
        let jobs = self.jobs.as_ref().ok_or(EncodeError::Destroyed)?;
        if self.probe.reject_submissions.load(Ordering::SeqCst) {
            return Err(EncodeError::Rejected("injected submission failure".into()));
        }

        let periodic = self.keyframe_interval > 0 && self.frames % self.keyframe_interval == 0;
        let job = Job {
            data: Bytes::copy_from_slice(frame.data()),
            timing,
            keyframe: self.frames == 0 || periodic || options.force_keyframe,
        };
        jobs.send(job).map_err(|_| EncodeError::Destroyed)?;

        self.frames += 1;
        self.probe.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&mut self) {
        // Closing the job channel lets the worker finish in-flight frames.
        let Some(jobs) = self.jobs.take() else {
            return;
        };
        drop(jobs);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.probe.destroyed.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(dimensions = %self.dimensions, frames = self.frames, "Null encoder handle destroyed");
    }
}

impl Drop for NullHandle {
    fn drop(&mut self) {
        if self.jobs.is_some() {
            tracing::warn!(dimensions = %self.dimensions, "Null encoder handle dropped without destroy");
            self.destroy();
        }
    }
}

#[allow(clippy::needless_pass_by_value)] // receiver is moved from a thread spawn closure
fn run_completions(
    mut rx: mpsc::UnboundedReceiver<Job>,
    output: &OutputSink,
    codec: Codec,
    dimensions: Dimensions,
    probe: &NullProbe,
) {
    while let Some(job) = rx.blocking_recv() {
        probe.completed.fetch_add(1, Ordering::SeqCst);

        if probe.fail_encodes.load(Ordering::SeqCst) {
            output.emit_failure(
                EncodeFailure::new(NULL_ENCODE_FAILURE_STATUS, "injected encode failure")
                    .at(job.timing.presentation_time),
            );
            continue;
        }

        output.emit_sample(EncodedSample {
            presentation_time: job.timing.presentation_time,
            duration: job.timing.duration,
            data: job.data,
            format: SampleFormat {
                codec_name: codec.name(),
                dimensions,
                keyframe: job.keyframe,
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use transcode_media::{PixelFormat, RawFrame};

    use super::*;

    fn timing(ms: u64) -> FrameTiming {
        FrameTiming {
            presentation_time: Duration::from_millis(ms),
            duration: Some(Duration::from_millis(16)),
        }
    }

    #[test]
    fn completes_frames_in_submission_order() {
        let mut backend = NullBackend::new();
        let probe = backend.probe();
        let (sink, mut rx) = OutputSink::channel();
        let frame = RawFrame::blank(4, 2, PixelFormat::Bgra);

        let mut handle = backend
            .create(&EncoderConfig::default(), frame.dimensions(), sink)
            .unwrap();
        for ms in [0, 16, 33] {
            handle
                .submit(&frame.lock().unwrap(), timing(ms), SubmitOptions::default())
                .unwrap();
        }
        handle.destroy();

        let samples: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(Result::unwrap)
            .collect();
        assert_eq!(samples.len(), 3);
        assert!(samples[0].is_keyframe());
        assert!(!samples[1].is_keyframe());
        assert_eq!(samples[2].presentation_time, Duration::from_millis(33));
        assert_eq!(samples[0].data.len(), 4 * 2 * 4);
        assert_eq!(samples[0].format.codec_name, "hevc");
        assert_eq!(probe.submitted(), 3);
        assert_eq!(probe.completed(), 3);
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut backend = NullBackend::new();
        let probe = backend.probe();
        let (sink, _rx) = OutputSink::channel();

        let mut handle = backend
            .create(&EncoderConfig::default(), Dimensions::new(2, 2), sink)
            .unwrap();
        handle.destroy();
        handle.destroy();
        drop(handle);

        assert_eq!(probe.created(), 1);
        assert_eq!(probe.destroyed(), 1);
        assert_eq!(probe.live(), 0);
    }

    #[test]
    fn submit_after_destroy_fails() {
        let mut backend = NullBackend::new();
        let (sink, _rx) = OutputSink::channel();
        let frame = RawFrame::blank(2, 2, PixelFormat::Bgra);

        let mut handle = backend
            .create(&EncoderConfig::default(), frame.dimensions(), sink)
            .unwrap();
        handle.destroy();

        let result = handle.submit(&frame.lock().unwrap(), timing(0), SubmitOptions::default());
        assert!(matches!(result, Err(EncodeError::Destroyed)));
    }

    #[test]
    fn injected_creation_failures_are_consumed() {
        let mut backend = NullBackend::new();
        let probe = backend.probe();
        probe.fail_next_creations(1);

        let (sink, _rx) = OutputSink::channel();
        let first = backend.create(&EncoderConfig::default(), Dimensions::new(2, 2), sink.clone());
        assert!(matches!(first, Err(EncodeError::Creation(_))));

        let mut second = backend
            .create(&EncoderConfig::default(), Dimensions::new(2, 2), sink)
            .unwrap();
        second.destroy();
        assert_eq!(probe.created(), 1);
    }

    #[test]
    fn zero_sized_frames_are_refused() {
        let mut backend = NullBackend::new();
        let (sink, _rx) = OutputSink::channel();
        let result = backend.create(&EncoderConfig::default(), Dimensions::new(0, 480), sink);
        assert!(matches!(result, Err(EncodeError::InvalidDimensions(_))));
    }

    #[test]
    fn forced_and_periodic_keyframes() {
        let mut backend = NullBackend::new();
        let (sink, mut rx) = OutputSink::channel();
        let frame = RawFrame::blank(2, 2, PixelFormat::Bgra);
        let config = EncoderConfig {
            keyframe_interval: Some(3),
            ..EncoderConfig::default()
        };

        let mut handle = backend.create(&config, frame.dimensions(), sink).unwrap();
        let forced = SubmitOptions { force_keyframe: true };
        for (ms, options) in [
            (0, SubmitOptions::default()),
            (1, forced),
            (2, SubmitOptions::default()),
            (3, SubmitOptions::default()),
        ] {
            handle.submit(&frame.lock().unwrap(), timing(ms), options).unwrap();
        }
        handle.destroy();

        let keyframes: Vec<bool> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|out| out.unwrap().is_keyframe())
            .collect();
        assert_eq!(keyframes, vec![true, true, false, true]);
    }

    #[test]
    fn injected_encode_failures_reach_the_sink() {
        let mut backend = NullBackend::new();
        let probe = backend.probe();
        probe.fail_encodes(true);
        let (sink, mut rx) = OutputSink::channel();
        let frame = RawFrame::blank(2, 2, PixelFormat::Bgra);

        let mut handle = backend
            .create(&EncoderConfig::default(), frame.dimensions(), sink)
            .unwrap();
        handle
            .submit(&frame.lock().unwrap(), timing(40), SubmitOptions::default())
            .unwrap();
        handle.destroy();

        let failure = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(failure.status, NULL_ENCODE_FAILURE_STATUS);
        assert_eq!(failure.presentation_time, Some(Duration::from_millis(40)));
    }
}
