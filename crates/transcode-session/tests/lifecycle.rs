//! End-to-end behavior of the encoder controller against the null backend.

use std::sync::Arc;
use std::time::Duration;

use transcode_encode::backends::{NullBackend, NullProbe, null::NULL_ENCODE_FAILURE_STATUS};
use transcode_encode::{Codec, EncoderConfig};
use transcode_media::{Dimensions, EncodedSample, PixelFormat, RawFrame, VideoSample};
use transcode_session::{
    InvalidationTrigger, SessionError, SessionState, Subscription, TryRecvError, VideoEncoder,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

fn controller(config: EncoderConfig) -> (VideoEncoder, Arc<NullProbe>) {
    init_tracing();
    let backend = NullBackend::new();
    let probe = backend.probe();
    let encoder = VideoEncoder::new(backend, config).expect("controller starts");
    (encoder, probe)
}

fn frame(width: u32, height: u32) -> RawFrame {
    RawFrame::blank(width, height, PixelFormat::Bgra)
}

fn at(ms: u64) -> Option<Duration> {
    Some(Duration::from_millis(ms))
}

async fn next_sample(sub: &mut Subscription) -> EncodedSample {
    tokio::time::timeout(TIMEOUT, sub.recv())
        .await
        .expect("output within timeout")
        .expect("stream still open")
        .expect("encode succeeded")
}

#[tokio::test]
async fn constant_parameters_create_one_handle() {
    let (encoder, probe) = controller(EncoderConfig::default());
    let mut sub = encoder.subscribe();

    for i in 0..10 {
        encoder.push_frame(frame(64, 48), at(i * 16), None).await.unwrap();
    }
    for _ in 0..10 {
        next_sample(&mut sub).await;
    }

    assert_eq!(probe.created(), 1);
    assert_eq!(probe.submitted(), 10);
    assert_eq!(encoder.state().await.unwrap(), SessionState::Valid);
    encoder.shutdown().await.unwrap();
}

#[tokio::test]
async fn configuration_change_recreates_once_and_equal_value_does_not() {
    let (encoder, probe) = controller(EncoderConfig::default());
    encoder.push_frame(frame(64, 48), at(0), None).await.unwrap();

    encoder
        .set_configuration(EncoderConfig::default().codec(Codec::H264).bitrate(4_000_000))
        .await
        .unwrap();
    assert_eq!(encoder.state().await.unwrap(), SessionState::Invalidated);
    assert_eq!(probe.created(), 1);

    encoder.push_frame(frame(64, 48), at(16), None).await.unwrap();
    assert_eq!(probe.created(), 2);
    assert_eq!(probe.destroyed(), 1);

    encoder
        .set_configuration(EncoderConfig::default().codec(Codec::H264).bitrate(4_000_000))
        .await
        .unwrap();
    assert_eq!(encoder.state().await.unwrap(), SessionState::Valid);
    encoder.push_frame(frame(64, 48), at(33), None).await.unwrap();
    assert_eq!(probe.created(), 2);

    let config = encoder.configuration().await.unwrap();
    assert_eq!(config.codec, Codec::H264);
    encoder.shutdown().await.unwrap();
}

#[tokio::test]
async fn configuration_reverted_before_next_frame_keeps_handle() {
    let (encoder, probe) = controller(EncoderConfig::default());
    let mut sub = encoder.subscribe();
    encoder.push_frame(frame(64, 48), at(0), None).await.unwrap();

    encoder
        .set_configuration(EncoderConfig::default().codec(Codec::H264))
        .await
        .unwrap();
    encoder.set_configuration(EncoderConfig::default()).await.unwrap();
    assert_eq!(encoder.state().await.unwrap(), SessionState::Valid);

    encoder.push_frame(frame(64, 48), at(16), None).await.unwrap();
    next_sample(&mut sub).await;
    let second = next_sample(&mut sub).await;

    assert_eq!(second.format.codec_name, "hevc");
    assert_eq!((probe.created(), probe.destroyed()), (1, 0));
    encoder.shutdown().await.unwrap();
}

#[tokio::test]
async fn dimension_change_recreates_at_new_size() {
    let (encoder, probe) = controller(EncoderConfig::default());
    encoder.push_frame(frame(64, 48), at(0), None).await.unwrap();
    encoder.push_frame(frame(128, 72), at(16), None).await.unwrap();

    assert_eq!(probe.created(), 2);
    assert_eq!(probe.destroyed(), 1);
    assert_eq!(probe.creations()[1].0, Dimensions::new(128, 72));
    encoder.shutdown().await.unwrap();
}

#[tokio::test]
async fn external_trigger_forces_recreation() {
    init_tracing();
    let trigger = InvalidationTrigger::new();
    let backend = NullBackend::new();
    let probe = backend.probe();
    let encoder =
        VideoEncoder::with_trigger(backend, EncoderConfig::default(), trigger.listen()).unwrap();

    encoder.push_frame(frame(64, 48), at(0), None).await.unwrap();
    assert_eq!(trigger.fire(), 1);
    encoder.push_frame(frame(64, 48), at(16), None).await.unwrap();

    assert_eq!(probe.created(), 2);
    assert_eq!(probe.destroyed(), 1);
    assert_eq!(encoder.stats().await.unwrap().external_triggers, 1);

    encoder.shutdown().await.unwrap();
    assert_eq!(trigger.listener_count(), 0);
}

#[tokio::test]
async fn explicit_invalidation_is_lazy() {
    let (encoder, probe) = controller(EncoderConfig::default());
    encoder.invalidate().await.unwrap();
    assert_eq!(encoder.state().await.unwrap(), SessionState::Absent);

    encoder.push_frame(frame(64, 48), at(0), None).await.unwrap();
    encoder.invalidate().await.unwrap();
    assert_eq!(encoder.state().await.unwrap(), SessionState::Invalidated);
    assert_eq!(probe.destroyed(), 0);

    encoder.push_frame(frame(64, 48), at(16), None).await.unwrap();
    assert_eq!(probe.created(), 2);
    assert_eq!(probe.destroyed(), 1);
    encoder.shutdown().await.unwrap();
}

#[tokio::test]
async fn late_subscriber_sees_only_later_samples() {
    let (encoder, _probe) = controller(EncoderConfig::default());
    let mut early = encoder.subscribe();

    encoder.push_frame(frame(8, 8), at(0), None).await.unwrap();
    encoder.push_frame(frame(8, 8), at(16), None).await.unwrap();
    next_sample(&mut early).await;
    next_sample(&mut early).await;

    let mut late = encoder.subscribe();
    assert_eq!(encoder.subscriber_count(), 2);
    encoder.push_frame(frame(8, 8), at(33), None).await.unwrap();

    assert_eq!(next_sample(&mut early).await.presentation_time, Duration::from_millis(33));
    assert_eq!(next_sample(&mut late).await.presentation_time, Duration::from_millis(33));
    assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));

    drop(late);
    assert_eq!(encoder.subscriber_count(), 1);
    encoder.shutdown().await.unwrap();
}

#[tokio::test]
async fn concrete_scenario() {
    let c1 = EncoderConfig::default();
    let c2 = EncoderConfig::ultra_low_latency().codec(Codec::H264);
    let (encoder, probe) = controller(c1);
    let mut first = encoder.subscribe();

    // F1
    encoder.push_frame(frame(640, 480), at(0), None).await.unwrap();
    let f1 = next_sample(&mut first).await;
    assert_eq!((probe.created(), probe.submitted()), (1, 1));
    assert_eq!(f1.format.dimensions, Dimensions::new(640, 480));
    assert_eq!(f1.format.codec_name, "hevc");

    // F2 under C2
    encoder.set_configuration(c2).await.unwrap();
    encoder.push_frame(frame(640, 480), at(16), None).await.unwrap();
    let f2 = next_sample(&mut first).await;
    assert_eq!((probe.created(), probe.destroyed(), probe.submitted()), (2, 1, 2));
    assert_eq!(f2.format.codec_name, "h264");

    // F3 at a new size
    encoder.push_frame(frame(1280, 720), at(33), None).await.unwrap();
    let f3 = next_sample(&mut first).await;
    assert_eq!((probe.created(), probe.destroyed()), (3, 2));
    assert_eq!(f3.format.dimensions, Dimensions::new(1280, 720));

    // F4 after swapping subscribers
    assert!(encoder.unsubscribe(first.id()));
    let mut second = encoder.subscribe();
    encoder.push_frame(frame(1280, 720), at(50), None).await.unwrap();

    let f4 = next_sample(&mut second).await;
    assert_eq!(f4.presentation_time, Duration::from_millis(50));
    assert_eq!(probe.submitted(), 4);
    assert_eq!(probe.created(), 3);
    assert!(first.recv().await.is_none());

    encoder.shutdown().await.unwrap();
    assert!(matches!(second.try_recv(), Err(TryRecvError::Disconnected)));
}

#[tokio::test]
async fn creation_failure_leaves_session_absent_and_next_frame_retries() {
    let (encoder, probe) = controller(EncoderConfig::default());
    probe.fail_next_creations(1);
    let mut sub = encoder.subscribe();

    encoder.push_frame(frame(64, 48), at(0), None).await.unwrap();
    assert_eq!(encoder.state().await.unwrap(), SessionState::Absent);
    assert_eq!(probe.submitted(), 0);

    encoder.push_frame(frame(64, 48), at(16), None).await.unwrap();
    assert_eq!(encoder.state().await.unwrap(), SessionState::Valid);
    assert_eq!(next_sample(&mut sub).await.presentation_time, Duration::from_millis(16));

    let stats = encoder.stats().await.unwrap();
    assert_eq!(stats.creation_failures, 1);
    assert_eq!(stats.consecutive_creation_failures, 0);
    assert_eq!(stats.frames_dropped, 1);
    encoder.shutdown().await.unwrap();
}

#[tokio::test]
async fn encode_failures_reach_subscribers() {
    let (encoder, probe) = controller(EncoderConfig::default());
    probe.fail_encodes(true);
    let mut sub = encoder.subscribe();

    encoder.push_frame(frame(8, 8), at(40), None).await.unwrap();
    let failure = tokio::time::timeout(TIMEOUT, sub.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();

    assert_eq!(failure.status, NULL_ENCODE_FAILURE_STATUS);
    assert_eq!(failure.presentation_time, Some(Duration::from_millis(40)));
    assert_eq!(encoder.state().await.unwrap(), SessionState::Valid);
    encoder.shutdown().await.unwrap();
}

#[tokio::test]
async fn requested_keyframe_applies_to_next_frame_only() {
    let (encoder, _probe) = controller(EncoderConfig::default());
    let mut sub = encoder.subscribe();

    encoder.push_frame(frame(8, 8), at(0), None).await.unwrap();
    encoder.push_frame(frame(8, 8), at(16), None).await.unwrap();
    encoder.request_keyframe().await.unwrap();
    encoder.push_frame(frame(8, 8), at(33), None).await.unwrap();
    encoder.push_frame(frame(8, 8), at(50), None).await.unwrap();

    let mut keyframes = Vec::new();
    for _ in 0..4 {
        keyframes.push(next_sample(&mut sub).await.is_keyframe());
    }
    assert_eq!(keyframes, vec![true, false, true, false]);
    encoder.shutdown().await.unwrap();
}

#[tokio::test]
async fn samples_without_image_are_ignored_and_missing_timestamps_are_stamped() {
    let (encoder, probe) = controller(EncoderConfig::default());
    let mut sub = encoder.subscribe();

    encoder.push_sample(VideoSample::default()).await.unwrap();
    assert_eq!(probe.created(), 0);

    let sample = VideoSample {
        image: Some(frame(8, 8)),
        presentation_time: None,
        duration: Some(Duration::from_millis(16)),
    };
    encoder.push_sample(sample.clone()).await.unwrap();
    encoder.push_sample(sample).await.unwrap();

    let a = next_sample(&mut sub).await;
    let b = next_sample(&mut sub).await;
    assert!(a.presentation_time <= b.presentation_time);
    assert_eq!(a.duration, Some(Duration::from_millis(16)));
    encoder.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_destroys_once_and_finishes_subscribers() {
    let (encoder, probe) = controller(EncoderConfig::default());
    let mut sub = encoder.subscribe();
    encoder.push_frame(frame(8, 8), at(0), None).await.unwrap();

    encoder.shutdown().await.unwrap();
    assert_eq!(probe.destroyed(), 1);
    assert_eq!(probe.live(), 0);
    assert_eq!(encoder.subscriber_count(), 0);

    // The in-flight sample is still delivered before the end of stream.
    assert!(sub.recv().await.is_some());
    assert!(sub.recv().await.is_none());

    assert!(matches!(encoder.shutdown().await, Err(SessionError::Closed)));
    assert!(matches!(
        encoder.push_frame(frame(8, 8), None, None).await,
        Err(SessionError::Closed)
    ));
    assert!(encoder.subscribe().recv().await.is_none());
}

#[tokio::test]
async fn dropping_controller_tears_down() {
    let (encoder, probe) = controller(EncoderConfig::default());
    encoder.push_frame(frame(8, 8), at(0), None).await.unwrap();
    let hub = Arc::clone(encoder.hub());

    drop(encoder);
    tokio::time::timeout(TIMEOUT, hub.closed())
        .await
        .expect("hub closes after drop");
    assert_eq!(probe.live(), 0);
}

#[test]
fn concurrent_blocking_callers_share_one_handle() {
    let (encoder, probe) = controller(EncoderConfig::default());
    let encoder = Arc::new(encoder);
    let mut sub = encoder.subscribe();

    let producers: Vec<_> = (0..4u64)
        .map(|p| {
            let encoder = Arc::clone(&encoder);
            std::thread::spawn(move || {
                for i in 0..25 {
                    encoder
                        .blocking_push_frame(frame(32, 32), at(p * 1000 + i), None)
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    encoder.blocking_set_configuration(EncoderConfig::default()).unwrap();
    encoder.blocking_invalidate().unwrap();
    encoder
        .blocking_push_sample(
            VideoSample::new(frame(32, 32), Duration::from_secs(9))
                .with_duration(Duration::from_millis(16)),
        )
        .unwrap();

    let stats = encoder.blocking_stats().unwrap();
    assert_eq!(stats.frames_submitted, 101);
    assert_eq!(stats.handles_created, 2);
    encoder.blocking_shutdown().unwrap();
    assert_eq!(probe.live(), 0);

    let mut received = 0;
    while sub.blocking_recv().is_some() {
        received += 1;
    }
    assert_eq!(received, 101);
}
