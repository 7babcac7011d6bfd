//! `GStreamer` encoding backend.
//!
//! Pipeline: `appsrc ! videoconvert ! capsfilter ! encoder ! parser ! appsink`
//!
//! Supports hardware-accelerated encoding via VAAPI (Intel/AMD) and
//! NVENC (NVIDIA), with automatic fallback to x264/x265 software encoding.
//! Encoded access units are reported from the appsink streaming thread.

use std::time::Duration;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use transcode_media::{
    Dimensions, EncodeFailure, EncodedSample, FrameLock, PixelFormat, SampleFormat,
};

use crate::backend::{EncoderBackend, EncoderHandle, FrameTiming, OutputSink, SubmitOptions};
use crate::config::{Codec, EncoderConfig, EncoderType};
use crate::EncodeError;

/// Status reported for pipeline errors posted on the bus.
pub const GST_PIPELINE_ERROR_STATUS: i32 = -2;
/// Status reported when an appsink sample carries no readable buffer.
pub const GST_SAMPLE_ERROR_STATUS: i32 = -3;

const DEFAULT_BITRATE: u32 = 10_000_000;
const DEFAULT_KEYFRAME_INTERVAL: u32 = 60;
const DEFAULT_FRAME_RATE: u32 = 30;

/// `GStreamer` element factory name for an encoder and codec.
#[must_use]
pub fn element_name(encoder_type: EncoderType, codec: Codec) -> &'static str {
    match (encoder_type, codec) {
        (EncoderType::Vaapi, Codec::H264) => "vaapih264enc",
        (EncoderType::Vaapi, Codec::Hevc) => "vaapih265enc",
        (EncoderType::Nvenc, Codec::H264) => "nvh264enc",
        (EncoderType::Nvenc, Codec::Hevc) => "nvh265enc",
        (EncoderType::Software, Codec::H264) => "x264enc",
        (EncoderType::Software, Codec::Hevc) => "x265enc",
    }
}

fn parser_name(codec: Codec) -> &'static str {
    match codec {
        Codec::H264 => "h264parse",
        Codec::Hevc => "h265parse",
    }
}

fn output_caps_name(codec: Codec) -> &'static str {
    match codec {
        Codec::H264 => "video/x-h264",
        Codec::Hevc => "video/x-h265",
    }
}

/// Check if a `GStreamer` element factory is available.
#[must_use]
pub fn is_encoder_available(element_name: &str) -> bool {
    gst::ElementFactory::find(element_name).is_some()
}

/// Detect the best available encoder for `codec`.
///
/// Checks in priority order: VAAPI (hardware) -> NVENC (hardware) -> software.
#[must_use]
pub fn detect_best_encoder(codec: Codec) -> EncoderType {
    [EncoderType::Vaapi, EncoderType::Nvenc]
        .into_iter()
        .find(|&candidate| is_encoder_available(element_name(candidate, codec)))
        .unwrap_or(EncoderType::Software)
}

/// Backend that builds one `GStreamer` pipeline per handle.
#[derive(Debug, Clone)]
pub struct GstBackend {
    input_format: PixelFormat,
}

impl GstBackend {
    /// Backend accepting frames in `input_format`.
    #[must_use]
    pub fn new(input_format: PixelFormat) -> Self {
        Self { input_format }
    }
}

impl Default for GstBackend {
    fn default() -> Self {
        Self::new(PixelFormat::Bgrx)
    }
}

impl EncoderBackend for GstBackend {
    fn name(&self) -> &str {
        "gstreamer"
    }

    fn create(
        &mut self,
        config: &EncoderConfig,
        dimensions: Dimensions,
        output: OutputSink,
    ) -> Result<Box<dyn EncoderHandle>, EncodeError> {
        gst::init().map_err(|e| EncodeError::GstInit(e.to_string()))?;

        let encoder_type = config
            .encoder
            .unwrap_or_else(|| detect_best_encoder(config.codec));
        tracing::info!(
            %encoder_type,
            hardware = encoder_type.is_hardware(),
            codec = %config.codec,
            "Selected encoder"
        );

        let (pipeline, appsrc, appsink) =
            build_pipeline(config, encoder_type, dimensions, self.input_format)?;

        install_output_callbacks(&pipeline, &appsink, config.codec, dimensions, output);

        // Prepare to encode: bring the pipeline up before the first frame.
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncodeError::StateChange(e.to_string()))?;

        Ok(Box::new(GstHandle {
            pipeline: Some(pipeline),
            appsrc,
            dimensions,
            input_format: self.input_format,
            encoder_type,
        }))
    }
}

/// A running `GStreamer` encoding pipeline.
pub struct GstHandle {
    pipeline: Option<gst::Pipeline>,
    appsrc: gst_app::AppSrc,
    dimensions: Dimensions,
    input_format: PixelFormat,
    encoder_type: EncoderType,
}

impl EncoderHandle for GstHandle {
    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    fn submit(
        &mut self,
        frame: &FrameLock<'_>,
        timing: FrameTiming,
        options: SubmitOptions,
    ) -> Result<(), EncodeError> {
        if self.pipeline.is_none() {
            return Err(EncodeError::Destroyed);
        }
        if frame.frame().format() != self.input_format {
            return Err(EncodeError::Rejected(format!(
                "expected {} input, got {}",
                self.input_format.caps_name(),
                frame.frame().format().caps_name()
            )));
        }

        if options.force_keyframe {
            let event = gst_video::DownstreamForceKeyUnitEvent::builder()
                .all_headers(true)
                .build();
            self.appsrc.send_event(event);
            tracing::debug!("Forced keyframe requested");
        }

        let mut buffer = gst::Buffer::with_size(frame.len())
            .map_err(|e| EncodeError::PushBuffer(e.to_string()))?;
        {
            let buffer_ref = buffer.get_mut().ok_or(EncodeError::BufferMap)?;
            buffer_ref.set_pts(clock_time(timing.presentation_time));
            if let Some(duration) = timing.duration {
                buffer_ref.set_duration(clock_time(duration));
            }
            let mut map = buffer_ref.map_writable().map_err(|_| EncodeError::BufferMap)?;
            map.copy_from_slice(frame.data());
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| EncodeError::PushBuffer(e.to_string()))?;
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
            tracing::info!(
                encoder_type = %self.encoder_type,
                dimensions = %self.dimensions,
                "Encoder pipeline stopped"
            );
        }
    }
}

impl Drop for GstHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[allow(clippy::cast_possible_truncation)]
fn clock_time(duration: Duration) -> gst::ClockTime {
    gst::ClockTime::from_nseconds(duration.as_nanos() as u64)
}

fn to_duration(time: gst::ClockTime) -> Duration {
    Duration::from_nanos(time.nseconds())
}

/// Route appsink samples and bus errors into the output sink.
fn install_output_callbacks(
    pipeline: &gst::Pipeline,
    appsink: &gst_app::AppSink,
    codec: Codec,
    dimensions: Dimensions,
    output: OutputSink,
) {
    if let Some(bus) = pipeline.bus() {
        let errors = output.clone();
        bus.set_sync_handler(move |_, msg| {
            if let gst::MessageView::Error(err) = msg.view() {
                tracing::warn!(error = %err.error(), "Encoder pipeline error");
                errors.emit_failure(EncodeFailure::new(
                    GST_PIPELINE_ERROR_STATUS,
                    err.error().to_string(),
                ));
            }
            gst::BusSyncReply::Drop
        });
    }

    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                match sample_to_output(&sample, codec, dimensions) {
                    Ok(encoded) => output.emit_sample(encoded),
                    Err(failure) => output.emit_failure(failure),
                };
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );
}

fn sample_to_output(
    sample: &gst::Sample,
    codec: Codec,
    dimensions: Dimensions,
) -> Result<EncodedSample, EncodeFailure> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| EncodeFailure::new(GST_SAMPLE_ERROR_STATUS, "sample has no buffer"))?;
    let presentation_time = buffer.pts().map_or(Duration::ZERO, to_duration);
    let map = buffer.map_readable().map_err(|_| {
        EncodeFailure::new(GST_SAMPLE_ERROR_STATUS, "failed to map sample buffer")
            .at(presentation_time)
    })?;

    // DELTA_UNIT flag means it's NOT a keyframe
    let keyframe = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);

    Ok(EncodedSample {
        presentation_time,
        duration: buffer.duration().map(to_duration),
        data: Bytes::copy_from_slice(&map),
        format: SampleFormat {
            codec_name: codec.name(),
            dimensions,
            keyframe,
        },
    })
}

/// Build the `GStreamer` encoding pipeline.
fn build_pipeline(
    config: &EncoderConfig,
    encoder_type: EncoderType,
    dimensions: Dimensions,
    input_format: PixelFormat,
) -> Result<(gst::Pipeline, gst_app::AppSrc, gst_app::AppSink), EncodeError> {
    let width =
        i32::try_from(dimensions.width).map_err(|_| EncodeError::InvalidDimensions(dimensions))?;
    let height =
        i32::try_from(dimensions.height).map_err(|_| EncodeError::InvalidDimensions(dimensions))?;
    if width == 0 || height == 0 {
        return Err(EncodeError::InvalidDimensions(dimensions));
    }
    let framerate = i32::try_from(config.frame_rate.unwrap_or(DEFAULT_FRAME_RATE))
        .unwrap_or(i32::MAX);

    let pipeline = gst::Pipeline::new();

    // Timestamps come from the caller, so appsrc must not stamp buffers.
    let appsrc = gst_app::AppSrc::builder()
        .name("source")
        .caps(
            &gst::Caps::builder("video/x-raw")
                .field("format", input_format.caps_name())
                .field("width", width)
                .field("height", height)
                .field("framerate", gst::Fraction::new(framerate, 1))
                .build(),
        )
        .format(gst::Format::Time)
        .is_live(true)
        .do_timestamp(false)
        .build();

    let videoconvert = make_element("videoconvert", "convert")?;

    // Every encoder here accepts I420; pin it so negotiation is predictable.
    let capsfilter = make_element("capsfilter", "format")?;
    capsfilter.set_property(
        "caps",
        gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .build(),
    );

    let encoder = make_element(element_name(encoder_type, config.codec), "encoder")?;
    configure_encoder(&encoder, encoder_type, config)?;

    let parser = make_element(parser_name(config.codec), "parser")?;

    let appsink = gst_app::AppSink::builder()
        .name("sink")
        .caps(
            &gst::Caps::builder(output_caps_name(config.codec))
                .field("stream-format", "byte-stream")
                .field("alignment", "au")
                .build(),
        )
        .sync(false)
        .build();

    let elements = [
        appsrc.upcast_ref(),
        &videoconvert,
        &capsfilter,
        &encoder,
        &parser,
        appsink.upcast_ref(),
    ];
    pipeline
        .add_many(elements)
        .map_err(|e| EncodeError::PipelineLink(e.to_string()))?;
    gst::Element::link_many(elements).map_err(|e| EncodeError::PipelineLink(e.to_string()))?;

    tracing::info!(
        %encoder_type,
        codec = %config.codec,
        %dimensions,
        framerate,
        "GStreamer encoding pipeline built"
    );

    Ok((pipeline, appsrc, appsink))
}

/// Create a `GStreamer` element by factory name.
fn make_element(factory_name: &str, element_name: &str) -> Result<gst::Element, EncodeError> {
    gst::ElementFactory::make(factory_name)
        .name(element_name)
        .build()
        .map_err(|e| EncodeError::ElementCreate {
            name: factory_name.to_string(),
            reason: e.to_string(),
        })
}

/// Configure encoder-specific properties, then apply pass-through properties.
///
/// Values are converted to the type each property declares, so a value the
/// element would reject fails creation instead of aborting the thread.
fn configure_encoder(
    encoder: &gst::Element,
    encoder_type: EncoderType,
    config: &EncoderConfig,
) -> Result<(), EncodeError> {
    let bitrate_kbps = (config.bitrate.unwrap_or(DEFAULT_BITRATE) / 1000).to_string();
    let keyframe_interval = config
        .keyframe_interval
        .unwrap_or(DEFAULT_KEYFRAME_INTERVAL)
        .to_string();
    let low_latency = config.is_real_time();

    let mut tuning: Vec<(&str, &str)> = match encoder_type {
        EncoderType::Vaapi => vec![
            ("rate-control", "cbr"),
            ("bitrate", bitrate_kbps.as_str()),
            ("keyframe-period", keyframe_interval.as_str()),
        ],
        EncoderType::Nvenc => vec![
            ("bitrate", bitrate_kbps.as_str()),
            ("gop-size", keyframe_interval.as_str()),
        ],
        EncoderType::Software => vec![
            ("bitrate", bitrate_kbps.as_str()),
            ("key-int-max", keyframe_interval.as_str()),
        ],
    };
    if low_latency {
        match encoder_type {
            EncoderType::Vaapi => tuning.push(("tune", "low-power")),
            EncoderType::Nvenc => {
                tuning.extend([("preset", "low-latency-hq"), ("zerolatency", "true")]);
            }
            EncoderType::Software => {
                tuning.extend([("tune", "zerolatency"), ("speed-preset", "ultrafast")]);
            }
        }
    }

    for (name, text) in tuning {
        set_property_checked(encoder, name, text).map_err(EncodeError::Creation)?;
    }

    for (key, value) in &config.properties {
        if encoder.find_property(key).is_none() {
            tracing::warn!(%encoder_type, property = %key, "Encoder has no such property, ignoring");
            continue;
        }
        set_property_checked(encoder, key, &value.to_string()).map_err(EncodeError::Creation)?;
    }

    tracing::debug!(
        %encoder_type,
        %bitrate_kbps,
        %keyframe_interval,
        low_latency,
        properties = config.properties.len(),
        "Encoder configured"
    );
    Ok(())
}

/// Parse `text` as the type of property `name` and set it.
fn set_property_checked(element: &gst::Element, name: &str, text: &str) -> Result<(), String> {
    let pspec = element
        .find_property(name)
        .ok_or_else(|| format!("{} has no property '{name}'", element.name()))?;

    let flags = pspec.flags();
    if !flags.contains(glib::ParamFlags::WRITABLE)
        || flags.contains(glib::ParamFlags::CONSTRUCT_ONLY)
    {
        return Err(format!("property '{name}' cannot be set"));
    }

    let value = glib::Value::deserialize(text, pspec.value_type()).map_err(|e| {
        format!(
            "'{text}' is not a valid {} for property '{name}': {e}",
            pspec.value_type()
        )
    })?;
    if !in_range(&pspec, &value) {
        return Err(format!("'{text}' is out of range for property '{name}'"));
    }

    element.set_property_from_value(name, &value);
    Ok(())
}

/// Whether a numeric `value` lies within the bounds `pspec` declares.
fn in_range(pspec: &glib::ParamSpec, value: &glib::Value) -> bool {
    fn within<T: PartialOrd>(v: Result<T, impl Sized>, min: T, max: T) -> bool {
        v.is_ok_and(|v| min <= v && v <= max)
    }

    if let Some(p) = pspec.downcast_ref::<glib::ParamSpecInt>() {
        within(value.get::<i32>(), p.minimum(), p.maximum())
    } else if let Some(p) = pspec.downcast_ref::<glib::ParamSpecUInt>() {
        within(value.get::<u32>(), p.minimum(), p.maximum())
    } else if let Some(p) = pspec.downcast_ref::<glib::ParamSpecInt64>() {
        within(value.get::<i64>(), p.minimum(), p.maximum())
    } else if let Some(p) = pspec.downcast_ref::<glib::ParamSpecUInt64>() {
        within(value.get::<u64>(), p.minimum(), p.maximum())
    } else if let Some(p) = pspec.downcast_ref::<glib::ParamSpecDouble>() {
        within(value.get::<f64>(), p.minimum(), p.maximum())
    } else if let Some(p) = pspec.downcast_ref::<glib::ParamSpecFloat>() {
        within(value.get::<f32>(), p.minimum(), p.maximum())
    } else {
        true
    }
}
