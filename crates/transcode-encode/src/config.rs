use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Compression format requested from the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// H.264 / AVC.
    H264,
    /// H.265 / HEVC.
    #[default]
    Hevc,
}

impl Codec {
    /// Short lowercase name, stable across backends.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H264 => write!(f, "H.264"),
            Self::Hevc => write!(f, "HEVC"),
        }
    }
}

/// Encoder implementation hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderType {
    /// Intel/AMD VAAPI hardware encoder.
    Vaapi,
    /// NVIDIA NVENC hardware encoder.
    Nvenc,
    /// x264/x265 software encoder.
    Software,
}

impl EncoderType {
    /// Whether this encoder runs on dedicated hardware.
    #[must_use]
    pub fn is_hardware(self) -> bool {
        !matches!(self, Self::Software)
    }
}

impl std::fmt::Display for EncoderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vaapi => write!(f, "VAAPI"),
            Self::Nvenc => write!(f, "NVENC"),
            Self::Software => write!(f, "software"),
        }
    }
}

/// A codec-specific tuning value, passed to the backend uninterpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Encoder configuration.
///
/// Always replaced as a whole. The session controller keeps the value a
/// handle was created with and compares by value to detect drift, so two
/// configurations that compare equal never cause a recreation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Which codec to request.
    pub codec: Codec,

    /// Prefer latency over compression efficiency. `None` leaves the
    /// backend default in place.
    pub real_time: Option<bool>,

    /// Preferred encoder implementation. `None` means auto-detect.
    pub encoder: Option<EncoderType>,

    /// Target bitrate in bits per second.
    pub bitrate: Option<u32>,

    /// Maximum distance between keyframes, in frames.
    pub keyframe_interval: Option<u32>,

    /// Expected input frame rate.
    pub frame_rate: Option<u32>,

    /// Codec-specific properties, forwarded verbatim.
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: Codec::Hevc,
            real_time: None,
            encoder: None,
            bitrate: None,
            keyframe_interval: None,
            frame_rate: None,
            properties: BTreeMap::new(),
        }
    }
}

impl EncoderConfig {
    /// Preset for interactive streaming: real-time encoding, short GOP.
    #[must_use]
    pub fn ultra_low_latency() -> Self {
        Self {
            real_time: Some(true),
            keyframe_interval: Some(60),
            frame_rate: Some(60),
            ..Self::default()
        }
    }

    /// Set the codec.
    #[must_use]
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Set the real-time flag.
    #[must_use]
    pub fn real_time(mut self, real_time: bool) -> Self {
        self.real_time = Some(real_time);
        self
    }

    /// Prefer a specific encoder implementation.
    #[must_use]
    pub fn encoder(mut self, encoder: EncoderType) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Set the target bitrate (bits per second).
    #[must_use]
    pub fn bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    /// Add or replace a codec-specific property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Whether latency should be minimized.
    #[must_use]
    pub fn is_real_time(&self) -> bool {
        self.real_time.unwrap_or(false)
    }

    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("failed to parse encoder config")
    }
}

/// Load an encoder configuration from a TOML file.
///
/// Returns the default configuration if the file does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load(path: &Path) -> Result<EncoderConfig> {
    if !path.exists() {
        tracing::debug!(?path, "Encoder config not found, using defaults");
        return Ok(EncoderConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read encoder config: {}", path.display()))?;

    let config: EncoderConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse encoder config: {}", path.display()))?;

    tracing::info!(?path, codec = %config.codec, "Encoder configuration loaded");
    Ok(config)
}

/// Save an encoder configuration as TOML.
///
/// Writes to a temp file and renames it into place. Creates the parent
/// directory if it does not exist.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save(config: &EncoderConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config dir: {}", parent.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize encoder config")?;

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, contents)
        .with_context(|| format!("failed to write temp config: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename config: {}", path.display()))?;

    tracing::info!(?path, "Encoder configuration saved");
    Ok(())
}
