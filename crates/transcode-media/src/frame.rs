use std::ops::Deref;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::time::Duration;

/// Width and height of a frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel format of raw frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// BGRA with 8 bits per channel.
    Bgra,
    /// BGRx with 8 bits per channel, padding byte ignored.
    Bgrx,
    /// RGBA with 8 bits per channel.
    Rgba,
    /// Planar 4:2:0 YUV (I420).
    I420,
}

impl PixelFormat {
    /// Bytes per pixel of the first plane.
    #[must_use]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgra | Self::Bgrx | Self::Rgba => 4,
            Self::I420 => 1,
        }
    }

    /// Caps format string understood by video pipelines.
    #[must_use]
    pub fn caps_name(self) -> &'static str {
        match self {
            Self::Bgra => "BGRA",
            Self::Bgrx => "BGRx",
            Self::Rgba => "RGBA",
            Self::I420 => "I420",
        }
    }
}

/// Failure to gain exclusive read access to a frame's backing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameLockError {
    #[error("frame buffer is locked for writing")]
    Busy,

    #[error("frame buffer lock was poisoned by a panicking writer")]
    Poisoned,
}

/// A raw, uncompressed video frame.
///
/// Cloning is cheap: clones share the same backing buffer. Producers fill
/// the buffer through [`write`](RawFrame::write); the encoder reads it
/// through [`lock`](RawFrame::lock), which never blocks.
#[derive(Debug, Clone)]
pub struct RawFrame {
    buffer: Arc<RwLock<Vec<u8>>>,
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: usize,
}

impl RawFrame {
    /// Wrap tightly packed pixel data (stride = width * bytes per pixel).
    #[must_use]
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        let stride = (width as usize).saturating_mul(format.bytes_per_pixel());
        Self::with_stride(data, width, height, format, stride)
    }

    #[must_use]
    pub fn with_stride(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: usize,
    ) -> Self {
        Self {
            buffer: Arc::new(RwLock::new(data)),
            width,
            height,
            format,
            stride,
        }
    }

    /// Allocate a zeroed, tightly packed frame.
    #[must_use]
    pub fn blank(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = Self::expected_len(width, height, format);
        Self::new(vec![0; len], width, height, format)
    }

    /// Expected buffer length for tightly packed data.
    #[must_use]
    pub fn expected_len(width: u32, height: u32, format: PixelFormat) -> usize {
        let pixels = (width as usize).saturating_mul(height as usize);
        match format {
            // Y plane plus two quarter-size chroma planes.
            PixelFormat::I420 => pixels + 2 * pixels.div_ceil(4),
            _ => pixels.saturating_mul(format.bytes_per_pixel()),
        }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    #[must_use]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bytes per row of the first plane.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Take a shared lock on the backing memory without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`FrameLockError::Busy`] while a producer holds the write
    /// lock and [`FrameLockError::Poisoned`] if a writer panicked.
    pub fn lock(&self) -> Result<FrameLock<'_>, FrameLockError> {
        let guard = match self.buffer.try_read() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(FrameLockError::Busy),
            Err(TryLockError::Poisoned(_)) => return Err(FrameLockError::Poisoned),
        };
        Ok(FrameLock { frame: self, guard })
    }

    /// Lock the backing memory for writing, blocking until readers are done.
    ///
    /// # Errors
    ///
    /// Returns [`FrameLockError::Poisoned`] if a previous writer panicked.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<u8>>, FrameLockError> {
        self.buffer.write().map_err(|_| FrameLockError::Poisoned)
    }
}

/// Read access to a frame's pixels, held for the duration of a submission.
pub struct FrameLock<'a> {
    frame: &'a RawFrame,
    guard: RwLockReadGuard<'a, Vec<u8>>,
}

impl FrameLock<'_> {
    #[must_use]
    pub fn frame(&self) -> &RawFrame {
        self.frame
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.guard
    }
}

impl Deref for FrameLock<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// A captured sample that may or may not carry an image.
///
/// Capture pipelines also emit samples without pixels (format changes,
/// markers); those are ignored by the encoder.
#[derive(Debug, Clone, Default)]
pub struct VideoSample {
    pub image: Option<RawFrame>,
    pub presentation_time: Option<Duration>,
    pub duration: Option<Duration>,
}

impl VideoSample {
    #[must_use]
    pub fn new(image: RawFrame, presentation_time: Duration) -> Self {
        Self {
            image: Some(image),
            presentation_time: Some(presentation_time),
            duration: None,
        }
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}
