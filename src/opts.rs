use std::fmt;

#[cfg(feature = "video")]
use crate::track::TrackInfo;
#[cfg(feature = "video")]
use crate::video::{EngineError, VideoDecoder};

/// Default read-ahead buffer for the byte stream.
pub const DEFAULT_READ_BUFFER: usize = 64 * 1024;

/// Which tracks an opened stream should expose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum OpenMode {
    /// The first video track and the first audio track, whichever exist.
    #[default]
    Any,
    /// Only the first video track; audio packets are skipped.
    VideoOnly,
    /// Only the first audio track; video packets are skipped.
    AudioOnly,
}

impl OpenMode {
    pub fn wants_video(self) -> bool {
        matches!(self, Self::Any | Self::VideoOnly)
    }

    pub fn wants_audio(self) -> bool {
        matches!(self, Self::Any | Self::AudioOnly)
    }
}

#[cfg(feature = "video")]
pub(crate) type VideoFactory =
    Box<dyn FnOnce(&TrackInfo) -> Result<Box<dyn VideoDecoder>, EngineError> + Send>;

/// Options applied when opening a stream.
///
/// This is library-level configuration. The CLI maps its flags onto this type so other
/// frontends can build it programmatically.
pub struct OpenOptions {
    /// Track selection hint.
    pub mode: OpenMode,

    /// Size of the read-ahead buffer between the I/O callbacks and the demuxer.
    /// Values below [`crate::io::MIN_READ_BUFFER`] are raised to it.
    pub read_buffer_size: usize,

    #[cfg(feature = "video")]
    pub(crate) video_factory: Option<VideoFactory>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            mode: OpenMode::Any,
            read_buffer_size: DEFAULT_READ_BUFFER,
            #[cfg(feature = "video")]
            video_factory: None,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn read_buffer_size(mut self, bytes: usize) -> Self {
        self.read_buffer_size = bytes;
        self
    }

    /// Install the engine used by `decode_frame` for the selected video track.
    ///
    /// The factory runs once at open time with the track's metadata; an error there fails the
    /// open with `InvalidStreamFormat`.
    #[cfg(feature = "video")]
    pub fn video_decoder<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&TrackInfo) -> Result<Box<dyn VideoDecoder>, EngineError> + Send + 'static,
    {
        self.video_factory = Some(Box::new(factory));
        self
    }
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("OpenOptions");
        s.field("mode", &self.mode)
            .field("read_buffer_size", &self.read_buffer_size);
        #[cfg(feature = "video")]
        s.field("video_decoder", &self.video_factory.is_some());
        s.finish()
    }
}
