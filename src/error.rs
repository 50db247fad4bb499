use std::collections::TryReserveError;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type shared by every public operation.
///
/// Kept independent of `anyhow` so downstream libraries aren't forced to adopt it in their own
/// public APIs. `StreamEnd` is a regular variant: callers are expected to match on it rather than
/// treat it as exceptional.
#[derive(Debug, Error)]
pub enum Error {
    #[error("end of stream")]
    StreamEnd,

    #[error("{0} support is not available")]
    DisabledFunction(String),

    #[error("failed to open '{}'", .path.display())]
    FileOpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid stream format: {0}")]
    InvalidStreamFormat(String),

    #[error("out of memory")]
    OutOfMemory(#[from] TryReserveError),

    #[error("I/O error")]
    Io(#[source] io::Error),

    #[error("stream is not seekable")]
    UnseekableStream,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub(crate) fn format(message: impl Into<String>) -> Self {
        Self::InvalidStreamFormat(message.into())
    }

    pub(crate) fn decode(message: impl fmt::Display) -> Self {
        Self::Decode(message.to_string())
    }

    pub(crate) fn disabled(what: impl Into<String>) -> Self {
        Self::DisabledFunction(what.into())
    }

    pub(crate) fn engine(err: Box<dyn StdError + Send + Sync>) -> Self {
        Self::Decode(format!("{err}"))
    }

    /// The coarse category of this error, as reported by `WebmStream::last_error`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StreamEnd => ErrorKind::StreamEnd,
            Self::DisabledFunction(_) => ErrorKind::DisabledFunction,
            Self::FileOpenFailed { .. } => ErrorKind::FileOpenFailed,
            Self::InvalidStreamFormat(_) => ErrorKind::InvalidStreamFormat,
            Self::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Self::Io(_) => ErrorKind::Io,
            Self::UnseekableStream => ErrorKind::UnseekableStream,
            Self::Decode(_) => ErrorKind::Decode,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    pub fn is_stream_end(&self) -> bool {
        matches!(self, Self::StreamEnd)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Copyable discriminant of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StreamEnd,
    DisabledFunction,
    FileOpenFailed,
    InvalidStreamFormat,
    OutOfMemory,
    Io,
    UnseekableStream,
    Decode,
    InvalidArgument,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StreamEnd => "stream_end",
            Self::DisabledFunction => "disabled_function",
            Self::FileOpenFailed => "file_open_failed",
            Self::InvalidStreamFormat => "invalid_stream_format",
            Self::OutOfMemory => "out_of_memory",
            Self::Io => "io_error",
            Self::UnseekableStream => "unseekable_stream",
            Self::Decode => "decode_error",
            Self::InvalidArgument => "invalid_argument",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
