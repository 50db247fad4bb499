//! `webmdec`: a pull-based WebM reader.
//!
//! This crate provides:
//! - A byte-stream layer over caller-supplied I/O callbacks (files, memory, custom sources)
//! - A WebM/Matroska demuxer that selects the first video and first audio track
//! - Vorbis and PCM audio decoding into interleaved `f32` samples
//! - A seam for plugging in a video codec engine
//!
//! Most consumers start with [`WebmStream`]:
//!
//! ```no_run
//! use webmdec::{OpenMode, OpenOptions, WebmStream};
//!
//! let mut stream = WebmStream::open_file("clip.webm", OpenOptions::new().mode(OpenMode::AudioOnly))?;
//! loop {
//!     match stream.decode_frame() {
//!         Ok(frame) => {
//!             if let Some(audio) = frame.audio {
//!                 println!("{} frames at {:.3}s", audio.frames, audio.timestamp);
//!             }
//!         }
//!         Err(e) if e.is_stream_end() => break,
//!         Err(e) => return Err(e.into()),
//!     }
//! }
//! stream.close();
//! # Ok::<(), anyhow::Error>(())
//! ```

// High-level API (most consumers should start here).
pub mod opts;
pub mod stream;

// Container parsing.
pub mod block;
pub mod demux;
pub mod ebml;
pub mod elements;
pub mod track;

// Byte-stream layer.
pub mod io;

// Codec engines.
#[cfg(feature = "audio")]
pub mod audio;
#[cfg(feature = "video")]
pub mod video;

pub mod error;
pub mod info;

// Logging configuration and control.
#[cfg(feature = "logging")]
pub mod logging;

pub use error::{Error, ErrorKind, Result};
pub use info::StreamInfo;
pub use io::Callbacks;
pub use opts::{OpenMode, OpenOptions};
pub use stream::{AudioSamples, DecodedFrame, RawAudio, RawFrame, VideoFrame, VideoPicture, WebmStream};
#[cfg(feature = "video")]
pub use video::{EngineError, VideoDecoder};
