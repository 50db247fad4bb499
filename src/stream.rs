//! The stream handle: open, pull frames, seek, close.
//!
//! A `WebmStream` owns the byte stream, the demuxer and (when compiled in) the audio adapter and
//! video engine. Frames come back as views into buffers owned by the handle; the borrow checker
//! makes sure a view is gone before the next call that could overwrite it.
//!
//! States: open, end-of-stream (after a call returned `StreamEnd`), closed (`close` consumes the
//! handle). Seek and rewind bring an end-of-stream handle back to open.

use std::path::Path;

use tracing::{debug, trace};

#[cfg(feature = "audio")]
use crate::audio::AudioDecoder;
use crate::demux::{Demuxer, Packet};
use crate::error::{Error, ErrorKind, Result};
use crate::info::StreamInfo;
use crate::io::{ByteStream, Callbacks, FileCallbacks, MemoryCallbacks};
use crate::opts::OpenOptions;
use crate::track::{TrackInfo, TrackKind};
#[cfg(feature = "video")]
use crate::video::VideoDecoder;

/// A compressed video frame as stored in the container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoFrame<'a> {
    pub data: &'a [u8],
    pub timestamp: f64,
    pub keyframe: bool,
    /// Decodes but is never displayed (VP8/VP9 alt-ref frames).
    pub invisible: bool,
}

/// A compressed audio packet as stored in the container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawAudio<'a> {
    pub data: &'a [u8],
    pub timestamp: f64,
}

/// Result of [`WebmStream::read_frame`]: at most one unit per selected track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawFrame<'a> {
    pub video: Option<VideoFrame<'a>>,
    pub audio: Option<RawAudio<'a>>,
}

/// A picture produced by the installed video engine, in whatever layout that engine writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoPicture<'a> {
    pub data: &'a [u8],
    pub timestamp: f64,
}

/// Interleaved `f32` samples decoded from one audio packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioSamples<'a> {
    pub samples: &'a [f32],
    /// Samples per channel.
    pub frames: usize,
    pub channels: u32,
    pub timestamp: f64,
}

/// Result of [`WebmStream::decode_frame`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedFrame<'a> {
    pub video: Option<VideoPicture<'a>>,
    pub audio: Option<AudioSamples<'a>>,
}

/// Timestamp and flags of the video packet a call consumed.
#[derive(Clone, Copy)]
struct VideoStamp {
    timestamp: f64,
    keyframe: bool,
    invisible: bool,
}

impl VideoStamp {
    fn of(packet: &Packet) -> Self {
        Self {
            timestamp: packet.timestamp(),
            keyframe: packet.keyframe,
            invisible: packet.invisible,
        }
    }
}

/// What a read/decode call produced, before it's turned into borrowed views.
#[derive(Default, Clone, Copy)]
struct Produced {
    video: Option<VideoStamp>,
    audio: Option<(f64, usize)>,
}

impl Produced {
    fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }

    fn latest(&self) -> Option<f64> {
        let v = self.video.map(|v| v.timestamp);
        let a = self.audio.map(|(ts, _)| ts);
        match (v, a) {
            (Some(v), Some(a)) => Some(v.max(a)),
            (v, a) => v.or(a),
        }
    }
}

/// Running position of decoded audio, used to stamp sample output.
///
/// Anchored on the container timestamp of the first packet fed to the decoder after open, seek,
/// rewind, or raw audio reads; counts decoded samples from there.
#[derive(Debug, Clone, Copy, Default)]
struct AudioClock {
    anchor: Option<f64>,
    frames: u64,
}

impl AudioClock {
    fn observe(&mut self, packet_ts: f64) {
        self.anchor.get_or_insert(packet_ts);
    }

    /// Timestamp for `frames` new samples, then advance.
    fn stamp(&mut self, frames: usize, sample_rate: u32) -> f64 {
        let anchor = self.anchor.unwrap_or(0.0);
        let ts = anchor + self.frames as f64 / sample_rate.max(1) as f64;
        self.frames += frames as u64;
        ts
    }
}

/// An open WebM stream.
///
/// Not `Sync`: a handle is driven from one thread at a time. Distinct handles are independent.
pub struct WebmStream {
    // Field order is release order on drop: decoders first, then the demuxer and its callbacks.
    #[cfg(feature = "audio")]
    audio: Option<AudioDecoder>,
    #[cfg(feature = "video")]
    video_engine: Option<Box<dyn VideoDecoder>>,
    demuxer: Demuxer,

    video_buf: Vec<u8>,
    audio_buf: Vec<u8>,

    current: f64,
    audio_clock: AudioClock,
    eos: bool,
    last_error: Option<ErrorKind>,
}

impl WebmStream {
    /// Open a file on disk.
    pub fn open_file(path: impl AsRef<Path>, opts: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let callbacks = FileCallbacks::open(path).map_err(|source| Error::FileOpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::open_callbacks(callbacks, opts)
    }

    /// Open an in-memory buffer. The buffer is owned by the stream until close.
    pub fn open_buffer<B>(data: B, opts: OpenOptions) -> Result<Self>
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        Self::open_callbacks(MemoryCallbacks::new(data), opts)
    }

    /// Open a caller-supplied set of I/O callbacks.
    ///
    /// On failure the callbacks' `close` has already run by the time this returns.
    pub fn open_callbacks<C>(callbacks: C, opts: OpenOptions) -> Result<Self>
    where
        C: Callbacks + 'static,
    {
        Self::open_boxed(Box::new(callbacks), opts)
    }

    fn open_boxed(callbacks: Box<dyn Callbacks>, opts: OpenOptions) -> Result<Self> {
        let stream = ByteStream::new(callbacks, opts.read_buffer_size);
        let demuxer = Demuxer::open(stream, opts.mode)?;

        #[cfg(feature = "audio")]
        let audio = match demuxer.audio_track() {
            Some(track) => AudioDecoder::from_track(track)?,
            None => None,
        };

        #[cfg(feature = "video")]
        let video_engine = match (opts.video_factory, demuxer.video_track()) {
            (Some(factory), Some(track)) => Some(factory(track).map_err(|e| {
                Error::format(format!(
                    "video engine rejected track {} ({}): {e}",
                    track.number, track.codec_id
                ))
            })?),
            _ => None,
        };

        debug!(
            video = demuxer.video_track().is_some(),
            audio = demuxer.audio_track().is_some(),
            "stream opened"
        );

        Ok(Self {
            #[cfg(feature = "audio")]
            audio,
            #[cfg(feature = "video")]
            video_engine,
            demuxer,
            video_buf: Vec::new(),
            audio_buf: Vec::new(),
            current: 0.0,
            audio_clock: AudioClock::default(),
            eos: false,
            last_error: None,
        })
    }

    /// Pull the next compressed video frame and/or audio packet.
    ///
    /// Returns `Error::StreamEnd` once neither track has anything left.
    pub fn read_frame(&mut self) -> Result<RawFrame<'_>> {
        let produced = self.read_packets();
        let produced = self.finish_call(produced)?;

        Ok(RawFrame {
            video: produced.video.map(|v| VideoFrame {
                data: &self.video_buf,
                timestamp: v.timestamp,
                keyframe: v.keyframe,
                invisible: v.invisible,
            }),
            audio: produced.audio.map(|(timestamp, _)| RawAudio {
                data: &self.audio_buf,
                timestamp,
            }),
        })
    }

    /// Pull the next decoded picture and/or block of audio samples.
    ///
    /// Fails with `DisabledFunction`, without consuming input, when a selected track has no
    /// decoder (video engine not installed, codec unsupported, or feature compiled out).
    pub fn decode_frame(&mut self) -> Result<DecodedFrame<'_>> {
        let produced = self
            .ensure_decoders()
            .and_then(|()| self.decode_packets());
        let produced = self.finish_call(produced)?;

        Ok(DecodedFrame {
            video: produced.video.map(|v| VideoPicture {
                data: &self.video_buf,
                timestamp: v.timestamp,
            }),
            audio: produced
                .audio
                .and_then(|(timestamp, frames)| self.audio_view(timestamp, frames)),
        })
    }

    /// Seek to the nearest keyframe at or before `seconds`.
    ///
    /// On failure (unseekable stream, target out of range, I/O) the position is unchanged.
    pub fn seek(&mut self, seconds: f64) -> Result<()> {
        let result = self.demuxer.seek(seconds);
        let position = self.record(result)?;

        self.reset_decoders();
        self.audio_clock = AudioClock::default();
        self.current = position;
        self.eos = false;
        debug!(target = seconds, position, "stream seek");
        Ok(())
    }

    /// Return to the first frame. `tell` is exactly 0.0 afterwards.
    pub fn rewind(&mut self) -> Result<()> {
        let result = self.demuxer.rewind();
        self.record(result)?;

        self.reset_decoders();
        self.audio_clock = AudioClock::default();
        self.current = 0.0;
        self.eos = false;
        Ok(())
    }

    /// Current position in seconds: the latest timestamp delivered so far.
    pub fn tell(&self) -> f64 {
        self.current
    }

    /// Kind of the most recent failure, cleared by the next successful read, decode, seek or
    /// rewind. Accessors never touch it.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// Whether the last read/decode call hit the end of the stream.
    pub fn is_eos(&self) -> bool {
        self.eos
    }

    /// Whether a callback read has failed at some point, as opposed to a clean end of stream.
    pub fn io_failed(&self) -> bool {
        self.demuxer.io_failed()
    }

    pub fn is_seekable(&self) -> bool {
        self.demuxer.is_seekable()
    }

    /// Duration in seconds, when the container declares it.
    pub fn duration(&self) -> Option<f64> {
        self.demuxer.duration()
    }

    pub fn has_video(&self) -> bool {
        self.demuxer.video_track().is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.demuxer.audio_track().is_some()
    }

    pub fn video_width(&self) -> u32 {
        self.demuxer
            .video_track()
            .map_or(0, |t| t.video_params().width)
    }

    pub fn video_height(&self) -> u32 {
        self.demuxer
            .video_track()
            .map_or(0, |t| t.video_params().height)
    }

    /// Frames per second, or 0.0 when the track has no default duration.
    pub fn video_rate(&self) -> f64 {
        self.demuxer
            .video_track()
            .map_or(0.0, |t| t.video_params().frame_rate)
    }

    pub fn audio_channels(&self) -> u32 {
        #[cfg(feature = "audio")]
        if let Some(audio) = &self.audio {
            return audio.channels();
        }
        self.demuxer
            .audio_track()
            .map_or(0, |t| t.audio_params().channels)
    }

    pub fn audio_rate(&self) -> u32 {
        #[cfg(feature = "audio")]
        if let Some(audio) = &self.audio {
            return audio.sample_rate();
        }
        self.demuxer
            .audio_track()
            .map_or(0, |t| t.audio_params().sample_rate)
    }

    /// All tracks in the container, selected or not.
    pub fn tracks(&self) -> &[TrackInfo] {
        self.demuxer.tracks()
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo::new(
            &self.demuxer,
            self.has_video_engine(),
            self.has_audio_decoder(),
        )
    }

    /// Release decoders, the demuxer, and finally the I/O callbacks (whose `close` runs once).
    ///
    /// Dropping the handle does the same; this just makes the point explicit.
    pub fn close(mut self) {
        #[cfg(feature = "audio")]
        drop(self.audio.take());
        #[cfg(feature = "video")]
        drop(self.video_engine.take());
        self.demuxer.close();
        debug!("stream closed");
    }

    fn read_packets(&mut self) -> Result<Produced> {
        let mut produced = Produced::default();

        while !self.is_complete(&produced) {
            let Some(packet) = self.demuxer.next_packet()? else {
                break;
            };

            match packet.kind {
                TrackKind::Video => {
                    if produced.video.is_some() {
                        self.demuxer.unread(packet);
                        break;
                    }
                    self.video_buf.clear();
                    self.video_buf.extend_from_slice(&packet.data);
                    produced.video = Some(VideoStamp::of(&packet));
                }
                TrackKind::Audio => {
                    if produced.audio.is_some() {
                        self.demuxer.unread(packet);
                        break;
                    }
                    self.audio_buf.clear();
                    self.audio_buf.extend_from_slice(&packet.data);
                    produced.audio = Some((packet.timestamp(), 1));
                    // The decoder never saw this packet; decoding resumes from the next one.
                    self.restart_audio();
                }
                TrackKind::Other => {}
            }
        }

        Ok(produced)
    }

    /// Decode the next picture and the next block of samples.
    ///
    /// The audio packet is only decoded once the video side of the call succeeded. On a video
    /// error it goes back to the demuxer, so no samples are lost with the failed call.
    fn decode_packets(&mut self) -> Result<Produced> {
        let mut produced = Produced::default();
        self.discard_pending_audio();

        loop {
            let mut held_audio = None;
            let drained = match self.pull_for_decode(&mut produced, &mut held_audio) {
                Ok(drained) => drained,
                Err(e) => {
                    if let Some(packet) = held_audio {
                        self.demuxer.unread(packet);
                    }
                    return Err(e);
                }
            };

            let Some(packet) = held_audio else {
                break;
            };
            self.audio_clock.observe(packet.timestamp());
            let frames = self.decode_audio(&packet)?;
            if frames > 0 {
                let rate = self.audio_rate();
                produced.audio = Some((self.audio_clock.stamp(frames, rate), frames));
                break;
            }
            trace!(ts = packet.timestamp(), "audio packet produced no samples");
            if drained {
                break;
            }
        }

        Ok(produced)
    }

    /// Decode video until a picture is out, setting aside the first audio packet met on the way.
    /// Returns whether the demuxer ran out.
    fn pull_for_decode(
        &mut self,
        produced: &mut Produced,
        held_audio: &mut Option<Packet>,
    ) -> Result<bool> {
        loop {
            let video_done = !self.has_video() || produced.video.is_some();
            let audio_done = !self.has_audio() || held_audio.is_some();
            if video_done && audio_done {
                return Ok(false);
            }

            let Some(packet) = self.demuxer.next_packet()? else {
                return Ok(true);
            };

            match packet.kind {
                TrackKind::Video => {
                    if produced.video.is_some() {
                        self.demuxer.unread(packet);
                        return Ok(false);
                    }
                    if self.decode_video(&packet)? {
                        produced.video = Some(VideoStamp::of(&packet));
                    } else {
                        trace!(ts = packet.timestamp(), "video packet produced no picture");
                    }
                }
                TrackKind::Audio => {
                    if held_audio.is_some() {
                        self.demuxer.unread(packet);
                        return Ok(false);
                    }
                    *held_audio = Some(packet);
                }
                TrackKind::Other => {}
            }
        }
    }

    fn is_complete(&self, produced: &Produced) -> bool {
        (!self.has_video() || produced.video.is_some())
            && (!self.has_audio() || produced.audio.is_some())
    }

    /// Turn an empty call into `StreamEnd`, bump the position, and record the outcome.
    fn finish_call(&mut self, produced: Result<Produced>) -> Result<Produced> {
        let produced = produced.and_then(|p| {
            if p.is_empty() {
                Err(Error::StreamEnd)
            } else {
                Ok(p)
            }
        });

        match &produced {
            Ok(p) => {
                if let Some(latest) = p.latest() {
                    self.current = self.current.max(latest);
                }
                self.eos = false;
            }
            Err(Error::StreamEnd) => {
                self.eos = true;
                trace!(position = self.current, "end of stream");
            }
            Err(_) => {}
        }

        self.record(produced)
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.last_error = None,
            Err(e) => {
                self.last_error = Some(e.kind());
                if !e.is_stream_end() {
                    debug!(error = %e, "stream operation failed");
                }
            }
        }
        result
    }

    fn ensure_decoders(&self) -> Result<()> {
        if self.has_video() && !self.has_video_engine() {
            return Err(Error::disabled("video decoding"));
        }
        if self.has_audio() && !self.has_audio_decoder() {
            let codec = self
                .demuxer
                .audio_track()
                .map_or("", |t| t.codec_id.as_str());
            return Err(Error::disabled(format!("audio decoding ({codec})")));
        }
        Ok(())
    }

    #[cfg(feature = "video")]
    fn has_video_engine(&self) -> bool {
        self.video_engine.is_some()
    }

    #[cfg(not(feature = "video"))]
    fn has_video_engine(&self) -> bool {
        false
    }

    #[cfg(feature = "audio")]
    fn has_audio_decoder(&self) -> bool {
        self.audio.is_some()
    }

    #[cfg(not(feature = "audio"))]
    fn has_audio_decoder(&self) -> bool {
        false
    }

    #[cfg(feature = "video")]
    fn decode_video(&mut self, packet: &Packet) -> Result<bool> {
        let engine = self
            .video_engine
            .as_mut()
            .ok_or_else(|| Error::disabled("video decoding"))?;
        self.video_buf.clear();
        engine
            .decode(&packet.data, packet.keyframe, &mut self.video_buf)
            .map_err(Error::engine)
    }

    #[cfg(not(feature = "video"))]
    fn decode_video(&mut self, _packet: &Packet) -> Result<bool> {
        Err(Error::disabled("video decoding"))
    }

    #[cfg(feature = "audio")]
    fn decode_audio(&mut self, packet: &Packet) -> Result<usize> {
        let audio = self
            .audio
            .as_mut()
            .ok_or_else(|| Error::disabled("audio decoding"))?;
        audio.decode(&packet.data)
    }

    #[cfg(not(feature = "audio"))]
    fn decode_audio(&mut self, _packet: &Packet) -> Result<usize> {
        Err(Error::disabled("audio decoding"))
    }

    #[cfg(feature = "audio")]
    fn audio_view(&self, timestamp: f64, frames: usize) -> Option<AudioSamples<'_>> {
        let audio = self.audio.as_ref()?;
        Some(AudioSamples {
            samples: audio.pending(),
            frames,
            channels: audio.channels(),
            timestamp,
        })
    }

    #[cfg(not(feature = "audio"))]
    fn audio_view(&self, _timestamp: f64, _frames: usize) -> Option<AudioSamples<'_>> {
        None
    }

    fn discard_pending_audio(&mut self) {
        #[cfg(feature = "audio")]
        if let Some(audio) = self.audio.as_mut() {
            audio.discard_pending();
        }
    }

    fn restart_audio(&mut self) {
        #[cfg(feature = "audio")]
        if let Some(audio) = self.audio.as_mut() {
            audio.reset();
        }
        self.audio_clock = AudioClock::default();
    }

    fn reset_decoders(&mut self) {
        #[cfg(feature = "audio")]
        if let Some(audio) = self.audio.as_mut() {
            audio.reset();
        }
        #[cfg(feature = "video")]
        if let Some(engine) = self.video_engine.as_mut() {
            engine.reset();
        }
    }
}

impl std::fmt::Debug for WebmStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebmStream")
            .field("video", &self.demuxer.video_track().map(|t| &t.codec_id))
            .field("audio", &self.demuxer.audio_track().map(|t| &t.codec_id))
            .field("position", &self.current)
            .field("eos", &self.eos)
            .field("last_error", &self.last_error)
            .finish()
    }
}
