//! Track metadata as parsed from `TrackEntry` elements, plus codec classification.

use serde::Serialize;

use crate::block::split_xiph;
use crate::error::{Error, Result};

/// Whether a track carries video, audio, or something we ignore.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Video,
    Audio,
    Other,
}

impl TrackKind {
    /// Classify by codec ID prefix (`V_...`, `A_...`), falling back to the TrackType value.
    pub fn classify(codec_id: &str, track_type: Option<u64>) -> Self {
        if codec_id.starts_with("V_") {
            return Self::Video;
        }
        if codec_id.starts_with("A_") {
            return Self::Audio;
        }
        match track_type {
            Some(1) => Self::Video,
            Some(2) => Self::Audio,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    /// Frames per second derived from the track's default duration; 0.0 when unknown.
    pub frame_rate: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AudioParams {
    pub channels: u32,
    pub sample_rate: u32,
    /// Bits per sample, when the container states it (PCM tracks).
    pub bit_depth: Option<u32>,
}

/// Audio codecs the decode path knows how to feed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    Vorbis,
    PcmFloat,
    PcmIntLittle,
    PcmIntBig,
    Unsupported,
}

impl AudioCodec {
    pub fn from_codec_id(codec_id: &str) -> Self {
        match codec_id {
            "A_VORBIS" => Self::Vorbis,
            "A_PCM/FLOAT/IEEE" => Self::PcmFloat,
            "A_PCM/INT/LIT" => Self::PcmIntLittle,
            "A_PCM/INT/BIG" => Self::PcmIntBig,
            _ => Self::Unsupported,
        }
    }
}

/// One `TrackEntry`.
#[derive(Clone, Debug, Default)]
pub struct TrackInfo {
    pub number: u64,
    pub track_type: Option<u64>,
    pub codec_id: String,
    pub codec_private: Option<Vec<u8>>,
    /// Nanoseconds per frame, if the track declares it.
    pub default_duration_ns: Option<u64>,
    pub enabled: bool,
    /// Content encodings (compression/encryption) make block payloads opaque to us.
    pub encoded: bool,
    pub video: Option<VideoParams>,
    pub audio: Option<AudioParams>,
}

impl TrackInfo {
    pub fn kind(&self) -> TrackKind {
        TrackKind::classify(&self.codec_id, self.track_type)
    }

    pub fn video_params(&self) -> VideoParams {
        let mut params = self.video.clone().unwrap_or_default();
        params.frame_rate = frame_rate(self.default_duration_ns);
        params
    }

    pub fn audio_params(&self) -> AudioParams {
        self.audio.clone().unwrap_or_default()
    }

    pub fn audio_codec(&self) -> AudioCodec {
        AudioCodec::from_codec_id(&self.codec_id)
    }

    /// The Vorbis identification and setup headers, from Xiph-laced CodecPrivate.
    pub fn vorbis_headers(&self) -> Result<(&[u8], &[u8])> {
        let private = self
            .codec_private
            .as_deref()
            .ok_or_else(|| Error::format("Vorbis track has no CodecPrivate"))?;
        vorbis_headers(private)
    }
}

/// Split Vorbis CodecPrivate into (identification, setup). The comment header is dropped.
pub fn vorbis_headers(private: &[u8]) -> Result<(&[u8], &[u8])> {
    let parts = split_xiph(private)?;
    if parts.len() != 3 {
        return Err(Error::format(format!(
            "Vorbis CodecPrivate holds {} packets, expected 3",
            parts.len()
        )));
    }

    let ident = &private[parts[0].clone()];
    let setup = &private[parts[2].clone()];
    if ident.first() != Some(&1) || setup.first() != Some(&5) {
        return Err(Error::format("Vorbis header packets are out of order"));
    }
    Ok((ident, setup))
}

pub fn frame_rate(default_duration_ns: Option<u64>) -> f64 {
    match default_duration_ns {
        Some(ns) if ns > 0 => 1_000_000_000.0 / ns as f64,
        _ => 0.0,
    }
}
