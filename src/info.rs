use serde::Serialize;

use crate::demux::Demuxer;
use crate::track::{AudioCodec, AudioParams, TrackInfo, VideoParams};

/// Summary of an open stream, suitable for printing as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    pub doc_type: String,
    /// Seconds, when declared by the container.
    pub duration: Option<f64>,
    pub seekable: bool,
    pub track_count: usize,
    pub video: Option<VideoInfo>,
    pub audio: Option<AudioInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoInfo {
    pub track_number: u64,
    pub codec_id: String,
    #[serde(flatten)]
    pub params: VideoParams,
    /// Whether `decode_frame` can produce pictures for this track.
    pub decodable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioInfo {
    pub track_number: u64,
    pub codec_id: String,
    pub codec: AudioCodec,
    #[serde(flatten)]
    pub params: AudioParams,
    /// Whether `decode_frame` can produce samples for this track.
    pub decodable: bool,
}

impl StreamInfo {
    pub(crate) fn new(demuxer: &Demuxer, video_decodable: bool, audio_decodable: bool) -> Self {
        Self {
            doc_type: demuxer.doc_type().to_string(),
            duration: demuxer.duration(),
            seekable: demuxer.is_seekable(),
            track_count: demuxer.tracks().len(),
            video: demuxer
                .video_track()
                .map(|t| VideoInfo::new(t, video_decodable)),
            audio: demuxer
                .audio_track()
                .map(|t| AudioInfo::new(t, audio_decodable)),
        }
    }
}

impl VideoInfo {
    fn new(track: &TrackInfo, decodable: bool) -> Self {
        Self {
            track_number: track.number,
            codec_id: track.codec_id.clone(),
            params: track.video_params(),
            decodable,
        }
    }
}

impl AudioInfo {
    fn new(track: &TrackInfo, decodable: bool) -> Self {
        Self {
            track_number: track.number,
            codec_id: track.codec_id.clone(),
            codec: track.audio_codec(),
            params: track.audio_params(),
            decodable,
        }
    }
}
