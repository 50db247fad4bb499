//! Synthetic WebM writer for integration tests.
//!
//! Every element is written with an 8-byte size field so sizes never change length when values
//! are patched in (SeekHead positions, for instance).

#![allow(dead_code)]

use std::f32::consts::PI;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use webmdec::Callbacks;

pub const VIDEO_TRACK: u64 = 1;
pub const AUDIO_TRACK: u64 = 2;

pub const SAMPLE_RATE: u32 = 8000;
pub const TONE_HZ: f32 = 440.0;
/// Audio packet length in samples (20 ms at 8 kHz).
pub const AUDIO_PACKET_FRAMES: usize = 160;
/// Video frame spacing in milliseconds (25 fps).
pub const VIDEO_FRAME_MS: u64 = 40;
/// By default every 25th video frame is a keyframe (one per second).
pub const KEYFRAME_INTERVAL: u64 = 25;

const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

pub fn id_bytes(id: u32) -> Vec<u8> {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

pub fn element(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = id_bytes(id);
    out.push(0x01);
    out.extend_from_slice(&(payload.len() as u64).to_be_bytes()[1..]);
    out.extend_from_slice(payload);
    out
}

pub fn unknown_size_element(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = id_bytes(id);
    out.extend_from_slice(&UNKNOWN_SIZE);
    out.extend_from_slice(payload);
    out
}

pub fn uint(id: u32, value: u64) -> Vec<u8> {
    element(id, &value.to_be_bytes())
}

pub fn float(id: u32, value: f64) -> Vec<u8> {
    element(id, &value.to_be_bytes())
}

pub fn string(id: u32, value: &str) -> Vec<u8> {
    element(id, value.as_bytes())
}

pub mod ids {
    pub const EBML: u32 = 0x1A45DFA3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const SEGMENT: u32 = 0x18538067;
    pub const SEEK_HEAD: u32 = 0x114D9B74;
    pub const SEEK: u32 = 0x4DBB;
    pub const SEEK_ID: u32 = 0x53AB;
    pub const SEEK_POSITION: u32 = 0x53AC;
    pub const INFO: u32 = 0x1549A966;
    pub const TIMECODE_SCALE: u32 = 0x2AD7B1;
    pub const DURATION: u32 = 0x4489;
    pub const TRACKS: u32 = 0x1654AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_PRIVATE: u32 = 0x63A2;
    pub const DEFAULT_DURATION: u32 = 0x23E383;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;
    pub const AUDIO: u32 = 0xE1;
    pub const SAMPLING_FREQUENCY: u32 = 0xB5;
    pub const CHANNELS: u32 = 0x9F;
    pub const BIT_DEPTH: u32 = 0x6264;
    pub const CLUSTER: u32 = 0x1F43B675;
    pub const TIMECODE: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const CUES: u32 = 0x1C53BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;
}

pub fn ebml_header(doc_type: &str) -> Vec<u8> {
    element(ids::EBML, &string(ids::DOC_TYPE, doc_type))
}

pub fn info(duration_ms: f64) -> Vec<u8> {
    let mut payload = uint(ids::TIMECODE_SCALE, 1_000_000);
    payload.extend(float(ids::DURATION, duration_ms));
    element(ids::INFO, &payload)
}

pub fn video_track(number: u64) -> Vec<u8> {
    let mut entry = uint(ids::TRACK_NUMBER, number);
    entry.extend(uint(ids::TRACK_TYPE, 1));
    entry.extend(string(ids::CODEC_ID, "V_VP8"));
    entry.extend(uint(ids::DEFAULT_DURATION, VIDEO_FRAME_MS * 1_000_000));
    let mut video = uint(ids::PIXEL_WIDTH, 320);
    video.extend(uint(ids::PIXEL_HEIGHT, 240));
    entry.extend(element(ids::VIDEO, &video));
    element(ids::TRACK_ENTRY, &entry)
}

pub fn pcm_audio_track(number: u64) -> Vec<u8> {
    let mut entry = uint(ids::TRACK_NUMBER, number);
    entry.extend(uint(ids::TRACK_TYPE, 2));
    entry.extend(string(ids::CODEC_ID, "A_PCM/FLOAT/IEEE"));
    let mut audio = float(ids::SAMPLING_FREQUENCY, SAMPLE_RATE as f64);
    audio.extend(uint(ids::CHANNELS, 1));
    audio.extend(uint(ids::BIT_DEPTH, 32));
    entry.extend(element(ids::AUDIO, &audio));
    element(ids::TRACK_ENTRY, &entry)
}

pub fn vorbis_audio_track(number: u64, codec_private: &[u8]) -> Vec<u8> {
    let mut entry = uint(ids::TRACK_NUMBER, number);
    entry.extend(uint(ids::TRACK_TYPE, 2));
    entry.extend(string(ids::CODEC_ID, "A_VORBIS"));
    entry.extend(element(ids::CODEC_PRIVATE, codec_private));
    let mut audio = float(ids::SAMPLING_FREQUENCY, 44_100.0);
    audio.extend(uint(ids::CHANNELS, 2));
    entry.extend(element(ids::AUDIO, &audio));
    element(ids::TRACK_ENTRY, &entry)
}

pub fn opus_audio_track(number: u64) -> Vec<u8> {
    let mut entry = uint(ids::TRACK_NUMBER, number);
    entry.extend(uint(ids::TRACK_TYPE, 2));
    entry.extend(string(ids::CODEC_ID, "A_OPUS"));
    let mut audio = float(ids::SAMPLING_FREQUENCY, 48_000.0);
    audio.extend(uint(ids::CHANNELS, 2));
    entry.extend(element(ids::AUDIO, &audio));
    element(ids::TRACK_ENTRY, &entry)
}

pub fn simple_block(track: u64, relative_timecode: i16, keyframe: bool, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![0x80 | track as u8];
    body.extend_from_slice(&relative_timecode.to_be_bytes());
    body.push(if keyframe { 0x80 } else { 0x00 });
    body.extend_from_slice(payload);
    element(ids::SIMPLE_BLOCK, &body)
}

/// Sample `n` of the test tone.
pub fn tone_sample(n: usize) -> f32 {
    0.5 * (2.0 * PI * TONE_HZ * n as f32 / SAMPLE_RATE as f32).sin()
}

/// Payload of video frame `index`: its index, then filler.
pub fn video_payload(index: u64) -> Vec<u8> {
    let mut payload = (index as u32).to_le_bytes().to_vec();
    payload.extend(std::iter::repeat_n(0x5A, 12));
    payload
}

/// Float PCM payload of audio packet `packet`: its slice of the test tone.
pub fn audio_payload(packet: usize) -> Vec<u8> {
    (0..AUDIO_PACKET_FRAMES)
        .flat_map(|i| tone_sample(packet * AUDIO_PACKET_FRAMES + i).to_le_bytes())
        .collect()
}

/// Description of a synthetic clip.
#[derive(Debug, Clone)]
pub struct Clip {
    pub seconds: u64,
    pub video: bool,
    pub audio: bool,
    pub cues: bool,
    pub live: bool,
    /// Video frames between keyframes.
    pub keyframe_every: u64,
}

impl Default for Clip {
    fn default() -> Self {
        Self {
            seconds: 3,
            video: true,
            audio: true,
            cues: true,
            live: false,
            keyframe_every: KEYFRAME_INTERVAL,
        }
    }
}

impl Clip {
    pub fn audio_only() -> Self {
        Self {
            video: false,
            ..Self::default()
        }
    }

    pub fn video_only() -> Self {
        Self {
            audio: false,
            ..Self::default()
        }
    }

    pub fn total_audio_frames(&self) -> usize {
        self.seconds as usize * SAMPLE_RATE as usize
    }

    pub fn total_video_frames(&self) -> u64 {
        self.seconds * 1000 / VIDEO_FRAME_MS
    }

    /// One cluster per second. Blocks inside are ordered by timestamp, video first on ties.
    fn cluster(&self, second: u64) -> Vec<u8> {
        let start_ms = second * 1000;
        let mut blocks: Vec<(u64, u8, Vec<u8>)> = Vec::new();

        if self.video {
            let first = start_ms / VIDEO_FRAME_MS;
            let last = (start_ms + 1000) / VIDEO_FRAME_MS;
            for index in first..last {
                let ts = index * VIDEO_FRAME_MS;
                let keyframe = index % self.keyframe_every == 0;
                let block = simple_block(
                    VIDEO_TRACK,
                    (ts - start_ms) as i16,
                    keyframe,
                    &video_payload(index),
                );
                blocks.push((ts, 0, block));
            }
        }

        if self.audio {
            let per_second = SAMPLE_RATE as usize / AUDIO_PACKET_FRAMES;
            for i in 0..per_second {
                let packet = second as usize * per_second + i;
                let ts = (packet * AUDIO_PACKET_FRAMES * 1000 / SAMPLE_RATE as usize) as u64;
                let block =
                    simple_block(AUDIO_TRACK, (ts - start_ms) as i16, true, &audio_payload(packet));
                blocks.push((ts, 1, block));
            }
        }

        blocks.sort_by_key(|(ts, order, _)| (*ts, *order));

        let mut payload = uint(ids::TIMECODE, start_ms);
        for (_, _, block) in blocks {
            payload.extend(block);
        }

        if self.live {
            unknown_size_element(ids::CLUSTER, &payload)
        } else {
            element(ids::CLUSTER, &payload)
        }
    }

    fn tracks(&self) -> Vec<u8> {
        let mut tracks = Vec::new();
        if self.video {
            tracks.extend(video_track(VIDEO_TRACK));
        }
        if self.audio {
            tracks.extend(pcm_audio_track(AUDIO_TRACK));
        }
        element(ids::TRACKS, &tracks)
    }

    fn seek_head(cues_position: u64) -> Vec<u8> {
        let mut seek = element(ids::SEEK_ID, &ids::CUES.to_be_bytes());
        seek.extend(uint(ids::SEEK_POSITION, cues_position));
        element(ids::SEEK_HEAD, &element(ids::SEEK, &seek))
    }

    fn cues(&self, cluster_positions: &[u64]) -> Vec<u8> {
        let track = if self.video { VIDEO_TRACK } else { AUDIO_TRACK };
        let mut cues = Vec::new();
        for (second, &position) in cluster_positions.iter().enumerate() {
            let mut positions = uint(ids::CUE_TRACK, track);
            positions.extend(uint(ids::CUE_CLUSTER_POSITION, position));

            let mut point = uint(ids::CUE_TIME, second as u64 * 1000);
            point.extend(element(ids::CUE_TRACK_POSITIONS, &positions));
            cues.extend(element(ids::CUE_POINT, &point));
        }
        element(ids::CUES, &cues)
    }

    pub fn build(&self) -> Vec<u8> {
        let info = info((self.seconds * 1000) as f64);
        let tracks = self.tracks();
        let clusters: Vec<Vec<u8>> = (0..self.seconds).map(|s| self.cluster(s)).collect();

        let mut segment = Vec::new();
        let seek_head_len = if self.cues {
            Self::seek_head(0).len()
        } else {
            0
        };

        // Cluster positions relative to the start of the segment payload.
        let mut offset = (seek_head_len + info.len() + tracks.len()) as u64;
        let mut cluster_positions = Vec::new();
        for cluster in &clusters {
            cluster_positions.push(offset);
            offset += cluster.len() as u64;
        }

        if self.cues {
            segment.extend(Self::seek_head(offset));
        }
        segment.extend(info);
        segment.extend(tracks);
        for cluster in clusters {
            segment.extend(cluster);
        }
        if self.cues {
            segment.extend(self.cues(&cluster_positions));
        }

        let mut out = ebml_header("webm");
        if self.live {
            out.extend(unknown_size_element(ids::SEGMENT, &segment));
        } else {
            out.extend(element(ids::SEGMENT, &segment));
        }
        out
    }
}

/// A complete file around the given track entries and cluster payloads.
pub fn file_with(track_entries: &[u8], cluster_payloads: &[Vec<u8>], duration_ms: f64) -> Vec<u8> {
    let mut segment = info(duration_ms);
    segment.extend(element(ids::TRACKS, track_entries));
    for cluster in cluster_payloads {
        segment.extend(element(ids::CLUSTER, cluster));
    }
    let mut out = ebml_header("webm");
    out.extend(element(ids::SEGMENT, &segment));
    out
}

/// In-memory callbacks that count `close` calls and can hide seeking.
pub struct TrackedCallbacks {
    data: Vec<u8>,
    pos: usize,
    seekable: bool,
    pub closes: Arc<AtomicUsize>,
}

impl TrackedCallbacks {
    pub fn new(data: Vec<u8>, seekable: bool) -> Self {
        Self {
            data,
            pos: 0,
            seekable,
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

impl Callbacks for TrackedCallbacks {
    fn length(&mut self) -> Option<u64> {
        self.seekable.then_some(self.data.len() as u64)
    }

    fn tell(&mut self) -> Option<u64> {
        self.seekable.then_some(self.pos as u64)
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        if !self.seekable {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "no seeking"));
        }
        self.pos = (offset as usize).min(self.data.len());
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn closes(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}
