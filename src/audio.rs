//! Audio decoding adapter built on Symphonia.
//!
//! The demuxer hands us raw codec packets; this module turns them into interleaved `f32` PCM
//! and keeps any samples the caller hasn't pulled yet.
//!
//! Supported codecs:
//! - Vorbis (headers come from the track's Xiph-laced CodecPrivate)
//! - PCM: `A_PCM/FLOAT/IEEE`, `A_PCM/INT/LIT`, `A_PCM/INT/BIG`
//!
//! Anything else yields `Ok(None)` from [`AudioDecoder::from_track`] so the stream can report
//! `DisabledFunction` when decoding is requested.

use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{
    CODEC_TYPE_PCM_F32LE, CODEC_TYPE_PCM_F64LE, CODEC_TYPE_PCM_S16BE, CODEC_TYPE_PCM_S16LE,
    CODEC_TYPE_PCM_S24BE, CODEC_TYPE_PCM_S24LE, CODEC_TYPE_PCM_S32BE, CODEC_TYPE_PCM_S32LE,
    CODEC_TYPE_PCM_U8, CODEC_TYPE_VORBIS, CodecParameters, CodecType, Decoder, DecoderOptions,
};
use symphonia::core::formats::Packet;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::track::{AudioCodec, TrackInfo};

/// Upper bound on frames fed to the PCM decoder in one packet. Larger blocks are split.
const PCM_MAX_FRAMES_PER_PACKET: usize = 32 * 1024;

const MAX_CHANNELS: u32 = 32;

pub struct AudioDecoder {
    decoder: Box<dyn Decoder>,
    channels: u32,
    sample_rate: u32,

    // Bytes per PCM packet chunk; `None` for compressed codecs.
    pcm_chunk: Option<usize>,

    sample_buf: Option<SampleBuffer<f32>>,
    // Decoded, interleaved samples; `pcm[read_pos..]` has not been handed out yet.
    pcm: Vec<f32>,
    read_pos: usize,
    next_ts: u64,
}

impl AudioDecoder {
    /// Build the adapter for a track, or `None` if its codec isn't supported.
    pub fn from_track(track: &TrackInfo) -> Result<Option<Self>> {
        let params = track.audio_params();
        let decoder = match track.audio_codec() {
            AudioCodec::Vorbis => {
                let (ident, setup) = track.vorbis_headers()?;
                Self::vorbis(ident, setup)?
            }
            codec @ (AudioCodec::PcmFloat | AudioCodec::PcmIntLittle | AudioCodec::PcmIntBig) => {
                Self::pcm(codec, params.sample_rate, params.channels, params.bit_depth)?
            }
            AudioCodec::Unsupported => {
                debug!(codec_id = %track.codec_id, "no audio decoder for codec");
                return Ok(None);
            }
        };
        Ok(Some(decoder))
    }

    /// A Vorbis decoder from the identification and setup header packets.
    pub fn vorbis(ident: &[u8], setup: &[u8]) -> Result<Self> {
        let (channels, sample_rate) = parse_vorbis_ident(ident)?;

        let mut extra = Vec::new();
        extra.try_reserve_exact(ident.len() + setup.len())?;
        extra.extend_from_slice(ident);
        extra.extend_from_slice(setup);

        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_VORBIS)
            .with_sample_rate(sample_rate)
            .with_channels(channel_mask(channels)?)
            .with_extra_data(extra.into_boxed_slice());

        Self::with_params(&params, channels, sample_rate, None)
    }

    /// A PCM decoder for the given Matroska PCM flavor.
    pub fn pcm(
        codec: AudioCodec,
        sample_rate: u32,
        channels: u32,
        bit_depth: Option<u32>,
    ) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::format("PCM track has no sampling frequency"));
        }

        let (codec_type, bits) = pcm_codec_type(codec, bit_depth)?;
        let frame_bytes = channels as usize * (bits as usize / 8);

        let mut params = CodecParameters::new();
        params
            .for_codec(codec_type)
            .with_sample_rate(sample_rate)
            .with_channels(channel_mask(channels)?)
            .with_bits_per_sample(bits)
            .with_bits_per_coded_sample(bits)
            .with_max_frames_per_packet(PCM_MAX_FRAMES_PER_PACKET as u64);

        Self::with_params(
            &params,
            channels,
            sample_rate,
            Some(frame_bytes * PCM_MAX_FRAMES_PER_PACKET),
        )
    }

    fn with_params(
        params: &CodecParameters,
        channels: u32,
        sample_rate: u32,
        pcm_chunk: Option<usize>,
    ) -> Result<Self> {
        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| Error::format(format!("failed to create audio decoder: {e}")))?;

        debug!(channels, sample_rate, codec = ?params.codec, "audio decoder ready");
        Ok(Self {
            decoder,
            channels,
            sample_rate,
            pcm_chunk,
            sample_buf: None,
            pcm: Vec::new(),
            read_pos: 0,
            next_ts: 0,
        })
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Decode one packet, appending its samples to the pending buffer.
    ///
    /// Returns the number of frames (samples per channel) the packet produced.
    pub fn decode(&mut self, data: &[u8]) -> Result<usize> {
        match self.pcm_chunk {
            Some(chunk) if data.len() > chunk => {
                let mut frames = 0;
                for part in data.chunks(chunk) {
                    frames += self.decode_one(part)?;
                }
                Ok(frames)
            }
            _ => self.decode_one(data),
        }
    }

    fn decode_one(&mut self, data: &[u8]) -> Result<usize> {
        self.compact();

        let packet = Packet::new_from_slice(0, self.next_ts, 0, data);
        let decoded = self.decoder.decode(&packet).map_err(Error::decode)?;

        let frames = decoded.frames();
        if frames == 0 {
            trace!(len = data.len(), "packet produced no samples");
            return Ok(0);
        }
        self.next_ts += frames as u64;

        let capacity = decoded.capacity() as u64;
        let spec = *decoded.spec();
        let needed = capacity as usize * spec.channels.count();
        if self
            .sample_buf
            .as_ref()
            .is_some_and(|buf| buf.capacity() < needed)
        {
            self.sample_buf = None;
        }
        let sample_buf = self
            .sample_buf
            .get_or_insert_with(|| SampleBuffer::<f32>::new(capacity, spec));
        sample_buf.copy_interleaved_ref(decoded);

        let samples = sample_buf.samples();
        self.pcm.try_reserve(samples.len())?;
        self.pcm.extend_from_slice(samples);

        trace!(frames, pending = self.available_samples(), "decoded audio packet");
        Ok(frames)
    }

    /// Frames decoded but not yet pulled with [`AudioDecoder::get_pcm`].
    pub fn available_samples(&self) -> usize {
        (self.pcm.len() - self.read_pos) / self.channels.max(1) as usize
    }

    /// Pending samples, interleaved, without consuming them.
    pub fn pending(&self) -> &[f32] {
        &self.pcm[self.read_pos..]
    }

    /// Copy up to `frames` frames of interleaved samples into `out` and consume them.
    ///
    /// Returns the number of frames copied, bounded by what's pending and by `out`'s length.
    pub fn get_pcm(&mut self, out: &mut [f32], frames: usize) -> usize {
        let channels = self.channels.max(1) as usize;
        let n = frames
            .min(self.available_samples())
            .min(out.len() / channels);

        let len = n * channels;
        out[..len].copy_from_slice(&self.pcm[self.read_pos..self.read_pos + len]);
        self.read_pos += len;
        n
    }

    /// Consume every pending sample.
    pub fn discard_pending(&mut self) {
        self.pcm.clear();
        self.read_pos = 0;
    }

    /// Forget pending samples and decoder state (after a seek).
    pub fn reset(&mut self) {
        self.decoder.reset();
        self.discard_pending();
        self.next_ts = 0;
    }

    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        if self.read_pos == self.pcm.len() {
            self.pcm.clear();
        } else {
            self.pcm.drain(..self.read_pos);
        }
        self.read_pos = 0;
    }
}

fn channel_mask(channels: u32) -> Result<Channels> {
    if channels == 0 || channels > MAX_CHANNELS {
        return Err(Error::format(format!("unsupported channel count {channels}")));
    }
    Ok(Channels::from_bits_truncate(((1u64 << channels) - 1) as u32))
}

/// Map a Matroska PCM codec + bit depth to Symphonia's codec type and sample width.
fn pcm_codec_type(codec: AudioCodec, bit_depth: Option<u32>) -> Result<(CodecType, u32)> {
    let codec_type = match (codec, bit_depth) {
        (AudioCodec::PcmFloat, None | Some(32)) => CODEC_TYPE_PCM_F32LE,
        (AudioCodec::PcmFloat, Some(64)) => CODEC_TYPE_PCM_F64LE,
        (AudioCodec::PcmIntLittle | AudioCodec::PcmIntBig, Some(8)) => CODEC_TYPE_PCM_U8,
        (AudioCodec::PcmIntLittle, None | Some(16)) => CODEC_TYPE_PCM_S16LE,
        (AudioCodec::PcmIntLittle, Some(24)) => CODEC_TYPE_PCM_S24LE,
        (AudioCodec::PcmIntLittle, Some(32)) => CODEC_TYPE_PCM_S32LE,
        (AudioCodec::PcmIntBig, None | Some(16)) => CODEC_TYPE_PCM_S16BE,
        (AudioCodec::PcmIntBig, Some(24)) => CODEC_TYPE_PCM_S24BE,
        (AudioCodec::PcmIntBig, Some(32)) => CODEC_TYPE_PCM_S32BE,
        (codec, depth) => {
            return Err(Error::format(format!(
                "unsupported PCM layout {codec:?} at {depth:?} bits"
            )));
        }
    };

    let bits = match bit_depth {
        Some(bits) => bits,
        None if codec == AudioCodec::PcmFloat => 32,
        None => 16,
    };
    Ok((codec_type, bits))
}

/// Pull (channels, sample_rate) out of a Vorbis identification header.
///
/// ```text
/// [0x01] "vorbis" [version: u32 LE] [channels: u8] [rate: u32 LE] ... [framing: u8]
/// ```
fn parse_vorbis_ident(ident: &[u8]) -> Result<(u32, u32)> {
    if ident.len() < 30 || ident[0] != 1 || &ident[1..7] != b"vorbis" {
        return Err(Error::format("malformed Vorbis identification header"));
    }

    let version = u32::from_le_bytes([ident[7], ident[8], ident[9], ident[10]]);
    let channels = ident[11] as u32;
    let sample_rate = u32::from_le_bytes([ident[12], ident[13], ident[14], ident[15]]);

    if version != 0 || channels == 0 || sample_rate == 0 {
        return Err(Error::format(format!(
            "invalid Vorbis identification header (version {version}, {channels} channels, {sample_rate} Hz)"
        )));
    }
    Ok((channels, sample_rate))
}
