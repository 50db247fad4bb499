use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use webmdec::logging;
use webmdec::{OpenMode, OpenOptions, WebmStream};

fn main() -> Result<()> {
    logging::init();
    let params = get_params()?;

    match params.command {
        Command::Info { input } => print_info(&input, params.mode),
        Command::Frames { input, decode } => print_frames(&input, params.mode, decode),
        Command::Audio { input, output } => write_audio(&input, &output),
    }
}

#[derive(Parser, Debug)]
#[command(name = "webmdec")]
#[command(about = "Inspect and decode WebM files")]
struct Params {
    #[arg(short = 'm', long = "mode", value_enum, default_value_t = OpenMode::Any, global = true)]
    pub mode: OpenMode,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print stream and track information as JSON.
    Info { input: PathBuf },

    /// Print one JSON line per frame.
    Frames {
        input: PathBuf,

        /// Decode frames instead of reporting raw packets.
        #[arg(short = 'd', long = "decode", default_value_t = false)]
        decode: bool,
    },

    /// Decode the audio track to a 32-bit float WAV file.
    Audio {
        input: PathBuf,

        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },
}

fn get_params() -> Result<Params> {
    Ok(Params::parse())
}

fn open(input: &Path, mode: OpenMode) -> Result<WebmStream> {
    WebmStream::open_file(input, OpenOptions::new().mode(mode))
        .with_context(|| format!("failed to open {}", input.display()))
}

fn print_info(input: &Path, mode: OpenMode) -> Result<()> {
    let stream = open(input, mode)?;
    let stdout = io::stdout();
    let mut writer = BufWriter::new(stdout.lock());

    serde_json::to_writer_pretty(&mut writer, &stream.info())?;
    writeln!(writer)?;
    writer.flush()?;

    stream.close();
    Ok(())
}

#[derive(Serialize)]
struct FrameLine {
    index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_ts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keyframe: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    invisible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_ts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_frames: Option<usize>,
    position: f64,
}

fn print_frames(input: &Path, mode: OpenMode, decode: bool) -> Result<()> {
    let mut stream = open(input, mode)?;
    let stdout = io::stdout();
    let mut writer = BufWriter::new(stdout.lock());

    for index in 0.. {
        let line = if decode {
            match stream.decode_frame() {
                Ok(frame) => FrameLine {
                    index,
                    video_ts: frame.video.map(|v| v.timestamp),
                    video_bytes: frame.video.map(|v| v.data.len()),
                    keyframe: None,
                    invisible: None,
                    audio_ts: frame.audio.map(|a| a.timestamp),
                    audio_bytes: None,
                    audio_frames: frame.audio.map(|a| a.frames),
                    position: 0.0,
                },
                Err(e) if e.is_stream_end() => break,
                Err(e) => return Err(e).context("decode failed"),
            }
        } else {
            match stream.read_frame() {
                Ok(frame) => FrameLine {
                    index,
                    video_ts: frame.video.map(|v| v.timestamp),
                    video_bytes: frame.video.map(|v| v.data.len()),
                    keyframe: frame.video.map(|v| v.keyframe),
                    invisible: frame.video.and_then(|v| v.invisible.then_some(true)),
                    audio_ts: frame.audio.map(|a| a.timestamp),
                    audio_bytes: frame.audio.map(|a| a.data.len()),
                    audio_frames: None,
                    position: 0.0,
                },
                Err(e) if e.is_stream_end() => break,
                Err(e) => return Err(e).context("read failed"),
            }
        };

        let line = FrameLine {
            position: stream.tell(),
            ..line
        };
        serde_json::to_writer(&mut writer, &line)?;
        writeln!(writer)?;
    }

    writer.flush()?;
    stream.close();
    Ok(())
}

fn write_audio(input: &Path, output: &Path) -> Result<()> {
    let mut stream = open(input, OpenMode::AudioOnly)?;

    let spec = hound::WavSpec {
        channels: u16::try_from(stream.audio_channels()).context("too many channels for WAV")?,
        sample_rate: stream.audio_rate(),
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut wav = hound::WavWriter::create(output, spec)
        .with_context(|| format!("failed to create {}", output.display()))?;

    let mut frames = 0u64;
    loop {
        match stream.decode_frame() {
            Ok(frame) => {
                if let Some(audio) = frame.audio {
                    for &sample in audio.samples {
                        wav.write_sample(sample)?;
                    }
                    frames += audio.frames as u64;
                }
            }
            Err(e) if e.is_stream_end() => break,
            Err(e) => return Err(e).context("audio decode failed"),
        }
    }

    wav.finalize()?;
    stream.close();

    eprintln!("wrote {frames} frames to {}", output.display());
    Ok(())
}
