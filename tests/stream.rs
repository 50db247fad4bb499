mod common;

use common::{AUDIO_TRACK, Clip, TrackedCallbacks, VIDEO_TRACK, closes, video_payload};
use webmdec::{ErrorKind, OpenMode, OpenOptions, WebmStream};

fn open_clip(clip: &Clip, mode: OpenMode) -> webmdec::Result<WebmStream> {
    WebmStream::open_buffer(clip.build(), OpenOptions::new().mode(mode))
}

#[test]
fn garbage_input_is_an_invalid_stream_format() {
    // Header claiming a 64 GiB body with a 1 GiB DocType inside.
    let mut oversized = vec![0x1A, 0x45, 0xDF, 0xA3, 0x01, 0, 0, 0x10, 0, 0, 0, 0];
    oversized.extend([0x42, 0x82, 0x01, 0, 0, 0, 0x40, 0, 0, 0]);
    let truncated = vec![0x1A, 0x45, 0xDF, 0xA3, 0x88, 0x42, 0x82, 0x85, b'w', b'e'];

    for data in [
        Vec::new(),
        vec![0xFF; 256],
        b"RIFF\0\0\0\0WAVEfmt ".to_vec(),
        oversized,
        truncated,
    ] {
        let err = WebmStream::open_buffer(data, OpenOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStreamFormat);
    }
}

#[test]
fn exposes_track_parameters() -> anyhow::Result<()> {
    let stream = open_clip(&Clip::default(), OpenMode::Any)?;

    assert!(stream.has_video());
    assert!(stream.has_audio());
    assert_eq!(stream.video_width(), 320);
    assert_eq!(stream.video_height(), 240);
    assert_eq!(stream.video_rate(), 25.0);
    assert_eq!(stream.audio_channels(), 1);
    assert_eq!(stream.audio_rate(), common::SAMPLE_RATE);
    assert_eq!(stream.duration(), Some(3.0));
    assert!(stream.is_seekable());
    assert_eq!(stream.tell(), 0.0);
    assert_eq!(stream.last_error(), None);
    assert_eq!(stream.tracks().len(), 2);

    let info = serde_json::to_value(stream.info())?;
    assert_eq!(info["doc_type"], "webm");
    assert_eq!(info["video"]["codec_id"], "V_VP8");
    assert_eq!(info["video"]["width"], 320);
    assert_eq!(info["audio"]["track_number"], AUDIO_TRACK);
    assert_eq!(info["audio"]["sample_rate"], 8000);
    Ok(())
}

#[test]
fn open_mode_limits_track_selection() -> anyhow::Result<()> {
    let clip = Clip::default();

    let mut audio = open_clip(&clip, OpenMode::AudioOnly)?;
    assert!(!audio.has_video());
    assert_eq!(audio.video_width(), 0);
    let frame = audio.read_frame()?;
    assert!(frame.video.is_none());
    assert!(frame.audio.is_some());

    let mut video = open_clip(&clip, OpenMode::VideoOnly)?;
    assert!(!video.has_audio());
    assert_eq!(video.audio_rate(), 0);
    let frame = video.read_frame()?;
    assert!(frame.audio.is_none());
    assert_eq!(frame.video.map(|v| v.data.to_vec()), Some(video_payload(0)));

    let err = open_clip(&Clip::audio_only(), OpenMode::VideoOnly).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStreamFormat);
    Ok(())
}

#[test]
fn reads_every_packet_with_non_decreasing_tell() -> anyhow::Result<()> {
    let clip = Clip::default();
    let mut stream = open_clip(&clip, OpenMode::Any)?;

    let mut video_frames = 0u64;
    let mut audio_packets = 0usize;
    let mut last_tell = stream.tell();

    loop {
        match stream.read_frame() {
            Ok(frame) => {
                assert!(frame.video.is_some() || frame.audio.is_some());
                if let Some(video) = frame.video {
                    assert_eq!(video.data, video_payload(video_frames).as_slice());
                    assert_eq!(video.keyframe, video_frames % common::KEYFRAME_INTERVAL == 0);
                    video_frames += 1;
                }
                if frame.audio.is_some() {
                    audio_packets += 1;
                }
            }
            Err(e) if e.is_stream_end() => break,
            Err(e) => return Err(e.into()),
        }

        assert!(stream.tell() >= last_tell);
        last_tell = stream.tell();
    }

    assert_eq!(video_frames, clip.total_video_frames());
    assert_eq!(
        audio_packets,
        clip.total_audio_frames() / common::AUDIO_PACKET_FRAMES
    );
    assert!(stream.is_eos());
    assert_eq!(stream.last_error(), Some(ErrorKind::StreamEnd));
    assert!(!stream.io_failed());

    // Stays at the end.
    assert!(stream.read_frame().unwrap_err().is_stream_end());
    assert_eq!(stream.tell(), last_tell);
    Ok(())
}

#[test]
fn rewind_returns_to_the_exact_start() -> anyhow::Result<()> {
    let mut stream = open_clip(&Clip::default(), OpenMode::Any)?;

    let first = stream.read_frame()?;
    let first_video = first.video.map(|v| (v.data.to_vec(), v.timestamp, v.keyframe));
    let first_audio = first.audio.map(|a| (a.data.to_vec(), a.timestamp));

    for _ in 0..40 {
        stream.read_frame()?;
    }
    assert!(stream.tell() > 0.0);

    stream.rewind()?;
    assert_eq!(stream.tell(), 0.0);

    let again = stream.read_frame()?;
    assert_eq!(again.video.map(|v| (v.data.to_vec(), v.timestamp, v.keyframe)), first_video);
    assert_eq!(again.audio.map(|a| (a.data.to_vec(), a.timestamp)), first_audio);
    Ok(())
}

#[test]
fn rewind_after_stream_end_reopens_the_stream() -> anyhow::Result<()> {
    let mut stream = open_clip(&Clip::audio_only(), OpenMode::Any)?;
    while stream.read_frame().is_ok() {}
    assert!(stream.is_eos());

    stream.rewind()?;
    assert!(!stream.is_eos());
    assert_eq!(stream.tell(), 0.0);
    assert_eq!(stream.read_frame()?.audio.map(|a| a.timestamp), Some(0.0));
    Ok(())
}

fn assert_seek_lands_on_keyframe(clip: Clip) -> anyhow::Result<()> {
    let mut stream = open_clip(&clip, OpenMode::Any)?;

    stream.seek(1.5)?;
    let position = stream.tell();
    assert!((1.0..=1.5).contains(&position), "position {position}");

    let frame = stream.read_frame()?;
    let video = frame.video.expect("video after seek");
    assert!(video.keyframe);
    assert_eq!(video.timestamp, 1.0);
    assert_eq!(video.data, video_payload(25).as_slice());

    // Backwards too.
    stream.seek(0.5)?;
    assert_eq!(stream.tell(), 0.0);
    assert_eq!(stream.read_frame()?.video.map(|v| v.keyframe), Some(true));
    Ok(())
}

#[test]
fn seek_uses_cues() -> anyhow::Result<()> {
    assert_seek_lands_on_keyframe(Clip::default())
}

#[test]
fn seek_without_cues_scans_clusters() -> anyhow::Result<()> {
    assert_seek_lands_on_keyframe(Clip {
        cues: false,
        ..Clip::default()
    })
}

#[test]
fn seek_in_live_stream_with_unknown_sizes() -> anyhow::Result<()> {
    assert_seek_lands_on_keyframe(Clip {
        cues: false,
        live: true,
        ..Clip::default()
    })
}

#[test]
fn seek_without_cues_backs_up_to_an_earlier_keyframe() -> anyhow::Result<()> {
    // Keyframes at 0 s and 2 s only, one cluster per second.
    for live in [false, true] {
        let clip = Clip {
            cues: false,
            live,
            keyframe_every: 50,
            ..Clip::video_only()
        };
        let mut stream = open_clip(&clip, OpenMode::Any)?;

        stream.seek(1.5)?;
        assert!(stream.tell() <= 1.5, "position {}", stream.tell());
        let video = stream.read_frame()?.video.expect("video after seek");
        assert!(video.keyframe);
        assert_eq!(video.timestamp, 0.0);
        assert_eq!(video.data, video_payload(0).as_slice());

        stream.seek(2.5)?;
        let video = stream.read_frame()?.video.expect("video after seek");
        assert!(video.keyframe);
        assert_eq!(video.timestamp, 2.0);
    }
    Ok(())
}

#[test]
fn live_stream_reads_to_the_end() -> anyhow::Result<()> {
    let clip = Clip {
        live: true,
        ..Clip::default()
    };
    let mut stream = open_clip(&clip, OpenMode::VideoOnly)?;
    assert_eq!(stream.duration(), Some(3.0));

    let mut frames = 0;
    while let Ok(frame) = stream.read_frame() {
        assert!(frame.video.is_some());
        frames += 1;
    }
    assert_eq!(frames, clip.total_video_frames());
    assert_eq!(stream.last_error(), Some(ErrorKind::StreamEnd));
    Ok(())
}

#[test]
fn seek_after_stream_end_resumes_reading() -> anyhow::Result<()> {
    let mut stream = open_clip(&Clip::default(), OpenMode::Any)?;
    while stream.read_frame().is_ok() {}

    stream.seek(2.0)?;
    assert!(!stream.is_eos());
    assert_eq!(stream.tell(), 2.0);
    assert_eq!(stream.last_error(), None);
    assert_eq!(stream.read_frame()?.video.map(|v| v.timestamp), Some(2.0));
    Ok(())
}

#[test]
fn out_of_range_seek_leaves_state_unchanged() -> anyhow::Result<()> {
    let mut stream = open_clip(&Clip::default(), OpenMode::Any)?;
    for _ in 0..5 {
        stream.read_frame()?;
    }
    let before = stream.tell();

    for target in [-1.0, 3.5, f64::NAN, f64::INFINITY] {
        let err = stream.seek(target).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(stream.last_error(), Some(ErrorKind::InvalidArgument));
        assert_eq!(stream.tell(), before);
    }

    // Reading carries on where it stopped.
    let frame = stream.read_frame()?;
    let next = frame
        .video
        .map(|v| v.timestamp)
        .or(frame.audio.map(|a| a.timestamp))
        .unwrap_or_default();
    assert!(next >= before);
    assert_eq!(stream.last_error(), None);
    Ok(())
}

#[test]
fn unseekable_stream_refuses_seek_and_rewind() -> anyhow::Result<()> {
    let callbacks = TrackedCallbacks::new(Clip::default().build(), false);
    let mut stream = WebmStream::open_callbacks(callbacks, OpenOptions::default())?;
    assert!(!stream.is_seekable());

    stream.read_frame()?;
    let before = stream.tell();

    assert_eq!(stream.seek(1.0).unwrap_err().kind(), ErrorKind::UnseekableStream);
    assert_eq!(stream.rewind().unwrap_err().kind(), ErrorKind::UnseekableStream);
    assert_eq!(stream.last_error(), Some(ErrorKind::UnseekableStream));
    assert_eq!(stream.tell(), before);

    // Still readable.
    stream.read_frame()?;
    Ok(())
}

#[test]
fn close_callback_runs_exactly_once() -> anyhow::Result<()> {
    let callbacks = TrackedCallbacks::new(Clip::default().build(), true);
    let counter = callbacks.close_counter();

    let mut stream = WebmStream::open_callbacks(callbacks, OpenOptions::default())?;
    for _ in 0..10 {
        stream.read_frame()?;
    }
    stream.seek(2.0)?;
    stream.read_frame()?;
    assert_eq!(closes(&counter), 0);

    stream.close();
    assert_eq!(closes(&counter), 1);
    Ok(())
}

#[test]
fn dropping_a_handle_closes_it() -> anyhow::Result<()> {
    let callbacks = TrackedCallbacks::new(Clip::default().build(), true);
    let counter = callbacks.close_counter();

    let stream = WebmStream::open_callbacks(callbacks, OpenOptions::default())?;
    drop(stream);
    assert_eq!(closes(&counter), 1);
    Ok(())
}

#[test]
fn failed_open_still_closes_callbacks() {
    let callbacks = TrackedCallbacks::new(vec![0u8; 64], true);
    let counter = callbacks.close_counter();

    assert!(WebmStream::open_callbacks(callbacks, OpenOptions::default()).is_err());
    assert_eq!(closes(&counter), 1);
}

#[test]
fn opens_files_from_disk() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("clip.webm");
    std::fs::write(&path, Clip::default().build())?;

    let mut stream = WebmStream::open_file(&path, OpenOptions::default())?;
    assert!(stream.is_seekable());
    let frame = stream.read_frame()?;
    assert_eq!(frame.video.map(|v| v.timestamp), Some(0.0));
    stream.close();

    let err = WebmStream::open_file(dir.path().join("missing.webm"), OpenOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileOpenFailed);
    Ok(())
}

#[test]
fn small_read_buffers_behave_the_same() -> anyhow::Result<()> {
    let data = Clip::default().build();
    let mut small =
        WebmStream::open_buffer(data.clone(), OpenOptions::new().read_buffer_size(1))?;
    let mut large = WebmStream::open_buffer(data, OpenOptions::new().read_buffer_size(1 << 20))?;

    loop {
        match (small.read_frame(), large.read_frame()) {
            (Ok(a), Ok(b)) => assert_eq!(a, b),
            (Err(a), Err(b)) => {
                assert!(a.is_stream_end() && b.is_stream_end());
                break;
            }
            (a, b) => panic!("streams diverged: {:?} vs {:?}", a.is_ok(), b.is_ok()),
        }
    }
    Ok(())
}

#[test]
fn handles_are_independent_across_threads() -> anyhow::Result<()> {
    let data = Clip::default().build();

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let data = data.clone();
            std::thread::spawn(move || -> webmdec::Result<u64> {
                let mut stream = WebmStream::open_buffer(data, OpenOptions::default())?;
                stream.seek(i as f64 * 0.5)?;
                let mut frames = 0;
                while stream.read_frame().is_ok() {
                    frames += 1;
                }
                Ok(frames)
            })
        })
        .collect();

    for worker in workers {
        let frames = worker.join().expect("worker panicked")?;
        assert!(frames > 0);
    }
    Ok(())
}

#[test]
fn video_track_number_is_reported() -> anyhow::Result<()> {
    let stream = open_clip(&Clip::video_only(), OpenMode::Any)?;
    let info = stream.info();
    assert_eq!(info.video.map(|v| v.track_number), Some(VIDEO_TRACK));
    assert!(info.audio.is_none());
    Ok(())
}

#[test]
fn invisible_frames_are_flagged() -> anyhow::Result<()> {
    let mut hidden = vec![0x80 | VIDEO_TRACK as u8, 0, 40, 0x08];
    hidden.extend(video_payload(1));

    let mut cluster = common::uint(common::ids::TIMECODE, 0);
    cluster.extend(common::simple_block(VIDEO_TRACK, 0, true, &video_payload(0)));
    cluster.extend(common::element(common::ids::SIMPLE_BLOCK, &hidden));
    let data = common::file_with(&common::video_track(VIDEO_TRACK), &[cluster], 80.0);

    let mut stream = WebmStream::open_buffer(data, OpenOptions::default())?;
    let shown = stream.read_frame()?.video.expect("first frame");
    assert!(!shown.invisible);
    let hidden = stream.read_frame()?.video.expect("second frame");
    assert!(hidden.invisible);
    assert!(!hidden.keyframe);
    assert_eq!(hidden.timestamp, 0.04);
    Ok(())
}
