//! WebM/Matroska demuxer and track selector.
//!
//! Responsibilities:
//! - Validate the EBML header and locate the Segment
//! - Parse Info, Tracks, SeekHead and Cues ahead of the first Cluster
//! - Select the first video and first audio track (per `OpenMode`)
//! - Iterate packets of the selected tracks, skipping everything else
//! - Reposition to a keyframe-aligned cluster for seeks, and exactly to the start for rewinds
//!
//! The parser only moves forward through the byte stream during playback, so unseekable inputs
//! (pipes, live unknown-size clusters) work as long as nobody seeks.

use std::collections::VecDeque;
use std::io::{Seek, SeekFrom};

use tracing::{debug, trace, warn};

use crate::block::{Block, parse_block, parse_simple_block};
use crate::ebml::{
    ElementHeader, is_truncation, read_binary, read_binary_into, read_element, read_float,
    read_string, read_uint, skip,
};
use crate::elements::*;
use crate::error::{Error, Result};
use crate::io::ByteStream;
use crate::opts::OpenMode;
use crate::track::{AudioParams, TrackInfo, TrackKind, VideoParams};

const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;
const MAX_EBML_READ_VERSION: u64 = 1;
const MAX_DOC_TYPE_READ_VERSION: u64 = 4;

/// One compressed frame of a selected track.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub kind: TrackKind,
    pub track_number: u64,
    /// Presentation time in nanoseconds, clamped at zero.
    pub timestamp_ns: u64,
    pub keyframe: bool,
    pub invisible: bool,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn timestamp(&self) -> f64 {
        self.timestamp_ns as f64 / 1_000_000_000.0
    }
}

/// One cue: a track's keyframe at `time` lives in the cluster at `cluster_offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CuePoint {
    /// Timecode in TimecodeScale units.
    time: u64,
    track: u64,
    /// Absolute byte offset of the cluster.
    cluster_offset: u64,
}

#[derive(Clone, Copy, Debug)]
struct ClusterState {
    offset: u64,
    timecode: u64,
    end: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ClusterEntry {
    offset: u64,
    timecode: u64,
}

/// Everything a failed seek needs to put back.
struct ReadState {
    position: u64,
    cluster: Option<ClusterState>,
    pending_header: Option<ElementHeader>,
    queue: VecDeque<Packet>,
    drop_until_keyframe: bool,
    eos: bool,
}

pub struct Demuxer {
    stream: ByteStream,

    doc_type: String,
    timecode_scale: u64,
    /// Segment duration in TimecodeScale units.
    duration: Option<f64>,

    segment_offset: u64,
    segment_end: Option<u64>,
    first_cluster: Option<u64>,

    tracks: Vec<TrackInfo>,
    video: Option<usize>,
    audio: Option<usize>,

    cues: Vec<CuePoint>,
    // Clusters seen so far, sorted by offset. Used for seeking when Cues are missing.
    clusters: Vec<ClusterEntry>,

    cluster: Option<ClusterState>,
    // A header read past the end of an unknown-size element, to be handled next.
    pending_header: Option<ElementHeader>,
    queue: VecDeque<Packet>,
    block_buf: Vec<u8>,
    drop_until_keyframe: bool,
    eos: bool,
}

impl std::fmt::Debug for Demuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Demuxer")
            .field("doc_type", &self.doc_type)
            .field("timecode_scale", &self.timecode_scale)
            .field("video", &self.video)
            .field("audio", &self.audio)
            .field("eos", &self.eos)
            .finish_non_exhaustive()
    }
}

impl Demuxer {
    /// Parse the stream headers and select tracks.
    pub fn open(mut stream: ByteStream, mode: OpenMode) -> Result<Self> {
        let doc_type =
            read_ebml_header(&mut stream).map_err(|e| truncated_as_format(e, &stream))?;
        let segment = find_segment(&mut stream).map_err(|e| truncated_as_format(e, &stream))?;

        let segment_offset = segment.data_offset();
        let segment_end = match (segment.end_offset(), stream.length()) {
            (Some(end), Some(len)) if end > len => {
                warn!(end, len, "segment extends past end of stream; clamping");
                Some(len)
            }
            (end, _) => end,
        };

        let mut demuxer = Self {
            stream,
            doc_type,
            timecode_scale: DEFAULT_TIMECODE_SCALE,
            duration: None,
            segment_offset,
            segment_end,
            first_cluster: None,
            tracks: Vec::new(),
            video: None,
            audio: None,
            cues: Vec::new(),
            clusters: Vec::new(),
            cluster: None,
            pending_header: None,
            queue: VecDeque::new(),
            block_buf: Vec::new(),
            drop_until_keyframe: false,
            eos: false,
        };

        let cues_position = demuxer.read_segment_metadata()?;
        if demuxer.tracks.is_empty() {
            return Err(Error::format("no Tracks element before the first Cluster"));
        }

        if demuxer.cues.is_empty()
            && demuxer.stream.is_seekable()
            && let Some(relative) = cues_position
        {
            demuxer.load_cues_at(segment_offset + relative)?;
        }

        demuxer.select_tracks(mode)?;
        Ok(demuxer)
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    pub fn timecode_scale(&self) -> u64 {
        self.timecode_scale
    }

    /// Segment duration in seconds, if the Info element declares one.
    pub fn duration(&self) -> Option<f64> {
        self.duration
            .map(|d| d * self.timecode_scale as f64 / 1_000_000_000.0)
    }

    pub fn is_seekable(&self) -> bool {
        self.stream.is_seekable()
    }

    pub fn tracks(&self) -> &[TrackInfo] {
        &self.tracks
    }

    pub fn video_track(&self) -> Option<&TrackInfo> {
        self.video.map(|i| &self.tracks[i])
    }

    pub fn audio_track(&self) -> Option<&TrackInfo> {
        self.audio.map(|i| &self.tracks[i])
    }

    /// Whether a callback read has failed at some point (as opposed to a clean end).
    pub fn io_failed(&self) -> bool {
        self.stream.io_failed()
    }

    /// Invoke the stream's close callback (idempotent).
    pub fn close(&mut self) {
        self.queue.clear();
        self.stream.close();
    }

    /// The next packet of a selected track, or `None` at end of stream.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            if let Some(packet) = self.queue.pop_front() {
                if self.drop_until_keyframe && packet.kind == TrackKind::Video {
                    if !packet.keyframe {
                        trace!(ts = packet.timestamp(), "dropping non-keyframe after seek");
                        continue;
                    }
                    self.drop_until_keyframe = false;
                }
                return Ok(Some(packet));
            }

            if self.eos {
                return Ok(None);
            }

            match self.advance() {
                Ok(true) => {}
                Ok(false) => self.eos = true,
                Err(e) if is_truncation(&e) && !self.stream.io_failed() => {
                    warn!(
                        position = self.stream.position(),
                        "stream ends inside an element; treating as end of stream"
                    );
                    self.eos = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Push a packet back so the next `next_packet` returns it again.
    pub fn unread(&mut self, packet: Packet) {
        self.queue.push_front(packet);
    }

    /// Reposition to the cluster holding the nearest keyframe at or before `seconds`.
    ///
    /// Returns the timestamp of the first packet that will be delivered afterwards. On failure
    /// the read position is restored.
    pub fn seek(&mut self, seconds: f64) -> Result<f64> {
        if !self.stream.is_seekable() {
            return Err(Error::UnseekableStream);
        }
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(Error::InvalidArgument(format!("seek target {seconds}")));
        }
        if let Some(duration) = self.duration()
            && seconds > duration
        {
            return Err(Error::InvalidArgument(format!(
                "seek target {seconds}s is past the end ({duration}s)"
            )));
        }

        let Some(first_cluster) = self.first_cluster else {
            self.eos = true;
            return Ok(0.0);
        };

        let target = (seconds * 1_000_000_000.0 / self.timecode_scale as f64).floor() as u64;
        let saved = self.save_state();

        match self.seek_to_timecode(target, first_cluster) {
            Ok(position) => {
                debug!(seconds, position, "seek complete");
                Ok(position)
            }
            Err(e) => {
                warn!(seconds, error = %e, "seek failed; restoring read position");
                self.restore_state(saved);
                Err(e)
            }
        }
    }

    /// Return to the very first packet of the stream.
    pub fn rewind(&mut self) -> Result<()> {
        if !self.stream.is_seekable() {
            return Err(Error::UnseekableStream);
        }

        match self.first_cluster {
            Some(offset) => self.position_at(offset)?,
            None => {
                self.reset_read_state();
                self.eos = true;
            }
        }
        debug!("rewound to start");
        Ok(())
    }

    fn seek_to_timecode(&mut self, target: u64, first_cluster: u64) -> Result<f64> {
        let offset = match self.cue_for(target) {
            Some(offset) => offset,
            None => {
                let candidate = self.scan_for_cluster(target, first_cluster)?;
                if self.video.is_some() {
                    self.keyframe_cluster(candidate, target, first_cluster)?
                } else {
                    candidate
                }
            }
        };

        self.position_at(offset)?;
        self.drop_until_keyframe = self.video.is_some();

        match self.next_packet()? {
            Some(packet) => {
                let position = packet.timestamp();
                self.unread(packet);
                Ok(position)
            }
            None => {
                let timecode = self
                    .clusters
                    .iter()
                    .find(|c| c.offset == offset)
                    .map_or(0, |c| c.timecode);
                Ok(self.timecode_to_seconds(timecode))
            }
        }
    }

    /// The cluster offset of the last cue at or before `target` for the reference track.
    fn cue_for(&self, target: u64) -> Option<u64> {
        if self.cues.is_empty() {
            return None;
        }

        let reference = self
            .video_track()
            .or_else(|| self.audio_track())
            .map(|t| t.number);
        let for_track = |c: &&CuePoint| reference.is_none_or(|n| c.track == n);
        let use_all = !self.cues.iter().any(|c| for_track(&c));

        self.cues
            .iter()
            .filter(|c| use_all || for_track(c))
            .take_while(|c| c.time <= target)
            .last()
            .map(|c| c.cluster_offset)
            .or(self.first_cluster)
    }

    /// Find the last cluster starting at or before `target` using the cluster index, scanning
    /// forward through cluster headers past the last indexed one when needed.
    fn scan_for_cluster(&mut self, target: u64, first_cluster: u64) -> Result<u64> {
        let mut best = first_cluster;
        let mut scan_from = first_cluster;
        for entry in &self.clusters {
            if entry.timecode > target {
                return Ok(best);
            }
            best = entry.offset;
            scan_from = entry.offset;
        }

        self.position_at(scan_from)?;
        loop {
            let header = match self.next_header_for_scan() {
                Ok(Some(h)) => h,
                Ok(None) => break,
                Err(e) if is_truncation(&e) => break,
                Err(e) => return Err(e),
            };

            if header.id != CLUSTER {
                if !header.has_known_size() {
                    break;
                }
                skip(&mut self.stream, header.size)?;
                continue;
            }

            let Some(timecode) = self.read_cluster_timecode(&header)? else {
                break;
            };
            self.note_cluster(header.position, timecode);
            if timecode > target {
                break;
            }
            best = header.position;

            match header.end_offset() {
                Some(end) => {
                    self.stream.seek(SeekFrom::Start(end))?;
                }
                None => self.skip_unknown_size_cluster()?,
            }
        }

        trace!(target, best, "cluster scan finished");
        Ok(best)
    }

    /// Walk back from `candidate` to the closest cluster whose first video keyframe is at or
    /// before `target`. Without such a cluster, the first one.
    fn keyframe_cluster(&mut self, candidate: u64, target: u64, first_cluster: u64) -> Result<u64> {
        let target_ns = target.saturating_mul(self.timecode_scale);

        let mut offsets: Vec<u64> = self
            .clusters
            .iter()
            .map(|c| c.offset)
            .filter(|&offset| offset <= candidate)
            .collect();
        offsets.push(candidate);
        offsets.sort_unstable();
        offsets.dedup();

        for &offset in offsets.iter().rev() {
            match self.first_keyframe_in(offset)? {
                Some(ts) if ts <= target_ns => {
                    trace!(target, offset, keyframe_ns = ts, "keyframe cluster found");
                    return Ok(offset);
                }
                _ => trace!(offset, "no usable keyframe in cluster; stepping back"),
            }
        }
        Ok(first_cluster)
    }

    /// Timestamp of the first video keyframe inside the cluster at `offset`.
    fn first_keyframe_in(&mut self, offset: u64) -> Result<Option<u64>> {
        self.position_at(offset)?;
        while let Some(packet) = self.next_packet()? {
            if self.cluster.is_none_or(|c| c.offset != offset) {
                break;
            }
            if packet.kind == TrackKind::Video && packet.keyframe {
                return Ok(Some(packet.timestamp_ns));
            }
        }
        Ok(None)
    }

    fn next_header_for_scan(&mut self) -> Result<Option<ElementHeader>> {
        if let Some(h) = self.pending_header.take() {
            return Ok(Some(h));
        }
        if self.at_segment_end() {
            return Ok(None);
        }
        read_element(&mut self.stream)
    }

    /// Read children of a freshly entered cluster until its Timecode appears.
    fn read_cluster_timecode(&mut self, cluster: &ElementHeader) -> Result<Option<u64>> {
        loop {
            if let Some(end) = cluster.end_offset()
                && self.stream.position() >= end
            {
                return Ok(None);
            }
            let Some(child) = read_element(&mut self.stream)? else {
                return Ok(None);
            };
            match child.id {
                TIMECODE => return read_uint(&mut self.stream, child.size).map(Some),
                id if is_level1(id) => {
                    self.pending_header = Some(child);
                    return Ok(None);
                }
                _ => skip(&mut self.stream, child.size)?,
            }
        }
    }

    /// Skip the remaining children of an unknown-size cluster, stopping at the next level-1 header.
    fn skip_unknown_size_cluster(&mut self) -> Result<()> {
        loop {
            if self.at_segment_end() {
                return Ok(());
            }
            let Some(child) = read_element(&mut self.stream)? else {
                return Ok(());
            };
            if is_level1(child.id) {
                self.pending_header = Some(child);
                return Ok(());
            }
            skip(&mut self.stream, child.size)?;
        }
    }

    fn at_segment_end(&self) -> bool {
        self.segment_end
            .is_some_and(|end| self.stream.position() >= end)
    }

    /// Consume one element. `Ok(false)` means the segment (or stream) is exhausted.
    fn advance(&mut self) -> Result<bool> {
        if self.pending_header.is_none() {
            let position = self.stream.position();
            if let Some(cluster) = self.cluster
                && cluster.end.is_some_and(|end| position >= end)
            {
                self.cluster = None;
            }
            if self.at_segment_end() {
                return Ok(false);
            }
        }

        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match read_element(&mut self.stream)? {
                Some(h) => h,
                None => return Ok(false),
            },
        };

        match header.id {
            CLUSTER => {
                self.cluster = Some(ClusterState {
                    offset: header.position,
                    timecode: 0,
                    end: header.end_offset(),
                });
            }
            TIMECODE if self.cluster.is_some() => {
                let timecode = read_uint(&mut self.stream, header.size)?;
                if let Some(cluster) = self.cluster.as_mut() {
                    cluster.timecode = timecode;
                    let offset = cluster.offset;
                    self.note_cluster(offset, timecode);
                }
            }
            SIMPLE_BLOCK => {
                self.read_block_payload(&header)?;
                let block = parse_simple_block(&self.block_buf)?;
                self.enqueue(&block)?;
            }
            BLOCK_GROUP => self.read_block_group(&header)?,
            id => {
                if is_level1(id) {
                    self.cluster = None;
                }
                if !header.has_known_size() {
                    return Err(Error::format(format!(
                        "element 0x{id:X} has unknown size"
                    )));
                }
                skip(&mut self.stream, header.size)?;
            }
        }
        Ok(true)
    }

    fn read_block_payload(&mut self, header: &ElementHeader) -> Result<()> {
        check_size(&self.stream, header)?;
        read_binary_into(&mut self.stream, header.size, &mut self.block_buf)
    }

    fn read_block_group(&mut self, group: &ElementHeader) -> Result<()> {
        let end = known_end(group)?;
        let mut has_block = false;
        let mut has_reference = false;

        while let Some(child) = next_child(&mut self.stream, end)? {
            match child.id {
                BLOCK => {
                    self.read_block_payload(&child)?;
                    has_block = true;
                }
                REFERENCE_BLOCK => {
                    has_reference = true;
                    skip(&mut self.stream, child.size)?;
                }
                _ => skip(&mut self.stream, child.size)?,
            }
        }

        if has_block {
            let block = parse_block(&self.block_buf, has_reference)?;
            self.enqueue(&block)?;
        }
        Ok(())
    }

    fn enqueue(&mut self, block: &Block) -> Result<()> {
        let (index, kind) = match self.selected(block.track_number) {
            Some(selected) => selected,
            None => {
                trace!(track = block.track_number, "skipping block of unselected track");
                return Ok(());
            }
        };

        let cluster_timecode = self.cluster.map_or(0, |c| c.timecode) as i64;
        let timecode = (cluster_timecode + block.timecode_offset as i64).max(0) as u64;
        let base_ns = timecode.saturating_mul(self.timecode_scale);
        let frame_ns = self.tracks[index].default_duration_ns.unwrap_or(0);

        for (i, range) in block.frames.iter().enumerate() {
            let mut data = Vec::new();
            data.try_reserve_exact(range.len())?;
            data.extend_from_slice(&self.block_buf[range.clone()]);

            let packet = Packet {
                kind,
                track_number: block.track_number,
                timestamp_ns: base_ns.saturating_add(frame_ns.saturating_mul(i as u64)),
                keyframe: block.keyframe,
                invisible: block.invisible,
                data,
            };
            trace!(
                kind = ?packet.kind,
                ts = packet.timestamp(),
                len = packet.data.len(),
                keyframe = packet.keyframe,
                "packet"
            );
            self.queue.push_back(packet);
        }
        Ok(())
    }

    fn selected(&self, track_number: u64) -> Option<(usize, TrackKind)> {
        if let Some(i) = self.video
            && self.tracks[i].number == track_number
        {
            return Some((i, TrackKind::Video));
        }
        if let Some(i) = self.audio
            && self.tracks[i].number == track_number
        {
            return Some((i, TrackKind::Audio));
        }
        None
    }

    fn note_cluster(&mut self, offset: u64, timecode: u64) {
        if let Err(at) = self.clusters.binary_search_by_key(&offset, |c| c.offset) {
            self.clusters.insert(at, ClusterEntry { offset, timecode });
        }
    }

    fn timecode_to_seconds(&self, timecode: u64) -> f64 {
        timecode as f64 * self.timecode_scale as f64 / 1_000_000_000.0
    }

    fn reset_read_state(&mut self) {
        self.cluster = None;
        self.pending_header = None;
        self.queue.clear();
        self.drop_until_keyframe = false;
        self.eos = false;
    }

    fn position_at(&mut self, offset: u64) -> Result<()> {
        self.reset_read_state();
        self.stream.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn save_state(&mut self) -> ReadState {
        ReadState {
            position: self.stream.position(),
            cluster: self.cluster,
            pending_header: self.pending_header,
            queue: std::mem::take(&mut self.queue),
            drop_until_keyframe: self.drop_until_keyframe,
            eos: self.eos,
        }
    }

    fn restore_state(&mut self, saved: ReadState) {
        if let Err(e) = self.stream.seek(SeekFrom::Start(saved.position)) {
            warn!(error = %e, "failed to restore read position");
        }
        self.cluster = saved.cluster;
        self.pending_header = saved.pending_header;
        self.queue = saved.queue;
        self.drop_until_keyframe = saved.drop_until_keyframe;
        self.eos = saved.eos;
    }

    /// Parse level-1 elements up to the first Cluster. Returns the SeekHead's Cues position.
    fn read_segment_metadata(&mut self) -> Result<Option<u64>> {
        let mut cues_position = None;

        loop {
            if self.at_segment_end() {
                break;
            }
            let header = match read_element(&mut self.stream) {
                Ok(Some(h)) => h,
                Ok(None) => break,
                Err(e) if is_truncation(&e) && !self.stream.io_failed() => {
                    warn!("stream ends inside segment metadata");
                    break;
                }
                Err(e) => return Err(e),
            };

            match header.id {
                CLUSTER => {
                    self.first_cluster = Some(header.position);
                    self.pending_header = Some(header);
                    break;
                }
                INFO => {
                    check_size(&self.stream, &header)?;
                    let (scale, duration) = parse_info(&mut self.stream, &header)?;
                    self.timecode_scale = scale;
                    self.duration = duration;
                }
                TRACKS => {
                    check_size(&self.stream, &header)?;
                    self.tracks = parse_tracks(&mut self.stream, &header)?;
                }
                SEEK_HEAD => {
                    check_size(&self.stream, &header)?;
                    if let Some(position) = parse_seek_head(&mut self.stream, &header)? {
                        cues_position = Some(position);
                    }
                }
                CUES => {
                    check_size(&self.stream, &header)?;
                    self.cues = parse_cues(&mut self.stream, &header, self.segment_offset)?;
                }
                id => {
                    if !header.has_known_size() {
                        return Err(Error::format(format!(
                            "level-1 element 0x{id:X} has unknown size"
                        )));
                    }
                    skip(&mut self.stream, header.size)?;
                }
            }
        }

        Ok(cues_position)
    }

    /// Jump to a Cues element referenced by the SeekHead, parse it, and come back.
    /// Problems are logged and ignored; a failure to come back is not.
    fn load_cues_at(&mut self, offset: u64) -> Result<()> {
        let resume = self.stream.position();

        let loaded = (|| -> Result<Vec<CuePoint>> {
            self.stream.seek(SeekFrom::Start(offset))?;
            match read_element(&mut self.stream)? {
                Some(h) if h.id == CUES => {
                    check_size(&self.stream, &h)?;
                    parse_cues(&mut self.stream, &h, self.segment_offset)
                }
                _ => Err(Error::format("SeekHead Cues position does not point at Cues")),
            }
        })();

        match loaded {
            Ok(cues) => {
                debug!(count = cues.len(), "loaded cues via SeekHead");
                self.cues = cues;
            }
            Err(e) => warn!(offset, error = %e, "ignoring unreadable Cues"),
        }

        self.stream.seek(SeekFrom::Start(resume))?;
        Ok(())
    }

    fn select_tracks(&mut self, mode: OpenMode) -> Result<()> {
        let first_of = |kind: TrackKind| {
            self.tracks
                .iter()
                .position(|t| t.enabled && t.kind() == kind)
        };

        self.video = if mode.wants_video() {
            first_of(TrackKind::Video)
        } else {
            None
        };
        self.audio = if mode.wants_audio() {
            first_of(TrackKind::Audio)
        } else {
            None
        };

        if self.video.is_none() && self.audio.is_none() {
            return Err(Error::format(format!(
                "no usable track for open mode {mode:?}"
            )));
        }

        for track in [self.video_track(), self.audio_track()].into_iter().flatten() {
            if track.encoded {
                warn!(
                    track = track.number,
                    "track uses content encoding; payloads are passed through as stored"
                );
            }
        }

        debug!(
            doc_type = %self.doc_type,
            tracks = self.tracks.len(),
            video = ?self.video_track().map(|t| (t.number, &t.codec_id)),
            audio = ?self.audio_track().map(|t| (t.number, &t.codec_id)),
            timecode_scale = self.timecode_scale,
            duration = ?self.duration(),
            cues = self.cues.len(),
            seekable = self.stream.is_seekable(),
            "demuxer opened"
        );
        Ok(())
    }
}

fn known_end(header: &ElementHeader) -> Result<u64> {
    header.end_offset().ok_or_else(|| {
        Error::format(format!(
            "master element 0x{:X} has unknown size",
            header.id
        ))
    })
}

/// Next child header inside a parent ending at `end`, or `None` once `end` is reached.
fn next_child(stream: &mut ByteStream, end: u64) -> Result<Option<ElementHeader>> {
    if stream.position() >= end {
        return Ok(None);
    }
    let child = read_element(stream)?.ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stream ends inside a master element",
        ))
    })?;
    if child.end_offset().is_none_or(|child_end| child_end > end) {
        return Err(Error::format(format!(
            "element 0x{:X} overruns its parent",
            child.id
        )));
    }
    Ok(Some(child))
}

/// Reject payload sizes that can't possibly fit in what's left of the stream.
fn check_size(stream: &ByteStream, header: &ElementHeader) -> Result<()> {
    if !header.has_known_size() {
        return Err(Error::format(format!(
            "element 0x{:X} has unknown size",
            header.id
        )));
    }
    if let Some(remaining) = stream.remaining()
        && header.size > remaining
    {
        return Err(Error::format(format!(
            "element 0x{:X} claims {} bytes but only {remaining} remain",
            header.id, header.size
        )));
    }
    Ok(())
}

/// A stream that runs dry while the file header is parsed is malformed input, not an I/O failure.
fn truncated_as_format(err: Error, stream: &ByteStream) -> Error {
    if is_truncation(&err) && !stream.io_failed() {
        Error::format("stream ends inside the file header")
    } else {
        err
    }
}

fn read_ebml_header(stream: &mut ByteStream) -> Result<String> {
    let header = match read_element(stream) {
        Ok(Some(h)) => h,
        Ok(None) => return Err(Error::format("empty stream")),
        Err(e) if is_truncation(&e) => return Err(Error::format("stream too short")),
        Err(e) => return Err(e),
    };
    if header.id != EBML_HEADER {
        return Err(Error::format("missing EBML header"));
    }
    check_size(stream, &header)?;

    let end = known_end(&header)?;
    let mut doc_type = String::from("matroska");

    while let Some(child) = next_child(stream, end)? {
        match child.id {
            DOC_TYPE => doc_type = read_string(stream, child.size)?,
            EBML_READ_VERSION => {
                let version = read_uint(stream, child.size)?;
                if version > MAX_EBML_READ_VERSION {
                    return Err(Error::format(format!("unsupported EBML read version {version}")));
                }
            }
            DOC_TYPE_READ_VERSION => {
                let version = read_uint(stream, child.size)?;
                if version > MAX_DOC_TYPE_READ_VERSION {
                    return Err(Error::format(format!(
                        "unsupported DocTypeReadVersion {version}"
                    )));
                }
            }
            _ => skip(stream, child.size)?,
        }
    }

    if doc_type != "webm" && doc_type != "matroska" {
        return Err(Error::format(format!("unsupported DocType '{doc_type}'")));
    }
    Ok(doc_type)
}

fn find_segment(stream: &mut ByteStream) -> Result<ElementHeader> {
    loop {
        let header = read_element(stream)
            .map_err(|e| if is_truncation(&e) { Error::format("no Segment element") } else { e })?
            .ok_or_else(|| Error::format("no Segment element"))?;
        if header.id == SEGMENT {
            return Ok(header);
        }
        if !header.has_known_size() {
            return Err(Error::format("unknown-size element before Segment"));
        }
        skip(stream, header.size)?;
    }
}

fn parse_info(stream: &mut ByteStream, header: &ElementHeader) -> Result<(u64, Option<f64>)> {
    let end = known_end(header)?;
    let mut scale = DEFAULT_TIMECODE_SCALE;
    let mut duration = None;

    while let Some(child) = next_child(stream, end)? {
        match child.id {
            TIMECODE_SCALE => {
                scale = read_uint(stream, child.size)?;
                if scale == 0 {
                    return Err(Error::format("TimecodeScale is zero"));
                }
            }
            DURATION => {
                let d = read_float(stream, child.size)?;
                duration = (d.is_finite() && d >= 0.0).then_some(d);
            }
            _ => skip(stream, child.size)?,
        }
    }
    Ok((scale, duration))
}

fn parse_tracks(stream: &mut ByteStream, header: &ElementHeader) -> Result<Vec<TrackInfo>> {
    let end = known_end(header)?;
    let mut tracks = Vec::new();

    while let Some(child) = next_child(stream, end)? {
        match child.id {
            TRACK_ENTRY => {
                let track = parse_track_entry(stream, &child)?;
                if track.number == 0 {
                    warn!("ignoring track with number 0");
                    continue;
                }
                tracks.push(track);
            }
            _ => skip(stream, child.size)?,
        }
    }
    Ok(tracks)
}

fn parse_track_entry(stream: &mut ByteStream, header: &ElementHeader) -> Result<TrackInfo> {
    let end = known_end(header)?;
    let mut track = TrackInfo {
        enabled: true,
        ..TrackInfo::default()
    };

    while let Some(child) = next_child(stream, end)? {
        match child.id {
            TRACK_NUMBER => track.number = read_uint(stream, child.size)?,
            TRACK_TYPE => track.track_type = Some(read_uint(stream, child.size)?),
            FLAG_ENABLED => track.enabled = read_uint(stream, child.size)? != 0,
            CODEC_ID => track.codec_id = read_string(stream, child.size)?,
            CODEC_PRIVATE => {
                check_size(stream, &child)?;
                track.codec_private = Some(read_binary(stream, child.size)?);
            }
            DEFAULT_DURATION => {
                track.default_duration_ns = Some(read_uint(stream, child.size)?);
            }
            CONTENT_ENCODINGS => {
                track.encoded = true;
                skip(stream, child.size)?;
            }
            VIDEO => track.video = Some(parse_video(stream, &child)?),
            AUDIO => track.audio = Some(parse_audio(stream, &child)?),
            _ => skip(stream, child.size)?,
        }
    }
    Ok(track)
}

fn parse_video(stream: &mut ByteStream, header: &ElementHeader) -> Result<VideoParams> {
    let end = known_end(header)?;
    let mut params = VideoParams::default();

    while let Some(child) = next_child(stream, end)? {
        match child.id {
            PIXEL_WIDTH => params.width = clamp_u32(read_uint(stream, child.size)?),
            PIXEL_HEIGHT => params.height = clamp_u32(read_uint(stream, child.size)?),
            _ => skip(stream, child.size)?,
        }
    }
    Ok(params)
}

fn parse_audio(stream: &mut ByteStream, header: &ElementHeader) -> Result<AudioParams> {
    let end = known_end(header)?;
    let mut params = AudioParams {
        channels: 1,
        sample_rate: 8000,
        bit_depth: None,
    };
    let mut output_rate = None;

    while let Some(child) = next_child(stream, end)? {
        match child.id {
            SAMPLING_FREQUENCY => {
                params.sample_rate = read_float(stream, child.size)?.round() as u32;
            }
            OUTPUT_SAMPLING_FREQUENCY => {
                output_rate = Some(read_float(stream, child.size)?.round() as u32);
            }
            CHANNELS => params.channels = clamp_u32(read_uint(stream, child.size)?),
            BIT_DEPTH => params.bit_depth = Some(clamp_u32(read_uint(stream, child.size)?)),
            _ => skip(stream, child.size)?,
        }
    }

    if let Some(rate) = output_rate.filter(|&r| r > 0) {
        params.sample_rate = rate;
    }
    Ok(params)
}

/// Returns the Cues position (relative to the segment data) if the SeekHead lists one.
fn parse_seek_head(stream: &mut ByteStream, header: &ElementHeader) -> Result<Option<u64>> {
    let end = known_end(header)?;
    let mut cues = None;

    while let Some(seek) = next_child(stream, end)? {
        if seek.id != SEEK {
            skip(stream, seek.size)?;
            continue;
        }

        let seek_end = known_end(&seek)?;
        let mut id = None;
        let mut position = None;
        while let Some(child) = next_child(stream, seek_end)? {
            match child.id {
                SEEK_ID => id = Some(read_uint(stream, child.size)?),
                SEEK_POSITION => position = Some(read_uint(stream, child.size)?),
                _ => skip(stream, child.size)?,
            }
        }

        if id == Some(CUES as u64) {
            cues = position;
        }
    }
    Ok(cues)
}

fn parse_cues(
    stream: &mut ByteStream,
    header: &ElementHeader,
    segment_offset: u64,
) -> Result<Vec<CuePoint>> {
    let end = known_end(header)?;
    let mut cues = Vec::new();

    while let Some(point) = next_child(stream, end)? {
        if point.id != CUE_POINT {
            skip(stream, point.size)?;
            continue;
        }

        let point_end = known_end(&point)?;
        let mut time = None;
        let mut positions = Vec::new();
        while let Some(child) = next_child(stream, point_end)? {
            match child.id {
                CUE_TIME => time = Some(read_uint(stream, child.size)?),
                CUE_TRACK_POSITIONS => {
                    let pos_end = known_end(&child)?;
                    let mut track = None;
                    let mut cluster = None;
                    while let Some(field) = next_child(stream, pos_end)? {
                        match field.id {
                            CUE_TRACK => track = Some(read_uint(stream, field.size)?),
                            CUE_CLUSTER_POSITION => cluster = Some(read_uint(stream, field.size)?),
                            _ => skip(stream, field.size)?,
                        }
                    }
                    if let (Some(track), Some(cluster)) = (track, cluster) {
                        positions.push((track, cluster));
                    }
                }
                _ => skip(stream, child.size)?,
            }
        }

        if let Some(time) = time {
            cues.extend(positions.into_iter().map(|(track, cluster)| CuePoint {
                time,
                track,
                cluster_offset: segment_offset + cluster,
            }));
        }
    }

    cues.sort_by_key(|c| c.time);
    Ok(cues)
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
