//! SimpleBlock / Block payload parsing.
//!
//! ```text
//! [track_number: vint] [timecode: i16, relative to cluster] [flags: u8] [lacing header?] [frames...]
//! ```
//!
//! Flag bits (SimpleBlock):
//! - 0x80: keyframe
//! - 0x08: invisible
//! - 0x06: lacing (00 none, 01 Xiph, 11 EBML, 10 fixed-size)
//! - 0x01: discardable
//!
//! Frames are returned as byte ranges into the block payload so callers decide when to copy.

use std::ops::Range;

use crate::ebml::{parse_signed_vint, parse_vint};
use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Lacing {
    None,
    Xiph,
    FixedSize,
    Ebml,
}

/// A parsed block: header fields plus the frame layout.
#[derive(Clone, Debug)]
pub struct Block {
    pub track_number: u64,
    pub timecode_offset: i16,
    pub keyframe: bool,
    pub invisible: bool,
    pub discardable: bool,
    pub lacing: Lacing,
    pub frames: Vec<Range<usize>>,
}

/// Parse a SimpleBlock payload.
pub fn parse_simple_block(data: &[u8]) -> Result<Block> {
    let (track_number, mut offset) = parse_vint(data)?;

    if data.len() < offset + 3 {
        return Err(Error::format("block header truncated"));
    }
    let timecode_offset = i16::from_be_bytes([data[offset], data[offset + 1]]);
    let flags = data[offset + 2];
    offset += 3;

    let lacing = match (flags >> 1) & 0x03 {
        0b00 => Lacing::None,
        0b01 => Lacing::Xiph,
        0b10 => Lacing::FixedSize,
        _ => Lacing::Ebml,
    };

    let frames = match lacing {
        Lacing::None => vec![offset..data.len()],
        Lacing::Xiph => xiph_frames(data, offset)?,
        Lacing::FixedSize => fixed_frames(data, offset)?,
        Lacing::Ebml => ebml_frames(data, offset)?,
    };

    Ok(Block {
        track_number,
        timecode_offset,
        keyframe: flags & 0x80 != 0,
        invisible: flags & 0x08 != 0,
        discardable: flags & 0x01 != 0,
        lacing,
        frames,
    })
}

/// Parse a Block (inside a BlockGroup). Keyframe status comes from the group: a block with no
/// ReferenceBlock sibling is a keyframe.
pub fn parse_block(data: &[u8], has_reference: bool) -> Result<Block> {
    let mut block = parse_simple_block(data)?;
    block.keyframe = !has_reference;
    block.discardable = false;
    Ok(block)
}

/// Split a Xiph-laced buffer that starts with its own frame-count byte.
///
/// This is the layout of Vorbis CodecPrivate as well as of Xiph-laced blocks.
pub fn split_xiph(data: &[u8]) -> Result<Vec<Range<usize>>> {
    xiph_frames(data, 0)
}

fn frame_count(data: &[u8], offset: usize) -> Result<usize> {
    data.get(offset)
        .map(|&b| b as usize + 1)
        .ok_or_else(|| Error::format("lacing header truncated"))
}

/// Turn explicit sizes for all frames but the last into ranges; the last takes the remainder.
fn frames_from_sizes(data: &[u8], mut offset: usize, sizes: &[usize]) -> Result<Vec<Range<usize>>> {
    let mut frames = Vec::with_capacity(sizes.len() + 1);
    for &size in sizes {
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| Error::format("laced frame extends past block end"))?;
        frames.push(offset..end);
        offset = end;
    }
    frames.push(offset..data.len());
    Ok(frames)
}

fn xiph_frames(data: &[u8], offset: usize) -> Result<Vec<Range<usize>>> {
    let count = frame_count(data, offset)?;
    let mut pos = offset + 1;

    let mut sizes = Vec::with_capacity(count - 1);
    for _ in 1..count {
        let mut size = 0usize;
        loop {
            let b = *data
                .get(pos)
                .ok_or_else(|| Error::format("Xiph lacing sizes truncated"))?;
            pos += 1;
            size += b as usize;
            if b < 255 {
                break;
            }
        }
        sizes.push(size);
    }

    frames_from_sizes(data, pos, &sizes)
}

fn fixed_frames(data: &[u8], offset: usize) -> Result<Vec<Range<usize>>> {
    let count = frame_count(data, offset)?;
    let start = offset + 1;
    let total = data.len() - start;
    if total % count != 0 {
        return Err(Error::format(format!(
            "fixed-size lacing: {total} bytes do not split into {count} frames"
        )));
    }

    let size = total / count;
    Ok((0..count)
        .map(|i| start + i * size..start + (i + 1) * size)
        .collect())
}

fn ebml_frames(data: &[u8], offset: usize) -> Result<Vec<Range<usize>>> {
    let count = frame_count(data, offset)?;
    let mut pos = offset + 1;

    let mut sizes = Vec::with_capacity(count - 1);
    if count > 1 {
        let (first, n) = parse_vint(&data[pos..])?;
        pos += n;
        let mut prev = first as i64;
        sizes.push(first as usize);

        for _ in 2..count {
            let (delta, n) = parse_signed_vint(&data[pos..])?;
            pos += n;
            prev += delta;
            if prev < 0 {
                return Err(Error::format("EBML lacing produced a negative frame size"));
            }
            sizes.push(prev as usize);
        }
    }

    frames_from_sizes(data, pos, &sizes)
}
