//! EBML primitives: variable-size integers, element headers, typed payload readers.
//!
//! All integers in EBML are big-endian. Variable-size integers use a leading-1 length marker:
//! - 1 byte:  `1xxx xxxx`
//! - 2 bytes: `01xx xxxx xxxx xxxx`
//! - ...up to 8 bytes for data sizes (IDs stop at 4).
//!
//! Element IDs keep their marker bit; sizes and block track numbers strip it.

use std::io::{self, Read, Seek, SeekFrom};

use crate::error::{Error, Result};

/// Sentinel for an element whose data size is "unknown" (all value bits set).
pub const UNKNOWN_SIZE: u64 = u64::MAX;

/// Largest chunk `read_binary_into` allocates ahead of the data it has actually read.
const READ_STEP: usize = 64 * 1024;

/// An element header: ID, payload size and where it sits in the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementHeader {
    pub id: u32,
    /// Payload size in bytes, or [`UNKNOWN_SIZE`].
    pub size: u64,
    /// Stream offset of the first ID byte.
    pub position: u64,
    /// Bytes taken by the ID and size fields.
    pub header_size: u64,
}

impl ElementHeader {
    pub fn data_offset(&self) -> u64 {
        self.position + self.header_size
    }

    pub fn has_known_size(&self) -> bool {
        self.size != UNKNOWN_SIZE
    }

    /// Offset just past the payload, or `None` for unknown-size elements.
    pub fn end_offset(&self) -> Option<u64> {
        self.has_known_size()
            .then(|| self.data_offset().saturating_add(self.size))
    }
}

/// Read an element header at the current position.
///
/// Returns `Ok(None)` on a clean end of stream before the first ID byte. A stream that ends
/// inside the header is an `UnexpectedEof` I/O error.
pub fn read_element<R: Read + Seek>(reader: &mut R) -> Result<Option<ElementHeader>> {
    let position = reader.stream_position()?;

    let Some(first) = read_byte_or_eof(reader)? else {
        return Ok(None);
    };
    let id = read_vint_id_with_first(reader, first)?;
    let size = read_vint_size(reader)?;

    let after = reader.stream_position()?;
    Ok(Some(ElementHeader {
        id,
        size,
        position,
        header_size: after - position,
    }))
}

fn read_vint_id_with_first<R: Read>(reader: &mut R, first: u8) -> Result<u32> {
    let width = vint_width(first)?;
    if width > 4 {
        return Err(Error::format(format!(
            "element ID wider than 4 bytes (leading byte 0x{first:02X})"
        )));
    }

    let mut id = first as u32;
    for _ in 1..width {
        id = (id << 8) | read_byte(reader)? as u32;
    }
    Ok(id)
}

/// Read a data size (1-8 bytes, marker bit stripped).
///
/// Returns [`UNKNOWN_SIZE`] for the all-ones reserved value.
pub fn read_vint_size<R: Read>(reader: &mut R) -> Result<u64> {
    let first = read_byte(reader)?;
    let width = vint_width(first)?;

    let mask = if width == 8 { 0 } else { 0xFFu8 >> width };
    let mut value = (first & mask) as u64;
    for _ in 1..width {
        value = (value << 8) | read_byte(reader)? as u64;
    }

    let all_ones = (1u64 << (7 * width as u32)) - 1;
    if value == all_ones {
        return Ok(UNKNOWN_SIZE);
    }
    Ok(value)
}

/// Decode a vint from the start of `data` (marker stripped), as used in block headers
/// and EBML lacing. Returns `(value, bytes_consumed)`.
pub fn parse_vint(data: &[u8]) -> Result<(u64, usize)> {
    let Some(&first) = data.first() else {
        return Err(Error::format("truncated variable-size integer"));
    };
    let width = vint_width(first)? as usize;
    if data.len() < width {
        return Err(Error::format("truncated variable-size integer"));
    }

    let mask = if width == 8 { 0 } else { 0xFFu8 >> width };
    let mut value = (first & mask) as u64;
    for &b in &data[1..width] {
        value = (value << 8) | b as u64;
    }
    Ok((value, width))
}

/// Like [`parse_vint`], but interpreted as a signed value (EBML lacing size deltas).
pub fn parse_signed_vint(data: &[u8]) -> Result<(i64, usize)> {
    let (raw, width) = parse_vint(data)?;
    let bias = (1i64 << (7 * width as u32 - 1)) - 1;
    Ok((raw as i64 - bias, width))
}

/// Read an unsigned integer payload (0-8 bytes).
pub fn read_uint<R: Read>(reader: &mut R, size: u64) -> Result<u64> {
    if size > 8 {
        return Err(Error::format(format!("invalid unsigned integer size {size}")));
    }
    let mut value = 0u64;
    for _ in 0..size {
        value = (value << 8) | read_byte(reader)? as u64;
    }
    Ok(value)
}

/// Read a float payload (0, 4 or 8 bytes).
pub fn read_float<R: Read>(reader: &mut R, size: u64) -> Result<f64> {
    match size {
        0 => Ok(0.0),
        4 => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            Ok(f32::from_be_bytes(buf) as f64)
        }
        8 => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            Ok(f64::from_be_bytes(buf))
        }
        _ => Err(Error::format(format!("invalid float size {size}"))),
    }
}

/// Read a string payload, dropping trailing NUL padding. Invalid UTF-8 is replaced, not fatal.
pub fn read_string<R: Read>(reader: &mut R, size: u64) -> Result<String> {
    let data = read_binary(reader, size)?;
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    Ok(String::from_utf8_lossy(&data[..end]).into_owned())
}

/// Read a binary payload into a freshly allocated buffer.
pub fn read_binary<R: Read>(reader: &mut R, size: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    read_binary_into(reader, size, &mut buf)?;
    Ok(buf)
}

/// Read a binary payload into `buf`, replacing its contents and reusing its allocation.
///
/// The buffer grows in bounded steps as bytes actually arrive, so a bogus size field costs at
/// most one step of memory before the stream runs dry. Allocation goes through `try_reserve` and
/// surfaces as `OutOfMemory` instead of aborting.
pub fn read_binary_into<R: Read>(reader: &mut R, size: u64, buf: &mut Vec<u8>) -> Result<()> {
    if size == UNKNOWN_SIZE {
        return Err(Error::format("binary element with unknown size"));
    }
    let len = usize::try_from(size)
        .map_err(|_| Error::format(format!("element size {size} exceeds address space")))?;

    buf.clear();
    while buf.len() < len {
        let start = buf.len();
        let step = (len - start).min(READ_STEP);
        buf.try_reserve(step)?;
        buf.resize(start + step, 0);
        if let Err(e) = reader.read_exact(&mut buf[start..]) {
            buf.truncate(start);
            return Err(e.into());
        }
    }
    Ok(())
}

/// Skip `size` payload bytes.
pub fn skip<R: Read + Seek>(reader: &mut R, size: u64) -> Result<()> {
    if size == UNKNOWN_SIZE {
        return Err(Error::format("cannot skip an element of unknown size"));
    }
    let delta = i64::try_from(size)
        .map_err(|_| Error::format(format!("element size {size} is too large to skip")))?;
    reader.seek(SeekFrom::Current(delta))?;
    Ok(())
}

/// Whether an I/O-backed error is a stream that ended mid-element.
pub fn is_truncation(err: &Error) -> bool {
    matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
}

fn read_byte<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_byte_or_eof<R: Read>(reader: &mut R) -> Result<Option<u8>> {
    let mut buf = [0u8; 1];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Width (1-8 bytes) of a vint from its first byte.
fn vint_width(first: u8) -> Result<u8> {
    if first == 0 {
        return Err(Error::format("invalid variable-size integer (leading byte 0x00)"));
    }
    Ok(first.leading_zeros() as u8 + 1)
}
