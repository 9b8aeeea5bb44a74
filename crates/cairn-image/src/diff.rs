//! The image diff stream.
//!
//! A diff stream describes the changes between two points in an image's
//! history. It is framed by a banner line and a sequence of tagged records:
//!
//! | tag | record                                               |
//! |-----|------------------------------------------------------|
//! | `f` | from-snapshot name (u32-LE length-prefixed string)   |
//! | `t` | to-snapshot name (u32-LE length-prefixed string)     |
//! | `s` | end size in bytes (u64 LE)                           |
//! | `w` | write extent: u64-LE offset, u64-LE length, payload  |
//! | `z` | zero extent: u64-LE offset, u64-LE length            |
//! | `e` | end of stream                                        |
//!
//! All integers are little-endian. Truncated streams fail decoding rather
//! than yielding a partial diff.

use std::io::{Read, Write};

use bytes::Bytes;
use cairn_core::{Error, Result};

/// Banner line opening every diff stream.
pub const DIFF_BANNER: &[u8] = b"cairn diff v1\n";

/// One record in a diff stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffRecord {
    /// Name of the snapshot the diff starts from.
    FromSnap(String),
    /// Name of the snapshot the diff ends at.
    ToSnap(String),
    /// Image size at the end point.
    Size(u64),
    /// Data written in `[offset, offset + data.len())`.
    Write {
        /// Byte offset of the extent.
        offset: u64,
        /// Extent payload.
        data: Bytes,
    },
    /// Bytes discarded (read back as zero) in `[offset, offset + length)`.
    Zero {
        /// Byte offset of the extent.
        offset: u64,
        /// Extent length.
        length: u64,
    },
    /// End of stream.
    End,
}

fn write_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
    w.write_all(&(s.len() as u32).to_le_bytes())?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| Error::Encoding(format!("invalid snap name: {e}")))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Writes one record.
pub fn write_record<W: Write>(w: &mut W, record: &DiffRecord) -> Result<()> {
    match record {
        DiffRecord::FromSnap(name) => {
            w.write_all(b"f")?;
            write_string(w, name)?;
        }
        DiffRecord::ToSnap(name) => {
            w.write_all(b"t")?;
            write_string(w, name)?;
        }
        DiffRecord::Size(size) => {
            w.write_all(b"s")?;
            w.write_all(&size.to_le_bytes())?;
        }
        DiffRecord::Write { offset, data } => {
            w.write_all(b"w")?;
            w.write_all(&offset.to_le_bytes())?;
            w.write_all(&(data.len() as u64).to_le_bytes())?;
            w.write_all(data)?;
        }
        DiffRecord::Zero { offset, length } => {
            w.write_all(b"z")?;
            w.write_all(&offset.to_le_bytes())?;
            w.write_all(&length.to_le_bytes())?;
        }
        DiffRecord::End => {
            w.write_all(b"e")?;
        }
    }
    Ok(())
}

/// Writes a full stream: banner, records, terminating `e` if absent.
pub fn write_stream<W: Write>(w: &mut W, records: &[DiffRecord]) -> Result<()> {
    w.write_all(DIFF_BANNER)?;
    for record in records {
        write_record(w, record)?;
    }
    if records.last() != Some(&DiffRecord::End) {
        write_record(w, &DiffRecord::End)?;
    }
    Ok(())
}

/// Reads a full stream, banner through `e`.
pub fn read_stream<R: Read>(r: &mut R) -> Result<Vec<DiffRecord>> {
    let mut banner = vec![0u8; DIFF_BANNER.len()];
    r.read_exact(&mut banner)?;
    if banner != DIFF_BANNER {
        return Err(Error::invalid("not a diff stream (bad banner)"));
    }

    let mut records = Vec::new();
    loop {
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag)?;
        let record = match &tag {
            b"f" => DiffRecord::FromSnap(read_string(r)?),
            b"t" => DiffRecord::ToSnap(read_string(r)?),
            b"s" => DiffRecord::Size(read_u64(r)?),
            b"w" => {
                let offset = read_u64(r)?;
                let length = read_u64(r)?;
                let mut data = vec![0u8; length as usize];
                r.read_exact(&mut data)?;
                DiffRecord::Write { offset, data: Bytes::from(data) }
            }
            b"z" => {
                let offset = read_u64(r)?;
                let length = read_u64(r)?;
                DiffRecord::Zero { offset, length }
            }
            b"e" => {
                records.push(DiffRecord::End);
                return Ok(records);
            }
            other => {
                return Err(Error::invalid(format!(
                    "unknown diff record tag {:?}",
                    other[0] as char
                )));
            }
        };
        records.push(record);
    }
}

/// Parsed header portion of a diff stream plus its extents.
#[derive(Debug, Clone, Default)]
struct ParsedDiff {
    from: Option<String>,
    to: Option<String>,
    size: Option<u64>,
    extents: Vec<Extent>,
}

#[derive(Debug, Clone)]
struct Extent {
    offset: u64,
    length: u64,
    /// Payload for writes, `None` for zero extents.
    data: Option<Bytes>,
}

impl Extent {
    fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Clips the extent to `[start, end)`, returning `None` if nothing is
    /// left.
    fn clip(&self, start: u64, end: u64) -> Option<Extent> {
        let s = self.offset.max(start);
        let e = self.end().min(end);
        if s >= e {
            return None;
        }
        let data = self.data.as_ref().map(|d| {
            d.slice((s - self.offset) as usize..(e - self.offset) as usize)
        });
        Some(Extent { offset: s, length: e - s, data })
    }
}

fn parse(records: Vec<DiffRecord>) -> Result<ParsedDiff> {
    let mut parsed = ParsedDiff::default();
    let mut ended = false;
    for record in records {
        if ended {
            return Err(Error::invalid("diff records after end marker"));
        }
        match record {
            DiffRecord::FromSnap(name) => parsed.from = Some(name),
            DiffRecord::ToSnap(name) => parsed.to = Some(name),
            DiffRecord::Size(size) => parsed.size = Some(size),
            DiffRecord::Write { offset, data } => parsed.extents.push(Extent {
                offset,
                length: data.len() as u64,
                data: Some(data),
            }),
            DiffRecord::Zero { offset, length } => {
                parsed.extents.push(Extent { offset, length, data: None });
            }
            DiffRecord::End => ended = true,
        }
    }
    if !ended {
        return Err(Error::invalid("diff stream missing end marker"));
    }
    Ok(parsed)
}

/// Merges two adjacent diff streams into one.
///
/// The first stream's end snapshot must equal the second's start snapshot;
/// where extents overlap the second stream wins, and everything is clipped
/// to the second stream's end size. The output runs from the first stream's
/// start to the second stream's end, extents sorted by offset.
pub fn merge(first: Vec<DiffRecord>, second: Vec<DiffRecord>) -> Result<Vec<DiffRecord>> {
    let first = parse(first)?;
    let second = parse(second)?;

    if first.to != second.from {
        return Err(Error::invalid(format!(
            "diff streams do not chain: first ends at {:?}, second starts at {:?}",
            first.to, second.from
        )));
    }
    let end_size = second
        .size
        .ok_or_else(|| Error::invalid("second diff stream carries no size"))?;

    // The second stream's extents win; the first contributes only the
    // pieces the second leaves uncovered, clipped to the final size.
    let mut covered: Vec<(u64, u64)> =
        second.extents.iter().map(|e| (e.offset, e.end())).collect();
    covered.sort_unstable();

    let mut merged: Vec<Extent> = second.extents.clone();
    for extent in &first.extents {
        let mut cursor = extent.offset;
        let end = extent.end().min(end_size);
        for &(c_start, c_end) in &covered {
            if c_end <= cursor {
                continue;
            }
            if c_start >= end {
                break;
            }
            if c_start > cursor {
                if let Some(piece) = extent.clip(cursor, c_start.min(end)) {
                    merged.push(piece);
                }
            }
            cursor = cursor.max(c_end);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            if let Some(piece) = extent.clip(cursor, end) {
                merged.push(piece);
            }
        }
    }
    merged.sort_by_key(|e| e.offset);

    let mut records = Vec::new();
    if let Some(from) = first.from {
        records.push(DiffRecord::FromSnap(from));
    }
    if let Some(to) = second.to {
        records.push(DiffRecord::ToSnap(to));
    }
    records.push(DiffRecord::Size(end_size));
    for extent in merged {
        match extent.data {
            Some(data) => records.push(DiffRecord::Write { offset: extent.offset, data }),
            None => records.push(DiffRecord::Zero {
                offset: extent.offset,
                length: extent.length,
            }),
        }
    }
    records.push(DiffRecord::End);
    Ok(records)
}
