// SPDX-License-Identifier: MIT
//! Fixed-width binary layout of a session file.
//!
//! ```text
//! header    magic [u8; 8] | format_version u32 | created_at_ms i64           20 bytes
//! frame     timestamp_ms i64 | track_count u32                              12 bytes
//! snapshot  track_id i32 | x y z heading velocity f32 | identity i32        28 bytes
//! ```
//!
//! Every field is little-endian with no padding. Frames follow the header
//! back to back until end of file.
//!
//! Denormal floats are written as zero. The loader treats a denormal field as
//! a sign of misaligned frame boundaries.

use std::io::{self, Read};

use zerocopy::byteorder::{F32, I32, I64, LE, U32};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::error::{DecodeError, EncodeError};
use crate::datasource::TrackSnapshot;

pub const MAGIC: [u8; 8] = *b"TRKSESS\0";
pub const FORMAT_VERSION: u32 = 1;
pub const MAX_TRACKS_PER_FRAME: u32 = 1 << 16;

pub const HEADER_SIZE: usize = size_of::<RawPrefix>() + size_of::<I64<LE>>();
pub const FRAME_HEADER_SIZE: usize = size_of::<RawFrameHeader>();
pub const SNAPSHOT_SIZE: usize = size_of::<RawSnapshot>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHeader {
    pub format_version: u32,
    pub created_at_ms: i64,
}

impl SessionHeader {
    #[must_use]
    pub fn new(created_at_ms: i64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            created_at_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    pub timestamp_ms: i64,
    pub tracks: Vec<TrackSnapshot>,
}

impl Frame {
    #[must_use]
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.tracks.len() * SNAPSHOT_SIZE
    }
}

/// Decoded `(timestamp, count)` prefix of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub timestamp_ms: i64,
    pub track_count: u32,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct RawPrefix {
    magic: [u8; 8],
    format_version: U32<LE>,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct RawFrameHeader {
    timestamp_ms: I64<LE>,
    track_count: U32<LE>,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct RawSnapshot {
    track_id: I32<LE>,
    x: F32<LE>,
    y: F32<LE>,
    z: F32<LE>,
    heading: F32<LE>,
    velocity: F32<LE>,
    identity: I32<LE>,
}

const _: () = assert!(HEADER_SIZE == 20, "session header must be 20 bytes");
const _: () = assert!(FRAME_HEADER_SIZE == 12, "frame header must be 12 bytes");
const _: () = assert!(SNAPSHOT_SIZE == 28, "track snapshot must be 28 bytes");

impl From<&TrackSnapshot> for RawSnapshot {
    fn from(s: &TrackSnapshot) -> Self {
        Self {
            track_id: I32::new(s.track_id),
            x: F32::new(flush_denormal(s.x)),
            y: F32::new(flush_denormal(s.y)),
            z: F32::new(flush_denormal(s.z)),
            heading: F32::new(flush_denormal(s.heading)),
            velocity: F32::new(flush_denormal(s.velocity)),
            identity: I32::new(s.identity),
        }
    }
}

fn flush_denormal(value: f32) -> f32 {
    if value.is_subnormal() {
        0.0_f32.copysign(value)
    } else {
        value
    }
}

impl From<&RawSnapshot> for TrackSnapshot {
    fn from(raw: &RawSnapshot) -> Self {
        Self {
            track_id: raw.track_id.get(),
            x: raw.x.get(),
            y: raw.y.get(),
            z: raw.z.get(),
            heading: raw.heading.get(),
            velocity: raw.velocity.get(),
            identity: raw.identity.get(),
        }
    }
}

#[must_use]
pub fn encode_header(header: &SessionHeader) -> Vec<u8> {
    let prefix = RawPrefix {
        magic: MAGIC,
        format_version: U32::new(header.format_version),
    };
    let mut out = Vec::with_capacity(HEADER_SIZE);
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(I64::<LE>::new(header.created_at_ms).as_bytes());
    out
}

/// Reads and validates a session header.
///
/// Magic and version are checked before `created_at_ms` is read, so a foreign
/// file is rejected without interpreting anything past its first 12 bytes.
///
/// # Errors
///
/// `BadMagic` for a foreign file, `UnsupportedVersion` for a version this
/// build does not understand, `Truncated` if the stream ends inside the header.
pub fn decode_header<R: Read>(reader: &mut R) -> Result<SessionHeader, DecodeError> {
    let mut prefix = RawPrefix::new_zeroed();
    let got = read_full(reader, prefix.as_mut_bytes())?;

    let magic_len = got.min(MAGIC.len());
    if prefix.magic[..magic_len] != MAGIC[..magic_len] {
        return Err(DecodeError::BadMagic);
    }
    if got < size_of::<RawPrefix>() {
        return Err(DecodeError::Truncated {
            needed: HEADER_SIZE,
            available: got,
        });
    }

    let format_version = prefix.format_version.get();
    if format_version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion {
            found: format_version,
        });
    }

    let mut created_at = I64::<LE>::new_zeroed();
    let got_time = read_full(reader, created_at.as_mut_bytes())?;
    if got_time < size_of::<I64<LE>>() {
        return Err(DecodeError::Truncated {
            needed: HEADER_SIZE,
            available: got + got_time,
        });
    }

    Ok(SessionHeader {
        format_version,
        created_at_ms: created_at.get(),
    })
}

/// Encodes a frame into a fresh buffer.
///
/// # Errors
///
/// Returns `TooManyTracks` if the frame holds more than
/// [`MAX_TRACKS_PER_FRAME`] snapshots.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(frame.encoded_len());
    encode_frame_into(frame, &mut out)?;
    Ok(out)
}

/// Appends the encoding of `frame` to `out`. `out` is left untouched on error.
///
/// # Errors
///
/// Returns `TooManyTracks` if the frame holds more than
/// [`MAX_TRACKS_PER_FRAME`] snapshots.
pub fn encode_frame_into(frame: &Frame, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    let count = u32::try_from(frame.tracks.len())
        .ok()
        .filter(|&c| c <= MAX_TRACKS_PER_FRAME)
        .ok_or(EncodeError::TooManyTracks {
            count: frame.tracks.len(),
        })?;

    let header = RawFrameHeader {
        timestamp_ms: I64::new(frame.timestamp_ms),
        track_count: U32::new(count),
    };
    out.reserve(frame.encoded_len());
    out.extend_from_slice(header.as_bytes());
    for snapshot in &frame.tracks {
        out.extend_from_slice(RawSnapshot::from(snapshot).as_bytes());
    }
    Ok(())
}

/// Reads the fixed `(timestamp, count)` prefix of the next frame.
///
/// Returns `Ok(None)` when the stream is exhausted exactly at a frame boundary.
///
/// # Errors
///
/// `Truncated` if only part of the prefix is present, `TrackCountOverflow` if
/// the declared count exceeds [`MAX_TRACKS_PER_FRAME`].
pub fn decode_frame_header<R: Read>(reader: &mut R) -> Result<Option<FrameHeader>, DecodeError> {
    let mut raw = RawFrameHeader::new_zeroed();
    let got = read_full(reader, raw.as_mut_bytes())?;
    if got == 0 {
        return Ok(None);
    }
    if got < FRAME_HEADER_SIZE {
        return Err(DecodeError::Truncated {
            needed: FRAME_HEADER_SIZE,
            available: got,
        });
    }

    let track_count = raw.track_count.get();
    if track_count > MAX_TRACKS_PER_FRAME {
        return Err(DecodeError::TrackCountOverflow { count: track_count });
    }

    Ok(Some(FrameHeader {
        timestamp_ms: raw.timestamp_ms.get(),
        track_count,
    }))
}

/// Reads the snapshots announced by `header`.
///
/// # Errors
///
/// `Truncated` if the stream ends before all snapshots are present.
pub fn decode_frame_body<R: Read>(
    reader: &mut R,
    header: FrameHeader,
) -> Result<Frame, DecodeError> {
    let count = header.track_count as usize;
    let needed = FRAME_HEADER_SIZE + count * SNAPSHOT_SIZE;
    let mut tracks = Vec::with_capacity(count);

    for index in 0..count {
        let mut raw = RawSnapshot::new_zeroed();
        let got = read_full(reader, raw.as_mut_bytes())?;
        if got < SNAPSHOT_SIZE {
            return Err(DecodeError::Truncated {
                needed,
                available: FRAME_HEADER_SIZE + index * SNAPSHOT_SIZE + got,
            });
        }
        tracks.push(TrackSnapshot::from(&raw));
    }

    Ok(Frame {
        timestamp_ms: header.timestamp_ms,
        tracks,
    })
}

/// Decodes one complete frame. `Ok(None)` means clean end of stream.
///
/// # Errors
///
/// `Truncated` when a partial frame is present; see [`decode_frame_header`].
pub fn decode_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>, DecodeError> {
    match decode_frame_header(reader)? {
        Some(header) => decode_frame_body(reader, header).map(Some),
        None => Ok(None),
    }
}

/// Like `read_exact`, but reports how many bytes were available instead of
/// failing on a short read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
