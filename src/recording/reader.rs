// SPDX-License-Identifier: MIT
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::{debug, info, warn};

use super::error::{DecodeError, ReplayError};
use super::format::{Frame, SessionHeader, decode_frame_body, decode_frame_header, decode_header};

/// Frames may carry timestamps slightly before the header's creation time.
/// The recorder clamps to the header, but other writers may not.
pub const PRE_START_TOLERANCE_MS: i64 = 60_000;
/// Upper bound on how far a frame may lie after the session start.
pub const MAX_SESSION_SPAN_MS: i64 = 30 * 24 * 60 * 60 * 1000;

pub const ARCHIVE_EXTENSION: &str = "zst";

/// A session decoded completely into memory.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSession {
    pub header: SessionHeader,
    pub frames: Vec<Frame>,
    /// Bytes of a partial final frame that were discarded.
    pub dropped_tail_bytes: usize,
}

/// Track statistics over a whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub total_snapshots: usize,
    pub distinct_tracks: usize,
    pub max_tracks_per_frame: usize,
    pub empty_frames: usize,
}

impl LoadedSession {
    /// Opens and decodes a session file, or a `.zst` archive of one.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read, `CorruptSession` if its content is
    /// not a valid session. A partial final frame is not an error.
    pub fn open(path: &Path) -> Result<Self, ReplayError> {
        let bytes = read_session_bytes(path)?;
        let session = Self::parse(&bytes).map_err(|source| match source {
            DecodeError::Io(e) => ReplayError::Io(e),
            source => ReplayError::CorruptSession {
                path: path.to_path_buf(),
                source,
            },
        })?;

        if session.dropped_tail_bytes > 0 {
            warn!(
                "{}: dropped {} bytes of an incomplete final frame",
                path.display(),
                session.dropped_tail_bytes
            );
        }
        info!(
            "loaded {} ({} frames, {} ms)",
            path.display(),
            session.frames.len(),
            session.duration_ms()
        );
        Ok(session)
    }

    /// Decodes a complete session image.
    ///
    /// # Errors
    ///
    /// Any header error, a frame whose timestamp does not fit the session, a
    /// declared track count over the limit, or a snapshot with a denormal
    /// field. Running out of bytes inside the last frame only drops that
    /// frame.
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = bytes;
        let header = decode_header(&mut cursor)?;

        let mut frames = Vec::new();
        let mut previous_ms = None;
        let mut dropped_tail_bytes = 0;

        loop {
            let remaining = cursor.len();
            let frame_header = match decode_frame_header(&mut cursor) {
                Ok(Some(frame_header)) => frame_header,
                Ok(None) => break,
                Err(DecodeError::Truncated { .. }) => {
                    dropped_tail_bytes = remaining;
                    break;
                }
                Err(e) => return Err(e),
            };

            check_timestamp(&header, previous_ms, frame_header.timestamp_ms)?;

            match decode_frame_body(&mut cursor, frame_header) {
                Ok(frame) => {
                    check_snapshots(&frame)?;
                    previous_ms = Some(frame.timestamp_ms);
                    frames.push(frame);
                }
                // A slice reader only runs short at the very end.
                Err(DecodeError::Truncated { .. }) => {
                    dropped_tail_bytes = remaining;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            "decoded {} frames, {} trailing bytes dropped",
            frames.len(),
            dropped_tail_bytes
        );

        Ok(Self {
            header,
            frames,
            dropped_tail_bytes,
        })
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Time between the first and the last frame.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => last.timestamp_ms - first.timestamp_ms,
            _ => 0,
        }
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let mut ids = BTreeSet::new();
        let mut stats = SessionStats::default();
        for frame in &self.frames {
            stats.total_snapshots += frame.tracks.len();
            stats.max_tracks_per_frame = stats.max_tracks_per_frame.max(frame.tracks.len());
            if frame.tracks.is_empty() {
                stats.empty_frames += 1;
            }
            ids.extend(frame.tracks.iter().map(|t| t.track_id));
        }
        stats.distinct_tracks = ids.len();
        stats
    }
}

fn check_timestamp(
    header: &SessionHeader,
    previous_ms: Option<i64>,
    timestamp_ms: i64,
) -> Result<(), DecodeError> {
    let earliest = header.created_at_ms.saturating_sub(PRE_START_TOLERANCE_MS);
    let latest = header.created_at_ms.saturating_add(MAX_SESSION_SPAN_MS);
    if !(earliest..=latest).contains(&timestamp_ms) {
        return Err(DecodeError::TimestampOutOfRange {
            timestamp_ms,
            created_at_ms: header.created_at_ms,
        });
    }
    match previous_ms {
        Some(previous_ms) if timestamp_ms < previous_ms => Err(DecodeError::TimestampRegressed {
            previous_ms,
            found_ms: timestamp_ms,
        }),
        _ => Ok(()),
    }
}

// When bytes go missing inside a frame, the frame reads on into its successor
// and the last swallowed frame header always lands on a snapshot's heading and
// velocity. The upper half of an epoch timestamp then reads as a denormal.
fn check_snapshots(frame: &Frame) -> Result<(), DecodeError> {
    let denormal = frame.tracks.iter().find(|t| {
        [t.x, t.y, t.z, t.heading, t.velocity]
            .iter()
            .any(|v| v.is_subnormal())
    });
    match denormal {
        Some(track) => Err(DecodeError::DenormalField {
            timestamp_ms: frame.timestamp_ms,
            track_id: track.track_id,
        }),
        None => Ok(()),
    }
}

fn is_archive(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == ARCHIVE_EXTENSION)
}

/// Reads the raw session image, decompressing `.zst` archives.
///
/// # Errors
///
/// Returns an error if the file cannot be read or decompressed.
pub fn read_session_bytes(path: &Path) -> std::io::Result<Vec<u8>> {
    if is_archive(path) {
        let file = File::open(path)?;
        zstd::decode_all(BufReader::new(file))
    } else {
        std::fs::read(path)
    }
}

/// Reads only the header of a session file or archive.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or its header is invalid.
pub fn read_header(path: &Path) -> Result<SessionHeader, DecodeError> {
    let mut file = BufReader::new(File::open(path)?);
    if is_archive(path) {
        decode_header(&mut zstd::Decoder::with_buffer(file)?)
    } else {
        decode_header(&mut file)
    }
}
