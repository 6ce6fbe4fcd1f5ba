// SPDX-License-Identifier: MIT
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::format::{FORMAT_VERSION, MAX_TRACKS_PER_FRAME};

/// Errors produced while decoding a session header or frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("bad magic bytes: not a track session file")]
    BadMagic,

    #[error("unsupported format version {found} (expected {})", FORMAT_VERSION)]
    UnsupportedVersion { found: u32 },

    #[error("truncated data: needed {needed} bytes, only {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("frame declares {count} tracks (limit {})", MAX_TRACKS_PER_FRAME)]
    TrackCountOverflow { count: u32 },

    #[error("frame timestamp {timestamp_ms} is outside the session window starting at {created_at_ms}")]
    TimestampOutOfRange {
        timestamp_ms: i64,
        created_at_ms: i64,
    },

    #[error("frame timestamp {found_ms} precedes previous frame at {previous_ms}")]
    TimestampRegressed { previous_ms: i64, found_ms: i64 },

    #[error("frame at {timestamp_ms} holds a denormal value for track {track_id}: misaligned frame boundary")]
    DenormalField { timestamp_ms: i64, track_id: i32 },

    #[error("I/O error while decoding: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("frame holds {count} tracks (limit {})", MAX_TRACKS_PER_FRAME)]
    TooManyTracks { count: usize },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("session is open for recording: {}", .0.display())]
    InUse(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("a recording session is already active")]
    AlreadyActive,

    #[error("failed to write session: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RecordError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(io) => Self::Io(io),
            other => Self::Store(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("no session loaded")]
    NotLoaded,

    #[error("corrupt session {}: {source}", .path.display())]
    CorruptSession {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("invalid playback speed {0}: must be finite and greater than zero")]
    InvalidSpeed(f64),

    #[error("invalid seek position {0}: must be within 0.0..=1.0")]
    InvalidSeek(f64),

    #[error("failed to read session: {0}")]
    Io(#[from] io::Error),
}
