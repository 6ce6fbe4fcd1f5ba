// SPDX-License-Identifier: MIT
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use log::{debug, error, info};

use super::clock::{DEFAULT_CAPTURE_INTERVAL, Ticker};
use super::error::RecordError;
use super::format::{Frame, SessionHeader};
use super::store::SessionStore;
use super::writer::SessionWriter;
use crate::datasource::TrackSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Paused,
    Stopped,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Recording => write!(f, "recording"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

type WallClock = Box<dyn FnMut() -> i64 + Send>;

fn wall_clock_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Periodically captures the live track set into a session file.
pub struct Recorder<S> {
    source: S,
    store: SessionStore,
    state: RecorderState,
    ticker: Ticker,
    writer: Option<SessionWriter>,
    session_path: Option<PathBuf>,
    started_at_ms: Option<i64>,
    last_timestamp_ms: Option<i64>,
    frame_count: u64,
    wall_clock: WallClock,
}

impl<S: TrackSource> Recorder<S> {
    #[must_use]
    pub fn new(source: S, store: SessionStore) -> Self {
        Self::with_interval(source, store, DEFAULT_CAPTURE_INTERVAL)
    }

    #[must_use]
    pub fn with_interval(source: S, store: SessionStore, capture_interval: Duration) -> Self {
        Self {
            source,
            store,
            state: RecorderState::Idle,
            ticker: Ticker::new(capture_interval),
            writer: None,
            session_path: None,
            started_at_ms: None,
            last_timestamp_ms: None,
            frame_count: 0,
            wall_clock: Box::new(wall_clock_ms),
        }
    }

    /// Replaces the source of frame timestamps (milliseconds since the epoch).
    #[must_use]
    pub fn with_wall_clock(mut self, clock: impl FnMut() -> i64 + Send + 'static) -> Self {
        self.wall_clock = Box::new(clock);
        self
    }

    /// Starts a new session under a generated name in the store directory.
    ///
    /// # Errors
    ///
    /// `AlreadyActive` while a session is recording or paused, `Io` if the
    /// file cannot be created.
    pub fn start(&mut self, now: Instant) -> Result<&Path, RecordError> {
        self.ensure_inactive()?;
        let path = self.store.generate_path(Local::now());
        self.start_at(&path, now)?;
        Ok(path_or_empty(self.session_path.as_deref()))
    }

    /// Starts a new session at an explicit path. Existing files are never
    /// overwritten.
    ///
    /// # Errors
    ///
    /// See [`Recorder::start`].
    pub fn start_at(&mut self, path: &Path, now: Instant) -> Result<(), RecordError> {
        self.ensure_inactive()?;

        let created_at_ms = (self.wall_clock)();
        let writer = self
            .store
            .create_session(path, &SessionHeader::new(created_at_ms))?;

        self.writer = Some(writer);
        self.session_path = Some(path.to_path_buf());
        self.started_at_ms = Some(created_at_ms);
        self.last_timestamp_ms = None;
        self.frame_count = 0;
        self.state = RecorderState::Recording;
        self.ticker.start(now);

        info!(
            "recording started: {} every {} ms",
            path.display(),
            self.ticker.interval().as_millis()
        );
        Ok(())
    }

    fn ensure_inactive(&self) -> Result<(), RecordError> {
        match self.state {
            RecorderState::Recording | RecorderState::Paused => Err(RecordError::AlreadyActive),
            RecorderState::Idle | RecorderState::Stopped => Ok(()),
        }
    }

    pub fn pause(&mut self) {
        if self.state == RecorderState::Recording {
            self.state = RecorderState::Paused;
            self.ticker.stop();
            info!("recording paused after {} frames", self.frame_count);
        }
    }

    /// Resumes capture; the next frame is taken one interval after `now`.
    pub fn resume(&mut self, now: Instant) {
        if self.state == RecorderState::Paused {
            self.state = RecorderState::Recording;
            self.ticker.start(now);
            info!("recording resumed");
        }
    }

    /// Flushes and closes the session file. Safe to call in any state.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush or sync fails. The recorder is
    /// stopped either way.
    pub fn stop(&mut self) -> Result<(), RecordError> {
        self.ticker.stop();
        if self.state == RecorderState::Idle {
            return Ok(());
        }
        self.state = RecorderState::Stopped;

        if let Some(writer) = self.writer.take() {
            writer.finish()?;
            info!(
                "recording stopped: {} frames in {}",
                self.frame_count,
                path_or_empty(self.session_path.as_deref()).display()
            );
        }
        Ok(())
    }

    /// Captures one frame if the capture interval has elapsed.
    ///
    /// # Errors
    ///
    /// See [`Recorder::capture`].
    pub fn poll(&mut self, now: Instant) -> Result<bool, RecordError> {
        if self.ticker.poll(now) {
            self.capture()
        } else {
            Ok(false)
        }
    }

    /// Captures the current track set as one frame. Returns `false` without
    /// touching the file unless the recorder is recording.
    ///
    /// # Errors
    ///
    /// A failed write closes the file and leaves the recorder stopped.
    pub fn capture(&mut self) -> Result<bool, RecordError> {
        if self.state != RecorderState::Recording {
            return Ok(false);
        }
        let Some(writer) = self.writer.as_mut() else {
            return Ok(false);
        };

        // Never earlier than the previous frame or the session header.
        let now_ms = (self.wall_clock)();
        let timestamp_ms = self
            .last_timestamp_ms
            .or(self.started_at_ms)
            .map_or(now_ms, |floor| now_ms.max(floor));
        let frame = Frame {
            timestamp_ms,
            tracks: self.source.list_current_tracks(),
        };

        if let Err(e) = writer.write_frame(&frame) {
            error!("capture failed, recording stopped: {e}");
            self.writer = None;
            self.state = RecorderState::Stopped;
            self.ticker.stop();
            return Err(e);
        }

        self.last_timestamp_ms = Some(timestamp_ms);
        self.frame_count += 1;
        debug!(
            "frame {} at {timestamp_ms}: {} tracks",
            self.frame_count,
            frame.track_count()
        );
        Ok(true)
    }

    #[must_use]
    pub fn state(&self) -> RecorderState {
        self.state
    }

    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    #[must_use]
    pub fn session_path(&self) -> Option<&Path> {
        self.session_path.as_deref()
    }

    #[must_use]
    pub fn started_at_ms(&self) -> Option<i64> {
        self.started_at_ms
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.writer.as_ref().map_or(0, SessionWriter::bytes_written)
    }

    #[must_use]
    pub fn capture_interval(&self) -> Duration {
        self.ticker.interval()
    }

    /// Time until the next capture is due, if capturing.
    #[must_use]
    pub fn time_until_due(&self, now: Instant) -> Option<Duration> {
        self.ticker.time_until_due(now)
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }
}

fn path_or_empty(path: Option<&Path>) -> &Path {
    path.unwrap_or_else(|| Path::new(""))
}
