// SPDX-License-Identifier: MIT
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info};

use super::clock::{PlaybackClock, Ticker};
use super::error::ReplayError;
use super::format::SessionHeader;
use super::reader::LoadedSession;
use crate::datasource::TrackSnapshot;

/// Receives replayed snapshots, one call per track per frame.
pub trait TrackSink {
    fn deliver(&mut self, snapshot: &TrackSnapshot);
}

impl<F: FnMut(&TrackSnapshot)> TrackSink for F {
    fn deliver(&mut self, snapshot: &TrackSnapshot) {
        self(snapshot);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Idle,
    Loaded,
    Playing,
    Paused,
    Finished,
}

impl fmt::Display for ReplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loaded => write!(f, "loaded"),
            Self::Playing => write!(f, "playing"),
            Self::Paused => write!(f, "paused"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// Plays a loaded session back into a [`TrackSink`] at a configurable speed.
pub struct Replayer<K> {
    sink: K,
    state: ReplayState,
    session: Option<LoadedSession>,
    path: Option<PathBuf>,
    cursor: usize,
    clock: PlaybackClock,
    ticker: Ticker,
}

impl<K: TrackSink> Replayer<K> {
    #[must_use]
    pub fn new(sink: K) -> Self {
        Self::with_clock(sink, PlaybackClock::default())
    }

    #[must_use]
    pub fn with_clock(sink: K, clock: PlaybackClock) -> Self {
        Self {
            sink,
            state: ReplayState::Idle,
            session: None,
            path: None,
            cursor: 0,
            ticker: Ticker::new(clock.replay_interval()),
            clock,
        }
    }

    /// Loads a session file, replacing any session already loaded.
    ///
    /// # Errors
    ///
    /// `Io` or `CorruptSession`; the replayer is left idle.
    pub fn load(&mut self, path: &Path) -> Result<(), ReplayError> {
        self.clear();
        let session = LoadedSession::open(path)?;
        self.install(session);
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    /// Takes an already decoded session.
    pub fn load_session(&mut self, session: LoadedSession) {
        self.clear();
        self.install(session);
    }

    fn install(&mut self, session: LoadedSession) {
        self.session = Some(session);
        self.cursor = 0;
        self.state = ReplayState::Loaded;
    }

    fn clear(&mut self) {
        self.ticker.stop();
        self.session = None;
        self.path = None;
        self.cursor = 0;
        self.state = ReplayState::Idle;
    }

    /// Starts or continues delivery; the next frame is due one replay
    /// interval after `now`. A finished replay starts over from the first
    /// frame.
    ///
    /// # Errors
    ///
    /// `NotLoaded` when idle.
    pub fn play(&mut self, now: Instant) -> Result<(), ReplayError> {
        match self.state {
            ReplayState::Idle => return Err(ReplayError::NotLoaded),
            ReplayState::Playing => return Ok(()),
            ReplayState::Finished => self.cursor = 0,
            ReplayState::Loaded | ReplayState::Paused => {}
        }
        self.state = ReplayState::Playing;
        self.ticker.start(now);
        debug!("playing from frame {} at {}x", self.cursor, self.clock.speed());
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.state == ReplayState::Playing {
            self.state = ReplayState::Paused;
            self.ticker.stop();
            debug!("paused at frame {}", self.cursor);
        }
    }

    /// Halts delivery and discards the loaded frames.
    pub fn stop(&mut self) {
        if self.state != ReplayState::Idle {
            info!("replay stopped at frame {}", self.cursor);
            self.clear();
        }
    }

    pub fn reset(&mut self) {
        self.stop();
    }

    /// Changes the speed multiplier, taking effect from the last delivery.
    ///
    /// # Errors
    ///
    /// `InvalidSpeed` for a non-finite or non-positive multiplier.
    pub fn set_speed(&mut self, speed: f64, now: Instant) -> Result<(), ReplayError> {
        self.clock.set_speed(speed)?;
        self.ticker.set_interval(self.clock.replay_interval(), now);
        debug!("replay speed {speed}x");
        Ok(())
    }

    #[must_use]
    pub fn speed(&self) -> f64 {
        self.clock.speed()
    }

    #[must_use]
    pub fn replay_interval(&self) -> Duration {
        self.clock.replay_interval()
    }

    /// Moves the cursor to `floor(fraction * total)`, capped at the last
    /// frame. Never delivers anything by itself.
    ///
    /// # Errors
    ///
    /// `NotLoaded` when idle, `InvalidSeek` outside `0.0..=1.0`.
    pub fn seek(&mut self, fraction: f64) -> Result<(), ReplayError> {
        if self.state == ReplayState::Idle {
            return Err(ReplayError::NotLoaded);
        }
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ReplayError::InvalidSeek(fraction));
        }
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let index = (fraction * self.total_frames() as f64).floor() as usize;
        self.seek_to_frame(index)
    }

    /// Moves the cursor to `index`, capped at the last frame.
    ///
    /// # Errors
    ///
    /// `NotLoaded` when idle.
    pub fn seek_to_frame(&mut self, index: usize) -> Result<(), ReplayError> {
        if self.state == ReplayState::Idle {
            return Err(ReplayError::NotLoaded);
        }
        self.cursor = index.min(self.total_frames().saturating_sub(1));
        if self.state == ReplayState::Finished {
            self.state = ReplayState::Paused;
        }
        debug!("seek to frame {}", self.cursor);
        Ok(())
    }

    /// Delivers the next frame if its replay interval has elapsed.
    pub fn poll(&mut self, now: Instant) -> bool {
        self.ticker.poll(now) && self.deliver_next()
    }

    /// Delivers the frame at the cursor and advances. Returns `false` unless
    /// playing. Reaching the end of the session finishes the replay.
    pub fn deliver_next(&mut self) -> bool {
        if self.state != ReplayState::Playing {
            return false;
        }
        let Some(session) = self.session.as_ref() else {
            return false;
        };

        let delivered = match session.frames.get(self.cursor) {
            Some(frame) => {
                for snapshot in &frame.tracks {
                    self.sink.deliver(snapshot);
                }
                self.cursor += 1;
                true
            }
            None => false,
        };

        if self.cursor >= session.frames.len() {
            self.state = ReplayState::Finished;
            self.ticker.stop();
            info!("replay finished after {} frames", session.frames.len());
        }
        delivered
    }

    #[must_use]
    pub fn state(&self) -> ReplayState {
        self.state
    }

    /// `(cursor, total_frames)`.
    #[must_use]
    pub fn progress(&self) -> (usize, usize) {
        (self.cursor, self.total_frames())
    }

    #[must_use]
    pub fn progress_fraction(&self) -> f64 {
        let total = self.total_frames();
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let fraction = self.cursor as f64 / total as f64;
        fraction
    }

    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.session.as_ref().map_or(0, LoadedSession::frame_count)
    }

    #[must_use]
    pub fn header(&self) -> Option<&SessionHeader> {
        self.session.as_ref().map(|s| &s.header)
    }

    #[must_use]
    pub fn session(&self) -> Option<&LoadedSession> {
        self.session.as_ref()
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Capture time of the frame at the cursor.
    #[must_use]
    pub fn current_timestamp_ms(&self) -> Option<i64> {
        self.session
            .as_ref()
            .and_then(|s| s.frames.get(self.cursor))
            .map(|f| f.timestamp_ms)
    }

    #[must_use]
    pub fn time_until_due(&self, now: Instant) -> Option<Duration> {
        self.ticker.time_until_due(now)
    }

    #[must_use]
    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }

    #[must_use]
    pub fn into_sink(self) -> K {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::format::Frame;

    const SECOND: Duration = Duration::from_secs(1);

    #[derive(Default)]
    struct Collector {
        ids: Vec<i32>,
    }

    impl TrackSink for Collector {
        fn deliver(&mut self, snapshot: &TrackSnapshot) {
            self.ids.push(snapshot.track_id);
        }
    }

    fn snapshot(id: i32) -> TrackSnapshot {
        TrackSnapshot {
            track_id: id,
            ..TrackSnapshot::default()
        }
    }

    /// One frame per entry, holding the given track ids.
    fn session(frames: &[&[i32]]) -> LoadedSession {
        LoadedSession {
            header: SessionHeader::new(0),
            frames: frames
                .iter()
                .zip(0..)
                .map(|(ids, i)| Frame {
                    timestamp_ms: i * 1000,
                    tracks: ids.iter().copied().map(snapshot).collect(),
                })
                .collect(),
            dropped_tail_bytes: 0,
        }
    }

    fn loaded(frames: &[&[i32]]) -> Replayer<Collector> {
        let mut replayer = Replayer::new(Collector::default());
        replayer.load_session(session(frames));
        replayer
    }

    #[test]
    fn idle_replayer_rejects_playback() {
        let mut replayer = Replayer::new(Collector::default());
        assert!(matches!(
            replayer.play(Instant::now()),
            Err(ReplayError::NotLoaded)
        ));
        assert!(matches!(replayer.seek(0.5), Err(ReplayError::NotLoaded)));
        assert!(matches!(
            replayer.seek_to_frame(1),
            Err(ReplayError::NotLoaded)
        ));
        assert_eq!(replayer.state(), ReplayState::Idle);
    }

    #[test]
    fn failed_load_leaves_the_replayer_idle() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.rdr");
        std::fs::write(&bad, b"XXXXXXXXXXXXXXXXXXXXXXXX").unwrap();

        let mut replayer = loaded(&[&[1]]);
        assert!(matches!(
            replayer.load(&bad),
            Err(ReplayError::CorruptSession { .. })
        ));
        assert_eq!(replayer.state(), ReplayState::Idle);
        assert_eq!(replayer.progress(), (0, 0));
        assert!(replayer.header().is_none());
    }

    #[test]
    fn delivers_frames_in_order_then_finishes() {
        let mut replayer = loaded(&[&[1, 2], &[], &[3]]);
        let t0 = Instant::now();
        replayer.play(t0).unwrap();

        assert!(!replayer.poll(t0));
        assert!(replayer.poll(t0 + SECOND));
        assert_eq!(replayer.sink().ids, [1, 2]);

        // An empty frame still takes its slot.
        assert!(replayer.poll(t0 + 2 * SECOND));
        assert_eq!(replayer.progress(), (2, 3));
        assert_eq!(replayer.sink().ids, [1, 2]);

        assert!(replayer.poll(t0 + 3 * SECOND));
        assert_eq!(replayer.state(), ReplayState::Finished);
        assert!(!replayer.poll(t0 + 4 * SECOND));
        assert_eq!(replayer.into_sink().ids, [1, 2, 3]);
    }

    #[test]
    fn closures_are_sinks() {
        let mut seen = Vec::new();
        let mut replayer = Replayer::new(|s: &TrackSnapshot| seen.push(s.track_id));
        replayer.load_session(session(&[&[4, 5]]));
        replayer.play(Instant::now()).unwrap();
        assert!(replayer.deliver_next());
        drop(replayer);
        assert_eq!(seen, [4, 5]);
    }

    #[test]
    fn empty_session_finishes_on_first_tick() {
        let mut replayer = loaded(&[]);
        let t0 = Instant::now();
        replayer.play(t0).unwrap();
        assert!(!replayer.poll(t0 + SECOND));
        assert_eq!(replayer.state(), ReplayState::Finished);
    }

    #[test]
    fn double_speed_halves_the_interval() {
        let t0 = Instant::now();
        let mut normal = loaded(&[&[1], &[2], &[3]]);
        let mut fast = loaded(&[&[1], &[2], &[3]]);
        fast.set_speed(2.0, t0).unwrap();
        normal.play(t0).unwrap();
        fast.play(t0).unwrap();

        let mut normal_at = Vec::new();
        let mut fast_at = Vec::new();
        for ms in (0..=3000).step_by(50) {
            let now = t0 + Duration::from_millis(ms);
            if normal.poll(now) {
                normal_at.push(ms);
            }
            if fast.poll(now) {
                fast_at.push(ms);
            }
        }
        assert_eq!(normal_at, [1000, 2000, 3000]);
        assert_eq!(fast_at, [500, 1000, 1500]);
    }

    #[test]
    fn speed_change_applies_from_the_last_delivery() {
        let mut replayer = loaded(&[&[1], &[2], &[3]]);
        let t0 = Instant::now();
        replayer.play(t0).unwrap();
        assert!(replayer.poll(t0 + SECOND));

        replayer
            .set_speed(4.0, t0 + Duration::from_millis(1100))
            .unwrap();
        assert!(!replayer.poll(t0 + Duration::from_millis(1200)));
        assert!(replayer.poll(t0 + Duration::from_millis(1250)));
        assert_eq!(replayer.progress(), (2, 3));
    }

    #[test]
    fn invalid_speed_changes_nothing() {
        let mut replayer = loaded(&[&[1], &[2]]);
        let t0 = Instant::now();
        replayer.play(t0).unwrap();

        for bad in [0.0, -2.0, f64::NAN, f64::NEG_INFINITY] {
            assert!(matches!(
                replayer.set_speed(bad, t0),
                Err(ReplayError::InvalidSpeed(_))
            ));
        }
        assert!((replayer.speed() - 1.0).abs() < f64::EPSILON);
        assert_eq!(replayer.state(), ReplayState::Playing);
        assert!(replayer.poll(t0 + SECOND));
    }

    #[test]
    fn pause_and_play_are_idempotent() {
        let mut replayer = loaded(&[&[1], &[2], &[3]]);
        let t0 = Instant::now();
        replayer.play(t0).unwrap();
        replayer.play(t0 + Duration::from_millis(600)).unwrap();
        assert!(replayer.poll(t0 + SECOND));

        replayer.pause();
        replayer.pause();
        assert_eq!(replayer.state(), ReplayState::Paused);
        assert!(!replayer.poll(t0 + 5 * SECOND));
        assert!(!replayer.deliver_next());

        let t1 = t0 + 6 * SECOND;
        replayer.play(t1).unwrap();
        replayer.play(t1).unwrap();
        assert!(replayer.poll(t1 + SECOND));
        assert_eq!(replayer.sink().ids, [1, 2]);
        assert_eq!(replayer.progress(), (2, 3));
    }

    #[test]
    fn seek_moves_the_cursor_without_delivering() {
        let mut replayer = loaded(&[&[1], &[2], &[3], &[4]]);

        replayer.seek(0.5).unwrap();
        assert_eq!(replayer.progress(), (2, 4));
        assert!((replayer.progress_fraction() - 0.5).abs() < f64::EPSILON);
        replayer.seek(1.0).unwrap();
        assert_eq!(replayer.progress(), (3, 4));
        replayer.seek(0.0).unwrap();
        assert_eq!(replayer.progress(), (0, 4));
        replayer.seek_to_frame(99).unwrap();
        assert_eq!(replayer.progress(), (3, 4));

        for bad in [-0.1, 1.5, f64::NAN] {
            assert!(matches!(
                replayer.seek(bad),
                Err(ReplayError::InvalidSeek(_))
            ));
        }
        assert_eq!(replayer.state(), ReplayState::Loaded);
        assert!(replayer.sink().ids.is_empty());
    }

    #[test]
    fn seek_after_finish_pauses() {
        let mut replayer = loaded(&[&[1], &[2]]);
        replayer.play(Instant::now()).unwrap();
        while replayer.deliver_next() {}
        assert_eq!(replayer.state(), ReplayState::Finished);

        replayer.seek(0.0).unwrap();
        assert_eq!(replayer.state(), ReplayState::Paused);
        assert_eq!(replayer.current_timestamp_ms(), Some(0));

        replayer.play(Instant::now()).unwrap();
        assert!(replayer.deliver_next());
        assert_eq!(replayer.sink().ids, [1, 2, 1]);
    }

    #[test]
    fn play_after_finish_starts_over() {
        let mut replayer = loaded(&[&[1], &[2]]);
        replayer.play(Instant::now()).unwrap();
        while replayer.deliver_next() {}

        replayer.play(Instant::now()).unwrap();
        assert_eq!(replayer.progress(), (0, 2));
        while replayer.deliver_next() {}
        assert_eq!(replayer.sink().ids, [1, 2, 1, 2]);
    }

    #[test]
    fn stop_and_reset_discard_the_session() {
        let mut replayer = loaded(&[&[1], &[2]]);
        replayer.play(Instant::now()).unwrap();
        replayer.deliver_next();
        replayer.stop();
        assert_eq!(replayer.state(), ReplayState::Idle);
        assert_eq!(replayer.progress(), (0, 0));
        replayer.stop();

        replayer.load_session(session(&[&[7]]));
        replayer.play(Instant::now()).unwrap();
        replayer.deliver_next();
        assert_eq!(replayer.state(), ReplayState::Finished);
        replayer.reset();
        assert_eq!(replayer.state(), ReplayState::Idle);
        assert!(matches!(
            replayer.play(Instant::now()),
            Err(ReplayError::NotLoaded)
        ));
    }
}
