// SPDX-License-Identifier: MIT
//! Line-oriented live track feed.
//!
//! ```text
//! 12,1500.0,-320.5,300.0,90.0,250.0,3    insert or update track 12
//! -12                                    remove track 12
//! clear                                  remove all tracks
//! ```

use std::io::BufRead;
use std::num::{ParseFloatError, ParseIntError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use log::{debug, warn};
use thiserror::Error;

use crate::datasource::{TrackSnapshot, TrackTable};

const FIELD_COUNT: usize = 7;

#[derive(Debug, Error, PartialEq)]
pub enum FeedError {
    #[error("expected {} comma-separated fields, found {0}", FIELD_COUNT)]
    FieldCount(usize),

    #[error("invalid {field} {value:?}: {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeedCommand {
    Upsert(TrackSnapshot),
    Remove(i32),
    Clear,
}

impl FeedCommand {
    pub fn apply(self, table: &TrackTable) {
        match self {
            Self::Upsert(snapshot) => table.upsert(snapshot),
            Self::Remove(track_id) => {
                table.remove(track_id);
            }
            Self::Clear => table.clear(),
        }
    }
}

/// Parses one feed line. Blank lines and `#` comments yield `Ok(None)`.
///
/// # Errors
///
/// Returns an error for a line that is neither a command nor a well-formed
/// track record.
pub fn parse_line(line: &str) -> Result<Option<FeedCommand>, FeedError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    if line.eq_ignore_ascii_case("clear") {
        return Ok(Some(FeedCommand::Clear));
    }
    if let Some(id) = line.strip_prefix('-')
        && !id.contains(',')
    {
        return int_field("track id", id).map(|id| Some(FeedCommand::Remove(id)));
    }

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let &[id, x, y, z, heading, velocity, identity] = fields.as_slice() else {
        return Err(FeedError::FieldCount(fields.len()));
    };

    Ok(Some(FeedCommand::Upsert(TrackSnapshot {
        track_id: int_field("track id", id)?,
        x: float_field("x", x)?,
        y: float_field("y", y)?,
        z: float_field("z", z)?,
        heading: float_field("heading", heading)?,
        velocity: float_field("velocity", velocity)?,
        identity: int_field("identity", identity)?,
    })))
}

fn int_field(field: &'static str, value: &str) -> Result<i32, FeedError> {
    value
        .trim()
        .parse()
        .map_err(|e: ParseIntError| invalid(field, value, &e))
}

fn float_field(field: &'static str, value: &str) -> Result<f32, FeedError> {
    value
        .parse()
        .map_err(|e: ParseFloatError| invalid(field, value, &e))
}

fn invalid(field: &'static str, value: &str, reason: &dyn std::fmt::Display) -> FeedError {
    FeedError::InvalidField {
        field,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Default)]
struct FeedCounters {
    applied: AtomicU64,
    rejected: AtomicU64,
    closed: AtomicBool,
}

/// Background reader that applies feed lines to a [`TrackTable`].
pub struct FeedWorker {
    counters: Arc<FeedCounters>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FeedWorker {
    /// Spawns a thread that reads `input` line by line until end of input.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<R>(input: R, table: TrackTable) -> std::io::Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let counters = Arc::new(FeedCounters::default());
        let thread_counters = Arc::clone(&counters);

        let handle = thread::Builder::new()
            .name("track-feed".into())
            .spawn(move || run(input, &table, &thread_counters))?;

        Ok(Self {
            counters,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn applied(&self) -> u64 {
        self.counters.applied.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.counters.rejected.load(Ordering::Relaxed)
    }

    /// `true` once the input reached its end or failed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.counters.closed.load(Ordering::Acquire)
    }

    /// Joins the reader thread if it has finished. A thread still blocked on
    /// its input is left detached.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take_if(|h| h.is_finished())
            && handle.join().is_err()
        {
            warn!("track feed thread panicked");
        }
    }
}

impl Drop for FeedWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<R: BufRead>(input: R, table: &TrackTable, counters: &FeedCounters) {
    for (index, line) in input.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("track feed read error: {e}");
                break;
            }
        };
        match parse_line(&line) {
            Ok(Some(command)) => {
                command.apply(table);
                counters.applied.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("track feed line {}: {e}", index + 1);
                counters.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    debug!("track feed closed");
    counters.closed.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor, Read};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::datasource::TrackSource;

    #[test]
    fn parses_a_track_record() {
        let command = parse_line(" 12, 1500.0,-320.5,300,90.0,250.5,3 ").unwrap();
        assert_eq!(
            command,
            Some(FeedCommand::Upsert(TrackSnapshot {
                track_id: 12,
                x: 1500.0,
                y: -320.5,
                z: 300.0,
                heading: 90.0,
                velocity: 250.5,
                identity: 3,
            }))
        );
    }

    #[test]
    fn parses_commands_and_skips_noise() {
        assert_eq!(parse_line("-7").unwrap(), Some(FeedCommand::Remove(7)));
        assert_eq!(parse_line("CLEAR").unwrap(), Some(FeedCommand::Clear));
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line("   ").unwrap(), None);
        assert_eq!(parse_line("# comment").unwrap(), None);
    }

    #[test]
    fn negative_ids_in_records_are_not_removals() {
        let command = parse_line("-3,0,0,0,0,0,1").unwrap();
        assert!(matches!(
            command,
            Some(FeedCommand::Upsert(TrackSnapshot { track_id: -3, .. }))
        ));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(parse_line("1,2,3"), Err(FeedError::FieldCount(3)));
        assert!(matches!(
            parse_line("1,2,3,4,5,6,7,8"),
            Err(FeedError::FieldCount(8))
        ));
        assert!(matches!(
            parse_line("1,north,0,0,0,0,0"),
            Err(FeedError::InvalidField { field: "x", .. })
        ));
        assert!(matches!(
            parse_line("1,0,0,0,0,0,2.5"),
            Err(FeedError::InvalidField { field: "identity", .. })
        ));
        assert!(matches!(
            parse_line("-abc"),
            Err(FeedError::InvalidField { field: "track id", .. })
        ));
    }

    #[test]
    fn worker_applies_lines_to_the_table() {
        let input = "1,0,0,0,0,0,2\n2,0,0,0,0,0,3\nbogus\n-1\n3,1,1,1,1,1,1\n";
        let table = TrackTable::new();
        let mut worker = FeedWorker::spawn(Cursor::new(input), table.clone()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.is_closed() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.is_closed());
        assert_eq!(worker.applied(), 4);
        assert_eq!(worker.rejected(), 1);

        let ids: Vec<_> = table
            .list_current_tracks()
            .iter()
            .map(|t| t.track_id)
            .collect();
        assert_eq!(ids, [2, 3]);
        worker.shutdown();
    }

    struct Exploding;

    impl Read for Exploding {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            panic!("input source failed");
        }
    }

    #[test]
    fn panicked_reader_thread_is_joined() {
        let mut worker = FeedWorker::spawn(BufReader::new(Exploding), TrackTable::new()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.handle.as_ref().is_some_and(|h| !h.is_finished())
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        worker.shutdown();
        assert!(worker.handle.is_none());
        assert!(!worker.is_closed());
        assert_eq!(worker.applied(), 0);
    }
}
