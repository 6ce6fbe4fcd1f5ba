// SPDX-License-Identifier: MIT
pub mod clock;
pub mod error;
pub mod format;
pub mod reader;
pub mod recorder;
pub mod replayer;
pub mod store;
pub mod writer;

pub use clock::{DEFAULT_CAPTURE_INTERVAL, PlaybackClock, Ticker};
pub use error::{DecodeError, EncodeError, RecordError, ReplayError, StoreError};
pub use format::{Frame, SessionHeader};
pub use reader::{LoadedSession, SessionStats};
pub use recorder::{Recorder, RecorderState};
pub use replayer::{ReplayState, Replayer, TrackSink};
pub use store::{SESSION_EXTENSION, SessionInfo, SessionStore, export_csv};
pub use writer::SessionWriter;
