// SPDX-License-Identifier: MIT
//! Directory of session files.
//!
//! The store names new sessions, lists and removes finished ones, and keeps
//! track of which paths are still being written so they cannot be deleted or
//! copied mid-frame.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, Utc};
use log::{debug, info};

use super::error::{RecordError, StoreError};
use super::format::SessionHeader;
use super::reader::{ARCHIVE_EXTENSION, LoadedSession, read_header};
use super::writer::SessionWriter;

pub const SESSION_EXTENSION: &str = "rdr";
const FILE_PREFIX: &str = "recording_";
const ARCHIVE_LEVEL: i32 = 19;

/// A finished (or in-progress) session found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
    /// `None` when the header cannot be read.
    pub created_at_ms: Option<i64>,
    pub compressed: bool,
    pub open: bool,
}

impl SessionInfo {
    fn sort_key(&self) -> i64 {
        self.created_at_ms
            .or_else(|| self.modified.map(|m| m.timestamp_millis()))
            .unwrap_or(i64::MIN)
    }

    #[must_use]
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at_ms.and_then(DateTime::from_timestamp_millis)
    }
}

type OpenSet = Arc<Mutex<HashSet<PathBuf>>>;

/// Marks a path as open for writing until dropped.
#[derive(Debug)]
pub struct OpenGuard {
    key: PathBuf,
    open: OpenSet,
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        if let Ok(mut open) = self.open.lock() {
            open.remove(&self.key);
        }
        debug!("released {}", self.key.display());
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    base_dir: PathBuf,
    open: OpenSet,
}

impl SessionStore {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            open: Arc::default(),
        }
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolves a bare file name against the store directory. Paths that
    /// exist as given, or are absolute, are returned unchanged.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.exists() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Picks an unused `recording_YYYYMMDD_HHMMSS.rdr` path for `now`,
    /// appending `_1`, `_2`, ... when the name is taken.
    #[must_use]
    pub fn generate_path(&self, now: DateTime<Local>) -> PathBuf {
        let stem = format!("{FILE_PREFIX}{}", now.format("%Y%m%d_%H%M%S"));
        let mut candidate = self.base_dir.join(format!("{stem}.{SESSION_EXTENSION}"));
        let mut suffix = 1_u32;
        while candidate.exists() || self.is_open(&candidate) {
            candidate = self
                .base_dir
                .join(format!("{stem}_{suffix}.{SESSION_EXTENSION}"));
            suffix += 1;
        }
        candidate
    }

    /// Creates a new session file and registers it as open.
    ///
    /// # Errors
    ///
    /// `Store(InUse)` if another writer holds the path, `Io` if the file
    /// exists or cannot be created.
    pub fn create_session(
        &self,
        path: &Path,
        header: &SessionHeader,
    ) -> Result<SessionWriter, RecordError> {
        let guard = self.claim(path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let writer = SessionWriter::create(path, header)?;
        info!("recording to {}", path.display());
        Ok(writer.with_guard(guard))
    }

    #[must_use]
    pub fn is_open(&self, path: &Path) -> bool {
        let key = open_key(path);
        self.open.lock().is_ok_and(|open| open.contains(&key))
    }

    fn claim(&self, path: &Path) -> Result<OpenGuard, StoreError> {
        let key = open_key(path);
        let mut open = self
            .open
            .lock()
            .map_err(|_| io::Error::other("open session registry poisoned"))?;
        if !open.insert(key.clone()) {
            return Err(StoreError::InUse(path.to_path_buf()));
        }
        Ok(OpenGuard {
            key,
            open: Arc::clone(&self.open),
        })
    }

    /// Lists sessions in the store directory, newest first.
    ///
    /// A missing directory is an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be read.
    pub fn list(&self) -> Result<Vec<SessionInfo>, StoreError> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && is_session_file(&path) {
                sessions.push(self.info(&path)?);
            }
        }

        sessions.sort_by(|a, b| {
            b.sort_key()
                .cmp(&a.sort_key())
                .then_with(|| b.file_name.cmp(&a.file_name))
        });
        Ok(sessions)
    }

    /// Describes one session file.
    ///
    /// # Errors
    ///
    /// `NotFound` if the file does not exist.
    pub fn info(&self, path: &Path) -> Result<SessionInfo, StoreError> {
        let metadata = fs::metadata(path).map_err(|e| not_found(path, e))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(SessionInfo {
            file_name,
            size_bytes: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            created_at_ms: read_header(path).ok().map(|h| h.created_at_ms),
            compressed: is_compressed(path),
            open: self.is_open(path),
            path: path.to_path_buf(),
        })
    }

    /// Deletes a finished session.
    ///
    /// # Errors
    ///
    /// `NotFound` if the file does not exist, `InUse` while it is being
    /// recorded.
    pub fn delete(&self, path: &Path) -> Result<(), StoreError> {
        self.check_closed(path)?;
        fs::remove_file(path).map_err(|e| not_found(path, e))?;
        info!("deleted {}", path.display());
        Ok(())
    }

    /// Copies a finished session to `dest`, returning the bytes copied.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing source, `InUse` while it is being recorded,
    /// `AlreadyExists` if `dest` exists.
    pub fn copy(&self, src: &Path, dest: &Path) -> Result<u64, StoreError> {
        self.check_closed(src)?;
        let mut input = File::open(src).map_err(|e| not_found(src, e))?;
        let mut output = create_dest(dest)?;

        let bytes = io::copy(&mut input, &mut output)?;
        output.flush()?;
        info!("copied {} to {}", src.display(), dest.display());
        Ok(bytes)
    }

    /// Writes a zstd-compressed copy of a finished session to `dest`,
    /// returning the compressed size.
    ///
    /// # Errors
    ///
    /// Same as [`SessionStore::copy`].
    pub fn archive(&self, src: &Path, dest: &Path) -> Result<u64, StoreError> {
        self.check_closed(src)?;
        let input = File::open(src).map_err(|e| not_found(src, e))?;
        let output = create_dest(dest)?;

        let mut encoder = zstd::Encoder::new(output, ARCHIVE_LEVEL)?;
        io::copy(&mut BufReader::new(input), &mut encoder)?;
        let mut output = encoder.finish()?;
        output.flush()?;

        let size = fs::metadata(dest)?.len();
        info!(
            "archived {} to {} ({size} bytes)",
            src.display(),
            dest.display()
        );
        Ok(size)
    }

    fn check_closed(&self, path: &Path) -> Result<(), StoreError> {
        if self.is_open(path) {
            return Err(StoreError::InUse(path.to_path_buf()));
        }
        if !path.exists() {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }
        Ok(())
    }
}

/// Column names of [`export_csv`] output.
pub const CSV_HEADER: &str = "frame,timestamp_ms,track_id,x,y,z,heading,velocity,identity";

/// Writes one CSV row per snapshot of `session` into a new file at `dest`
/// and returns the number of rows.
///
/// # Errors
///
/// `AlreadyExists` if `dest` exists, `Io` if it cannot be written.
pub fn export_csv(session: &LoadedSession, dest: &Path) -> Result<usize, StoreError> {
    let mut out = create_dest(dest)?;
    writeln!(out, "{CSV_HEADER}")?;

    let mut rows = 0;
    for (index, frame) in session.frames.iter().enumerate() {
        for s in &frame.tracks {
            writeln!(
                out,
                "{index},{},{},{},{},{},{},{},{}",
                frame.timestamp_ms,
                s.track_id,
                s.x,
                s.y,
                s.z,
                s.heading,
                s.velocity,
                s.identity_label()
            )?;
            rows += 1;
        }
    }
    out.flush()?;
    debug!("exported {rows} rows to {}", dest.display());
    Ok(rows)
}

fn open_key(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn create_dest(dest: &Path) -> Result<BufWriter<File>, StoreError> {
    match OpenOptions::new().write(true).create_new(true).open(dest) {
        Ok(file) => Ok(BufWriter::new(file)),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(StoreError::AlreadyExists(dest.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

fn not_found(path: &Path, e: io::Error) -> StoreError {
    if e.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(path.to_path_buf())
    } else {
        StoreError::Io(e)
    }
}

fn is_compressed(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == ARCHIVE_EXTENSION)
}

fn is_session_file(path: &Path) -> bool {
    let inner = if is_compressed(path) {
        path.file_stem().map(Path::new)
    } else {
        Some(path)
    };
    inner
        .and_then(Path::extension)
        .is_some_and(|ext| ext == SESSION_EXTENSION)
}
