// SPDX-License-Identifier: MIT
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;

use super::error::RecordError;
use super::format::{Frame, SessionHeader, encode_frame_into, encode_header};
use super::store::OpenGuard;

/// Append-only writer for one session file.
///
/// Each frame is encoded completely in memory and handed to the file in a
/// single write followed by a flush, so an abrupt stop can only ever cut the
/// last frame.
pub struct SessionWriter {
    out: BufWriter<File>,
    path: PathBuf,
    scratch: Vec<u8>,
    frames_written: u64,
    bytes_written: u64,
    guard: Option<OpenGuard>,
}

impl SessionWriter {
    /// Creates a new session file at `path` and writes the header.
    ///
    /// An existing file is never overwritten.
    ///
    /// # Errors
    ///
    /// Returns an error if the file already exists, cannot be created, or the
    /// header cannot be written.
    pub fn create(path: &Path, header: &SessionHeader) -> Result<Self, RecordError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let mut out = BufWriter::new(file);

        let bytes = encode_header(header);
        out.write_all(&bytes)?;
        out.flush()?;

        debug!("created session file {}", path.display());

        Ok(Self {
            out,
            path: path.to_path_buf(),
            scratch: Vec::new(),
            frames_written: 0,
            bytes_written: bytes.len() as u64,
            guard: None,
        })
    }

    /// Wraps an already open file without writing a header.
    #[cfg(test)]
    pub(super) fn over_file(file: File, path: &Path) -> Self {
        Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            scratch: Vec::new(),
            frames_written: 0,
            bytes_written: 0,
            guard: None,
        }
    }

    pub(super) fn with_guard(mut self, guard: OpenGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Appends one frame and flushes it to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be encoded or written.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), RecordError> {
        self.scratch.clear();
        encode_frame_into(frame, &mut self.scratch)?;

        self.out.write_all(&self.scratch)?;
        self.out.flush()?;

        self.frames_written += 1;
        self.bytes_written += self.scratch.len() as u64;
        Ok(())
    }

    /// Flushes buffered data, syncs it to disk and closes the file.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing or syncing fails.
    pub fn finish(mut self) -> Result<(), RecordError> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        self.guard.take();
        debug!(
            "closed session file {} ({} frames, {} bytes)",
            self.path.display(),
            self.frames_written,
            self.bytes_written
        );
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
