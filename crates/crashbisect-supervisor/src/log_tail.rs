//! Incremental scanning of the target's log for the completion sentinel.
//!
//! Only bytes appended after [`LogTail::seek_to_end`] are examined, so a
//! sentinel left over from an earlier cycle never counts. The tail of each
//! read is carried into the next, as raw bytes, so a sentinel split across
//! two polls is still found even when the split falls inside a multi-byte
//! character.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crashbisect_error::Result;
use tracing::debug;

#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    carry: Vec<u8>,
}

impl LogTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            carry: Vec::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Skip everything currently in the file. A missing file starts at 0.
    ///
    /// # Errors
    ///
    /// I/O errors other than the file not existing.
    pub fn seek_to_end(&mut self) -> Result<()> {
        self.carry.clear();
        self.offset = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(())
    }

    /// Read newly appended bytes and report whether `sentinel` appeared.
    ///
    /// A missing file reads as empty. A file shorter than the saved offset
    /// was truncated or rotated and is rescanned from the start.
    ///
    /// # Errors
    ///
    /// I/O errors other than the file not existing.
    pub fn poll(&mut self, sentinel: &str) -> Result<bool> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        if len < self.offset {
            debug!(
                path = %self.path.display(),
                len,
                offset = self.offset,
                "log shrank; rescanning from start"
            );
            self.offset = 0;
            self.carry.clear();
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut fresh = Vec::new();
        file.read_to_end(&mut fresh)?;
        if fresh.is_empty() {
            return Ok(false);
        }
        self.offset += fresh.len() as u64;

        let needle = sentinel.as_bytes();
        let mut window = std::mem::take(&mut self.carry);
        window.extend_from_slice(&fresh);
        let found = contains_bytes(&window, needle);
        let keep = needle.len().saturating_sub(1).min(window.len());
        self.carry = window.split_off(window.len() - keep);
        Ok(found)
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
