//! Durable pagination checkpoint.
//!
//! The cursor file holds one ASCII base-10 integer followed by `\n`: the id of
//! the last manifest row handed out by the pager. It is read once at startup
//! and written once at shutdown.
//!
//! Writes are compare-and-swap: under an exclusive file lock the current
//! contents are re-read and the write only happens if they are byte-identical
//! to what was read at startup. Two runs sharing a cursor file therefore cannot
//! silently overwrite each other; the second one to finish gets
//! [`Error::CursorConflict`].

use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// What was found in the cursor file at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorSnapshot {
    /// Token to resume after. Zero when the file did not exist.
    pub token: i64,
    /// Whether the file existed.
    pub existed: bool,
    /// Exact bytes read, compared against the file again at store time.
    raw: Vec<u8>,
}

impl CursorSnapshot {
    /// Snapshot of a cursor file that does not exist yet.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            token: 0,
            existed: false,
            raw: Vec::new(),
        }
    }

    /// The bytes read at load time.
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Cursor file handle.
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    /// Creates a store for the file at `path`. Nothing is touched yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the cursor file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the cursor under a shared lock.
    ///
    /// A missing file is token 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cursor`] if the file cannot be read or does not hold an
    /// integer.
    pub fn load(&self) -> Result<CursorSnapshot> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CursorSnapshot::empty()),
            Err(e) => return Err(self.error(e)),
        };
        file.lock_shared().map_err(|e| self.error(e))?;
        let mut raw = Vec::new();
        let read = file.read_to_end(&mut raw);
        let _ = file.unlock();
        read.map_err(|e| self.error(e))?;

        let token = parse_token(&raw).map_err(|cause| Error::Cursor {
            path: self.path.clone(),
            cause,
        })?;
        tracing::info!(file = %self.path.display(), id = token, "loaded id from cursor");
        Ok(CursorSnapshot {
            token,
            existed: true,
            raw,
        })
    }

    /// Writes `token`, provided the file still holds what `prior` saw.
    ///
    /// The file is created if it did not exist at load time and still does
    /// not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CursorConflict`] if the file changed since `prior` was
    /// loaded (the file is left untouched), or [`Error::Cursor`] on I/O
    /// failure.
    pub fn store(&self, prior: &CursorSnapshot, token: i64) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.error(e))?;
        file.lock().map_err(|e| self.error(e))?;
        let res = self.swap_locked(&mut file, prior, token);
        let _ = file.unlock();
        res?;
        tracing::info!(file = %self.path.display(), id = token, "wrote cursor file");
        Ok(())
    }

    fn swap_locked(&self, file: &mut File, prior: &CursorSnapshot, token: i64) -> Result<()> {
        let mut current = Vec::new();
        file.read_to_end(&mut current).map_err(|e| self.error(e))?;
        if current != prior.raw {
            return Err(Error::CursorConflict {
                path: self.path.clone(),
                expected: String::from_utf8_lossy(&prior.raw).into_owned(),
                found: String::from_utf8_lossy(&current).into_owned(),
            });
        }

        let contents = format_token(token);
        file.seek(SeekFrom::Start(0)).map_err(|e| self.error(e))?;
        file.set_len(0).map_err(|e| self.error(e))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| self.error(e))?;
        file.sync_all().map_err(|e| self.error(e))
    }

    fn error(&self, e: std::io::Error) -> Error {
        Error::Cursor {
            path: self.path.clone(),
            cause: e.to_string(),
        }
    }
}

/// Renders a token in the on-disk format.
#[must_use]
pub fn format_token(token: i64) -> String {
    format!("{token}\n")
}

/// Parses the on-disk format.
///
/// Surrounding whitespace is tolerated, so hand-edited files work. An empty
/// file counts as zero.
fn parse_token(raw: &[u8]) -> std::result::Result<i64, String> {
    let text = std::str::from_utf8(raw).map_err(|e| format!("not UTF-8: {e}"))?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    let token: i64 = text
        .parse()
        .map_err(|e| format!("bad cursor value {text:?}: {e}"))?;
    if token < 0 {
        return Err(format!("bad cursor value {text:?}: negative"));
    }
    Ok(token)
}
