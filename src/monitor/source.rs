//! Incremental reading of append-only log files.
//!
//! Each [`LogSource`] remembers a byte cursor and the identity of the file it
//! was reading. Uses synchronous `std::fs` reads since these are quick local
//! operations done on the coordinator between ticks.

use std::collections::HashMap;
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Upper bound on bytes consumed by one poll; the rest waits for the next.
const MAX_CHUNK_BYTES: u64 = 8 * 1024 * 1024;

/// Lines longer than this are dropped.
const MAX_LINE_LEN: usize = 1_048_576;

/// Stable identity of a file, used to detect replacement under the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    /// Device id (0 where unavailable).
    pub device: u64,
    /// Inode number, or creation time in nanoseconds off Unix.
    pub inode: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            device: metadata.dev(),
            inode: metadata.ino(),
        }
    }

    #[cfg(not(unix))]
    fn of(metadata: &Metadata) -> Self {
        let created = metadata
            .created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            device: 0,
            inode: created,
        }
    }
}

/// Read position within one log file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCursor {
    /// Path being tracked.
    pub path: PathBuf,
    /// Identity of the file the offset refers to; `None` before the first read.
    pub identity: Option<FileIdentity>,
    /// Offset of the first unread byte.
    pub byte_offset: u64,
    /// The offset sits inside an oversized line whose remainder is dropped
    /// up to the next newline.
    #[serde(default)]
    pub skipping_line: bool,
}

impl SourceCursor {
    /// A cursor at the start of `path` with no known identity.
    pub fn start(path: PathBuf) -> Self {
        Self {
            path,
            identity: None,
            byte_offset: 0,
            skipping_line: false,
        }
    }
}

/// Recoverable, per-poll read failure.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The file does not exist (yet, or rotated away).
    #[error("log file not found: {}", path.display())]
    NotFound {
        /// Missing path.
        path: PathBuf,
    },
    /// The process lacks read permission.
    #[error("permission denied reading {}", path.display())]
    PermissionDenied {
        /// Unreadable path.
        path: PathBuf,
    },
    /// Any other I/O failure.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Path being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl SourceError {
    fn from_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound {
                path: path.to_owned(),
            },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_owned(),
            },
            _ => Self::Io {
                path: path.to_owned(),
                source,
            },
        }
    }
}

/// One complete line and the offset it starts at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    /// Byte offset of the first byte of the line.
    pub byte_offset: u64,
    /// Line text without the trailing newline.
    pub text: String,
}

/// Result of a single poll.
#[derive(Debug, Default)]
pub struct SourcePoll {
    /// New complete lines, in file order.
    pub lines: Vec<SourceLine>,
    /// The file was truncated or replaced since the previous poll and the
    /// cursor restarted at 0.
    pub rotated: bool,
    /// Read failure; `lines` is empty when set.
    pub warning: Option<SourceError>,
}

/// An append-only text file read incrementally.
#[derive(Debug)]
pub struct LogSource {
    id: String,
    cursor: SourceCursor,
    start_at_end: bool,
}

impl LogSource {
    /// Read `path` from the beginning.
    pub fn new(path: PathBuf) -> Self {
        Self::with_cursor(SourceCursor::start(path))
    }

    /// Skip whatever the file holds at the first poll and read only new lines.
    pub fn tail(path: PathBuf) -> Self {
        let mut source = Self::new(path);
        source.start_at_end = true;
        source
    }

    /// Resume from a previously persisted cursor.
    pub fn with_cursor(cursor: SourceCursor) -> Self {
        Self {
            id: cursor.path.display().to_string(),
            cursor,
            start_at_end: false,
        }
    }

    /// Build a source for a configured path, preferring a saved cursor.
    pub fn open(path: PathBuf, tail_only: bool, saved: Option<SourceCursor>) -> Self {
        match saved {
            Some(cursor) if cursor.path == path => Self::with_cursor(cursor),
            _ if tail_only => Self::tail(path),
            _ => Self::new(path),
        }
    }

    /// Source identifier used in events and records (the path).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path being read.
    pub fn path(&self) -> &Path {
        &self.cursor.path
    }

    /// Current cursor.
    pub fn cursor(&self) -> &SourceCursor {
        &self.cursor
    }

    /// Return complete lines appended since the previous poll.
    ///
    /// Never fails: read errors come back as an empty poll with `warning`
    /// set, and the cursor is left untouched for the next attempt.
    pub fn poll(&mut self) -> SourcePoll {
        match self.read_new_lines() {
            Ok((lines, rotated)) => SourcePoll {
                lines,
                rotated,
                warning: None,
            },
            Err(e) => SourcePoll {
                warning: Some(e),
                ..SourcePoll::default()
            },
        }
    }

    fn read_new_lines(&mut self) -> Result<(Vec<SourceLine>, bool), SourceError> {
        let path = self.cursor.path.clone();
        let io_err = |e: io::Error| SourceError::from_io(&path, e);

        let mut file = File::open(&path).map_err(io_err)?;
        let metadata = file.metadata().map_err(io_err)?;
        let identity = FileIdentity::of(&metadata);
        let file_len = metadata.len();

        let mut rotated = false;
        match self.cursor.identity {
            Some(previous) if previous != identity => {
                debug!(path = %path.display(), "file identity changed");
                rotated = true;
                self.cursor.byte_offset = 0;
                self.cursor.skipping_line = false;
            }
            None if self.start_at_end => {
                self.cursor.byte_offset = file_len;
            }
            _ => {}
        }
        self.cursor.identity = Some(identity);
        self.start_at_end = false;

        // Shrunk in place (copytruncate-style rotation).
        if file_len < self.cursor.byte_offset {
            debug!(
                path = %path.display(),
                previous_offset = self.cursor.byte_offset,
                file_len,
                "file truncated"
            );
            rotated = true;
            self.cursor.byte_offset = 0;
            self.cursor.skipping_line = false;
        }

        if file_len == self.cursor.byte_offset {
            return Ok((Vec::new(), rotated));
        }

        let to_read = file_len
            .saturating_sub(self.cursor.byte_offset)
            .min(MAX_CHUNK_BYTES);
        file.seek(SeekFrom::Start(self.cursor.byte_offset))
            .map_err(io_err)?;
        let mut buf = Vec::new();
        file.take(to_read).read_to_end(&mut buf).map_err(io_err)?;

        let mut rest = buf.as_slice();
        if self.cursor.skipping_line {
            let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
                self.advance(to_read);
                return Ok((Vec::new(), rotated));
            };
            let skipped = newline.saturating_add(1);
            self.advance(u64::try_from(skipped).unwrap_or(u64::MAX));
            self.cursor.skipping_line = false;
            rest = rest.get(skipped..).unwrap_or_default();
        }

        let Some(last_newline) = rest.iter().rposition(|b| *b == b'\n') else {
            if u64::try_from(rest.len()).unwrap_or(u64::MAX) == MAX_CHUNK_BYTES {
                // A single line larger than the whole chunk; drop the rest
                // of it on later polls too.
                warn!(path = %path.display(), "skipping oversized line");
                self.advance(to_read);
                self.cursor.skipping_line = true;
            }
            return Ok((Vec::new(), rotated));
        };

        let complete = rest.get(..=last_newline).unwrap_or_default();
        let mut lines = Vec::new();
        let mut line_start = self.cursor.byte_offset;
        for raw in complete.split(|b| *b == b'\n') {
            let consumed = u64::try_from(raw.len()).unwrap_or(u64::MAX).saturating_add(1);
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if !raw.is_empty() && raw.len() <= MAX_LINE_LEN {
                lines.push(SourceLine {
                    byte_offset: line_start,
                    text: String::from_utf8_lossy(raw).into_owned(),
                });
            }
            line_start = line_start.saturating_add(consumed);
        }

        self.advance(u64::try_from(complete.len()).unwrap_or(u64::MAX));
        Ok((lines, rotated))
    }

    fn advance(&mut self, bytes: u64) {
        self.cursor.byte_offset = self.cursor.byte_offset.saturating_add(bytes);
    }
}

/// JSON file holding the cursors of all sources.
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    /// A store backed by `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load saved cursors keyed by path. A missing file yields an empty map.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> anyhow::Result<HashMap<PathBuf, SourceCursor>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        let cursors: Vec<SourceCursor> = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(cursors.into_iter().map(|c| (c.path.clone(), c)).collect())
    }

    /// Atomically replace the saved cursors.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails.
    pub fn save<'a>(&self, cursors: impl IntoIterator<Item = &'a SourceCursor>) -> anyhow::Result<()> {
        let cursors: Vec<&SourceCursor> = cursors.into_iter().collect();
        let json = serde_json::to_string_pretty(&cursors).context("failed to serialize cursors")?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
