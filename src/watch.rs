//! Incremental log watching.
//!
//! A [`LogCursor`] is a fixed position in a server log. Waiting on a cursor tails the file from
//! that position, so lines written before the cursor was taken are never matched:
//!
//! ```no_run
//! # async fn demo(ns9: &nsharness::ServerHandle) -> Result<(), nsharness::error::Error> {
//! # use std::time::Duration;
//! let watcher = ns9.watch_log_from_here().await?;
//! // ... send the query that should make ns9 log something ...
//! watcher
//!     .wait_for_line("status: SERVFAIL", Duration::from_secs(10))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Every wait is bounded by its timeout and fails with [`Error::LogTimeout`]. Cursors share no
//! state: each wait opens the file itself and reads from its own offset, so any number of
//! cursors can watch the same log. A successful wait returns a [`LogMatch`] whose
//! [`cursor`][LogMatch::cursor] points just past the matched line, for follow-up waits.

use crate::error::Error;
use std::fmt;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::Instant;
use tracing::{debug, warn};

/// How often a waiting cursor looks for new lines.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a log line is matched against.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Matches lines containing the string.
    Substring(String),
    /// Matches lines the regular expression finds a match in.
    Regex(fancy_regex::Regex),
}

impl Pattern {
    /// Compile a regular expression pattern.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pattern`] if `re` is not a valid regular expression.
    pub fn regex(re: &str) -> Result<Self, Error> {
        Ok(Pattern::Regex(fancy_regex::Regex::new(re)?))
    }

    /// # Errors
    ///
    /// Returns [`Error::Pattern`] if the regex engine gives up on `line`.
    pub fn is_match(&self, line: &str) -> Result<bool, Error> {
        match self {
            Pattern::Substring(s) => Ok(line.contains(s.as_str())),
            Pattern::Regex(re) => Ok(re.is_match(line)?),
        }
    }
}

impl From<&str> for Pattern {
    fn from(s: &str) -> Self {
        Pattern::Substring(s.to_string())
    }
}

impl From<String> for Pattern {
    fn from(s: String) -> Self {
        Pattern::Substring(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Substring(s) => f.write_str(s),
            Pattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// A position in a log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogCursor {
    path: PathBuf,
    offset: u64,
    /// Identity of the file `offset` refers to, when known.
    inode: Option<u64>,
}

/// A line found by a wait.
#[derive(Debug, Clone)]
pub struct LogMatch {
    /// The matched line, without its line terminator.
    pub line: String,
    /// Index of the pattern that matched, in the order the patterns were given.
    pub index: usize,
    next: LogCursor,
}

impl LogMatch {
    /// A cursor positioned right after the matched line.
    #[must_use]
    pub fn cursor(&self) -> &LogCursor {
        &self.next
    }
}

impl LogCursor {
    /// A cursor at the current end of `path`. A log that does not exist yet is watched from
    /// its start once it appears.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IO`] if the file exists but its size can't be read.
    pub async fn from_here(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let (offset, inode) = match tokio::fs::metadata(&path).await {
            Ok(meta) => (meta.len(), file_id(&meta)),
            Err(err) if err.kind() == ErrorKind::NotFound => (0, None),
            Err(err) => return Err(err.into()),
        };
        debug!("watching {} from offset {offset}", path.display());
        Ok(Self {
            path,
            offset,
            inode,
        })
    }

    /// A cursor at the start of `path`.
    #[must_use]
    pub fn from_start(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            inode: None,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Wait until a line matching `pattern` is written after this cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LogTimeout`] if no such line appears within `timeout`.
    pub async fn wait_for_line(
        &self,
        pattern: impl Into<Pattern>,
        timeout: Duration,
    ) -> Result<LogMatch, Error> {
        self.wait_for_any(&[pattern.into()], timeout).await
    }

    /// Wait for the first line matching any of `patterns`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LogTimeout`] if no line matches within `timeout`, and at once when
    /// `patterns` is empty.
    pub async fn wait_for_any(
        &self,
        patterns: &[Pattern],
        timeout: Duration,
    ) -> Result<LogMatch, Error> {
        let mut found = None;
        self.follow(patterns, timeout, |m| {
            found = Some(m);
            true
        })
        .await?;
        found.ok_or_else(|| self.timeout_error(patterns, timeout))
    }

    /// Wait for lines matching `patterns` one after the other, in order. Returns one match
    /// per pattern, in pattern order; an empty sequence is matched at once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LogTimeout`] naming the patterns still missing if the whole sequence
    /// does not show up within `timeout`.
    pub async fn wait_for_sequence(
        &self,
        patterns: &[Pattern],
        timeout: Duration,
    ) -> Result<Vec<LogMatch>, Error> {
        let deadline = Instant::now() + timeout;
        let mut cursor = self.clone();
        let mut matches = Vec::with_capacity(patterns.len());
        for (i, pattern) in patterns.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let found = match cursor
                .wait_for_any(std::slice::from_ref(pattern), remaining)
                .await
            {
                Ok(found) => found,
                Err(Error::LogTimeout { .. }) => {
                    return Err(self.timeout_error(&patterns[i..], timeout));
                }
                Err(err) => return Err(err),
            };
            cursor = found.next.clone();
            matches.push(LogMatch { index: i, ..found });
        }
        Ok(matches)
    }

    /// Wait until every one of `patterns` has matched some line, in any order. Returns the
    /// matches in pattern order; an empty set is matched at once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LogTimeout`] naming the patterns still missing at the deadline.
    pub async fn wait_for_all(
        &self,
        patterns: &[Pattern],
        timeout: Duration,
    ) -> Result<Vec<LogMatch>, Error> {
        let mut found: Vec<Option<LogMatch>> = vec![None; patterns.len()];
        let result = self
            .follow(patterns, timeout, |m| {
                let slot = &mut found[m.index];
                if slot.is_none() {
                    *slot = Some(m);
                }
                found.iter().all(Option::is_some)
            })
            .await;
        match result {
            Ok(()) => Ok(found.into_iter().flatten().collect()),
            Err(Error::LogTimeout { .. }) => {
                let missing: Vec<Pattern> = patterns
                    .iter()
                    .zip(&found)
                    .filter(|(_, m)| m.is_none())
                    .map(|(p, _)| p.clone())
                    .collect();
                Err(self.timeout_error(&missing, timeout))
            }
            Err(err) => Err(err),
        }
    }

    /// Look for `pattern` between this cursor and the current end of the log, without
    /// waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IO`] if the log can't be read.
    pub async fn scan(&self, pattern: &Pattern) -> Result<Option<LogMatch>, Error> {
        let mut tail = Tail::new(self);
        for (line, end) in tail.read_lines().await? {
            if pattern.is_match(&line)? {
                return Ok(Some(self.matched(line, 0, end, tail.inode)));
            }
        }
        Ok(None)
    }

    async fn follow<F>(&self, patterns: &[Pattern], timeout: Duration, mut on_match: F) -> Result<(), Error>
    where
        F: FnMut(LogMatch) -> bool,
    {
        if patterns.is_empty() {
            return Ok(());
        }
        let mut tail = Tail::new(self);
        let watch = async {
            loop {
                for (line, end) in tail.read_lines().await? {
                    for (index, pattern) in patterns.iter().enumerate() {
                        if pattern.is_match(&line)?
                            && on_match(self.matched(line.clone(), index, end, tail.inode))
                        {
                            return Ok::<(), Error>(());
                        }
                    }
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        match tokio::time::timeout(timeout, watch).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error(patterns, timeout)),
        }
    }

    fn matched(&self, line: String, index: usize, end: u64, inode: Option<u64>) -> LogMatch {
        LogMatch {
            line,
            index,
            next: LogCursor {
                path: self.path.clone(),
                offset: end,
                inode,
            },
        }
    }

    fn timeout_error(&self, patterns: &[Pattern], timeout: Duration) -> Error {
        Error::LogTimeout {
            path: self.path.clone(),
            patterns: patterns.iter().map(ToString::to_string).collect(),
            timeout,
        }
    }
}

/// Reader state for one wait: where the next read starts and any unterminated line seen so
/// far.
struct Tail {
    path: PathBuf,
    offset: u64,
    file: Option<File>,
    inode: Option<u64>,
    partial: Vec<u8>,
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

impl Tail {
    fn new(cursor: &LogCursor) -> Self {
        Self {
            path: cursor.path.clone(),
            offset: cursor.offset,
            file: None,
            inode: cursor.inode,
            partial: Vec::new(),
        }
    }

    fn restart(&mut self, why: &str) {
        warn!("{} was {why}, reading it from the start", self.path.display());
        self.file = None;
        self.inode = None;
        self.offset = 0;
        self.partial.clear();
    }

    /// Complete lines written since the last read, each with the offset just past it.
    async fn read_lines(&mut self) -> Result<Vec<(String, u64)>, Error> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        // Checked before the first open too: the cursor may predate a rotation.
        if let Some(inode) = self.inode {
            if matches!(file_id(&meta), Some(current) if current != inode) {
                self.restart("replaced");
            }
        }
        if meta.len() < self.offset {
            self.restart("truncated");
        }

        if self.file.is_none() {
            let file = match File::open(&self.path).await {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(err) => return Err(err.into()),
            };
            self.inode = file_id(&file.metadata().await?);
            self.file = Some(file);
        }

        let mut buf = Vec::new();
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start(self.offset)).await?;
            file.read_to_end(&mut buf).await?;
        }
        if buf.is_empty() {
            return Ok(Vec::new());
        }

        // Offset of the first byte of `partial` in the file.
        let mut line_start = self.offset - self.partial.len() as u64;
        self.offset += buf.len() as u64;
        self.partial.extend_from_slice(&buf);

        let mut lines = Vec::new();
        let mut consumed = 0;
        while let Some(newline) = self.partial[consumed..].iter().position(|b| *b == b'\n') {
            let raw = &self.partial[consumed..consumed + newline];
            let line = String::from_utf8_lossy(raw)
                .trim_end_matches('\r')
                .to_string();
            line_start += newline as u64 + 1;
            lines.push((line, line_start));
            consumed += newline + 1;
        }
        self.partial.drain(..consumed);
        Ok(lines)
    }
}
