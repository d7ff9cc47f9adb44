//! Drop-folder ingestion.
//!
//! Some cameras upload a JPEG over FTP whenever their own motion trigger
//! fires. The folder is polled every cycle: the oldest fresh `*.jpg` anywhere
//! below the root is read and removed. Files older than `stale_after` are
//! deleted unread, files modified within `settle` are assumed to still be
//! uploading and are left for the next cycle.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use crate::frame::Frame;

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum PollOutcome {
    Frame(Frame),
    /// Nothing ready yet.
    Empty,
    /// A file was consumed but could not be decoded.
    Unreadable(String),
}

#[derive(Clone, Debug)]
pub struct DropFolder {
    root: PathBuf,
    stale_after: Duration,
    settle: Duration,
}

impl DropFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stale_after: DEFAULT_STALE_AFTER,
            settle: DEFAULT_SETTLE,
        }
    }

    pub fn with_timing(mut self, stale_after: Duration, settle: Duration) -> Self {
        self.stale_after = stale_after;
        self.settle = settle;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn poll(&self) -> Result<PollOutcome> {
        if !self.root.is_dir() {
            return Ok(PollOutcome::Empty);
        }
        let now = SystemTime::now();
        let mut files = Vec::new();
        collect_jpegs(&self.root, &mut files)
            .with_context(|| format!("scan {}", self.root.display()))?;
        if files.is_empty() {
            remove_empty_dirs(&self.root, false);
            return Ok(PollOutcome::Empty);
        }
        files.sort_by_key(|(_, modified)| *modified);

        for (path, modified) in files {
            let age = now.duration_since(modified).unwrap_or_default();
            if age > self.stale_after {
                log::warn!("skipping old file {}", path.display());
                if let Err(err) = fs::remove_file(&path) {
                    log::warn!("failed to remove {}: {}", path.display(), err);
                }
                continue;
            }
            if age < self.settle {
                log::debug!("{} is still being written", path.display());
                return Ok(PollOutcome::Empty);
            }
            let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            return Ok(match Frame::decode(&bytes, path.to_string_lossy()) {
                Ok(frame) => PollOutcome::Frame(frame),
                Err(err) => PollOutcome::Unreadable(format!("bad file {}: {:#}", path.display(), err)),
            });
        }
        Ok(PollOutcome::Empty)
    }

    /// Remove stale files of any kind and empty subdirectories.
    pub fn sweep(&self) -> Result<usize> {
        let now = SystemTime::now();
        let removed = sweep_dir(&self.root, now, self.stale_after)
            .with_context(|| format!("sweep {}", self.root.display()))?;
        remove_empty_dirs(&self.root, false);
        Ok(removed)
    }
}

fn collect_jpegs(dir: &Path, out: &mut Vec<(PathBuf, SystemTime)>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            collect_jpegs(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("jpg") {
            out.push((path, meta.modified()?));
        }
    }
    Ok(())
}

fn sweep_dir(dir: &Path, now: SystemTime, stale_after: Duration) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            removed += sweep_dir(&path, now, stale_after)?;
            continue;
        }
        let age = now.duration_since(meta.modified()?).unwrap_or_default();
        if age > stale_after {
            log::debug!("removing stale {}", path.display());
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Returns true when `dir` ended up empty.
fn remove_empty_dirs(dir: &Path, remove_self: bool) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    let mut empty = true;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && remove_empty_dirs(&path, true) {
            continue;
        }
        empty = false;
    }
    if empty && remove_self {
        return fs::remove_dir(dir).is_ok();
    }
    empty
}
