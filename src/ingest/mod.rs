//! Frame capture sources.
//!
//! This module provides the ways a camera can deliver a still:
//! - HTTP snapshot endpoints (IP cameras), with a device reboot hook
//! - Local files (and `stub://` synthetic frames for testing)
//! - Drop folders written by the camera's own FTP upload
//!
//! Active sources implement `FrameSource`. The drop folder is polled
//! separately because it can legitimately have nothing to offer.

pub mod drop_folder;
pub mod file;
pub mod http;

use anyhow::Result;

use crate::frame::Frame;

pub use drop_folder::{DropFolder, PollOutcome};
pub use file::FileSource;
pub use http::{HttpConfig, HttpSource};

/// An actively queried frame source.
pub trait FrameSource: Send {
    /// Fetch and decode one frame. Any error counts as a capture failure.
    fn fetch(&mut self) -> Result<Frame>;

    /// Human-readable origin for logs and snapshot metadata.
    fn describe(&self) -> String;

    /// Frames from local files are never persisted as snapshots.
    fn is_local(&self) -> bool {
        false
    }

    /// Ask the device to restart after repeated failures.
    fn reboot(&mut self) -> Result<()> {
        Ok(())
    }
}
