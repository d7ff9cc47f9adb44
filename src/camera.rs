//! Cameras and their per-process runtime state.
//!
//! A `Camera` is owned by the scheduler and moved into exactly one worker task
//! at a time, so nothing in here needs a lock.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};

use crate::filter::SpatialFilter;
use crate::frame::Frame;
use crate::ingest::{DropFolder, FileSource, FrameSource, HttpConfig, HttpSource, PollOutcome};
use crate::priority::NEVER;
use crate::tracker::TrackTable;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_REBOOT_AFTER_FAILURES: u32 = 3;

/// Static configuration of one camera.
#[derive(Clone, Debug)]
pub struct CameraSettings {
    pub name: String,
    pub display_name: String,
    pub interval: Duration,
    /// May be captured on the concurrent lane.
    pub concurrent: bool,
    /// Also run the vehicle model on this camera's frames.
    pub vehicle_check: bool,
    pub http: Option<HttpConfig>,
    pub file: Option<String>,
    pub drop_folder: Option<DropFolder>,
    pub filter: SpatialFilter,
    /// Notification text; `{objects}` and `{camera}` are substituted.
    pub message: Option<String>,
    pub reboot_after_failures: u32,
}

impl CameraSettings {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            interval: DEFAULT_INTERVAL,
            concurrent: false,
            vehicle_check: false,
            http: None,
            file: None,
            drop_folder: None,
            filter: SpatialFilter::default(),
            message: None,
            reboot_after_failures: DEFAULT_REBOOT_AFTER_FAILURES,
        }
    }
}

/// What one capture or poll attempt produced.
#[derive(Debug)]
pub enum CaptureOutcome {
    Frame(Frame),
    /// Drop folder had nothing new.
    Idle,
    /// Backing off; this many skips remain.
    Skipped(u32),
    /// Same content as the last processed frame.
    Duplicate,
    Failed(String),
}

impl CaptureOutcome {
    pub fn is_frame(&self) -> bool {
        matches!(self, CaptureOutcome::Frame(_))
    }
}

/// Mutable runtime state, touched by one worker at a time.
#[derive(Debug)]
pub struct CameraState {
    pub last_hash: Option<String>,
    pub last_error: Option<String>,
    pub failures: u32,
    pub skip: u32,
    /// Classes with a valid detection in the last processed cycle.
    pub objects: BTreeSet<String>,
    pub prior_priority: i32,
    pub last_snapshot: Option<Instant>,
    pub last_read: Option<Instant>,
    pub processed_cycles: u64,
    /// Last frame that was not saved, kept for a `-prior` snapshot.
    pub prior_frame: Option<(Frame, DateTime<Local>)>,
    pub counts: BTreeMap<String, usize>,
    pub tracks: TrackTable,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            last_hash: None,
            last_error: None,
            failures: 0,
            skip: 0,
            objects: BTreeSet::new(),
            prior_priority: NEVER,
            last_snapshot: None,
            last_read: None,
            processed_cycles: 0,
            prior_frame: None,
            counts: BTreeMap::new(),
            tracks: TrackTable::new(),
        }
    }
}

impl CameraState {
    /// Record a capture failure and start backing off.
    ///
    /// The skip count is `2^failures` using the count before this failure,
    /// with the exponent capped at `reboot_after`. Returns true once the
    /// failure count has reached `reboot_after`.
    pub fn record_failure(&mut self, error: impl Into<String>, reboot_after: u32) -> bool {
        let exponent = self.failures.min(reboot_after).min(31);
        self.skip = 1u32 << exponent;
        self.failures = self.failures.saturating_add(1);
        self.last_error = Some(error.into());
        reboot_after > 0 && self.failures >= reboot_after
    }

    pub fn record_success(&mut self, now: Instant) {
        self.failures = 0;
        self.skip = 0;
        self.last_error = None;
        self.last_read = Some(now);
    }

    /// Consume one backoff cycle if any remain.
    pub fn take_skip(&mut self) -> Option<u32> {
        if self.skip == 0 {
            return None;
        }
        self.skip -= 1;
        self.last_error = Some(format!("skip={}", self.skip + 1));
        Some(self.skip)
    }

    pub fn is_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_read
            .map_or(true, |last| now.saturating_duration_since(last) > interval)
    }
}

pub struct Camera {
    pub settings: CameraSettings,
    pub state: CameraState,
    source: Option<Box<dyn FrameSource>>,
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("name", &self.settings.name)
            .field("source", &self.source.as_ref().map(|s| s.describe()))
            .field("failures", &self.state.failures)
            .finish()
    }
}

impl Camera {
    /// Build the camera and its active source from settings.
    pub fn new(settings: CameraSettings) -> Result<Self> {
        let source: Option<Box<dyn FrameSource>> = match (&settings.file, &settings.http) {
            (Some(path), _) => Some(Box::new(FileSource::new(path.clone())?)),
            (None, Some(http)) => Some(Box::new(HttpSource::new(http.clone())?)),
            (None, None) => None,
        };
        if source.is_none() && settings.drop_folder.is_none() {
            return Err(anyhow!(
                "camera {} needs a url, a file or a drop folder",
                settings.name
            ));
        }
        Ok(Self::with_source(settings, source))
    }

    /// Use a caller-supplied source, e.g. a test double.
    pub fn with_source(settings: CameraSettings, source: Option<Box<dyn FrameSource>>) -> Self {
        Self {
            settings,
            state: CameraState::default(),
            source,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn has_drop_folder(&self) -> bool {
        self.settings.drop_folder.is_some()
    }

    pub fn has_active_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_local(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.is_local())
    }

    /// Check the drop folder for a new upload.
    ///
    /// An undecodable upload counts as a capture failure. Backoff only holds
    /// back active capture; the folder itself is still checked every cycle.
    pub fn poll(&mut self, now: Instant) -> CaptureOutcome {
        let Some(folder) = &self.settings.drop_folder else {
            return CaptureOutcome::Idle;
        };
        match folder.poll() {
            Ok(PollOutcome::Frame(frame)) => self.accept(frame, now),
            Ok(PollOutcome::Empty) => CaptureOutcome::Idle,
            Ok(PollOutcome::Unreadable(reason)) => {
                log::warn!("{}: {}", self.settings.name, reason);
                self.state
                    .record_failure("bad file", self.settings.reboot_after_failures);
                CaptureOutcome::Failed(reason)
            }
            Err(err) => {
                log::error!("{}: error scanning drop folder: {:#}", self.settings.name, err);
                CaptureOutcome::Failed(format!("{:#}", err))
            }
        }
    }

    /// One active capture attempt, honouring backoff.
    pub fn capture(&mut self, now: Instant) -> CaptureOutcome {
        if let Some(remaining) = self.state.take_skip() {
            return CaptureOutcome::Skipped(remaining);
        }
        let Some(source) = self.source.as_mut() else {
            return CaptureOutcome::Idle;
        };
        match source.fetch() {
            Ok(frame) => self.accept(frame, now),
            Err(err) => {
                let message = format!("{:#}", err);
                log::warn!("error with {}: {}", self.settings.name, message);
                if self
                    .state
                    .record_failure(message.clone(), self.settings.reboot_after_failures)
                {
                    if let Err(err) = source.reboot() {
                        log::error!("failed to reboot {}: {:#}", self.settings.name, err);
                    }
                }
                CaptureOutcome::Failed(message)
            }
        }
    }

    fn accept(&mut self, frame: Frame, now: Instant) -> CaptureOutcome {
        self.state.record_success(now);
        if self.state.last_hash.as_deref() == Some(frame.content_hash()) {
            self.state.last_error = Some("dup".to_string());
            return CaptureOutcome::Duplicate;
        }
        self.state.last_hash = Some(frame.content_hash().to_string());
        CaptureOutcome::Frame(frame)
    }
}
