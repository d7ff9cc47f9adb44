//! aicam - camera polling and household notification library
//!
//! This crate implements the detection-to-notification pipeline of a home
//! camera system.
//!
//! # Architecture
//!
//! Each cycle the scheduler hands every due camera to a worker, which runs the
//! whole per-camera pipeline:
//!
//! 1. **Capture**: HTTP snapshot, local file or drop-folder pickup, with
//!    exponential backoff on failure.
//! 2. **Detect**: a shared, read-only model set returns raw detections.
//! 3. **Filter**: thresholds, road line, zone rules and static exclusions.
//! 4. **Track**: overlap matching against the camera's short-term memory.
//! 5. **Prioritize**: a declarative rule book decides how much to care.
//! 6. **Notify**: snapshots, alerts, count publishing and home actions.
//!
//! # Module Structure
//!
//! - `scheduler`, `pool`: cycle loop and worker lanes
//! - `ingest`, `frame`, `camera`: capture sources and per-camera state
//! - `detect`, `filter`, `tracker`, `priority`: the core pipeline stages
//! - `pipeline`: glue that runs the stages for one camera-cycle
//! - `notify`, `snapshot`, `plates`, `publish`, `home`: outward collaborators
//! - Core geometry: `BoundingBox`, `overlap`

use serde::{Deserialize, Serialize};

pub mod camera;
pub mod config;
pub mod detect;
pub mod filter;
pub mod frame;
pub mod home;
pub mod ingest;
pub mod notify;
pub mod pipeline;
pub mod plates;
pub mod pool;
pub mod priority;
pub mod publish;
pub mod scheduler;
pub mod snapshot;
pub mod tracker;
pub mod watchdog;

pub use camera::{Camera, CameraSettings, CameraState, CaptureOutcome};
pub use config::AicamConfig;
pub use detect::{Detection, Detector, ModelSet, RawDetection, StubDetector};
pub use filter::{ExclusionSet, RoadLine, RoadPolicy, SpatialFilter, ZoneRule};
pub use frame::Frame;
pub use home::{ActionRequest, CachedHome, HomeAutomation, Mode, UnreachablePolicy};
pub use notify::{Notification, NotificationTransport, Notifier};
pub use pipeline::{CycleSummary, Pipeline};
pub use priority::{Decision, PriorityEngine, RuleBook};
pub use publish::CountSink;
pub use scheduler::{CycleReport, Scheduler, SchedulerSettings, Shutdown};
pub use snapshot::SnapshotStore;
pub use tracker::{TrackEntry, TrackTable, TRACK_MATCH_THRESHOLD};

// -------------------- Bounding Boxes --------------------

/// Axis-aligned box in normalized image coordinates (0..1).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> f32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.left + self.width / 2.0,
            y: self.top + self.height / 2.0,
        }
    }

    /// Grow the box by `margin` on every side, clamped to the unit square.
    pub fn expand(&self, margin: f32) -> Self {
        let left = (self.left - margin).max(0.0);
        let top = (self.top - margin).max(0.0);
        let right = (self.right() + margin).min(1.0);
        let bottom = (self.bottom() + margin).min(1.0);
        Self::new(left, top, right - left, bottom - top)
    }

    /// Smallest box containing both boxes.
    pub fn union(&self, other: &BoundingBox) -> Self {
        let left = self.left.min(other.left);
        let top = self.top.min(other.top);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Self::new(left, top, right - left, bottom - top)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Intersection area divided by union area.
///
/// Symmetric, 1.0 for identical non-empty boxes, 0.0 for disjoint boxes and
/// whenever either box has zero area.
pub fn overlap(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let area_a = a.area();
    let area_b = b.area();
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }
    let ix = (a.right().min(b.right()) - a.left.max(b.left)).max(0.0);
    let iy = (a.bottom().min(b.bottom()) - a.top.max(b.top)).max(0.0);
    let inter = ix * iy;
    if inter <= 0.0 {
        return 0.0;
    }
    let union = area_a + area_b - inter;
    (inter / union).clamp(0.0, 1.0)
}

/// Camera names are used in file names and MQTT topics.
pub fn sanitize_name(name: &str) -> String {
    name.replace(' ', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_is_symmetric() {
        let a = BoundingBox::new(0.1, 0.1, 0.4, 0.3);
        let b = BoundingBox::new(0.3, 0.2, 0.4, 0.4);
        assert_eq!(overlap(&a, &b), overlap(&b, &a));
        assert!(overlap(&a, &b) > 0.0);
    }

    #[test]
    fn overlap_of_box_with_itself_is_one() {
        let a = BoundingBox::new(0.4, 0.3, 0.2, 0.15);
        assert!((overlap(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn disjoint_and_touching_boxes_do_not_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 0.2, 0.2);
        let b = BoundingBox::new(0.5, 0.5, 0.2, 0.2);
        let touching = BoundingBox::new(0.2, 0.0, 0.2, 0.2);
        assert_eq!(overlap(&a, &b), 0.0);
        assert_eq!(overlap(&a, &touching), 0.0);
    }

    #[test]
    fn zero_area_box_never_overlaps() {
        let a = BoundingBox::new(0.3, 0.3, 0.0, 0.2);
        assert_eq!(overlap(&a, &a), 0.0);
    }

    #[test]
    fn half_overlap_matches_expected_ratio() {
        // Two unit-height boxes sharing one third of their union.
        let a = BoundingBox::new(0.0, 0.0, 0.2, 0.1);
        let b = BoundingBox::new(0.1, 0.0, 0.2, 0.1);
        assert!((overlap(&a, &b) - 1.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn expand_clamps_to_unit_square() {
        let a = BoundingBox::new(0.02, 0.9, 0.1, 0.08);
        let e = a.expand(0.05);
        assert_eq!(e.left, 0.0);
        assert!((e.bottom() - 1.0).abs() < 1e-6);
    }
}
