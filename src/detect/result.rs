use serde::{Deserialize, Serialize};

use crate::{BoundingBox, Point};

/// Model output before any pipeline stage has looked at it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub class: String,
    pub probability: f32,
    pub bbox: BoundingBox,
}

impl RawDetection {
    pub fn new(class: impl Into<String>, probability: f32, bbox: BoundingBox) -> Self {
        Self {
            class: class.into(),
            probability,
            bbox,
        }
    }
}

/// One detection flowing through a camera-cycle.
///
/// Stages only ever add annotations, in pipeline order: the filter sets
/// `ignore`/`road_y`, the tracker sets `overlap`/`track_id`/`track_age`, the
/// priority engine sets `priority`/`priority_rule`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    pub probability: f32,
    pub bbox: BoundingBox,
    pub center: Point,
    pub camera: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub road_y: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlap: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_rule: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub departed: bool,
}

impl Detection {
    pub fn from_raw(raw: RawDetection, camera: &str) -> Self {
        Self {
            center: raw.bbox.center(),
            class: raw.class,
            probability: raw.probability,
            bbox: raw.bbox,
            camera: camera.to_string(),
            ignore: None,
            road_y: None,
            overlap: None,
            track_id: None,
            track_age: None,
            priority: None,
            priority_rule: None,
            departed: false,
        }
    }

    pub fn is_ignored(&self) -> bool {
        self.ignore.is_some()
    }

    /// Mark ignored unless an earlier stage already did.
    pub fn mark_ignored(&mut self, reason: impl Into<String>) {
        if self.ignore.is_none() {
            self.ignore = Some(reason.into());
        }
    }

    /// True when the tracker matched this detection to an existing entry.
    pub fn is_continuation(&self) -> bool {
        self.overlap.is_some()
    }

    /// Compact log form, e.g. `vehicle:0.80:iou=0.97:p=0:pt=class vehicle:age=1`.
    pub fn summary(&self) -> String {
        let mut out = format!("{}:{:.2}", self.class, self.probability);
        if let Some(iou) = self.overlap {
            out.push_str(&format!(":iou={:.2}", iou));
        }
        if let Some(reason) = &self.ignore {
            out.push_str(&format!(":ignore={}", reason));
        }
        if let Some(p) = self.priority {
            out.push_str(&format!(":p={}", p));
        }
        if let Some(rule) = &self.priority_rule {
            out.push_str(&format!(":pt={}", rule));
        }
        if let Some(age) = self.track_age {
            out.push_str(&format!(":age={}", age));
        }
        out
    }
}
