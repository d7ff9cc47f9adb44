//! Per-camera spatial and class filtering.
//!
//! Stages run in a fixed order: probability threshold, "ignore all", road
//! line, zone rules, static exclusions. A stage only ever adds an `ignore`
//! reason; nothing downstream clears one.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::detect::{Detection, RawDetection};
use crate::{overlap, BoundingBox, Point};

pub const DEFAULT_STICKY_THRESHOLD: f32 = 0.4;
pub const EXCLUSION_MATCH_THRESHOLD: f32 = 0.5;
pub const DEFAULT_ROAD_CLASSES: [&str; 4] = ["vehicle", "person", "dog", "package"];

/// Probability cut-offs shared by every camera.
#[derive(Clone, Debug)]
pub struct Thresholds {
    pub default: f32,
    pub per_class: BTreeMap<String, f32>,
    /// Lower bar for classes already active on the camera.
    pub sticky: f32,
}

impl Thresholds {
    pub fn new(default: f32) -> Self {
        Self {
            default,
            per_class: BTreeMap::new(),
            sticky: DEFAULT_STICKY_THRESHOLD,
        }
    }

    pub fn for_class(&self, class: &str) -> f32 {
        self.per_class.get(class).copied().unwrap_or(self.default)
    }

    pub fn keep(&self, raw: &RawDetection, active: &BTreeSet<String>) -> bool {
        raw.probability > self.for_class(&raw.class)
            || (active.contains(&raw.class) && raw.probability > self.sticky)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoadPolicy {
    #[default]
    Ignore,
    Relabel,
}

/// Which side of the road line is "beyond" it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FarSide {
    /// Center y smaller than the boundary (higher up in the image).
    #[default]
    Above,
    Below,
}

/// Boundary polyline in normalized coordinates, sorted by x.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RoadLine {
    pub points: Vec<Point>,
    #[serde(default)]
    pub far_side: FarSide,
    #[serde(default)]
    pub policy: RoadPolicy,
    #[serde(default = "default_road_classes")]
    pub classes: Vec<String>,
}

fn default_road_classes() -> Vec<String> {
    DEFAULT_ROAD_CLASSES.iter().map(|c| c.to_string()).collect()
}

impl RoadLine {
    pub fn new(points: Vec<Point>) -> Self {
        Self {
            points,
            far_side: FarSide::Above,
            policy: RoadPolicy::Ignore,
            classes: default_road_classes(),
        }
    }

    pub fn with_policy(mut self, policy: RoadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.points.len() < 2 {
            return Err(anyhow!("road line needs at least two points"));
        }
        if self.points.windows(2).any(|w| w[1].x < w[0].x) {
            return Err(anyhow!("road line points must be sorted by x"));
        }
        Ok(())
    }

    /// Boundary y at `x`, linearly interpolated; flat outside the polyline.
    pub fn boundary_at(&self, x: f32) -> f32 {
        let (Some(first), Some(last)) = (self.points.first(), self.points.last()) else {
            return 0.0;
        };
        if x <= first.x {
            return first.y;
        }
        if x >= last.x {
            return last.y;
        }
        for seg in self.points.windows(2) {
            let (a, b) = (seg[0], seg[1]);
            if x >= a.x && x <= b.x {
                if b.x == a.x {
                    return a.y;
                }
                return a.y + (b.y - a.y) * (x - a.x) / (b.x - a.x);
            }
        }
        last.y
    }

    pub fn is_beyond(&self, center: Point) -> bool {
        let boundary = self.boundary_at(center.x);
        match self.far_side {
            FarSide::Above => center.y < boundary,
            FarSide::Below => center.y > boundary,
        }
    }
}

/// Declarative per-camera special case.
///
/// `max_*` bounds are exclusive, `min_*` bounds inclusive. Every bound that is
/// set must hold. An empty class list applies to every class.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ZoneRule {
    pub reason: String,
    #[serde(default)]
    pub classes: Vec<String>,
    pub max_bottom: Option<f32>,
    pub min_bottom: Option<f32>,
    pub max_center_x: Option<f32>,
    pub min_center_x: Option<f32>,
    pub max_center_y: Option<f32>,
    pub min_center_y: Option<f32>,
}

impl ZoneRule {
    pub fn matches(&self, det: &Detection) -> bool {
        if !self.classes.is_empty() && !self.classes.iter().any(|c| c == &det.class) {
            return false;
        }
        let bottom = det.bbox.bottom();
        let c = det.center;
        below(bottom, self.max_bottom)
            && at_least(bottom, self.min_bottom)
            && below(c.x, self.max_center_x)
            && at_least(c.x, self.min_center_x)
            && below(c.y, self.max_center_y)
            && at_least(c.y, self.min_center_y)
    }
}

fn below(value: f32, bound: Option<f32>) -> bool {
    bound.map_or(true, |b| value < b)
}

fn at_least(value: f32, bound: Option<f32>) -> bool {
    bound.map_or(true, |b| value >= b)
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ExclusionRegion {
    #[serde(flatten)]
    pub bbox: BoundingBox,
    pub comment: Option<String>,
}

/// Static regions per class for one camera; `*` applies to every class.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct ExclusionSet {
    regions: BTreeMap<String, Vec<ExclusionRegion>>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, class: impl Into<String>, bbox: BoundingBox, comment: Option<String>) {
        self.regions
            .entry(class.into())
            .or_default()
            .push(ExclusionRegion { bbox, comment });
    }

    /// Parse the excludes file: `{ camera: { class: [region, ...] } }`.
    pub fn load_file(path: &Path) -> Result<BTreeMap<String, ExclusionSet>> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read excludes file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid excludes file {}", path.display()))
    }

    pub fn is_empty(&self) -> bool {
        self.regions.values().all(Vec::is_empty)
    }

    /// Reason for the first region covering `bbox`, wildcard regions first.
    pub fn matching_reason(&self, class: &str, bbox: &BoundingBox) -> Option<String> {
        ["*", class]
            .iter()
            .filter_map(|key| self.regions.get(*key))
            .flatten()
            .find(|region| overlap(&region.bbox, bbox) >= EXCLUSION_MATCH_THRESHOLD)
            .map(|region| region.comment.clone().unwrap_or_else(|| "static".to_string()))
    }
}

/// The spatial rules configured for one camera.
#[derive(Clone, Debug, Default)]
pub struct SpatialFilter {
    pub ignore_all: bool,
    pub road: Option<RoadLine>,
    pub zones: Vec<ZoneRule>,
    pub excludes: ExclusionSet,
}

impl SpatialFilter {
    /// Threshold raw detections and annotate the survivors.
    pub fn apply(
        &self,
        camera: &str,
        raw: Vec<RawDetection>,
        thresholds: &Thresholds,
        active: &BTreeSet<String>,
    ) -> Vec<Detection> {
        let mut detections: Vec<Detection> = raw
            .into_iter()
            .filter(|r| thresholds.keep(r, active))
            .map(|r| Detection::from_raw(r, camera))
            .collect();

        for det in detections.iter_mut() {
            if self.ignore_all {
                det.mark_ignored("ignore all");
            }
            if let Some(road) = &self.road {
                det.road_y = Some(road.boundary_at(det.center.x));
                if road.classes.iter().any(|c| c == &det.class) && road.is_beyond(det.center) {
                    match road.policy {
                        RoadPolicy::Ignore => det.mark_ignored("road"),
                        RoadPolicy::Relabel => det.class = format!("{}_road", det.class),
                    }
                }
            }
            if let Some(zone) = self.zones.iter().find(|z| z.matches(det)) {
                det.mark_ignored(zone.reason.clone());
            }
            if !det.is_ignored() {
                if let Some(reason) = self.excludes.matching_reason(&det.class, &det.bbox) {
                    det.mark_ignored(reason);
                }
            }
        }
        detections
    }
}
