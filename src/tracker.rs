//! Short-term per-camera object memory.
//!
//! The track table collapses repeated sightings of one physical object across
//! consecutive cycles, so downstream logic sees "newly here" exactly once.
//! Each camera owns one table keyed by class; entries never move between
//! classes and a removed entry is never revived.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use crate::detect::Detection;
use crate::{overlap, BoundingBox};

/// Minimum overlap for a detection to continue an existing entry (inclusive).
pub const TRACK_MATCH_THRESHOLD: f32 = 0.5;

#[derive(Clone, Debug)]
pub struct TrackEntry {
    pub id: u64,
    pub class: String,
    pub bbox: BoundingBox,
    pub first_seen: Instant,
    pub last_seen: Instant,
    /// Number of consecutive cycles this entry has been matched.
    pub age: u32,
    pub priority: Option<i32>,
    pub priority_rule: Option<String>,
}

/// Result of matching one cycle's detections.
#[derive(Clone, Debug, Default)]
pub struct TrackUpdate {
    /// Indices into the detection slice of detections that created entries.
    pub new: Vec<usize>,
    /// Indices of detections that continued an existing entry.
    pub continued: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct TrackTable {
    entries: BTreeMap<String, Vec<TrackEntry>>,
    next_id: u64,
}

impl TrackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match every non-ignored detection against the entries of its class.
    ///
    /// The best overlap at or above [`TRACK_MATCH_THRESHOLD`] wins, with equal
    /// overlaps going to the lowest entry index. An entry is claimed by at
    /// most one detection per call.
    pub fn observe(&mut self, detections: &mut [Detection], now: Instant) -> TrackUpdate {
        let mut update = TrackUpdate::default();
        let mut claimed: BTreeSet<u64> = BTreeSet::new();

        for (idx, det) in detections.iter_mut().enumerate() {
            if det.is_ignored() {
                continue;
            }
            let entries = self.entries.entry(det.class.clone()).or_default();

            let mut best: Option<(usize, f32)> = None;
            for (slot, entry) in entries.iter().enumerate() {
                if claimed.contains(&entry.id) {
                    continue;
                }
                let iou = overlap(&entry.bbox, &det.bbox);
                log::trace!("overlap {}:{} entry {} = {:.3}", det.camera, det.class, entry.id, iou);
                if iou < TRACK_MATCH_THRESHOLD {
                    continue;
                }
                if best.map_or(true, |(_, b)| iou > b) {
                    best = Some((slot, iou));
                }
            }

            match best {
                Some((slot, iou)) => {
                    let entry = &mut entries[slot];
                    entry.bbox = det.bbox;
                    entry.last_seen = now;
                    entry.age += 1;
                    claimed.insert(entry.id);

                    det.overlap = Some(iou);
                    det.track_id = Some(entry.id);
                    det.track_age = Some(entry.age);
                    if det.priority.is_none() {
                        det.priority = entry.priority;
                        det.priority_rule = entry.priority_rule.clone();
                    }
                    update.continued.push(idx);
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    entries.push(TrackEntry {
                        id,
                        class: det.class.clone(),
                        bbox: det.bbox,
                        first_seen: now,
                        last_seen: now,
                        age: 0,
                        priority: None,
                        priority_rule: None,
                    });
                    claimed.insert(id);
                    det.track_id = Some(id);
                    det.track_age = Some(0);
                    update.new.push(idx);
                }
            }
        }
        update
    }

    /// Store computed priorities on entries that do not have one yet.
    pub fn record_priorities(&mut self, detections: &[Detection]) {
        for det in detections {
            let (Some(id), Some(priority)) = (det.track_id, det.priority) else {
                continue;
            };
            let Some(entries) = self.entries.get_mut(&det.class) else {
                continue;
            };
            if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
                if entry.priority.is_none() {
                    entry.priority = Some(priority);
                    entry.priority_rule = det.priority_rule.clone();
                }
            }
        }
    }

    /// Remove entries unseen for longer than `window` and return them.
    pub fn expire(&mut self, now: Instant, window: Duration) -> Vec<TrackEntry> {
        let mut expired = Vec::new();
        for entries in self.entries.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = entries
                .drain(..)
                .partition(|e| now.saturating_duration_since(e.last_seen) > window);
            *entries = kept;
            expired.extend(gone);
        }
        self.entries.retain(|_, entries| !entries.is_empty());
        expired
    }

    pub fn entries(&self, class: &str) -> &[TrackEntry] {
        self.entries.get(class).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Classes of expired entries with no valid detection of that class this cycle.
pub fn departed_classes(expired: &[TrackEntry], detections: &[Detection]) -> BTreeSet<String> {
    let present: BTreeSet<&str> = detections
        .iter()
        .filter(|d| !d.is_ignored())
        .map(|d| d.class.as_str())
        .collect();
    expired
        .iter()
        .filter(|e| !present.contains(e.class.as_str()))
        .map(|e| e.class.clone())
        .collect()
}
