//! Everything that happens to a frame after capture.
//!
//! `Pipeline::process` runs in the worker that captured the frame, with the
//! camera moved into it, so per-camera state is updated without locking.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, Timelike};

use crate::camera::Camera;
use crate::detect::{Detection, ModelSet, RawDetection};
use crate::filter::Thresholds;
use crate::frame::Frame;
use crate::home::{ActionBook, CachedHome, HomeAutomation, Mode, StaticHome, UnreachablePolicy};
use crate::notify::{departure_message, departure_priority, Notifier};
use crate::priority::{decide, Decision, DecisionInput, PriorityContext, PriorityEngine, SUPPRESSION_FLOOR};
use crate::publish::{publish_changed_counts, CountSink, MemoryCountSink, DEFAULT_COUNTED_CLASSES};
use crate::snapshot::SnapshotStore;
use crate::tracker::{departed_classes, TrackEntry};

pub const DEFAULT_TRACK_EXPIRY: Duration = Duration::from_secs(60);
pub const DEFAULT_WARMUP_CYCLES: u64 = 2;
pub const DEFAULT_DEPARTURE_MIN_AGE: u32 = 4;
pub const DEFAULT_DEPARTURE_MIN_LIFETIME: Duration = Duration::from_secs(120);

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub track_expiry: Duration,
    /// Cycles a camera must process before it may notify.
    pub warmup_cycles: u64,
    pub departure_min_age: u32,
    pub departure_min_lifetime: Duration,
    pub counted_classes: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            track_expiry: DEFAULT_TRACK_EXPIRY,
            warmup_cycles: DEFAULT_WARMUP_CYCLES,
            departure_min_age: DEFAULT_DEPARTURE_MIN_AGE,
            departure_min_lifetime: DEFAULT_DEPARTURE_MIN_LIFETIME,
            counted_classes: DEFAULT_COUNTED_CLASSES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Outcome of one processed frame.
#[derive(Clone, Debug, Default)]
pub struct CycleSummary {
    pub camera: String,
    pub prediction_time: Duration,
    pub detections: Vec<String>,
    pub new_objects: BTreeSet<String>,
    pub departed: BTreeSet<String>,
    pub decision: Option<Decision>,
    pub notified: bool,
    pub snapshot: bool,
}

impl CycleSummary {
    /// `camera=[class:prob:...,...]` as used in the cycle log line.
    pub fn line(&self) -> String {
        format!("{}=[{}]", self.camera, self.detections.join(","))
    }
}

pub struct Pipeline {
    models: ModelSet,
    thresholds: Thresholds,
    engine: PriorityEngine,
    home: CachedHome,
    actions: ActionBook,
    notifier: Notifier,
    snapshots: SnapshotStore,
    counts: Arc<dyn CountSink>,
    settings: PipelineSettings,
}

impl Pipeline {
    /// A pipeline with a fixed `home` mode, no actions and counts kept in memory.
    pub fn new(
        models: ModelSet,
        thresholds: Thresholds,
        engine: PriorityEngine,
        notifier: Notifier,
        snapshots: SnapshotStore,
    ) -> Self {
        Self {
            models,
            thresholds,
            engine,
            home: CachedHome::new(
                Box::new(StaticHome::new(Mode::Home)),
                UnreachablePolicy::Permissive,
                Mode::Home,
            ),
            actions: ActionBook::default(),
            notifier,
            snapshots,
            counts: Arc::new(MemoryCountSink::new()),
            settings: PipelineSettings::default(),
        }
    }

    pub fn with_home(mut self, home: CachedHome) -> Self {
        self.home = home;
        self
    }

    pub fn with_actions(mut self, actions: ActionBook) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_counts(mut self, counts: Arc<dyn CountSink>) -> Self {
        self.counts = counts;
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Predict, filter, track, prioritise and act on one fresh frame.
    pub fn process(&self, camera: &mut Camera, frame: Frame, now: Instant) -> CycleSummary {
        let at = Local::now();
        let name = camera.settings.name.clone();
        camera.state.processed_cycles += 1;

        let started = Instant::now();
        let raw = match self.models.predict(&frame, camera.settings.vehicle_check) {
            Ok(raw) => raw,
            Err(err) => {
                log::error!("{}: prediction failed: {:#}", name, err);
                Vec::new()
            }
        };
        let prediction_time = started.elapsed();

        let mut detections =
            camera
                .settings
                .filter
                .apply(&name, raw, &self.thresholds, &camera.state.objects);
        let expired = camera.state.tracks.expire(now, self.settings.track_expiry);
        let update = camera.state.tracks.observe(&mut detections, now);

        let valid: BTreeSet<String> = detections
            .iter()
            .filter(|d| !d.is_ignored())
            .map(|d| d.class.clone())
            .collect();
        let new_objects: BTreeSet<String> = update
            .new
            .iter()
            .map(|&idx| detections[idx].class.clone())
            .collect();
        let departed = departed_classes(&expired, &detections);

        let annotated = self.snapshots.annotate(
            &frame,
            &detections,
            &expired,
            camera.settings.filter.road.as_ref(),
        );

        let worth_announcing = expired
            .iter()
            .filter(|e| departed.contains(&e.class))
            .any(|e| e.priority.map_or(false, |p| p > SUPPRESSION_FLOOR));
        if worth_announcing {
            log::info!(
                "{} current={}, prior={}, departed={}",
                name,
                join(&valid),
                join(&camera.state.objects),
                join(&departed)
            );
            let classes: Vec<String> = departed.iter().cloned().collect();
            if let Err(err) = self.snapshots.save_departed(&name, &classes, &annotated, at) {
                log::warn!("{}: failed to save departed snapshot: {:#}", name, err);
            }
        }
        self.announce_departures(camera, &expired, &annotated, now);

        self.actions.fire(&self.home, &name, &valid, &new_objects);

        let ctx = self.context(&name, &valid, at.hour());
        let cycle_priority = self.engine.evaluate(&mut detections, &ctx);
        camera.state.tracks.record_priorities(&detections);

        publish_changed_counts(
            self.counts.as_ref(),
            &name,
            &self.settings.counted_classes,
            &detections,
            &mut camera.state.counts,
        );

        let decision = decide(DecisionInput {
            cycle_priority,
            new_objects: update.new.len(),
            prior_priority: camera.state.prior_priority,
            processed_cycles: camera.state.processed_cycles,
            warmup_cycles: self.settings.warmup_cycles,
            local_source: camera.is_local(),
        });
        if !decision.warmed_up && !new_objects.is_empty() {
            log::info!("{}: skipping notifications until after warm up", name);
        }

        let notified = decision.notify
            && self.notifier.notify(
                &camera.settings,
                &detections,
                &annotated,
                decision.priority,
                &self.home,
                &self.actions,
            );

        let summaries: Vec<String> = detections.iter().map(Detection::summary).collect();

        if decision.snapshot {
            let classes: Vec<String> = if valid.is_empty() {
                vec!["none".to_string()]
            } else {
                valid.iter().cloned().collect()
            };
            if let Some((prior, captured)) = camera.state.prior_frame.take() {
                if let Err(err) = self.snapshots.save_prior(&name, &classes, &prior, captured) {
                    log::warn!("{}: failed to save prior frame: {:#}", name, err);
                }
            }
            let mut record = detections;
            record.extend(expired.iter().map(|e| departed_detection(e, &name)));
            match self
                .snapshots
                .save(&name, &classes, &frame, &record, &annotated, at)
            {
                Ok(path) => {
                    log::debug!("{}: saved {}", name, path.display());
                    camera.state.last_snapshot = Some(now);
                }
                Err(err) => log::warn!("{}: failed to save snapshot: {:#}", name, err),
            }
        } else {
            camera.state.prior_frame = Some((frame, at));
        }

        camera.state.objects = valid;
        camera.state.prior_priority = decision.priority;

        CycleSummary {
            camera: name,
            prediction_time,
            detections: summaries,
            new_objects,
            departed,
            decision: Some(decision),
            notified,
            snapshot: decision.snapshot,
        }
    }

    fn context<'a>(&self, camera: &'a str, valid: &BTreeSet<String>, hour: u32) -> PriorityContext<'a> {
        if valid.is_empty() {
            return PriorityContext {
                camera,
                mode: Mode::Home,
                closed_gates: BTreeSet::new(),
                hour,
            };
        }
        let mode = match self.home.current_mode() {
            Ok(mode) => mode,
            Err(err) => {
                log::warn!("{}: no home mode: {:#}", camera, err);
                Mode::Home
            }
        };
        PriorityContext {
            camera,
            mode,
            closed_gates: self.home.closed_gates(valid.iter().map(String::as_str)),
            hour,
        }
    }

    fn announce_departures(
        &self,
        camera: &Camera,
        expired: &[TrackEntry],
        annotated: &image::RgbImage,
        now: Instant,
    ) {
        let warmed_up = camera.state.processed_cycles > self.settings.warmup_cycles;
        let mut long_lived = Vec::new();
        for entry in expired {
            log::info!("{}", departure_message(&camera.settings.display_name, entry));
            let lifetime = now.saturating_duration_since(entry.first_seen);
            if entry.age > self.settings.departure_min_age
                && lifetime > self.settings.departure_min_lifetime
            {
                long_lived.push(entry.clone());
            }
        }
        if long_lived.is_empty() {
            return;
        }
        let priority = departure_priority(&long_lived);
        if !warmed_up || priority <= SUPPRESSION_FLOOR {
            log::info!(
                "{}: not announcing departures (priority={}, warmed up={})",
                camera.settings.name,
                priority,
                warmed_up
            );
            return;
        }
        self.notifier
            .notify_departed(&camera.settings, &long_lived, annotated, priority, &self.home);
    }
}

/// Expired track as a record in the snapshot JSON.
fn departed_detection(entry: &TrackEntry, camera: &str) -> Detection {
    let mut det = Detection::from_raw(RawDetection::new(entry.class.clone(), 0.0, entry.bbox), camera);
    det.departed = true;
    det.track_id = Some(entry.id);
    det.track_age = Some(entry.age);
    det.priority = entry.priority;
    det.priority_rule = entry.priority_rule.clone();
    det.mark_ignored("departed");
    det
}

fn join(classes: &BTreeSet<String>) -> String {
    classes.iter().cloned().collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraSettings;
    use crate::detect::StubDetector;
    use crate::notify::{MemoryTransport, Sounds};
    use crate::priority::RuleBook;
    use crate::BoundingBox;
    use std::collections::BTreeMap;

    struct Rig {
        _dir: tempfile::TempDir,
        stub: Arc<StubDetector>,
        sent: Arc<MemoryTransport>,
        counts: Arc<MemoryCountSink>,
        pipeline: Pipeline,
    }

    fn rig(warmup: u64) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubDetector::new("color"));
        let sent = Arc::new(MemoryTransport::new());
        let counts = Arc::new(MemoryCountSink::new());
        let book: RuleBook = toml::from_str(
            r#"
            [classes]
            person = 1
            vehicle = 0
            "#,
        )
        .unwrap();
        let pipeline = Pipeline::new(
            ModelSet::new(stub.clone(), stub.clone(), None),
            Thresholds::new(0.6),
            PriorityEngine::new(book),
            Notifier::new(Box::new(sent.clone()), Sounds::default()),
            SnapshotStore::new(dir.path(), BTreeMap::new()),
        )
        .with_counts(counts.clone())
        .with_settings(PipelineSettings {
            warmup_cycles: warmup,
            ..PipelineSettings::default()
        });
        Rig {
            _dir: dir,
            stub,
            sent,
            counts,
            pipeline,
        }
    }

    fn camera() -> Camera {
        Camera::with_source(CameraSettings::new("driveway"), None)
    }

    fn frame() -> Frame {
        Frame::from_image(
            image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(32, 24, image::Rgb([90, 30, 10]))),
            "test",
        )
    }

    fn person() -> RawDetection {
        RawDetection::new("person", 0.9, BoundingBox::new(0.4, 0.5, 0.1, 0.3))
    }

    #[test]
    fn notifies_only_after_warm_up_and_only_on_new_objects() {
        let rig = rig(1);
        let mut cam = camera();
        let now = Instant::now();

        rig.stub.push(vec![person()]);
        let first = rig.pipeline.process(&mut cam, frame(), now);
        assert!(!first.notified);
        assert_eq!(cam.state.prior_priority, crate::priority::NEVER);

        let elsewhere = RawDetection::new("person", 0.9, BoundingBox::new(0.05, 0.6, 0.1, 0.3));
        rig.stub.push(vec![elsewhere.clone()]);
        let second = rig.pipeline.process(&mut cam, frame(), now + Duration::from_secs(1));
        assert!(second.notified);
        assert_eq!(rig.sent.sent().len(), 1);
        assert_eq!(rig.sent.sent()[0].message, "person near driveway");

        rig.stub.push(vec![elsewhere]);
        let third = rig.pipeline.process(&mut cam, frame(), now + Duration::from_secs(2));
        assert!(!third.notified);
        assert!(third.new_objects.is_empty());
        assert_eq!(rig.sent.sent().len(), 1);
        assert!(!third.snapshot);
    }

    #[test]
    fn prediction_error_yields_empty_cycle() {
        let rig = rig(0);
        let mut cam = camera();
        rig.stub.push_error("model crashed");
        let summary = rig.pipeline.process(&mut cam, frame(), Instant::now());
        assert!(summary.detections.is_empty());
        assert_eq!(summary.decision.unwrap().priority, crate::priority::NEVER);
        assert_eq!(cam.state.processed_cycles, 1);
        assert!(cam.state.prior_frame.is_some());
    }

    #[test]
    fn counts_publish_on_change() {
        let rig = rig(0);
        let mut cam = camera();
        let now = Instant::now();
        rig.stub.push(vec![person()]);
        rig.pipeline.process(&mut cam, frame(), now);
        rig.stub.push(vec![person()]);
        rig.pipeline.process(&mut cam, frame(), now + Duration::from_secs(1));
        let person_counts: Vec<usize> = rig
            .counts
            .published()
            .into_iter()
            .filter(|(topic, _)| topic == "driveway/person/count")
            .map(|(_, n)| n)
            .collect();
        assert_eq!(person_counts, vec![1]);
    }

    #[test]
    fn snapshot_saves_prior_frame_and_line_formats() {
        let rig = rig(0);
        let mut cam = camera();
        let now = Instant::now();
        rig.stub.push(vec![]);
        rig.pipeline.process(&mut cam, frame(), now);
        assert!(cam.state.prior_frame.is_some());

        rig.stub.push(vec![person()]);
        let summary = rig.pipeline.process(&mut cam, frame(), now + Duration::from_secs(1));
        assert!(summary.snapshot);
        assert!(cam.state.prior_frame.is_none());
        assert!(cam.state.last_snapshot.is_some());
        assert!(summary.line().starts_with("driveway=[person:0.90"));

        let day = rig.pipeline.snapshots().root().join("today");
        let names: Vec<String> = std::fs::read_dir(&day)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("-driveway-person-prior.jpg")));
        assert!(names.iter().any(|n| n.ends_with("-driveway-person.json")));
    }

    #[test]
    fn long_lived_departure_is_announced() {
        let rig = rig(0);
        let mut cam = camera();
        let start = Instant::now();
        for i in 0..6 {
            rig.stub.push(vec![person()]);
            rig.pipeline
                .process(&mut cam, frame(), start + Duration::from_secs(30 * i));
        }
        rig.stub.push(vec![]);
        let gone = rig
            .pipeline
            .process(&mut cam, frame(), start + Duration::from_secs(150 + 61));
        assert!(gone.departed.contains("person"));
        let sent = rig.sent.sent();
        let last = sent.last().unwrap();
        assert!(last
            .message
            .starts_with("person departed from driveway after being seen 5 times"));
        assert_eq!(last.priority, 1);
    }
}
