//! Declarative notification priorities.
//!
//! Every detection gets a priority and the name of the rule that produced it.
//! The first applicable stage wins: carry-forward, override rules, the mode
//! table, the class table, then the neutral default. Floor rules may only
//! raise the result. The cycle priority is the maximum over the detections
//! that are not ignored, raised further by combination rules.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::detect::Detection;
use crate::home::Mode;

/// Nothing to report.
pub const NEVER: i32 = -4;
/// Priorities at or below this never notify or snapshot.
pub const SUPPRESSION_FLOOR: i32 = -3;
pub const NEUTRAL: i32 = 0;
pub const INTERESTING: i32 = 1;
pub const URGENT: i32 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStage {
    /// Replaces the table lookup when it matches.
    #[default]
    Override,
    /// Raises an already assigned priority.
    Floor,
}

/// Local-time hour window; wraps past midnight when `start > end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct HourRange {
    pub start: u32,
    pub end: u32,
}

impl HourRange {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

/// One predicate-to-priority entry. Empty lists match anything.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct PriorityRule {
    pub name: String,
    #[serde(default)]
    pub stage: RuleStage,
    #[serde(default)]
    pub cameras: Vec<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub modes: Vec<Mode>,
    /// `Some(true)` applies only while the home gate for the class is closed.
    pub gate_closed: Option<bool>,
    /// Classes that must be present in the same cycle.
    #[serde(default)]
    pub with: Vec<String>,
    /// Classes that must be absent from the same cycle.
    #[serde(default)]
    pub without: Vec<String>,
    pub min_probability: Option<f32>,
    pub hours: Option<HourRange>,
    pub priority: i32,
}

/// Raises the cycle priority when all `classes` are present together.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ComboRule {
    pub name: String,
    #[serde(default)]
    pub cameras: Vec<String>,
    pub classes: Vec<String>,
    pub priority: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct RuleBook {
    #[serde(default)]
    pub rules: Vec<PriorityRule>,
    #[serde(default)]
    pub modes: BTreeMap<Mode, BTreeMap<String, i32>>,
    #[serde(default)]
    pub classes: BTreeMap<String, i32>,
    #[serde(default)]
    pub combos: Vec<ComboRule>,
}

impl RuleBook {
    /// Reject priorities out of range and rules naming unknown cameras.
    pub fn validate(&self, cameras: &BTreeSet<String>) -> Result<()> {
        let check_priority = |what: &str, p: i32| {
            if (NEVER..=URGENT).contains(&p) {
                Ok(())
            } else {
                Err(anyhow!("{} priority {} outside {}..={}", what, p, NEVER, URGENT))
            }
        };
        let check_cameras = |what: &str, names: &[String]| {
            match names.iter().find(|c| !cameras.contains(*c)) {
                Some(unknown) => Err(anyhow!("{} references unknown camera {}", what, unknown)),
                None => Ok(()),
            }
        };
        for rule in &self.rules {
            let what = format!("rule {}", rule.name);
            check_priority(&what, rule.priority)?;
            check_cameras(&what, &rule.cameras)?;
            if let Some(hours) = rule.hours {
                if hours.start > 23 || hours.end > 24 {
                    return Err(anyhow!("{} has invalid hours", what));
                }
            }
        }
        for combo in &self.combos {
            let what = format!("combo {}", combo.name);
            check_priority(&what, combo.priority)?;
            check_cameras(&what, &combo.cameras)?;
            if combo.classes.is_empty() {
                return Err(anyhow!("{} lists no classes", what));
            }
        }
        for (mode, table) in &self.modes {
            for (class, p) in table {
                check_priority(&format!("mode {} class {}", mode, class), *p)?;
            }
        }
        for (class, p) in &self.classes {
            check_priority(&format!("class {}", class), *p)?;
        }
        Ok(())
    }
}

/// Per-cycle inputs that do not come from the detections themselves.
#[derive(Clone, Debug)]
pub struct PriorityContext<'a> {
    pub camera: &'a str,
    pub mode: Mode,
    /// Classes whose home-automation gate says "do not notify".
    pub closed_gates: BTreeSet<String>,
    /// Local hour of day, 0..24.
    pub hour: u32,
}

struct Scene<'a> {
    ctx: &'a PriorityContext<'a>,
    present: BTreeSet<&'a str>,
}

impl PriorityRule {
    fn matches(&self, det: &Detection, scene: &Scene<'_>) -> bool {
        let ctx = scene.ctx;
        if !self.cameras.is_empty() && !self.cameras.iter().any(|c| c == ctx.camera) {
            return false;
        }
        if !self.classes.is_empty() && !self.classes.iter().any(|c| c == &det.class) {
            return false;
        }
        if !self.modes.is_empty() && !self.modes.contains(&ctx.mode) {
            return false;
        }
        if let Some(closed) = self.gate_closed {
            if ctx.closed_gates.contains(&det.class) != closed {
                return false;
            }
        }
        if !self.with.iter().all(|c| scene.present.contains(c.as_str())) {
            return false;
        }
        if self.without.iter().any(|c| scene.present.contains(c.as_str())) {
            return false;
        }
        if let Some(min) = self.min_probability {
            if det.probability <= min {
                return false;
            }
        }
        if let Some(hours) = self.hours {
            if !hours.contains(ctx.hour) {
                return false;
            }
        }
        true
    }
}

pub struct PriorityEngine {
    book: RuleBook,
}

impl PriorityEngine {
    pub fn new(book: RuleBook) -> Self {
        Self { book }
    }

    pub fn rules(&self) -> &RuleBook {
        &self.book
    }

    /// Annotate every detection and return the cycle priority.
    pub fn evaluate(&self, detections: &mut [Detection], ctx: &PriorityContext<'_>) -> i32 {
        let present: BTreeSet<String> = detections
            .iter()
            .filter(|d| !d.is_ignored())
            .map(|d| d.class.clone())
            .collect();
        let scene = Scene {
            ctx,
            present: present.iter().map(String::as_str).collect(),
        };

        for det in detections.iter_mut() {
            if det.is_ignored() {
                if det.priority.is_none() {
                    det.priority = Some(NEVER);
                    det.priority_rule = Some("ignored".to_string());
                }
                continue;
            }
            if det.is_continuation() && det.priority.is_some() {
                continue;
            }
            let (mut priority, mut rule) = self.base_priority(det, &scene);
            for floor in self
                .book
                .rules
                .iter()
                .filter(|r| r.stage == RuleStage::Floor)
            {
                if floor.priority > priority && floor.matches(det, &scene) {
                    priority = floor.priority;
                    rule = floor.name.clone();
                }
            }
            det.priority = Some(priority);
            det.priority_rule = Some(rule);
        }

        let mut cycle = detections
            .iter()
            .filter(|d| !d.is_ignored())
            .filter_map(|d| d.priority)
            .max()
            .unwrap_or(NEVER);

        let undeparted: BTreeSet<&str> = detections
            .iter()
            .filter(|d| !d.is_ignored() && !d.departed)
            .map(|d| d.class.as_str())
            .collect();
        for combo in &self.book.combos {
            if !combo.cameras.is_empty() && !combo.cameras.iter().any(|c| c == ctx.camera) {
                continue;
            }
            if combo.classes.iter().all(|c| undeparted.contains(c.as_str()))
                && combo.priority > cycle
            {
                log::debug!("{} combo {} raises priority to {}", ctx.camera, combo.name, combo.priority);
                cycle = combo.priority;
            }
        }
        cycle
    }

    fn base_priority(&self, det: &Detection, scene: &Scene<'_>) -> (i32, String) {
        if let Some(rule) = self
            .book
            .rules
            .iter()
            .filter(|r| r.stage == RuleStage::Override)
            .find(|r| r.matches(det, scene))
        {
            return (rule.priority, rule.name.clone());
        }
        let mode = scene.ctx.mode;
        if let Some(p) = self.book.modes.get(&mode).and_then(|t| t.get(&det.class)) {
            return (*p, format!("mode {}", mode));
        }
        if let Some(p) = self.book.classes.get(&det.class) {
            return (*p, format!("class {}", det.class));
        }
        (NEUTRAL, "default".to_string())
    }
}

/// What to do with one camera-cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    /// Priority to remember as the camera's previous priority.
    pub priority: i32,
    pub notify: bool,
    pub snapshot: bool,
    pub warmed_up: bool,
}

/// Inputs to [`decide`] carried by the camera.
#[derive(Clone, Copy, Debug)]
pub struct DecisionInput {
    pub cycle_priority: i32,
    pub new_objects: usize,
    pub prior_priority: i32,
    pub processed_cycles: u64,
    pub warmup_cycles: u64,
    pub local_source: bool,
}

pub fn decide(input: DecisionInput) -> Decision {
    let warmed_up = input.processed_cycles > input.warmup_cycles;
    if !warmed_up {
        return Decision {
            priority: NEVER,
            notify: false,
            snapshot: false,
            warmed_up,
        };
    }
    let priority = input.cycle_priority;
    let worth_it = priority > SUPPRESSION_FLOOR;
    let has_new = input.new_objects > 0;
    Decision {
        priority,
        notify: worth_it && has_new,
        snapshot: worth_it
            && !input.local_source
            && (has_new || priority != input.prior_priority),
        warmed_up,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::RawDetection;
    use crate::BoundingBox;

    fn det(class: &str, prob: f32) -> Detection {
        Detection::from_raw(
            RawDetection::new(class, prob, BoundingBox::new(0.1, 0.1, 0.2, 0.2)),
            "garage",
        )
    }

    fn ctx(mode: Mode) -> PriorityContext<'static> {
        PriorityContext {
            camera: "garage",
            mode,
            closed_gates: BTreeSet::new(),
            hour: 12,
        }
    }

    fn book() -> RuleBook {
        toml::from_str(
            r#"
            [classes]
            vehicle = -1
            person = 1
            cat = 0

            [modes.night]
            person = 2

            [[rules]]
            name = "cat in garage rule"
            cameras = ["garage"]
            classes = ["cat"]
            priority = -2

            [[rules]]
            name = "person detection off"
            classes = ["person"]
            gate_closed = true
            priority = -4

            [[rules]]
            name = "fox on deck"
            stage = "floor"
            classes = ["fox"]
            priority = 1

            [[combos]]
            name = "dog near package"
            classes = ["dog", "package"]
            priority = 1
            "#,
        )
        .unwrap()
    }

    #[test]
    fn rules_apply_in_order() {
        let engine = PriorityEngine::new(book());
        let mut dets = vec![det("cat", 0.9), det("vehicle", 0.9), det("heron", 0.9)];
        let p = engine.evaluate(&mut dets, &ctx(Mode::Home));
        assert_eq!(dets[0].priority, Some(-2));
        assert_eq!(dets[0].priority_rule.as_deref(), Some("cat in garage rule"));
        assert_eq!(dets[1].priority_rule.as_deref(), Some("class vehicle"));
        assert_eq!(dets[2].priority, Some(NEUTRAL));
        assert_eq!(dets[2].priority_rule.as_deref(), Some("default"));
        assert_eq!(p, NEUTRAL);
    }

    #[test]
    fn mode_table_beats_class_table() {
        let engine = PriorityEngine::new(book());
        let mut dets = vec![det("person", 0.9)];
        assert_eq!(engine.evaluate(&mut dets, &ctx(Mode::Night)), URGENT);
        assert_eq!(dets[0].priority_rule.as_deref(), Some("mode night"));
    }

    #[test]
    fn closed_gate_suppresses() {
        let engine = PriorityEngine::new(book());
        let mut c = ctx(Mode::Away);
        c.closed_gates.insert("person".into());
        let mut dets = vec![det("person", 0.9)];
        assert_eq!(engine.evaluate(&mut dets, &c), NEVER);
    }

    #[test]
    fn floor_only_raises() {
        let engine = PriorityEngine::new(book());
        let mut dets = vec![det("fox", 0.9)];
        assert_eq!(engine.evaluate(&mut dets, &ctx(Mode::Home)), INTERESTING);
        assert_eq!(dets[0].priority_rule.as_deref(), Some("fox on deck"));

        let mut raised = RuleBook::default();
        raised.classes.insert("fox".into(), 2);
        raised.rules = book().rules;
        let engine = PriorityEngine::new(raised);
        let mut dets = vec![det("fox", 0.9)];
        assert_eq!(engine.evaluate(&mut dets, &ctx(Mode::Home)), URGENT);
    }

    #[test]
    fn ignored_and_carried_detections_keep_priorities() {
        let engine = PriorityEngine::new(book());
        let mut ignored = det("person", 0.9);
        ignored.mark_ignored("road");
        let mut carried = det("vehicle", 0.9);
        carried.overlap = Some(0.9);
        carried.priority = Some(1);
        carried.priority_rule = Some("earlier".into());
        let mut dets = vec![ignored, carried];
        let p = engine.evaluate(&mut dets, &ctx(Mode::Home));
        assert_eq!(dets[0].priority, Some(NEVER));
        assert_eq!(dets[0].priority_rule.as_deref(), Some("ignored"));
        assert_eq!(dets[1].priority_rule.as_deref(), Some("earlier"));
        assert_eq!(p, 1);
    }

    #[test]
    fn all_ignored_is_never() {
        let engine = PriorityEngine::new(book());
        let mut d = det("person", 0.9);
        d.mark_ignored("static");
        assert_eq!(engine.evaluate(&mut [d], &ctx(Mode::Home)), NEVER);
        assert_eq!(engine.evaluate(&mut [], &ctx(Mode::Home)), NEVER);
    }

    #[test]
    fn combo_needs_undeparted_package() {
        let engine = PriorityEngine::new(book());
        let mut dets = vec![det("dog", 0.9), det("package", 0.9)];
        assert_eq!(engine.evaluate(&mut dets, &ctx(Mode::Home)), INTERESTING);

        let mut gone = det("package", 0.9);
        gone.departed = true;
        let mut dets = vec![det("dog", 0.9), gone];
        assert_eq!(engine.evaluate(&mut dets, &ctx(Mode::Home)), NEUTRAL);
    }

    #[test]
    fn hour_range_wraps_midnight() {
        let night = HourRange { start: 22, end: 6 };
        assert!(night.contains(23));
        assert!(night.contains(3));
        assert!(!night.contains(12));
    }

    #[test]
    fn validate_rejects_unknown_camera_and_range() {
        let cams: BTreeSet<String> = ["deck".to_string()].into_iter().collect();
        assert!(book().validate(&cams).is_err());
        let mut b = RuleBook::default();
        b.classes.insert("person".into(), 5);
        assert!(b.validate(&cams).is_err());
        assert!(RuleBook::default().validate(&cams).is_ok());
    }

    #[test]
    fn static_scene_is_idempotent() {
        let engine = PriorityEngine::new(book());
        let mut first = vec![det("vehicle", 0.8)];
        let p1 = engine.evaluate(&mut first, &ctx(Mode::Home));
        let d1 = decide(DecisionInput {
            cycle_priority: p1,
            new_objects: 1,
            prior_priority: NEVER,
            processed_cycles: 5,
            warmup_cycles: 2,
            local_source: false,
        });
        assert!(d1.notify && d1.snapshot);

        let mut second = vec![det("vehicle", 0.8)];
        second[0].overlap = Some(0.98);
        second[0].priority = first[0].priority;
        second[0].priority_rule = first[0].priority_rule.clone();
        let p2 = engine.evaluate(&mut second, &ctx(Mode::Home));
        assert_eq!(p1, p2);
        let d2 = decide(DecisionInput {
            cycle_priority: p2,
            new_objects: 0,
            prior_priority: d1.priority,
            processed_cycles: 6,
            warmup_cycles: 2,
            local_source: false,
        });
        assert!(!d2.notify && !d2.snapshot);
    }

    #[test]
    fn warm_up_records_never() {
        let d = decide(DecisionInput {
            cycle_priority: URGENT,
            new_objects: 1,
            prior_priority: NEVER,
            processed_cycles: 2,
            warmup_cycles: 2,
            local_source: false,
        });
        assert_eq!(d.priority, NEVER);
        assert!(!d.notify && !d.snapshot && !d.warmed_up);
    }

    #[test]
    fn local_files_never_snapshot() {
        let d = decide(DecisionInput {
            cycle_priority: 1,
            new_objects: 1,
            prior_priority: NEVER,
            processed_cycles: 3,
            warmup_cycles: 0,
            local_source: true,
        });
        assert!(d.notify);
        assert!(!d.snapshot);
    }
}
