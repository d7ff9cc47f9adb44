//! Outbound alerts.
//!
//! The `Notifier` turns a camera-cycle that deserves attention into one
//! message: text from the camera's template, a crop around what was seen,
//! the priority and a sound. Vehicles are enriched with plate lookups when a
//! plate reader is configured. Transport failures are logged and swallowed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::{imageops, DynamicImage, RgbImage};

use crate::camera::CameraSettings;
use crate::detect::Detection;
use crate::frame::encode_jpeg;
use crate::home::{ActionBook, HomeAutomation};
use crate::plates::{PlateBook, PlateReader};
use crate::priority::{NEVER, URGENT};
use crate::snapshot::SnapshotStore;
use crate::tracker::TrackEntry;
use crate::BoundingBox;

pub const PUSHOVER_URL: &str = "https://api.pushover.net/1/messages.json";
pub const DEFAULT_SOUND: &str = "pushover";
const CROP_MARGIN: f32 = 0.05;
const MIN_CROP_FRACTION: f32 = 0.25;

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub camera: String,
    pub message: String,
    /// JPEG attachment.
    pub image: Option<Vec<u8>>,
    pub priority: i32,
    pub sound: String,
}

pub trait NotificationTransport: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<()>;
}

impl<T: NotificationTransport + ?Sized> NotificationTransport for std::sync::Arc<T> {
    fn send(&self, notification: &Notification) -> Result<()> {
        (**self).send(notification)
    }
}

/// Pushover message API.
pub struct Pushover {
    token: String,
    user: String,
    url: String,
    agent: ureq::Agent,
}

impl Pushover {
    pub fn new(token: impl Into<String>, user: impl Into<String>, timeout: Duration) -> Self {
        Self {
            token: token.into(),
            user: user.into(),
            url: PUSHOVER_URL.to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

/// Pushover accepts -2 (silent) through 2 (emergency).
fn transport_priority(priority: i32) -> i32 {
    priority.clamp(-2, URGENT)
}

impl NotificationTransport for Pushover {
    fn send(&self, notification: &Notification) -> Result<()> {
        let priority = transport_priority(notification.priority).to_string();
        let attachment = notification
            .image
            .as_ref()
            .map(|jpeg| base64::engine::general_purpose::STANDARD.encode(jpeg));
        let mut form = vec![
            ("token", self.token.as_str()),
            ("user", self.user.as_str()),
            ("message", notification.message.as_str()),
            ("priority", priority.as_str()),
            ("sound", notification.sound.as_str()),
        ];
        if let Some(encoded) = attachment.as_deref() {
            form.push(("attachment_base64", encoded));
            form.push(("attachment_type", "image/jpeg"));
        }
        let response = self
            .agent
            .post(&self.url)
            .send_form(&form)
            .map_err(|err| anyhow!("pushover rejected message: {}", err))?;
        log::debug!("pushover status={}", response.status());
        Ok(())
    }
}

/// Keeps every notification in memory; for tests and dry runs.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl NotificationTransport for MemoryTransport {
    fn send(&self, notification: &Notification) -> Result<()> {
        log::info!("{} [{}] {}", notification.camera, notification.priority, notification.message);
        self.sent
            .lock()
            .map_err(|_| anyhow!("memory transport lock poisoned"))?
            .push(notification.clone());
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Sounds {
    pub default: String,
    pub departed: String,
    pub per_class: BTreeMap<String, String>,
}

impl Default for Sounds {
    fn default() -> Self {
        Self {
            default: DEFAULT_SOUND.to_string(),
            departed: DEFAULT_SOUND.to_string(),
            per_class: BTreeMap::new(),
        }
    }
}

impl Sounds {
    /// Last matching detection decides, as detections are listed in arrival order.
    pub fn pick(&self, detections: &[Detection]) -> String {
        let mut sound = self.default.clone();
        for det in detections.iter().filter(|d| !d.is_ignored()) {
            if det.departed {
                sound = self.departed.clone();
            } else if let Some(s) = self.per_class.get(&det.class) {
                sound = s.clone();
            }
        }
        sound
    }
}

pub struct PlateLookup {
    pub reader: Box<dyn PlateReader>,
    pub book: PlateBook,
}

pub struct Notifier {
    transport: Box<dyn NotificationTransport>,
    sounds: Sounds,
    plates: Option<PlateLookup>,
    static_crops: Option<SnapshotStore>,
}

impl Notifier {
    pub fn new(transport: Box<dyn NotificationTransport>, sounds: Sounds) -> Self {
        Self {
            transport,
            sounds,
            plates: None,
            static_crops: None,
        }
    }

    pub fn with_plates(mut self, plates: PlateLookup) -> Self {
        self.plates = Some(plates);
        self
    }

    /// Keep the latest crop per class under `<save>/static`.
    pub fn with_static_crops(mut self, store: SnapshotStore) -> Self {
        self.static_crops = Some(store);
        self
    }

    /// Render the camera's message template for the valid classes.
    pub fn message(camera: &CameraSettings, objects: &BTreeSet<String>) -> String {
        let objects = objects.iter().cloned().collect::<Vec<_>>().join(",");
        match &camera.message {
            Some(template) => template
                .replace("{objects}", &objects)
                .replace("{camera}", &camera.display_name),
            None => format!("{} near {}", objects, camera.display_name),
        }
    }

    /// Alert about a notable cycle. Returns whether the transport accepted it.
    pub fn notify(
        &self,
        camera: &CameraSettings,
        detections: &[Detection],
        image: &RgbImage,
        priority: i32,
        home: &dyn HomeAutomation,
        actions: &ActionBook,
    ) -> bool {
        let valid: Vec<&Detection> = detections.iter().filter(|d| !d.is_ignored()).collect();
        let objects: BTreeSet<String> = valid.iter().map(|d| d.class.clone()).collect();
        let mut message = Self::message(camera, &objects);

        let crop = crop_to(image, &valid.iter().map(|d| d.bbox).collect::<Vec<_>>());
        if let Some(store) = &self.static_crops {
            for class in &objects {
                if let Err(err) = store.save_static(class, &crop) {
                    log::warn!("failed to save static crop for {}: {:#}", class, err);
                }
            }
        }

        let arriving_vehicles: Vec<BoundingBox> = valid
            .iter()
            .filter(|d| d.class == "vehicle" && !d.departed && d.track_age == Some(0))
            .map(|d| d.bbox)
            .collect();
        if !arriving_vehicles.is_empty() {
            match self.describe_vehicles(camera, image, &arriving_vehicles, home, actions) {
                Ok(Some(lines)) => {
                    for line in lines {
                        message.push('\n');
                        message.push_str(&line);
                    }
                }
                Ok(None) => {
                    log::info!("{}: vehicle not announced", camera.name);
                    return false;
                }
                Err(err) => log::warn!("{}: plate lookup failed: {:#}", camera.name, err),
            }
        }

        let notification = Notification {
            camera: camera.name.clone(),
            message,
            image: encode_jpeg(&crop).ok(),
            priority,
            sound: self.sounds.pick(detections),
        };
        self.deliver(&notification, home)
    }

    /// Announce long-lived objects that have left, at `priority`.
    pub fn notify_departed(
        &self,
        camera: &CameraSettings,
        departed: &[TrackEntry],
        image: &RgbImage,
        priority: i32,
        home: &dyn HomeAutomation,
    ) -> bool {
        if departed.is_empty() {
            return false;
        }
        let message = departed
            .iter()
            .map(|e| departure_message(&camera.display_name, e))
            .collect::<Vec<_>>()
            .join(", ");
        let crop = crop_to(image, &departed.iter().map(|e| e.bbox).collect::<Vec<_>>());
        let notification = Notification {
            camera: camera.name.clone(),
            message,
            image: encode_jpeg(&crop).ok(),
            priority,
            sound: self.sounds.departed.clone(),
        };
        self.deliver(&notification, home)
    }

    fn deliver(&self, notification: &Notification, home: &dyn HomeAutomation) -> bool {
        if notification.priority <= NEVER {
            return false;
        }
        match home.vacation_mode() {
            Ok(false) => {}
            Ok(true) => {
                log::info!("{}: on vacation, not sending {:?}", notification.camera, notification.message);
                return false;
            }
            Err(err) => log::warn!("{}: vacation mode unknown: {:#}", notification.camera, err),
        }
        match self.transport.send(notification) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("failed to notify {}: {:#}", notification.camera, err);
                false
            }
        }
    }

    /// `Ok(None)` when a plate belongs to a vehicle that should not be announced.
    fn describe_vehicles(
        &self,
        camera: &CameraSettings,
        image: &RgbImage,
        vehicles: &[BoundingBox],
        home: &dyn HomeAutomation,
        actions: &ActionBook,
    ) -> Result<Option<Vec<String>>> {
        let Some(plates) = &self.plates else {
            return Ok(Some(Vec::new()));
        };
        let region = vehicles
            .iter()
            .skip(1)
            .fold(vehicles[0], |acc, b| acc.union(b))
            .expand(CROP_MARGIN);
        let crop = crop_pixels(image, &region);
        let jpeg = encode_jpeg(&crop).context("encode vehicle crop")?;
        let reading = plates.reader.read(&jpeg)?;
        if reading.vehicles == 0 {
            log::info!("{}: plate reader saw no vehicle", camera.name);
        }

        let mut lines = Vec::new();
        for plate in &reading.plates {
            match plates.book.lookup(plate) {
                Some((_, record)) if !record.announce => {
                    log::info!("ignoring {} with plate {}", record.describe(), plate);
                    return Ok(None);
                }
                Some((_, record)) => {
                    if let Some(action) = &record.action {
                        if let Err(err) = actions.fire_named(home, action, &camera.name) {
                            log::warn!("{}: plate action {} failed: {:#}", camera.name, action, err);
                        }
                    }
                    lines.push(format!("{} {}", record.describe(), plate));
                }
                None => lines.push(format!("Vehicle {}", plate)),
            }
        }
        Ok(Some(lines))
    }
}

/// Highest priority recorded on `entries`, or 0 when none was recorded.
pub fn departure_priority(entries: &[TrackEntry]) -> i32 {
    entries.iter().filter_map(|e| e.priority).max().unwrap_or(0)
}

pub fn departure_message(camera: &str, entry: &TrackEntry) -> String {
    let lifetime = entry.last_seen.saturating_duration_since(entry.first_seen);
    format!(
        "{} departed from {} after being seen {} times over the past {}",
        entry.class,
        camera,
        entry.age,
        humanize(lifetime)
    )
}

fn humanize(d: Duration) -> String {
    let minutes = d.as_secs() / 60;
    match minutes {
        0 => format!("{} seconds", d.as_secs()),
        1 => "minute".to_string(),
        m if m < 60 => format!("{} minutes", m),
        m if m < 120 => "hour".to_string(),
        m => format!("{} hours", m / 60),
    }
}

/// Region around `boxes` with a margin, at least a quarter of the frame.
pub fn crop_region(boxes: &[BoundingBox]) -> BoundingBox {
    let Some(first) = boxes.first() else {
        return BoundingBox::new(0.0, 0.0, 1.0, 1.0);
    };
    let area = boxes
        .iter()
        .skip(1)
        .fold(*first, |acc, b| acc.union(b))
        .expand(CROP_MARGIN);
    let center = area.center();
    let width = area.width.max(MIN_CROP_FRACTION);
    let height = area.height.max(MIN_CROP_FRACTION);
    let left = (center.x - width / 2.0).clamp(0.0, 1.0 - width);
    let top = (center.y - height / 2.0).clamp(0.0, 1.0 - height);
    BoundingBox::new(left, top, width, height)
}

fn crop_pixels(image: &RgbImage, region: &BoundingBox) -> DynamicImage {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let x = (region.left * w) as u32;
    let y = (region.top * h) as u32;
    let cw = ((region.width * w) as u32).clamp(1, image.width().saturating_sub(x).max(1));
    let ch = ((region.height * h) as u32).clamp(1, image.height().saturating_sub(y).max(1));
    DynamicImage::ImageRgb8(imageops::crop_imm(image, x, y, cw, ch).to_image())
}

fn crop_to(image: &RgbImage, boxes: &[BoundingBox]) -> DynamicImage {
    crop_pixels(image, &crop_region(boxes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::RawDetection;
    use crate::home::StaticHome;
    use crate::home::Mode;
    use crate::plates::PlateReading;
    use std::sync::Arc;
    use std::time::Instant;

    struct FailingTransport;

    impl NotificationTransport for FailingTransport {
        fn send(&self, _notification: &Notification) -> Result<()> {
            Err(anyhow!("network down"))
        }
    }

    struct FixedReader(Vec<String>);

    impl PlateReader for FixedReader {
        fn read(&self, _jpeg: &[u8]) -> Result<PlateReading> {
            Ok(PlateReading {
                vehicles: 1,
                plates: self.0.clone(),
            })
        }
    }

    fn det(class: &str) -> Detection {
        let mut d = Detection::from_raw(
            RawDetection::new(class, 0.9, BoundingBox::new(0.4, 0.3, 0.2, 0.15)),
            "driveway",
        );
        d.track_age = Some(0);
        d
    }

    fn image() -> RgbImage {
        RgbImage::new(100, 80)
    }

    #[test]
    fn default_and_templated_messages() {
        let mut cam = CameraSettings::new("garage-r");
        let objects: BTreeSet<String> = ["dog".to_string(), "person".to_string()].into_iter().collect();
        assert_eq!(Notifier::message(&cam, &objects), "dog,person near garage-r");
        cam.message = Some("{objects} in front of left garage".into());
        assert_eq!(Notifier::message(&cam, &objects), "dog,person in front of left garage");
    }

    #[test]
    fn crop_is_at_least_a_quarter_and_inside_frame() {
        let region = crop_region(&[BoundingBox::new(0.95, 0.95, 0.04, 0.04)]);
        assert!((region.width - 0.25).abs() < 1e-6);
        assert!(region.right() <= 1.0 + 1e-6);
        assert!(region.bottom() <= 1.0 + 1e-6);
        let wide = crop_region(&[BoundingBox::new(0.1, 0.1, 0.1, 0.1), BoundingBox::new(0.7, 0.1, 0.1, 0.1)]);
        assert!((wide.left - 0.05).abs() < 1e-6);
        assert!((wide.width - 0.8).abs() < 1e-6);
    }

    #[test]
    fn sounds_prefer_departed_and_class() {
        let sounds = Sounds {
            per_class: BTreeMap::from([("deer".to_string(), "bugle".to_string())]),
            departed: "falling".into(),
            ..Default::default()
        };
        assert_eq!(sounds.pick(&[det("person")]), "pushover");
        assert_eq!(sounds.pick(&[det("deer")]), "bugle");
        let mut gone = det("dog");
        gone.departed = true;
        assert_eq!(sounds.pick(&[gone]), "falling");
    }

    #[test]
    fn transport_failure_is_swallowed() {
        let notifier = Notifier::new(Box::new(FailingTransport), Sounds::default());
        let home = StaticHome::new(Mode::Home);
        let sent = notifier.notify(
            &CameraSettings::new("deck"),
            &[det("person")],
            &image(),
            1,
            &home,
            &ActionBook::default(),
        );
        assert!(!sent);
    }

    #[test]
    fn plates_enrich_message_and_unannounced_vehicles_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plates.json");
        std::fs::write(
            &path,
            r#"{"ABC1234": {"owner": "Alice", "make": "Subaru"}, "HIDE001": {"announce": false}}"#,
        )
        .unwrap();
        let memory = Arc::new(MemoryTransport::new());
        let notifier = Notifier::new(Box::new(memory.clone()), Sounds::default()).with_plates(PlateLookup {
            reader: Box::new(FixedReader(vec!["ABC 1234".into()])),
            book: PlateBook::open(&path),
        });
        let home = StaticHome::new(Mode::Home);
        let cam = CameraSettings::new("driveway");
        assert!(notifier.notify(&cam, &[det("vehicle")], &image(), 0, &home, &ActionBook::default()));
        assert_eq!(memory.sent()[0].message, "vehicle near driveway\nAlice's Subaru ABC 1234");

        let hidden = Notifier::new(Box::new(memory.clone()), Sounds::default()).with_plates(PlateLookup {
            reader: Box::new(FixedReader(vec!["HIDE001".into()])),
            book: PlateBook::open(&path),
        });
        assert!(!hidden.notify(&cam, &[det("vehicle")], &image(), 0, &home, &ActionBook::default()));
        assert_eq!(memory.sent().len(), 1);
    }

    struct Vacation;

    impl HomeAutomation for Vacation {
        fn current_mode(&self) -> Result<Mode> {
            Ok(Mode::Away)
        }

        fn should_notify(&self, _class: &str) -> Result<bool> {
            Ok(true)
        }

        fn vacation_mode(&self) -> Result<bool> {
            Ok(true)
        }

        fn trigger(&self, _action: &crate::home::ActionRequest) -> Result<()> {
            Ok(())
        }
    }

    fn entry(class: &str, priority: Option<i32>) -> TrackEntry {
        let now = Instant::now();
        TrackEntry {
            id: 7,
            class: class.into(),
            bbox: BoundingBox::new(0.1, 0.1, 0.1, 0.1),
            first_seen: now,
            last_seen: now + Duration::from_secs(5 * 60 + 10),
            age: 9,
            priority,
            priority_rule: None,
        }
    }

    #[test]
    fn vacation_silences_every_notification() {
        let memory = Arc::new(MemoryTransport::new());
        let notifier = Notifier::new(Box::new(memory.clone()), Sounds::default());
        let cam = CameraSettings::new("deck");
        assert!(!notifier.notify(&cam, &[det("person")], &image(), 2, &Vacation, &ActionBook::default()));
        assert!(!notifier.notify_departed(&cam, &[entry("dog", Some(1))], &image(), 1, &Vacation));
        assert!(memory.sent().is_empty());

        let home = StaticHome::new(Mode::Home);
        assert!(notifier.notify(&cam, &[det("person")], &image(), 2, &home, &ActionBook::default()));
        assert_eq!(memory.sent().len(), 1);
    }

    #[test]
    fn departures_carry_recorded_priority() {
        assert_eq!(departure_priority(&[entry("vehicle", None)]), 0);
        assert_eq!(departure_priority(&[entry("vehicle", Some(-4)), entry("dog", Some(1))]), 1);
        assert_eq!(departure_priority(&[entry("vehicle", Some(-4))]), NEVER);

        let memory = Arc::new(MemoryTransport::new());
        let notifier = Notifier::new(Box::new(memory.clone()), Sounds::default());
        let home = StaticHome::new(Mode::Home);
        let cam = CameraSettings::new("street");
        assert!(!notifier.notify_departed(&cam, &[entry("vehicle", Some(NEVER))], &image(), NEVER, &home));
        assert!(notifier.notify_departed(&cam, &[entry("dog", Some(1))], &image(), 1, &home));
        assert_eq!(memory.sent().len(), 1);
        assert_eq!(memory.sent()[0].priority, 1);
    }

    #[test]
    fn departure_message_reads_naturally() {
        let entry = entry("package", Some(0));
        assert_eq!(
            departure_message("front entry", &entry),
            "package departed from front entry after being seen 9 times over the past 5 minutes"
        );
    }
}
