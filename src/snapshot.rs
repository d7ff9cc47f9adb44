//! Per-day snapshot files.
//!
//! Layout under the save path:
//!
//! ```text
//! <save>/<YYYYMMDD>/HHMMSS-<camera>-<classes>.jpg
//! <save>/<YYYYMMDD>/HHMMSS-<camera>-<classes>.json
//! <save>/<YYYYMMDD>/HHMMSS-<camera>-<classes>-annotated.jpg
//! <save>/<YYYYMMDD>/HHMMSS-<camera>-<classes>-prior.jpg
//! <save>/<YYYYMMDD>/HHMMSS-<camera>-<classes>-departed.jpg
//! <save>/static/<class>.jpg
//! <save>/today -> <YYYYMMDD>
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use serde::Serialize;

use crate::detect::Detection;
use crate::filter::RoadLine;
use crate::frame::{encode_jpeg, Frame};
use crate::sanitize_name;
use crate::tracker::TrackEntry;
use crate::BoundingBox;

const TODAY_LINK: &str = "today";
const STATIC_DIR: &str = "static";

static LINK_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize)]
struct SnapshotRecord<'a> {
    source: &'a str,
    time: String,
    detections: &'a [Detection],
}

#[derive(Clone, Debug)]
pub struct SnapshotStore {
    root: PathBuf,
    colors: BTreeMap<String, String>,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, colors: BTreeMap<String, String>) -> Self {
        Self {
            root: root.into(),
            colors,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the day directory for `at` and point `today` at it.
    pub fn day_dir(&self, at: DateTime<Local>) -> Result<PathBuf> {
        self.ensure_day(at, true)
    }

    fn ensure_day(&self, at: DateTime<Local>, repoint: bool) -> Result<PathBuf> {
        let day = at.format("%Y%m%d").to_string();
        let dir = self.root.join(&day);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        if repoint {
            self.point_today(&day)?;
        }
        Ok(dir)
    }

    /// Repoint `today` with a temp link and a rename so readers never see it
    /// missing. The link only ever moves forward.
    fn point_today(&self, day: &str) -> Result<()> {
        let link = self.root.join(TODAY_LINK);
        if let Ok(current) = fs::read_link(&link) {
            if current.to_str().map_or(false, |current| current >= day) {
                return Ok(());
            }
        }
        let tmp = self.root.join(format!(
            ".{}.{}.{}",
            TODAY_LINK,
            std::process::id(),
            LINK_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::os::unix::fs::symlink(day, &tmp)
            .with_context(|| format!("create link {}", tmp.display()))?;
        if let Err(err) = fs::rename(&tmp, &link) {
            let _ = fs::remove_file(&tmp);
            return Err(err).with_context(|| format!("repoint {}", link.display()));
        }
        log::info!("{} now points at {}", link.display(), day);
        Ok(())
    }

    fn base_path(&self, camera: &str, classes: &[String], at: DateTime<Local>) -> Result<PathBuf> {
        Ok(file_base(&self.day_dir(at)?, camera, classes, at))
    }

    /// Save the frame, its detections as JSON and the annotated copy.
    pub fn save(
        &self,
        camera: &str,
        classes: &[String],
        frame: &Frame,
        detections: &[Detection],
        annotated: &RgbImage,
        at: DateTime<Local>,
    ) -> Result<PathBuf> {
        let base = self.base_path(camera, classes, at)?;
        let jpg = with_suffix(&base, ".jpg");
        write_jpeg(&jpg, frame.image())?;

        let record = SnapshotRecord {
            source: frame.source(),
            time: at.to_rfc3339(),
            detections,
        };
        let json = with_suffix(&base, ".json");
        let body = serde_json::to_string_pretty(&record).context("serialize detections")?;
        fs::write(&json, body).with_context(|| format!("write {}", json.display()))?;

        write_jpeg(
            &with_suffix(&base, "-annotated.jpg"),
            &DynamicImage::ImageRgb8(annotated.clone()),
        )?;
        Ok(jpg)
    }

    /// Save the unsaved frame from the previous cycle, stamped with its capture time.
    pub fn save_prior(
        &self,
        camera: &str,
        classes: &[String],
        frame: &Frame,
        captured: DateTime<Local>,
    ) -> Result<PathBuf> {
        let dir = self.ensure_day(captured, false)?;
        let path = with_suffix(&file_base(&dir, camera, classes, captured), "-prior.jpg");
        write_jpeg(&path, frame.image())?;
        let file = fs::File::options()
            .write(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.set_modified(SystemTime::from(captured))
            .with_context(|| format!("set mtime on {}", path.display()))?;
        Ok(path)
    }

    pub fn save_departed(
        &self,
        camera: &str,
        departed: &[String],
        image: &RgbImage,
        at: DateTime<Local>,
    ) -> Result<PathBuf> {
        let path = with_suffix(&self.base_path(camera, departed, at)?, "-departed.jpg");
        write_jpeg(&path, &DynamicImage::ImageRgb8(image.clone()))?;
        Ok(path)
    }

    /// Latest crop per class, for dashboards.
    pub fn save_static(&self, class: &str, image: &DynamicImage) -> Result<PathBuf> {
        let dir = self.root.join(STATIC_DIR);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(format!("{}.jpg", sanitize_name(class)));
        write_jpeg(&path, image)?;
        Ok(path)
    }

    /// Draw detections (thin when ignored), expired tracks in grey and the road line.
    pub fn annotate(
        &self,
        frame: &Frame,
        detections: &[Detection],
        expired: &[TrackEntry],
        road: Option<&RoadLine>,
    ) -> RgbImage {
        let mut img = frame.to_rgb();
        for det in detections {
            let color = self
                .colors
                .get(&det.class)
                .map(String::as_str)
                .unwrap_or("red");
            let thickness = if det.is_ignored() { 2 } else { 4 };
            draw_box(&mut img, &det.bbox, named_color(color), thickness);
        }
        for entry in expired {
            draw_box(&mut img, &entry.bbox, named_color("grey"), 4);
        }
        if let Some(road) = road {
            let (w, h) = (img.width() as f32, img.height() as f32);
            for seg in road.points.windows(2) {
                draw_line_segment_mut(
                    &mut img,
                    (seg[0].x * w, seg[0].y * h),
                    (seg[1].x * w, seg[1].y * h),
                    named_color("yellow"),
                );
            }
        }
        img
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_jpeg(path: &Path, image: &DynamicImage) -> Result<()> {
    let bytes = encode_jpeg(image)?;
    fs::write(path, bytes).with_context(|| format!("write {}", path.display()))
}

fn draw_box(img: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>, thickness: u32) {
    let (w, h) = (img.width() as f32, img.height() as f32);
    let x = (bbox.left * w) as i32;
    let y = (bbox.top * h) as i32;
    let bw = (bbox.width * w).max(1.0) as u32;
    let bh = (bbox.height * h).max(1.0) as u32;
    for offset in 0..thickness {
        let inset = offset as i32;
        let (Some(rw), Some(rh)) = (bw.checked_sub(2 * offset), bh.checked_sub(2 * offset)) else {
            break;
        };
        if rw == 0 || rh == 0 {
            break;
        }
        draw_hollow_rect_mut(img, Rect::at(x + inset, y + inset).of_size(rw, rh), color);
    }
}

/// `<dir>/HHMMSS-<camera>-<classes>`
fn file_base(dir: &Path, camera: &str, classes: &[String], at: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "{}-{}-{}",
        at.format("%H%M%S"),
        sanitize_name(camera),
        classes.join("_")
    ))
}

pub fn named_color(name: &str) -> Rgb<u8> {
    match name.to_ascii_lowercase().as_str() {
        "green" => Rgb([0, 200, 0]),
        "blue" => Rgb([0, 80, 255]),
        "yellow" => Rgb([255, 220, 0]),
        "orange" => Rgb([255, 140, 0]),
        "purple" => Rgb([160, 32, 240]),
        "cyan" => Rgb([0, 220, 220]),
        "magenta" | "pink" => Rgb([255, 0, 200]),
        "white" => Rgb([255, 255, 255]),
        "black" => Rgb([0, 0, 0]),
        "grey" | "gray" => Rgb([128, 128, 128]),
        "brown" => Rgb([140, 80, 20]),
        _ => Rgb([255, 0, 0]),
    }
}
