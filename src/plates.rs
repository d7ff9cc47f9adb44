//! License plates: a reader service and the household's plate book.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// One known vehicle.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct PlateRecord {
    pub owner: Option<String>,
    pub color: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    /// `false` keeps this vehicle out of notifications entirely.
    #[serde(default = "default_announce")]
    pub announce: bool,
    /// Named home action to fire when this plate arrives.
    pub action: Option<String>,
}

fn default_announce() -> bool {
    true
}

impl PlateRecord {
    /// "Alice's red Subaru Outback", or just "vehicle" details that exist.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        if let Some(owner) = &self.owner {
            out.push_str(owner);
            out.push_str("'s ");
        }
        if let Some(color) = &self.color {
            out.push_str(color);
            out.push(' ');
        }
        match &self.make {
            Some(make) => {
                out.push_str(make);
                if let Some(model) = &self.model {
                    out.push(' ');
                    out.push_str(model);
                }
            }
            None => out.push_str("vehicle"),
        }
        out
    }
}

#[derive(Default)]
struct PlateCache {
    records: BTreeMap<String, PlateRecord>,
    modified: Option<SystemTime>,
    loaded: bool,
}

/// Known plates, reloaded from disk whenever the file's mtime changes.
///
/// A missing or invalid file leaves the book empty and logs a warning.
pub struct PlateBook {
    path: PathBuf,
    cache: Mutex<PlateCache>,
}

impl PlateBook {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(PlateCache::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn refresh(&self, cache: &mut PlateCache) {
        let modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        if cache.loaded && modified == cache.modified {
            return;
        }
        cache.loaded = true;
        cache.modified = modified;
        cache.records = match load_records(&self.path) {
            Ok(records) => {
                log::info!("loaded {} plates from {}", records.len(), self.path.display());
                records
            }
            Err(err) => {
                log::warn!("could not load plates: {:#}", err);
                BTreeMap::new()
            }
        };
    }

    pub fn len(&self) -> usize {
        match self.cache.lock() {
            Ok(mut cache) => {
                self.refresh(&mut cache);
                cache.records.len()
            }
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact plate, then without spaces, then one edit away, then two.
    pub fn lookup(&self, plate: &str) -> Option<(String, PlateRecord)> {
        let mut cache = self.cache.lock().ok()?;
        self.refresh(&mut cache);
        let records = &cache.records;

        let plate = plate.to_ascii_uppercase();
        let compact = plate.replace(' ', "");
        for guess in [&plate, &compact] {
            if let Some(record) = records.get(guess.as_str()) {
                return Some((guess.clone(), record.clone()));
            }
        }
        for max in 1..=2 {
            if let Some((known, record)) = records
                .iter()
                .find(|(known, _)| edit_distance(&compact, known) <= max)
            {
                return Some((known.clone(), record.clone()));
            }
        }
        None
    }
}

fn load_records(path: &Path) -> Result<BTreeMap<String, PlateRecord>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let records: BTreeMap<String, PlateRecord> =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(records
        .into_iter()
        .map(|(plate, record)| (plate.to_ascii_uppercase(), record))
        .collect())
}

/// Insertions, deletions and substitutions.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            row[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

/// Result of running plate recognition on a vehicle crop.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlateReading {
    /// Vehicles the service saw at all; zero means "no vehicle here".
    pub vehicles: usize,
    pub plates: Vec<String>,
}

pub trait PlateReader: Send + Sync {
    fn read(&self, jpeg: &[u8]) -> Result<PlateReading>;
}

/// CodeProject.AI server `/v1/image/alpr`.
pub struct CodeProjectAlpr {
    url: String,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct AlprResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    predictions: Vec<AlprPrediction>,
}

#[derive(Deserialize)]
struct AlprPrediction {
    #[serde(default)]
    plate: String,
}

const MULTIPART_BOUNDARY: &str = "aicam-alpr-boundary";

impl CodeProjectAlpr {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

fn multipart_image(jpeg: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(jpeg.len() + 256);
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"image.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n",
            b = MULTIPART_BOUNDARY
        )
        .as_bytes(),
    );
    body.extend_from_slice(jpeg);
    body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());
    body
}

impl PlateReader for CodeProjectAlpr {
    fn read(&self, jpeg: &[u8]) -> Result<PlateReading> {
        let response: AlprResponse = self
            .agent
            .post(&self.url)
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", MULTIPART_BOUNDARY),
            )
            .send_bytes(&multipart_image(jpeg))
            .map_err(|err| anyhow!("alpr request to {} failed: {}", self.url, err))?
            .into_json()
            .context("invalid alpr response")?;
        let vehicles = response.predictions.len();
        let plates = if response.success {
            response
                .predictions
                .into_iter()
                .map(|p| p.plate)
                .filter(|p| !p.is_empty())
                .collect()
        } else {
            Vec::new()
        };
        Ok(PlateReading { vehicles, plates })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOK: &str = r#"{
        "ABC1234": {"owner": "Alice", "color": "red", "make": "Subaru", "model": "Outback"},
        "CLN0001": {"owner": "house cleaner", "action": "house cleaners arrived"},
        "NOPE999": {"owner": "Bob", "announce": false}
    }"#;

    fn book() -> (tempfile::TempDir, PlateBook) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("license-plates.json");
        fs::write(&path, BOOK).unwrap();
        let book = PlateBook::open(path);
        (dir, book)
    }

    #[test]
    fn lookup_tries_exact_compact_then_edits() {
        let (_dir, book) = book();
        assert_eq!(book.lookup("ABC1234").unwrap().0, "ABC1234");
        assert_eq!(book.lookup("abc 1234").unwrap().0, "ABC1234");
        assert_eq!(book.lookup("ABC12B4").unwrap().0, "ABC1234");
        assert_eq!(book.lookup("AC12B4").unwrap().0, "ABC1234");
        assert!(book.lookup("XYZ9876").is_none());
    }

    #[test]
    fn describe_formats_known_fields() {
        let (_dir, book) = book();
        assert_eq!(book.lookup("ABC1234").unwrap().1.describe(), "Alice's red Subaru Outback");
        let cleaner = book.lookup("CLN0001").unwrap().1;
        assert_eq!(cleaner.describe(), "house cleaner's vehicle");
        assert_eq!(cleaner.action.as_deref(), Some("house cleaners arrived"));
        assert!(!book.lookup("NOPE999").unwrap().1.announce);
    }

    #[test]
    fn missing_file_is_empty_and_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plates.json");
        let book = PlateBook::open(&path);
        assert!(book.is_empty());

        fs::write(&path, BOOK).unwrap();
        assert_eq!(book.len(), 3);

        fs::write(&path, r#"{"ZZZ0000": {}}"#).unwrap();
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn invalid_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plates.json");
        fs::write(&path, "not json").unwrap();
        assert!(PlateBook::open(path).is_empty());
    }

    #[test]
    fn edit_distance_counts_basic_edits() {
        assert_eq!(edit_distance("ABC", "ABC"), 0);
        assert_eq!(edit_distance("ABC", "AC"), 1);
        assert_eq!(edit_distance("ABC", "ABXC"), 1);
        assert_eq!(edit_distance("ABC", "XBY"), 2);
    }

    #[test]
    fn multipart_body_wraps_image() {
        let body = multipart_image(b"JPEG");
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("name=\"image\""));
        assert!(text.contains("\r\n\r\nJPEG\r\n"));
        assert!(text.ends_with("--aicam-alpr-boundary--\r\n"));
    }
}
