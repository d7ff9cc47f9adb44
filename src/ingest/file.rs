//! Local file frame source.
//!
//! Reads the configured image every capture. Useful for replaying a saved
//! snapshot through the pipeline. `stub://` paths produce synthetic frames
//! for testing; `stub://fail` always errors.

use std::fs;

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, Rgb, RgbImage};

use super::FrameSource;
use crate::frame::Frame;

pub struct FileSource {
    path: String,
    frame_count: u64,
}

impl FileSource {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !is_local_file_path(&path) {
            return Err(anyhow!(
                "file capture only supports local paths (no URL schemes)"
            ));
        }
        Ok(Self {
            path,
            frame_count: 0,
        })
    }

    fn synthetic(&mut self) -> Result<Frame> {
        if self.path == "stub://fail" {
            return Err(anyhow!("synthetic capture failure"));
        }
        self.frame_count += 1;
        let shade = (self.frame_count % 256) as u8;
        let image = RgbImage::from_fn(64, 48, |x, y| {
            Rgb([shade, (x * 4) as u8, (y * 5) as u8])
        });
        Ok(Frame::from_image(DynamicImage::ImageRgb8(image), self.path.clone()))
    }
}

impl FrameSource for FileSource {
    fn fetch(&mut self) -> Result<Frame> {
        if self.path.starts_with("stub://") {
            return self.synthetic();
        }
        let bytes = fs::read(&self.path).with_context(|| format!("read {}", self.path))?;
        Frame::decode(&bytes, self.path.clone())
    }

    fn describe(&self) -> String {
        self.path.clone()
    }

    fn is_local(&self) -> bool {
        true
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_urls() {
        assert!(FileSource::new("http://cam/snap.jpg").is_err());
        assert!(FileSource::new("  ").is_err());
    }

    #[test]
    fn synthetic_frames_change_every_fetch() {
        let mut source = FileSource::new("stub://yard").unwrap();
        let a = source.fetch().unwrap();
        let b = source.fetch().unwrap();
        assert_ne!(a.content_hash(), b.content_hash());
        assert!(source.is_local());
        assert!(FileSource::new("stub://fail").unwrap().fetch().is_err());
    }

    #[test]
    fn reads_image_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.png");
        RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])).save(&path).unwrap();
        let mut source = FileSource::new(path.to_string_lossy()).unwrap();
        let frame = source.fetch().unwrap();
        assert_eq!(frame.width(), 4);
        assert!(source.fetch().is_ok());
    }
}
