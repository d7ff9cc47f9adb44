//! Captured frames.
//!
//! A `Frame` is one decoded still from a camera together with the content hash
//! used for duplicate suppression. Night-vision cameras deliver colour JPEGs
//! whose channels are all equal; those are collapsed to grayscale at decode
//! time so the scheduler can route them to the grayscale model.

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GenericImageView, RgbImage};
use sha2::{Digest, Sha256};

#[derive(Clone)]
pub struct Frame {
    image: DynamicImage,
    content_hash: String,
    source: String,
    grey: bool,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("grey", &self.grey)
            .field("source", &self.source)
            .finish()
    }
}

impl Frame {
    /// Decode an encoded image (JPEG/PNG) captured from `source`.
    pub fn decode(bytes: &[u8], source: impl Into<String>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(anyhow!("empty image payload"));
        }
        let image = image::load_from_memory(bytes).context("decode image")?;
        Ok(Self::from_image(image, source))
    }

    pub fn from_image(image: DynamicImage, source: impl Into<String>) -> Self {
        let rgb = image.to_rgb8();
        let grey = is_monochrome(&rgb);
        let image = if grey {
            DynamicImage::ImageLuma8(image.to_luma8())
        } else {
            DynamicImage::ImageRgb8(rgb)
        };
        let content_hash = hex::encode(Sha256::digest(image.as_bytes()));
        Self {
            image,
            content_hash,
            source: source.into(),
            grey,
        }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.dimensions().0
    }

    pub fn height(&self) -> u32 {
        self.image.dimensions().1
    }

    /// Hex SHA-256 of the decoded pixels.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_grey(&self) -> bool {
        self.grey
    }

    /// Colour copy for drawing and for the vehicle model.
    pub fn to_rgb(&self) -> RgbImage {
        self.image.to_rgb8()
    }

    /// Encode the frame as JPEG.
    pub fn encode_jpeg(&self) -> Result<Vec<u8>> {
        encode_jpeg(&self.image)
    }
}

pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .context("encode jpeg")?;
    Ok(out.into_inner())
}

fn is_monochrome(rgb: &RgbImage) -> bool {
    rgb.pixels().all(|p| p[0] == p[1] && p[1] == p[2])
}
