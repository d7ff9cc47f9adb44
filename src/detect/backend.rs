use anyhow::Result;
use image::DynamicImage;

use crate::detect::result::RawDetection;

/// Object-detection model.
///
/// One instance is shared read-only by every camera worker, so `predict` takes
/// `&self` and implementations must tolerate concurrent calls. No camera state
/// may live inside a model.
pub trait Detector: Send + Sync {
    /// Model identifier used in logs.
    fn name(&self) -> &str;

    /// Run inference on one frame. Boxes are normalized to the input image.
    fn predict(&self, image: &DynamicImage) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook, called once at startup.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
