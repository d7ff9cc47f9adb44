use std::sync::Arc;

use anyhow::Result;
use image::DynamicImage;

use crate::detect::backend::Detector;
use crate::detect::backends::StubDetector;
use crate::detect::result::RawDetection;
use crate::frame::Frame;

/// How to build one model.
#[derive(Clone, Debug)]
pub struct ModelSettings {
    pub name: String,
    /// `stub://...` for the scripted backend, otherwise an ONNX file.
    pub path: String,
    pub labels: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub prob_threshold: f32,
}

#[derive(Clone, Debug)]
pub struct ModelsSettings {
    pub color: ModelSettings,
    pub grey: ModelSettings,
    pub vehicle: Option<ModelSettings>,
}

/// The detection models shared by all camera workers.
///
/// Colour frames go to the colour model, night-vision frames to the grayscale
/// model; cameras with vehicle checking also run the vehicle model on a colour
/// copy and get its detections appended.
#[derive(Clone)]
pub struct ModelSet {
    color: Arc<dyn Detector>,
    grey: Arc<dyn Detector>,
    vehicle: Option<Arc<dyn Detector>>,
}

impl ModelSet {
    pub fn new(
        color: Arc<dyn Detector>,
        grey: Arc<dyn Detector>,
        vehicle: Option<Arc<dyn Detector>>,
    ) -> Self {
        Self {
            color,
            grey,
            vehicle,
        }
    }

    /// Build every configured model and run its warm-up hook.
    pub fn load(settings: &ModelsSettings) -> Result<Self> {
        let color = build_detector(&settings.color)?;
        let grey = build_detector(&settings.grey)?;
        let vehicle = settings.vehicle.as_ref().map(build_detector).transpose()?;
        for model in [Some(&color), Some(&grey), vehicle.as_ref()]
            .into_iter()
            .flatten()
        {
            log::info!("warming up model {}", model.name());
            model.warm_up()?;
        }
        Ok(Self::new(color, grey, vehicle))
    }

    /// Run the models a camera needs on one frame.
    pub fn predict(&self, frame: &Frame, vehicle_check: bool) -> Result<Vec<RawDetection>> {
        let primary = if frame.is_grey() {
            &self.grey
        } else {
            &self.color
        };
        let mut detections = primary.predict(frame.image())?;
        if vehicle_check {
            if let Some(vehicle) = &self.vehicle {
                let rgb = DynamicImage::ImageRgb8(frame.to_rgb());
                detections.extend(vehicle.predict(&rgb)?);
            }
        }
        Ok(detections)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = vec![self.color.name().to_string(), self.grey.name().to_string()];
        if let Some(vehicle) = &self.vehicle {
            names.push(vehicle.name().to_string());
        }
        names
    }
}

fn build_detector(settings: &ModelSettings) -> Result<Arc<dyn Detector>> {
    if settings.path.starts_with("stub://") {
        return Ok(Arc::new(StubDetector::new(settings.name.clone())));
    }
    #[cfg(feature = "backend-tract")]
    {
        let detector = crate::detect::backends::TractDetector::new(
            &settings.name,
            &settings.path,
            settings.labels.clone(),
            settings.width,
            settings.height,
            settings.channels,
            settings.prob_threshold,
        )?;
        Ok(Arc::new(detector))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        Err(anyhow::anyhow!(
            "model {} ({}) requires the backend-tract feature",
            settings.name,
            settings.path
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;
    use image::{Rgb, RgbImage};

    fn stub_settings(name: &str) -> ModelSettings {
        ModelSettings {
            name: name.to_string(),
            path: format!("stub://{}", name),
            labels: vec![],
            width: 608,
            height: 608,
            channels: 3,
            prob_threshold: 0.1,
        }
    }

    #[test]
    fn load_builds_stub_models() {
        let set = ModelSet::load(&ModelsSettings {
            color: stub_settings("color"),
            grey: stub_settings("grey"),
            vehicle: None,
        })
        .unwrap();
        assert_eq!(set.names(), vec!["color", "grey"]);
    }

    #[test]
    fn grey_frames_use_grey_model_and_vehicle_is_appended() {
        let color = Arc::new(StubDetector::new("color"));
        let grey = Arc::new(StubDetector::new("grey"));
        let vehicle = Arc::new(StubDetector::new("vehicle"));
        let b = BoundingBox::new(0.1, 0.1, 0.1, 0.1);
        color.push(vec![RawDetection::new("person", 0.9, b)]);
        grey.push(vec![RawDetection::new("cat", 0.9, b)]);
        vehicle.push(vec![RawDetection::new("vehicle", 0.9, b)]);
        let set = ModelSet::new(color, grey, Some(vehicle as Arc<dyn Detector>));

        let ir = Frame::from_image(
            DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([5, 5, 5]))),
            "ir",
        );
        let classes: Vec<_> = set
            .predict(&ir, true)
            .unwrap()
            .into_iter()
            .map(|d| d.class)
            .collect();
        assert_eq!(classes, vec!["cat", "vehicle"]);
    }
}
