use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use image::DynamicImage;

use crate::detect::backend::Detector;
use crate::detect::result::RawDetection;

/// Scripted detector for tests and `stub://` model paths.
///
/// Each `predict` call pops the next scripted cycle; once the script is empty
/// the fixed response is returned. A scripted `Err` lets tests exercise the
/// inference-failure path.
pub struct StubDetector {
    name: String,
    script: Mutex<VecDeque<Result<Vec<RawDetection>, String>>>,
    fixed: Vec<RawDetection>,
}

impl StubDetector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fixed: Vec::new(),
        }
    }

    /// Respond with `detections` on every call once the script is exhausted.
    pub fn with_fixed(mut self, detections: Vec<RawDetection>) -> Self {
        self.fixed = detections;
        self
    }

    /// Queue the response for one future call.
    pub fn push(&self, detections: Vec<RawDetection>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(detections));
        }
    }

    /// Queue an inference failure for one future call.
    pub fn push_error(&self, message: impl Into<String>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(message.into()));
        }
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, _image: &DynamicImage) -> Result<Vec<RawDetection>> {
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("stub script lock poisoned"))?
            .pop_front();
        match next {
            Some(Ok(detections)) => Ok(detections),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(self.fixed.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;

    #[test]
    fn stub_replays_script_then_fixed() {
        let fixed = vec![RawDetection::new("cat", 0.7, BoundingBox::new(0.0, 0.0, 0.1, 0.1))];
        let stub = StubDetector::new("stub").with_fixed(fixed.clone());
        stub.push(vec![]);
        stub.push_error("bad shape");
        let img = DynamicImage::new_rgb8(2, 2);

        assert!(stub.predict(&img).unwrap().is_empty());
        assert!(stub.predict(&img).is_err());
        assert_eq!(stub.predict(&img).unwrap(), fixed);
        assert_eq!(stub.predict(&img).unwrap(), fixed);
    }
}
