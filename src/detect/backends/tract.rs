#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops::FilterType, DynamicImage};
use tract_onnx::prelude::*;

use crate::detect::backend::Detector;
use crate::detect::result::RawDetection;
use crate::{overlap, BoundingBox};

const NMS_THRESHOLD: f32 = 0.6;

/// Tract-based YOLOv4 detector.
///
/// Expects the two-output layout of a darknet export: boxes `[1, N, 1, 4]` as
/// normalized `x1, y1, x2, y2` and confidences `[1, N, classes]`.
/// `SimplePlan::run` takes `&self`, so one instance serves every worker.
pub struct TractDetector {
    name: String,
    model: TypedRunnableModel<TypedModel>,
    labels: Vec<String>,
    width: u32,
    height: u32,
    channels: u32,
    prob_threshold: f32,
}

impl TractDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        name: &str,
        model_path: P,
        labels: Vec<String>,
        width: u32,
        height: u32,
        channels: u32,
        prob_threshold: f32,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        if channels != 1 && channels != 3 {
            return Err(anyhow!("model {} must have 1 or 3 channels", name));
        }
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, channels as usize, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            name: name.to_string(),
            model,
            labels,
            width,
            height,
            channels,
            prob_threshold,
        })
    }

    fn build_input(&self, image: &DynamicImage) -> Tensor {
        let width = self.width as usize;
        let height = self.height as usize;
        if self.channels == 1 {
            let grey = image
                .resize_exact(self.width, self.height, FilterType::Triangle)
                .to_luma8();
            tract_ndarray::Array4::from_shape_fn((1, 1, height, width), |(_, _, y, x)| {
                grey.get_pixel(x as u32, y as u32)[0] as f32 / 255.0
            })
            .into_tensor()
        } else {
            let rgb = image
                .resize_exact(self.width, self.height, FilterType::Triangle)
                .to_rgb8();
            tract_ndarray::Array4::from_shape_fn((1, 3, height, width), |(_, c, y, x)| {
                rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
            })
            .into_tensor()
        }
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<Vec<RawDetection>> {
        let boxes = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no box output"))?
            .to_array_view::<f32>()
            .context("box tensor was not f32")?;
        let confs = outputs
            .get(1)
            .ok_or_else(|| anyhow!("model produced no confidence output"))?
            .to_array_view::<f32>()
            .context("confidence tensor was not f32")?;

        let count = boxes.len() / 4;
        let boxes = boxes
            .into_shape((count, 4))
            .context("unexpected box tensor shape")?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let classes = confs.len() / count;
        let confs = confs
            .into_shape((count, classes))
            .context("unexpected confidence tensor shape")?;

        let mut candidates = Vec::new();
        for i in 0..count {
            let (class_id, prob) = confs
                .row(i)
                .iter()
                .copied()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |best, (id, p)| {
                    if p > best.1 {
                        (id, p)
                    } else {
                        best
                    }
                });
            if prob <= self.prob_threshold {
                continue;
            }
            let (x1, y1, x2, y2) = (boxes[[i, 0]], boxes[[i, 1]], boxes[[i, 2]], boxes[[i, 3]]);
            let left = x1.clamp(0.0, 1.0);
            let top = y1.clamp(0.0, 1.0);
            let bbox = BoundingBox::new(left, top, x2.clamp(0.0, 1.0) - left, y2.clamp(0.0, 1.0) - top);
            let class = self
                .labels
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| format!("class{}", class_id));
            candidates.push(RawDetection::new(class, prob, bbox));
        }
        Ok(non_max_suppression(candidates, NMS_THRESHOLD))
    }
}

/// Greedy per-class NMS, highest probability first.
fn non_max_suppression(mut candidates: Vec<RawDetection>, threshold: f32) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    let mut kept: Vec<RawDetection> = Vec::new();
    for cand in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.class == cand.class && overlap(&k.bbox, &cand.bbox) > threshold);
        if !suppressed {
            kept.push(cand);
        }
    }
    kept
}

impl Detector for TractDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, image: &DynamicImage) -> Result<Vec<RawDetection>> {
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs)
    }

    fn warm_up(&self) -> Result<()> {
        let blank = DynamicImage::new_rgb8(self.width, self.height);
        self.predict(&blank).map(|_| ())
    }
}
