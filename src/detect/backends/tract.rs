#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;
use crate::frame::{Frame, Rect};

/// Tract-based backend for ONNX detection models.
///
/// Expects a model exported with NMS folded in, producing rows of
/// `[x1, y1, x2, y2, score, class]` in model input coordinates, shaped either
/// `[1, N, 6]` or `[N, 6]`.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
        })
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let resized;
        let image = if frame.width() == self.width && frame.height() == self.height {
            frame.image()
        } else {
            resized = imageops::resize(frame.image(), self.width, self.height, FilterType::Triangle);
            &resized
        };
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| image.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        input.into_tensor()
    }

    fn parse_rows(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<RawDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        let cols = *shape.last().ok_or_else(|| anyhow!("scalar model output"))?;
        if cols < 6 {
            return Err(anyhow!("expected rows of 6 values, got {}", cols));
        }
        let sx = frame.width() as f32 / self.width as f32;
        let sy = frame.height() as f32 / self.height as f32;
        let flat: Vec<f32> = view.iter().copied().collect();
        let detections = flat
            .chunks_exact(cols)
            .filter(|row| row[4].is_finite() && row[4] > 0.0)
            .map(|row| {
                let rect = Rect::new(
                    row[0] * sx,
                    row[1] * sy,
                    (row[2] - row[0]) * sx,
                    (row[3] - row[1]) * sy,
                );
                RawDetection::new(row[5].max(0.0) as u32, row[4], rect)
            })
            .collect();
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.parse_rows(outputs, frame)
    }
}
