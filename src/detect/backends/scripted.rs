use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;
use crate::frame::Frame;

/// Returns the same detections for every frame.
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    detections: Vec<RawDetection>,
}

impl ScriptedBackend {
    pub fn new(detections: Vec<RawDetection>) -> Self {
        Self { detections }
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>> {
        Ok(self.detections.clone())
    }
}
