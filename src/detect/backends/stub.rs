use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;
use crate::frame::{Frame, Rect};

/// Synthetic detector for `stub://` deployments and tests.
///
/// Emits a vehicle drifting left to right, a slower pedestrian, and a
/// low-confidence bike that the annotator is expected to discard.
pub struct StubBackend {
    frame_count: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self { frame_count: 0 }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        self.frame_count += 1;
        let width = frame.width() as f32;
        let height = frame.height() as f32;
        let box_w = (width / 8.0).max(1.0);
        let box_h = (height / 6.0).max(1.0);
        let span = (width - box_w).max(1.0);

        let car_x = (self.frame_count as f32 * 4.0) % span;
        let person_x = span - (self.frame_count as f32 * 1.5) % span;

        Ok(vec![
            RawDetection::new(0, 0.9, Rect::new(car_x, height * 0.5, box_w, box_h)),
            RawDetection::new(1, 0.8, Rect::new(person_x, height * 0.2, box_w / 2.0, box_h)),
            RawDetection::new(2, 0.4, Rect::new(width * 0.1, height * 0.7, box_w, box_h)),
        ])
    }
}
