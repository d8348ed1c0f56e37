use crate::frame::Rect;

/// Detection as reported by the model, before any label mapping.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    /// Model class id (0 = vehicle, 1 = person, 2 = bike for the shipped model).
    pub class_id: u32,
    pub confidence: f32,
    pub rect: Rect,
}

impl RawDetection {
    pub fn new(class_id: u32, confidence: f32, rect: Rect) -> Self {
        Self {
            class_id,
            confidence,
            rect,
        }
    }
}
