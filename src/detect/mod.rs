//! Object detection step of each pipeline branch.
//!
//! The detector is an external collaborator: the pipeline hands it a decoded,
//! scaled frame and receives raw `(class id, confidence, box)` detections. The
//! annotator decides what to do with them.

mod backend;
mod backends;
mod result;

use std::path::Path;

use anyhow::Result;

pub use backend::DetectorBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use backends::{ScriptedBackend, StubBackend};
pub use result::RawDetection;

/// Build a detector for one branch.
///
/// `stub` selects the synthetic detector; anything else is treated as a path
/// to an ONNX model and requires the `backend-tract` feature.
pub fn build_backend(model: &str, width: u32, height: u32) -> Result<Box<dyn DetectorBackend>> {
    if model == "stub" || model.starts_with("stub://") {
        return Ok(Box::new(StubBackend::new()));
    }
    let path = Path::new(model);
    #[cfg(feature = "backend-tract")]
    {
        Ok(Box::new(TractBackend::new(path, width, height)?))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        let _ = (width, height);
        anyhow::bail!(
            "model {} requires the backend-tract feature",
            path.display()
        )
    }
}
