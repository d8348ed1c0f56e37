use anyhow::Result;

use super::result::RawDetection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// One instance serves one pipeline branch, so `detect` may keep per-stream
/// state. Implementations treat the frame as read-only.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a decoded frame. Boxes are in frame pixel coordinates.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
