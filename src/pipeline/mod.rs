//! Analytics pipeline: graph construction, per-frame dispatch, supervision.
//!
//! The media graph is an external scheduler. It calls into the crate through
//! one narrow seam, `FrameHandler::on_frame`, once per decoded frame and per
//! channel, and reports end-of-stream or faults on its control bus.

pub mod launch;
mod supervisor;
mod synthetic;

#[cfg(feature = "pipeline-gstreamer")]
mod gst;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;

use crate::annotate::{AnnotatorContext, ChannelAnnotator};
use crate::config::CameraConfig;
use crate::detect::{self, DetectorBackend};
use crate::error::RelayError;
use crate::frame::Frame;
use crate::registry::ChannelId;
use crate::tracking::{IouTracker, Tracker};

#[cfg(feature = "pipeline-gstreamer")]
pub use gst::GstreamerFactory;
pub use supervisor::{RestartPolicy, RunOutcome, Supervisor, SupervisorHandle, SupervisorState};
pub use synthetic::{SyntheticFactory, SyntheticScript};

/// Width and height every branch scales to before detection.
pub const BRANCH_WIDTH: u32 = 640;
pub const BRANCH_HEIGHT: u32 = 320;

/// Per-frame callback attached at the post-decode point of a branch.
pub trait FrameHandler: Send {
    fn on_frame(&mut self, frame: Frame) -> Result<()>;
}

pub type SharedHandler = Arc<Mutex<dyn FrameHandler>>;

/// Control-plane message emitted by a running graph.
#[derive(Clone, Debug, PartialEq)]
pub enum BusMessage {
    Eos,
    Error {
        message: String,
        debug: Option<String>,
    },
    /// A frame handler failed in a way that must stop the process.
    Fatal { channel: ChannelId, reason: String },
}

/// A built, possibly running, dataflow graph.
pub trait MediaGraph: Send {
    fn start(&mut self) -> Result<()>;

    /// Wait up to `timeout` for an error or end-of-stream message.
    fn next_message(&mut self, timeout: Duration) -> Option<BusMessage>;

    /// Tear the graph down. Must be safe to call more than once.
    fn stop(&mut self) -> Result<()>;
}

/// Builds a fresh graph for the given cameras, one handler per channel.
pub trait GraphFactory: Send + Sync {
    fn build(
        &self,
        cameras: &[CameraConfig],
        handlers: &[SharedHandler],
    ) -> Result<Box<dyn MediaGraph>>;
}

/// Detection followed by annotation for one channel.
pub struct Branch {
    detector: Box<dyn DetectorBackend>,
    annotator: ChannelAnnotator,
}

impl Branch {
    pub fn new(detector: Box<dyn DetectorBackend>, annotator: ChannelAnnotator) -> Self {
        Self {
            detector,
            annotator,
        }
    }
}

impl FrameHandler for Branch {
    fn on_frame(&mut self, frame: Frame) -> Result<()> {
        let detections = self.detector.detect(&frame)?;
        self.annotator.process(frame, &detections)?;
        Ok(())
    }
}

/// Build one branch per camera. Trackers are created only when tracking is on.
pub fn build_branches(
    cameras: &[CameraConfig],
    model: &str,
    ctx: &AnnotatorContext,
) -> Result<Vec<SharedHandler>> {
    cameras
        .iter()
        .enumerate()
        .map(|(channel, cam)| {
            let mut detector = detect::build_backend(model, BRANCH_WIDTH, BRANCH_HEIGHT)?;
            detector.warm_up()?;
            let tracker: Option<Box<dyn Tracker>> = if ctx.settings.tracking {
                Some(Box::new(IouTracker::new(channel)))
            } else {
                None
            };
            let annotator =
                ChannelAnnotator::new(channel, cam.analytics.clone(), ctx.clone(), tracker);
            log::debug!(
                "channel {}: detector={} analytics={:?}",
                channel,
                detector.name(),
                cam.analytics
            );
            let handler: SharedHandler = Arc::new(Mutex::new(Branch::new(detector, annotator)));
            Ok(handler)
        })
        .collect()
}

/// Run a handler for one frame and translate failures into bus messages.
///
/// Returns `false` once a message has been posted; the caller should stop
/// feeding this branch.
pub(crate) fn dispatch(
    channel: ChannelId,
    handler: &SharedHandler,
    frame: Frame,
    bus: &Sender<BusMessage>,
) -> bool {
    let outcome = handler
        .lock()
        .map_err(|_| anyhow!("channel {} handler lock poisoned", channel))
        .and_then(|mut h| h.on_frame(frame));
    let Err(err) = outcome else {
        return true;
    };
    let message = match err.downcast_ref::<RelayError>() {
        Some(relay) if relay.is_fatal() => BusMessage::Fatal {
            channel,
            reason: relay.to_string(),
        },
        _ => BusMessage::Error {
            message: format!("channel {}: {}", channel, err),
            debug: Some(format!("{:?}", err)),
        },
    };
    let _ = bus.send(message);
    false
}
