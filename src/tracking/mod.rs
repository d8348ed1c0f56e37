//! Tracking collaborator.
//!
//! The annotator drives a `Tracker` once per frame: update with the current
//! labeled boxes, run one step, optionally check for collisions, then draw the
//! overlays the tracker reports. A step error is unrecoverable for the
//! process; tracker state is not resumable mid-stream.

mod iou;

use anyhow::Result;
use image::Rgb;

use crate::annotate::labels::{LabeledBox, ObjectLabel};
use crate::frame::{Frame, Rect};
use crate::registry::ChannelId;

pub use iou::{IouTracker, IouTrackerConfig};

/// Overlay item produced by a tracker for the current frame.
#[derive(Clone, Debug)]
pub struct TrackOverlay {
    pub id: u32,
    pub label: ObjectLabel,
    pub rect: Rect,
    pub trail: Vec<(f32, f32)>,
    pub color: Rgb<u8>,
    pub colliding: bool,
}

/// Two tracks whose boxes overlap on the same channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Collision {
    pub channel: ChannelId,
    pub first: u32,
    pub second: u32,
    pub labels: (ObjectLabel, ObjectLabel),
    pub position: (f32, f32),
}

pub trait Tracker: Send {
    fn is_initialized(&self) -> bool;

    /// Bind the tracker to a frame geometry and seed it with the first boxes.
    fn init(&mut self, width: u32, height: u32, initial: &[LabeledBox], channels: usize);

    /// Provide this frame's detections.
    fn update(&mut self, detections: &[LabeledBox]);

    /// Advance tracking by one frame. An error is a hard failure.
    fn step(&mut self, frame: &Frame) -> Result<()>;

    fn track_count(&self) -> usize;

    /// Report new collisions among vehicle-like tracks.
    fn detect_collision(&mut self) -> Vec<Collision>;

    fn overlays(&self) -> Vec<TrackOverlay>;
}
