//! Per-channel annotator.
//!
//! Runs once per decoded frame inside the pipeline branch that produced it:
//! FPS overlay, label mapping, optional tracking and collision checks, then a
//! hand-off to the registry when a consumer is attached.

pub mod labels;
pub mod overlay;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::detect::RawDetection;
use crate::error::RelayError;
use crate::fps::FpsMeter;
use crate::frame::Frame;
use crate::metrics::{MetricPoint, MetricsSink};
use crate::registry::{ChannelId, ChannelRegistry};
use crate::tracking::Tracker;

pub use labels::{classify, Analytic, LabeledBox, ObjectLabel, CONFIDENCE_THRESHOLD};
pub use overlay::Overlay;

/// Pause taken instead of enqueueing when nobody is watching the channel.
pub const IDLE_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug)]
pub struct AnnotatorSettings {
    pub tracking: bool,
    pub collision: bool,
}

impl Default for AnnotatorSettings {
    fn default() -> Self {
        Self {
            tracking: true,
            collision: true,
        }
    }
}

/// Shared, channel-independent pieces handed to every annotator.
#[derive(Clone)]
pub struct AnnotatorContext {
    pub registry: Arc<ChannelRegistry>,
    pub fps: Arc<FpsMeter>,
    pub overlay: Arc<Overlay>,
    pub metrics: Arc<dyn MetricsSink>,
    pub settings: AnnotatorSettings,
}

/// What one annotation pass did; returned for logging and tests.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Annotation {
    pub fps: f64,
    pub labeled: Vec<LabeledBox>,
    pub tracks: usize,
    pub collisions: usize,
}

pub struct ChannelAnnotator {
    channel: ChannelId,
    analytics: Vec<Analytic>,
    ctx: AnnotatorContext,
    tracker: Option<Box<dyn Tracker>>,
}

impl ChannelAnnotator {
    pub fn new(
        channel: ChannelId,
        analytics: Vec<Analytic>,
        ctx: AnnotatorContext,
        tracker: Option<Box<dyn Tracker>>,
    ) -> Self {
        Self {
            channel,
            analytics,
            ctx,
            tracker,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    fn tracking_enabled(&self) -> bool {
        self.ctx.settings.tracking && self.tracker.is_some()
    }

    fn collision_enabled(&self) -> bool {
        self.ctx.settings.collision
            && (self.analytics.contains(&Analytic::Vehicle)
                || self.analytics.contains(&Analytic::Bike))
    }

    /// Draw diagnostics and detection or tracking overlays onto `frame`.
    pub fn annotate(&mut self, frame: &mut Frame, detections: &[RawDetection]) -> Result<Annotation> {
        let fps = self.ctx.fps.update(self.channel)?;
        let overlay = self.ctx.overlay.clone();
        overlay.draw_fps(frame, fps);

        let labeled = classify(detections, &self.analytics);
        let mut result = Annotation {
            fps,
            ..Annotation::default()
        };

        if !self.tracking_enabled() {
            for det in &labeled {
                overlay.draw_labeled_box(frame, &det.rect, det.label.as_str(), overlay::BOX_COLOR);
            }
            self.record_counts(&labeled);
            result.labeled = labeled;
            return Ok(result);
        }

        let channels = self.ctx.registry.len();
        let collision = self.collision_enabled();
        let channel = self.channel;
        let Some(tracker) = self.tracker.as_mut() else {
            return Ok(result);
        };
        if !tracker.is_initialized() {
            tracker.init(frame.width(), frame.height(), &labeled, channels);
        }
        tracker.update(&labeled);
        tracker
            .step(frame)
            .map_err(|err| RelayError::AnnotatorFatal {
                channel,
                reason: err.to_string(),
            })?;
        result.tracks = tracker.track_count();
        if result.tracks != 0 {
            if collision {
                let hits = tracker.detect_collision();
                result.collisions = hits.len();
                for hit in hits {
                    log::info!(
                        "channel {}: collision between track {} ({}) and {} ({})",
                        channel,
                        hit.first,
                        hit.labels.0,
                        hit.second,
                        hit.labels.1
                    );
                    self.ctx.metrics.record(MetricPoint::Collision(hit));
                }
            }
            for item in tracker.overlays() {
                overlay.draw_trail(frame, &item.trail, item.color);
                let caption = format!("{} #{}", item.label, item.id);
                overlay.draw_labeled_box(frame, &item.rect, &caption, item.color);
            }
        }
        self.record_counts(&labeled);
        result.labeled = labeled;
        Ok(result)
    }

    /// Hand the frame to the registry if a consumer is attached; otherwise
    /// back off briefly and drop it. Returns whether it was enqueued.
    pub fn publish(&self, frame: Frame) -> Result<bool> {
        if self.ctx.registry.enqueue(self.channel, frame)? {
            return Ok(true);
        }
        std::thread::sleep(IDLE_BACKOFF);
        Ok(false)
    }

    /// Annotate then publish.
    pub fn process(&mut self, mut frame: Frame, detections: &[RawDetection]) -> Result<Annotation> {
        let annotation = self.annotate(&mut frame, detections)?;
        self.publish(frame)?;
        Ok(annotation)
    }

    fn record_counts(&self, labeled: &[LabeledBox]) {
        let mut counts: HashMap<ObjectLabel, usize> = HashMap::new();
        for det in labeled {
            *counts.entry(det.label).or_default() += 1;
        }
        for (label, count) in counts {
            self.ctx.metrics.record(MetricPoint::ObjectCount {
                channel: self.channel,
                label,
                count,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Rect;
    use crate::metrics::MemorySink;
    use crate::tracking::{IouTracker, TrackOverlay};

    fn context(channels: usize, settings: AnnotatorSettings) -> (AnnotatorContext, Arc<MemorySink>) {
        let metrics = Arc::new(MemorySink::new());
        let ctx = AnnotatorContext {
            registry: Arc::new(ChannelRegistry::new(channels)),
            fps: Arc::new(FpsMeter::new(channels)),
            overlay: Arc::new(Overlay::boxes_only()),
            metrics: metrics.clone(),
            settings,
        };
        (ctx, metrics)
    }

    fn all() -> Vec<Analytic> {
        vec![Analytic::Pedestrian, Analytic::Vehicle, Analytic::Bike]
    }

    #[test]
    fn low_confidence_never_reaches_output() {
        let settings = AnnotatorSettings {
            tracking: false,
            collision: false,
        };
        let (ctx, metrics) = context(1, settings);
        let mut annotator = ChannelAnnotator::new(0, all(), ctx, None);
        let mut frame = Frame::blank(64, 64);
        let dets = [RawDetection::new(0, 0.4, Rect::new(10.0, 10.0, 20.0, 20.0))];
        let out = annotator.annotate(&mut frame, &dets).unwrap();
        assert!(out.labeled.is_empty());
        assert!(frame.pixels().iter().all(|&p| p == 0));
        assert!(metrics.points().is_empty());
    }

    #[test]
    fn untracked_detections_are_drawn_directly() {
        let settings = AnnotatorSettings {
            tracking: false,
            collision: false,
        };
        let (ctx, metrics) = context(1, settings);
        let mut annotator = ChannelAnnotator::new(0, vec![Analytic::Vehicle], ctx, None);
        let mut frame = Frame::blank(64, 64);
        let dets = [
            RawDetection::new(0, 0.9, Rect::new(10.0, 10.0, 20.0, 20.0)),
            RawDetection::new(1, 0.9, Rect::new(40.0, 40.0, 10.0, 10.0)),
        ];
        let out = annotator.annotate(&mut frame, &dets).unwrap();
        assert_eq!(out.labeled.len(), 1);
        assert_eq!(*frame.image().get_pixel(10, 10), overlay::BOX_COLOR);
        assert_eq!(*frame.image().get_pixel(40, 40), image::Rgb([0, 0, 0]));
        assert_eq!(metrics.points().len(), 1);
    }

    #[test]
    fn tracking_reports_collisions_to_metrics() {
        let (ctx, metrics) = context(1, AnnotatorSettings::default());
        let tracker: Box<dyn Tracker> = Box::new(IouTracker::new(0));
        let mut annotator = ChannelAnnotator::new(0, all(), ctx, Some(tracker));
        let dets = [
            RawDetection::new(0, 0.9, Rect::new(100.0, 100.0, 40.0, 20.0)),
            RawDetection::new(2, 0.9, Rect::new(110.0, 105.0, 40.0, 20.0)),
        ];
        let mut frame = Frame::blank(320, 240);
        let out = annotator.annotate(&mut frame, &dets).unwrap();
        assert_eq!(out.tracks, 2);
        assert_eq!(out.collisions, 1);
        assert!(metrics
            .points()
            .iter()
            .any(|p| matches!(p, MetricPoint::Collision(_))));
    }

    #[test]
    fn collision_check_needs_vehicle_or_bike_enabled() {
        let (ctx, _) = context(1, AnnotatorSettings::default());
        let tracker: Box<dyn Tracker> = Box::new(IouTracker::new(0));
        let mut annotator =
            ChannelAnnotator::new(0, vec![Analytic::Pedestrian], ctx, Some(tracker));
        let dets = [
            RawDetection::new(1, 0.9, Rect::new(100.0, 100.0, 40.0, 20.0)),
            RawDetection::new(1, 0.9, Rect::new(105.0, 100.0, 40.0, 20.0)),
        ];
        let out = annotator.annotate(&mut Frame::blank(320, 240), &dets).unwrap();
        assert_eq!(out.collisions, 0);
    }

    struct BrokenTracker;

    impl Tracker for BrokenTracker {
        fn is_initialized(&self) -> bool {
            true
        }
        fn init(&mut self, _: u32, _: u32, _: &[LabeledBox], _: usize) {}
        fn update(&mut self, _: &[LabeledBox]) {}
        fn step(&mut self, _: &Frame) -> Result<()> {
            Err(anyhow::anyhow!("tracker state corrupted"))
        }
        fn track_count(&self) -> usize {
            0
        }
        fn detect_collision(&mut self) -> Vec<crate::tracking::Collision> {
            Vec::new()
        }
        fn overlays(&self) -> Vec<TrackOverlay> {
            Vec::new()
        }
    }

    #[test]
    fn tracker_failure_is_fatal() {
        let (ctx, _) = context(1, AnnotatorSettings::default());
        let mut annotator = ChannelAnnotator::new(0, all(), ctx, Some(Box::new(BrokenTracker)));
        let err = annotator.process(Frame::blank(8, 8), &[]).unwrap_err();
        let relay = err.downcast_ref::<RelayError>().expect("typed error");
        assert!(relay.is_fatal());
    }

    #[test]
    fn publish_only_enqueues_for_active_channels() {
        let settings = AnnotatorSettings {
            tracking: false,
            collision: false,
        };
        let (ctx, _) = context(2, settings);
        let registry = ctx.registry.clone();
        let annotator = ChannelAnnotator::new(1, all(), ctx, None);

        assert!(!annotator.publish(Frame::blank(4, 4)).unwrap());
        assert_eq!(registry.queued(1).unwrap(), 0);

        registry.mark_active(1).unwrap();
        assert!(annotator.publish(Frame::blank(4, 4)).unwrap());
        assert_eq!(registry.queued(1).unwrap(), 1);
        assert_eq!(registry.queued(0).unwrap(), 0);
    }
}
