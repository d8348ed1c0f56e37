use std::collections::HashSet;

use anyhow::{anyhow, Result};
use image::Rgb;

use super::{Collision, TrackOverlay, Tracker};
use crate::annotate::labels::{LabeledBox, ObjectLabel};
use crate::frame::{Frame, Rect};
use crate::registry::ChannelId;

/// Tuning for `IouTracker`.
#[derive(Clone, Debug)]
pub struct IouTrackerConfig {
    /// Minimum IoU for a detection to continue an existing track.
    pub match_iou: f32,
    /// Frames a track survives without a matching detection.
    pub max_lost_frames: u32,
    /// Trajectory points kept per track.
    pub trail_len: usize,
    /// Minimum IoU between two vehicle-like tracks to count as a collision.
    pub collision_iou: f32,
}

impl Default for IouTrackerConfig {
    fn default() -> Self {
        Self {
            match_iou: 0.3,
            max_lost_frames: 10,
            trail_len: 30,
            collision_iou: 0.05,
        }
    }
}

#[derive(Clone, Debug)]
struct Track {
    id: u32,
    label: ObjectLabel,
    rect: Rect,
    trail: Vec<(f32, f32)>,
    frames_lost: u32,
    age: u32,
}

impl Track {
    fn push_center(&mut self, limit: usize) {
        self.trail.push(self.rect.center());
        if self.trail.len() > limit {
            self.trail.remove(0);
        }
    }
}

/// Greedy IoU multi-object tracker, one instance per channel.
///
/// Detections are matched to live tracks of the same label in descending IoU
/// order; unmatched detections open new tracks and unmatched tracks age out
/// after `max_lost_frames`.
pub struct IouTracker {
    channel: ChannelId,
    config: IouTrackerConfig,
    geometry: Option<(u32, u32)>,
    channels: usize,
    pending: Vec<LabeledBox>,
    tracks: Vec<Track>,
    next_id: u32,
    reported: HashSet<(u32, u32)>,
    colliding: HashSet<u32>,
}

impl IouTracker {
    pub fn new(channel: ChannelId) -> Self {
        Self::with_config(channel, IouTrackerConfig::default())
    }

    pub fn with_config(channel: ChannelId, config: IouTrackerConfig) -> Self {
        Self {
            channel,
            config,
            geometry: None,
            channels: 0,
            pending: Vec::new(),
            tracks: Vec::new(),
            next_id: 1,
            reported: HashSet::new(),
            colliding: HashSet::new(),
        }
    }

    /// Channel count the tracker was initialised with.
    pub fn channels(&self) -> usize {
        self.channels
    }

    fn open_track(&mut self, det: &LabeledBox) {
        let mut track = Track {
            id: self.next_id,
            label: det.label,
            rect: det.rect,
            trail: Vec::new(),
            frames_lost: 0,
            age: 1,
        };
        track.push_center(self.config.trail_len);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.tracks.push(track);
    }
}

impl Tracker for IouTracker {
    fn is_initialized(&self) -> bool {
        self.geometry.is_some()
    }

    fn init(&mut self, width: u32, height: u32, initial: &[LabeledBox], channels: usize) {
        self.geometry = Some((width, height));
        self.channels = channels;
        self.tracks.clear();
        self.reported.clear();
        self.colliding.clear();
        for det in initial {
            self.open_track(det);
        }
    }

    fn update(&mut self, detections: &[LabeledBox]) {
        self.pending = detections.to_vec();
    }

    fn step(&mut self, frame: &Frame) -> Result<()> {
        let (width, height) = self
            .geometry
            .ok_or_else(|| anyhow!("tracker stepped before init"))?;
        if frame.width() != width || frame.height() != height {
            return Err(anyhow!(
                "frame geometry changed from {}x{} to {}x{}",
                width,
                height,
                frame.width(),
                frame.height()
            ));
        }

        let detections = std::mem::take(&mut self.pending);
        let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                if track.label != det.label {
                    continue;
                }
                let iou = track.rect.iou(&det.rect);
                if iou >= self.config.match_iou {
                    candidates.push((iou, ti, di));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut track_used = vec![false; self.tracks.len()];
        let mut det_used = vec![false; detections.len()];
        for (_, ti, di) in candidates {
            if track_used[ti] || det_used[di] {
                continue;
            }
            track_used[ti] = true;
            det_used[di] = true;
            let track = &mut self.tracks[ti];
            track.rect = detections[di].rect;
            track.frames_lost = 0;
            track.age += 1;
            track.push_center(self.config.trail_len);
        }

        for (ti, used) in track_used.iter().enumerate() {
            if !used {
                self.tracks[ti].frames_lost += 1;
            }
        }
        let max_lost = self.config.max_lost_frames;
        self.tracks.retain(|t| t.frames_lost <= max_lost);

        for (di, det) in detections.iter().enumerate() {
            if !det_used[di] {
                self.open_track(det);
            }
        }

        let live: HashSet<u32> = self.tracks.iter().map(|t| t.id).collect();
        self.reported
            .retain(|(a, b)| live.contains(a) && live.contains(b));
        self.colliding.retain(|id| live.contains(id));
        Ok(())
    }

    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn detect_collision(&mut self) -> Vec<Collision> {
        let visible: Vec<&Track> = self
            .tracks
            .iter()
            .filter(|t| t.frames_lost == 0 && t.label.is_vehicle_like())
            .collect();
        let mut found = Vec::new();
        for (i, a) in visible.iter().enumerate() {
            for b in &visible[i + 1..] {
                if a.rect.iou(&b.rect) < self.config.collision_iou {
                    continue;
                }
                let key = (a.id.min(b.id), a.id.max(b.id));
                if !self.reported.insert(key) {
                    continue;
                }
                let (ax, ay) = a.rect.center();
                let (bx, by) = b.rect.center();
                found.push(Collision {
                    channel: self.channel,
                    first: key.0,
                    second: key.1,
                    labels: (a.label, b.label),
                    position: ((ax + bx) / 2.0, (ay + by) / 2.0),
                });
            }
        }
        for c in &found {
            self.colliding.insert(c.first);
            self.colliding.insert(c.second);
        }
        found
    }

    fn overlays(&self) -> Vec<TrackOverlay> {
        self.tracks
            .iter()
            .filter(|t| t.frames_lost == 0)
            .map(|t| {
                let colliding = self.colliding.contains(&t.id);
                TrackOverlay {
                    id: t.id,
                    label: t.label,
                    rect: t.rect,
                    trail: t.trail.clone(),
                    color: if colliding {
                        Rgb([255, 0, 0])
                    } else {
                        t.label.color()
                    },
                    colliding,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(label: ObjectLabel, x: f32, y: f32) -> LabeledBox {
        LabeledBox {
            label,
            rect: Rect::new(x, y, 40.0, 20.0),
            confidence: 0.9,
        }
    }

    fn started(initial: &[LabeledBox]) -> (IouTracker, Frame) {
        let mut tracker = IouTracker::new(0);
        tracker.init(640, 320, initial, 2);
        (tracker, Frame::blank(640, 320))
    }

    #[test]
    fn keeps_identity_across_small_moves() {
        let (mut tracker, frame) = started(&[boxed(ObjectLabel::Car, 10.0, 10.0)]);
        assert!(tracker.is_initialized());
        assert_eq!(tracker.channels(), 2);
        for step in 1..5 {
            tracker.update(&[boxed(ObjectLabel::Car, 10.0 + step as f32 * 3.0, 10.0)]);
            tracker.step(&frame).unwrap();
        }
        let overlays = tracker.overlays();
        assert_eq!(overlays.len(), 1);
        assert_eq!(overlays[0].id, 1);
        assert_eq!(overlays[0].trail.len(), 5);
    }

    #[test]
    fn lost_tracks_expire() {
        let (mut tracker, frame) = started(&[boxed(ObjectLabel::Person, 10.0, 10.0)]);
        for _ in 0..=IouTrackerConfig::default().max_lost_frames {
            tracker.update(&[]);
            tracker.step(&frame).unwrap();
        }
        assert_eq!(tracker.track_count(), 0);
    }

    #[test]
    fn overlapping_vehicles_collide_once() {
        let (mut tracker, frame) = started(&[]);
        let pair = [
            boxed(ObjectLabel::Car, 100.0, 100.0),
            boxed(ObjectLabel::Bicycle, 120.0, 105.0),
        ];
        tracker.update(&pair);
        tracker.step(&frame).unwrap();
        let hits = tracker.detect_collision();
        assert_eq!(hits.len(), 1);
        assert_eq!((hits[0].first, hits[0].second), (1, 2));

        tracker.update(&pair);
        tracker.step(&frame).unwrap();
        assert!(tracker.detect_collision().is_empty());
        assert!(tracker.overlays().iter().all(|o| o.colliding));
    }

    #[test]
    fn pedestrians_never_collide() {
        let (mut tracker, frame) = started(&[]);
        tracker.update(&[
            boxed(ObjectLabel::Person, 100.0, 100.0),
            boxed(ObjectLabel::Car, 105.0, 100.0),
        ]);
        tracker.step(&frame).unwrap();
        assert!(tracker.detect_collision().is_empty());
    }

    #[test]
    fn geometry_change_is_a_hard_failure() {
        let (mut tracker, _) = started(&[]);
        assert!(tracker.step(&Frame::blank(320, 160)).is_err());
        assert!(IouTracker::new(1).step(&Frame::blank(1, 1)).is_err());
    }
}
