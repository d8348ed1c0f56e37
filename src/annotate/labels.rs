//! Mapping from model class ids to the labels drawn on screen.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use image::Rgb;
use serde::{Deserialize, Serialize};

use crate::detect::RawDetection;
use crate::frame::Rect;

/// Minimum confidence for a detection to be considered at all.
pub const CONFIDENCE_THRESHOLD: f32 = 0.5;

/// Analytics a channel can enable in its camera config.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Analytic {
    Pedestrian,
    Vehicle,
    Bike,
}

impl Analytic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Analytic::Pedestrian => "pedestrian",
            Analytic::Vehicle => "vehicle",
            Analytic::Bike => "bike",
        }
    }
}

impl FromStr for Analytic {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pedestrian" => Ok(Analytic::Pedestrian),
            "vehicle" => Ok(Analytic::Vehicle),
            "bike" => Ok(Analytic::Bike),
            other => Err(anyhow!("unknown analytic '{}'", other)),
        }
    }
}

impl fmt::Display for Analytic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain label attached to a surviving detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectLabel {
    Person,
    Car,
    Bicycle,
}

impl ObjectLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectLabel::Person => "person",
            ObjectLabel::Car => "car",
            ObjectLabel::Bicycle => "bicycle",
        }
    }

    pub fn color(&self) -> Rgb<u8> {
        match self {
            ObjectLabel::Person => Rgb([255, 64, 64]),
            ObjectLabel::Car => Rgb([64, 160, 255]),
            ObjectLabel::Bicycle => Rgb([64, 220, 64]),
        }
    }

    /// Labels that take part in collision checks.
    pub fn is_vehicle_like(&self) -> bool {
        matches!(self, ObjectLabel::Car | ObjectLabel::Bicycle)
    }

    /// Raw class id → label, gated by the channel's enabled analytics.
    pub fn from_class(class_id: u32, enabled: &[Analytic]) -> Option<ObjectLabel> {
        let (analytic, label) = match class_id {
            0 => (Analytic::Vehicle, ObjectLabel::Car),
            1 => (Analytic::Pedestrian, ObjectLabel::Person),
            2 => (Analytic::Bike, ObjectLabel::Bicycle),
            _ => return None,
        };
        enabled.contains(&analytic).then_some(label)
    }
}

impl fmt::Display for ObjectLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detection that survived thresholding and label mapping.
#[derive(Clone, Debug, PartialEq)]
pub struct LabeledBox {
    pub label: ObjectLabel,
    pub rect: Rect,
    pub confidence: f32,
}

/// Keep detections at or above the threshold whose class is enabled.
pub fn classify(detections: &[RawDetection], enabled: &[Analytic]) -> Vec<LabeledBox> {
    detections
        .iter()
        .filter(|det| det.confidence >= CONFIDENCE_THRESHOLD)
        .filter_map(|det| {
            ObjectLabel::from_class(det.class_id, enabled).map(|label| LabeledBox {
                label,
                rect: det.rect,
                confidence: det.confidence,
            })
        })
        .collect()
}
