//! Pixel buffers moved between the pipeline and the stream multiplexer.
//!
//! - `Frame`: owned RGB8 buffer with its dimensions.
//! - `Rect`: pixel-space box used by detections, tracks and overlays.
//!
//! Frames carry no timestamp; ordering is arrival order within a channel.

use anyhow::{anyhow, Result};
use image::RgbImage;

/// Owned RGB8 frame.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    /// Wrap raw interleaved RGB bytes. Fails if the length does not match.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, data)
            .ok_or_else(|| anyhow!("frame buffer rejected"))?;
        Ok(Self { image })
    }

    /// Solid black frame.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            image: RgbImage::new(width, height),
        }
    }

    pub fn from_image(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

}

/// Axis-aligned box in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn intersection(&self, other: &Rect) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    /// Intersection over union, 0.0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &Rect) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Clamp into a `width` x `height` frame.
    pub fn clamped(&self, width: u32, height: u32) -> Rect {
        let max_x = width as f32;
        let max_y = height as f32;
        let x = self.x.clamp(0.0, max_x);
        let y = self.y.clamp(0.0, max_y);
        let x2 = (self.x + self.w).clamp(0.0, max_x);
        let y2 = (self.y + self.h).clamp(0.0, max_y);
        Rect::new(x, y, x2 - x, y2 - y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgb_rejects_wrong_length() {
        assert!(Frame::from_rgb(4, 4, vec![0u8; 10]).is_err());
        let frame = Frame::from_rgb(4, 4, vec![7u8; 48]).unwrap();
        assert_eq!(frame.width(), 4);
        assert_eq!(frame.height(), 4);
        assert_eq!(frame.pixels().len(), 48);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(20.0, 20.0, 5.0, 5.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn clamped_stays_inside_frame() {
        let r = Rect::new(-5.0, 10.0, 30.0, 100.0).clamped(20, 40);
        assert_eq!(r, Rect::new(0.0, 10.0, 20.0, 30.0));
    }
}
