//! Drawing primitives for annotated frames.
//!
//! Boxes and trajectories are always drawn. Text (FPS counter, labels, track
//! ids) uses the bundled DejaVu Sans Mono unless a font file is configured.

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut, text_size,
};

use crate::frame::{Frame, Rect};

pub const BOX_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const FPS_ORIGIN: (i32, i32) = (10, 20);
const BUNDLED_FONT: &[u8] = include_bytes!("./assets/DejaVuSansMono.ttf");

pub struct Overlay {
    font: Option<FontVec>,
    scale: PxScale,
    thickness: u32,
}

impl Overlay {
    /// Overlay with the bundled font.
    pub fn bundled() -> Result<Self> {
        let font = FontVec::try_from_vec(BUNDLED_FONT.to_vec())
            .context("parse bundled overlay font")?;
        Ok(Self {
            font: Some(font),
            ..Self::boxes_only()
        })
    }

    /// Overlay without text rendering.
    pub fn boxes_only() -> Self {
        Self {
            font: None,
            scale: PxScale::from(18.0),
            thickness: 2,
        }
    }

    pub fn with_font_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read overlay font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .with_context(|| format!("parse overlay font {}", path.display()))?;
        Ok(Self {
            font: Some(font),
            ..Self::boxes_only()
        })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// `FPS: <value>` in black on a white box near the top-left corner.
    pub fn draw_fps(&self, frame: &mut Frame, fps: f64) {
        let text = format!("FPS: {}", fps);
        self.draw_caption(frame.image_mut(), FPS_ORIGIN.0, FPS_ORIGIN.1, &text, WHITE);
    }

    /// Box outline plus a filled caption sitting on its top edge.
    pub fn draw_labeled_box(&self, frame: &mut Frame, rect: &Rect, text: &str, color: Rgb<u8>) {
        let (width, height) = (frame.width(), frame.height());
        let rect = rect.clamped(width, height);
        let image = frame.image_mut();
        self.draw_box(image, &rect, color);
        self.draw_caption(image, rect.x as i32, rect.y as i32, text, color);
    }

    /// Polyline through `points`.
    pub fn draw_trail(&self, frame: &mut Frame, points: &[(f32, f32)], color: Rgb<u8>) {
        let image = frame.image_mut();
        for pair in points.windows(2) {
            draw_line_segment_mut(image, pair[0], pair[1], color);
        }
    }

    fn draw_box(&self, image: &mut RgbImage, rect: &Rect, color: Rgb<u8>) {
        for inset in 0..self.thickness {
            let w = rect.w as i64 - 2 * inset as i64;
            let h = rect.h as i64 - 2 * inset as i64;
            if w <= 0 || h <= 0 {
                break;
            }
            let r = imageproc::rect::Rect::at(rect.x as i32 + inset as i32, rect.y as i32 + inset as i32)
                .of_size(w as u32, h as u32);
            draw_hollow_rect_mut(image, r, color);
        }
    }

    /// Text whose baseline sits at `(x, baseline)`, on a filled background.
    fn draw_caption(&self, image: &mut RgbImage, x: i32, baseline: i32, text: &str, background: Rgb<u8>) {
        let Some(font) = &self.font else {
            return;
        };
        let (text_w, text_h) = text_size(self.scale, font, text);
        if text_w == 0 || text_h == 0 {
            return;
        }
        let top = baseline - text_h as i32 - 2;
        let bg = imageproc::rect::Rect::at(x, top).of_size(text_w + 2, text_h + 2);
        draw_filled_rect_mut(image, bg, background);
        draw_text_mut(image, BLACK, x + 1, top + 1, self.scale, font, text);
    }
}
