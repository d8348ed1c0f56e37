use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use image::imageops::{self, FilterType};
use image::RgbImage;

use super::mjpeg::{encode_jpeg, multipart_part, Pacer};
use super::{PartSource, StreamSettings};
use crate::error::RelayError;
use crate::frame::Frame;
use crate::registry::ChannelRegistry;

/// Mosaic layout for `n` channels: `(rows, cols)`.
pub fn grid_dims(n: usize) -> (usize, usize) {
    let rows = ((n as f64 + 1.0).sqrt().floor() as usize).max(1);
    let cols = n.div_ceil(rows).max(1);
    (rows, cols)
}

/// Mosaic of every channel in one stream.
///
/// Tiles come from the shared cache when a single-channel view is attached
/// (read without consuming) and from the queue otherwise. Each request keeps
/// its own tiles, so the shared cache is only ever written by single views.
/// Channels read from the queue get their flag re-raised every tick, since a
/// single view detaching from the same channel lowers it.
pub struct CompositeStream {
    registry: Arc<ChannelRegistry>,
    settings: StreamSettings,
    rows: usize,
    cols: usize,
    tiles: Vec<Option<Arc<Frame>>>,
    last_delivery: Instant,
    pacer: Pacer,
}

impl CompositeStream {
    pub fn open(registry: Arc<ChannelRegistry>, settings: StreamSettings) -> Result<Self> {
        let n = registry.len();
        for ch in 0..n {
            registry.mark_active(ch)?;
        }
        let (rows, cols) = grid_dims(n);
        log::info!("composite stream attached ({} channel(s), {}x{} grid)", n, rows, cols);
        Ok(Self {
            pacer: Pacer::new(settings.fps),
            registry,
            settings,
            rows,
            cols,
            tiles: vec![None; n],
            last_delivery: Instant::now(),
        })
    }

    pub fn grid(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Canvas size as `(width, height)`.
    pub fn canvas_size(&self) -> (u32, u32) {
        (
            self.settings.tile_width * self.cols as u32,
            self.settings.tile_height * self.rows as u32,
        )
    }

    /// Refresh every tile once. Returns whether any tile changed.
    fn refresh(&mut self) -> Result<bool> {
        let mut delivered = false;
        for ch in 0..self.tiles.len() {
            let fresh = match self.registry.cached(ch)? {
                Some(shared) => Some(shared),
                None => {
                    self.registry.mark_active(ch)?;
                    match self.registry.drain_latest(ch)? {
                        Some(frame) => Some(Arc::new(frame)),
                        None => self
                            .registry
                            .recv_latest(ch, self.settings.tile_wait)?
                            .map(Arc::new),
                    }
                }
            };
            let Some(fresh) = fresh else {
                continue;
            };
            let same = self.tiles[ch]
                .as_ref()
                .map(|old| Arc::ptr_eq(old, &fresh))
                .unwrap_or(false);
            if !same {
                delivered = true;
                self.tiles[ch] = Some(fresh);
            }
        }
        Ok(delivered)
    }

    pub fn compose(&self) -> RgbImage {
        let (width, height) = self.canvas_size();
        let (tw, th) = (self.settings.tile_width, self.settings.tile_height);
        let mut canvas = RgbImage::new(width, height);
        for (idx, tile) in self.tiles.iter().enumerate() {
            let Some(tile) = tile else {
                continue;
            };
            let x = (idx % self.cols) as u32 * tw;
            let y = (idx / self.cols) as u32 * th;
            if tile.width() == tw && tile.height() == th {
                imageops::replace(&mut canvas, tile.image(), x as i64, y as i64);
            } else {
                let scaled = imageops::resize(tile.image(), tw, th, FilterType::Triangle);
                imageops::replace(&mut canvas, &scaled, x as i64, y as i64);
            }
        }
        canvas
    }

    /// Refresh tiles and build the next canvas.
    pub fn next_canvas(&mut self) -> Result<RgbImage> {
        if self.refresh()? {
            self.last_delivery = Instant::now();
        } else {
            let waited = self.last_delivery.elapsed();
            if waited >= self.settings.producer_timeout {
                log::error!("composite stream: no frames from any channel");
                return Err(RelayError::ProducerUnreachable {
                    channels: (0..self.tiles.len()).collect(),
                    waited_ms: waited.as_millis(),
                }
                .into());
            }
        }
        Ok(self.compose())
    }
}

impl PartSource for CompositeStream {
    fn next_part(&mut self) -> Result<Vec<u8>> {
        let canvas = self.next_canvas()?;
        let jpeg = encode_jpeg(&canvas, self.settings.jpeg_quality)?;
        self.pacer.wait();
        Ok(multipart_part(&jpeg))
    }
}

impl Drop for CompositeStream {
    fn drop(&mut self) {
        for ch in 0..self.tiles.len() {
            let attached = match self.registry.cached(ch) {
                Ok(cached) => cached.is_some(),
                Err(err) => {
                    log::warn!("channel {} cleanup failed: {:#}", ch, err);
                    continue;
                }
            };
            if attached {
                continue;
            }
            if let Err(err) = self.registry.mark_inactive(ch) {
                log::warn!("channel {} cleanup failed: {:#}", ch, err);
            }
        }
        log::info!("composite stream detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> StreamSettings {
        StreamSettings {
            fps: 200,
            producer_timeout: Duration::from_millis(80),
            tile_width: 16,
            tile_height: 8,
            tile_wait: Duration::from_millis(2),
            ..StreamSettings::default()
        }
    }

    #[test]
    fn grid_layouts() {
        assert_eq!(grid_dims(1), (1, 1));
        assert_eq!(grid_dims(2), (1, 2));
        assert_eq!(grid_dims(3), (2, 2));
        assert_eq!(grid_dims(5), (2, 3));
        assert_eq!(grid_dims(8), (3, 3));
    }

    #[test]
    fn five_channels_make_a_two_by_three_canvas() {
        let registry = Arc::new(ChannelRegistry::new(5));
        let stream = CompositeStream::open(registry, StreamSettings::default()).unwrap();
        assert_eq!(stream.grid(), (2, 3));
        assert_eq!(stream.canvas_size(), (3 * 640, 2 * 320));
        let canvas = stream.compose();
        assert_eq!((canvas.width(), canvas.height()), (1920, 640));
    }

    #[test]
    fn cached_frames_are_read_without_consuming() {
        let registry = Arc::new(ChannelRegistry::new(2));
        let mut stream = CompositeStream::open(registry.clone(), settings()).unwrap();

        let shared = Arc::new(Frame::from_image(RgbImage::from_pixel(16, 8, image::Rgb([9, 9, 9]))));
        registry.set_cached(0, shared.clone()).unwrap();
        registry.enqueue(0, Frame::blank(16, 8)).unwrap();
        registry.enqueue(1, Frame::blank(32, 16)).unwrap();

        let canvas = stream.next_canvas().unwrap();
        assert_eq!(registry.queued(0).unwrap(), 1);
        assert_eq!(registry.queued(1).unwrap(), 0);
        assert_eq!(*canvas.get_pixel(0, 0), image::Rgb([9, 9, 9]));
        assert!(Arc::ptr_eq(registry.cached(0).unwrap().as_ref().unwrap(), &shared));
        assert!(registry.cached(1).unwrap().is_none());
    }

    #[test]
    fn empty_tiles_keep_the_previous_frame() {
        let registry = Arc::new(ChannelRegistry::new(2));
        let mut stream = CompositeStream::open(registry.clone(), settings()).unwrap();
        registry
            .enqueue(1, Frame::from_image(RgbImage::from_pixel(16, 8, image::Rgb([50, 60, 70]))))
            .unwrap();
        stream.next_canvas().unwrap();
        let canvas = stream.next_canvas().unwrap();
        assert_eq!(*canvas.get_pixel(16, 0), image::Rgb([50, 60, 70]));
        assert_eq!(*canvas.get_pixel(0, 0), image::Rgb([0, 0, 0]));
    }

    #[test]
    fn times_out_when_nothing_arrives() {
        let registry = Arc::new(ChannelRegistry::new(2));
        let mut stream = CompositeStream::open(registry, settings()).unwrap();
        let started = Instant::now();
        let err = loop {
            match stream.next_canvas() {
                Ok(_) => assert!(started.elapsed() < Duration::from_secs(5)),
                Err(err) => break err,
            }
        };
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::ProducerUnreachable { channels, .. }) if channels == &vec![0, 1]
        ));
    }

    #[test]
    fn single_view_detaching_does_not_starve_the_mosaic() {
        let registry = Arc::new(ChannelRegistry::new(1));
        let mut stream = CompositeStream::open(registry.clone(), settings()).unwrap();
        drop(crate::stream::ChannelStream::open(registry.clone(), 0, settings()).unwrap());
        assert!(!registry.is_active(0).unwrap());

        stream.next_canvas().unwrap();
        assert!(registry.is_active(0).unwrap());
        let red = image::Rgb([200, 0, 0]);
        assert!(registry
            .enqueue(0, Frame::from_image(RgbImage::from_pixel(16, 8, red)))
            .unwrap());
        let canvas = stream.next_canvas().unwrap();
        assert_eq!(*canvas.get_pixel(0, 0), red);
    }

    #[test]
    fn only_the_newest_queued_frame_becomes_the_tile() {
        let registry = Arc::new(ChannelRegistry::new(1));
        let mut stream = CompositeStream::open(registry.clone(), settings()).unwrap();
        for shade in [10u8, 20, 30] {
            let frame = Frame::from_image(RgbImage::from_pixel(16, 8, image::Rgb([shade; 3])));
            registry.enqueue(0, frame).unwrap();
        }
        let canvas = stream.next_canvas().unwrap();
        assert_eq!(*canvas.get_pixel(0, 0), image::Rgb([30; 3]));
        assert_eq!(registry.queued(0).unwrap(), 0);
    }

    #[test]
    fn teardown_spares_channels_with_a_single_view() {
        let registry = Arc::new(ChannelRegistry::new(2));
        let stream = CompositeStream::open(registry.clone(), settings()).unwrap();
        registry.set_cached(1, Arc::new(Frame::blank(16, 8))).unwrap();
        registry.enqueue(0, Frame::blank(16, 8)).unwrap();
        drop(stream);
        assert!(!registry.is_active(0).unwrap());
        assert_eq!(registry.queued(0).unwrap(), 0);
        assert!(registry.is_active(1).unwrap());
    }
}
