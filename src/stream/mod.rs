//! Stream multiplexer: turns registry frames into MJPEG parts.
//!
//! Both views are pull-based. The HTTP layer asks for the next part and writes
//! it; the view owns the liveness bookkeeping for its channel(s) and releases
//! it on drop, so every exit path (disconnect, encode failure, producer
//! timeout) cleans up the same way.

mod composite;
mod mjpeg;
mod single;

use std::time::Duration;

pub use composite::{grid_dims, CompositeStream};
pub use mjpeg::{encode_jpeg, multipart_part, Pacer, BOUNDARY, CONTENT_TYPE};
pub use single::ChannelStream;

#[derive(Clone, Debug, PartialEq)]
pub struct StreamSettings {
    /// Parts emitted per second.
    pub fps: u32,
    /// How long a view waits for any frame before giving up.
    pub producer_timeout: Duration,
    /// Receive slice of the single-channel view; the liveness flag is
    /// re-asserted every slice.
    pub poll_slice: Duration,
    pub tile_width: u32,
    pub tile_height: u32,
    /// Longest wait for one empty tile in the composite view.
    pub tile_wait: Duration,
    pub jpeg_quality: u8,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            fps: 20,
            producer_timeout: Duration::from_secs(40),
            poll_slice: Duration::from_millis(10),
            tile_width: 640,
            tile_height: 320,
            tile_wait: Duration::from_millis(10),
            jpeg_quality: 80,
        }
    }
}

/// A view that yields encoded multipart parts.
pub trait PartSource: Send {
    fn next_part(&mut self) -> anyhow::Result<Vec<u8>>;
}
