//! Smart-city video relay
//!
//! Relays live, analytics-annotated video from several cameras to HTTP
//! clients. Two groups of threads share one `ChannelRegistry`:
//!
//! - the **producer** side: a supervised media graph that decodes every
//!   camera, runs detection, and hands each frame to a per-channel annotator,
//!   which pushes it into the registry only while someone is watching;
//! - the **consumer** side: one thread per HTTP connection, reading frames
//!   back out and emitting them as an MJPEG multipart stream, either per
//!   channel or as a mosaic of all channels.
//!
//! # Module Structure
//!
//! - `registry`: per-channel holding areas, liveness flags, last-frame cache
//! - `annotate`: FPS overlay, label mapping, tracking hand-off, publishing
//! - `pipeline`: graph construction and the restart supervisor
//! - `stream`: single-channel and composite MJPEG views
//! - `server`: HTTP routes
//! - `detect`, `tracking`, `metrics`: collaborators behind narrow traits

pub mod annotate;
pub mod config;
pub mod detect;
pub mod error;
pub mod fps;
pub mod frame;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod stream;
pub mod tracking;

pub use config::{CameraConfig, RelayConfig};
pub use error::RelayError;
pub use frame::{Frame, Rect};
pub use registry::{ChannelId, ChannelRegistry};
