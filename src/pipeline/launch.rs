//! GStreamer launch description for the analytics graph.
//!
//! One independent branch per channel:
//! `<source> ! decodebin ! videoconvert ! videoscale ! RGB caps ! appsink name=sink<i>`.
//! Detection runs on the samples pulled from each appsink.

use crate::config::CameraConfig;

pub const SINK_PREFIX: &str = "sink";

/// Element and property used to open a camera path.
pub fn source_element(path: &str) -> &'static str {
    if path.contains("/dev/video") {
        "v4l2src device"
    } else if path.contains("://") {
        "urisourcebin buffer-size=4096 uri"
    } else {
        "filesrc location"
    }
}

pub fn sink_name(channel: usize) -> String {
    format!("{}{}", SINK_PREFIX, channel)
}

pub fn launch_string(cameras: &[CameraConfig], width: u32, height: u32) -> String {
    cameras
        .iter()
        .enumerate()
        .map(|(i, cam)| {
            format!(
                "{source}=\"{path}\" ! decodebin ! videoconvert n-threads=4 ! videoscale n-threads=4 \
                 ! video/x-raw,format=RGB,width={width},height={height} \
                 ! appsink name={sink} sync=false max-buffers=2 drop=true",
                source = source_element(&cam.path),
                path = cam.path,
                width = width,
                height = height,
                sink = sink_name(i),
            )
        })
        .collect::<Vec<_>>()
        .join(" ")
}
