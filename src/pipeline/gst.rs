use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use gstreamer::prelude::*;

use super::launch::{launch_string, sink_name};
use super::{dispatch, BusMessage, GraphFactory, MediaGraph, SharedHandler, BRANCH_HEIGHT, BRANCH_WIDTH};
use crate::config::CameraConfig;
use crate::frame::Frame;

/// Builds the real decode graph from the camera list.
#[derive(Clone, Debug, Default)]
pub struct GstreamerFactory;

impl GraphFactory for GstreamerFactory {
    fn build(
        &self,
        cameras: &[CameraConfig],
        handlers: &[SharedHandler],
    ) -> Result<Box<dyn MediaGraph>> {
        if cameras.len() != handlers.len() {
            return Err(anyhow!(
                "{} camera(s) but {} handler(s)",
                cameras.len(),
                handlers.len()
            ));
        }
        gstreamer::init().context("initialize gstreamer")?;

        let description = launch_string(cameras, BRANCH_WIDTH, BRANCH_HEIGHT);
        log::debug!("gstreamer launch: {}", description);
        let pipeline = gstreamer::parse::launch(&description)
            .context("build analytics pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("analytics pipeline is not a Pipeline"))?;

        let (bus_tx, bus_rx) = crossbeam_channel::unbounded();
        for (channel, handler) in handlers.iter().enumerate() {
            let appsink = pipeline
                .by_name(&sink_name(channel))
                .with_context(|| format!("{} missing from pipeline", sink_name(channel)))?
                .downcast::<gstreamer_app::AppSink>()
                .map_err(|_| anyhow!("{} has unexpected type", sink_name(channel)))?;
            attach(channel, &appsink, handler.clone(), bus_tx.clone());
        }

        Ok(Box::new(GstreamerGraph {
            pipeline,
            bus_tx,
            bus_rx,
        }))
    }
}

fn attach(
    channel: usize,
    appsink: &gstreamer_app::AppSink,
    handler: SharedHandler,
    bus: Sender<BusMessage>,
) {
    appsink.set_callbacks(
        gstreamer_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gstreamer::FlowError::Eos)?;
                let frame = match sample_to_frame(&sample) {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::warn!("channel {}: dropping undecodable sample: {}", channel, err);
                        return Ok(gstreamer::FlowSuccess::Ok);
                    }
                };
                if dispatch(channel, &handler, frame, &bus) {
                    Ok(gstreamer::FlowSuccess::Ok)
                } else {
                    Err(gstreamer::FlowError::Error)
                }
            })
            .build(),
    );
}

fn sample_to_frame(sample: &gstreamer::Sample) -> Result<Frame> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map sample buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("sample buffer is short")?;
        return Frame::from_rgb(width, height, packed.to_vec());
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("buffer row is out of bounds")?,
        );
    }
    Frame::from_rgb(width, height, pixels)
}

pub struct GstreamerGraph {
    pipeline: gstreamer::Pipeline,
    bus_tx: Sender<BusMessage>,
    bus_rx: Receiver<BusMessage>,
}

impl MediaGraph for GstreamerGraph {
    fn start(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set analytics pipeline to Playing")?;
        Ok(())
    }

    fn next_message(&mut self, timeout: Duration) -> Option<BusMessage> {
        // Handler-side messages first; they carry the fatal flag.
        if let Ok(msg) = self.bus_rx.try_recv() {
            return Some(msg);
        }
        let bus = self.pipeline.bus()?;
        let message = bus.timed_pop_filtered(
            gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64),
            &[gstreamer::MessageType::Error, gstreamer::MessageType::Eos],
        );
        if let Some(message) = message {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    let _ = self.bus_tx.send(BusMessage::Error {
                        message: format!(
                            "error from {:?}: {}",
                            err.src().map(|s| s.path_string()),
                            err.error()
                        ),
                        debug: err.debug().map(|d| d.to_string()),
                    });
                }
                MessageView::Eos(..) => {
                    let _ = self.bus_tx.send(BusMessage::Eos);
                }
                _ => {}
            }
        }
        self.bus_rx.try_recv().ok()
    }

    fn stop(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Null)
            .context("set analytics pipeline to Null")?;
        Ok(())
    }
}

impl Drop for GstreamerGraph {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}
