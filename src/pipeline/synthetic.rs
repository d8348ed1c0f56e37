//! In-process graph that fabricates frames instead of decoding cameras.
//!
//! Used for `stub://` camera paths and for exercising the supervisor. Each
//! channel gets its own producer thread, so handlers run concurrently just
//! like real branches.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use image::{Rgb, RgbImage};
use rand::Rng;

use super::{dispatch, BusMessage, GraphFactory, MediaGraph, SharedHandler, BRANCH_HEIGHT, BRANCH_WIDTH};
use crate::config::CameraConfig;
use crate::frame::Frame;

/// How one build of the synthetic graph behaves.
#[derive(Clone, Debug)]
pub struct SyntheticScript {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Post end-of-stream after this many frames on every channel.
    pub frames_per_run: Option<u32>,
    /// Post an error after this many frames on channel 0.
    pub fault_after: Option<u32>,
}

impl Default for SyntheticScript {
    fn default() -> Self {
        Self {
            fps: 20,
            width: BRANCH_WIDTH,
            height: BRANCH_HEIGHT,
            frames_per_run: None,
            fault_after: None,
        }
    }
}

/// Builds synthetic graphs. Scripts are consumed one per build; the last one
/// repeats.
pub struct SyntheticFactory {
    scripts: Mutex<VecDeque<SyntheticScript>>,
    last: Mutex<SyntheticScript>,
    builds: AtomicUsize,
}

impl SyntheticFactory {
    pub fn new(script: SyntheticScript) -> Self {
        Self::with_runs(vec![script])
    }

    pub fn with_runs(scripts: Vec<SyntheticScript>) -> Self {
        let last = scripts.last().cloned().unwrap_or_default();
        Self {
            scripts: Mutex::new(scripts.into()),
            last: Mutex::new(last),
            builds: AtomicUsize::new(0),
        }
    }

    /// Number of graphs built so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    fn next_script(&self) -> Result<SyntheticScript> {
        let mut queue = self
            .scripts
            .lock()
            .map_err(|_| anyhow!("synthetic script lock poisoned"))?;
        let mut last = self
            .last
            .lock()
            .map_err(|_| anyhow!("synthetic script lock poisoned"))?;
        if let Some(script) = queue.pop_front() {
            *last = script.clone();
            return Ok(script);
        }
        Ok(last.clone())
    }
}

impl Default for SyntheticFactory {
    fn default() -> Self {
        Self::new(SyntheticScript::default())
    }
}

impl GraphFactory for SyntheticFactory {
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
        if let Some(bad) = cameras.iter().find(|c| c.path.trim().is_empty()) {
            return Err(anyhow!("camera at {} has no source path", bad.address));
        }
        let script = self.next_script()?;
        if script.fps == 0 {
            return Err(anyhow!("synthetic fps must be positive"));
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticGraph::new(script, handlers.to_vec())))
    }
}

pub struct SyntheticGraph {
    script: SyntheticScript,
    handlers: Vec<SharedHandler>,
    stop: Arc<AtomicBool>,
    bus_tx: Sender<BusMessage>,
    bus_rx: Receiver<BusMessage>,
    workers: Vec<JoinHandle<()>>,
}

impl SyntheticGraph {
    fn new(script: SyntheticScript, handlers: Vec<SharedHandler>) -> Self {
        let (bus_tx, bus_rx) = crossbeam_channel::unbounded();
        Self {
            script,
            handlers,
            stop: Arc::new(AtomicBool::new(false)),
            bus_tx,
            bus_rx,
            workers: Vec::new(),
        }
    }
}

impl MediaGraph for SyntheticGraph {
    fn start(&mut self) -> Result<()> {
        if !self.workers.is_empty() {
            return Ok(());
        }
        let finished = Arc::new(AtomicUsize::new(0));
        let channels = self.handlers.len();
        for (channel, handler) in self.handlers.iter().enumerate() {
            let handler = handler.clone();
            let script = self.script.clone();
            let stop = self.stop.clone();
            let bus = self.bus_tx.clone();
            let finished = finished.clone();
            let worker = std::thread::Builder::new()
                .name(format!("synthetic-{}", channel))
                .spawn(move || {
                    produce(channel, channels, handler, script, stop, bus, finished)
                })
                .with_context(|| format!("spawn synthetic producer {}", channel))?;
            self.workers.push(worker);
        }
        Ok(())
    }

    fn next_message(&mut self, timeout: Duration) -> Option<BusMessage> {
        self.bus_rx.recv_timeout(timeout).ok()
    }

    fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        let mut panicked = 0;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(anyhow!("{} synthetic producer(s) panicked", panicked));
        }
        Ok(())
    }
}

impl Drop for SyntheticGraph {
    fn drop(&mut self) {
        let _ = MediaGraph::stop(self);
    }
}

fn produce(
    channel: usize,
    channels: usize,
    handler: SharedHandler,
    script: SyntheticScript,
    stop: Arc<AtomicBool>,
    bus: Sender<BusMessage>,
    finished: Arc<AtomicUsize>,
) {
    let interval = Duration::from_secs_f64(1.0 / script.fps as f64);
    let phase: u32 = rand::thread_rng().gen_range(0..script.width.max(1));
    let mut produced: u32 = 0;
    while !stop.load(Ordering::SeqCst) {
        if channel == 0 && script.fault_after == Some(produced) {
            let _ = bus.send(BusMessage::Error {
                message: "synthetic source fault".to_string(),
                debug: Some(format!("after {} frame(s)", produced)),
            });
            return;
        }
        if script.frames_per_run == Some(produced) {
            if finished.fetch_add(1, Ordering::SeqCst) + 1 == channels {
                let _ = bus.send(BusMessage::Eos);
            }
            return;
        }
        let frame = synthetic_frame(channel, phase.wrapping_add(produced), script.width, script.height);
        if !dispatch(channel, &handler, frame, &bus) {
            return;
        }
        produced = produced.wrapping_add(1);
        std::thread::sleep(interval);
    }
}

/// Dark background with a bright block sliding left to right.
fn synthetic_frame(channel: usize, index: u32, width: u32, height: u32) -> Frame {
    let block = (width / 8).max(1);
    let x0 = index.wrapping_mul(4) % width.max(1);
    let y0 = (height / 3).min(height.saturating_sub(block));
    let shade = (channel as u8).wrapping_mul(40);
    let image = RgbImage::from_fn(width, height, |x, y| {
        if x >= x0 && x < x0 + block && y >= y0 && y < y0 + block {
            Rgb([220, 220, 220])
        } else {
            Rgb([shade, 24, 48])
        }
    });
    Frame::from_image(image)
}
