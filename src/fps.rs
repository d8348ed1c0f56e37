use std::sync::Mutex;
use std::time::Instant;

use anyhow::{anyhow, Result};

use crate::registry::ChannelId;

#[derive(Debug, Default)]
struct FpsCounter {
    started: Option<Instant>,
    frames: u64,
}

/// Cumulative per-channel frame rate.
///
/// Reports the average since the first frame rather than an instantaneous
/// rate, so the overlay does not flicker; it follows rate changes slowly.
pub struct FpsMeter {
    counters: Vec<Mutex<FpsCounter>>,
}

impl FpsMeter {
    pub fn new(channels: usize) -> Self {
        Self {
            counters: (0..channels).map(|_| Mutex::default()).collect(),
        }
    }

    pub fn update(&self, channel: ChannelId) -> Result<f64> {
        self.update_at(channel, Instant::now())
    }

    /// Count one frame observed at `now` and return the rounded average.
    pub fn update_at(&self, channel: ChannelId, now: Instant) -> Result<f64> {
        let slot = self
            .counters
            .get(channel)
            .ok_or_else(|| anyhow!("fps meter has no channel {}", channel))?;
        let mut counter = slot
            .lock()
            .map_err(|_| anyhow!("fps counter lock poisoned"))?;
        let started = *counter.started.get_or_insert(now);
        counter.frames += 1;
        let elapsed = now.saturating_duration_since(started).as_secs_f64();
        if elapsed <= 0.0 {
            return Ok(0.0);
        }
        Ok(round2(counter.frames as f64 / elapsed))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_frame_reports_zero() {
        let meter = FpsMeter::new(1);
        assert_eq!(meter.update_at(0, Instant::now()).unwrap(), 0.0);
    }

    #[test]
    fn reports_rounded_cumulative_average() {
        let meter = FpsMeter::new(2);
        let t0 = Instant::now();
        meter.update_at(1, t0).unwrap();
        meter.update_at(1, t0 + Duration::from_millis(500)).unwrap();
        // 3 frames over 1.5 s
        let fps = meter.update_at(1, t0 + Duration::from_millis(1500)).unwrap();
        assert_eq!(fps, 2.0);
        // 4 frames over 3 s = 1.333..
        let fps = meter.update_at(1, t0 + Duration::from_secs(3)).unwrap();
        assert_eq!(fps, 1.33);
        // channel 0 untouched
        assert_eq!(meter.update_at(0, t0 + Duration::from_secs(3)).unwrap(), 0.0);
    }

    #[test]
    fn non_decreasing_in_frame_count_for_fixed_elapsed() {
        let t0 = Instant::now();
        let end = t0 + Duration::from_secs(2);
        let mut last = 0.0;
        for k in 2..20u32 {
            let meter = FpsMeter::new(1);
            meter.update_at(0, t0).unwrap();
            let mut fps = 0.0;
            for _ in 1..k {
                fps = meter.update_at(0, end).unwrap();
            }
            assert!(fps >= last, "k={} fps={} last={}", k, fps, last);
            last = fps;
        }
    }

    #[test]
    fn unknown_channel_is_an_error() {
        let meter = FpsMeter::new(1);
        assert!(meter.update(3).is_err());
    }
}
