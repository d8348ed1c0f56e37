use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use super::mjpeg::{encode_jpeg, multipart_part, Pacer};
use super::{PartSource, StreamSettings};
use crate::error::RelayError;
use crate::frame::Frame;
use crate::registry::{ChannelId, ChannelRegistry};

/// Live view of one channel.
///
/// Marks the channel active on creation and inactive on drop. Every frame it
/// consumes is also published as the channel's cached frame, which is what
/// the composite view reads while this view is attached.
pub struct ChannelStream {
    registry: Arc<ChannelRegistry>,
    channel: ChannelId,
    settings: StreamSettings,
    pacer: Pacer,
}

impl ChannelStream {
    pub fn open(
        registry: Arc<ChannelRegistry>,
        channel: ChannelId,
        settings: StreamSettings,
    ) -> Result<Self> {
        registry.mark_active(channel)?;
        log::info!("stream attached to channel {}", channel);
        Ok(Self {
            pacer: Pacer::new(settings.fps),
            registry,
            channel,
            settings,
        })
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Block until the producer delivers a frame or the bound runs out.
    /// Frames that piled up since the last call are skipped; only the newest
    /// one is returned.
    pub fn next_frame(&mut self) -> Result<Arc<Frame>> {
        let started = Instant::now();
        loop {
            self.registry.mark_active(self.channel)?;
            if let Some(frame) = self
                .registry
                .recv_latest(self.channel, self.settings.poll_slice)?
            {
                let frame = Arc::new(frame);
                self.registry.set_cached(self.channel, frame.clone())?;
                return Ok(frame);
            }
            let waited = started.elapsed();
            if waited >= self.settings.producer_timeout {
                log::error!(
                    "unable to receive frames from pipeline on channel {}",
                    self.channel
                );
                return Err(RelayError::ProducerUnreachable {
                    channels: vec![self.channel],
                    waited_ms: waited.as_millis(),
                }
                .into());
            }
        }
    }
}

impl PartSource for ChannelStream {
    fn next_part(&mut self) -> Result<Vec<u8>> {
        let frame = self.next_frame()?;
        let jpeg = encode_jpeg(frame.image(), self.settings.jpeg_quality)?;
        self.pacer.wait();
        Ok(multipart_part(&jpeg))
    }
}

impl Drop for ChannelStream {
    fn drop(&mut self) {
        match self.registry.mark_inactive(self.channel) {
            Ok(()) => log::info!("stream detached from channel {}", self.channel),
            Err(err) => log::warn!("channel {} cleanup failed: {:#}", self.channel, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> StreamSettings {
        StreamSettings {
            fps: 200,
            producer_timeout: Duration::from_millis(60),
            poll_slice: Duration::from_millis(5),
            ..StreamSettings::default()
        }
    }

    #[test]
    fn delivers_and_caches_frames() {
        let registry = Arc::new(ChannelRegistry::new(2));
        let mut stream = ChannelStream::open(registry.clone(), 1, settings()).unwrap();
        assert!(registry.is_active(1).unwrap());
        assert!(registry.enqueue(1, Frame::blank(8, 4)).unwrap());

        let part = stream.next_part().unwrap();
        assert!(part.starts_with(b" --frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(part.ends_with(b"\r\n\r\n"));
        assert!(registry.cached(1).unwrap().is_some());
        assert!(!registry.is_active(0).unwrap());
    }

    #[test]
    fn silent_producer_ends_the_stream() {
        let registry = Arc::new(ChannelRegistry::new(1));
        let mut stream = ChannelStream::open(registry, 0, settings()).unwrap();
        let started = Instant::now();
        let err = stream.next_part().unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::ProducerUnreachable { .. })
        ));
    }

    #[test]
    fn drop_releases_the_channel() {
        let registry = Arc::new(ChannelRegistry::new(1));
        {
            let mut stream = ChannelStream::open(registry.clone(), 0, settings()).unwrap();
            registry.enqueue(0, Frame::blank(4, 4)).unwrap();
            stream.next_frame().unwrap();
            registry.enqueue(0, Frame::blank(4, 4)).unwrap();
        }
        assert!(!registry.is_active(0).unwrap());
        assert_eq!(registry.queued(0).unwrap(), 0);
        assert!(registry.cached(0).unwrap().is_none());
    }

    #[test]
    fn fast_producer_does_not_build_a_backlog() {
        let registry = Arc::new(ChannelRegistry::new(1));
        let mut stream = ChannelStream::open(
            registry.clone(),
            0,
            StreamSettings {
                fps: 20,
                ..settings()
            },
        )
        .unwrap();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let producer = {
            let registry = registry.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut seq = 0u32;
                while !stop.load(std::sync::atomic::Ordering::SeqCst) {
                    seq += 1;
                    registry.enqueue(0, Frame::blank(seq, 1)).unwrap();
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
        };

        let mut last = 0;
        for _ in 0..10 {
            let part = stream.next_part().unwrap();
            assert!(!part.is_empty());
            assert!(registry.queued(0).unwrap() <= 20);
            let newest = registry.cached(0).unwrap().unwrap().width();
            assert!(newest > last);
            last = newest;
        }
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
        producer.join().unwrap();
        // about 100 frames were produced against 10 parts
        assert!(last >= 30, "newest frame width {}", last);
    }

    #[test]
    fn out_of_range_channel_is_rejected() {
        let registry = Arc::new(ChannelRegistry::new(1));
        assert!(ChannelStream::open(registry.clone(), 3, settings()).is_err());
        assert!(!registry.is_active(0).unwrap());
    }
}
