//! Channel registry: the only state shared by the producer and consumer sides.
//!
//! Per channel the registry owns:
//! - an unbounded FIFO holding area of annotated frames,
//! - a liveness flag (an HTTP consumer is attached),
//! - a last-frame cache used by the composite view.
//!
//! All flags live in one vector behind one mutex. The mutex is held for the
//! flag access only; queue operations and cache updates never run under it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::RelayError;
use crate::frame::Frame;

pub type ChannelId = usize;

struct HoldingArea {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
}

pub struct ChannelRegistry {
    areas: Vec<HoldingArea>,
    running: Mutex<Vec<bool>>,
    cache: Vec<Mutex<Option<Arc<Frame>>>>,
}

impl ChannelRegistry {
    /// Create `n` empty holding areas, all flags down, all caches empty.
    pub fn new(n: usize) -> Self {
        let areas = (0..n)
            .map(|_| {
                let (tx, rx) = crossbeam_channel::unbounded();
                HoldingArea { tx, rx }
            })
            .collect();
        Self {
            areas,
            running: Mutex::new(vec![false; n]),
            cache: (0..n).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Validate a channel id without touching any state.
    pub fn check(&self, id: ChannelId) -> Result<()> {
        if id < self.areas.len() {
            Ok(())
        } else {
            Err(RelayError::ChannelOutOfRange {
                id,
                count: self.areas.len(),
            }
            .into())
        }
    }

    /// Parse a path segment into a channel id. Non-numeric or out-of-range
    /// input yields `None`; the registry is not touched either way.
    pub fn parse_id(&self, raw: &str) -> Option<ChannelId> {
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let id: ChannelId = raw.parse().ok()?;
        self.check(id).ok().map(|_| id)
    }

    pub fn mark_active(&self, id: ChannelId) -> Result<()> {
        self.check(id)?;
        self.flags()?[id] = true;
        Ok(())
    }

    /// Lower the flag, then drop residual frames and the cached frame.
    pub fn mark_inactive(&self, id: ChannelId) -> Result<()> {
        self.check(id)?;
        self.flags()?[id] = false;
        let flushed = self.flush(id)?;
        self.clear_cached(id)?;
        if flushed > 0 {
            log::debug!("channel {}: flushed {} queued frame(s)", id, flushed);
        }
        Ok(())
    }

    pub fn is_active(&self, id: ChannelId) -> Result<bool> {
        self.check(id)?;
        Ok(self.flags()?[id])
    }

    /// Snapshot of all liveness flags.
    pub fn active_channels(&self) -> Result<Vec<bool>> {
        Ok(self.flags()?.clone())
    }

    /// Non-blocking append. Returns `false` (and drops the frame) when no
    /// consumer is attached.
    ///
    /// The flag is checked again after the send: if the channel went inactive
    /// in between, the holding area is flushed so no stale frame survives.
    pub fn enqueue(&self, id: ChannelId, frame: Frame) -> Result<bool> {
        if !self.is_active(id)? {
            return Ok(false);
        }
        self.areas[id]
            .tx
            .send(frame)
            .map_err(|_| anyhow!("channel {} holding area closed", id))?;
        if !self.is_active(id)? {
            self.flush(id)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Pop the oldest frame, or `None` when the holding area is empty.
    pub fn drain(&self, id: ChannelId) -> Result<Option<Frame>> {
        self.check(id)?;
        Ok(self.areas[id].rx.try_recv().ok())
    }

    /// Blocking pop bounded by `timeout`. `None` means nothing arrived.
    pub fn recv_timeout(&self, id: ChannelId, timeout: Duration) -> Result<Option<Frame>> {
        self.check(id)?;
        match self.areas[id].rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("channel {} holding area closed", id))
            }
        }
    }

    /// Newest queued frame, discarding any older ones.
    pub fn drain_latest(&self, id: ChannelId) -> Result<Option<Frame>> {
        self.check(id)?;
        Ok(self.areas[id].rx.try_iter().last())
    }

    /// Like `recv_timeout`, but anything that queued up behind the first
    /// frame is skipped and only the newest is returned.
    pub fn recv_latest(&self, id: ChannelId, timeout: Duration) -> Result<Option<Frame>> {
        let first = self.recv_timeout(id, timeout)?;
        Ok(match first {
            Some(first) => Some(self.areas[id].rx.try_iter().last().unwrap_or(first)),
            None => None,
        })
    }

    /// Number of frames currently waiting.
    pub fn queued(&self, id: ChannelId) -> Result<usize> {
        self.check(id)?;
        Ok(self.areas[id].rx.len())
    }

    /// Drop every queued frame, returning how many were discarded.
    pub fn flush(&self, id: ChannelId) -> Result<usize> {
        self.check(id)?;
        Ok(self.areas[id].rx.try_iter().count())
    }

    pub fn cached(&self, id: ChannelId) -> Result<Option<Arc<Frame>>> {
        self.check(id)?;
        Ok(self.cache_slot(id)?.clone())
    }

    pub fn set_cached(&self, id: ChannelId, frame: Arc<Frame>) -> Result<()> {
        self.check(id)?;
        *self.cache_slot(id)? = Some(frame);
        Ok(())
    }

    pub fn clear_cached(&self, id: ChannelId) -> Result<()> {
        self.check(id)?;
        *self.cache_slot(id)? = None;
        Ok(())
    }

    fn flags(&self) -> Result<MutexGuard<'_, Vec<bool>>> {
        self.running
            .lock()
            .map_err(|_| anyhow!("channel flag lock poisoned"))
    }

    fn cache_slot(&self, id: ChannelId) -> Result<MutexGuard<'_, Option<Arc<Frame>>>> {
        self.cache[id]
            .lock()
            .map_err(|_| anyhow!("channel {} cache lock poisoned", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::blank(4, 2)
    }

    #[test]
    fn new_registry_is_dormant() {
        let reg = ChannelRegistry::new(3);
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.active_channels().unwrap(), vec![false, false, false]);
        for id in 0..3 {
            assert_eq!(reg.queued(id).unwrap(), 0);
            assert!(reg.cached(id).unwrap().is_none());
        }
    }

    #[test]
    fn enqueue_requires_active_flag() {
        let reg = ChannelRegistry::new(1);
        assert!(!reg.enqueue(0, frame()).unwrap());
        assert_eq!(reg.queued(0).unwrap(), 0);

        reg.mark_active(0).unwrap();
        assert!(reg.enqueue(0, frame()).unwrap());
        assert_eq!(reg.queued(0).unwrap(), 1);
        assert!(reg.drain(0).unwrap().is_some());
        assert!(reg.drain(0).unwrap().is_none());
    }

    #[test]
    fn latest_skips_older_frames() {
        let reg = ChannelRegistry::new(1);
        reg.mark_active(0).unwrap();
        for w in 1..=4 {
            reg.enqueue(0, Frame::blank(w, 1)).unwrap();
        }
        assert_eq!(reg.recv_latest(0, Duration::from_millis(5)).unwrap().unwrap().width(), 4);
        assert_eq!(reg.queued(0).unwrap(), 0);
        assert!(reg.recv_latest(0, Duration::from_millis(5)).unwrap().is_none());

        reg.enqueue(0, Frame::blank(7, 1)).unwrap();
        assert_eq!(reg.recv_latest(0, Duration::from_millis(5)).unwrap().unwrap().width(), 7);

        reg.enqueue(0, Frame::blank(2, 1)).unwrap();
        reg.enqueue(0, Frame::blank(3, 1)).unwrap();
        assert_eq!(reg.drain_latest(0).unwrap().unwrap().width(), 3);
        assert!(reg.drain_latest(0).unwrap().is_none());
    }

    #[test]
    fn enqueue_racing_mark_inactive_leaves_nothing_behind() {
        let reg = Arc::new(ChannelRegistry::new(1));
        for _ in 0..200 {
            reg.mark_active(0).unwrap();
            let producer = {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        reg.enqueue(0, Frame::blank(2, 2)).unwrap();
                    }
                })
            };
            reg.mark_inactive(0).unwrap();
            producer.join().unwrap();
            assert!(!reg.is_active(0).unwrap());
            assert_eq!(reg.queued(0).unwrap(), 0);
        }
    }

    #[test]
    fn active_then_inactive_leaves_channel_clean() {
        let reg = ChannelRegistry::new(2);
        reg.mark_active(1).unwrap();
        for _ in 0..5 {
            reg.enqueue(1, frame()).unwrap();
        }
        reg.set_cached(1, Arc::new(frame())).unwrap();

        reg.mark_inactive(1).unwrap();
        assert!(!reg.is_active(1).unwrap());
        assert_eq!(reg.queued(1).unwrap(), 0);
        assert!(reg.cached(1).unwrap().is_none());

        // idempotent
        reg.mark_inactive(1).unwrap();
        assert_eq!(reg.queued(1).unwrap(), 0);
        assert!(reg.cached(1).unwrap().is_none());
    }

    #[test]
    fn out_of_range_ids_are_rejected_without_mutation() {
        let reg = ChannelRegistry::new(2);
        let err = reg.mark_active(2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::ChannelOutOfRange { id: 2, count: 2 })
        ));
        assert!(reg.enqueue(7, frame()).is_err());
        assert_eq!(reg.active_channels().unwrap(), vec![false, false]);

        assert_eq!(reg.parse_id("1"), Some(1));
        assert_eq!(reg.parse_id("2"), None);
        assert_eq!(reg.parse_id("-1"), None);
        assert_eq!(reg.parse_id("abc"), None);
        assert_eq!(reg.parse_id(""), None);
        assert_eq!(reg.active_channels().unwrap(), vec![false, false]);
    }

    #[test]
    fn recv_timeout_returns_none_when_idle() {
        let reg = ChannelRegistry::new(1);
        let got = reg.recv_timeout(0, Duration::from_millis(20)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn fifo_order_is_preserved() {
        let reg = ChannelRegistry::new(1);
        reg.mark_active(0).unwrap();
        for w in 1..=3 {
            reg.enqueue(0, Frame::blank(w, 1)).unwrap();
        }
        let widths: Vec<u32> = std::iter::from_fn(|| reg.drain(0).unwrap())
            .map(|f| f.width())
            .collect();
        assert_eq!(widths, vec![1, 2, 3]);
    }
}
