//! Producer to consumer handoff.
//!
//! A thin layer over `crossbeam-channel` that carries each [`Frame`] by move
//! and terminates the stream with an explicit end-of-stream marker. Bounded
//! queues apply an [`OverflowPolicy`] when the consumer falls behind; the
//! unbounded variant has to be asked for explicitly.

use crate::{Frame, QueueError};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug)]
pub enum QueueItem {
    Frame(Frame),
    EndOfStream,
}

/// What `put` does when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for the consumer to make room.
    #[default]
    Block,
    /// Evict the oldest queued frame to make room for the new one.
    /// The end-of-stream marker never evicts; it waits for room.
    DropOldest,
    /// Refuse the frame and report [`QueueError::Full`].
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// `None` for an unbounded queue.
    pub capacity: Option<usize>,
    pub policy: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: Some(256),
            policy: OverflowPolicy::Block,
        }
    }
}

impl QueueConfig {
    pub fn bounded(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            policy,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            capacity: None,
            policy: OverflowPolicy::Block,
        }
    }
}

/// Result of a successful [`FrameSender::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Queued,
    /// The frame was queued after evicting this many older frames.
    DroppedOldest(u64),
}

pub struct FrameSender {
    tx: Sender<QueueItem>,
    // Only held for DropOldest; keeping a receiver alive hides a departed consumer.
    evict: Option<Receiver<QueueItem>>,
    policy: OverflowPolicy,
    capacity: Option<usize>,
    finished: bool,
}

pub struct FrameReceiver {
    rx: Receiver<QueueItem>,
    ended: bool,
}

/// Create a connected sender/receiver pair.
pub fn frame_queue(config: QueueConfig) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = match config.capacity {
        Some(cap) => bounded(cap.max(1)),
        None => unbounded(),
    };
    let evict = match (config.capacity, config.policy) {
        (Some(_), OverflowPolicy::DropOldest) => Some(rx.clone()),
        _ => None,
    };
    (
        FrameSender {
            tx,
            evict,
            policy: config.policy,
            capacity: config.capacity,
            finished: false,
        },
        FrameReceiver { rx, ended: false },
    )
}

impl FrameSender {
    /// Enqueue a frame. Ownership passes to the queue.
    pub fn put(&mut self, frame: Frame) -> Result<PutOutcome, QueueError> {
        if self.finished {
            return Err(QueueError::Finished);
        }
        self.push(QueueItem::Frame(frame))
    }

    /// Enqueue the end-of-stream marker. Only the first call succeeds.
    pub fn finish(&mut self) -> Result<(), QueueError> {
        if self.finished {
            return Err(QueueError::Finished);
        }
        self.finished = true;
        // Release the eviction handle so a departed consumer reads as
        // disconnected, then wait for room: queued frames are never evicted
        // to make space for the marker.
        self.evict = None;
        self.tx
            .send(QueueItem::EndOfStream)
            .map_err(|_| QueueError::Disconnected)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Frames currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn push(&mut self, item: QueueItem) -> Result<PutOutcome, QueueError> {
        match (self.policy, &self.evict) {
            (OverflowPolicy::DropOldest, Some(evict)) => {
                let mut item = item;
                let mut dropped = 0;
                loop {
                    match self.tx.try_send(item) {
                        Ok(()) => break,
                        Err(TrySendError::Full(back)) => {
                            item = back;
                            if evict.try_recv().is_ok() {
                                dropped += 1;
                            }
                        }
                        Err(TrySendError::Disconnected(_)) => return Err(QueueError::Disconnected),
                    }
                }
                if dropped > 0 {
                    Ok(PutOutcome::DroppedOldest(dropped))
                } else {
                    Ok(PutOutcome::Queued)
                }
            }
            (OverflowPolicy::Fail, _) => match self.tx.try_send(item) {
                Ok(()) => Ok(PutOutcome::Queued),
                Err(TrySendError::Full(_)) => Err(QueueError::Full {
                    capacity: self.capacity.unwrap_or(0),
                }),
                Err(TrySendError::Disconnected(_)) => Err(QueueError::Disconnected),
            },
            // Block and unbounded queues.
            _ => self
                .tx
                .send(item)
                .map(|_| PutOutcome::Queued)
                .map_err(|_| QueueError::Disconnected),
        }
    }
}

impl FrameReceiver {
    /// Wait up to `timeout` for the next item. `Ok(None)` means nothing
    /// arrived in time.
    pub fn get(&mut self, timeout: Duration) -> Result<Option<QueueItem>, QueueError> {
        if self.ended {
            return Err(QueueError::Finished);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(item) => {
                if matches!(item, QueueItem::EndOfStream) {
                    self.ended = true;
                }
                Ok(Some(item))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Disconnected),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// True once the end-of-stream marker has been received.
    pub fn has_ended(&self) -> bool {
        self.ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    fn frame(id: u32) -> Frame {
        Frame::from_channels(id, u64::from(id) * 10, &[vec![id as u16]])
    }

    fn trigger_of(item: Option<QueueItem>) -> Option<u32> {
        match item {
            Some(QueueItem::Frame(f)) => Some(f.trigger_id),
            _ => None,
        }
    }

    #[test]
    fn fifo_then_end_of_stream() {
        let (mut tx, mut rx) = frame_queue(QueueConfig::unbounded());
        for id in 0..5 {
            assert_eq!(tx.put(frame(id)).unwrap(), PutOutcome::Queued);
        }
        tx.finish().unwrap();

        for id in 0..5 {
            assert_eq!(trigger_of(rx.get(WAIT).unwrap()), Some(id));
        }
        assert!(matches!(rx.get(WAIT).unwrap(), Some(QueueItem::EndOfStream)));
        assert!(rx.has_ended());
        assert_eq!(rx.get(WAIT).unwrap_err(), QueueError::Finished);
    }

    #[test]
    fn get_times_out_without_data() {
        let (_tx, mut rx) = frame_queue(QueueConfig::default());
        assert!(rx.get(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn finish_only_once() {
        let (mut tx, _rx) = frame_queue(QueueConfig::default());
        tx.finish().unwrap();
        assert_eq!(tx.finish().unwrap_err(), QueueError::Finished);
        assert_eq!(tx.put(frame(1)).unwrap_err(), QueueError::Finished);
    }

    #[test]
    fn drop_oldest_keeps_newest_frames() {
        let (mut tx, mut rx) = frame_queue(QueueConfig::bounded(2, OverflowPolicy::DropOldest));
        tx.put(frame(0)).unwrap();
        tx.put(frame(1)).unwrap();
        assert_eq!(tx.put(frame(2)).unwrap(), PutOutcome::DroppedOldest(1));
        assert_eq!(trigger_of(rx.get(WAIT).unwrap()), Some(1));
        assert_eq!(trigger_of(rx.get(WAIT).unwrap()), Some(2));
    }

    #[test]
    fn end_of_stream_never_evicts_queued_frames() {
        let (mut tx, mut rx) = frame_queue(QueueConfig::bounded(2, OverflowPolicy::DropOldest));
        assert_eq!(tx.put(frame(0)).unwrap(), PutOutcome::Queued);
        assert_eq!(tx.put(frame(1)).unwrap(), PutOutcome::Queued);

        // The queue is full, so the marker waits for the consumer.
        let finisher = std::thread::spawn(move || tx.finish());

        let mut seen = Vec::new();
        loop {
            match rx.get(Duration::from_secs(1)).unwrap() {
                Some(QueueItem::Frame(f)) => seen.push(f.trigger_id),
                Some(QueueItem::EndOfStream) => break,
                None => {}
            }
        }
        finisher.join().unwrap().unwrap();
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn finish_reports_departed_consumer_under_drop_oldest() {
        let (mut tx, rx) = frame_queue(QueueConfig::bounded(2, OverflowPolicy::DropOldest));
        drop(rx);
        assert_eq!(tx.finish().unwrap_err(), QueueError::Disconnected);
    }

    #[test]
    fn fail_policy_reports_full() {
        let (mut tx, mut rx) = frame_queue(QueueConfig::bounded(1, OverflowPolicy::Fail));
        tx.put(frame(0)).unwrap();
        assert_eq!(
            tx.put(frame(1)).unwrap_err(),
            QueueError::Full { capacity: 1 }
        );
        assert_eq!(trigger_of(rx.get(WAIT).unwrap()), Some(0));
    }

    #[test]
    fn block_policy_waits_for_consumer() {
        let (mut tx, mut rx) = frame_queue(QueueConfig::bounded(1, OverflowPolicy::Block));
        let producer = std::thread::spawn(move || {
            for id in 0..10 {
                tx.put(frame(id)).unwrap();
            }
            tx.finish().unwrap();
        });

        let mut seen = Vec::new();
        loop {
            match rx.get(Duration::from_secs(1)).unwrap() {
                Some(QueueItem::Frame(f)) => seen.push(f.trigger_id),
                Some(QueueItem::EndOfStream) => break,
                None => {}
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn departed_consumer_is_reported() {
        let (mut tx, rx) = frame_queue(QueueConfig::bounded(1, OverflowPolicy::Block));
        drop(rx);
        assert_eq!(tx.put(frame(0)).unwrap_err(), QueueError::Disconnected);
    }

    #[test]
    fn departed_producer_is_reported() {
        let (tx, mut rx) = frame_queue(QueueConfig::default());
        drop(tx);
        assert_eq!(rx.get(WAIT).unwrap_err(), QueueError::Disconnected);
    }
}
