use crate::{
    FrameSender, FrameSource, PipelineError, PipelineEvent, PipelineObserver, PutOutcome,
    QueueError, RunStats, StopFlag, Worker,
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    Armed,
    Running,
    Draining,
    Stopped,
}

impl ProducerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProducerState::Idle => "idle",
            ProducerState::Armed => "armed",
            ProducerState::Running => "running",
            ProducerState::Draining => "draining",
            ProducerState::Stopped => "stopped",
        }
    }
}

/// Outcome of one acquisition run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerReport {
    /// Frames handed to the queue.
    pub triggers: u64,
    /// Frames evicted by a drop-oldest queue.
    pub dropped: u64,
    /// Trigger ids skipped by the source.
    pub gaps: u64,
    /// Trigger ids repeated or going backwards.
    pub duplicates: u64,
    pub error: Option<String>,
}

/// Watches the trigger id sequence for holes and repeats.
///
/// Anomalies are counted, never fatal: the source is trusted to number its
/// own triggers and the files record whatever it reported.
#[derive(Debug, Default)]
pub struct TriggerTracker {
    expected: Option<u32>,
    pub gaps: u64,
    pub duplicates: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCheck {
    InOrder,
    Gap { expected: u32, missing: u64 },
    Repeat { expected: u32 },
}

impl TriggerTracker {
    pub fn observe(&mut self, trigger_id: u32) -> TriggerCheck {
        let check = match self.expected {
            None => TriggerCheck::InOrder,
            Some(expected) if trigger_id == expected => TriggerCheck::InOrder,
            Some(expected) => {
                // Distance forward from the expected id, modulo 2^32.
                let ahead = trigger_id.wrapping_sub(expected);
                if ahead < u32::MAX / 2 {
                    self.gaps += u64::from(ahead);
                    TriggerCheck::Gap {
                        expected,
                        missing: u64::from(ahead),
                    }
                } else {
                    self.duplicates += 1;
                    TriggerCheck::Repeat { expected }
                }
            }
        };
        self.expected = Some(trigger_id.wrapping_add(1));
        check
    }
}

/// Drives a [`FrameSource`] and feeds the frame queue.
pub struct Producer<S: FrameSource> {
    source: S,
    tx: FrameSender,
    stop: StopFlag,
    stats: Arc<RunStats>,
    observer: Arc<dyn PipelineObserver>,
    state: ProducerState,
    tracker: TriggerTracker,
}

impl<S: FrameSource> Producer<S> {
    pub fn new(
        source: S,
        tx: FrameSender,
        stop: StopFlag,
        stats: Arc<RunStats>,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self {
            source,
            tx,
            stop,
            stats,
            observer,
            state: ProducerState::Idle,
            tracker: TriggerTracker::default(),
        }
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    /// Run until the stop flag is set, the source ends, or something fails.
    ///
    /// Whatever the cause, the end-of-stream marker is queued and the source
    /// is disarmed before this returns.
    pub fn run(mut self) -> ProducerReport {
        let mut report = ProducerReport::default();

        if let Err(e) = self.acquire(&mut report) {
            self.fail(&mut report, e.to_string());
        }

        self.enter(ProducerState::Draining);
        match self.tx.finish() {
            Ok(()) => {}
            Err(QueueError::Disconnected) if self.stop.is_set() => {}
            Err(e) => self.fail(&mut report, format!("could not queue end of stream: {e}")),
        }
        if let Err(e) = self.source.disarm() {
            self.fail(&mut report, format!("disarm failed: {e}"));
        }
        self.enter(ProducerState::Stopped);

        report.gaps = self.tracker.gaps;
        report.duplicates = self.tracker.duplicates;
        self.stats.set_queue_len(self.tx.len());
        self.stats.producer_finished();
        self.observer.on_event(&PipelineEvent::Finished {
            worker: Worker::Producer,
            frames: report.triggers,
        });
        report
    }

    fn acquire(&mut self, report: &mut ProducerReport) -> Result<(), PipelineError> {
        self.source.arm()?;
        self.enter(ProducerState::Armed);
        self.source.start()?;
        self.enter(ProducerState::Running);

        while !self.stop.is_set() {
            self.source.trigger()?;
            let frame = match self.source.next_frame()? {
                Some(frame) => frame,
                None => break,
            };

            let trigger_id = frame.trigger_id;
            match self.tracker.observe(trigger_id) {
                TriggerCheck::InOrder => {}
                TriggerCheck::Gap { expected, missing } => {
                    self.stats.add_gaps(missing);
                    self.observer.on_event(&PipelineEvent::TriggerGap {
                        expected,
                        got: trigger_id,
                    });
                }
                TriggerCheck::Repeat { expected } => {
                    self.stats.add_duplicate();
                    self.observer.on_event(&PipelineEvent::TriggerGap {
                        expected,
                        got: trigger_id,
                    });
                }
            }

            let bytes = frame.payload_size();
            let outcome = match self.tx.put(frame) {
                Ok(outcome) => outcome,
                // The consumer failed, set the stop flag and left.
                Err(QueueError::Disconnected) if self.stop.is_set() => break,
                Err(e) => return Err(e.into()),
            };
            if let PutOutcome::DroppedOldest(count) = outcome {
                report.dropped += count;
                self.stats.add_dropped(count);
                self.observer.on_event(&PipelineEvent::FramesDropped { count });
            }
            report.triggers += 1;
            self.stats.add_trigger();

            let queue_len = self.tx.len();
            self.stats.set_queue_len(queue_len);
            self.observer.on_event(&PipelineEvent::FrameAcquired {
                trigger_id,
                bytes,
                queue_len,
            });
        }
        Ok(())
    }

    fn enter(&mut self, state: ProducerState) {
        self.state = state;
        self.observer.on_event(&PipelineEvent::State {
            worker: Worker::Producer,
            state: state.as_str(),
        });
    }

    // First failure wins the report; later ones are still surfaced.
    fn fail(&mut self, report: &mut ProducerReport, cause: String) {
        self.stop.set();
        self.observer.on_event(&PipelineEvent::Failed {
            worker: Worker::Producer,
            cause: cause.clone(),
        });
        if report.error.is_none() {
            report.error = Some(cause);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frame_queue, Frame, NullObserver, QueueConfig, QueueItem, SourceError};
    use std::time::Duration;

    /// Scripted source: yields the given trigger ids, then either ends or fails.
    struct Script {
        ids: Vec<u32>,
        next: usize,
        fail_at_end: bool,
        fail_arm: bool,
        disarmed: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Script {
        fn new(ids: Vec<u32>) -> Self {
            Self {
                ids,
                next: 0,
                fail_at_end: false,
                fail_arm: false,
                disarmed: Arc::default(),
            }
        }
    }

    impl FrameSource for Script {
        fn arm(&mut self) -> Result<(), SourceError> {
            if self.fail_arm {
                return Err(SourceError::Connection("no board".into()));
            }
            Ok(())
        }
        fn start(&mut self) -> Result<(), SourceError> {
            Ok(())
        }
        fn trigger(&mut self) -> Result<(), SourceError> {
            Ok(())
        }
        fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            match self.ids.get(self.next) {
                Some(&id) => {
                    self.next += 1;
                    Ok(Some(Frame::from_channels(id, u64::from(id), &[vec![1, 2]])))
                }
                None if self.fail_at_end => Err(SourceError::Malformed("bad size".into())),
                None => Ok(None),
            }
        }
        fn disarm(&mut self) -> Result<(), SourceError> {
            self.disarmed.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        fn n_channels(&self) -> usize {
            1
        }
    }

    fn drain(rx: &mut crate::FrameReceiver) -> (Vec<u32>, bool) {
        let mut ids = Vec::new();
        loop {
            match rx.get(Duration::from_millis(50)) {
                Ok(Some(QueueItem::Frame(f))) => ids.push(f.trigger_id),
                Ok(Some(QueueItem::EndOfStream)) => return (ids, true),
                _ => return (ids, false),
            }
        }
    }

    fn producer(source: Script, stop: StopFlag) -> (Producer<Script>, crate::FrameReceiver) {
        let (tx, rx) = frame_queue(QueueConfig::unbounded());
        let stats = Arc::new(RunStats::default());
        (Producer::new(source, tx, stop, stats, Arc::new(NullObserver)), rx)
    }

    #[test]
    fn end_of_source_queues_marker_once() {
        let source = Script::new(vec![0, 1, 2]);
        let disarmed = Arc::clone(&source.disarmed);
        let (p, mut rx) = producer(source, StopFlag::new());
        let report = p.run();

        assert_eq!(report.triggers, 3);
        assert!(report.error.is_none());
        assert_eq!(drain(&mut rx), (vec![0, 1, 2], true));
        assert!(disarmed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn stop_before_start_sends_only_marker() {
        let stop = StopFlag::new();
        stop.set();
        let (p, mut rx) = producer(Script::new(vec![0, 1]), stop);
        let report = p.run();
        assert_eq!(report.triggers, 0);
        assert_eq!(drain(&mut rx), (vec![], true));
    }

    #[test]
    fn source_error_stops_run_cleanly() {
        let mut source = Script::new(vec![5]);
        source.fail_at_end = true;
        let disarmed = Arc::clone(&source.disarmed);
        let stop = StopFlag::new();
        let (p, mut rx) = producer(source, stop.clone());
        let report = p.run();

        assert!(report.error.unwrap().contains("bad size"));
        assert!(stop.is_set());
        assert_eq!(drain(&mut rx), (vec![5], true));
        assert!(disarmed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn arm_failure_still_disarms() {
        let mut source = Script::new(vec![1]);
        source.fail_arm = true;
        let disarmed = Arc::clone(&source.disarmed);
        let (p, mut rx) = producer(source, StopFlag::new());
        let report = p.run();
        assert!(report.error.is_some());
        assert_eq!(drain(&mut rx), (vec![], true));
        assert!(disarmed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn gaps_and_repeats_are_counted() {
        let (p, mut rx) = producer(Script::new(vec![0, 1, 4, 4, 5]), StopFlag::new());
        let report = p.run();
        assert_eq!(report.gaps, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(drain(&mut rx).0, vec![0, 1, 4, 4, 5]);
    }

    #[test]
    fn tracker_handles_wraparound() {
        let mut tracker = TriggerTracker::default();
        assert_eq!(tracker.observe(u32::MAX), TriggerCheck::InOrder);
        assert_eq!(tracker.observe(0), TriggerCheck::InOrder);
        assert_eq!(
            tracker.observe(3),
            TriggerCheck::Gap {
                expected: 1,
                missing: 2
            }
        );
        assert_eq!(tracker.observe(2), TriggerCheck::Repeat { expected: 4 });
    }
}
