//! Run control: wires a frame source, the queue and the storage consumer
//! together on two worker threads and exposes start / stop / status.

use crate::{
    frame_queue, Calibration, ConsumerReport, FrameSource, PipelineError, PipelineObserver,
    Producer, ProducerReport, QueueConfig, StorageConsumer, StorageSettings,
    DEFAULT_FLUSH_INTERVAL,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Cooperative cancellation shared by both workers and the operator.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters updated by the workers, read by status queries.
#[derive(Debug, Default)]
pub struct RunStats {
    triggers: AtomicU64,
    frames_written: AtomicU64,
    bytes_written: AtomicU64,
    dropped: AtomicU64,
    gaps: AtomicU64,
    duplicates: AtomicU64,
    queue_len: AtomicUsize,
    producer_done: AtomicBool,
    consumer_done: AtomicBool,
}

impl RunStats {
    pub fn add_trigger(&self) {
        self.triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_written(&self, bytes: u64) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_gaps(&self, count: u64) {
        self.gaps.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_len(&self, len: usize) {
        self.queue_len.store(len, Ordering::Relaxed);
    }

    pub fn producer_finished(&self) {
        self.producer_done.store(true, Ordering::SeqCst);
    }

    pub fn consumer_finished(&self) {
        self.consumer_done.store(true, Ordering::SeqCst);
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub triggers: u64,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub queue_len: usize,
    pub dropped: u64,
    pub gaps: u64,
    pub duplicates: u64,
    pub running: bool,
    pub stop_requested: bool,
}

/// Everything needed to start a run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub output_dir: PathBuf,
    pub channel_count: usize,
    /// One entry per channel.
    pub calibrations: Vec<Calibration>,
    pub time_resolution_ns: u64,
    pub queue: QueueConfig,
    pub flush_interval: u32,
}

impl RunConfig {
    /// Same calibration on every channel, default queue and flush policy.
    pub fn new(
        output_dir: impl Into<PathBuf>,
        channel_count: usize,
        calibration: Calibration,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            channel_count,
            calibrations: vec![calibration; channel_count],
            time_resolution_ns: 8,
            queue: QueueConfig::default(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.channel_count == 0 {
            return Err(PipelineError::Config("channel count must be at least 1".into()));
        }
        if self.calibrations.len() != self.channel_count {
            return Err(PipelineError::Config(format!(
                "{} calibrations given for {} channels",
                self.calibrations.len(),
                self.channel_count
            )));
        }
        if self.queue.capacity == Some(0) {
            return Err(PipelineError::Config("queue capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Final reports of both workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub producer: ProducerReport,
    pub consumer: ConsumerReport,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.producer.error.is_none() && self.consumer.error.is_none()
    }

    /// Human-readable failure causes, acquisition first.
    pub fn errors(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(e) = &self.producer.error {
            out.push(format!("acquisition: {e}"));
        }
        if let Some(e) = &self.consumer.error {
            out.push(format!("storage: {e}"));
        }
        out
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Open the channel files and start the acquisition and storage threads.
    pub fn start<S>(
        source: S,
        config: RunConfig,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<RunHandle, PipelineError>
    where
        S: FrameSource + 'static,
    {
        config.validate()?;
        if source.n_channels() != config.channel_count {
            return Err(PipelineError::Config(format!(
                "source delivers {} channels, run configured for {}",
                source.n_channels(),
                config.channel_count
            )));
        }

        let stop = StopFlag::new();
        let stats = Arc::new(RunStats::default());
        let (tx, rx) = frame_queue(config.queue);

        let consumer = StorageConsumer::open(
            &config.output_dir,
            rx,
            StorageSettings {
                calibrations: config.calibrations.clone(),
                time_resolution: config.time_resolution_ns,
                flush_interval: config.flush_interval,
            },
            stop.clone(),
            Arc::clone(&stats),
            Arc::clone(&observer),
        )?;
        let parameters = source.parameters();

        let guard = PanicGuard(stop.clone());
        let consumer_handle = thread::Builder::new()
            .name("storage".into())
            .spawn(move || {
                let _guard = guard;
                consumer.run()
            })?;

        let producer = Producer::new(source, tx, stop.clone(), Arc::clone(&stats), observer);
        let guard = PanicGuard(stop.clone());
        let producer_handle = thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || {
                let _guard = guard;
                producer.run()
            });
        // If the spawn failed the sender went with the closure and the consumer
        // sees a disconnected queue.
        let producer_handle = match producer_handle {
            Ok(handle) => handle,
            Err(e) => {
                stop.set();
                let _ = consumer_handle.join();
                return Err(e.into());
            }
        };

        Ok(RunHandle {
            stop,
            stats,
            parameters,
            output_dir: config.output_dir,
            channel_count: config.channel_count,
            producer: producer_handle,
            consumer: consumer_handle,
        })
    }
}

/// Sets the stop flag if a worker unwinds, so the other one winds down too.
struct PanicGuard(StopFlag);

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.set();
        }
    }
}

/// A running pipeline.
pub struct RunHandle {
    stop: StopFlag,
    stats: Arc<RunStats>,
    parameters: Vec<(String, String)>,
    output_dir: PathBuf,
    channel_count: usize,
    producer: JoinHandle<ProducerReport>,
    consumer: JoinHandle<ConsumerReport>,
}

impl RunHandle {
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn output_dir(&self) -> &std::path::Path {
        &self.output_dir
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Source parameter values captured when the run started.
    pub fn source_parameters(&self) -> &[(String, String)] {
        &self.parameters
    }

    pub fn status(&self) -> StatusSnapshot {
        let s = &self.stats;
        let finished =
            s.producer_done.load(Ordering::SeqCst) && s.consumer_done.load(Ordering::SeqCst);
        StatusSnapshot {
            triggers: s.triggers.load(Ordering::Relaxed),
            frames_written: s.frames_written.load(Ordering::Relaxed),
            bytes_written: s.bytes_written.load(Ordering::Relaxed),
            queue_len: s.queue_len.load(Ordering::Relaxed),
            dropped: s.dropped.load(Ordering::Relaxed),
            gaps: s.gaps.load(Ordering::Relaxed),
            duplicates: s.duplicates.load(Ordering::Relaxed),
            running: !finished,
            stop_requested: self.stop.is_set(),
        }
    }

    /// True once both workers have returned.
    pub fn is_finished(&self) -> bool {
        self.producer.is_finished() && self.consumer.is_finished()
    }

    /// Ask both workers to stop and wait for them. Frames already queued are
    /// still written before the files are closed.
    pub fn request_stop(self) -> Result<RunSummary, PipelineError> {
        self.stop.set();
        self.wait()
    }

    /// Wait for the run to end on its own (source exhausted or failure).
    pub fn wait(self) -> Result<RunSummary, PipelineError> {
        let producer = self.producer.join();
        let consumer = self.consumer.join();
        Ok(RunSummary {
            producer: producer.map_err(|_| PipelineError::WorkerPanic("acquisition"))?,
            consumer: consumer.map_err(|_| PipelineError::WorkerPanic("storage"))?,
        })
    }
}
