use crate::record::{write_record, RecordHeader};
use crate::{
    Calibration, Frame, FrameReceiver, PipelineError, PipelineEvent, PipelineObserver, QueueItem,
    RunStats, StopFlag, Worker,
};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How long the consumer waits on the queue before re-checking the stop flag.
pub const QUEUE_POLL: Duration = Duration::from_secs(1);

pub const DEFAULT_FLUSH_INTERVAL: u32 = 10;

const WRITE_BUFFER: usize = 8 * 1024;

/// File name used for a channel's records.
pub fn channel_file_name(channel: usize) -> String {
    format!("raw_CH{channel}.bin")
}

pub fn channel_file_path(dir: &Path, channel: usize) -> PathBuf {
    dir.join(channel_file_name(channel))
}

/// Append-only record sink for a single channel.
pub struct ChannelWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    records: u64,
    bytes: u64,
}

impl ChannelWriter {
    pub fn open(dir: &Path, channel: usize) -> io::Result<Self> {
        let path = channel_file_path(dir, channel);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Some(BufWriter::with_capacity(WRITE_BUFFER, file)),
            records: 0,
            bytes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn append(&mut self, header: &RecordHeader, samples: &[f32]) -> io::Result<usize> {
        let file = self.file.as_mut().ok_or_else(closed)?;
        let n = write_record(file, header, samples)?;
        self.records += 1;
        self.bytes += n as u64;
        Ok(n)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.as_mut().ok_or_else(closed)?.flush()
    }

    /// Flush buffered data, sync it to disk and release the file.
    /// Closing twice is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        if let Some(writer) = self.file.take() {
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn closed() -> io::Error {
    io::Error::other("channel file already closed")
}

/// One writer per channel index, opened together and closed together.
pub struct ChannelFiles {
    writers: Vec<ChannelWriter>,
}

impl ChannelFiles {
    /// Create `dir` if needed and open `raw_CH0.bin .. raw_CH{n-1}.bin` for appending.
    pub fn open_all(dir: &Path, n_channels: usize) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let writers = (0..n_channels)
            .map(|ch| ChannelWriter::open(dir, ch))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self { writers })
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    pub fn get_mut(&mut self, channel: usize) -> Option<&mut ChannelWriter> {
        self.writers.get_mut(channel)
    }

    pub fn flush_all(&mut self) -> io::Result<()> {
        for w in &mut self.writers {
            w.flush()?;
        }
        Ok(())
    }

    /// Close every file, even if an earlier one fails. Returns the first error.
    pub fn close_all(&mut self) -> io::Result<()> {
        let mut first = None;
        for w in &mut self.writers {
            if let Err(e) = w.close() {
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Opening,
    Draining,
    Closing,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Opening => "opening",
            ConsumerState::Draining => "draining queue",
            ConsumerState::Closing => "closing",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub frames: u64,
    pub records: u64,
    pub bytes: u64,
    pub error: Option<String>,
}

/// Parameters of the on-disk records that stay fixed for a run.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub calibrations: Vec<Calibration>,
    /// Tick duration in nanoseconds, stored in every record header.
    pub time_resolution: u64,
    /// Flush every file when `trigger_id % flush_interval == 0`; 0 disables.
    pub flush_interval: u32,
}

/// Drains the frame queue into per-channel files.
pub struct StorageConsumer {
    rx: FrameReceiver,
    files: ChannelFiles,
    settings: StorageSettings,
    stop: StopFlag,
    stats: Arc<RunStats>,
    observer: Arc<dyn PipelineObserver>,
    state: ConsumerState,
    scratch: Vec<f32>,
}

impl StorageConsumer {
    /// Open the channel files. Files exist on disk once this returns, even if
    /// the run is stopped before the first frame.
    pub fn open(
        output_dir: &Path,
        rx: FrameReceiver,
        settings: StorageSettings,
        stop: StopFlag,
        stats: Arc<RunStats>,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<Self, PipelineError> {
        observer.on_event(&PipelineEvent::State {
            worker: Worker::Consumer,
            state: ConsumerState::Opening.as_str(),
        });
        let files = ChannelFiles::open_all(output_dir, settings.calibrations.len())?;
        Ok(Self {
            rx,
            files,
            settings,
            stop,
            stats,
            observer,
            state: ConsumerState::Opening,
            scratch: Vec::new(),
        })
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Write frames until the end-of-stream marker arrives or a write fails,
    /// then flush and close every file.
    pub fn run(mut self) -> ConsumerReport {
        let mut report = ConsumerReport::default();

        self.enter(ConsumerState::Draining);
        if let Err(e) = self.drain(&mut report) {
            self.fail(&mut report, e.to_string());
        }

        self.enter(ConsumerState::Closing);
        if let Err(e) = self.files.close_all() {
            self.fail(&mut report, format!("closing channel files: {e}"));
        }

        self.stats.consumer_finished();
        self.observer.on_event(&PipelineEvent::Finished {
            worker: Worker::Consumer,
            frames: report.frames,
        });
        report
    }

    fn drain(&mut self, report: &mut ConsumerReport) -> Result<(), PipelineError> {
        loop {
            let item = match self.rx.get(QUEUE_POLL) {
                Ok(Some(item)) => item,
                Ok(None) => {
                    // The producer always queues the marker, so keep draining.
                    self.observer.on_event(&PipelineEvent::QueueIdle {
                        stop_requested: self.stop.is_set(),
                    });
                    continue;
                }
                // A producer that vanished without the marker is an error too.
                Err(e) => return Err(e.into()),
            };
            self.stats.set_queue_len(self.rx.len());

            match item {
                QueueItem::EndOfStream => return Ok(()),
                QueueItem::Frame(frame) => self.write_frame(&frame, report)?,
            }
        }
    }

    fn write_frame(
        &mut self,
        frame: &Frame,
        report: &mut ConsumerReport,
    ) -> Result<(), PipelineError> {
        if frame.n_channels() != self.files.len() {
            return Err(PipelineError::ChannelCount {
                trigger_id: frame.trigger_id,
                expected: self.files.len(),
                got: frame.n_channels(),
            });
        }

        let mut bytes = 0usize;
        for ch in 0..frame.n_channels() {
            let raw = frame.valid_samples(ch);
            let sample_count =
                u32::try_from(raw.len()).map_err(|_| PipelineError::RecordTooLarge {
                    channel: ch,
                    samples: raw.len() as u64,
                })?;
            let header = RecordHeader {
                trigger_id: frame.trigger_id,
                timestamp: frame.timestamp,
                sample_count,
                time_resolution: self.settings.time_resolution,
            };
            self.settings.calibrations[ch].apply_into(raw, &mut self.scratch);

            let writer = self
                .files
                .get_mut(ch)
                .ok_or_else(|| PipelineError::Config(format!("no file for channel {ch}")))?;
            bytes += writer.append(&header, &self.scratch)?;
        }

        let interval = self.settings.flush_interval;
        if interval > 0 && frame.trigger_id % interval == 0 {
            self.files.flush_all()?;
            self.observer.on_event(&PipelineEvent::Flushed {
                trigger_id: frame.trigger_id,
            });
        }

        // Counted only once every channel and the flush went through.
        report.frames += 1;
        report.records += frame.n_channels() as u64;
        report.bytes += bytes as u64;
        self.stats.add_written(bytes as u64);
        self.observer.on_event(&PipelineEvent::FrameWritten {
            trigger_id: frame.trigger_id,
            bytes,
            queue_len: self.rx.len(),
        });
        Ok(())
    }

    fn enter(&mut self, state: ConsumerState) {
        self.state = state;
        self.observer.on_event(&PipelineEvent::State {
            worker: Worker::Consumer,
            state: state.as_str(),
        });
    }

    fn fail(&mut self, report: &mut ConsumerReport, cause: String) {
        self.stop.set();
        self.observer.on_event(&PipelineEvent::Failed {
            worker: Worker::Consumer,
            cause: cause.clone(),
        });
        if report.error.is_none() {
            report.error = Some(cause);
        }
    }
}
