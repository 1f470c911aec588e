//! Error types shared across the acquisition pipeline.
//!
//! Each stage owns its own error enum so the workers can tell a source failure
//! from a storage failure when they report why a run ended. Binaries wrap all
//! of these in `anyhow` at the top level.

use thiserror::Error;

/// Failures reported by a [`FrameSource`](crate::FrameSource).
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("device not connected: {0}")]
    Connection(String),

    #[error("timed out waiting for trigger data")]
    Timeout,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("device command '{command}' failed: {reason}")]
    Command { command: String, reason: String },

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A frame whose shape breaks the `valid_count <= buffer length` invariant.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame has {rows} waveform rows but {counts} valid counts")]
    ChannelMismatch { rows: usize, counts: usize },

    #[error("channel {channel}: valid count {valid} exceeds buffer length {len}")]
    ValidCountOverflow { channel: usize, valid: u64, len: usize },
}

#[derive(Error, Debug, PartialEq)]
pub enum CalibrationError {
    #[error("unsupported ADC bit depth {0} (expected 1..=16)")]
    BitDepth(u32),

    #[error("calibration scale must be finite, got {0}")]
    Scale(f64),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("frame queue full ({capacity} frames)")]
    Full { capacity: usize },

    #[error("frame queue peer disconnected")]
    Disconnected,

    #[error("end-of-stream already sent")]
    Finished,
}

/// Raised by the record reader. Only the trailing fragment of a file is
/// affected; every record before `offset` was decoded successfully.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("truncated record at byte {offset}: needed {needed} bytes, found {got}")]
    Truncated { offset: u64, needed: usize, got: usize },

    #[error("I/O error while decoding: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the control surface and the storage consumer.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid run configuration: {0}")]
    Config(String),

    #[error("frame from trigger {trigger_id} has {got} channels, run expects {expected}")]
    ChannelCount { trigger_id: u32, expected: usize, got: usize },

    #[error("channel {channel}: {samples} samples do not fit in a record")]
    RecordTooLarge { channel: usize, samples: u64 },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("worker thread '{0}' panicked")]
    WorkerPanic(&'static str),
}
