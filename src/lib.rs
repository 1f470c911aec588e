//! Triggered waveform acquisition streamed to per-channel binary files.
//!
//! A [`Producer`] pulls one [`Frame`] per trigger from a [`FrameSource`] and
//! hands it over a bounded queue to the [`StorageConsumer`], which calibrates
//! each channel's valid samples and appends them as records to
//! `raw_CH<n>.bin`. [`RecordReader`] decodes those files again.

mod calibration;
mod config;
mod error;
mod event;
mod observer;
mod pipeline;
mod producer;
mod queue;
mod reader;
pub mod record;
mod source;
mod tui;
mod utils;
mod writer;

pub use calibration::*;
pub use config::*;
pub use error::*;
pub use event::*;
pub use observer::*;
pub use pipeline::*;
pub use producer::*;
pub use queue::*;
pub use reader::*;
pub use record::{Record, RecordHeader};
pub use source::*;
pub use tui::*;
pub use utils::*;
pub use writer::*;
