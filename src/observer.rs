//! Structured reporting out of the worker threads.
//!
//! Workers never print. They describe what happened as a [`PipelineEvent`]
//! and hand it to whatever [`PipelineObserver`] the run was started with:
//! the `log` facade, the status screen, or both.

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Worker {
    Producer,
    Consumer,
}

impl std::fmt::Display for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Worker::Producer => write!(f, "acquisition"),
            Worker::Consumer => write!(f, "storage"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A worker moved to a new lifecycle state.
    State { worker: Worker, state: &'static str },
    FrameAcquired { trigger_id: u32, bytes: usize, queue_len: usize },
    FramesDropped { count: u64 },
    /// The trigger id did not follow the previous one.
    TriggerGap { expected: u32, got: u32 },
    FrameWritten { trigger_id: u32, bytes: usize, queue_len: usize },
    Flushed { trigger_id: u32 },
    /// The consumer waited a full timeout without data.
    QueueIdle { stop_requested: bool },
    Failed { worker: Worker, cause: String },
    Finished { worker: Worker, frames: u64 },
}

pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

impl<O: PipelineObserver + ?Sized> PipelineObserver for Arc<O> {
    fn on_event(&self, event: &PipelineEvent) {
        (**self).on_event(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl PipelineObserver for NullObserver {
    fn on_event(&self, _event: &PipelineEvent) {}
}

/// Writes events through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl PipelineObserver for LogObserver {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::State { worker, state } => info!("[{worker}] {state}"),
            PipelineEvent::FrameAcquired {
                trigger_id,
                queue_len,
                ..
            } => debug!("[acquisition] trigger {trigger_id} queued ({queue_len} waiting)"),
            PipelineEvent::FramesDropped { count } => {
                warn!("[acquisition] queue full, dropped {count} oldest frame(s)")
            }
            PipelineEvent::TriggerGap { expected, got } => {
                warn!("[acquisition] trigger id {got} received, expected {expected}")
            }
            PipelineEvent::FrameWritten {
                trigger_id, bytes, ..
            } => debug!("[storage] trigger {trigger_id} saved ({bytes} bytes)"),
            PipelineEvent::Flushed { trigger_id } => {
                debug!("[storage] flushed at trigger {trigger_id}")
            }
            PipelineEvent::QueueIdle { stop_requested } => {
                debug!("[storage] queue idle (stop requested: {stop_requested})")
            }
            PipelineEvent::Failed { worker, cause } => error!("[{worker}] {cause}"),
            PipelineEvent::Finished { worker, frames } => {
                info!("[{worker}] finished after {frames} frames")
            }
        }
    }
}

/// Forwards events to another thread, e.g. the status screen.
///
/// Sending never blocks a worker; events are dropped once the receiver is gone.
pub struct ChannelObserver {
    tx: Sender<PipelineEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<PipelineEvent>) -> Self {
        Self { tx }
    }
}

impl PipelineObserver for ChannelObserver {
    fn on_event(&self, event: &PipelineEvent) {
        let _ = self.tx.try_send(event.clone());
    }
}

/// Broadcasts each event to several observers in order.
#[derive(Default)]
pub struct Fanout {
    observers: Vec<Box<dyn PipelineObserver>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: impl PipelineObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }
}

impl PipelineObserver for Fanout {
    fn on_event(&self, event: &PipelineEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}
