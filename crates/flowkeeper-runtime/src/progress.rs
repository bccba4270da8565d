//! Progress reporting
//!
//! The executor emits `(completed, total, label)` after each item. Sinks must
//! not block; rendering is the caller's business.

use std::sync::mpsc::{self, Receiver, Sender};

/// One progress update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub completed: usize,
    pub total: usize,
    pub label: String,
}

/// Receiver of progress updates
pub trait ProgressSink: Send + Sync {
    fn report(&self, completed: usize, total: usize, label: &str);
}

/// Drops every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _completed: usize, _total: usize, _label: &str) {}
}

impl<F> ProgressSink for F
where
    F: Fn(usize, usize, &str) + Send + Sync,
{
    fn report(&self, completed: usize, total: usize, label: &str) {
        self(completed, total, label)
    }
}

/// Forwards updates over a channel; a dropped receiver is ignored.
pub struct ChannelProgress {
    tx: Sender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end
    pub fn channel() -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self::new(tx), rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, completed: usize, total: usize, label: &str) {
        let _ = self.tx.send(ProgressEvent {
            completed,
            total,
            label: label.to_string(),
        });
    }
}
