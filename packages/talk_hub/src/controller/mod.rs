//! Session controllers
//!
//! Each controller is a single tokio task that owns its registry outright.
//! Callers talk to it through bounded per-command queues; a full queue fails
//! the call with [`HubError::Canceled`] instead of waiting. Because the task
//! handles one command at a time the registries need no locks.

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{HubError, Result};

mod customer;
mod servicer;

pub use customer::CustomerController;
pub use servicer::ServicerController;

pub const DEFAULT_MAX_CACHE: usize = 100;
pub const DEFAULT_MAX_MESSAGE_CACHE: usize = 1000;

/// Queue capacities. Zero selects the built-in default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Capacity of each lifecycle/query command queue.
    pub max_cache: usize,
    /// Capacity of the message and post queues.
    pub max_message_cache: usize,
}

impl ControllerOptions {
    pub fn command_capacity(&self) -> usize {
        if self.max_cache == 0 {
            DEFAULT_MAX_CACHE
        } else {
            self.max_cache
        }
    }

    pub fn message_capacity(&self) -> usize {
        if self.max_message_cache == 0 {
            DEFAULT_MAX_MESSAGE_CACHE
        } else {
            self.max_message_cache
        }
    }
}

/// Work scheduled onto a controller task with exclusive access to its registry.
pub type Job<R> = Box<dyn for<'a> FnOnce(&'a mut R) -> BoxFuture<'a, ()> + Send>;

/// Cloneable handle for scheduling [`Job`]s onto a controller task.
pub struct Poster<R> {
    tx: mpsc::Sender<Job<R>>,
}

impl<R> Clone for Poster<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<R> Poster<R> {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<Job<R>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Best-effort: a job that does not fit in the queue is dropped.
    pub fn post<F>(&self, job: F)
    where
        F: for<'a> FnOnce(&'a mut R) -> BoxFuture<'a, ()> + Send + 'static,
    {
        if self.tx.try_send(Box::new(job)).is_err() {
            warn!("post queue full, job dropped");
        }
    }
}

pub(crate) fn enqueue<T>(tx: &mpsc::Sender<T>, item: T) -> Result<()> {
    tx.try_send(item).map_err(|_| HubError::Canceled)
}

pub(crate) fn log_outcome(command: &str, outcome: Result<()>) {
    if let Err(e) = outcome {
        warn!(command = command, code = e.error_code(), "command failed: {}", e);
    }
}
