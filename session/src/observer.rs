//! Observer seam for UI and notification layers.
//!
//! Callbacks run synchronously on the task that produced the change, in
//! order. No status lock is held while they run, so an observer may read
//! `state()` or `status()` from inside a callback.

use std::sync::Arc;

use crate::error::SessionError;
use crate::types::{ServerErrorInfo, StatusUpdate};

pub trait SessionObserver: Send + Sync {
    /// Called after every status mutation.
    fn on_status(&self, _update: &StatusUpdate) {}

    /// Called once when the state transitions into `Error`.
    fn on_server_error(&self, _error: &ServerErrorInfo) {}

    fn on_started(&self) {}

    /// Launch and start failures. Not retried; `restart` is the recovery path.
    fn on_start_failed(&self, _error: &SessionError) {}

    /// No active session remains.
    fn on_session_cleared(&self) {}
}

/// Immutable fan-out list shared by the controller and the aggregator.
#[derive(Clone, Default)]
pub(crate) struct Observers {
    list: Arc<[Arc<dyn SessionObserver>]>,
}

impl Observers {
    pub fn new(list: Vec<Arc<dyn SessionObserver>>) -> Self {
        Self { list: list.into() }
    }

    pub fn status(&self, update: &StatusUpdate) {
        for observer in self.list.iter() {
            observer.on_status(update);
        }
    }

    pub fn server_error(&self, error: &ServerErrorInfo) {
        for observer in self.list.iter() {
            observer.on_server_error(error);
        }
    }

    pub fn started(&self) {
        for observer in self.list.iter() {
            observer.on_started();
        }
    }

    pub fn start_failed(&self, error: &SessionError) {
        for observer in self.list.iter() {
            observer.on_start_failed(error);
        }
    }

    pub fn session_cleared(&self) {
        for observer in self.list.iter() {
            observer.on_session_cleared();
        }
    }
}
