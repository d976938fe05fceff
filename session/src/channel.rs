//! The communication channel seam.
//!
//! A [`Channel`] is one live connection to the server process. The controller
//! owns it exclusively and is the only caller of `start`/`stop`; everyone else
//! may only [`subscribe`](Channel::subscribe) to its events.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::launch::LaunchSpec;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelState {
    #[default]
    Stopped,
    Starting,
    Running,
}

/// A generic work-done progress notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Begin {
        title: String,
        message: Option<String>,
    },
    Report {
        message: Option<String>,
    },
    End {
        message: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    Progress(ProgressEvent),
    /// Any other server notification, by method name.
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to spawn server process: {0}")]
    Spawn(String),
    #[error("server handshake failed: {0}")]
    Handshake(String),
    #[error("channel I/O failed: {0}")]
    Io(String),
    #[error("channel closed")]
    Closed,
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn start(&self) -> Result<(), ChannelError>;

    async fn stop(&self) -> Result<(), ChannelError>;

    fn state(&self) -> ChannelState;

    /// Every event emitted after this call, in emission order. Delivery is
    /// unbounded and never drops.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent>;
}

/// Builds channels from resolved launch specs.
pub trait ChannelFactory: Send + Sync {
    fn create(&self, spec: &LaunchSpec) -> Result<Arc<dyn Channel>, ChannelError>;
}

/// State cell plus event fan-out shared by a channel and its I/O tasks.
///
/// State changes are emitted only when the state actually changes.
#[derive(Clone)]
pub(crate) struct ChannelSignals {
    state: Arc<Mutex<ChannelState>>,
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>>,
}

impl ChannelSignals {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState::Stopped)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<ChannelEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn state(&self) -> ChannelState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_state(&self, next: ChannelState) {
        {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *state == next {
                return;
            }
            *state = next;
        }
        self.emit(ChannelEvent::StateChanged(next));
    }

    /// No subscribers is not an error. Subscribers whose receiver is gone
    /// are pruned.
    pub fn emit(&self, event: ChannelEvent) {
        self.subscribers()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().push(tx);
        rx
    }
}
