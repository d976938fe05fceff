//! Status aggregation: fuses channel state, generic progress, and structured
//! status notifications into one [`ServerState`].
//!
//! Sources in ascending authority:
//!
//! 1. channel state transitions (coarse),
//! 2. `$/progress` begin/report/end with free-text titles (heuristic),
//! 3. the structured status notification (authoritative).
//!
//! Once a structured status carrying `filesTotal` has arrived for a session,
//! progress keywords no longer move the state.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelEvent, ChannelState, ProgressEvent};
use crate::observer::Observers;
use crate::protocol;
use crate::types::{
    DEFAULT_STATUS_NOTIFICATION, FileProgress, Health, ServerErrorInfo, ServerState,
    StatusSnapshot, StatusUpdate,
};

const DEGRADED_KEYWORDS: &[&str] = &["failed", "error"];
const RESOLVING_KEYWORDS: &[&str] = &["resolving", "gradle", "maven", "dependencies", "connecting"];
const INDEXING_KEYWORDS: &[&str] = &["indexing", "compiling", "analyzing"];
const READY_KEYWORDS: &[&str] = &["ready", "complete", "loaded"];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Keyword inference over free-text progress. Order matters: an error word
/// must win over any activity word in the same text.
fn infer_from_progress_text(text: &str) -> Option<ServerState> {
    let text = text.to_lowercase();
    if contains_any(&text, DEGRADED_KEYWORDS) {
        Some(ServerState::Degraded)
    } else if contains_any(&text, RESOLVING_KEYWORDS) {
        Some(ServerState::ResolvingDeps)
    } else if contains_any(&text, INDEXING_KEYWORDS) {
        Some(ServerState::Indexing)
    } else if contains_any(&text, READY_KEYWORDS) {
        Some(ServerState::Ready)
    } else {
        None
    }
}

/// Derive the state from a structured snapshot. Errors are checked first so
/// an in-progress message can never shadow them.
fn state_from_snapshot(snapshot: &StatusSnapshot) -> ServerState {
    if snapshot.health == Health::Error || snapshot.error_code.is_some() {
        return ServerState::Error;
    }
    if snapshot.health == Health::Warning {
        return ServerState::Degraded;
    }
    if snapshot.quiescent {
        return ServerState::Ready;
    }

    let message = snapshot
        .message
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    if contains_any(&message, &["resolving", "dependencies"]) {
        ServerState::ResolvingDeps
    } else if message.contains("indexing") {
        ServerState::Indexing
    } else if contains_any(&message, &["initializing", "starting"]) {
        ServerState::Starting
    } else if snapshot.files_total.is_some_and(|total| total > 0) {
        ServerState::Indexing
    } else {
        ServerState::Starting
    }
}

/// The pure state machine. Owns no tasks; [`StatusHub`] drives it.
pub struct StatusAggregator {
    state: ServerState,
    message: Option<String>,
    open_progress: u32,
    snapshot: Option<StatusSnapshot>,
    status_method: String,
    observers: Observers,
}

impl StatusAggregator {
    pub(crate) fn new(observers: Observers) -> Self {
        Self {
            state: ServerState::Stopped,
            message: None,
            open_progress: 0,
            snapshot: None,
            status_method: DEFAULT_STATUS_NOTIFICATION.to_string(),
            observers,
        }
    }

    /// Forget everything about the previous session.
    pub fn reset(&mut self, status_method: &str) {
        self.state = ServerState::Stopped;
        self.message = None;
        self.open_progress = 0;
        self.snapshot = None;
        status_method.clone_into(&mut self.status_method);
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        self.state
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn file_progress(&self) -> Option<FileProgress> {
        self.snapshot.as_ref().and_then(StatusSnapshot::file_progress)
    }

    #[must_use]
    pub fn open_progress(&self) -> u32 {
        self.open_progress
    }

    fn error_info(&self) -> Option<ServerErrorInfo> {
        if self.state != ServerState::Error {
            return None;
        }
        let snapshot = self.snapshot.as_ref();
        Some(ServerErrorInfo {
            code: snapshot.and_then(|s| s.error_code.clone()),
            details: snapshot.and_then(|s| s.error_details.clone()),
        })
    }

    #[must_use]
    pub fn update(&self) -> StatusUpdate {
        StatusUpdate {
            state: self.state,
            message: self.message.clone(),
            file_progress: self.file_progress(),
            error: self.error_info(),
        }
    }

    /// Structured status is authoritative once it has reported file totals.
    fn progress_suppressed(&self) -> bool {
        self.snapshot
            .as_ref()
            .is_some_and(|snapshot| snapshot.files_total.is_some())
    }

    /// Apply one channel event and publish the result.
    pub fn handle(&mut self, event: &ChannelEvent) {
        if let Some(publication) = self.apply(event) {
            publication.deliver();
        }
    }

    /// Apply one channel event; the returned publication must be delivered
    /// by the caller.
    pub(crate) fn apply(&mut self, event: &ChannelEvent) -> Option<Publication> {
        let previous = self.state;
        let mutated = match event {
            ChannelEvent::StateChanged(state) => {
                self.on_channel_state(*state);
                true
            }
            ChannelEvent::Progress(progress) => {
                self.on_progress(progress);
                true
            }
            ChannelEvent::Notification { method, params } if *method == self.status_method => {
                self.on_status_notification(params.as_ref())
            }
            ChannelEvent::Notification { .. } => false,
        };
        mutated.then(|| self.publication(previous))
    }

    fn on_channel_state(&mut self, state: ChannelState) {
        match state {
            ChannelState::Running => {
                if matches!(self.state, ServerState::Stopped | ServerState::Starting) {
                    self.state = ServerState::Ready;
                }
            }
            ChannelState::Starting => {
                self.state = ServerState::Starting;
                self.message = None;
                self.open_progress = 0;
            }
            ChannelState::Stopped => {
                self.state = ServerState::Stopped;
                self.message = None;
                self.open_progress = 0;
            }
        }
    }

    fn on_progress(&mut self, progress: &ProgressEvent) {
        let suppressed = self.progress_suppressed();
        match progress {
            ProgressEvent::Begin { title, message } => {
                self.open_progress += 1;
                if suppressed {
                    return;
                }
                let text = match message {
                    Some(message) => format!("{title} {message}"),
                    None => title.clone(),
                };
                self.message = Some(message.clone().unwrap_or_else(|| title.clone()));
                self.infer(&text);
            }
            ProgressEvent::Report { message } => {
                if suppressed {
                    return;
                }
                if let Some(message) = message {
                    self.message = Some(message.clone());
                    self.infer(message);
                }
            }
            ProgressEvent::End { .. } => {
                self.open_progress = self.open_progress.saturating_sub(1);
                if suppressed {
                    return;
                }
                if self.open_progress == 0
                    && matches!(
                        self.state,
                        ServerState::ResolvingDeps | ServerState::Indexing
                    )
                {
                    self.state = ServerState::Ready;
                    self.message = None;
                }
            }
        }
    }

    fn infer(&mut self, text: &str) {
        if let Some(state) = infer_from_progress_text(text) {
            self.state = state;
        }
    }

    /// Returns whether anything changed; malformed payloads are dropped.
    fn on_status_notification(&mut self, params: Option<&serde_json::Value>) -> bool {
        let params = params.cloned().unwrap_or(serde_json::Value::Null);
        let snapshot = match protocol::parse_status(params) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!("Ignoring malformed status notification: {e}");
                return false;
            }
        };
        self.state = state_from_snapshot(&snapshot);
        self.message.clone_from(&snapshot.message);
        self.snapshot = Some(snapshot);
        true
    }

    fn publication(&self, previous: ServerState) -> Publication {
        if previous != self.state {
            tracing::debug!(from = %previous, to = %self.state, "Server state changed");
        }
        let update = self.update();
        let entered_error = previous != ServerState::Error && update.error.is_some();
        if entered_error && let Some(error) = &update.error {
            tracing::warn!(%error, "Server entered error state");
        }
        Publication {
            update,
            entered_error,
            observers: self.observers.clone(),
        }
    }
}

/// A status change computed under the hub lock and delivered after it is
/// released, so observers may read the hub.
#[must_use]
pub(crate) struct Publication {
    update: StatusUpdate,
    entered_error: bool,
    observers: Observers,
}

impl Publication {
    fn deliver(self) {
        self.observers.status(&self.update);
        if self.entered_error
            && let Some(error) = &self.update.error
        {
            self.observers.server_error(error);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

struct HubInner {
    aggregator: StatusAggregator,
    /// Incremented on every bind/clear; events tagged with an older value are
    /// from a torn-down subscription.
    binding: u64,
    pump: Option<JoinHandle<()>>,
}

impl HubInner {
    fn teardown(&mut self) {
        self.binding += 1;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Shared handle that binds the aggregator to one channel at a time.
///
/// `delivery` is held from applying an event until its observers have run,
/// so publications reach observers in the order they were computed. It is
/// always taken before `inner`.
#[derive(Clone)]
pub struct StatusHub {
    inner: Arc<Mutex<HubInner>>,
    delivery: Arc<Mutex<()>>,
}

impl StatusHub {
    pub(crate) fn new(observers: Observers) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                aggregator: StatusAggregator::new(observers),
                binding: 0,
                pump: None,
            })),
            delivery: Arc::new(Mutex::new(())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        lock(&self.inner)
    }

    /// Reset state and subscribe to `channel`, dropping any previous
    /// subscription. The subscription is taken before this returns, so every
    /// event the channel emits afterwards is seen.
    pub fn bind(&self, channel: &dyn Channel, status_method: &str) {
        let mut events = channel.subscribe();
        let mut inner = self.lock();
        inner.teardown();
        inner.aggregator.reset(status_method);
        let binding = inner.binding;

        let hub: Weak<Mutex<HubInner>> = Arc::downgrade(&self.inner);
        let delivery = Arc::clone(&self.delivery);
        inner.pump = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(hub) = hub.upgrade() else { break };
                let _delivering = lock(&delivery);
                let publication = {
                    let mut inner = lock(&hub);
                    if inner.binding != binding {
                        break;
                    }
                    inner.aggregator.apply(&event)
                };
                if let Some(publication) = publication {
                    publication.deliver();
                }
            }
        }));
    }

    /// Tear down the subscription and publish the no-session state.
    pub fn clear(&self) {
        let _delivering = lock(&self.delivery);
        let publication = {
            let mut inner = self.lock();
            inner.teardown();
            let previous = inner.aggregator.state();
            let status_method = inner.aggregator.status_method.clone();
            inner.aggregator.reset(&status_method);
            inner.aggregator.publication(previous)
        };
        publication.deliver();
    }

    #[must_use]
    pub fn current(&self) -> StatusUpdate {
        self.lock().aggregator.update()
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        self.lock().aggregator.state()
    }

    #[must_use]
    pub fn message(&self) -> Option<String> {
        self.lock().aggregator.message().map(String::from)
    }

    #[must_use]
    pub fn file_progress(&self) -> Option<FileProgress> {
        self.lock().aggregator.file_progress()
    }
}
