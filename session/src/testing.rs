//! In-memory fakes for controller and aggregator tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use crate::channel::{Channel, ChannelError, ChannelEvent, ChannelFactory, ChannelSignals, ChannelState};
use crate::error::SessionError;
use crate::launch::{LaunchError, LaunchSpec, LaunchSpecResolver};
use crate::observer::SessionObserver;
use crate::types::{ServerConfig, ServerErrorInfo, ServerState, StatusUpdate};

/// Poll `condition` until it holds, failing the test after one second.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// How the next channel built by [`FakeFactory`] behaves.
#[derive(Clone, Default)]
pub(crate) struct FakeBehavior {
    pub start_error: Option<ChannelError>,
    pub stop_error: Option<ChannelError>,
    /// `start` blocks until this is notified.
    pub start_gate: Option<Arc<Notify>>,
}

impl FakeBehavior {
    pub fn gated(gate: &Arc<Notify>) -> Self {
        Self {
            start_gate: Some(Arc::clone(gate)),
            ..Self::default()
        }
    }
}

pub(crate) struct FakeChannel {
    signals: ChannelSignals,
    behavior: FakeBehavior,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl FakeChannel {
    pub fn new() -> Arc<Self> {
        Self::with_behavior(FakeBehavior::default())
    }

    pub fn with_behavior(behavior: FakeBehavior) -> Arc<Self> {
        Arc::new(Self {
            signals: ChannelSignals::new(),
            behavior,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn emit(&self, event: ChannelEvent) {
        self.signals.emit(event);
    }

    /// Move the channel to `state` as if the process did it on its own.
    pub fn force_state(&self, state: ChannelState) {
        self.signals.set_state(state);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for FakeChannel {
    async fn start(&self) -> Result<(), ChannelError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.signals.set_state(ChannelState::Starting);
        if let Some(gate) = &self.behavior.start_gate {
            gate.notified().await;
        }
        if let Some(err) = &self.behavior.start_error {
            self.signals.set_state(ChannelState::Stopped);
            return Err(err.clone());
        }
        self.signals.set_state(ChannelState::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.signals.set_state(ChannelState::Stopped);
        match &self.behavior.stop_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn state(&self) -> ChannelState {
        self.signals.state()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        self.signals.subscribe()
    }
}

/// Hands out [`FakeChannel`]s with queued behaviors and keeps every one it
/// built.
#[derive(Default)]
pub(crate) struct FakeFactory {
    behaviors: Mutex<VecDeque<FakeBehavior>>,
    create_errors: Mutex<VecDeque<ChannelError>>,
    created: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_behavior(&self, behavior: FakeBehavior) {
        self.behaviors.lock().unwrap().push_back(behavior);
    }

    pub fn push_create_error(&self, err: ChannelError) {
        self.create_errors.lock().unwrap().push_back(err);
    }

    pub fn created(&self) -> Vec<Arc<FakeChannel>> {
        self.created.lock().unwrap().clone()
    }

    pub fn channel(&self, index: usize) -> Arc<FakeChannel> {
        Arc::clone(&self.created.lock().unwrap()[index])
    }
}

impl ChannelFactory for FakeFactory {
    fn create(&self, _spec: &LaunchSpec) -> Result<Arc<dyn Channel>, ChannelError> {
        if let Some(err) = self.create_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let behavior = self.behaviors.lock().unwrap().pop_front().unwrap_or_default();
        let channel = FakeChannel::with_behavior(behavior);
        self.created.lock().unwrap().push(Arc::clone(&channel));
        Ok(channel)
    }
}

/// Resolves to a fixed spec unless a failure has been queued.
#[derive(Default)]
pub(crate) struct FakeResolver {
    failures: Mutex<VecDeque<LaunchError>>,
    seen: Mutex<Vec<ServerConfig>>,
}

impl FakeResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_failure(&self, err: LaunchError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Configs passed to `resolve`, in call order.
    pub fn seen(&self) -> Vec<ServerConfig> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LaunchSpecResolver for FakeResolver {
    async fn resolve(&self, config: &ServerConfig) -> Result<LaunchSpec, LaunchError> {
        self.seen.lock().unwrap().push(config.clone());
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(LaunchSpec {
            program: PathBuf::from(config.command()),
            args: config.args().to_vec(),
            working_dir: PathBuf::from("/workspace"),
            env: config.env().clone(),
            status_notification: config.status_notification().to_string(),
            initialization_options: config.initialization_options().cloned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Recorded {
    Status(ServerState),
    ServerError(Option<String>),
    Started,
    StartFailed(SessionError),
    Cleared,
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingObserver {
    /// Observer list for constructors that take several observers.
    pub fn as_observers(self: &Arc<Self>) -> Vec<Arc<dyn SessionObserver>> {
        vec![Arc::clone(self) as Arc<dyn SessionObserver>]
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<ServerState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Status(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn server_errors(&self) -> Vec<Option<String>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::ServerError(code) => Some(code),
                _ => None,
            })
            .collect()
    }

    /// Lifecycle callbacks only, without status noise.
    pub fn lifecycle(&self) -> Vec<Recorded> {
        self.events()
            .into_iter()
            .filter(|e| !matches!(e, Recorded::Status(_) | Recorded::ServerError(_)))
            .collect()
    }

    fn record(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }
}

impl SessionObserver for RecordingObserver {
    fn on_status(&self, update: &StatusUpdate) {
        self.record(Recorded::Status(update.state));
    }

    fn on_server_error(&self, error: &ServerErrorInfo) {
        self.record(Recorded::ServerError(error.code.clone()));
    }

    fn on_started(&self) {
        self.record(Recorded::Started);
    }

    fn on_start_failed(&self, error: &SessionError) {
        self.record(Recorded::StartFailed(error.clone()));
    }

    fn on_session_cleared(&self) {
        self.record(Recorded::Cleared);
    }
}
