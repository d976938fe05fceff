//! Session lifecycle controller.
//!
//! Owns at most one [`Channel`] to the server. `start`, `stop` and `restart`
//! are serialized through a [`LifecycleQueue`]; `shutdown` bypasses the queue
//! for process exit and may therefore overlap a queued start. The in-flight
//! start handle and a generation counter keep that overlap safe: a stop
//! always waits for a pending start, and a start superseded by a stop never
//! re-commits its channel.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

use crate::channel::{Channel, ChannelError, ChannelFactory, ChannelState};
use crate::error::SessionError;
use crate::launch::LaunchSpecResolver;
use crate::observer::{Observers, SessionObserver};
use crate::queue::LifecycleQueue;
use crate::status::StatusHub;
use crate::types::{FileProgress, ServerConfig, ServerState, StatusUpdate};

/// Shareable handle to a `Channel::start` running in its own task.
type PendingStart = Shared<BoxFuture<'static, Result<(), ChannelError>>>;

#[derive(Default)]
struct Session {
    channel: Option<Arc<dyn Channel>>,
    /// Set strictly between channel construction and start settlement.
    start_in_flight: Option<PendingStart>,
    /// Bumped whenever a start begins or a stop tears down.
    generation: u64,
    closed: bool,
}

struct SessionCore {
    config: RwLock<ServerConfig>,
    resolver: Arc<dyn LaunchSpecResolver>,
    factory: Arc<dyn ChannelFactory>,
    status: StatusHub,
    observers: Observers,
    session: Mutex<Session>,
}

impl SessionCore {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.session().closed {
            return Err(SessionError::QueueClosed);
        }
        Ok(())
    }

    fn config(&self) -> ServerConfig {
        self.config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn fail_start(&self, err: SessionError) -> SessionError {
        tracing::warn!("Server start failed: {err}");
        self.observers.start_failed(&err);
        err
    }

    async fn start(&self) -> Result<(), SessionError> {
        self.ensure_open()?;

        let existing = self.session().channel.clone();
        if let Some(channel) = existing {
            let state = channel.state();
            if state == ChannelState::Running {
                tracing::debug!("Server already running");
                return Ok(());
            }
            tracing::warn!(?state, "Existing session is not running; stopping it first");
            self.stop().await;
        }

        let config = self.config();
        tracing::info!(command = config.command(), "Starting server");

        let spec = match self.resolver.resolve(&config).await {
            Ok(spec) => spec,
            Err(e) => return Err(self.fail_start(e.into())),
        };
        let channel = match self.factory.create(&spec) {
            Ok(channel) => channel,
            Err(e) => return Err(self.fail_start(e.into())),
        };

        // Bind and register before the first suspension on the start, so a
        // concurrent stop can find the pending handle and no event is missed.
        let (generation, pending) = {
            let mut session = self.session();
            if session.closed {
                return Err(SessionError::QueueClosed);
            }
            session.generation += 1;
            self.status.bind(channel.as_ref(), &spec.status_notification);

            let task = tokio::spawn({
                let channel = Arc::clone(&channel);
                async move { channel.start().await }
            });
            let pending: PendingStart = async move {
                task.await
                    .unwrap_or_else(|e| Err(ChannelError::Io(format!("start task failed: {e}"))))
            }
            .boxed()
            .shared();

            session.channel = Some(channel);
            session.start_in_flight = Some(pending.clone());
            (session.generation, pending)
        };

        let result = pending.await;

        let current = {
            let mut session = self.session();
            let current = session.generation == generation;
            if current {
                session.start_in_flight = None;
                if result.is_err() {
                    session.channel = None;
                }
            }
            current
        };

        match result {
            Ok(()) if current => {
                tracing::info!("Server started");
                self.observers.started();
                Ok(())
            }
            Ok(()) => {
                tracing::debug!("Start completed after a stop superseded it");
                Ok(())
            }
            Err(e) => {
                if current {
                    self.status.clear();
                }
                Err(self.fail_start(e.into()))
            }
        }
    }

    async fn stop(&self) {
        let pending = {
            let session = self.session();
            if session.channel.is_none() && session.start_in_flight.is_none() {
                tracing::debug!("No active session to stop");
                return;
            }
            session.start_in_flight.clone()
        };

        if let Some(pending) = pending {
            tracing::info!("Waiting for in-flight start before stopping");
            if let Err(e) = pending.await {
                tracing::warn!("In-flight start failed during stop: {e}");
            }
        }

        let channel = {
            let mut session = self.session();
            session.generation += 1;
            session.start_in_flight = None;
            session.channel.take()
        };

        if let Some(channel) = channel {
            match channel.state() {
                ChannelState::Running => {
                    tracing::info!("Stopping server");
                    if let Err(e) = channel.stop().await {
                        tracing::warn!("Server did not stop cleanly: {e}");
                    }
                }
                ChannelState::Stopped => tracing::debug!("Server already stopped"),
                state => tracing::warn!(?state, "Server is mid-transition; releasing it without stop"),
            }
        }

        self.status.clear();
        self.observers.session_cleared();
    }
}

/// Entry point for embedding applications.
pub struct SessionController {
    core: Arc<SessionCore>,
    queue: LifecycleQueue,
}

impl SessionController {
    /// Must be called inside a Tokio runtime; spawns the queue worker.
    pub fn new(
        config: ServerConfig,
        resolver: Arc<dyn LaunchSpecResolver>,
        factory: Arc<dyn ChannelFactory>,
        observers: Vec<Arc<dyn SessionObserver>>,
    ) -> Self {
        let observers = Observers::new(observers);
        let core = SessionCore {
            config: RwLock::new(config),
            resolver,
            factory,
            status: StatusHub::new(observers.clone()),
            observers,
            session: Mutex::new(Session::default()),
        };
        Self {
            core: Arc::new(core),
            queue: LifecycleQueue::new(),
        }
    }

    /// Queue a start. Resolves once this start (and everything queued before
    /// it) has settled. A no-op when the server is already running.
    pub fn start(&self) -> impl Future<Output = Result<(), SessionError>> + Send + use<> {
        let core = Arc::clone(&self.core);
        self.queue.submit(async move { core.start().await })
    }

    /// Queue a stop. Stop failures are logged, never returned.
    pub fn stop(&self) -> impl Future<Output = Result<(), SessionError>> + Send + use<> {
        let core = Arc::clone(&self.core);
        self.queue.submit(async move {
            core.ensure_open()?;
            core.stop().await;
            Ok(())
        })
    }

    /// Queue a stop followed by a start as one unit.
    ///
    /// A failed start is reported to observers, not returned; the result only
    /// carries queue failures.
    pub fn restart(&self) -> impl Future<Output = Result<(), SessionError>> + Send + use<> {
        let core = Arc::clone(&self.core);
        self.queue.submit(async move {
            core.ensure_open()?;
            tracing::info!("Restarting server");
            core.stop().await;
            if let Err(e) = core.start().await {
                tracing::warn!("Restart could not start the server: {e}");
            }
            Ok(())
        })
    }

    /// Stop immediately, without waiting behind queued operations, and refuse
    /// any further ones. Waits for a start that is already in flight.
    pub async fn shutdown(&self) {
        self.queue.close();
        let already_closed = std::mem::replace(&mut self.core.session().closed, true);
        if already_closed {
            return;
        }
        tracing::info!("Shutting down server session");
        self.core.stop().await;
    }

    /// Takes effect on the next start or restart.
    pub fn update_config(&self, config: ServerConfig) {
        tracing::debug!(command = config.command(), "Server config updated");
        *self
            .core
            .config
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = config;
    }

    #[must_use]
    pub fn status(&self) -> StatusUpdate {
        self.core.status.current()
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        self.core.status.state()
    }

    #[must_use]
    pub fn message(&self) -> Option<String> {
        self.core.status.message()
    }

    #[must_use]
    pub fn file_progress(&self) -> Option<FileProgress> {
        self.core.status.file_progress()
    }

    /// Whether a channel exists or is being started.
    #[must_use]
    pub fn has_session(&self) -> bool {
        let session = self.core.session();
        session.channel.is_some() || session.start_in_flight.is_some()
    }
}
