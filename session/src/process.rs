//! Channel backed by a child process speaking JSON-RPC over stdio.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::{
    Channel, ChannelError, ChannelEvent, ChannelFactory, ChannelSignals, ChannelState,
};
use crate::codec::{FrameReader, FrameWriter};
use crate::launch::LaunchSpec;
use crate::protocol::{self, Incoming, Notification, Request};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const EXIT_TIMEOUT: Duration = Duration::from_secs(2);

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Inherited environment variables matching these patterns are not passed to
/// the server.
const ENV_SECRET_DENYLIST: &[&str] = &[
    "*_API_KEY",
    "*_TOKEN",
    "*_SECRET",
    "*_SECRET_KEY",
    "*_PASSWORD",
    "*_CREDENTIAL*",
    "AWS_*",
    "AZURE_*",
];

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

/// `*` wildcards at either end; comparison is case-insensitive.
fn env_glob_matches(pattern: &str, key: &str) -> bool {
    let pattern = pattern.to_ascii_uppercase();
    let key = key.to_ascii_uppercase();
    let (leading, rest) = match pattern.strip_prefix('*') {
        Some(rest) => (true, rest),
        None => (false, pattern.as_str()),
    };
    let (trailing, core) = match rest.strip_suffix('*') {
        Some(core) => (true, core),
        None => (false, rest),
    };
    match (leading, trailing) {
        (true, true) => key.contains(core),
        (true, false) => key.ends_with(core),
        (false, true) => key.starts_with(core),
        (false, false) => key == core,
    }
}

fn is_secret_env(key: &str) -> bool {
    ENV_SECRET_DENYLIST
        .iter()
        .any(|pattern| env_glob_matches(pattern, key))
}

/// Build the reply to a request initiated by the server.
///
/// Progress token creation must be acknowledged or the server never sends
/// `$/progress`. Everything we don't implement gets method-not-found so the
/// server doesn't block waiting.
fn answer_server_request(
    id: &serde_json::Value,
    method: &str,
    params: Option<&serde_json::Value>,
) -> serde_json::Value {
    match method {
        "window/workDoneProgress/create"
        | "client/registerCapability"
        | "client/unregisterCapability" => protocol::reply_result(id, serde_json::Value::Null),
        "workspace/configuration" => {
            let items = params
                .and_then(|p| p.get("items"))
                .and_then(serde_json::Value::as_array)
                .map_or(0, Vec::len);
            protocol::reply_result(
                id,
                serde_json::Value::Array(vec![serde_json::Value::Null; items]),
            )
        }
        _ => protocol::reply_method_not_found(id, method),
    }
}

async fn dispatch_frame(
    frame: serde_json::Value,
    pending: &PendingMap,
    signals: &ChannelSignals,
    writer_tx: &mpsc::Sender<WriterCommand>,
) {
    let Some(incoming) = Incoming::classify(frame) else {
        tracing::trace!("Ignoring malformed JSON-RPC frame");
        return;
    };

    match incoming {
        Incoming::Response { id, body } => {
            let sender = pending.lock().await.remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(body);
                }
                None => tracing::trace!(id, "Response for unknown request id"),
            }
        }
        Incoming::ServerRequest { id, method, params } => {
            tracing::debug!(%method, "Server request");
            let reply = answer_server_request(&id, &method, params.as_ref());
            let _ = writer_tx.send(WriterCommand::Send(reply)).await;
        }
        Incoming::Notification { method, params } => {
            if method == "$/progress" {
                match params.as_ref().and_then(protocol::parse_progress) {
                    Some(event) => signals.emit(ChannelEvent::Progress(event)),
                    None => tracing::trace!("Ignoring unrecognized $/progress payload"),
                }
            } else {
                tracing::trace!(%method, "Server notification");
                signals.emit(ChannelEvent::Notification { method, params });
            }
        }
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "tether::server", "{line}");
    }
}

/// Live I/O plumbing for one spawned process.
struct Connection {
    child: Child,
    writer_tx: mpsc::Sender<WriterCommand>,
    pending: PendingMap,
    next_id: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    async fn open(spec: &LaunchSpec, signals: &ChannelSignals) -> Result<Self, ChannelError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, _) in std::env::vars_os() {
            if let Some(name) = key.to_str()
                && is_secret_env(name)
            {
                cmd.env_remove(&key);
            }
        }
        cmd.envs(&spec.env);

        let spawn_error =
            |detail: String| ChannelError::Spawn(format!("{}: {detail}", spec.program.display()));
        let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("no stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("no stdout pipe".into()))?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);

        let writer = tokio::spawn(async move {
            let mut writer = FrameWriter::new(stdin);
            while let Some(command) = writer_rx.recv().await {
                match command {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!("Server write failed: {e:#}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_signals = signals.clone();
        let reader_writer_tx = writer_tx.clone();
        let reader = tokio::spawn(async move {
            let mut reader = FrameReader::new(stdout);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        dispatch_frame(frame, &reader_pending, &reader_signals, &reader_writer_tx)
                            .await;
                    }
                    Ok(None) => {
                        tracing::info!("Server closed its output stream");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Server output unreadable: {e:#}");
                        break;
                    }
                }
            }
            // Dropping the senders fails every outstanding request.
            reader_pending.lock().await.clear();
            reader_signals.set_state(ChannelState::Stopped);
        });

        let mut tasks = vec![writer, reader];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(forward_stderr(stderr)));
        }

        let mut connection = Self {
            child,
            writer_tx,
            pending,
            next_id: 1,
            tasks,
        };
        connection
            .initialize(spec)
            .await
            .map_err(|e| ChannelError::Handshake(format!("{e:#}")))?;
        Ok(connection)
    }

    async fn initialize(&mut self, spec: &LaunchSpec) -> anyhow::Result<()> {
        let root_uri = protocol::path_to_file_uri(&spec.working_dir)
            .context("converting working directory to URI")?;
        let params =
            protocol::initialize_params(root_uri.as_str(), spec.initialization_options.as_ref());
        let response = self
            .request("initialize", Some(params), HANDSHAKE_TIMEOUT)
            .await?;
        if let Some(error) = response.get("error") {
            bail!(
                "initialize rejected: {}",
                error["message"].as_str().unwrap_or("unknown error")
            );
        }
        self.notify("initialized", Some(serde_json::json!({})))
            .await
    }

    async fn request(
        &mut self,
        method: &'static str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> anyhow::Result<serde_json::Value> {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = serde_json::to_value(Request::new(id, method, params))
            .context("serializing request")?;
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            bail!("writer closed before {method} was sent");
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                bail!("server went away before answering {method}");
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!("{method} timed out after {}s", timeout.as_secs());
            }
        }
    }

    async fn notify(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> anyhow::Result<()> {
        let frame = serde_json::to_value(Notification::new(method, params))
            .context("serializing notification")?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| anyhow::anyhow!("writer closed before {method} was sent"))
    }

    /// Polite shutdown, then kill if the process lingers.
    async fn shutdown(&mut self) -> Result<(), ChannelError> {
        match self
            .request("shutdown", None, SHUTDOWN_REQUEST_TIMEOUT)
            .await
        {
            Ok(response) if response.get("error").is_none() => {
                let _ = self.notify("exit", None).await;
            }
            Ok(_) => tracing::debug!("Server rejected shutdown request"),
            Err(e) => tracing::debug!("Shutdown request failed: {e:#}"),
        }
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;

        if tokio::time::timeout(EXIT_TIMEOUT, self.child.wait())
            .await
            .is_err()
        {
            tracing::debug!("Server didn't exit in time, killing");
            self.child
                .kill()
                .await
                .map_err(|e| ChannelError::Io(format!("killing server process: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A [`Channel`] that spawns the server described by a [`LaunchSpec`].
pub struct ProcessChannel {
    spec: LaunchSpec,
    signals: ChannelSignals,
    connection: Mutex<Option<Connection>>,
}

impl ProcessChannel {
    #[must_use]
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            signals: ChannelSignals::new(),
            connection: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Channel for ProcessChannel {
    async fn start(&self) -> Result<(), ChannelError> {
        let mut slot = self.connection.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        self.signals.set_state(ChannelState::Starting);
        let connection = match Connection::open(&self.spec, &self.signals).await {
            Ok(connection) => connection,
            Err(e) => {
                self.signals.set_state(ChannelState::Stopped);
                return Err(e);
            }
        };
        if self.signals.state() == ChannelState::Stopped {
            // The reader saw EOF between the handshake and here.
            return Err(ChannelError::Closed);
        }

        *slot = Some(connection);
        self.signals.set_state(ChannelState::Running);
        tracing::info!(program = %self.spec.program.display(), "Server process running");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        let connection = self.connection.lock().await.take();
        let result = match connection {
            Some(mut connection) => connection.shutdown().await,
            None => Ok(()),
        };
        self.signals.set_state(ChannelState::Stopped);
        result
    }

    fn state(&self) -> ChannelState {
        self.signals.state()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        self.signals.subscribe()
    }
}

/// Builds a [`ProcessChannel`] per launch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessChannelFactory;

impl ChannelFactory for ProcessChannelFactory {
    fn create(&self, spec: &LaunchSpec) -> Result<Arc<dyn Channel>, ChannelError> {
        Ok(Arc::new(ProcessChannel::new(spec.clone())))
    }
}
