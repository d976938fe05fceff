//! Public types shared between the controller, the aggregator and observers.
//!
//! [`ServerConfig`] is what the embedding application hands us; the rest
//! describe what the server is doing: [`ServerState`], the last structured
//! [`StatusSnapshot`], and the [`StatusUpdate`] tuple published to observers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default method name of the structured status notification.
pub const DEFAULT_STATUS_NOTIFICATION: &str = "tether/status";

fn default_status_notification() -> String {
    DEFAULT_STATUS_NOTIFICATION.to_string()
}

/// How to launch the analysis server.
///
/// Fields are private; the deserializer and the builder methods are the only
/// construction paths.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    /// Executable name, path, or artifact (when `runtime` is set).
    command: String,
    #[serde(default)]
    args: Vec<String>,
    /// Runtime used to launch `command` as an artifact (e.g. "java").
    #[serde(default)]
    runtime: Option<String>,
    /// Arguments placed before the artifact path (e.g. `["-jar"]`).
    #[serde(default)]
    runtime_args: Vec<String>,
    /// Relative paths are resolved against the workspace root.
    #[serde(default)]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default = "default_status_notification")]
    status_notification: String,
    /// Passed verbatim as `initializationOptions`.
    #[serde(default)]
    initialization_options: Option<serde_json::Value>,
}

impl ServerConfig {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            runtime: None,
            runtime_args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            status_notification: default_status_notification(),
            initialization_options: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_runtime<I, S>(mut self, runtime: impl Into<String>, runtime_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runtime = Some(runtime.into());
        self.runtime_args = runtime_args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_status_notification(mut self, method: impl Into<String>) -> Self {
        self.status_notification = method.into();
        self
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn runtime(&self) -> Option<&str> {
        self.runtime.as_deref()
    }

    #[must_use]
    pub fn runtime_args(&self) -> &[String] {
        &self.runtime_args
    }

    #[must_use]
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    #[must_use]
    pub fn status_notification(&self) -> &str {
        &self.status_notification
    }

    #[must_use]
    pub fn initialization_options(&self) -> Option<&serde_json::Value> {
        self.initialization_options.as_ref()
    }

    /// Apply `f` to every free-form string (args and env values).
    ///
    /// Used by the config layer for `${VAR}` expansion.
    pub fn map_strings(mut self, f: impl Fn(&str) -> String) -> Self {
        for arg in self.args.iter_mut().chain(self.runtime_args.iter_mut()) {
            *arg = f(arg);
        }
        for value in self.env.values_mut() {
            *value = f(value);
        }
        self
    }
}

/// What the server is doing right now, as derived by the status aggregator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    ResolvingDeps,
    Indexing,
    Ready,
    /// Reduced functionality that may recover on its own.
    Degraded,
    /// Fatal condition that needs user action.
    Error,
}

impl ServerState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::ResolvingDeps => "resolving dependencies",
            Self::Indexing => "indexing",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Error => "error",
        }
    }

    /// Whether the server is doing background work the user is waiting on.
    #[must_use]
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Starting | Self::ResolvingDeps | Self::Indexing)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Server-reported health in a structured status notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    #[default]
    Ok,
    Warning,
    Error,
}

/// Structured details attached to a server-reported error.
///
/// Servers disagree on the shape of this payload, so it is read best-effort:
/// any JSON value deserializes, and fields of an unexpected type are coerced
/// to text rather than rejected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorDetails {
    pub message: Option<String>,
    pub cause: Option<String>,
    pub suggestions: Vec<String>,
    /// Fields we don't model, kept for display.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn lenient_text(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

impl From<serde_json::Value> for ErrorDetails {
    fn from(value: serde_json::Value) -> Self {
        let mut fields = match value {
            serde_json::Value::Object(fields) => fields,
            other => {
                return Self {
                    message: lenient_text(other),
                    ..Self::default()
                };
            }
        };
        let suggestions = match fields.remove("suggestions") {
            Some(serde_json::Value::Array(items)) => {
                items.into_iter().filter_map(lenient_text).collect()
            }
            Some(other) => lenient_text(other).into_iter().collect(),
            None => Vec::new(),
        };
        Self {
            message: fields.remove("message").and_then(lenient_text),
            cause: fields.remove("cause").and_then(lenient_text),
            suggestions,
            extra: fields,
        }
    }
}

impl<'de> Deserialize<'de> for ErrorDetails {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from)
    }
}

/// The most recent structured status received from the server.
///
/// Wire format is the camelCase params object of the status notification.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    #[serde(default)]
    pub health: Health,
    /// No background work outstanding.
    #[serde(default)]
    pub quiescent: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub files_indexed: Option<u64>,
    #[serde(default)]
    pub files_total: Option<u64>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_details: Option<ErrorDetails>,
}

impl StatusSnapshot {
    /// File counts, present once the server has reported a total.
    #[must_use]
    pub fn file_progress(&self) -> Option<FileProgress> {
        self.files_total.map(|total| FileProgress {
            indexed: self.files_indexed.unwrap_or(0),
            total,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileProgress {
    pub indexed: u64,
    pub total: u64,
}

/// The raw error pair handed to observers when the state enters
/// [`ServerState::Error`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerErrorInfo {
    pub code: Option<String>,
    pub details: Option<ErrorDetails>,
}

impl ServerErrorInfo {
    /// Lines suitable for an actionable notification.
    ///
    /// Server-provided suggestions win; otherwise fall back to the message
    /// and cause so the user has something to act on.
    #[must_use]
    pub fn remediation(&self) -> Vec<String> {
        let Some(details) = &self.details else {
            return vec![String::from("Check the server log, then restart the server.")];
        };
        if !details.suggestions.is_empty() {
            return details.suggestions.clone();
        }
        let mut lines = Vec::new();
        if let Some(message) = &details.message {
            lines.push(message.clone());
        }
        if let Some(cause) = &details.cause {
            lines.push(format!("Cause: {cause}"));
        }
        lines.push(String::from("Restart the server once the problem is fixed."));
        lines
    }
}

impl fmt::Display for ServerErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code.as_deref().unwrap_or("unknown");
        match self.details.as_ref().and_then(|d| d.message.as_deref()) {
            Some(message) => write!(f, "[{code}] {message}"),
            None => write!(f, "[{code}] server reported an error"),
        }
    }
}

/// What observers receive after every status mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub state: ServerState,
    pub message: Option<String>,
    pub file_progress: Option<FileProgress>,
    /// Present only while `state` is [`ServerState::Error`].
    pub error: Option<ServerErrorInfo>,
}

impl StatusUpdate {
    /// Compact one-line rendering, e.g. `indexing (10/200): Indexing sources`.
    #[must_use]
    pub fn status_line(&self) -> String {
        let mut line = self.state.label().to_string();
        if self.state == ServerState::Indexing
            && let Some(progress) = self.file_progress
        {
            line.push_str(&format!(" ({}/{})", progress.indexed, progress.total));
        }
        if let Some(message) = &self.message {
            line.push_str(": ");
            line.push_str(message);
        }
        line
    }
}
