//! Launch resolution: turning a [`ServerConfig`] into something we can spawn.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::types::ServerConfig;

/// Everything needed to construct a channel to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Extra variables layered over the inherited (filtered) environment.
    pub env: BTreeMap<String, String>,
    /// Method name of the structured status notification.
    pub status_notification: String,
    pub initialization_options: Option<serde_json::Value>,
}

/// Why the server process cannot be started at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("runtime '{runtime}' not found in PATH")]
    MissingRuntime { runtime: String },
    #[error("server artifact not found: {}", path.display())]
    MissingArtifact { path: PathBuf },
    #[error("server command '{command}' not found")]
    CommandNotFound { command: String },
    #[error("working directory is not a directory: {}", path.display())]
    InvalidWorkingDir { path: PathBuf },
}

#[async_trait]
pub trait LaunchSpecResolver: Send + Sync {
    async fn resolve(&self, config: &ServerConfig) -> Result<LaunchSpec, LaunchError>;
}

/// Resolves commands against `PATH` and the filesystem.
///
/// With a `runtime` configured, `command` is treated as an artifact that the
/// runtime executes (`java -jar server.jar ...`).
#[derive(Debug, Clone)]
pub struct CommandResolver {
    workspace_root: PathBuf,
    search_path: Option<OsString>,
}

impl CommandResolver {
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            search_path: std::env::var_os("PATH"),
        }
    }

    /// Override the `PATH` used for lookups.
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    fn working_dir(&self, config: &ServerConfig) -> Result<PathBuf, LaunchError> {
        let dir = match config.working_dir() {
            Some(dir) if dir.is_absolute() => dir.to_path_buf(),
            Some(dir) => self.workspace_root.join(dir),
            None => self.workspace_root.clone(),
        };
        if !dir.is_dir() {
            return Err(LaunchError::InvalidWorkingDir { path: dir });
        }
        Ok(dir)
    }

    fn which(&self, name: &str, cwd: &Path) -> Option<PathBuf> {
        which::which_in(name, self.search_path.clone(), cwd).ok()
    }

    pub fn resolve_sync(&self, config: &ServerConfig) -> Result<LaunchSpec, LaunchError> {
        let working_dir = self.working_dir(config)?;

        let (program, args) = match config.runtime() {
            Some(runtime) => {
                let program =
                    self.which(runtime, &working_dir)
                        .ok_or_else(|| LaunchError::MissingRuntime {
                            runtime: runtime.to_string(),
                        })?;
                let artifact = working_dir.join(config.command());
                if !artifact.is_file() {
                    return Err(LaunchError::MissingArtifact { path: artifact });
                }
                let mut args = config.runtime_args().to_vec();
                args.push(artifact.display().to_string());
                args.extend(config.args().iter().cloned());
                (program, args)
            }
            None => {
                let program = self.which(config.command(), &working_dir).ok_or_else(|| {
                    LaunchError::CommandNotFound {
                        command: config.command().to_string(),
                    }
                })?;
                (program, config.args().to_vec())
            }
        };

        tracing::debug!(
            program = %program.display(),
            cwd = %working_dir.display(),
            "Resolved server launch spec"
        );

        Ok(LaunchSpec {
            program,
            args,
            working_dir,
            env: config.env().clone(),
            status_notification: config.status_notification().to_string(),
            initialization_options: config.initialization_options().cloned(),
        })
    }
}

#[async_trait]
impl LaunchSpecResolver for CommandResolver {
    async fn resolve(&self, config: &ServerConfig) -> Result<LaunchSpec, LaunchError> {
        self.resolve_sync(config)
    }
}
