//! Configuration for the `tether` binary, read from `~/.tether/config.toml`.
//!
//! ```toml
//! [server]
//! command = "analysis-server.jar"
//! runtime = "java"
//! runtime_args = ["-Xmx2g", "-jar"]
//! args = ["--stdio"]
//! env = { ANALYSIS_HOME = "${HOME}/.analysis" }
//!
//! [workspace]
//! root = "~/src/project"
//! ```

use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tether_session::ServerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkspaceConfig {
    /// Leading `~` and `${VAR}` references are expanded.
    pub root: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TetherConfig {
    pub server: Option<ServerConfig>,
    pub workspace: Option<WorkspaceConfig>,
}

impl TetherConfig {
    /// Load from [`config_path`]. A missing file is `Ok(None)`.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}", path.display());
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {}: {source}", path.display());
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;

        toml::from_str(&content).map(Some).map_err(|source| {
            tracing::warn!("Failed to parse config at {}: {source}", path.display());
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    /// Server settings with `${VAR}` references in args and env expanded.
    #[must_use]
    pub fn server_config(&self) -> Option<ServerConfig> {
        self.server
            .clone()
            .map(|server| server.map_strings(expand_env_vars))
    }

    #[must_use]
    pub fn workspace_root(&self) -> Option<PathBuf> {
        let root = self.workspace.as_ref()?.root.as_deref()?;
        Some(expand_home(&expand_env_vars(root)))
    }
}

/// Replace `${VAR}` with the variable's value; unset variables become empty.
/// An unterminated `${` is kept literally.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tether").join("config.toml"))
}
