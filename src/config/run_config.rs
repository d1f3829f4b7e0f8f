//! Run configuration
//!
//! Loads defaults for spawned programs from .ptyx/config.toml

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::pty::TerminalSize;
use crate::session::SpawnOptions;

/// Configuration directory and file names
pub const CONFIG_DIR: &str = ".ptyx";
pub const CONFIG_FILE: &str = "config.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Defaults applied to every spawned program
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Program started by `ptyx shell`
    pub shell: Option<String>,
    /// Terminal columns when no console is attached
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Terminal rows when no console is attached
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Extra environment variables, applied over the inherited ones
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for spawned programs
    pub dir: Option<PathBuf>,
    /// Whether spawned programs inherit our environment
    #[serde(default = "default_inherit_env")]
    pub inherit_env: bool,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

fn default_inherit_env() -> bool {
    true
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            shell: None,
            cols: default_cols(),
            rows: default_rows(),
            env: HashMap::new(),
            dir: None,
            inherit_env: default_inherit_env(),
        }
    }
}

impl RunConfig {
    /// Load configuration from `<base>/.ptyx/config.toml`, or defaults if absent
    pub fn load(base: &Path) -> Result<Self, ConfigError> {
        let config_path = base.join(CONFIG_DIR).join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        Self::load_file(&config_path)
    }

    /// Load configuration from an explicit file, which must exist
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: RunConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Terminal size used when no console geometry is available
    pub fn size(&self) -> TerminalSize {
        TerminalSize::new(self.cols, self.rows).or_default()
    }

    /// The configured shell, then `$SHELL`, then the platform default
    pub fn shell_program(&self) -> String {
        if let Some(shell) = self.shell.as_ref().filter(|s| !s.is_empty()) {
            return shell.clone();
        }
        #[cfg(windows)]
        let (var, fallback) = ("COMSPEC", "cmd.exe");
        #[cfg(not(windows))]
        let (var, fallback) = ("SHELL", "/bin/sh");

        std::env::var(var)
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Environment for the child, `None` meaning "inherit unchanged"
    pub fn environment(&self) -> Option<HashMap<String, String>> {
        if self.inherit_env && self.env.is_empty() {
            return None;
        }
        let mut env: HashMap<String, String> = if self.inherit_env {
            std::env::vars().collect()
        } else {
            HashMap::new()
        };
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        Some(env)
    }

    /// Build spawn options for `program` with this configuration applied
    pub fn spawn_options<I, S>(&self, program: impl Into<String>, args: I) -> SpawnOptions
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut options = SpawnOptions::new(program)
            .with_args(args)
            .with_size(self.size());
        if let Some(env) = self.environment() {
            options = options.with_env(env);
        }
        if let Some(dir) = &self.dir {
            options = options.with_dir(dir);
        }
        options
    }
}
