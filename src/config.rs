//! Server configuration.
//!
//! Every knob comes from an environment variable with a default, read once
//! at startup and carried by value from there. Missing storage credentials
//! disable storage-backed features rather than failing the boot.

use std::path::PathBuf;

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind the HTTP server to.
    pub host: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Sandbox root the reasoning engine runs in.
    pub workspace_dir: PathBuf,
    /// Override for the credential profile directory probed for a local
    /// subscription. Defaults to `~/.claude` when unset.
    pub profile_dir: Option<PathBuf>,
    /// Reasoning-engine CLI command.
    pub engine_command: String,
    /// Hard ceiling on internal reasoning steps per turn.
    pub max_steps: u32,
    /// Storage service endpoint. `None` disables profile/memory lookups.
    pub storage_url: Option<String>,
    /// Storage service key (sent with every storage request).
    pub storage_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workspace_dir: std::env::temp_dir().join("attache"),
            profile_dir: None,
            engine_command: "claude".to_string(),
            max_steps: 25,
            storage_url: None,
            storage_key: None,
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_or("ATTACHE_HOST", defaults.host),
            port: std::env::var("ATTACHE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            workspace_dir: std::env::var("ATTACHE_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_dir),
            profile_dir: std::env::var("ATTACHE_PROFILE_DIR").ok().map(PathBuf::from),
            engine_command: env_or("ATTACHE_ENGINE_COMMAND", defaults.engine_command),
            max_steps: std::env::var("ATTACHE_MAX_STEPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_steps),
            storage_url: non_empty_var("ATTACHE_STORAGE_URL"),
            storage_key: non_empty_var("ATTACHE_STORAGE_KEY"),
        }
    }
}

fn env_or(name: &str, default: String) -> String {
    std::env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
