//! Per-turn tool-server registry.
//!
//! Each connected integration maps to one tool-server subprocess. The
//! launch specs are rebuilt from scratch at the start of every turn and
//! consumed by the engine invocation; nothing here outlives the turn.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::config::Config;

/// The tool server every turn gets regardless of connectors.
pub const MEMORY_SERVER: &str = "memory";

/// Base environment variable names shared by every tool server.
pub const USER_ID_VAR: &str = "ATTACHE_USER_ID";
pub const STORAGE_URL_VAR: &str = "ATTACHE_STORAGE_URL";
pub const STORAGE_KEY_VAR: &str = "ATTACHE_STORAGE_KEY";

/// Connector ids we know how to launch, with the credential variables each
/// one needs passed through from the server environment.
const CONNECTOR_ENV: &[(&str, &[&str])] = &[
    ("gmail", &["GOOGLE_OAUTH_CLIENT_ID", "GOOGLE_OAUTH_CLIENT_SECRET"]),
    ("gcal", &["GOOGLE_OAUTH_CLIENT_ID", "GOOGLE_OAUTH_CLIENT_SECRET"]),
    ("github", &["GITHUB_TOKEN"]),
];

/// Launch spec for one tool-server subprocess. Ephemeral: built for a
/// single turn, never reused.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToolServerSpec {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Builds the per-turn `name -> spec` map from a user's connected
/// integrations.
#[derive(Debug, Clone)]
pub struct Registry {
    bin_dir: PathBuf,
    base_env: BTreeMap<String, String>,
    passthrough: BTreeMap<String, String>,
}

impl Registry {
    /// Capture the launch template inputs: the directory holding the
    /// sibling `<name>-mcp` binaries, the storage endpoint from config, and
    /// a snapshot of the connector credential variables.
    pub fn from_env(config: &Config) -> Self {
        let bin_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        let mut base_env = BTreeMap::new();
        if let Some(url) = &config.storage_url {
            base_env.insert(STORAGE_URL_VAR.to_string(), url.clone());
        }
        if let Some(key) = &config.storage_key {
            base_env.insert(STORAGE_KEY_VAR.to_string(), key.clone());
        }

        let wanted: std::collections::BTreeSet<&str> = CONNECTOR_ENV
            .iter()
            .flat_map(|(_, vars)| vars.iter().copied())
            .collect();
        let passthrough = std::env::vars()
            .filter(|(name, value)| wanted.contains(name.as_str()) && !value.is_empty())
            .collect();

        Self {
            bin_dir,
            base_env,
            passthrough,
        }
    }

    /// Explicit constructor for tests and embedding.
    pub fn new(
        bin_dir: PathBuf,
        base_env: BTreeMap<String, String>,
        passthrough: BTreeMap<String, String>,
    ) -> Self {
        Self {
            bin_dir,
            base_env,
            passthrough,
        }
    }

    /// Build the tool-server map for one turn.
    ///
    /// Always contains a `memory` entry. Recognized connector ids add one
    /// entry each; unrecognized ids are skipped without error; duplicates
    /// collapse by map semantics.
    pub fn build(&self, connectors: &[String], user_id: &str) -> BTreeMap<String, ToolServerSpec> {
        let mut servers = BTreeMap::new();
        servers.insert(
            MEMORY_SERVER.to_string(),
            self.spec(MEMORY_SERVER, user_id, &[]),
        );

        for connector in connectors {
            let Some((name, vars)) = CONNECTOR_ENV
                .iter()
                .find(|(name, _)| name == connector)
            else {
                tracing::debug!(%connector, "skipping unrecognized connector");
                continue;
            };
            servers.insert(name.to_string(), self.spec(name, user_id, vars));
        }

        servers
    }

    fn spec(&self, name: &str, user_id: &str, overlay_vars: &[&str]) -> ToolServerSpec {
        let mut env = self.base_env.clone();
        env.insert(USER_ID_VAR.to_string(), user_id.to_string());
        for var in overlay_vars {
            if let Some(value) = self.passthrough.get(*var) {
                env.insert((*var).to_string(), value.clone());
            }
        }
        ToolServerSpec {
            name: name.to_string(),
            command: self.bin_dir.join(format!("{name}-mcp")),
            args: Vec::new(),
            env,
        }
    }
}
