//! AI credential and model resolution.
//!
//! A turn can be paid for in one of three ways: a local subscription
//! (credential artifacts under the profile directory), an explicit Anthropic
//! API key, or a Google Gemini key used as the fallback provider. This
//! module resolves those sources into one [`AuthConfig`] per request.
//!
//! The resolver snapshots the credential environment once at construction.
//! Resolved credentials travel to the engine invocation as an explicit map
//! (see [`agent_env`]); nothing here mutates process-wide state, so
//! concurrent turns with different configurations cannot race.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;

/// Primary API key variable.
pub const ANTHROPIC_KEY_VAR: &str = "ANTHROPIC_API_KEY";

/// Accepted aliases for the Google key, in lookup order. The engine SDK
/// stack downstream reads a different one depending on version, so a
/// resolved Gemini config re-exports the key under all of them.
pub const GOOGLE_KEY_ALIASES: [&str; 3] = [
    "GEMINI_API_KEY",
    "GOOGLE_API_KEY",
    "GOOGLE_GENERATIVE_AI_API_KEY",
];

/// Server-wide preferred-model variable (per-request overrides win).
pub const MODEL_VAR: &str = "ATTACHE_MODEL";

/// Fallback model when an Anthropic-mode preference is unusable.
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-5";

/// Fallback model when a Gemini-mode preference is unusable.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

const LEGACY_CREDENTIAL_FILE: &str = ".credentials.json";
const SESSION_ARTIFACT_DIR: &str = "sessions";

/// How the current turn authenticates against its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Local subscription artifacts; the engine authenticates itself.
    Subscription,
    /// Explicit Anthropic API key.
    ApiKey,
    /// Google Gemini key (fallback provider).
    Gemini,
}

/// Resolved credentials and model for one request. Created at request
/// start, read-only afterwards, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub model: String,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
}

/// Explicit provider preference on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderOverride {
    Anthropic,
    Google,
}

/// Per-request resolution overrides.
#[derive(Debug, Clone, Default)]
pub struct AuthOverrides {
    pub provider: Option<ProviderOverride>,
    pub preferred_model: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no AI credential source is configured")]
    Unavailable,
}

/// Display-only projection of a resolved configuration.
#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub display: String,
    pub google_fallback_available: bool,
}

/// Resolves credentials from a captured environment snapshot plus the
/// profile directory on disk.
#[derive(Debug, Clone)]
pub struct AuthResolver {
    vars: HashMap<String, String>,
    profile_dir: PathBuf,
}

impl AuthResolver {
    /// Snapshot the process environment. The profile directory comes from
    /// the config override, else `~/.claude`.
    pub fn from_env(config: &Config) -> Self {
        let vars = std::env::vars().collect();
        let profile_dir = config.profile_dir.clone().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
            PathBuf::from(home).join(".claude")
        });
        Self { vars, profile_dir }
    }

    /// Build a resolver over an explicit variable map. Used by tests and by
    /// anything that needs resolution against a synthetic environment.
    pub fn new(vars: HashMap<String, String>, profile_dir: PathBuf) -> Self {
        Self { vars, profile_dir }
    }

    /// Resolve one [`AuthConfig`] per the priority chain:
    ///
    /// 1. provider override `google`: a Google key is required, mode Gemini;
    /// 2. provider override `anthropic` or no override: explicit Anthropic
    ///    key, else local subscription artifact, else Google key, else fail.
    pub fn resolve(&self, overrides: &AuthOverrides) -> Result<AuthConfig, AuthError> {
        let preferred = overrides
            .preferred_model
            .clone()
            .or_else(|| self.var(MODEL_VAR));
        let preferred = preferred.as_deref();

        if overrides.provider == Some(ProviderOverride::Google) {
            let key = self.google_key().ok_or(AuthError::Unavailable)?;
            return Ok(Self::gemini_config(key, preferred));
        }

        if let Some(key) = self.var(ANTHROPIC_KEY_VAR) {
            return Ok(AuthConfig {
                mode: AuthMode::ApiKey,
                model: normalize_model(preferred, "claude-", DEFAULT_ANTHROPIC_MODEL),
                anthropic_api_key: Some(key),
                google_api_key: None,
            });
        }

        if probe_subscription(&self.profile_dir) {
            return Ok(AuthConfig {
                mode: AuthMode::Subscription,
                model: normalize_model(preferred, "claude-", DEFAULT_ANTHROPIC_MODEL),
                anthropic_api_key: None,
                google_api_key: None,
            });
        }

        if let Some(key) = self.google_key() {
            return Ok(Self::gemini_config(key, preferred));
        }

        Err(AuthError::Unavailable)
    }

    /// Display string plus the "secondary provider available" flag. No
    /// behavioral effect anywhere.
    pub fn status_info(&self, config: &AuthConfig) -> StatusInfo {
        let display = match config.mode {
            AuthMode::Subscription => format!("subscription ({})", config.model),
            AuthMode::ApiKey => format!("Anthropic API key ({})", config.model),
            AuthMode::Gemini => format!("Google Gemini ({})", config.model),
        };
        StatusInfo {
            display,
            google_fallback_available: self.google_key().is_some(),
        }
    }

    fn gemini_config(key: String, preferred: Option<&str>) -> AuthConfig {
        AuthConfig {
            mode: AuthMode::Gemini,
            model: normalize_model(preferred, "gemini-", DEFAULT_GEMINI_MODEL),
            anthropic_api_key: None,
            google_api_key: Some(key),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).filter(|v| !v.trim().is_empty()).cloned()
    }

    fn google_key(&self) -> Option<String> {
        GOOGLE_KEY_ALIASES.iter().find_map(|name| self.var(name))
    }
}

/// The named-variable set the engine invocation needs visible. Pure: same
/// config in, same map out.
///
/// Subscription mode yields nothing (the engine reads its own artifacts);
/// api-key mode yields the one Anthropic variable; gemini mode re-exports
/// the key under every accepted alias.
pub fn agent_env(config: &AuthConfig) -> HashMap<String, String> {
    let mut env = HashMap::new();
    match config.mode {
        AuthMode::Subscription => {}
        AuthMode::ApiKey => {
            if let Some(key) = &config.anthropic_api_key {
                env.insert(ANTHROPIC_KEY_VAR.to_string(), key.clone());
            }
        }
        AuthMode::Gemini => {
            if let Some(key) = &config.google_api_key {
                for name in GOOGLE_KEY_ALIASES {
                    env.insert(name.to_string(), key.clone());
                }
            }
        }
    }
    env
}

/// Normalize a preferred model id against the target mode's family.
///
/// A `vendor/model` id has the vendor prefix stripped only when the stripped
/// id belongs to the mode's family (`claude-*` / `gemini-*`); anything else
/// falls back to the mode default. Bare ids get the same family check.
fn normalize_model(preferred: Option<&str>, family: &str, default: &str) -> String {
    let Some(raw) = preferred.map(str::trim).filter(|s| !s.is_empty()) else {
        return default.to_string();
    };
    let candidate = match raw.split_once('/') {
        Some((_, rest)) => rest,
        None => raw,
    };
    if candidate.starts_with(family) {
        candidate.to_string()
    } else {
        default.to_string()
    }
}

/// Any non-empty recognized credential artifact under the profile directory
/// counts as an active subscription: the legacy credentials file, or at
/// least one entry in the session-artifact directory. Filesystem errors
/// read as "absent".
fn probe_subscription(profile_dir: &Path) -> bool {
    let legacy = profile_dir.join(LEGACY_CREDENTIAL_FILE);
    if std::fs::metadata(&legacy)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
    {
        return true;
    }

    match std::fs::read_dir(profile_dir.join(SESSION_ARTIFACT_DIR)) {
        Ok(entries) => entries.flatten().next().is_some(),
        Err(e) => {
            tracing::debug!(error = %e, "session artifact probe found nothing");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn resolver(vars: &[(&str, &str)], profile_dir: &Path) -> AuthResolver {
        let map = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AuthResolver::new(map, profile_dir.to_path_buf())
    }

    fn empty_profile() -> TempDir {
        TempDir::new().unwrap()
    }

    fn subscribed_profile() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(LEGACY_CREDENTIAL_FILE), b"{\"active\":true}").unwrap();
        dir
    }

    fn overrides(provider: Option<ProviderOverride>) -> AuthOverrides {
        AuthOverrides {
            provider,
            preferred_model: None,
        }
    }

    #[test]
    fn priority_chain_across_all_source_combinations() {
        // (anthropic key, subscription, google key, override) -> expected mode
        let cases: &[(bool, bool, bool, Option<ProviderOverride>, Option<AuthMode>)] = &[
            // Default chain.
            (true, true, true, None, Some(AuthMode::ApiKey)),
            (true, false, false, None, Some(AuthMode::ApiKey)),
            (false, true, true, None, Some(AuthMode::Subscription)),
            (false, true, false, None, Some(AuthMode::Subscription)),
            (false, false, true, None, Some(AuthMode::Gemini)),
            (false, false, false, None, None),
            // Anthropic override follows the same chain.
            (true, true, true, Some(ProviderOverride::Anthropic), Some(AuthMode::ApiKey)),
            (false, true, true, Some(ProviderOverride::Anthropic), Some(AuthMode::Subscription)),
            (false, false, true, Some(ProviderOverride::Anthropic), Some(AuthMode::Gemini)),
            (false, false, false, Some(ProviderOverride::Anthropic), None),
            // Google override requires a Google key, nothing else counts.
            (true, true, true, Some(ProviderOverride::Google), Some(AuthMode::Gemini)),
            (false, false, true, Some(ProviderOverride::Google), Some(AuthMode::Gemini)),
            (true, true, false, Some(ProviderOverride::Google), None),
        ];

        for &(anthropic, subscribed, google, provider, expected) in cases {
            let profile = if subscribed {
                subscribed_profile()
            } else {
                empty_profile()
            };
            let mut vars = Vec::new();
            if anthropic {
                vars.push((ANTHROPIC_KEY_VAR, "sk-ant-test"));
            }
            if google {
                vars.push(("GEMINI_API_KEY", "g-test"));
            }
            let resolver = resolver(&vars, profile.path());
            let result = resolver.resolve(&overrides(provider));
            match expected {
                Some(mode) => {
                    let config = result.unwrap_or_else(|_| {
                        panic!("expected {mode:?} for ({anthropic},{subscribed},{google},{provider:?})")
                    });
                    assert_eq!(config.mode, mode);
                }
                None => assert!(
                    matches!(result, Err(AuthError::Unavailable)),
                    "expected failure for ({anthropic},{subscribed},{google},{provider:?})"
                ),
            }
        }
    }

    #[test]
    fn mode_populates_exactly_its_fields() {
        let profile = subscribed_profile();

        let api = resolver(&[(ANTHROPIC_KEY_VAR, "sk-ant-1")], profile.path())
            .resolve(&overrides(None))
            .unwrap();
        assert_eq!(api.anthropic_api_key.as_deref(), Some("sk-ant-1"));
        assert!(api.google_api_key.is_none());

        let sub = resolver(&[], profile.path()).resolve(&overrides(None)).unwrap();
        assert_eq!(sub.mode, AuthMode::Subscription);
        assert!(sub.anthropic_api_key.is_none());
        assert!(sub.google_api_key.is_none());

        let gemini = resolver(&[("GOOGLE_API_KEY", "g-1")], empty_profile().path())
            .resolve(&overrides(None))
            .unwrap();
        assert_eq!(gemini.mode, AuthMode::Gemini);
        assert_eq!(gemini.google_api_key.as_deref(), Some("g-1"));
        assert!(gemini.anthropic_api_key.is_none());
    }

    #[test]
    fn google_key_resolves_through_any_alias() {
        for alias in GOOGLE_KEY_ALIASES {
            let profile = empty_profile();
            let config = resolver(&[(alias, "g-alias")], profile.path())
                .resolve(&overrides(Some(ProviderOverride::Google)))
                .unwrap();
            assert_eq!(config.google_api_key.as_deref(), Some("g-alias"));
        }
    }

    #[test]
    fn vendor_prefix_stripped_only_into_matching_family() {
        let profile = empty_profile();
        let r = resolver(&[(ANTHROPIC_KEY_VAR, "sk")], profile.path());

        let resolve_model = |preferred: &str| {
            r.resolve(&AuthOverrides {
                provider: None,
                preferred_model: Some(preferred.to_string()),
            })
            .unwrap()
            .model
        };

        assert_eq!(resolve_model("anthropic/claude-opus-4-1"), "claude-opus-4-1");
        assert_eq!(resolve_model("claude-haiku-4-5"), "claude-haiku-4-5");
        // Stripped id from the wrong family falls back to the default.
        assert_eq!(resolve_model("google/gemini-2.5-pro"), DEFAULT_ANTHROPIC_MODEL);
        assert_eq!(resolve_model("openai/gpt-5"), DEFAULT_ANTHROPIC_MODEL);

        let g = resolver(&[("GEMINI_API_KEY", "g")], profile.path());
        let gemini = g
            .resolve(&AuthOverrides {
                provider: Some(ProviderOverride::Google),
                preferred_model: Some("google/gemini-2.5-pro".to_string()),
            })
            .unwrap();
        assert_eq!(gemini.model, "gemini-2.5-pro");

        let fallback = g
            .resolve(&AuthOverrides {
                provider: Some(ProviderOverride::Google),
                preferred_model: Some("anthropic/claude-opus-4-1".to_string()),
            })
            .unwrap();
        assert_eq!(fallback.model, DEFAULT_GEMINI_MODEL);
    }

    #[test]
    fn missing_preference_uses_mode_default() {
        let profile = empty_profile();
        let config = resolver(&[(ANTHROPIC_KEY_VAR, "sk")], profile.path())
            .resolve(&overrides(None))
            .unwrap();
        assert_eq!(config.model, DEFAULT_ANTHROPIC_MODEL);
    }

    #[test]
    fn agent_env_is_pure_and_mode_shaped() {
        let api = AuthConfig {
            mode: AuthMode::ApiKey,
            model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            anthropic_api_key: Some("sk-ant-2".to_string()),
            google_api_key: None,
        };
        let env = agent_env(&api);
        assert_eq!(env.len(), 1);
        assert_eq!(env.get(ANTHROPIC_KEY_VAR).map(String::as_str), Some("sk-ant-2"));
        assert_eq!(env, agent_env(&api));

        let gemini = AuthConfig {
            mode: AuthMode::Gemini,
            model: DEFAULT_GEMINI_MODEL.to_string(),
            anthropic_api_key: None,
            google_api_key: Some("g-2".to_string()),
        };
        let env = agent_env(&gemini);
        assert_eq!(env.len(), GOOGLE_KEY_ALIASES.len());
        for alias in GOOGLE_KEY_ALIASES {
            assert_eq!(env.get(alias).map(String::as_str), Some("g-2"));
        }

        let sub = AuthConfig {
            mode: AuthMode::Subscription,
            model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            anthropic_api_key: None,
            google_api_key: None,
        };
        assert!(agent_env(&sub).is_empty());
    }

    #[test]
    fn subscription_probe_accepts_either_artifact() {
        let legacy = subscribed_profile();
        assert!(probe_subscription(legacy.path()));

        let modern = TempDir::new().unwrap();
        let sessions = modern.path().join(SESSION_ARTIFACT_DIR);
        fs::create_dir_all(&sessions).unwrap();
        fs::write(sessions.join("current.json"), b"{}").unwrap();
        assert!(probe_subscription(modern.path()));

        // Empty artifacts are not evidence.
        let empty_legacy = TempDir::new().unwrap();
        fs::write(empty_legacy.path().join(LEGACY_CREDENTIAL_FILE), b"").unwrap();
        assert!(!probe_subscription(empty_legacy.path()));

        let empty_sessions = TempDir::new().unwrap();
        fs::create_dir_all(empty_sessions.path().join(SESSION_ARTIFACT_DIR)).unwrap();
        assert!(!probe_subscription(empty_sessions.path()));

        // A missing directory is "absent", not an error.
        assert!(!probe_subscription(Path::new("/nonexistent/attache-profile")));
    }

    #[test]
    fn status_info_reports_fallback_availability() {
        let profile = empty_profile();
        let r = resolver(
            &[(ANTHROPIC_KEY_VAR, "sk"), ("GOOGLE_API_KEY", "g")],
            profile.path(),
        );
        let config = r.resolve(&overrides(None)).unwrap();
        let info = r.status_info(&config);
        assert!(info.google_fallback_available);
        assert!(info.display.contains(DEFAULT_ANTHROPIC_MODEL));

        let solo = resolver(&[(ANTHROPIC_KEY_VAR, "sk")], profile.path());
        let config = solo.resolve(&overrides(None)).unwrap();
        assert!(!solo.status_info(&config).google_fallback_available);
    }
}
