//! Session configuration
//!
//! ICE servers come from the environment the same way deployments configure
//! them:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `CALLSESSION_STUN_SERVERS` | comma separated STUN urls, replaces the defaults |
//! | `CALLSESSION_TURN_SERVER` | TURN url, added when set |
//! | `CALLSESSION_TURN_USERNAME` | TURN username |
//! | `CALLSESSION_TURN_CREDENTIAL` | TURN credential |

use crate::call::CallManagerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Environment variable overriding the STUN servers
pub const ENV_STUN_SERVERS: &str = "CALLSESSION_STUN_SERVERS";
/// Environment variable holding the TURN url
pub const ENV_TURN_SERVER: &str = "CALLSESSION_TURN_SERVER";
/// Environment variable holding the TURN username
pub const ENV_TURN_USERNAME: &str = "CALLSESSION_TURN_USERNAME";
/// Environment variable holding the TURN credential
pub const ENV_TURN_CREDENTIAL: &str = "CALLSESSION_TURN_CREDENTIAL";

const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid JSON for [`SessionConfig`]
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One STUN or TURN server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server urls
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// STUN server without credentials
    #[must_use]
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Negotiation primitive configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// STUN/TURN servers handed to every peer connection
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServerConfig::stun(*url))
                .collect(),
        }
    }
}

impl PeerConfig {
    /// Build from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(stun) = lookup(ENV_STUN_SERVERS) {
            let servers: Vec<IceServerConfig> = stun
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServerConfig::stun)
                .collect();
            if servers.is_empty() {
                tracing::warn!("{} is set but empty, keeping default STUN servers", ENV_STUN_SERVERS);
            } else {
                config.ice_servers = servers;
            }
        }

        if let Some(turn) = lookup(ENV_TURN_SERVER).filter(|url| !url.trim().is_empty()) {
            config.ice_servers.push(IceServerConfig {
                urls: vec![turn.trim().to_string()],
                username: lookup(ENV_TURN_USERNAME),
                credential: lookup(ENV_TURN_CREDENTIAL),
            });
        }

        config
    }
}

/// Complete configuration of a [`CallManager`](crate::call::CallManager)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Registry limits
    #[serde(default)]
    pub call: CallManagerConfig,
    /// Negotiation primitive settings
    #[serde(default)]
    pub peer: PeerConfig,
}

impl SessionConfig {
    /// Parse from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the JSON does not describe a `SessionConfig`
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_uses_public_stun() {
        let config = PeerConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].urls, vec!["stun:stun1.l.google.com:19302"]);
    }

    #[test]
    fn test_env_overrides_stun_and_adds_turn() {
        let config = PeerConfig::from_lookup(lookup(&[
            (ENV_STUN_SERVERS, "stun:a.example:3478, stun:b.example:3478"),
            (ENV_TURN_SERVER, "turn:relay.example:3478"),
            (ENV_TURN_USERNAME, "alice"),
            (ENV_TURN_CREDENTIAL, "pw"),
        ]));

        assert_eq!(
            config.ice_servers,
            vec![
                IceServerConfig::stun("stun:a.example:3478"),
                IceServerConfig::stun("stun:b.example:3478"),
                IceServerConfig {
                    urls: vec!["turn:relay.example:3478".to_string()],
                    username: Some("alice".to_string()),
                    credential: Some("pw".to_string()),
                },
            ]
        );
    }

    #[test]
    fn test_empty_env_keeps_defaults() {
        let config = PeerConfig::from_lookup(lookup(&[
            (ENV_STUN_SERVERS, " , "),
            (ENV_TURN_SERVER, ""),
        ]));
        assert_eq!(config, PeerConfig::default());
    }

    #[test]
    fn test_session_config_partial_json() {
        let config = SessionConfig::from_json_str(r#"{"call":{"max_concurrent_calls":3}}"#).unwrap();
        assert_eq!(config.call.max_concurrent_calls, 3);
        assert_eq!(config.peer, PeerConfig::default());
    }

    #[test]
    fn test_session_config_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("callsession.json");
        std::fs::write(
            &path,
            r#"{"peer":{"ice_servers":[{"urls":["stun:stun.example.org:3478"]}]}}"#,
        )
        .unwrap();

        let config = SessionConfig::load(&path).unwrap();
        assert_eq!(config.call, CallManagerConfig::default());
        assert_eq!(
            config.peer.ice_servers,
            vec![IceServerConfig::stun("stun:stun.example.org:3478")]
        );
        assert!(matches!(
            SessionConfig::load(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_session_config_rejects_garbage() {
        assert!(matches!(
            SessionConfig::from_json_str("not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
