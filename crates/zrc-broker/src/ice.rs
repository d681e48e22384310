//! ICE server configuration handed to both sides of a session.

use serde::{Deserialize, Serialize};

/// Public STUN server used when nothing else is configured.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// One entry of the `iceServers` list, shaped like the WebRTC `RTCIceServer` dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// TURN relay entry. Only included when all three fields are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Static ICE configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec![DEFAULT_STUN_URL.to_string()],
            turn: None,
        }
    }
}

impl IceConfig {
    /// Render the configuration as the list sent to clients.
    pub fn servers(&self) -> Vec<IceServer> {
        let mut servers: Vec<IceServer> = self
            .stun_urls
            .iter()
            .filter(|url| !url.trim().is_empty())
            .map(|url| IceServer::stun(url.clone()))
            .collect();

        if let Some(turn) = &self.turn {
            servers.push(IceServer {
                urls: vec![turn.url.clone()],
                username: Some(turn.username.clone()),
                credential: Some(turn.credential.clone()),
            });
        }

        servers
    }
}
