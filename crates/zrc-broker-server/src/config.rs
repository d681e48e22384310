use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use zrc_broker::ice::{IceConfig, TurnServer};

use crate::rate_limit::RateLimitConfig;

pub const ENV_PREFIX: &str = "ZRC_BROKER_";
pub const MIN_TOKEN_SECRET_LEN: usize = 32;

/// An operator API key, stored as the SHA-256 hex digest of the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorKeyConfig {
    pub key_sha256: String,
    pub org_id: String,
    pub user_id: String,
    pub user_name: String,
}

/// A statically provisioned agent credential, stored as the SHA-256 hex digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCredentialConfig {
    pub credential_sha256: String,
    pub org_id: String,
    pub asset_id: String,
    pub agent_id: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// SQLite URL. In-memory stores are used when unset.
    pub database_url: Option<String>,

    // Session tokens
    pub token_secret: String,
    pub token_ttl_secs: u64,
    pub token_audience: String,

    // Signalling relay
    pub max_queue_length: usize,
    pub max_signal_bytes: usize,
    pub signal_ttl_secs: u64,
    pub sweep_interval_secs: u64,

    pub ice: IceConfig,
    pub rate_limit: RateLimitConfig,

    pub operator_keys: Vec<OperatorKeyConfig>,
    pub agent_credentials: Vec<AgentCredentialConfig>,

    /// Optional JSON-lines audit file, in addition to the log stream and database.
    pub audit_log_path: Option<PathBuf>,

    // Graceful shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            token_secret: String::new(),
            token_ttl_secs: 15 * 60,
            token_audience: zrc_broker::token::DEFAULT_AUDIENCE.to_string(),
            max_queue_length: 100,
            max_signal_bytes: 64 * 1024, // 64KB
            signal_ttl_secs: 600,        // 10 minutes
            sweep_interval_secs: 300,    // 5 minutes
            ice: IceConfig::default(),
            rate_limit: RateLimitConfig::default(),
            operator_keys: Vec::new(),
            agent_credentials: Vec::new(),
            audit_log_path: None,
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `ZRC_BROKER_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Self::default();

        if let Some(addr) = var("BIND_ADDR") {
            config.bind_addr = addr.parse()?;
        }
        if let Some(url) = var("DATABASE_URL") {
            config.database_url = Some(url).filter(|u| !u.is_empty());
        }

        if let Some(secret) = var("TOKEN_SECRET") {
            config.token_secret = secret;
        }
        if let Some(ttl) = var("TOKEN_TTL_SECS") {
            config.token_ttl_secs = ttl.parse()?;
        }
        if let Some(aud) = var("TOKEN_AUDIENCE") {
            config.token_audience = aud;
        }

        if let Some(len) = var("MAX_QUEUE_LENGTH") {
            config.max_queue_length = len.parse()?;
        }
        if let Some(size) = var("MAX_SIGNAL_BYTES") {
            config.max_signal_bytes = size.parse()?;
        }
        if let Some(ttl) = var("SIGNAL_TTL_SECS") {
            config.signal_ttl_secs = ttl.parse()?;
        }
        if let Some(interval) = var("SWEEP_INTERVAL_SECS") {
            config.sweep_interval_secs = interval.parse()?;
        }

        if let Some(urls) = var("STUN_URLS") {
            config.ice.stun_urls = split_list(&urls);
        }
        if let (Some(url), Some(username), Some(credential)) =
            (var("TURN_URL"), var("TURN_USERNAME"), var("TURN_CREDENTIAL"))
        {
            config.ice.turn = Some(TurnServer {
                url,
                username,
                credential,
            });
        }

        if let Some(limit) = var("RATE_LIMIT_AGENT_POLL") {
            config.rate_limit.agent_poll_limit = limit.parse()?;
        }
        if let Some(limit) = var("RATE_LIMIT_SIGNAL") {
            config.rate_limit.signal_limit = limit.parse()?;
        }
        if let Some(limit) = var("RATE_LIMIT_OPERATOR") {
            config.rate_limit.operator_limit = limit.parse()?;
        }

        // digest:org_id:user_id:user_name, comma separated
        if let Some(keys) = var("OPERATOR_KEYS") {
            config.operator_keys = split_list(&keys)
                .iter()
                .map(|entry| parse_operator_key(entry))
                .collect::<anyhow::Result<_>>()?;
        }
        // digest:org_id:asset_id:agent_id, comma separated
        if let Some(creds) = var("AGENT_CREDENTIALS") {
            config.agent_credentials = split_list(&creds)
                .iter()
                .map(|entry| parse_agent_credential(entry))
                .collect::<anyhow::Result<_>>()?;
        }

        if let Some(path) = var("AUDIT_LOG") {
            config.audit_log_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = var("SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout_secs = secs.parse()?;
        }

        Ok(config)
    }

    pub fn from_toml(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ServerConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.token_secret.len() < MIN_TOKEN_SECRET_LEN {
            anyhow::bail!(
                "token_secret must be at least {} bytes",
                MIN_TOKEN_SECRET_LEN
            );
        }

        if !(60..=86_400).contains(&self.token_ttl_secs) {
            anyhow::bail!("token_ttl_secs must be between 60 and 86400");
        }

        if self.max_queue_length == 0 {
            anyhow::bail!("max_queue_length must be > 0");
        }

        if self.max_signal_bytes == 0 {
            anyhow::bail!("max_signal_bytes must be > 0");
        }

        if !(1..=86_400).contains(&self.signal_ttl_secs) {
            anyhow::bail!("signal_ttl_secs must be between 1 and 86400");
        }

        if self.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be > 0");
        }

        self.rate_limit.validate()?;

        for key in &self.operator_keys {
            if !is_sha256_hex(&key.key_sha256) {
                anyhow::bail!("operator key for {} is not a SHA-256 hex digest", key.user_id);
            }
        }
        for cred in &self.agent_credentials {
            if !is_sha256_hex(&cred.credential_sha256) {
                anyhow::bail!("agent credential for {} is not a SHA-256 hex digest", cred.agent_id);
            }
        }

        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn signal_ttl(&self) -> Duration {
        Duration::from_secs(self.signal_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_operator_key(entry: &str) -> anyhow::Result<OperatorKeyConfig> {
    let parts: Vec<&str> = entry.splitn(4, ':').collect();
    match parts.as_slice() {
        [digest, org, user, name] => Ok(OperatorKeyConfig {
            key_sha256: digest.to_ascii_lowercase(),
            org_id: org.to_string(),
            user_id: user.to_string(),
            user_name: name.to_string(),
        }),
        _ => anyhow::bail!("operator key entry must be digest:org_id:user_id:user_name"),
    }
}

fn parse_agent_credential(entry: &str) -> anyhow::Result<AgentCredentialConfig> {
    let parts: Vec<&str> = entry.splitn(4, ':').collect();
    match parts.as_slice() {
        [digest, org, asset, agent] => Ok(AgentCredentialConfig {
            credential_sha256: digest.to_ascii_lowercase(),
            org_id: org.to_string(),
            asset_id: asset.to_string(),
            agent_id: agent.to_string(),
            is_active: true,
        }),
        _ => anyhow::bail!("agent credential entry must be digest:org_id:asset_id:agent_id"),
    }
}

fn is_sha256_hex(value: &str) -> bool {
    hex::decode(value).map(|bytes| bytes.len() == 32).unwrap_or(false)
}
