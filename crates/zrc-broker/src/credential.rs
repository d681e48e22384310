//! Agent credential verification.
//!
//! Agents authenticate with a long-lived bearer credential. The broker only ever sees the
//! verifier's answer: whether the credential is valid and which `{org, asset, agent}` it is
//! bound to. Client-supplied identifiers are never consulted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, Clone)]
pub enum CredentialError {
    #[error("credential backend unavailable: {0}")]
    Backend(String),
}

/// Identity a credential is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentBinding {
    pub org_id: String,
    pub asset_id: String,
    pub agent_id: String,
    pub is_active: bool,
}

/// Result of a credential lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialCheck {
    pub valid: bool,
    pub binding: Option<AgentBinding>,
}

impl CredentialCheck {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            binding: None,
        }
    }

    pub fn valid(binding: AgentBinding) -> Self {
        Self {
            valid: true,
            binding: Some(binding),
        }
    }
}

/// Checks agent bearer credentials.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Look up a credential.
    ///
    /// Unknown credentials are `Ok(CredentialCheck::invalid())`, not an error. `Err` is
    /// reserved for backend failures.
    async fn verify(&self, credential: &str) -> Result<CredentialCheck, CredentialError>;
}

/// Hex-encoded SHA-256 digest of a credential, the form credentials are stored in.
pub fn hash_credential(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

/// In-memory verifier keyed by credential digest.
#[derive(Default, Clone)]
pub struct StaticCredentialVerifier {
    bindings: Arc<RwLock<HashMap<String, AgentBinding>>>,
}

impl StaticCredentialVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plaintext credential.
    pub async fn insert(&self, credential: &str, binding: AgentBinding) {
        self.insert_digest(hash_credential(credential), binding).await;
    }

    /// Register a credential by its SHA-256 hex digest.
    pub async fn insert_digest(&self, digest: impl Into<String>, binding: AgentBinding) {
        let digest = digest.into().to_ascii_lowercase();
        self.bindings.write().await.insert(digest, binding);
    }

    pub async fn set_active(&self, credential: &str, active: bool) -> bool {
        let mut bindings = self.bindings.write().await;
        match bindings.get_mut(&hash_credential(credential)) {
            Some(binding) => {
                binding.is_active = active;
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.bindings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.read().await.is_empty()
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentialVerifier {
    async fn verify(&self, credential: &str) -> Result<CredentialCheck, CredentialError> {
        if credential.is_empty() {
            return Ok(CredentialCheck::invalid());
        }
        let bindings = self.bindings.read().await;
        Ok(match bindings.get(&hash_credential(credential)) {
            Some(binding) => CredentialCheck::valid(binding.clone()),
            None => CredentialCheck::invalid(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(active: bool) -> AgentBinding {
        AgentBinding {
            org_id: "org-1".into(),
            asset_id: "A123".into(),
            agent_id: "agent-7".into(),
            is_active: active,
        }
    }

    #[test]
    fn test_hash_is_sha256_hex() {
        assert_eq!(
            hash_credential("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_static_verifier_lookup() {
        let verifier = StaticCredentialVerifier::new();
        verifier.insert("secret-credential", binding(true)).await;

        let check = verifier.verify("secret-credential").await.unwrap();
        assert!(check.valid);
        assert_eq!(check.binding.unwrap().asset_id, "A123");

        assert!(!verifier.verify("other").await.unwrap().valid);
        assert!(!verifier.verify("").await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_digest_registration_and_deactivation() {
        let verifier = StaticCredentialVerifier::new();
        verifier
            .insert_digest(hash_credential("cred").to_uppercase(), binding(true))
            .await;
        assert!(verifier.verify("cred").await.unwrap().valid);

        assert!(verifier.set_active("cred", false).await);
        let check = verifier.verify("cred").await.unwrap();
        assert!(check.valid);
        assert!(!check.binding.unwrap().is_active);
        assert!(!verifier.set_active("missing", false).await);
    }
}
