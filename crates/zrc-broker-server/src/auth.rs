use std::{collections::HashMap, sync::Arc};

use zrc_broker::credential::hash_credential;

use crate::config::OperatorKeyConfig;

/// Who an operator API key belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorIdentity {
    pub org_id: String,
    pub user_id: String,
    pub user_name: String,
}

/// Operator API keys, indexed by SHA-256 digest.
#[derive(Debug, Clone, Default)]
pub struct OperatorKeys {
    keys: Arc<HashMap<String, OperatorIdentity>>,
}

impl OperatorKeys {
    pub fn from_config(entries: &[OperatorKeyConfig]) -> Self {
        let keys = entries
            .iter()
            .map(|entry| {
                (
                    entry.key_sha256.to_ascii_lowercase(),
                    OperatorIdentity {
                        org_id: entry.org_id.clone(),
                        user_id: entry.user_id.clone(),
                        user_name: entry.user_name.clone(),
                    },
                )
            })
            .collect();
        Self {
            keys: Arc::new(keys),
        }
    }

    pub fn authenticate(&self, key: &str) -> Option<OperatorIdentity> {
        if key.is_empty() {
            return None;
        }
        self.keys.get(&hash_credential(key)).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

pub fn extract_bearer_token(header: Option<&axum::http::HeaderValue>) -> Option<&str> {
    let header = header?;
    let header_str = header.to_str().ok()?;
    header_str
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
