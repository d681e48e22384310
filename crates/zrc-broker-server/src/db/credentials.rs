use async_trait::async_trait;
use sqlx::FromRow;

use zrc_broker::credential::{
    hash_credential, AgentBinding, CredentialCheck, CredentialError, CredentialVerifier,
};

use super::store::DbStore;

#[derive(Debug, Clone, FromRow)]
struct CredentialRow {
    org_id: String,
    asset_id: String,
    agent_id: String,
    is_active: bool,
}

/// Agent credentials from the `agent_credentials` table.
#[derive(Clone)]
pub struct SqliteCredentialVerifier {
    db: DbStore,
}

impl SqliteCredentialVerifier {
    pub fn new(db: DbStore) -> Self {
        Self { db }
    }

    /// Insert or replace a credential by digest.
    pub async fn upsert_digest(&self, digest: &str, binding: &AgentBinding) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO agent_credentials (credential_sha256, org_id, asset_id, agent_id, is_active)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(credential_sha256) DO UPDATE SET
                org_id = excluded.org_id,
                asset_id = excluded.asset_id,
                agent_id = excluded.agent_id,
                is_active = excluded.is_active",
        )
        .bind(digest.to_ascii_lowercase())
        .bind(&binding.org_id)
        .bind(&binding.asset_id)
        .bind(&binding.agent_id)
        .bind(binding.is_active)
        .execute(self.db.get_pool())
        .await?;
        Ok(())
    }

    pub async fn set_active(&self, digest: &str, active: bool) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE agent_credentials SET is_active = ? WHERE credential_sha256 = ?")
            .bind(active)
            .bind(digest.to_ascii_lowercase())
            .execute(self.db.get_pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CredentialVerifier for SqliteCredentialVerifier {
    async fn verify(&self, credential: &str) -> Result<CredentialCheck, CredentialError> {
        if credential.is_empty() {
            return Ok(CredentialCheck::invalid());
        }

        let row = sqlx::query_as::<_, CredentialRow>(
            "SELECT org_id, asset_id, agent_id, is_active FROM agent_credentials WHERE credential_sha256 = ?",
        )
        .bind(hash_credential(credential))
        .fetch_optional(self.db.get_pool())
        .await
        .map_err(|e| CredentialError::Backend(e.to_string()))?;

        Ok(match row {
            Some(row) => CredentialCheck::valid(AgentBinding {
                org_id: row.org_id,
                asset_id: row.asset_id,
                agent_id: row.agent_id,
                is_active: row.is_active,
            }),
            None => CredentialCheck::invalid(),
        })
    }
}
