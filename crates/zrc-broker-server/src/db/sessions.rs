use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use zrc_broker::store::{SessionStore, StoreError};
use zrc_broker::types::{PolicySnapshot, RemoteControlSession, SessionStatus};

use super::store::DbStore;

#[derive(Debug, Clone, FromRow)]
struct SessionRow {
    id: String,
    org_id: String,
    asset_id: String,
    operator_user_id: String,
    operator_name: String,
    status: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    policy_snapshot: String,
}

impl TryFrom<SessionRow> for RemoteControlSession {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<SessionStatus>()
            .map_err(StoreError::DataCorruption)?;
        let policy: serde_json::Value = serde_json::from_str(&row.policy_snapshot)
            .map_err(|e| StoreError::DataCorruption(format!("policy_snapshot: {}", e)))?;

        Ok(RemoteControlSession {
            session_id: row.id,
            org_id: row.org_id,
            asset_id: row.asset_id,
            operator_user_id: row.operator_user_id,
            operator_name: row.operator_name,
            status,
            started_at: row.started_at,
            ended_at: row.ended_at,
            policy_snapshot: PolicySnapshot::new(policy),
        })
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::OperationFailed(e.to_string())
}

/// `SessionStore` on the `remote_control_sessions` table.
///
/// The one-open-session-per-asset rule is enforced by a partial unique index, and status
/// swaps are a single conditional `UPDATE`, so both hold across processes sharing the file.
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: DbStore,
}

impl SqliteSessionStore {
    pub fn new(db: DbStore) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn insert_session(&self, session: RemoteControlSession) -> Result<(), StoreError> {
        let policy = serde_json::to_string(session.policy_snapshot.as_value())
            .map_err(|e| StoreError::OperationFailed(e.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO remote_control_sessions
                (id, org_id, asset_id, operator_user_id, operator_name, status, started_at, ended_at, policy_snapshot)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.session_id)
        .bind(&session.org_id)
        .bind(&session.asset_id)
        .bind(&session.operator_user_id)
        .bind(&session.operator_name)
        .bind(session.status.as_str())
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(policy)
        .execute(self.db.get_pool())
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                StoreError::AlreadyExists(format!("asset {} has an open session", session.asset_id)),
            ),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn load_session(
        &self,
        org_id: &str,
        session_id: &str,
    ) -> Result<Option<RemoteControlSession>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM remote_control_sessions WHERE org_id = ? AND id = ?",
        )
        .bind(org_id)
        .bind(session_id)
        .fetch_optional(self.db.get_pool())
        .await
        .map_err(db_err)?;

        row.map(RemoteControlSession::try_from).transpose()
    }

    async fn find_open_session(
        &self,
        org_id: &str,
        asset_id: &str,
    ) -> Result<Option<RemoteControlSession>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM remote_control_sessions
             WHERE org_id = ? AND asset_id = ? AND status IN ('pending', 'active')
             ORDER BY started_at DESC
             LIMIT 1",
        )
        .bind(org_id)
        .bind(asset_id)
        .fetch_optional(self.db.get_pool())
        .await
        .map_err(db_err)?;

        row.map(RemoteControlSession::try_from).transpose()
    }

    async fn compare_and_set_status(
        &self,
        org_id: &str,
        session_id: &str,
        expected: SessionStatus,
        next: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<RemoteControlSession>, StoreError> {
        let ended_at = (next == SessionStatus::Ended).then_some(at);

        let row = sqlx::query_as::<_, SessionRow>(
            "UPDATE remote_control_sessions
             SET status = ?, ended_at = COALESCE(?, ended_at)
             WHERE org_id = ? AND id = ? AND status = ?
             RETURNING *",
        )
        .bind(next.as_str())
        .bind(ended_at)
        .bind(org_id)
        .bind(session_id)
        .bind(expected.as_str())
        .fetch_optional(self.db.get_pool())
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => match self.load_session(org_id, session_id).await? {
                Some(_) => Ok(None),
                None => Err(StoreError::NotFound(session_id.to_string())),
            },
        }
    }
}
