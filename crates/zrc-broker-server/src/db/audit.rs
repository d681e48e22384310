use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use zrc_broker::audit::{AuditError, AuditEvent, AuditSink};

use super::store::DbStore;

#[derive(Debug, Clone, FromRow)]
pub struct AuditRecord {
    pub id: String,
    pub event_type: String,
    pub org_id: Option<String>,
    pub session_id: Option<String>,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

/// Persists audit events into `audit_events`.
#[derive(Clone)]
pub struct SqliteAuditSink {
    db: DbStore,
}

impl SqliteAuditSink {
    pub fn new(db: DbStore) -> Self {
        Self { db }
    }

    pub async fn events_for_session(&self, session_id: &str) -> anyhow::Result<Vec<AuditRecord>> {
        let records = sqlx::query_as::<_, AuditRecord>(
            "SELECT * FROM audit_events WHERE session_id = ? ORDER BY created_at ASC",
        )
        .bind(session_id)
        .fetch_all(self.db.get_pool())
        .await?;
        Ok(records)
    }
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        let details = serde_json::to_string(&event)?;

        sqlx::query(
            "INSERT INTO audit_events (id, event_type, org_id, session_id, details, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(event.event_type())
        .bind(event.org_id())
        .bind(event.session_id())
        .bind(details)
        .bind(Utc::now())
        .execute(self.db.get_pool())
        .await
        .map_err(|e| AuditError::SinkError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zrc_broker::audit::AuditLogger;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_events_are_persisted() {
        let sink = Arc::new(SqliteAuditSink::new(DbStore::in_memory().await.unwrap()));
        let logger = AuditLogger::new().with_sink(sink.clone());

        logger.session_created("s1", "org-1", "A123", "user-1").await.unwrap();
        logger.session_ended("s1", "org-1", "A123", 12).await.unwrap();
        logger.authentication_failed("agent_poll", "invalid credential", None).await.unwrap();

        let records = sink.events_for_session("s1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event_type, "session_created");
        assert_eq!(records[1].org_id.as_deref(), Some("org-1"));

        let details: serde_json::Value = serde_json::from_str(&records[1].details).unwrap();
        assert_eq!(details["duration_seconds"], 12);
    }
}
