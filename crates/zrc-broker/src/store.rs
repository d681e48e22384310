//! Storage abstraction for remote-control session records.
//!
//! This module defines the `SessionStore` trait and an in-memory implementation used by
//! tests and single-process deployments. The server crate provides a SQLite-backed store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::types::{RemoteControlSession, SessionStatus};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),
}

// ============================================================================
// Store Trait
// ============================================================================

/// Durable session records, scoped by organization.
///
/// Every read filters by `org_id`; a session id from another organization behaves exactly
/// like a missing one.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session.
    ///
    /// # Returns
    /// * `Ok(())` on success
    /// * `Err(StoreError::AlreadyExists)` if the id is taken or the asset already has a
    ///   non-terminal session
    async fn insert_session(&self, session: RemoteControlSession) -> Result<(), StoreError>;

    /// Load a session by organization and id.
    ///
    /// # Returns
    /// * `Ok(Some(session))` if found
    /// * `Ok(None)` if not found in this organization
    async fn load_session(
        &self,
        org_id: &str,
        session_id: &str,
    ) -> Result<Option<RemoteControlSession>, StoreError>;

    /// Most recently started `pending` or `active` session for an asset.
    async fn find_open_session(
        &self,
        org_id: &str,
        asset_id: &str,
    ) -> Result<Option<RemoteControlSession>, StoreError>;

    /// Atomically move a session from `expected` to `next`.
    ///
    /// When `next` is `Ended`, `ended_at` is stamped with `at`.
    ///
    /// # Returns
    /// * `Ok(Some(session))` with the updated record if the swap happened
    /// * `Ok(None)` if the current status was not `expected`
    /// * `Err(StoreError::NotFound)` if the session does not exist
    async fn compare_and_set_status(
        &self,
        org_id: &str,
        session_id: &str,
        expected: SessionStatus,
        next: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<RemoteControlSession>, StoreError>;
}

// ============================================================================
// In-Memory Store Implementation
// ============================================================================

/// Thread-safe in-memory session store.
///
/// A single write lock covers the open-session check and the insert, and the read-compare-write
/// of a status swap, so both are atomic with respect to each other.
#[derive(Default, Clone)]
pub struct InMemorySessionStore {
    /// Sessions indexed by session_id
    sessions: Arc<RwLock<HashMap<String, RemoteControlSession>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert_session(&self, session: RemoteControlSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;

        if sessions.contains_key(&session.session_id) {
            return Err(StoreError::AlreadyExists(session.session_id));
        }
        let asset_busy = sessions.values().any(|existing| {
            existing.org_id == session.org_id
                && existing.asset_id == session.asset_id
                && existing.is_open()
        });
        if asset_busy {
            return Err(StoreError::AlreadyExists(format!(
                "asset {} has an open session",
                session.asset_id
            )));
        }

        sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn load_session(
        &self,
        org_id: &str,
        session_id: &str,
    ) -> Result<Option<RemoteControlSession>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_id)
            .filter(|s| s.org_id == org_id)
            .cloned())
    }

    async fn find_open_session(
        &self,
        org_id: &str,
        asset_id: &str,
    ) -> Result<Option<RemoteControlSession>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.org_id == org_id && s.asset_id == asset_id && s.is_open())
            .max_by_key(|s| s.started_at)
            .cloned())
    }

    async fn compare_and_set_status(
        &self,
        org_id: &str,
        session_id: &str,
        expected: SessionStatus,
        next: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<RemoteControlSession>, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .filter(|s| s.org_id == org_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        if session.status != expected {
            return Ok(None);
        }

        session.status = next;
        if next == SessionStatus::Ended {
            session.ended_at = Some(at);
        }
        Ok(Some(session.clone()))
    }
}
