//! Audit event generation for session lifecycle and authentication.
//!
//! The broker only produces events; where they end up is decided by the sinks attached to
//! the `AuditLogger` (memory buffer, append-only file, the tracing stream, or the server's
//! database sink).
//!
//! Sensitive data (credentials, tokens) is never included in audit events.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Errors from audit operations.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("sink error: {0}")]
    SinkError(String),
    #[error("io error: {0}")]
    IoError(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<std::io::Error> for AuditError {
    fn from(e: std::io::Error) -> Self {
        AuditError::IoError(e.to_string())
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        AuditError::SerializationError(e.to_string())
    }
}

/// Audit events emitted by the broker.
///
/// Every event carries a Unix timestamp in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    SessionCreated {
        session_id: String,
        org_id: String,
        asset_id: String,
        operator_user_id: String,
        timestamp: u64,
    },
    AgentConnected {
        session_id: String,
        org_id: String,
        asset_id: String,
        agent_id: Option<String>,
        timestamp: u64,
    },
    SessionEnded {
        session_id: String,
        org_id: String,
        asset_id: String,
        duration_seconds: u64,
        timestamp: u64,
    },
    AuthenticationFailed {
        surface: String,
        reason: String,
        source: Option<String>,
        timestamp: u64,
    },
}

impl AuditEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            AuditEvent::SessionCreated { timestamp, .. }
            | AuditEvent::AgentConnected { timestamp, .. }
            | AuditEvent::SessionEnded { timestamp, .. }
            | AuditEvent::AuthenticationFailed { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            AuditEvent::SessionCreated { .. } => "session_created",
            AuditEvent::AgentConnected { .. } => "agent_connected",
            AuditEvent::SessionEnded { .. } => "session_ended",
            AuditEvent::AuthenticationFailed { .. } => "authentication_failed",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            AuditEvent::SessionCreated { session_id, .. }
            | AuditEvent::AgentConnected { session_id, .. }
            | AuditEvent::SessionEnded { session_id, .. } => Some(session_id),
            AuditEvent::AuthenticationFailed { .. } => None,
        }
    }

    pub fn org_id(&self) -> Option<&str> {
        match self {
            AuditEvent::SessionCreated { org_id, .. }
            | AuditEvent::AgentConnected { org_id, .. }
            | AuditEvent::SessionEnded { org_id, .. } => Some(org_id),
            AuditEvent::AuthenticationFailed { .. } => None,
        }
    }

    /// Format the event as a single human-readable line.
    pub fn to_log_line(&self) -> String {
        match self {
            AuditEvent::SessionCreated {
                session_id,
                org_id,
                asset_id,
                operator_user_id,
                timestamp,
            } => format!(
                "[{}] {} org={} asset={} session={} operator={}",
                timestamp,
                self.event_type(),
                org_id,
                asset_id,
                session_id,
                operator_user_id
            ),
            AuditEvent::AgentConnected {
                session_id,
                org_id,
                asset_id,
                agent_id,
                timestamp,
            } => format!(
                "[{}] {} org={} asset={} session={} agent={}",
                timestamp,
                self.event_type(),
                org_id,
                asset_id,
                session_id,
                agent_id.as_deref().unwrap_or("N/A")
            ),
            AuditEvent::SessionEnded {
                session_id,
                org_id,
                asset_id,
                duration_seconds,
                timestamp,
            } => format!(
                "[{}] {} org={} asset={} session={} duration={}s",
                timestamp,
                self.event_type(),
                org_id,
                asset_id,
                session_id,
                duration_seconds
            ),
            AuditEvent::AuthenticationFailed {
                surface,
                reason,
                source,
                timestamp,
            } => format!(
                "[{}] {} surface={} source={} reason=\"{}\"",
                timestamp,
                self.event_type(),
                surface,
                source.as_deref().unwrap_or("N/A"),
                reason
            ),
        }
    }
}

/// Trait for audit event sinks.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// In-memory audit sink for testing and buffering.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
    max_events: usize,
}

impl MemoryAuditSink {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: RwLock::new(Vec::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    /// Number of buffered events with the given `event_type()`.
    pub async fn count_of(&self, event_type: &str) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    pub async fn count(&self) -> usize {
        self.events.read().await.len()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut events = self.events.write().await;
        if self.max_events == 0 {
            return Ok(());
        }
        if events.len() >= self.max_events {
            events.remove(0); // Remove oldest event
        }
        events.push(event);
        Ok(())
    }
}

/// Append-only JSON-lines audit file.
#[derive(Debug)]
pub struct FileAuditSink {
    path: PathBuf,
}

impl FileAuditSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append_line(&self, line: &str) -> Result<(), AuditError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        Ok(())
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        let line = serde_json::to_string(&event)?;
        self.append_line(&line).await
    }
}

/// Mirrors audit events into the `tracing` stream under the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        tracing::info!(
            target: "audit",
            event_type = event.event_type(),
            session_id = event.session_id().unwrap_or(""),
            "{}",
            event.to_log_line()
        );
        Ok(())
    }
}

/// Audit logger that dispatches events to multiple sinks.
#[derive(Default, Clone)]
pub struct AuditLogger {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditLogger {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Emit an event to all sinks.
    ///
    /// Every sink is attempted even if an earlier one fails; the first failure is returned.
    pub async fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event.clone()).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // Convenience methods for emitting specific events

    pub async fn session_created(
        &self,
        session_id: &str,
        org_id: &str,
        asset_id: &str,
        operator_user_id: &str,
    ) -> Result<(), AuditError> {
        self.emit(AuditEvent::SessionCreated {
            session_id: session_id.to_string(),
            org_id: org_id.to_string(),
            asset_id: asset_id.to_string(),
            operator_user_id: operator_user_id.to_string(),
            timestamp: current_timestamp(),
        })
        .await
    }

    pub async fn agent_connected(
        &self,
        session_id: &str,
        org_id: &str,
        asset_id: &str,
        agent_id: Option<&str>,
    ) -> Result<(), AuditError> {
        self.emit(AuditEvent::AgentConnected {
            session_id: session_id.to_string(),
            org_id: org_id.to_string(),
            asset_id: asset_id.to_string(),
            agent_id: agent_id.map(str::to_string),
            timestamp: current_timestamp(),
        })
        .await
    }

    pub async fn session_ended(
        &self,
        session_id: &str,
        org_id: &str,
        asset_id: &str,
        duration_seconds: u64,
    ) -> Result<(), AuditError> {
        self.emit(AuditEvent::SessionEnded {
            session_id: session_id.to_string(),
            org_id: org_id.to_string(),
            asset_id: asset_id.to_string(),
            duration_seconds,
            timestamp: current_timestamp(),
        })
        .await
    }

    pub async fn authentication_failed(
        &self,
        surface: &str,
        reason: &str,
        source: Option<&str>,
    ) -> Result<(), AuditError> {
        self.emit(AuditEvent::AuthenticationFailed {
            surface: surface.to_string(),
            reason: reason.to_string(),
            source: source.map(str::to_string),
            timestamp: current_timestamp(),
        })
        .await
    }
}

/// Get the current Unix timestamp in seconds.
fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
