use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ice::IceServer;

/// Lifecycle state of a remote-control session.
///
/// Transitions only move forward: `Pending -> Active -> Ended`, with `Pending -> Ended`
/// for sessions cancelled before the agent picked them up. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Pending, SessionStatus::Active)
                | (SessionStatus::Pending, SessionStatus::Ended)
                | (SessionStatus::Active, SessionStatus::Ended)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "active" => Ok(SessionStatus::Active),
            "ended" => Ok(SessionStatus::Ended),
            _ => Err(format!("invalid session status: {}", s)),
        }
    }
}

/// Which side of a session a party speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalRole {
    Operator,
    Agent,
}

impl SignalRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalRole::Operator => "operator",
            SignalRole::Agent => "agent",
        }
    }
}

impl fmt::Display for SignalRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operator" => Ok(SignalRole::Operator),
            "agent" => Ok(SignalRole::Agent),
            _ => Err(format!("invalid role: {}", s)),
        }
    }
}

/// Kind of signalling payload carried by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Offer => "offer",
            SignalType::Answer => "answer",
            SignalType::IceCandidate => "ice-candidate",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frozen copy of the permission/consent policy that authorized a session.
///
/// The broker treats the document as opaque apart from the optional `permissions` array,
/// which is copied into issued session tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicySnapshot(serde_json::Value);

impl PolicySnapshot {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn empty() -> Self {
        Self(serde_json::Value::Object(serde_json::Map::new()))
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Permission names listed under `permissions`, ignoring non-string entries.
    pub fn permissions(&self) -> Vec<String> {
        self.0
            .get("permissions")
            .and_then(|p| p.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Durable record of one remote-control attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteControlSession {
    pub session_id: String,
    pub org_id: String,
    pub asset_id: String,
    pub operator_user_id: String,
    pub operator_name: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub policy_snapshot: PolicySnapshot,
}

impl RemoteControlSession {
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Seconds between creation and end (or `now` while still open).
    pub fn duration_seconds(&self, now: DateTime<Utc>) -> u64 {
        let end = self.ended_at.unwrap_or(now);
        (end - self.started_at).num_seconds().max(0) as u64
    }
}

/// What an agent receives when its poll discovers a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAssignment {
    pub session_id: String,
    pub token: String,
    pub status: SessionStatus,
    pub operator_name: String,
    pub started_at: DateTime<Utc>,
    pub policy_snapshot: PolicySnapshot,
    pub ice_servers: Vec<IceServer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_forward_only() {
        use SessionStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Ended));
        assert!(Active.can_transition_to(Ended));

        assert!(!Active.can_transition_to(Pending));
        assert!(!Ended.can_transition_to(Active));
        assert!(!Ended.can_transition_to(Pending));
        assert!(!Ended.can_transition_to(Ended));
        assert!(!Pending.can_transition_to(Pending));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&SignalType::IceCandidate).unwrap(), "\"ice-candidate\"");
        assert_eq!(serde_json::to_string(&SignalRole::Operator).unwrap(), "\"operator\"");
        assert_eq!(serde_json::to_string(&SessionStatus::Active).unwrap(), "\"active\"");
        assert_eq!("agent".parse::<SignalRole>().unwrap(), SignalRole::Agent);
        assert!("viewer".parse::<SignalRole>().is_err());
        assert_eq!("ended".parse::<SessionStatus>().unwrap(), SessionStatus::Ended);
    }

    #[test]
    fn test_policy_permissions() {
        let policy = PolicySnapshot::new(serde_json::json!({
            "permissions": ["view", "control", 7],
            "requireConsent": true,
        }));
        assert_eq!(policy.permissions(), vec!["view".to_string(), "control".to_string()]);
        assert!(PolicySnapshot::empty().permissions().is_empty());
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let session = RemoteControlSession {
            session_id: "s1".into(),
            org_id: "org".into(),
            asset_id: "a1".into(),
            operator_user_id: "u1".into(),
            operator_name: "Dana".into(),
            status: SessionStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            policy_snapshot: PolicySnapshot::empty(),
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["operatorName"], "Dana");
        assert_eq!(json["status"], "pending");
        assert!(json["endedAt"].is_null());
    }
}
