//! HTTP clients for agents and operator tooling.
//!
//! The relay is stateless, so `SignalClient` keeps the `since` cursor itself.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::relay::SignalMessage;
use crate::types::{AgentAssignment, SignalRole, SignalType};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad response: {0}")]
    BadResponse(String),
    #[error("server error: status={0}")]
    Server(u16),
}

impl ClientError {
    /// Server-side or network trouble that the next poll may not see.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Http(_) | ClientError::Server(_))
    }
}

fn build_client() -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .use_rustls_tls()
        .build()
        .map_err(|e| ClientError::Http(e.to_string()))
}

async fn error_for(resp: reqwest::Response) -> ClientError {
    let status = resp.status();
    match status {
        StatusCode::UNAUTHORIZED => ClientError::Unauthorized,
        StatusCode::FORBIDDEN => ClientError::Forbidden,
        s if s.is_server_error() => ClientError::Server(s.as_u16()),
        other => ClientError::BadResponse(format!(
            "status={} body={:?}",
            other,
            resp.text().await.ok()
        )),
    }
}

// ----------------------------------------------------------------------------
// Agent poll
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct AgentPollClient {
    base_url: String,
    credential: String,
    client: reqwest::Client,
}

impl AgentPollClient {
    pub fn new(base_url: impl Into<String>, credential: impl Into<String>) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential: credential.into(),
            client: build_client()?,
        })
    }

    /// One poll. `Ok(None)` means the server answered 204.
    pub async fn poll(&self) -> Result<Option<AgentAssignment>, ClientError> {
        let resp = self
            .client
            .get(format!("{}/v1/agent/poll", self.base_url))
            .bearer_auth(&self.credential)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        match resp.status() {
            StatusCode::OK => {
                let assignment = resp
                    .json::<AgentAssignment>()
                    .await
                    .map_err(|e| ClientError::BadResponse(e.to_string()))?;
                Ok(Some(assignment))
            }
            StatusCode::NO_CONTENT => Ok(None),
            _ => Err(error_for(resp).await),
        }
    }

    /// Poll, folding every failure into "no session".
    ///
    /// Meant for the agent's background loop, which simply tries again on its next tick.
    pub async fn next_assignment(&self) -> Option<AgentAssignment> {
        match self.poll().await {
            Ok(assignment) => assignment,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "agent poll failed, retrying on next interval");
                None
            }
            Err(e) => {
                warn!(error = %e, "agent poll rejected");
                None
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Signalling
// ----------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PostSignalBody<'a> {
    session_id: &'a str,
    token: &'a str,
    #[serde(rename = "type")]
    signal_type: SignalType,
    data: &'a serde_json::Value,
    sender: SignalRole,
}

#[derive(Deserialize)]
struct SignalPollResponse {
    #[serde(default)]
    data: Vec<SignalMessage>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// One party's view of a session's signalling channel.
pub struct SignalClient {
    base_url: String,
    session_id: String,
    token: String,
    role: SignalRole,
    since: u64,
    client: reqwest::Client,
}

impl SignalClient {
    pub fn new(
        base_url: impl Into<String>,
        session_id: impl Into<String>,
        token: impl Into<String>,
        role: SignalRole,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id: session_id.into(),
            token: token.into(),
            role,
            since: 0,
            client: build_client()?,
        })
    }

    pub fn for_assignment(
        base_url: impl Into<String>,
        assignment: &AgentAssignment,
    ) -> Result<Self, ClientError> {
        Self::new(base_url, assignment.session_id.clone(), assignment.token.clone(), SignalRole::Agent)
    }

    pub fn since(&self) -> u64 {
        self.since
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = token.into();
    }

    fn signal_url(&self) -> String {
        format!("{}/v1/signal", self.base_url)
    }

    pub async fn post(&self, signal_type: SignalType, data: &serde_json::Value) -> Result<(), ClientError> {
        let body = PostSignalBody {
            session_id: &self.session_id,
            token: &self.token,
            signal_type,
            data,
            sender: self.role,
        };
        let resp = self
            .client
            .post(self.signal_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(error_for(resp).await)
        }
    }

    /// Fetch the peer's messages newer than the cursor and advance it.
    pub async fn poll(&mut self) -> Result<Vec<SignalMessage>, ClientError> {
        let since = self.since.to_string();
        let resp = self
            .client
            .get(self.signal_url())
            .query(&[
                ("sessionId", self.session_id.as_str()),
                ("token", self.token.as_str()),
                ("since", since.as_str()),
                ("role", self.role.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }

        let body = resp
            .json::<SignalPollResponse>()
            .await
            .map_err(|e| ClientError::BadResponse(e.to_string()))?;
        if let Some(last) = body.data.iter().map(|m| m.timestamp).max() {
            self.since = self.since.max(last);
        }
        Ok(body.data)
    }

    pub async fn clear(&self) -> Result<(), ClientError> {
        let resp = self
            .client
            .delete(self.signal_url())
            .query(&[
                ("sessionId", self.session_id.as_str()),
                ("token", self.token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(error_for(resp).await)
        }
    }

    /// Swap the current token for a fresh one before it expires.
    pub async fn refresh_token(&mut self) -> Result<(), ClientError> {
        let resp = self
            .client
            .post(format!("{}/v1/sessions/{}/token", self.base_url, self.session_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }
        let body = resp
            .json::<TokenResponse>()
            .await
            .map_err(|e| ClientError::BadResponse(e.to_string()))?;
        self.token = body.token;
        Ok(())
    }
}
