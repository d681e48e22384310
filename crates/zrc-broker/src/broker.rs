//! Session broker: lifecycle, tokens and agent check-in.
//!
//! The broker is the only writer of session records. It owns the forward-only state machine,
//! hands out freshly minted session tokens whenever a party needs one, and reacts to
//! transitions (audit events, clearing the relay queue when a session ends).

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::credential::{AgentBinding, CredentialVerifier};
use crate::errors::BrokerError;
use crate::ice::{IceConfig, IceServer};
use crate::relay::SignalRelay;
use crate::store::{SessionStore, StoreError};
use crate::token::{SessionClaims, TokenGrant, TokenIssuer};
use crate::types::{
    AgentAssignment, PolicySnapshot, RemoteControlSession, SessionStatus, SignalRole,
};

/// Input for [`SessionBroker::create_session`].
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub org_id: String,
    pub asset_id: String,
    pub operator_user_id: String,
    pub operator_name: String,
    pub policy: PolicySnapshot,
}

/// A freshly created session together with the operator's first token.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session: RemoteControlSession,
    pub token: String,
    pub claims: SessionClaims,
    pub ice_servers: Vec<IceServer>,
}

pub struct SessionBroker {
    store: Arc<dyn SessionStore>,
    relay: Arc<dyn SignalRelay>,
    credentials: Arc<dyn CredentialVerifier>,
    tokens: TokenIssuer,
    audit: AuditLogger,
    ice: IceConfig,
}

impl SessionBroker {
    pub fn new(
        store: Arc<dyn SessionStore>,
        relay: Arc<dyn SignalRelay>,
        credentials: Arc<dyn CredentialVerifier>,
        tokens: TokenIssuer,
    ) -> Self {
        Self {
            store,
            relay,
            credentials,
            tokens,
            audit: AuditLogger::new(),
            ice: IceConfig::default(),
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_ice(mut self, ice: IceConfig) -> Self {
        self.ice = ice;
        self
    }

    pub fn relay(&self) -> &Arc<dyn SignalRelay> {
        &self.relay
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Create a `pending` session and mint the operator's token.
    ///
    /// Fails with `Conflict` if the asset already has a pending or active session.
    pub async fn create_session(
        &self,
        req: CreateSessionRequest,
    ) -> Result<CreatedSession, BrokerError> {
        for (field, value) in [
            ("orgId", &req.org_id),
            ("assetId", &req.asset_id),
            ("operatorUserId", &req.operator_user_id),
        ] {
            if value.trim().is_empty() {
                return Err(BrokerError::Validation(format!("{} is required", field)));
            }
        }

        let session = RemoteControlSession {
            session_id: Uuid::new_v4().to_string(),
            org_id: req.org_id,
            asset_id: req.asset_id,
            operator_user_id: req.operator_user_id,
            operator_name: req.operator_name,
            status: SessionStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            policy_snapshot: req.policy,
        };

        self.store
            .insert_session(session.clone())
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists(_) => BrokerError::Conflict(format!(
                    "asset {} already has an open session",
                    session.asset_id
                )),
                other => other.into(),
            })?;

        info!(
            session_id = %session.session_id,
            org_id = %session.org_id,
            asset_id = %session.asset_id,
            "session created"
        );

        if let Err(e) = self
            .audit
            .session_created(
                &session.session_id,
                &session.org_id,
                &session.asset_id,
                &session.operator_user_id,
            )
            .await
        {
            warn!(session_id = %session.session_id, error = %e, "failed to record session_created audit event");
        }

        let (token, claims) = self.tokens.issue(&TokenGrant {
            session_id: session.session_id.clone(),
            org_id: session.org_id.clone(),
            asset_id: session.asset_id.clone(),
            subject: session.operator_user_id.clone(),
            role: SignalRole::Operator,
            permissions: session.policy_snapshot.permissions(),
        })?;

        Ok(CreatedSession {
            session,
            token,
            claims,
            ice_servers: self.ice_servers(),
        })
    }

    pub async fn get_session(
        &self,
        org_id: &str,
        session_id: &str,
    ) -> Result<RemoteControlSession, BrokerError> {
        self.store
            .load_session(org_id, session_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("session {}", session_id)))
    }

    pub async fn find_active_or_pending_session(
        &self,
        org_id: &str,
        asset_id: &str,
    ) -> Result<Option<RemoteControlSession>, BrokerError> {
        Ok(self.store.find_open_session(org_id, asset_id).await?)
    }

    /// Move a session forward in its lifecycle.
    ///
    /// Same-state, backward and from-`ended` moves are rejected, as is a move whose
    /// compare-and-set loses to a concurrent writer.
    pub async fn transition(
        &self,
        session_id: &str,
        org_id: &str,
        next: SessionStatus,
    ) -> Result<RemoteControlSession, BrokerError> {
        let current = self.get_session(org_id, session_id).await?;
        if !current.status.can_transition_to(next) {
            return Err(BrokerError::InvalidTransition(format!(
                "{} -> {}",
                current.status, next
            )));
        }

        let updated = self
            .store
            .compare_and_set_status(org_id, session_id, current.status, next, Utc::now())
            .await?
            .ok_or_else(|| {
                BrokerError::InvalidTransition(format!(
                    "{} -> {}: session changed concurrently",
                    current.status, next
                ))
            })?;

        self.after_transition(&updated, current.status, None).await;
        Ok(updated)
    }

    pub async fn end_session(
        &self,
        session_id: &str,
        org_id: &str,
    ) -> Result<RemoteControlSession, BrokerError> {
        self.transition(session_id, org_id, SessionStatus::Ended).await
    }

    async fn after_transition(
        &self,
        session: &RemoteControlSession,
        from: SessionStatus,
        agent_id: Option<&str>,
    ) {
        info!(
            session_id = %session.session_id,
            from = %from,
            to = %session.status,
            "session transitioned"
        );

        match session.status {
            SessionStatus::Active => {
                if let Err(e) = self
                    .audit
                    .agent_connected(&session.session_id, &session.org_id, &session.asset_id, agent_id)
                    .await
                {
                    warn!(session_id = %session.session_id, error = %e, "failed to record agent_connected audit event");
                }
            }
            SessionStatus::Ended => {
                let duration = session.duration_seconds(Utc::now());
                if let Err(e) = self
                    .audit
                    .session_ended(&session.session_id, &session.org_id, &session.asset_id, duration)
                    .await
                {
                    warn!(session_id = %session.session_id, error = %e, "failed to record session_ended audit event");
                }
                if let Err(e) = self.relay.clear(&session.session_id).await {
                    warn!(session_id = %session.session_id, error = %e, "failed to clear signal queue");
                }
            }
            SessionStatus::Pending => {}
        }
    }

    // ------------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------------

    pub fn issue_token(&self, grant: &TokenGrant) -> Result<String, BrokerError> {
        Ok(self.tokens.issue(grant)?.0)
    }

    pub fn verify_token(&self, token: &str) -> Result<SessionClaims, BrokerError> {
        Ok(self.tokens.verify(token)?)
    }

    pub fn verify_token_for_session(
        &self,
        token: &str,
        session_id: &str,
    ) -> Result<SessionClaims, BrokerError> {
        Ok(self.tokens.verify_for_session(token, session_id)?)
    }

    /// Reissue a token for the same session and role while the session is still open.
    pub async fn refresh_token(
        &self,
        claims: &SessionClaims,
    ) -> Result<(String, SessionClaims), BrokerError> {
        let session = self.get_session(&claims.org, &claims.sid).await?;
        if !session.is_open() {
            return Err(BrokerError::AuthorizationFailure);
        }
        Ok(self.tokens.issue(&TokenGrant::from(claims))?)
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice.servers()
    }

    // ------------------------------------------------------------------------
    // Agent check-in
    // ------------------------------------------------------------------------

    /// Resolve an agent bearer credential to its binding.
    ///
    /// Unknown credentials are `AuthenticationFailure`, deactivated ones
    /// `AuthorizationFailure`.
    pub async fn authenticate_agent(
        &self,
        credential: &str,
        source: Option<&str>,
    ) -> Result<AgentBinding, BrokerError> {
        let check = self.credentials.verify(credential).await?;
        let binding = match check.binding {
            Some(binding) if check.valid => binding,
            _ => {
                if let Err(e) = self
                    .audit
                    .authentication_failed("agent_poll", "invalid credential", source)
                    .await
                {
                    warn!(error = %e, "failed to record authentication_failed audit event");
                }
                return Err(BrokerError::AuthenticationFailure);
            }
        };

        if !binding.is_active {
            if let Err(e) = self
                .audit
                .authentication_failed("agent_poll", "inactive agent", source)
                .await
            {
                warn!(error = %e, "failed to record authentication_failed audit event");
            }
            return Err(BrokerError::AuthorizationFailure);
        }

        Ok(binding)
    }

    /// Authenticate and check in in one step.
    pub async fn agent_poll(
        &self,
        credential: &str,
        source: Option<&str>,
    ) -> Result<Option<AgentAssignment>, BrokerError> {
        let binding = self.authenticate_agent(credential, source).await?;
        self.agent_checkin(&binding).await
    }

    /// Look for a session on the agent's asset, activating it if it is still pending.
    ///
    /// Returns `None` when there is nothing to join, including when the session ended while
    /// this poll was in flight. Only the poller that wins the `pending -> active` swap emits
    /// `agent_connected`.
    pub async fn agent_checkin(
        &self,
        binding: &AgentBinding,
    ) -> Result<Option<AgentAssignment>, BrokerError> {
        if !binding.is_active {
            return Err(BrokerError::AuthorizationFailure);
        }

        let Some(session) = self
            .find_active_or_pending_session(&binding.org_id, &binding.asset_id)
            .await?
        else {
            return Ok(None);
        };

        let session = match session.status {
            SessionStatus::Pending => {
                let swapped = self
                    .store
                    .compare_and_set_status(
                        &session.org_id,
                        &session.session_id,
                        SessionStatus::Pending,
                        SessionStatus::Active,
                        Utc::now(),
                    )
                    .await?;
                match swapped {
                    Some(active) => {
                        self.after_transition(&active, SessionStatus::Pending, Some(&binding.agent_id))
                            .await;
                        active
                    }
                    None => {
                        debug!(session_id = %session.session_id, "lost activation race");
                        match self
                            .store
                            .load_session(&session.org_id, &session.session_id)
                            .await?
                        {
                            Some(current) if current.status == SessionStatus::Active => current,
                            _ => return Ok(None),
                        }
                    }
                }
            }
            SessionStatus::Active => session,
            SessionStatus::Ended => return Ok(None),
        };

        let (token, _) = self.tokens.issue(&TokenGrant {
            session_id: session.session_id.clone(),
            org_id: session.org_id.clone(),
            asset_id: session.asset_id.clone(),
            subject: binding.agent_id.clone(),
            role: SignalRole::Agent,
            permissions: session.policy_snapshot.permissions(),
        })?;

        Ok(Some(AgentAssignment {
            session_id: session.session_id,
            token,
            status: session.status,
            operator_name: session.operator_name,
            started_at: session.started_at,
            policy_snapshot: session.policy_snapshot,
            ice_servers: self.ice_servers(),
        }))
    }
}
