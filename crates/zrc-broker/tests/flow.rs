//! Integration tests for broker and relay flows.
//!
//! These tests drive the library the way the HTTP layer does:
//! - Agent discovery and activation (including concurrent pollers)
//! - Offer/answer exchange with echo suppression and cursoring
//! - Session end and token scoping

use std::sync::Arc;

use serde_json::json;
use zrc_broker::{
    audit::{AuditLogger, MemoryAuditSink},
    credential::{AgentBinding, StaticCredentialVerifier},
    relay::{InMemorySignalRelay, SignalRelay},
    store::InMemorySessionStore,
    token::TokenIssuer,
    BrokerError, CreateSessionRequest, PolicySnapshot, SessionBroker, SessionStatus, SignalRole,
    SignalType,
};

const AGENT_CREDENTIAL: &str = "agent-credential-A123";

struct Fixture {
    broker: Arc<SessionBroker>,
    audit: Arc<MemoryAuditSink>,
    credentials: StaticCredentialVerifier,
    relay: Arc<InMemorySignalRelay>,
}

async fn fixture() -> Fixture {
    let audit = Arc::new(MemoryAuditSink::new(256));
    let relay = Arc::new(InMemorySignalRelay::default());
    let credentials = StaticCredentialVerifier::new();
    credentials
        .insert(
            AGENT_CREDENTIAL,
            AgentBinding {
                org_id: "Org1".into(),
                asset_id: "A123".into(),
                agent_id: "agent-1".into(),
                is_active: true,
            },
        )
        .await;

    let broker = SessionBroker::new(
        Arc::new(InMemorySessionStore::new()),
        relay.clone(),
        Arc::new(credentials.clone()),
        TokenIssuer::with_defaults(b"integration-test-secret-0123456789"),
    )
    .with_audit(AuditLogger::new().with_sink(audit.clone()));

    Fixture {
        broker: Arc::new(broker),
        audit,
        credentials,
        relay,
    }
}

fn request() -> CreateSessionRequest {
    CreateSessionRequest {
        org_id: "Org1".into(),
        asset_id: "A123".into(),
        operator_user_id: "tech-9".into(),
        operator_name: "Jordan".into(),
        policy: PolicySnapshot::new(json!({"permissions": ["view", "control"], "requireConsent": false})),
    }
}

#[tokio::test]
async fn test_agent_poll_lifecycle() {
    let f = fixture().await;

    // Nothing to do yet.
    assert!(f.broker.agent_poll(AGENT_CREDENTIAL, None).await.unwrap().is_none());

    let created = f.broker.create_session(request()).await.unwrap();
    let session_id = created.session.session_id.clone();

    let first = f
        .broker
        .agent_poll(AGENT_CREDENTIAL, None)
        .await
        .unwrap()
        .expect("pending session should be assigned");
    assert_eq!(first.session_id, session_id);
    assert_eq!(first.status, SessionStatus::Active);
    assert_eq!(first.operator_name, "Jordan");
    assert!(!first.ice_servers.is_empty());

    let claims = f.broker.verify_token_for_session(&first.token, &session_id).unwrap();
    assert_eq!(claims.role, SignalRole::Agent);
    assert_eq!(claims.sub, "agent-1");

    // Already active: fresh token, no second audit event.
    let second = f
        .broker
        .agent_poll(AGENT_CREDENTIAL, None)
        .await
        .unwrap()
        .expect("active session is still reported");
    assert_eq!(second.status, SessionStatus::Active);
    assert_ne!(second.token, first.token);
    assert_eq!(f.audit.count_of("agent_connected").await, 1);

    f.broker.end_session(&session_id, "Org1").await.unwrap();
    assert!(f.broker.agent_poll(AGENT_CREDENTIAL, None).await.unwrap().is_none());
    assert_eq!(f.audit.count_of("session_ended").await, 1);
}

#[tokio::test]
async fn test_agent_poll_authentication() {
    let f = fixture().await;

    let err = f.broker.agent_poll("wrong", Some("10.0.0.8")).await.unwrap_err();
    assert!(matches!(err, BrokerError::AuthenticationFailure));

    f.credentials.set_active(AGENT_CREDENTIAL, false).await;
    let err = f.broker.agent_poll(AGENT_CREDENTIAL, None).await.unwrap_err();
    assert!(matches!(err, BrokerError::AuthorizationFailure));

    assert_eq!(f.audit.count_of("authentication_failed").await, 2);
}

#[tokio::test]
async fn test_concurrent_pollers_activate_once() {
    let f = fixture().await;
    let created = f.broker.create_session(request()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let broker = f.broker.clone();
        handles.push(tokio::spawn(async move {
            broker.agent_poll(AGENT_CREDENTIAL, None).await
        }));
    }

    for handle in handles {
        let assignment = handle.await.unwrap().unwrap().expect("every poller sees the session");
        assert_eq!(assignment.session_id, created.session.session_id);
        assert_eq!(assignment.status, SessionStatus::Active);
    }
    assert_eq!(f.audit.count_of("agent_connected").await, 1);
}

#[tokio::test]
async fn test_concurrent_explicit_activation_succeeds_once() {
    let f = fixture().await;
    let session_id = f.broker.create_session(request()).await.unwrap().session.session_id;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let broker = f.broker.clone();
        let id = session_id.clone();
        handles.push(tokio::spawn(async move {
            broker.transition(&id, "Org1", SessionStatus::Active).await
        }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(BrokerError::InvalidTransition(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(f.audit.count_of("agent_connected").await, 1);
}

#[tokio::test]
async fn test_offer_answer_exchange() {
    let f = fixture().await;
    let created = f.broker.create_session(request()).await.unwrap();
    let session_id = created.session.session_id.clone();
    let assignment = f.broker.agent_poll(AGENT_CREDENTIAL, None).await.unwrap().unwrap();

    let operator = f.broker.verify_token_for_session(&created.token, &session_id).unwrap();
    let agent = f.broker.verify_token_for_session(&assignment.token, &session_id).unwrap();
    let relay = f.broker.relay();

    relay
        .post(&session_id, SignalType::Offer, json!({"sdp": "offer-sdp"}), operator.role)
        .await
        .unwrap();

    let mut agent_since = 0;
    let inbox = relay.poll(&session_id, agent_since, agent.role).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].signal_type, SignalType::Offer);
    agent_since = inbox[0].timestamp;

    relay
        .post(&session_id, SignalType::Answer, json!({"sdp": "answer-sdp"}), agent.role)
        .await
        .unwrap();
    relay
        .post(&session_id, SignalType::IceCandidate, json!({"candidate": "c1"}), agent.role)
        .await
        .unwrap();

    // The operator sees the answer and candidate, never its own offer.
    let inbox = relay.poll(&session_id, 0, operator.role).await.unwrap();
    let kinds: Vec<_> = inbox.iter().map(|m| m.signal_type).collect();
    assert_eq!(kinds, vec![SignalType::Answer, SignalType::IceCandidate]);
    assert!(inbox.iter().all(|m| m.sender == SignalRole::Agent));

    // The agent's cursor filters out what it already saw.
    assert!(relay.poll(&session_id, agent_since, agent.role).await.unwrap().is_empty());

    f.broker.end_session(&session_id, "Org1").await.unwrap();
    assert_eq!(f.relay.queue_len(&session_id), 0);
}

#[tokio::test]
async fn test_tokens_are_scoped_to_their_session() {
    let f = fixture().await;
    let first = f.broker.create_session(request()).await.unwrap();
    f.broker.end_session(&first.session.session_id, "Org1").await.unwrap();
    let second = f.broker.create_session(request()).await.unwrap();

    assert!(f
        .broker
        .verify_token_for_session(&first.token, &second.session.session_id)
        .is_err());
    assert!(matches!(
        f.broker
            .verify_token_for_session(&second.token, &first.session.session_id)
            .unwrap_err(),
        BrokerError::AuthenticationFailure
    ));
}

#[tokio::test]
async fn test_cancel_before_agent_connects() {
    let f = fixture().await;
    let created = f.broker.create_session(request()).await.unwrap();

    let ended = f
        .broker
        .transition(&created.session.session_id, "Org1", SessionStatus::Ended)
        .await
        .unwrap();
    assert_eq!(ended.status, SessionStatus::Ended);
    assert!(ended.ended_at.is_some());

    assert!(f.broker.agent_poll(AGENT_CREDENTIAL, None).await.unwrap().is_none());
    assert_eq!(f.audit.count_of("agent_connected").await, 0);
}
