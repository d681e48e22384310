//! ZRC Broker - remote-control session broker and signalling relay.
//!
//! This crate implements:
//! - Session model and forward-only lifecycle
//! - Short-lived, session-scoped tokens
//! - Agent credential verification
//! - Session storage abstraction
//! - Signalling relay (per-session queues with TTL)
//! - Audit event generation
//! - ICE server configuration
//! - Agent and signalling HTTP clients (feature `http-client`)

#![forbid(unsafe_code)]

// Domain
pub mod broker;
pub mod types;

// Infrastructure
pub mod audit;
pub mod credential;
pub mod relay;
pub mod store;
pub mod token;

// Supporting modules
pub mod errors;
pub mod ice;

#[cfg(feature = "http-client")]
pub mod client;

#[cfg(test)]
mod relay_props;

pub use broker::{CreateSessionRequest, CreatedSession, SessionBroker};
pub use errors::BrokerError;
pub use types::{AgentAssignment, PolicySnapshot, RemoteControlSession, SessionStatus, SignalRole, SignalType};
