use axum::Router;
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use zrc_broker::audit::{AuditLogger, FileAuditSink, TracingAuditSink};
use zrc_broker::credential::{AgentBinding, CredentialVerifier, StaticCredentialVerifier};
use zrc_broker::relay::{InMemorySignalRelay, RelayConfig, SignalRelay};
use zrc_broker::store::{InMemorySessionStore, SessionStore};
use zrc_broker::token::TokenIssuer;
use zrc_broker::SessionBroker;

use crate::api::{self, AppState};
use crate::auth::OperatorKeys;
use crate::config::{AgentCredentialConfig, ServerConfig};
use crate::db::{DbStore, SqliteAuditSink, SqliteCredentialVerifier, SqliteSessionStore};
use crate::metrics::BrokerMetrics;
use crate::rate_limit::RateLimiter;

pub struct BrokerServer {
    config: ServerConfig,
    broker: Arc<SessionBroker>,
    operator_keys: OperatorKeys,
    rate_limiter: RateLimiter,
    metrics: Arc<BrokerMetrics>,
    started_at: Instant,
    shutdown_tx: watch::Sender<bool>,
}

fn binding(entry: &AgentCredentialConfig) -> AgentBinding {
    AgentBinding {
        org_id: entry.org_id.clone(),
        asset_id: entry.asset_id.clone(),
        agent_id: entry.agent_id.clone(),
        is_active: entry.is_active,
    }
}

impl BrokerServer {
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let metrics = Arc::new(BrokerMetrics::new()?);
        let relay: Arc<dyn SignalRelay> = Arc::new(InMemorySignalRelay::new(RelayConfig {
            max_queue_length: config.max_queue_length,
            max_signal_bytes: config.max_signal_bytes,
            signal_ttl: config.signal_ttl(),
        }));

        let mut audit = AuditLogger::new()
            .with_sink(Arc::new(TracingAuditSink))
            .with_sink(metrics.clone());
        if let Some(path) = &config.audit_log_path {
            audit.add_sink(Arc::new(FileAuditSink::new(path)));
        }

        let (store, credentials): (Arc<dyn SessionStore>, Arc<dyn CredentialVerifier>) =
            match &config.database_url {
                Some(url) => {
                    let db = DbStore::new(url).await?;
                    db.run_migrations().await?;

                    let verifier = SqliteCredentialVerifier::new(db.clone());
                    for entry in &config.agent_credentials {
                        verifier
                            .upsert_digest(&entry.credential_sha256, &binding(entry))
                            .await?;
                    }
                    audit.add_sink(Arc::new(SqliteAuditSink::new(db.clone())));
                    info!(url = %url, "using SQLite session store");

                    let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(db));
                    let verifier: Arc<dyn CredentialVerifier> = Arc::new(verifier);
                    (store, verifier)
                }
                None => {
                    let verifier = StaticCredentialVerifier::new();
                    for entry in &config.agent_credentials {
                        verifier
                            .insert_digest(entry.credential_sha256.clone(), binding(entry))
                            .await;
                    }
                    warn!("no database configured, sessions are kept in memory");

                    let store: Arc<dyn SessionStore> = InMemorySessionStore::new_shared();
                    let verifier: Arc<dyn CredentialVerifier> = Arc::new(verifier);
                    (store, verifier)
                }
            };

        let tokens = TokenIssuer::new(
            config.token_secret.as_bytes(),
            config.token_ttl(),
            config.token_audience.clone(),
        );
        let broker = SessionBroker::new(store, relay, credentials, tokens)
            .with_audit(audit)
            .with_ice(config.ice.clone());

        let operator_keys = OperatorKeys::from_config(&config.operator_keys);
        let rate_limiter = RateLimiter::new(config.rate_limit.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            broker: Arc::new(broker),
            operator_keys,
            rate_limiter,
            metrics,
            started_at: Instant::now(),
            shutdown_tx,
        })
    }

    pub fn broker(&self) -> &Arc<SessionBroker> {
        &self.broker
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.metrics
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            broker: Arc::clone(&self.broker),
            operator_keys: self.operator_keys.clone(),
            rate_limiter: self.rate_limiter.clone(),
            metrics: Arc::clone(&self.metrics),
            started_at: self.started_at,
        };

        api::router(state).layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        tokio::spawn(Self::sweep_task(
            Arc::clone(self.broker.relay()),
            self.rate_limiter.clone(),
            Arc::clone(&self.metrics),
            self.config.sweep_interval(),
            self.shutdown_tx.subscribe(),
        ));

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!("zrc-broker listening on {}", self.config.bind_addr);

        let app = self.router();
        let mut stop = self.shutdown_tx.subscribe();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopped| *stopped).await;
                })
                .await
        });

        tokio::select! {
            joined = &mut server => {
                joined??;
                return Ok(());
            }
            _ = Self::shutdown_signal(self.shutdown_tx.subscribe()) => {}
        }

        self.shutdown();
        match tokio::time::timeout(self.config.shutdown_timeout(), &mut server).await {
            Ok(joined) => joined??,
            Err(_) => {
                warn!(
                    timeout_secs = self.config.shutdown_timeout_secs,
                    "in-flight requests did not drain before the shutdown deadline"
                );
                server.abort();
            }
        }

        info!("zrc-broker stopped");
        Ok(())
    }

    async fn sweep_task(
        relay: Arc<dyn SignalRelay>,
        rate_limiter: RateLimiter,
        metrics: Arc<BrokerMetrics>,
        every: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match relay.evict_expired().await {
                        Ok(stats) => {
                            metrics.signals_evicted.inc_by(stats.messages_evicted as f64);
                            if stats.messages_evicted > 0 || stats.queues_removed > 0 {
                                info!(
                                    "Evicted {} signals, removed {} empty queues",
                                    stats.messages_evicted, stats.queues_removed
                                );
                            }
                        }
                        Err(e) => warn!(error = %e, "signal sweep failed"),
                    }
                    rate_limiter.prune_idle();
                    metrics.observe_relay(relay.stats());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    match sigterm {
                        Some(ref mut sigterm) => { sigterm.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, starting graceful shutdown");
            }
            _ = shutdown.wait_for(|stopped| *stopped) => {
                info!("Shutdown requested");
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zrc_broker::credential::hash_credential;

    fn config() -> ServerConfig {
        ServerConfig {
            token_secret: "0123456789abcdef0123456789abcdef".into(),
            agent_credentials: vec![AgentCredentialConfig {
                credential_sha256: hash_credential("agent-secret"),
                org_id: "org-1".into(),
                asset_id: "A123".into(),
                agent_id: "agent-1".into(),
                is_active: true,
            }],
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let result = BrokerServer::new(ServerConfig::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_credentials_are_seeded() {
        let server = BrokerServer::new(config()).await.unwrap();
        let binding = server
            .broker()
            .authenticate_agent("agent-secret", None)
            .await
            .unwrap();
        assert_eq!(binding.asset_id, "A123");
    }

    #[tokio::test]
    async fn test_sqlite_credentials_are_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("broker.db").display());
        let server = BrokerServer::new(ServerConfig {
            database_url: Some(url),
            ..config()
        })
        .await
        .unwrap();

        let binding = server
            .broker()
            .authenticate_agent("agent-secret", None)
            .await
            .unwrap();
        assert_eq!(binding.agent_id, "agent-1");
    }

    #[tokio::test]
    async fn test_sweep_task_stops_on_shutdown() {
        let server = BrokerServer::new(config()).await.unwrap();
        let handle = tokio::spawn(BrokerServer::sweep_task(
            Arc::clone(server.broker().relay()),
            server.rate_limiter.clone(),
            Arc::clone(server.metrics()),
            std::time::Duration::from_millis(10),
            server.shutdown_tx.subscribe(),
        ));

        server.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
