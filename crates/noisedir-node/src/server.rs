//! Directory node server: wires configuration into a runnable axum service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::{create_router, ApiState};
use crate::authorization::AuthorizationGateway;
use crate::config::ServerConfig;
use crate::directory::SqliteDirectoryStore;
use crate::engine::UpdateEngine;
use crate::ledger::{PendingLedger, SqlitePendingLedger};
use crate::query::QueryEngine;
use crate::verification::{LoggingEmailTransport, LoggingSmsTransport, PathUrlBuilder};

/// Directory node server
pub struct DirNodeServer {
    config: Arc<ServerConfig>,
    state: Arc<ApiState>,
    ledger: Arc<dyn PendingLedger>,
}

impl DirNodeServer {
    /// Create new directory node server
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let keypair = Arc::new(config.server_keypair());
        let store = Arc::new(SqliteDirectoryStore::new(&config.database_path).await?);
        let ledger: Arc<dyn PendingLedger> =
            Arc::new(SqlitePendingLedger::new(&config.database_path).await?);

        let engine = Arc::new(UpdateEngine::new(
            store.clone(),
            ledger.clone(),
            config.pending_request_max_age_seconds as i64,
        ));
        let query_engine = Arc::new(QueryEngine::new(store.clone()));

        let auth_gateway = if config.require_authorization {
            Some(Arc::new(AuthorizationGateway::new(
                config.accounting_url.clone(),
                config.accounting_apisecret.clone(),
            )))
        } else {
            None
        };

        let state = Arc::new(ApiState {
            config: config.clone(),
            keypair,
            engine,
            query_engine,
            email_transport: Arc::new(LoggingEmailTransport),
            sms_transport: Arc::new(LoggingSmsTransport),
            url_builder: Arc::new(PathUrlBuilder {
                base: config.public_base_url.clone(),
            }),
            auth_gateway,
        });

        Ok(Self { config, state, ledger })
    }

    /// Run the directory node server
    pub async fn run(&self) -> Result<()> {
        info!("Starting directory node on {}", self.config.listen_addr);

        let app: Router = create_router(self.state.clone())
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

        // Best-effort background sweep; the lazy expiry check at resolve
        // time remains authoritative.
        let ledger = self.ledger.clone();
        let max_age = self.config.pending_request_max_age_seconds as i64;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                interval.tick().await;
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .expect("system clock is after the epoch")
                    .as_secs() as i64;
                match ledger.sweep_expired(now, max_age).await {
                    Ok(count) if count > 0 => info!(count, "swept expired pending requests"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "pending-request sweep failed"),
                }
            }
        });

        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr).await?;
        info!("HTTP server listening on {}", self.config.listen_addr);

        axum::serve(listener, app).await?;

        Ok(())
    }
}
