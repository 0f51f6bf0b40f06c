//! Service supervisor
//!
//! Owns the root cancellation token, spawns the periodic services and
//! the dashboard server, and coordinates shutdown: cancel, drain the
//! services, stop the HTTP listener under a deadline, close the store
//! last.

use anyhow::Context;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use powerhive_balancer::{Balancer, BalancerSettings};
use powerhive_store::Store;

use crate::config::AppConfig;
use crate::server;
use crate::services::discovery::Discovery;
use crate::services::plant::PlantSampler;
use crate::services::status::StatusSampler;
use crate::services::telemetry::TelemetrySampler;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The assembled application.
pub struct App {
    config: AppConfig,
    store: Store,
}

impl App {
    pub fn new(config: AppConfig, store: Store) -> Self {
        Self { config, store }
    }

    /// Run all services until a shutdown signal arrives.
    pub async fn run(self) -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let mut services: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let discovery = Discovery::new(
            self.store.clone(),
            &self.config.network,
            self.config.intervals.discovery(),
        );
        services.push((
            "discovery",
            tokio::spawn(discovery.run(token.child_token())),
        ));

        let status = StatusSampler::new(
            self.store.clone(),
            &self.config.network,
            self.config.intervals.status(),
        );
        services.push(("status", tokio::spawn(status.run(token.child_token()))));

        let telemetry = TelemetrySampler::new(
            self.store.clone(),
            &self.config.network,
            self.config.intervals.telemetry(),
        );
        services.push((
            "telemetry",
            tokio::spawn(telemetry.run(token.child_token())),
        ));

        let plant = PlantSampler::new(
            self.store.clone(),
            self.config.plant.clone(),
            self.config.intervals.plant(),
        );
        services.push(("plant", tokio::spawn(plant.run(token.child_token()))));

        let balancer = Balancer::new(
            self.store.clone(),
            BalancerSettings {
                interval: self.config.intervals.balancer(),
                test_mode: self.config.plant.test_mode,
                test_server_url: self.config.plant.test_server_url.clone(),
            },
        );
        services.push(("balancer", tokio::spawn(balancer.run(token.child_token()))));

        for (name, _) in &services {
            info!(service = name, "service started");
        }

        let addr = self.config.http.socket_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind http listener on {addr}"))?;
        info!(addr = %addr, "http listening");

        let http_token = token.child_token();
        let http_store = self.store.clone();
        let http = tokio::spawn(async move {
            let app = server::router(http_store);
            let shutdown = async move { http_token.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "http server failed");
            }
        });

        shutdown_signal().await;
        info!("shutdown signal received");
        token.cancel();

        for (name, handle) in services {
            if handle.await.is_err() {
                warn!(service = name, "service task panicked");
            } else {
                debug!(service = name, "service stopped");
            }
        }

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, http).await.is_err() {
            warn!("http server did not stop within the shutdown deadline");
        }

        // The store closes last so draining services can still write.
        self.store.close().await;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
