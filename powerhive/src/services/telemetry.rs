//! Telemetry sampler
//!
//! Captures chip-level chain telemetry for every managed, reachable
//! device on a slow cadence. Snapshots are standalone rows, not tied
//! to a status snapshot.

use chrono::Utc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use powerhive_firmware as firmware;
use powerhive_store::{ChainSnapshotInput, ChipSnapshotInput, Miner, Store};

use crate::config::NetworkConfig;
use crate::services::fan_out;

const TELEMETRY_WORKERS: usize = 4;

/// Periodic chip telemetry sampler.
pub struct TelemetrySampler {
    store: Store,
    interval: Duration,
    http: reqwest::Client,
}

impl TelemetrySampler {
    pub fn new(store: Store, network: &NetworkConfig, interval: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(network.miner_probe_timeout())
            .build()
            .unwrap_or_default();

        Self {
            store,
            interval,
            http,
        }
    }

    /// Run the sampling loop until cancellation.
    pub async fn run(self, token: CancellationToken) {
        info!(interval = ?self.interval, "starting telemetry sampling loop");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("stopping telemetry sampling loop");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll(&token).await {
                        error!(error = %e, "telemetry poll failed");
                    }
                }
            }
        }
    }

    async fn poll(&self, token: &CancellationToken) -> anyhow::Result<()> {
        let miners = self.store.list_miners().await?;
        let targets: Vec<Miner> = miners.into_iter().filter(Miner::is_eligible).collect();
        if targets.is_empty() {
            return Ok(());
        }

        let http = self.http.clone();
        let results = fan_out(token, TELEMETRY_WORKERS, targets, move |miner| {
            let http = http.clone();
            async move { fetch_chains(http, miner).await }
        })
        .await;

        for (miner_id, chains) in results {
            let snapshots = chain_inputs(&chains);
            if snapshots.is_empty() {
                continue;
            }
            if let Err(e) = self
                .store
                .record_chain_telemetry(&miner_id, Utc::now(), &snapshots)
                .await
            {
                warn!(miner = %miner_id, error = %e, "persist telemetry failed");
            } else {
                debug!(miner = %miner_id, chains = snapshots.len(), "telemetry recorded");
            }
        }

        Ok(())
    }
}

async fn fetch_chains(
    http: reqwest::Client,
    miner: Miner,
) -> Option<(String, Vec<firmware::ChainTelemetry>)> {
    let ip = miner.ip.as_deref().unwrap_or_default();
    let api_key = miner.api_key.as_deref().unwrap_or_default();

    let client = match firmware::Client::with_http_client(ip, http) {
        Ok(client) => client.with_api_key(api_key),
        Err(e) => {
            warn!(miner = %miner.id, ip = %ip, error = %e, "create firmware client failed");
            return None;
        }
    };

    match client.chains().await {
        Ok(chains) => Some((miner.id, chains)),
        Err(e) => {
            warn!(miner = %miner.id, ip = %ip, error = %e, "fetch chains failed");
            None
        }
    }
}

/// Map firmware chain telemetry onto standalone snapshot inputs.
fn chain_inputs(chains: &[firmware::ChainTelemetry]) -> Vec<ChainSnapshotInput> {
    chains
        .iter()
        .map(|chain| ChainSnapshotInput {
            chain_identifier: Some(format!("chain-{}", chain.id)),
            state: Some(chain.status.state.trim().to_string()),
            hashrate: chain.hashrate_realtime,
            pcb_temp_min: None,
            pcb_temp_max: None,
            chip_temp_min: None,
            chip_temp_max: None,
            chips: chain
                .chips
                .iter()
                .map(|chip| ChipSnapshotInput {
                    chip_identifier: Some(format!("chip-{}", chip.id)),
                    hashrate: chip.hashrate,
                    temperature: chip.temp,
                })
                .collect(),
        })
        .collect()
}
