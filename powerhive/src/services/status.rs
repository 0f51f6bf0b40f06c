//! Status sampler
//!
//! Periodically snapshots the operating state of every managed,
//! reachable device: summary metrics, the decoded current preset, fan
//! and chain readings. One slow or dead device never aborts the cycle.

use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use powerhive_core::decode_current_preset;
use powerhive_firmware as firmware;
use powerhive_store::{
    ChainSnapshotInput, FanStatusInput, Miner, StatusInput, Store,
};

use crate::config::NetworkConfig;
use crate::services::fan_out;

const STATUS_WORKERS: usize = 4;

/// Periodic per-device status sampler.
pub struct StatusSampler {
    store: Store,
    interval: Duration,
    http: reqwest::Client,
}

impl StatusSampler {
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
        info!(interval = ?self.interval, "starting status sampling loop");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("stopping status sampling loop");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll(&token).await {
                        error!(error = %e, "status poll failed");
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
        let results = fan_out(token, STATUS_WORKERS, targets, move |miner| {
            let http = http.clone();
            async move { sample_device(http, miner).await }
        })
        .await;

        for (miner_id, input) in results {
            if let Err(e) = self.store.record_status(&miner_id, input).await {
                warn!(miner = %miner_id, error = %e, "persist miner status failed");
            } else {
                debug!(miner = %miner_id, "miner status recorded");
            }
        }

        Ok(())
    }
}

async fn sample_device(http: reqwest::Client, miner: Miner) -> Option<(String, StatusInput)> {
    let ip = miner.ip.as_deref().unwrap_or_default();
    let api_key = miner.api_key.as_deref().unwrap_or_default();

    let client = match firmware::Client::with_http_client(ip, http) {
        Ok(client) => client.with_api_key(api_key),
        Err(e) => {
            warn!(miner = %miner.id, ip = %ip, error = %e, "create firmware client failed");
            return None;
        }
    };

    let summary = match client.summary().await {
        Ok(summary) => summary,
        Err(e) => {
            warn!(miner = %miner.id, ip = %ip, error = %e, "fetch summary failed");
            return None;
        }
    };

    // A missing perf summary costs us the preset, not the snapshot.
    let preset = match client.perf_summary().await {
        Ok(perf) => decode_current_preset(&perf.current_preset),
        Err(e) => {
            debug!(miner = %miner.id, error = %e, "perf summary fetch failed");
            None
        }
    };

    Some((miner.id, status_input(&summary, preset)))
}

/// Map a firmware summary onto a store status snapshot.
fn status_input(summary: &firmware::SummaryResponse, preset: Option<String>) -> StatusInput {
    let miner = &summary.miner;

    let state = miner.miner_status.miner_state.trim();
    let fans = miner
        .cooling
        .fans
        .iter()
        .map(|fan| FanStatusInput {
            fan_identifier: Some(format!("fan-{}", fan.id)),
            rpm: fan.rpm,
            status: Some(fan.status.trim().to_string()),
        })
        .collect();

    let chains = miner
        .chains
        .iter()
        .map(|chain| ChainSnapshotInput {
            chain_identifier: Some(format!("chain-{}", chain.id)),
            state: Some(chain.status.state.trim().to_string()),
            hashrate: chain.hashrate_realtime,
            pcb_temp_min: chain.pcb_temp.min,
            pcb_temp_max: chain.pcb_temp.max,
            chip_temp_min: chain.chip_temp.min,
            chip_temp_max: chain.chip_temp.max,
            chips: Vec::new(),
        })
        .collect();

    StatusInput {
        uptime: miner.miner_status.miner_state_time,
        state: (!state.is_empty()).then(|| state.to_string()),
        preset,
        hashrate: miner.hashrate_realtime,
        power_usage: miner.power_usage,
        power_consumption: miner.power_consumption,
        recorded_at: None,
        fans,
        chains,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_input_maps_summary_fields() {
        let summary: firmware::SummaryResponse = serde_json::from_value(json!({
            "miner": {
                "miner_status": {"miner_state": " mining ", "miner_state_time": 3600},
                "hr_realtime": 95.0e12,
                "power_usage": 3250.0,
                "power_consumption": 3010.0,
                "cooling": {"fan_num": 1, "fans": [{"id": 2, "rpm": 4000, "status": "ok"}]},
                "chains": [{
                    "id": 1,
                    "hashrate_rt": 31.0e12,
                    "pcb_temp": {"min": 40.0, "max": 55.0},
                    "chip_temp": {"min": 58.0, "max": 72.0},
                    "status": {"state": "mining"}
                }]
            }
        }))
        .unwrap();

        let input = status_input(&summary, Some("3010W".to_string()));

        assert_eq!(input.state.as_deref(), Some("mining"));
        assert_eq!(input.preset.as_deref(), Some("3010W"));
        assert_eq!(input.uptime, Some(3600));
        assert_eq!(input.hashrate, Some(95.0e12));
        assert_eq!(input.power_consumption, Some(3010.0));
        assert_eq!(input.fans[0].fan_identifier.as_deref(), Some("fan-2"));
        assert_eq!(input.chains[0].chain_identifier.as_deref(), Some("chain-1"));
        assert_eq!(input.chains[0].pcb_temp_max, Some(55.0));
        assert!(input.chains[0].chips.is_empty());
    }

    #[test]
    fn test_status_input_without_perf_preset() {
        let summary: firmware::SummaryResponse = serde_json::from_value(json!({
            "miner": {"miner_status": {"miner_state": ""}}
        }))
        .unwrap();

        let input = status_input(&summary, None);
        assert_eq!(input.state, None);
        assert_eq!(input.preset, None);
    }
}
