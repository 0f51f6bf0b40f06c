//! Device discovery and provisioning
//!
//! Sweeps the configured subnets for responders on port 80, probes
//! candidates through the firmware API, identifies devices by MAC,
//! registers model metadata, and bootstraps a per-device API key.
//! Devices that vanish from the network get their IP cleared.

use anyhow::{bail, Context};
use rand::RngCore;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use powerhive_firmware as firmware;
use powerhive_store::{Miner, MinerUpdate, ModelInput, Store};

use crate::config::NetworkConfig;
use crate::services::fan_out;

const LIGHT_SCAN_WORKERS: usize = 32;
const PROBE_WORKERS: usize = 8;
const DEVICE_HTTP_PORT: u16 = 80;
const API_KEY_DESCRIPTION: &str = "PowerHive";
const API_KEY_BYTES: usize = 16;

/// Periodic network discovery service.
pub struct Discovery {
    store: Store,
    subnets: Vec<String>,
    light_timeout: Duration,
    interval: Duration,
    http: reqwest::Client,
}

struct ProbeResult {
    ip: String,
    client: firmware::Client,
    info: firmware::InfoResponse,
    model: firmware::ModelResponse,
}

impl Discovery {
    pub fn new(store: Store, network: &NetworkConfig, interval: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(network.miner_probe_timeout())
            .build()
            .unwrap_or_default();

        Self {
            store,
            subnets: network.subnets.clone(),
            light_timeout: network.light_scan_timeout(),
            interval,
            http,
        }
    }

    /// Run the discovery loop until cancellation.
    pub async fn run(self, token: CancellationToken) {
        info!(interval = ?self.interval, "starting discovery loop");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("stopping discovery loop");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.scan(&token).await {
                        error!(error = %e, "discovery cycle failed");
                    }
                }
            }
        }
    }

    async fn scan(&self, token: &CancellationToken) -> anyhow::Result<()> {
        let hosts = enumerate_hosts(&self.subnets);
        if hosts.is_empty() {
            return Ok(());
        }

        let candidates = self.light_scan(token, hosts).await;
        let mut discovered = HashSet::new();

        if !candidates.is_empty() {
            debug!(candidates = candidates.len(), "probing responders");
            let probed = self.probe(token, candidates).await;
            for result in probed {
                let ip = result.ip.clone();
                match self.apply_discovery(result).await {
                    Ok(mac) => {
                        discovered.insert(mac);
                    }
                    Err(e) => error!(ip = %ip, error = %e, "apply discovery failed"),
                }
            }
        }

        if token.is_cancelled() {
            return Ok(());
        }
        self.mark_offline(&discovered).await
    }

    /// TCP-connect sweep over all candidate hosts.
    async fn light_scan(&self, token: &CancellationToken, hosts: Vec<String>) -> Vec<String> {
        let timeout = self.light_timeout;
        fan_out(token, LIGHT_SCAN_WORKERS, hosts, move |ip| async move {
            let addr = format!("{ip}:{DEVICE_HTTP_PORT}");
            match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(_)) => Some(ip),
                _ => None,
            }
        })
        .await
    }

    /// Fetch identity and model data from each responder; hosts that
    /// do not speak the firmware API drop out silently.
    async fn probe(&self, token: &CancellationToken, candidates: Vec<String>) -> Vec<ProbeResult> {
        let http = self.http.clone();
        fan_out(token, PROBE_WORKERS, candidates, move |ip| {
            let http = http.clone();
            async move {
                let client = match firmware::Client::with_http_client(&ip, http) {
                    Ok(client) => client,
                    Err(e) => {
                        warn!(ip = %ip, error = %e, "create firmware client failed");
                        return None;
                    }
                };

                let info = match client.info().await {
                    Ok(info) => info,
                    Err(e) => {
                        debug!(ip = %ip, error = %e, "probe host skipped");
                        return None;
                    }
                };

                let model = match client.model().await {
                    Ok(model) => model,
                    Err(e) => {
                        warn!(ip = %ip, error = %e, "fetch model data failed");
                        return None;
                    }
                };

                Some(ProbeResult {
                    ip,
                    client,
                    info,
                    model,
                })
            }
        })
        .await
    }

    /// Register the probed device: upsert its model (preserving any
    /// operator-set cap), record its address, and make sure it has a
    /// stored API key.
    async fn apply_discovery(&self, mut result: ProbeResult) -> anyhow::Result<String> {
        let mac = result.info.system.network_status.mac.trim().to_lowercase();
        if mac.is_empty() {
            bail!("missing mac address for ip {}", result.ip);
        }

        let alias = fallback(&result.model.model, &result.info.model);
        if alias.is_empty() {
            bail!("model alias unavailable for mac {mac}");
        }
        let mut name = fallback(&result.model.full_name, &result.info.miner);
        if name.is_empty() {
            name = alias.clone();
        }

        let max_preset = match self.store.model_by_alias(&alias).await {
            Ok(existing) => existing.max_preset,
            Err(_) => None,
        };

        self.store
            .upsert_model(ModelInput {
                name,
                alias: alias.clone(),
                presets: None,
                max_preset,
            })
            .await
            .with_context(|| format!("upsert model {alias}"))?;

        let miner = self
            .store
            .upsert_miner(
                &mac,
                MinerUpdate {
                    ip: Some(result.ip.clone()),
                    model_alias: Some(alias.clone()),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("upsert miner {mac}"))?;

        let api_key = match self.ensure_api_key(&miner, &mut result.client).await {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(miner = %miner.id, ip = %result.ip, error = %e, "ensure api key failed");
                None
            }
        };

        if let (Some(model), Some(_)) = (&miner.model, &api_key) {
            if model.presets.is_empty() {
                match self
                    .refresh_presets(&result.client, &model.name, &alias, model.max_preset.clone())
                    .await
                {
                    Ok(count) if count > 0 => {
                        info!(model = %alias, count = count, "model presets captured");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(miner = %miner.id, ip = %result.ip, error = %e, "fetch presets failed");
                    }
                }
            }
        }

        Ok(mac)
    }

    /// Reuse the stored API key, or unlock the device and either adopt
    /// an existing key named after us or create a fresh one.
    async fn ensure_api_key(
        &self,
        miner: &Miner,
        client: &mut firmware::Client,
    ) -> anyhow::Result<String> {
        if let Some(key) = miner.api_key.as_deref().map(str::trim) {
            if !key.is_empty() {
                client.set_api_key(key);
                return Ok(key.to_string());
            }
        }

        let token = client
            .unlock(&miner.unlock_pass)
            .await
            .context("unlock miner")?;

        let keys = client.list_api_keys(&token).await.context("list api keys")?;
        for entry in keys {
            let key = entry.key.trim();
            if entry.description.eq_ignore_ascii_case(API_KEY_DESCRIPTION) && !key.is_empty() {
                self.store_api_key(&miner.id, key).await?;
                client.set_api_key(key);
                return Ok(key.to_string());
            }
        }

        let api_key = generate_api_key();
        client
            .create_api_key(&token, &api_key, API_KEY_DESCRIPTION)
            .await
            .context("create api key")?;
        self.store_api_key(&miner.id, &api_key).await?;
        client.set_api_key(&api_key);

        info!(miner = %miner.id, "api key provisioned");
        Ok(api_key)
    }

    async fn store_api_key(&self, miner_id: &str, key: &str) -> anyhow::Result<()> {
        self.store
            .upsert_miner(
                miner_id,
                MinerUpdate {
                    api_key: Some(key.to_string()),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("store api key for miner {miner_id}"))?;
        Ok(())
    }

    /// Capture the device's preset catalog, including any advertised
    /// wattages, for a model that has none yet.
    async fn refresh_presets(
        &self,
        client: &firmware::Client,
        model_name: &str,
        alias: &str,
        max_preset: Option<String>,
    ) -> anyhow::Result<usize> {
        let presets = client
            .autotune_presets(None)
            .await
            .context("autotune presets")?;

        let values: Vec<String> = presets
            .iter()
            .map(|p| p.name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        if values.is_empty() {
            return Ok(0);
        }

        let count = values.len();
        self.store
            .upsert_model(ModelInput {
                name: model_name.to_string(),
                alias: alias.to_string(),
                presets: Some(values),
                max_preset,
            })
            .await
            .with_context(|| format!("update model presets {alias}"))?;

        for preset in &presets {
            let Some(power_w) = preset.tuned_power_w() else {
                continue;
            };
            match self
                .store
                .update_preset_power(alias, &preset.name, power_w)
                .await
            {
                Ok(()) => {
                    debug!(model = %alias, preset = %preset.name, power_w = power_w, "stored preset power");
                }
                Err(e) => {
                    warn!(model = %alias, preset = %preset.name, error = %e, "failed to update preset power");
                }
            }
        }

        Ok(count)
    }

    /// Clear the IP of every known device that was not seen this pass.
    async fn mark_offline(&self, discovered: &HashSet<String>) -> anyhow::Result<()> {
        let miners = self.store.list_miners().await.context("list miners")?;

        for miner in miners {
            if discovered.contains(&miner.id.to_lowercase()) || !miner.is_online() {
                continue;
            }
            match self
                .store
                .upsert_miner(
                    &miner.id,
                    MinerUpdate {
                        ip: Some(String::new()),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(_) => info!(miner = %miner.id, "miner offline"),
                Err(e) => warn!(miner = %miner.id, error = %e, "mark miner offline failed"),
            }
        }
        Ok(())
    }
}

fn fallback(primary: &str, secondary: &str) -> String {
    let primary = primary.trim();
    if primary.is_empty() {
        secondary.trim().to_string()
    } else {
        primary.to_string()
    }
}

fn generate_api_key() -> String {
    let mut buf = [0u8; API_KEY_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Expand the configured CIDRs into unique host addresses, excluding
/// network and broadcast addresses. Malformed subnets are skipped.
fn enumerate_hosts(subnets: &[String]) -> Vec<String> {
    let mut seen: HashSet<Ipv4Addr> = HashSet::new();

    for subnet in subnets {
        let subnet = subnet.trim();
        if subnet.is_empty() {
            continue;
        }
        match expand_cidr(subnet) {
            Ok(hosts) => seen.extend(hosts),
            Err(e) => warn!(subnet = %subnet, error = %e, "parse subnet failed"),
        }
    }

    let mut hosts: Vec<Ipv4Addr> = seen.into_iter().collect();
    hosts.sort_unstable();
    hosts.into_iter().map(|ip| ip.to_string()).collect()
}

fn expand_cidr(cidr: &str) -> anyhow::Result<Vec<Ipv4Addr>> {
    let (addr, prefix) = cidr
        .split_once('/')
        .with_context(|| format!("{cidr} is not in CIDR notation"))?;
    let addr: Ipv4Addr = addr.trim().parse().context("invalid network address")?;
    let prefix: u32 = prefix.trim().parse().context("invalid prefix length")?;
    if prefix > 32 {
        bail!("prefix length {prefix} out of range");
    }

    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    let network = u32::from(addr) & mask;
    let broadcast = network | !mask;

    // A /31 or /32 has no usable hosts once the network and broadcast
    // addresses are trimmed.
    if broadcast - network < 2 {
        return Ok(Vec::new());
    }

    Ok((network + 1..broadcast).map(Ipv4Addr::from).collect())
}
