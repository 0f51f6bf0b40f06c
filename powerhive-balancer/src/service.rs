//! Balance service
//!
//! Runs the periodic tick: loads the latest plant reading and fleet
//! state, plans, persists the projected consumption, then applies the
//! planned changes sequentially so intermediate delta recomputations
//! stay valid. Every attempt, success or failure, lands in the balance
//! event log.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use powerhive_firmware as firmware;
use powerhive_store::{
    decode_setting, BalanceEventInput, CooldownMap, Miner, Store, StoreError,
    SETTING_EXPECTED_CONSUMPTION, SETTING_LAST_PRESET_CHANGE, SETTING_SAFETY_MARGIN,
};

use crate::planner::{self, BalancePlan, MinerSnapshot, ModelPowerCurve, PlannedChange, PlannerConfig};

/// Delay before the first tick, letting the samplers populate state.
const FIRST_TICK_DELAY: Duration = Duration::from_secs(5);

/// Per-device request timeout for balancer-issued firmware calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Reason tag recorded on balancer-issued events.
const REASON_AUTOMATIC: &str = "automatic_balance";

const DEFAULT_SAFETY_MARGIN_PCT: f64 = 10.0;

/// Balancer errors
#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("test mode enabled but test server URL not configured")]
    TestServerUnconfigured,

    #[error("test server returned status {0}")]
    TestServerStatus(u16),
}

/// Balancer configuration
#[derive(Debug, Clone)]
pub struct BalancerSettings {
    pub interval: Duration,
    /// Echo the projected consumption to the test plant server.
    pub test_mode: bool,
    pub test_server_url: Option<String>,
}

/// The power balancing service.
pub struct Balancer {
    store: Store,
    settings: BalancerSettings,
    planner_config: PlannerConfig,
    http: reqwest::Client,
}

impl Balancer {
    pub fn new(store: Store, settings: BalancerSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            store,
            settings,
            planner_config: PlannerConfig::default(),
            http,
        }
    }

    /// Run the balancing loop until cancellation.
    pub async fn run(self, token: CancellationToken) {
        info!(interval = ?self.settings.interval, "starting power balancing loop");

        tokio::select! {
            _ = token.cancelled() => {
                info!("stopping power balancing loop");
                return;
            }
            _ = tokio::time::sleep(FIRST_TICK_DELAY) => {}
        }

        if let Err(e) = self.balance(&token).await {
            error!(error = %e, "initial balance failed");
        }

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.settings.interval,
            self.settings.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("stopping power balancing loop");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.balance(&token).await {
                        error!(error = %e, "balance cycle failed");
                    }
                }
            }
        }
    }

    /// One balance tick: plan, persist the projection, apply.
    pub async fn balance(&self, token: &CancellationToken) -> Result<(), BalancerError> {
        let Some(reading) = self.store.latest_plant_reading().await? else {
            warn!("no plant readings available yet, skipping balance");
            return Ok(());
        };

        let safety_margin = self.load_safety_margin().await;
        let target_w = reading.total_generation_kw * (1.0 - safety_margin / 100.0) * 1000.0;

        let miners = self.store.list_miners().await?;
        let curves = self.load_power_curves().await?;
        let snapshots: Vec<MinerSnapshot> = miners.iter().map(snapshot_of).collect();
        let mut cooldowns = self.load_cooldowns().await;

        let plan = planner::create_plan(
            &self.planner_config,
            target_w,
            &snapshots,
            &curves,
            &cooldowns,
            Utc::now(),
        );

        info!(
            current_w = plan.baseline_w,
            target_w = plan.target_w,
            delta_w = plan.initial_delta_w,
            planned_changes = plan.changes.len(),
            "power status"
        );

        if let Err(e) = self
            .store
            .set_setting(SETTING_EXPECTED_CONSUMPTION, &plan.projected_w.to_string())
            .await
        {
            warn!(error = %e, "failed to store expected consumption");
        }
        if let Err(e) = self.post_expected_consumption(plan.projected_w).await {
            warn!(error = %e, "failed to post expected consumption to test server");
        }

        if plan.changes.is_empty() {
            debug!("consumption within tolerance, no changes needed");
            return Ok(());
        }

        let available_w = reading.available_power_kw * 1000.0;
        let adjusted = self
            .apply_plan(token, &plan, &miners, available_w, &mut cooldowns)
            .await;

        if let Err(e) = self.save_cooldowns(&cooldowns).await {
            warn!(error = %e, "failed to save cooldown map");
        }

        if adjusted > 0 {
            info!(miners_adjusted = adjusted, "balance cycle complete");
        }

        Ok(())
    }

    /// Apply planned changes in order, recomputing the remaining delta
    /// after each success and stopping once inside the tolerance band.
    async fn apply_plan(
        &self,
        token: &CancellationToken,
        plan: &BalancePlan,
        miners: &[Miner],
        available_w: f64,
        cooldowns: &mut CooldownMap,
    ) -> usize {
        let mut delta = plan.target_w - plan.baseline_w;
        let mut consumption_w = plan.baseline_w;
        let mut adjusted = 0;

        for change in &plan.changes {
            if token.is_cancelled() {
                break;
            }

            let Some(miner) = miners.iter().find(|m| m.id == change.miner_id) else {
                continue;
            };

            match self.apply_change(miner, change).await {
                Ok(result) => {
                    let power_change = change.new_power_w - change.old_power_w.unwrap_or(change.new_power_w);
                    let after_w = consumption_w + power_change;

                    self.record_event(change, consumption_w, Some(after_w), available_w, plan.target_w, true, None)
                        .await;
                    cooldowns.insert(miner.id.clone(), Utc::now());
                    adjusted += 1;

                    if result.restart_required {
                        info!(miner = %miner.id, preset = %change.new_preset, "miner restart required after preset change");
                        self.restart_mining(miner).await;
                    }
                    if result.reboot_required {
                        info!(miner = %miner.id, preset = %change.new_preset, "miner reboot required after preset change");
                    }

                    consumption_w = after_w;
                    delta -= power_change;

                    info!(
                        miner = %miner.id,
                        old_preset = change.old_preset.as_deref().unwrap_or("none"),
                        new_preset = %change.new_preset,
                        delta_remaining_w = delta,
                        "preset changed"
                    );

                    if delta.abs() < self.planner_config.tolerance_w {
                        break;
                    }
                }
                Err(e) => {
                    error!(miner = %miner.id, error = %e, "failed to apply preset change");
                    self.record_event(
                        change,
                        consumption_w,
                        None,
                        available_w,
                        plan.target_w,
                        false,
                        Some(e.to_string()),
                    )
                    .await;
                }
            }
        }

        adjusted
    }

    async fn apply_change(
        &self,
        miner: &Miner,
        change: &PlannedChange,
    ) -> Result<firmware::SaveConfigResult, firmware::FirmwareError> {
        let ip = miner.ip.as_deref().unwrap_or_default();
        let api_key = miner.api_key.as_deref().unwrap_or_default();
        let client = firmware::Client::with_http_client(ip, self.http.clone())?;
        client.set_preset(api_key, &change.new_preset).await
    }

    async fn restart_mining(&self, miner: &Miner) {
        let ip = miner.ip.as_deref().unwrap_or_default();
        let api_key = miner.api_key.as_deref().unwrap_or_default();
        let restart = async {
            firmware::Client::with_http_client(ip, self.http.clone())?
                .restart_mining(api_key)
                .await
        };
        if let Err(e) = restart.await {
            warn!(miner = %miner.id, error = %e, "restart after preset change failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_event(
        &self,
        change: &PlannedChange,
        before_w: f64,
        after_w: Option<f64>,
        available_w: f64,
        target_w: f64,
        success: bool,
        error_message: Option<String>,
    ) {
        let input = BalanceEventInput {
            miner_id: change.miner_id.clone(),
            old_preset: change.old_preset.clone(),
            new_preset: Some(change.new_preset.clone()),
            old_power_w: change.old_power_w,
            new_power_w: Some(change.new_power_w),
            reason: REASON_AUTOMATIC.to_string(),
            total_consumption_before_w: Some(before_w),
            total_consumption_after_w: after_w,
            available_power_w: Some(available_w),
            target_power_w: Some(target_w),
            success,
            error_message,
            recorded_at: None,
        };
        if let Err(e) = self.store.record_balance_event(input).await {
            warn!(miner = %change.miner_id, error = %e, "failed to log balance event");
        }
    }

    async fn load_safety_margin(&self) -> f64 {
        let margin = match self.store.get_setting(SETTING_SAFETY_MARGIN).await {
            Ok(Some(value)) => decode_setting::<f64>(&value).unwrap_or(DEFAULT_SAFETY_MARGIN_PCT),
            Ok(None) => DEFAULT_SAFETY_MARGIN_PCT,
            Err(e) => {
                warn!(error = %e, "failed to load safety margin, using default");
                DEFAULT_SAFETY_MARGIN_PCT
            }
        };
        margin.clamp(0.0, 50.0)
    }

    async fn load_power_curves(&self) -> Result<HashMap<String, ModelPowerCurve>, BalancerError> {
        let models = self.store.list_models().await?;
        Ok(models
            .into_iter()
            .map(|model| {
                let curve = ModelPowerCurve::new(
                    model
                        .presets
                        .iter()
                        .map(|p| (p.value.clone(), p.expected_power_w)),
                    model.max_preset.clone(),
                );
                (model.alias, curve)
            })
            .collect())
    }

    async fn load_cooldowns(&self) -> CooldownMap {
        match self.store.get_setting(SETTING_LAST_PRESET_CHANGE).await {
            Ok(Some(value)) => decode_setting(&value).unwrap_or_default(),
            Ok(None) => CooldownMap::default(),
            Err(e) => {
                warn!(error = %e, "failed to load cooldown map, continuing");
                CooldownMap::default()
            }
        }
    }

    async fn save_cooldowns(&self, cooldowns: &CooldownMap) -> Result<(), BalancerError> {
        let encoded = serde_json::to_string(cooldowns).map_err(StoreError::from)?;
        self.store
            .set_setting(SETTING_LAST_PRESET_CHANGE, &encoded)
            .await?;
        Ok(())
    }

    /// Echo the projected consumption to the test plant server as MW.
    async fn post_expected_consumption(&self, consumption_w: f64) -> Result<(), BalancerError> {
        if !self.settings.test_mode {
            return Ok(());
        }
        let url = self
            .settings
            .test_server_url
            .as_deref()
            .ok_or(BalancerError::TestServerUnconfigured)?;

        let consumption_mw = consumption_w / 1_000_000.0;
        let response = self
            .http
            .post(format!("{url}/data/consumption"))
            .json(&json!({ "expected_consumption_mw": consumption_mw }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BalancerError::TestServerStatus(response.status().as_u16()));
        }

        info!(
            consumption_w = consumption_w,
            consumption_mw = consumption_mw,
            "posted expected consumption to test server"
        );
        Ok(())
    }
}

fn snapshot_of(miner: &Miner) -> MinerSnapshot {
    MinerSnapshot {
        id: miner.id.clone(),
        ip: miner.ip.clone(),
        api_key: miner.api_key.clone(),
        managed: miner.managed,
        model_alias: miner.model.as_ref().map(|m| m.alias.clone()),
        current_preset: miner
            .latest_status
            .as_ref()
            .and_then(|s| s.preset.clone()),
        reported_power_w: miner
            .latest_status
            .as_ref()
            .and_then(|s| s.power_consumption),
        hashrate: miner.latest_status.as_ref().and_then(|s| s.hashrate),
    }
}
