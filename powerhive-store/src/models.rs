//! Entity types persisted by the store
//!
//! These structs map onto the SQLite tables. Nullable columns become
//! `Option`s; the only sentinel is the documented clear-to-null rule on
//! `MinerUpdate` string fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An ASIC miner model and its ordered preset catalog.
#[derive(Debug, Clone, Serialize)]
pub struct Model {
    pub id: i64,
    pub name: String,
    /// Case-insensitive unique key, taken from the firmware model code.
    pub alias: String,
    /// Ordered preset catalog; `position` ranks entries starting at 0.
    pub presets: Vec<Preset>,
    /// Safety cap: the balancer never selects a preset whose wattage
    /// exceeds this preset's wattage. Must be a member of `presets`.
    pub max_preset: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Model {
    /// Preset values in catalog order.
    pub fn preset_values(&self) -> Vec<&str> {
        self.presets.iter().map(|p| p.value.as_str()).collect()
    }
}

/// A single preset row within a model's catalog.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Preset {
    pub id: i64,
    pub model_id: i64,
    pub value: String,
    pub position: i64,
    /// Authoritative wattage when present; otherwise the balancer may
    /// parse one from `value`.
    pub expected_power_w: Option<f64>,
    pub expected_hashrate_th: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating or updating a model.
///
/// `presets: None` leaves the stored catalog untouched; an empty vec
/// clears it; a non-empty vec replaces it in order.
#[derive(Debug, Clone, Default)]
pub struct ModelInput {
    pub name: String,
    pub alias: String,
    pub presets: Option<Vec<String>>,
    pub max_preset: Option<String>,
}

/// Persisted state for a physical miner, identified by lowercase MAC.
#[derive(Debug, Clone, Serialize)]
pub struct Miner {
    pub id: String,
    /// Null means the device is believed offline.
    pub ip: Option<String>,
    pub api_key: Option<String>,
    /// Operator-set flag enabling the balancer to move this device.
    pub managed: bool,
    pub unlock_pass: String,
    pub model: Option<Model>,
    pub settings: Option<MinerSettings>,
    pub latest_status: Option<Status>,
    pub latest_status_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Miner {
    /// A device participates in status sampling and balancing only when
    /// it is managed, online, provisioned, and identified.
    pub fn is_eligible(&self) -> bool {
        self.managed
            && self.ip.as_deref().is_some_and(|ip| !ip.trim().is_empty())
            && self
                .api_key
                .as_deref()
                .is_some_and(|key| !key.trim().is_empty())
            && self.model.is_some()
    }

    /// True when the device has a known address, managed or not.
    pub fn is_online(&self) -> bool {
        self.ip.as_deref().is_some_and(|ip| !ip.trim().is_empty())
    }
}

/// Partial update for a miner row. Only supplied fields are applied.
///
/// For `ip` and `api_key`, a supplied value that is empty after
/// trimming clears the column to null. An empty `unlock_pass` is
/// rejected.
#[derive(Debug, Clone, Default)]
pub struct MinerUpdate {
    pub ip: Option<String>,
    pub api_key: Option<String>,
    pub managed: Option<bool>,
    pub unlock_pass: Option<String>,
    pub model_alias: Option<String>,
}

/// A persisted miner configuration snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MinerSettings {
    pub id: i64,
    pub fan_min_count: Option<i64>,
    pub fan_min_duty: Option<i64>,
    pub fan_max_duty: Option<i64>,
    pub cooling_mode: String,
    pub ignore_broken_sensors: bool,
    pub min_operational_chains: Option<i64>,
    pub preset: Option<String>,
    pub pools: Vec<Pool>,
    pub created_at: DateTime<Utc>,
}

/// A mining pool entry attached to a settings snapshot.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Pool {
    pub id: i64,
    pub settings_id: i64,
    pub position: i64,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Input for saving a miner configuration snapshot.
#[derive(Debug, Clone, Default)]
pub struct MinerSettingsInput {
    pub fan_min_count: Option<i64>,
    pub fan_min_duty: Option<i64>,
    pub fan_max_duty: Option<i64>,
    /// Defaults to `"auto"` when empty.
    pub cooling_mode: String,
    pub ignore_broken_sensors: bool,
    pub min_operational_chains: Option<i64>,
    pub preset: Option<String>,
    pub pools: Vec<PoolInput>,
}

/// Input representation of a mining pool entry.
#[derive(Debug, Clone)]
pub struct PoolInput {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// One observation of a device's operating state.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub id: i64,
    pub miner_id: String,
    pub uptime: Option<i64>,
    pub state: Option<String>,
    pub preset: Option<String>,
    /// Realtime hashrate in H/s.
    pub hashrate: Option<f64>,
    pub power_usage: Option<f64>,
    pub power_consumption: Option<f64>,
    pub recorded_at: DateTime<Utc>,
    pub fans: Vec<FanStatus>,
    pub chains: Vec<ChainSnapshot>,
}

/// Input for recording a fresh status snapshot.
#[derive(Debug, Clone, Default)]
pub struct StatusInput {
    pub uptime: Option<i64>,
    pub state: Option<String>,
    pub preset: Option<String>,
    pub hashrate: Option<f64>,
    pub power_usage: Option<f64>,
    pub power_consumption: Option<f64>,
    pub recorded_at: Option<DateTime<Utc>>,
    pub fans: Vec<FanStatusInput>,
    pub chains: Vec<ChainSnapshotInput>,
}

/// Persisted state of a single fan.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FanStatus {
    pub id: i64,
    pub status_id: i64,
    pub fan_identifier: Option<String>,
    pub rpm: Option<i64>,
    pub status: Option<String>,
}

/// Input representation of a fan reading.
#[derive(Debug, Clone, Default)]
pub struct FanStatusInput {
    pub fan_identifier: Option<String>,
    pub rpm: Option<i64>,
    pub status: Option<String>,
}

/// State of one hashboard at a point in time.
///
/// Attached to a status snapshot when recorded by the status sampler,
/// or standalone (`status_id` null) when recorded by the telemetry
/// sampler on its slower cadence.
#[derive(Debug, Clone, Serialize)]
pub struct ChainSnapshot {
    pub id: i64,
    pub miner_id: String,
    pub status_id: Option<i64>,
    pub chain_identifier: Option<String>,
    pub state: Option<String>,
    pub hashrate: Option<f64>,
    pub pcb_temp_min: Option<f64>,
    pub pcb_temp_max: Option<f64>,
    pub chip_temp_min: Option<f64>,
    pub chip_temp_max: Option<f64>,
    pub recorded_at: DateTime<Utc>,
    pub chips: Vec<ChipSnapshot>,
}

/// Input representation of a hashboard snapshot.
#[derive(Debug, Clone, Default)]
pub struct ChainSnapshotInput {
    pub chain_identifier: Option<String>,
    pub state: Option<String>,
    pub hashrate: Option<f64>,
    pub pcb_temp_min: Option<f64>,
    pub pcb_temp_max: Option<f64>,
    pub chip_temp_min: Option<f64>,
    pub chip_temp_max: Option<f64>,
    pub chips: Vec<ChipSnapshotInput>,
}

/// Chip-level metrics kept for historical analysis.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ChipSnapshot {
    pub id: i64,
    pub chain_snapshot_id: i64,
    pub chip_identifier: Option<String>,
    pub hashrate: Option<f64>,
    pub temperature: Option<f64>,
}

/// Input representation of a chip reading.
#[derive(Debug, Clone, Default)]
pub struct ChipSnapshotInput {
    pub chip_identifier: Option<String>,
    pub hashrate: Option<f64>,
    pub temperature: Option<f64>,
}

/// A snapshot of plant generation and container consumption, in kW.
#[derive(Debug, Clone, Serialize)]
pub struct PlantReading {
    pub id: i64,
    pub plant_id: String,
    pub total_generation_kw: f64,
    pub total_container_consumption_kw: f64,
    /// Always `total_generation_kw - total_container_consumption_kw`.
    pub available_power_kw: f64,
    /// Per-source generation in kW, successful sources only.
    pub generation_sources: HashMap<String, f64>,
    /// Per-source container consumption in kW, successful sources only.
    pub consumption_sources: HashMap<String, f64>,
    pub raw: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Input for recording a plant reading.
#[derive(Debug, Clone, Default)]
pub struct PlantReadingInput {
    pub plant_id: String,
    pub total_generation_kw: f64,
    pub total_container_consumption_kw: f64,
    pub available_power_kw: f64,
    pub generation_sources: HashMap<String, f64>,
    pub consumption_sources: HashMap<String, f64>,
    pub raw: Option<String>,
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Append-only audit record of one attempted preset change.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BalanceEvent {
    pub id: i64,
    pub miner_id: String,
    pub old_preset: Option<String>,
    pub new_preset: Option<String>,
    pub old_power_w: Option<f64>,
    pub new_power_w: Option<f64>,
    pub reason: String,
    pub total_consumption_before_w: Option<f64>,
    pub total_consumption_after_w: Option<f64>,
    pub available_power_w: Option<f64>,
    pub target_power_w: Option<f64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Input for appending a balance event.
#[derive(Debug, Clone, Default)]
pub struct BalanceEventInput {
    pub miner_id: String,
    pub old_preset: Option<String>,
    pub new_preset: Option<String>,
    pub old_power_w: Option<f64>,
    pub new_power_w: Option<f64>,
    pub reason: String,
    pub total_consumption_before_w: Option<f64>,
    pub total_consumption_after_w: Option<f64>,
    pub available_power_w: Option<f64>,
    pub target_power_w: Option<f64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub recorded_at: Option<DateTime<Utc>>,
}

/// The cooldown map persisted under [`crate::SETTING_LAST_PRESET_CHANGE`].
pub type CooldownMap = HashMap<String, DateTime<Utc>>;

/// Deserialize helper for JSON-valued app settings.
pub fn decode_setting<T: for<'de> Deserialize<'de>>(value: &str) -> Option<T> {
    serde_json::from_str(value).ok()
}
