//! Firmware API payloads
//!
//! Only the fields the controller consumes are modelled; unknown fields
//! are ignored on decode. Most numeric fields are nullable on the
//! device side and stay `Option` here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Payload returned by `POST /unlock`.
#[derive(Debug, Deserialize)]
pub struct UnlockResponse {
    #[serde(default)]
    pub token: String,
}

/// Lightweight device state from `GET /status`.
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub miner_state: String,
    #[serde(default)]
    pub miner_state_time: Option<i64>,
    #[serde(default)]
    pub reboot_required: bool,
    #[serde(default)]
    pub restart_required: bool,
    #[serde(default)]
    pub unlocked: bool,
}

/// Device metadata from `GET /info`. Unauthenticated.
#[derive(Debug, Deserialize)]
pub struct InfoResponse {
    #[serde(default)]
    pub miner: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub fw_name: String,
    #[serde(default)]
    pub fw_version: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub system: SystemInfo,
}

#[derive(Debug, Default, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub miner_name: String,
    #[serde(default)]
    pub network_status: NetworkStatus,
}

/// Network identifiers; `mac` is the device's identity.
#[derive(Debug, Default, Deserialize)]
pub struct NetworkStatus {
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub hostname: String,
}

/// Model metadata from `GET /model`. Unauthenticated.
#[derive(Debug, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub model: String,
}

/// One entry from `GET /apikeys`.
#[derive(Debug, Deserialize)]
pub struct ApiKeyEntry {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub description: String,
}

/// The relevant slice of `GET /summary`.
#[derive(Debug, Deserialize)]
pub struct SummaryResponse {
    pub miner: SummaryMiner,
}

#[derive(Debug, Deserialize)]
pub struct SummaryMiner {
    #[serde(default)]
    pub miner_status: SummaryMinerStatus,
    #[serde(rename = "hr_realtime")]
    pub hashrate_realtime: Option<f64>,
    #[serde(rename = "hr_average")]
    pub hashrate_average: Option<f64>,
    pub power_consumption: Option<f64>,
    pub power_usage: Option<f64>,
    pub power_efficiency: Option<f64>,
    #[serde(default)]
    pub cooling: SummaryCooling,
    #[serde(default)]
    pub chains: Vec<SummaryChain>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SummaryMinerStatus {
    #[serde(default)]
    pub miner_state: String,
    pub miner_state_time: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SummaryCooling {
    #[serde(default)]
    pub fan_num: i64,
    #[serde(default)]
    pub fans: Vec<SummaryFan>,
}

#[derive(Debug, Deserialize)]
pub struct SummaryFan {
    #[serde(default)]
    pub id: i64,
    pub rpm: Option<i64>,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct SummaryChain {
    #[serde(default)]
    pub id: i64,
    pub frequency: Option<f64>,
    pub voltage: Option<f64>,
    pub power_consumption: Option<f64>,
    #[serde(rename = "hashrate_rt")]
    pub hashrate_realtime: Option<f64>,
    pub hashrate_ideal: Option<f64>,
    #[serde(default)]
    pub pcb_temp: TemperatureRange,
    #[serde(default)]
    pub chip_temp: TemperatureRange,
    #[serde(default)]
    pub status: ChainState,
}

/// Min/max of a temperature sensor group.
#[derive(Debug, Default, Deserialize)]
pub struct TemperatureRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChainState {
    #[serde(default)]
    pub state: String,
}

/// Chip-level telemetry from `GET /chains`.
#[derive(Debug, Deserialize)]
pub struct ChainTelemetry {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub status: ChainState,
    #[serde(rename = "hr_realtime")]
    pub hashrate_realtime: Option<f64>,
    #[serde(rename = "hr_nominal")]
    pub hashrate_nominal: Option<f64>,
    #[serde(rename = "freq")]
    pub frequency: Option<f64>,
    #[serde(default)]
    pub chips: Vec<ChipTelemetry>,
}

#[derive(Debug, Deserialize)]
pub struct ChipTelemetry {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "hr")]
    pub hashrate: Option<f64>,
    #[serde(rename = "freq")]
    pub frequency: Option<f64>,
    #[serde(rename = "volt")]
    pub voltage: Option<f64>,
    pub temp: Option<f64>,
    #[serde(rename = "errs")]
    pub errors: Option<i64>,
}

/// One preset from `GET /autotune/presets`.
#[derive(Debug, Deserialize)]
pub struct AutotunePreset {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pretty: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub modded_psu_required: bool,
    #[serde(default)]
    pub tune_settings: Option<HashMap<String, Value>>,
}

impl AutotunePreset {
    /// Expected wattage advertised in the tune settings, when present.
    /// Firmware versions disagree on the field name.
    pub fn tuned_power_w(&self) -> Option<f64> {
        let settings = self.tune_settings.as_ref()?;
        ["power", "target_power"]
            .iter()
            .find_map(|field| settings.get(*field).and_then(Value::as_f64))
            .filter(|power| *power > 0.0)
    }
}

/// `GET /perf-summary`; `current_preset` drifts across firmware
/// versions (string, object, or null) and is decoded by the caller.
#[derive(Debug, Deserialize)]
pub struct PerfSummaryResponse {
    #[serde(default)]
    pub current_preset: Value,
}

/// Minimal `POST /settings` payload that changes only the preset.
#[derive(Debug, Serialize)]
pub struct SetPresetRequest {
    pub miner: MinerConfig,
}

#[derive(Debug, Serialize)]
pub struct MinerConfig {
    pub overclock: OverclockSettings,
}

#[derive(Debug, Serialize)]
pub struct OverclockSettings {
    pub preset: String,
}

/// Returned by `POST /settings`; tells the caller whether the device
/// needs a mining restart or a full reboot to apply the change.
#[derive(Debug, Default, Deserialize)]
pub struct SaveConfigResult {
    #[serde(default)]
    pub reboot_required: bool,
    #[serde(default)]
    pub restart_required: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summary_decodes_partial_payload() {
        let payload = json!({
            "miner": {
                "miner_status": {"miner_state": "mining", "miner_state_time": 4521},
                "hr_realtime": 95.2e12,
                "power_consumption": 3010.0,
                "cooling": {
                    "fan_num": 2,
                    "fans": [{"id": 0, "rpm": 4100, "status": "ok"}]
                },
                "chains": [{
                    "id": 0,
                    "hashrate_rt": 31.7e12,
                    "pcb_temp": {"min": 45.0, "max": 58.5},
                    "chip_temp": {"min": 60.0, "max": 74.0},
                    "status": {"state": "mining"}
                }]
            }
        });

        let summary: SummaryResponse = serde_json::from_value(payload).unwrap();
        assert_eq!(summary.miner.miner_status.miner_state, "mining");
        assert_eq!(summary.miner.hashrate_realtime, Some(95.2e12));
        assert_eq!(summary.miner.cooling.fans.len(), 1);
        assert_eq!(summary.miner.chains[0].pcb_temp.max, Some(58.5));
        assert_eq!(summary.miner.power_usage, None);
    }

    #[test]
    fn test_autotune_preset_tuned_power() {
        let preset: AutotunePreset = serde_json::from_value(json!({
            "name": "3010W",
            "pretty": "3010 W",
            "status": "tuned",
            "tune_settings": {"target_power": 3010.0, "freq": 525}
        }))
        .unwrap();
        assert_eq!(preset.tuned_power_w(), Some(3010.0));

        let no_power: AutotunePreset =
            serde_json::from_value(json!({"name": "default"})).unwrap();
        assert_eq!(no_power.tuned_power_w(), None);

        let negative: AutotunePreset = serde_json::from_value(json!({
            "name": "broken",
            "tune_settings": {"power": -5.0}
        }))
        .unwrap();
        assert_eq!(negative.tuned_power_w(), None);
    }

    #[test]
    fn test_perf_summary_accepts_any_preset_shape() {
        let as_string: PerfSummaryResponse =
            serde_json::from_value(json!({"current_preset": "1300"})).unwrap();
        assert_eq!(as_string.current_preset, json!("1300"));

        let as_object: PerfSummaryResponse =
            serde_json::from_value(json!({"current_preset": {"name": "1300"}})).unwrap();
        assert!(as_object.current_preset.is_object());

        let missing: PerfSummaryResponse = serde_json::from_value(json!({})).unwrap();
        assert!(missing.current_preset.is_null());
    }
}
