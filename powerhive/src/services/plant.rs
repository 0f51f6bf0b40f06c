//! Plant sampler
//!
//! Fetches one generation/consumption reading from the energy API per
//! tick, validates its confidence, converts MW to kW and persists it.
//! Every failure is local to the tick; the last-known-good reading
//! stays queryable.

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use powerhive_store::{PlantReadingInput, Store};

use crate::config::PlantConfig;

const PLANT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Readings at or below this confidence are discarded.
const MIN_CONFIDENCE: f64 = 0.8;

/// Periodic plant telemetry sampler.
pub struct PlantSampler {
    store: Store,
    config: PlantConfig,
    interval: Duration,
    http: reqwest::Client,
}

impl PlantSampler {
    pub fn new(store: Store, config: PlantConfig, interval: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(PLANT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            store,
            config,
            interval,
            http,
        }
    }

    /// Run the sampling loop until cancellation.
    pub async fn run(self, token: CancellationToken) {
        info!(interval = ?self.interval, "starting plant sampling loop");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("stopping plant sampling loop");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll().await {
                        error!(error = %e, "plant poll failed");
                    }
                }
            }
        }
    }

    async fn poll(&self) -> anyhow::Result<()> {
        let response = self
            .http
            .get(&self.config.api_endpoint)
            .bearer_auth(&self.config.api_key)
            .query(&[("plant_id", self.config.plant_id.as_str())])
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .context("fetch plant data")?;

        if !response.status().is_success() {
            bail!("plant API returned status {}", response.status().as_u16());
        }

        let body = response.text().await.context("read plant response")?;
        let Some(input) = parse_reading(&body)? else {
            // Low confidence; keep the last-known-good reading.
            return Ok(());
        };

        let reading = self
            .store
            .record_plant_reading(input)
            .await
            .context("store plant reading")?;

        info!(
            plant_id = %reading.plant_id,
            generation_kw = reading.total_generation_kw,
            container_kw = reading.total_container_consumption_kw,
            available_kw = reading.available_power_kw,
            "plant reading recorded"
        );

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PlantApiResponse {
    reading: PlantApiReading,
}

#[derive(Debug, Deserialize)]
struct PlantApiReading {
    #[serde(default)]
    plant_id: String,
    collection_timestamp: DateTime<Utc>,
    #[serde(default)]
    totals: PlantTotals,
    #[serde(default)]
    trust: PlantTrust,
    #[serde(default)]
    generation: HashMap<String, PlantSource>,
    #[serde(default)]
    consumption: HashMap<String, PlantSource>,
}

#[derive(Debug, Default, Deserialize)]
struct PlantTotals {
    #[serde(default)]
    generation_mw: f64,
    #[serde(default)]
    consumption_mw: f64,
}

#[derive(Debug, Default, Deserialize)]
struct PlantTrust {
    #[serde(default)]
    confidence_score: f64,
}

#[derive(Debug, Deserialize)]
struct PlantSource {
    #[serde(default)]
    status: String,
    #[serde(default)]
    value_mw: f64,
}

/// Parse a plant API response body into a store input.
///
/// Returns `Ok(None)` when the reading's confidence is at or below the
/// threshold. Any other shape than `{reading: {...}}` is a hard parse
/// error; there is no fallback shape.
fn parse_reading(body: &str) -> anyhow::Result<Option<PlantReadingInput>> {
    let response: PlantApiResponse =
        serde_json::from_str(body).context("decode plant response")?;
    let reading = response.reading;

    if reading.trust.confidence_score <= MIN_CONFIDENCE {
        warn!(
            plant_id = %reading.plant_id,
            confidence = reading.trust.confidence_score,
            "discarding low-confidence plant reading"
        );
        return Ok(None);
    }

    let total_generation_kw = reading.totals.generation_mw * 1000.0;
    let total_container_consumption_kw = reading.totals.consumption_mw * 1000.0;

    Ok(Some(PlantReadingInput {
        plant_id: reading.plant_id,
        total_generation_kw,
        total_container_consumption_kw,
        available_power_kw: total_generation_kw - total_container_consumption_kw,
        generation_sources: successful_sources_kw(reading.generation),
        consumption_sources: successful_sources_kw(reading.consumption),
        raw: Some(body.to_string()),
        recorded_at: Some(reading.collection_timestamp),
    }))
}

/// Keep only sources that reported successfully, converted to kW.
fn successful_sources_kw(sources: HashMap<String, PlantSource>) -> HashMap<String, f64> {
    sources
        .into_iter()
        .filter(|(_, source)| source.status == "success")
        .map(|(name, source)| (name, source.value_mw * 1000.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_body(confidence: f64) -> String {
        format!(
            r#"{{
                "reading": {{
                    "collection_timestamp": "2025-06-01T10:00:00Z",
                    "plant_id": "complexo-paranhos",
                    "generation": {{
                        "generoso": {{"source_timestamp": "2025-06-01T10:00:00Z", "status": "success", "value_mw": 0.052}},
                        "nogueira": {{"source_timestamp": "2025-06-01T10:00:00Z", "status": "stale", "value_mw": 0.048}}
                    }},
                    "consumption": {{
                        "container_eles": {{"source_timestamp": "2025-06-01T10:00:00Z", "status": "success", "value_mw": 0.011}}
                    }},
                    "totals": {{"generation_mw": 0.1, "consumption_mw": 0.02, "exported_mw": 0.08}},
                    "trust": {{"confidence_score": {confidence}, "status": "trusted"}}
                }}
            }}"#
        )
    }

    #[test]
    fn test_parse_reading_converts_mw_to_kw() {
        let input = parse_reading(&sample_body(1.0)).unwrap().unwrap();

        assert_eq!(input.plant_id, "complexo-paranhos");
        assert_eq!(input.total_generation_kw, 100.0);
        assert_eq!(input.total_container_consumption_kw, 20.0);
        assert!((input.available_power_kw - 80.0).abs() < 1e-9);
        assert_eq!(
            input.recorded_at.unwrap(),
            "2025-06-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );

        // Only successful sources survive, converted to kW.
        assert_eq!(input.generation_sources.len(), 1);
        assert_eq!(input.generation_sources.get("generoso"), Some(&52.0));
        assert_eq!(input.consumption_sources.get("container_eles"), Some(&11.0));
    }

    #[test]
    fn test_parse_reading_discards_low_confidence() {
        assert!(parse_reading(&sample_body(0.7)).unwrap().is_none());
        // The threshold itself is rejected too.
        assert!(parse_reading(&sample_body(0.8)).unwrap().is_none());
        assert!(parse_reading(&sample_body(0.81)).unwrap().is_some());
    }

    #[test]
    fn test_parse_reading_rejects_unknown_shape() {
        // Legacy shape from an older aggregator; no silent fallback.
        let legacy = r#"{"success": true, "count": 1, "data": []}"#;
        assert!(parse_reading(legacy).is_err());
    }
}
