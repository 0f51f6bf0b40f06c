//! Dashboard REST API
//!
//! Read-mostly view over the store for operators. The only write
//! endpoints are the miner/model patches and the safety margin; the
//! balancer and samplers own everything else. Failures inside the
//! services leave this API serving stale-but-queryable data.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use powerhive_store::{
    decode_setting, BalanceEvent, ChainSnapshot, Miner, MinerUpdate, Model, ModelInput,
    PlantReading, Status, Store, StoreError, SETTING_EXPECTED_CONSUMPTION, SETTING_SAFETY_MARGIN,
};

const DEFAULT_SAFETY_MARGIN_PCT: f64 = 10.0;

/// API error payload
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
}

impl ApiError {
    fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn store_error(err: StoreError) -> (StatusCode, Json<ApiError>) {
    let (status, code) = match &err {
        StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        StoreError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
        StoreError::Busy(_) => (StatusCode::SERVICE_UNAVAILABLE, "BUSY"),
        _ => {
            error!(error = %err, "store operation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
        }
    };
    (status, Json(ApiError::new(err.to_string(), code)))
}

#[derive(Clone)]
struct AppState {
    store: Store,
}

/// Build the dashboard router.
pub fn router(store: Store) -> Router {
    Router::new()
        .route("/api/miners", get(list_miners))
        .route("/api/miners/:id", get(get_miner).patch(patch_miner))
        .route("/api/miners/:id/statuses", get(miner_statuses))
        .route("/api/miners/:id/telemetry", get(miner_telemetry))
        .route("/api/models", get(list_models))
        .route("/api/models/:alias", get(get_model).patch(patch_model))
        .route("/api/plant/latest", get(plant_latest))
        .route("/api/plant/history", get(plant_history))
        .route("/api/balance/events", get(balance_events))
        .route("/api/balance/status", get(balance_status))
        .route("/api/settings", get(get_settings))
        .route("/api/settings/safety-margin", put(put_safety_margin))
        .with_state(AppState { store })
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn list_miners(State(state): State<AppState>) -> ApiResult<Vec<Miner>> {
    state.store.list_miners().await.map(Json).map_err(store_error)
}

async fn get_miner(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Miner> {
    state.store.get_miner(&id).await.map(Json).map_err(store_error)
}

#[derive(Debug, Deserialize)]
struct MinerPatch {
    managed: Option<bool>,
    unlock_pass: Option<String>,
}

async fn patch_miner(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<MinerPatch>,
) -> ApiResult<Miner> {
    state
        .store
        .upsert_miner(
            &id,
            MinerUpdate {
                managed: patch.managed,
                unlock_pass: patch.unlock_pass,
                ..Default::default()
            },
        )
        .await
        .map(Json)
        .map_err(store_error)
}

async fn miner_statuses(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<Status>> {
    state
        .store
        .list_statuses(&id, query.limit.unwrap_or(20))
        .await
        .map(Json)
        .map_err(store_error)
}

async fn miner_telemetry(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<ChainSnapshot>> {
    state
        .store
        .list_chain_telemetry(&id, query.limit.unwrap_or(50))
        .await
        .map(Json)
        .map_err(store_error)
}

async fn list_models(State(state): State<AppState>) -> ApiResult<Vec<Model>> {
    state.store.list_models().await.map(Json).map_err(store_error)
}

async fn get_model(State(state): State<AppState>, Path(alias): Path<String>) -> ApiResult<Model> {
    state
        .store
        .model_by_alias(&alias)
        .await
        .map(Json)
        .map_err(store_error)
}

#[derive(Debug, Deserialize)]
struct ModelPatch {
    /// New cap; null clears it. Must name an existing preset when set.
    max_preset: Option<String>,
}

async fn patch_model(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    Json(patch): Json<ModelPatch>,
) -> ApiResult<Model> {
    let existing = state
        .store
        .model_by_alias(&alias)
        .await
        .map_err(store_error)?;

    state
        .store
        .upsert_model(ModelInput {
            name: existing.name,
            alias: existing.alias,
            presets: None,
            max_preset: patch.max_preset,
        })
        .await
        .map(Json)
        .map_err(store_error)
}

async fn plant_latest(State(state): State<AppState>) -> ApiResult<PlantReading> {
    match state.store.latest_plant_reading().await {
        Ok(Some(reading)) => Ok(Json(reading)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ApiError::new("no plant readings yet", "NO_DATA")),
        )),
        Err(e) => Err(store_error(e)),
    }
}

async fn plant_history(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<PlantReading>> {
    state
        .store
        .list_plant_readings(query.limit.unwrap_or(100))
        .await
        .map(Json)
        .map_err(store_error)
}

#[derive(Debug, Deserialize)]
struct BalanceEventsQuery {
    miner_id: Option<String>,
    limit: Option<i64>,
}

async fn balance_events(
    State(state): State<AppState>,
    Query(query): Query<BalanceEventsQuery>,
) -> ApiResult<Vec<BalanceEvent>> {
    state
        .store
        .list_balance_events(query.miner_id.as_deref(), query.limit.unwrap_or(100))
        .await
        .map(Json)
        .map_err(store_error)
}

/// Balance posture derived from the latest reading and fleet state.
#[derive(Debug, Serialize)]
struct BalanceStatusDto {
    status: &'static str,
    safety_margin_percent: f64,
    managed_miners_count: usize,
    current_consumption_w: f64,
    plant_generation_kw: Option<f64>,
    plant_container_kw: Option<f64>,
    available_power_kw: Option<f64>,
    target_power_kw: Option<f64>,
    target_power_w: Option<f64>,
    last_reading_at: Option<DateTime<Utc>>,
}

async fn balance_status(State(state): State<AppState>) -> ApiResult<BalanceStatusDto> {
    let reading = state
        .store
        .latest_plant_reading()
        .await
        .map_err(store_error)?;
    let miners = state.store.list_miners().await.map_err(store_error)?;
    let safety_margin = load_safety_margin(&state.store).await;

    let managed: Vec<&Miner> = miners.iter().filter(|m| m.managed).collect();
    let current_consumption_w: f64 = managed
        .iter()
        .filter_map(|m| m.latest_status.as_ref())
        .filter_map(|s| s.power_consumption)
        .sum();

    let mut dto = BalanceStatusDto {
        status: "NO_DATA",
        safety_margin_percent: safety_margin,
        managed_miners_count: managed.len(),
        current_consumption_w,
        plant_generation_kw: None,
        plant_container_kw: None,
        available_power_kw: None,
        target_power_kw: None,
        target_power_w: None,
        last_reading_at: None,
    };

    if let Some(reading) = reading {
        let target_kw = reading.total_generation_kw * (1.0 - safety_margin / 100.0);
        let target_w = target_kw * 1000.0;
        dto.plant_generation_kw = Some(reading.total_generation_kw);
        dto.plant_container_kw = Some(reading.total_container_consumption_kw);
        dto.available_power_kw = Some(reading.available_power_kw);
        dto.target_power_kw = Some(target_kw);
        dto.target_power_w = Some(target_w);
        dto.last_reading_at = Some(reading.recorded_at);
        dto.status = classify_balance(target_w, current_consumption_w);
    }

    Ok(Json(dto))
}

/// Classify the signed relative delta between target and consumption.
fn classify_balance(target_w: f64, current_consumption_w: f64) -> &'static str {
    let delta_pct = (target_w - current_consumption_w) / target_w * 100.0;
    if delta_pct < -5.0 {
        "OVER_TARGET"
    } else if delta_pct < 0.0 {
        "WARNING"
    } else {
        "OK"
    }
}

#[derive(Debug, Serialize)]
struct SettingsDto {
    safety_margin_percent: f64,
    expected_consumption_w: Option<f64>,
}

async fn get_settings(State(state): State<AppState>) -> ApiResult<SettingsDto> {
    let safety_margin = load_safety_margin(&state.store).await;
    let expected_consumption_w = state
        .store
        .get_setting(SETTING_EXPECTED_CONSUMPTION)
        .await
        .ok()
        .flatten()
        .and_then(|v| decode_setting::<f64>(&v));

    Ok(Json(SettingsDto {
        safety_margin_percent: safety_margin,
        expected_consumption_w,
    }))
}

#[derive(Debug, Deserialize)]
struct SafetyMarginBody {
    safety_margin_percent: f64,
}

async fn put_safety_margin(
    State(state): State<AppState>,
    Json(body): Json<SafetyMarginBody>,
) -> ApiResult<SettingsDto> {
    let margin = body.safety_margin_percent;
    if !margin.is_finite() || !(0.0..=50.0).contains(&margin) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(
                "safety margin must be between 0 and 50 percent",
                "INVALID_ARGUMENT",
            )),
        ));
    }

    state
        .store
        .set_setting(SETTING_SAFETY_MARGIN, &margin.to_string())
        .await
        .map_err(store_error)?;

    Ok(Json(SettingsDto {
        safety_margin_percent: margin,
        expected_consumption_w: None,
    }))
}

async fn load_safety_margin(store: &Store) -> f64 {
    match store.get_setting(SETTING_SAFETY_MARGIN).await {
        Ok(Some(value)) => decode_setting::<f64>(&value)
            .unwrap_or(DEFAULT_SAFETY_MARGIN_PCT)
            .clamp(0.0, 50.0),
        _ => DEFAULT_SAFETY_MARGIN_PCT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_balance_thresholds() {
        // Consumption comfortably under target.
        assert_eq!(classify_balance(100_000.0, 90_000.0), "OK");
        // Exactly on target counts as OK.
        assert_eq!(classify_balance(100_000.0, 100_000.0), "OK");
        // Up to 5 % over is a warning.
        assert_eq!(classify_balance(100_000.0, 103_000.0), "WARNING");
        // Beyond 5 % over the target trips the alarm.
        assert_eq!(classify_balance(100_000.0, 106_000.0), "OVER_TARGET");
    }
}
