//! Store operations
//!
//! All writes go through short transactions; multi-row inserts (status
//! plus fans/chains/chips) commit atomically or not at all. Readers run
//! concurrently under WAL; a writer that cannot take the lock within
//! the busy timeout surfaces `StoreError::Busy` and the calling service
//! aborts its tick.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::models::*;
use crate::schema::SCHEMA;
use crate::Result;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite error code for a held database lock.
const SQLITE_BUSY: &str = "5";

/// Store error types
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store busy: {0}")]
    Busy(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(SQLITE_BUSY) {
                return StoreError::Busy(db.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

/// Handle to the PowerHive database.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Open an in-memory database, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        // A single connection keeps the in-memory database alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Install the schema. Safe to call repeatedly; every statement is
    /// guarded with `IF NOT EXISTS`.
    pub async fn init(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Close the pool, waiting for in-flight operations to finish.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // =========================================================================
    // MODELS & PRESETS
    // =========================================================================

    /// Insert a model or update an existing one matched by alias.
    ///
    /// `presets: None` leaves the stored catalog untouched; an empty
    /// vec clears it. A `max_preset` that is not a member of the
    /// resulting catalog is rejected.
    #[instrument(skip(self, input), fields(alias = %input.alias))]
    pub async fn upsert_model(&self, input: ModelInput) -> Result<Model> {
        let name = input.name.trim().to_string();
        let alias = input.alias.trim().to_string();
        if name.is_empty() {
            return Err(StoreError::InvalidArgument("model name is required".into()));
        }
        if alias.is_empty() {
            return Err(StoreError::InvalidArgument("model alias is required".into()));
        }

        let presets = match &input.presets {
            Some(values) => Some(validate_presets(values)?),
            None => None,
        };
        let max_preset = trimmed(input.max_preset.as_deref());

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO models (name, alias, max_preset, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(alias) DO UPDATE SET
                name = excluded.name,
                max_preset = excluded.max_preset
            "#,
        )
        .bind(&name)
        .bind(&alias)
        .bind(&max_preset)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let model_id: i64 = sqlx::query_scalar("SELECT id FROM models WHERE alias = ?")
            .bind(&alias)
            .fetch_one(&mut *tx)
            .await?;

        if let Some(values) = &presets {
            sqlx::query("DELETE FROM model_presets WHERE model_id = ?")
                .bind(model_id)
                .execute(&mut *tx)
                .await?;

            for (position, value) in values.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO model_presets (model_id, value, position, created_at) VALUES (?, ?, ?, ?)",
                )
                .bind(model_id)
                .bind(value)
                .bind(position as i64)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
            }
        }

        if let Some(max) = &max_preset {
            let member: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM model_presets WHERE model_id = ? AND value = ?",
            )
            .bind(model_id)
            .bind(max)
            .fetch_one(&mut *tx)
            .await?;
            if member == 0 {
                return Err(StoreError::InvalidArgument(format!(
                    "max_preset {max:?} is not a preset of model {alias}"
                )));
            }
        }

        tx.commit().await?;

        let mut conn = self.pool.acquire().await?;
        load_model(&mut conn, model_id).await
    }

    /// Fetch a model and its presets by alias.
    pub async fn model_by_alias(&self, alias: &str) -> Result<Model> {
        let mut conn = self.pool.acquire().await?;
        let row: Option<ModelRow> = sqlx::query_as(
            "SELECT id, name, alias, max_preset, created_at FROM models WHERE alias = ?",
        )
        .bind(alias.trim())
        .fetch_optional(&mut *conn)
        .await?;

        let row = row.ok_or_else(|| StoreError::NotFound(format!("model {alias}")))?;
        assemble_model(&mut conn, row).await
    }

    /// All registered models, ordered by alias.
    pub async fn list_models(&self) -> Result<Vec<Model>> {
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<ModelRow> = sqlx::query_as(
            "SELECT id, name, alias, max_preset, created_at FROM models ORDER BY alias",
        )
        .fetch_all(&mut *conn)
        .await?;

        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            models.push(assemble_model(&mut conn, row).await?);
        }
        Ok(models)
    }

    /// Record the expected power draw of one preset, discovered from
    /// the device's autotune settings.
    pub async fn update_preset_power(
        &self,
        alias: &str,
        preset_value: &str,
        power_w: f64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE model_presets
            SET expected_power_w = ?
            WHERE model_id = (SELECT id FROM models WHERE alias = ?) AND value = ?
            "#,
        )
        .bind(power_w)
        .bind(alias)
        .bind(preset_value)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "preset {preset_value} of model {alias}"
            )));
        }
        Ok(())
    }

    // =========================================================================
    // MINERS
    // =========================================================================

    /// Ensure a miner row exists and apply the supplied fields.
    ///
    /// Ids are normalized to lowercase. For `ip` and `api_key`, a value
    /// that is empty after trimming clears the column to null; an empty
    /// `unlock_pass` is rejected.
    #[instrument(skip(self, update), fields(miner = %id))]
    pub async fn upsert_miner(&self, id: &str, update: MinerUpdate) -> Result<Miner> {
        let id = id.trim().to_lowercase();
        if id.is_empty() {
            return Err(StoreError::InvalidArgument("miner id is required".into()));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO miners (id, created_at, updated_at) VALUES (?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(&id)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let mut changed = false;

        if let Some(ip) = &update.ip {
            let ip = ip.trim();
            if ip.is_empty() {
                sqlx::query("UPDATE miners SET ip = NULL WHERE id = ?")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
            } else {
                sqlx::query("UPDATE miners SET ip = ? WHERE id = ?")
                    .bind(ip)
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
            }
            changed = true;
        }

        if let Some(api_key) = &update.api_key {
            let api_key = api_key.trim();
            if api_key.is_empty() {
                sqlx::query("UPDATE miners SET api_key = NULL WHERE id = ?")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
            } else {
                sqlx::query("UPDATE miners SET api_key = ? WHERE id = ?")
                    .bind(api_key)
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
            }
            changed = true;
        }

        if let Some(managed) = update.managed {
            sqlx::query("UPDATE miners SET managed = ? WHERE id = ?")
                .bind(managed)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            changed = true;
        }

        if let Some(unlock_pass) = &update.unlock_pass {
            let unlock_pass = unlock_pass.trim();
            if unlock_pass.is_empty() {
                return Err(StoreError::InvalidArgument(
                    "unlock password cannot be empty".into(),
                ));
            }
            sqlx::query("UPDATE miners SET unlock_pass = ? WHERE id = ?")
                .bind(unlock_pass)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            changed = true;
        }

        if let Some(alias) = &update.model_alias {
            let alias = alias.trim();
            if alias.is_empty() {
                return Err(StoreError::InvalidArgument(
                    "model alias cannot be empty".into(),
                ));
            }
            let model_id: Option<i64> = sqlx::query_scalar("SELECT id FROM models WHERE alias = ?")
                .bind(alias)
                .fetch_optional(&mut *tx)
                .await?;
            let model_id =
                model_id.ok_or_else(|| StoreError::NotFound(format!("model {alias}")))?;
            sqlx::query("UPDATE miners SET model_id = ? WHERE id = ?")
                .bind(model_id)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            changed = true;
        }

        if changed {
            sqlx::query("UPDATE miners SET updated_at = ? WHERE id = ?")
                .bind(Utc::now())
                .bind(&id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        self.get_miner(&id).await
    }

    /// Fetch a miner, eagerly loading its model, settings and latest
    /// status snapshot.
    pub async fn get_miner(&self, id: &str) -> Result<Miner> {
        let id = id.trim().to_lowercase();
        let mut conn = self.pool.acquire().await?;

        let row: Option<MinerRow> = sqlx::query_as(
            r#"
            SELECT id, ip, api_key, managed, unlock_pass, model_id, settings_id,
                   latest_status_id, created_at, updated_at
            FROM miners WHERE id = ?
            "#,
        )
        .bind(&id)
        .fetch_optional(&mut *conn)
        .await?;

        let row = row.ok_or_else(|| StoreError::NotFound(format!("miner {id}")))?;
        assemble_miner(&mut conn, row).await
    }

    /// All miners with their related data, ordered by id.
    pub async fn list_miners(&self) -> Result<Vec<Miner>> {
        let mut conn = self.pool.acquire().await?;

        let rows: Vec<MinerRow> = sqlx::query_as(
            r#"
            SELECT id, ip, api_key, managed, unlock_pass, model_id, settings_id,
                   latest_status_id, created_at, updated_at
            FROM miners ORDER BY id
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        let mut miners = Vec::with_capacity(rows.len());
        for row in rows {
            miners.push(assemble_miner(&mut conn, row).await?);
        }
        Ok(miners)
    }

    // =========================================================================
    // MINER SETTINGS
    // =========================================================================

    /// Store a settings snapshot and attach it to the miner.
    pub async fn save_miner_settings(
        &self,
        miner_id: &str,
        input: MinerSettingsInput,
    ) -> Result<MinerSettings> {
        let miner_id = miner_id.trim().to_lowercase();
        if miner_id.is_empty() {
            return Err(StoreError::InvalidArgument("miner id is required".into()));
        }

        let cooling_mode = if input.cooling_mode.trim().is_empty() {
            "auto".to_string()
        } else {
            input.cooling_mode.trim().to_string()
        };

        let mut tx = self.pool.begin().await?;

        let settings_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO settings (
                fan_min_count, fan_min_duty, fan_max_duty, cooling_mode,
                ignore_broken_sensors, min_operational_chains, preset, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(input.fan_min_count)
        .bind(input.fan_min_duty)
        .bind(input.fan_max_duty)
        .bind(&cooling_mode)
        .bind(input.ignore_broken_sensors)
        .bind(input.min_operational_chains)
        .bind(trimmed(input.preset.as_deref()))
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        for (position, pool) in input.pools.iter().enumerate() {
            let url = pool.url.trim();
            if url.is_empty() {
                return Err(StoreError::InvalidArgument(format!(
                    "pool at position {position} requires a url"
                )));
            }
            sqlx::query(
                "INSERT INTO settings_pools (settings_id, position, url, username, password) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(settings_id)
            .bind(position as i64)
            .bind(url)
            .bind(trimmed(pool.username.as_deref()))
            .bind(trimmed(pool.password.as_deref()))
            .execute(&mut *tx)
            .await?;
        }

        let attached = sqlx::query("UPDATE miners SET settings_id = ?, updated_at = ? WHERE id = ?")
            .bind(settings_id)
            .bind(Utc::now())
            .bind(&miner_id)
            .execute(&mut *tx)
            .await?;
        if attached.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("miner {miner_id}")));
        }

        tx.commit().await?;

        let mut conn = self.pool.acquire().await?;
        load_settings(&mut conn, settings_id).await
    }

    // =========================================================================
    // STATUS SNAPSHOTS
    // =========================================================================

    /// Record a status snapshot with its fans, chains and chips, and
    /// mark it as the miner's latest. Atomic: partial snapshots are
    /// never visible.
    #[instrument(skip(self, input), fields(miner = %miner_id))]
    pub async fn record_status(&self, miner_id: &str, input: StatusInput) -> Result<Status> {
        let miner_id = miner_id.trim().to_lowercase();
        if miner_id.is_empty() {
            return Err(StoreError::InvalidArgument("miner id is required".into()));
        }
        let recorded_at = input.recorded_at.unwrap_or_else(Utc::now);

        let mut tx = self.pool.begin().await?;

        let known: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM miners WHERE id = ?")
            .bind(&miner_id)
            .fetch_one(&mut *tx)
            .await?;
        if known == 0 {
            return Err(StoreError::NotFound(format!("miner {miner_id}")));
        }

        let status_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO statuses (miner_id, uptime, state, preset, hashrate,
                                  power_usage, power_consumption, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&miner_id)
        .bind(input.uptime)
        .bind(trimmed(input.state.as_deref()))
        .bind(trimmed(input.preset.as_deref()))
        .bind(input.hashrate)
        .bind(input.power_usage)
        .bind(input.power_consumption)
        .bind(recorded_at)
        .fetch_one(&mut *tx)
        .await?;

        for fan in &input.fans {
            sqlx::query(
                "INSERT INTO status_fans (status_id, fan_identifier, rpm, status) VALUES (?, ?, ?, ?)",
            )
            .bind(status_id)
            .bind(trimmed(fan.fan_identifier.as_deref()))
            .bind(fan.rpm)
            .bind(trimmed(fan.status.as_deref()))
            .execute(&mut *tx)
            .await?;
        }

        for chain in &input.chains {
            insert_chain(&mut tx, &miner_id, Some(status_id), chain, recorded_at).await?;
        }

        sqlx::query("UPDATE miners SET latest_status_id = ?, updated_at = ? WHERE id = ?")
            .bind(status_id)
            .bind(Utc::now())
            .bind(&miner_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let mut conn = self.pool.acquire().await?;
        load_status(&mut conn, status_id).await
    }

    /// Latest status snapshots for a miner, newest first.
    pub async fn list_statuses(&self, miner_id: &str, limit: i64) -> Result<Vec<Status>> {
        let limit = if limit <= 0 { 20 } else { limit };
        let mut conn = self.pool.acquire().await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM statuses WHERE miner_id = ? ORDER BY recorded_at DESC, id DESC LIMIT ?",
        )
        .bind(miner_id.trim().to_lowercase())
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            statuses.push(load_status(&mut conn, id).await?);
        }
        Ok(statuses)
    }

    // =========================================================================
    // CHAIN TELEMETRY
    // =========================================================================

    /// Record standalone chain snapshots (chip-level telemetry sampled
    /// on the slower cadence), not attached to any status row.
    pub async fn record_chain_telemetry(
        &self,
        miner_id: &str,
        recorded_at: DateTime<Utc>,
        chains: &[ChainSnapshotInput],
    ) -> Result<()> {
        let miner_id = miner_id.trim().to_lowercase();
        if miner_id.is_empty() {
            return Err(StoreError::InvalidArgument("miner id is required".into()));
        }
        if chains.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chain in chains {
            insert_chain(&mut tx, &miner_id, None, chain, recorded_at).await?;
        }
        tx.commit().await?;

        debug!(miner = %miner_id, chains = chains.len(), "chain telemetry recorded");
        Ok(())
    }

    /// Recent chain snapshots (with chip metrics) for a miner, newest
    /// first.
    pub async fn list_chain_telemetry(
        &self,
        miner_id: &str,
        limit: i64,
    ) -> Result<Vec<ChainSnapshot>> {
        let limit = if limit <= 0 { 50 } else { limit };
        let mut conn = self.pool.acquire().await?;

        let rows: Vec<ChainRow> = sqlx::query_as(
            r#"
            SELECT id, miner_id, status_id, chain_identifier, state, hashrate,
                   pcb_temp_min, pcb_temp_max, chip_temp_min, chip_temp_max, recorded_at
            FROM chain_snapshots
            WHERE miner_id = ?
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(miner_id.trim().to_lowercase())
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            snapshots.push(assemble_chain(&mut conn, row).await?);
        }
        Ok(snapshots)
    }

    // =========================================================================
    // PLANT READINGS
    // =========================================================================

    /// Persist one plant generation/consumption snapshot.
    pub async fn record_plant_reading(&self, input: PlantReadingInput) -> Result<PlantReading> {
        let recorded_at = input.recorded_at.unwrap_or_else(Utc::now);
        let generation = serde_json::to_string(&input.generation_sources)?;
        let consumption = serde_json::to_string(&input.consumption_sources)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO plant_readings (plant_id, total_generation_kw,
                total_container_consumption_kw, available_power_kw,
                generation_sources, consumption_sources, raw_data, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&input.plant_id)
        .bind(input.total_generation_kw)
        .bind(input.total_container_consumption_kw)
        .bind(input.available_power_kw)
        .bind(&generation)
        .bind(&consumption)
        .bind(&input.raw)
        .bind(recorded_at)
        .fetch_one(&self.pool)
        .await?;

        let row: PlantRow = sqlx::query_as(PLANT_SELECT_BY_ID)
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        plant_from_row(row)
    }

    /// The most recent plant reading, if any exists yet.
    pub async fn latest_plant_reading(&self) -> Result<Option<PlantReading>> {
        let row: Option<PlantRow> = sqlx::query_as(
            r#"
            SELECT id, plant_id, total_generation_kw, total_container_consumption_kw,
                   available_power_kw, generation_sources, consumption_sources,
                   raw_data, recorded_at
            FROM plant_readings
            ORDER BY recorded_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(plant_from_row).transpose()
    }

    /// Recent plant readings, newest first.
    pub async fn list_plant_readings(&self, limit: i64) -> Result<Vec<PlantReading>> {
        let limit = if limit <= 0 { 100 } else { limit };
        let rows: Vec<PlantRow> = sqlx::query_as(
            r#"
            SELECT id, plant_id, total_generation_kw, total_container_consumption_kw,
                   available_power_kw, generation_sources, consumption_sources,
                   raw_data, recorded_at
            FROM plant_readings
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(plant_from_row).collect()
    }

    // =========================================================================
    // BALANCE EVENTS
    // =========================================================================

    /// Append one balance event to the audit log.
    pub async fn record_balance_event(&self, input: BalanceEventInput) -> Result<BalanceEvent> {
        let miner_id = input.miner_id.trim().to_lowercase();
        if miner_id.is_empty() {
            return Err(StoreError::InvalidArgument("miner id is required".into()));
        }
        let recorded_at = input.recorded_at.unwrap_or_else(Utc::now);

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO power_balance_events (
                miner_id, old_preset, new_preset, old_power_w, new_power_w, reason,
                total_consumption_before_w, total_consumption_after_w,
                available_power_w, target_power_w, success, error_message, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&miner_id)
        .bind(&input.old_preset)
        .bind(&input.new_preset)
        .bind(input.old_power_w)
        .bind(input.new_power_w)
        .bind(&input.reason)
        .bind(input.total_consumption_before_w)
        .bind(input.total_consumption_after_w)
        .bind(input.available_power_w)
        .bind(input.target_power_w)
        .bind(input.success)
        .bind(&input.error_message)
        .bind(recorded_at)
        .fetch_one(&self.pool)
        .await?;

        let event: BalanceEvent = sqlx::query_as(&format!("{BALANCE_EVENT_SELECT} WHERE id = ?"))
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(event)
    }

    /// Recent balance events, newest first, optionally filtered by
    /// miner.
    pub async fn list_balance_events(
        &self,
        miner_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<BalanceEvent>> {
        let limit = if limit <= 0 { 100 } else { limit };

        let events: Vec<BalanceEvent> = match miner_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => {
                sqlx::query_as(&format!(
                    "{BALANCE_EVENT_SELECT} WHERE miner_id = ? ORDER BY recorded_at DESC, id DESC LIMIT ?"
                ))
                .bind(id.to_lowercase())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "{BALANCE_EVENT_SELECT} ORDER BY recorded_at DESC, id DESC LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(events)
    }

    // =========================================================================
    // APP SETTINGS
    // =========================================================================

    /// Read a setting value, `None` when the key has never been set.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM app_settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    /// Insert or overwrite a setting value.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app_settings (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

const PLANT_SELECT_BY_ID: &str = r#"
    SELECT id, plant_id, total_generation_kw, total_container_consumption_kw,
           available_power_kw, generation_sources, consumption_sources,
           raw_data, recorded_at
    FROM plant_readings WHERE id = ?
"#;

const BALANCE_EVENT_SELECT: &str = r#"
    SELECT id, miner_id, old_preset, new_preset, old_power_w, new_power_w, reason,
           total_consumption_before_w, total_consumption_after_w,
           available_power_w, target_power_w, success, error_message, recorded_at
    FROM power_balance_events
"#;

// =============================================================================
// ROW TYPES & ASSEMBLY
// =============================================================================

#[derive(sqlx::FromRow)]
struct ModelRow {
    id: i64,
    name: String,
    alias: String,
    max_preset: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct MinerRow {
    id: String,
    ip: Option<String>,
    api_key: Option<String>,
    managed: bool,
    unlock_pass: String,
    model_id: Option<i64>,
    settings_id: Option<i64>,
    latest_status_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct StatusRow {
    id: i64,
    miner_id: String,
    uptime: Option<i64>,
    state: Option<String>,
    preset: Option<String>,
    hashrate: Option<f64>,
    power_usage: Option<f64>,
    power_consumption: Option<f64>,
    recorded_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ChainRow {
    id: i64,
    miner_id: String,
    status_id: Option<i64>,
    chain_identifier: Option<String>,
    state: Option<String>,
    hashrate: Option<f64>,
    pcb_temp_min: Option<f64>,
    pcb_temp_max: Option<f64>,
    chip_temp_min: Option<f64>,
    chip_temp_max: Option<f64>,
    recorded_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct SettingsRow {
    id: i64,
    fan_min_count: Option<i64>,
    fan_min_duty: Option<i64>,
    fan_max_duty: Option<i64>,
    cooling_mode: String,
    ignore_broken_sensors: bool,
    min_operational_chains: Option<i64>,
    preset: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PlantRow {
    id: i64,
    plant_id: String,
    total_generation_kw: f64,
    total_container_consumption_kw: f64,
    available_power_kw: f64,
    generation_sources: Option<String>,
    consumption_sources: Option<String>,
    raw_data: Option<String>,
    recorded_at: DateTime<Utc>,
}

async fn load_model(conn: &mut SqliteConnection, model_id: i64) -> Result<Model> {
    let row: Option<ModelRow> = sqlx::query_as(
        "SELECT id, name, alias, max_preset, created_at FROM models WHERE id = ?",
    )
    .bind(model_id)
    .fetch_optional(&mut *conn)
    .await?;

    let row = row.ok_or_else(|| StoreError::NotFound(format!("model {model_id}")))?;
    assemble_model(conn, row).await
}

async fn assemble_model(conn: &mut SqliteConnection, row: ModelRow) -> Result<Model> {
    let presets: Vec<Preset> = sqlx::query_as(
        r#"
        SELECT id, model_id, value, position, expected_power_w, expected_hashrate_th, created_at
        FROM model_presets
        WHERE model_id = ?
        ORDER BY position, id
        "#,
    )
    .bind(row.id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Model {
        id: row.id,
        name: row.name,
        alias: row.alias,
        presets,
        max_preset: row.max_preset,
        created_at: row.created_at,
    })
}

async fn assemble_miner(conn: &mut SqliteConnection, row: MinerRow) -> Result<Miner> {
    let model = match row.model_id {
        Some(model_id) => Some(load_model(conn, model_id).await?),
        None => None,
    };
    let settings = match row.settings_id {
        Some(settings_id) => Some(load_settings(conn, settings_id).await?),
        None => None,
    };
    let latest_status = match row.latest_status_id {
        Some(status_id) => Some(load_status(conn, status_id).await?),
        None => None,
    };

    Ok(Miner {
        id: row.id,
        ip: row.ip,
        api_key: row.api_key,
        managed: row.managed,
        unlock_pass: row.unlock_pass,
        model,
        settings,
        latest_status,
        latest_status_id: row.latest_status_id,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

async fn load_settings(conn: &mut SqliteConnection, settings_id: i64) -> Result<MinerSettings> {
    let row: Option<SettingsRow> = sqlx::query_as(
        r#"
        SELECT id, fan_min_count, fan_min_duty, fan_max_duty, cooling_mode,
               ignore_broken_sensors, min_operational_chains, preset, created_at
        FROM settings WHERE id = ?
        "#,
    )
    .bind(settings_id)
    .fetch_optional(&mut *conn)
    .await?;

    let row = row.ok_or_else(|| StoreError::NotFound(format!("settings {settings_id}")))?;

    let pools: Vec<Pool> = sqlx::query_as(
        "SELECT id, settings_id, position, url, username, password FROM settings_pools WHERE settings_id = ? ORDER BY position, id",
    )
    .bind(settings_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(MinerSettings {
        id: row.id,
        fan_min_count: row.fan_min_count,
        fan_min_duty: row.fan_min_duty,
        fan_max_duty: row.fan_max_duty,
        cooling_mode: row.cooling_mode,
        ignore_broken_sensors: row.ignore_broken_sensors,
        min_operational_chains: row.min_operational_chains,
        preset: row.preset,
        pools,
        created_at: row.created_at,
    })
}

async fn load_status(conn: &mut SqliteConnection, status_id: i64) -> Result<Status> {
    let row: Option<StatusRow> = sqlx::query_as(
        r#"
        SELECT id, miner_id, uptime, state, preset, hashrate, power_usage,
               power_consumption, recorded_at
        FROM statuses WHERE id = ?
        "#,
    )
    .bind(status_id)
    .fetch_optional(&mut *conn)
    .await?;

    let row = row.ok_or_else(|| StoreError::NotFound(format!("status {status_id}")))?;

    let fans: Vec<FanStatus> = sqlx::query_as(
        "SELECT id, status_id, fan_identifier, rpm, status FROM status_fans WHERE status_id = ? ORDER BY id",
    )
    .bind(status_id)
    .fetch_all(&mut *conn)
    .await?;

    let chain_rows: Vec<ChainRow> = sqlx::query_as(
        r#"
        SELECT id, miner_id, status_id, chain_identifier, state, hashrate,
               pcb_temp_min, pcb_temp_max, chip_temp_min, chip_temp_max, recorded_at
        FROM chain_snapshots
        WHERE status_id = ?
        ORDER BY id
        "#,
    )
    .bind(status_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut chains = Vec::with_capacity(chain_rows.len());
    for chain_row in chain_rows {
        chains.push(assemble_chain(conn, chain_row).await?);
    }

    Ok(Status {
        id: row.id,
        miner_id: row.miner_id,
        uptime: row.uptime,
        state: row.state,
        preset: row.preset,
        hashrate: row.hashrate,
        power_usage: row.power_usage,
        power_consumption: row.power_consumption,
        recorded_at: row.recorded_at,
        fans,
        chains,
    })
}

async fn assemble_chain(conn: &mut SqliteConnection, row: ChainRow) -> Result<ChainSnapshot> {
    let chips: Vec<ChipSnapshot> = sqlx::query_as(
        "SELECT id, chain_snapshot_id, chip_identifier, hashrate, temperature FROM chain_chips WHERE chain_snapshot_id = ? ORDER BY id",
    )
    .bind(row.id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(ChainSnapshot {
        id: row.id,
        miner_id: row.miner_id,
        status_id: row.status_id,
        chain_identifier: row.chain_identifier,
        state: row.state,
        hashrate: row.hashrate,
        pcb_temp_min: row.pcb_temp_min,
        pcb_temp_max: row.pcb_temp_max,
        chip_temp_min: row.chip_temp_min,
        chip_temp_max: row.chip_temp_max,
        recorded_at: row.recorded_at,
        chips,
    })
}

async fn insert_chain(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    miner_id: &str,
    status_id: Option<i64>,
    chain: &ChainSnapshotInput,
    recorded_at: DateTime<Utc>,
) -> Result<()> {
    let chain_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO chain_snapshots (miner_id, status_id, chain_identifier, state,
            hashrate, pcb_temp_min, pcb_temp_max, chip_temp_min, chip_temp_max, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(miner_id)
    .bind(status_id)
    .bind(trimmed(chain.chain_identifier.as_deref()))
    .bind(trimmed(chain.state.as_deref()))
    .bind(chain.hashrate)
    .bind(chain.pcb_temp_min)
    .bind(chain.pcb_temp_max)
    .bind(chain.chip_temp_min)
    .bind(chain.chip_temp_max)
    .bind(recorded_at)
    .fetch_one(&mut **tx)
    .await?;

    for chip in &chain.chips {
        sqlx::query(
            "INSERT INTO chain_chips (chain_snapshot_id, chip_identifier, hashrate, temperature) VALUES (?, ?, ?, ?)",
        )
        .bind(chain_id)
        .bind(trimmed(chip.chip_identifier.as_deref()))
        .bind(chip.hashrate)
        .bind(chip.temperature)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

fn plant_from_row(row: PlantRow) -> Result<PlantReading> {
    let generation_sources = match row.generation_sources.as_deref() {
        Some(json) if !json.is_empty() => serde_json::from_str(json)?,
        _ => HashMap::new(),
    };
    let consumption_sources = match row.consumption_sources.as_deref() {
        Some(json) if !json.is_empty() => serde_json::from_str(json)?,
        _ => HashMap::new(),
    };

    Ok(PlantReading {
        id: row.id,
        plant_id: row.plant_id,
        total_generation_kw: row.total_generation_kw,
        total_container_consumption_kw: row.total_container_consumption_kw,
        available_power_kw: row.available_power_kw,
        generation_sources,
        consumption_sources,
        raw: row.raw_data,
        recorded_at: row.recorded_at,
    })
}

fn validate_presets(values: &[String]) -> std::result::Result<Vec<String>, StoreError> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(values.len());
    for (position, value) in values.iter().enumerate() {
        let value = value.trim();
        if value.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "preset at position {position} is empty"
            )));
        }
        if !seen.insert(value.to_lowercase()) {
            return Err(StoreError::InvalidArgument(format!(
                "duplicate preset value {value}"
            )));
        }
        out.push(value.to_string());
    }
    Ok(out)
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.init().await.unwrap();
        store
    }

    fn presets(values: &[&str]) -> Option<Vec<String>> {
        Some(values.iter().map(|v| v.to_string()).collect())
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let store = open_store().await;
        store.init().await.unwrap();
        store.init().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("powerhive.db");

        let store = Store::open(&path).await.unwrap();
        store.init().await.unwrap();
        store.set_setting("probe", "1").await.unwrap();
        store.close().await;

        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_upsert_model_replaces_presets_in_order() {
        let store = open_store().await;

        let model = store
            .upsert_model(ModelInput {
                name: "Antminer S19".into(),
                alias: "s19".into(),
                presets: presets(&["900", "1100", "1300"]),
                max_preset: None,
            })
            .await
            .unwrap();

        assert_eq!(model.preset_values(), vec!["900", "1100", "1300"]);
        // Positions are contiguous starting at 0.
        for (idx, preset) in model.presets.iter().enumerate() {
            assert_eq!(preset.position, idx as i64);
        }

        let model = store
            .upsert_model(ModelInput {
                name: "Antminer S19".into(),
                alias: "s19".into(),
                presets: presets(&["1300", "1400"]),
                max_preset: None,
            })
            .await
            .unwrap();
        assert_eq!(model.preset_values(), vec!["1300", "1400"]);
        assert_eq!(model.presets[0].position, 0);
    }

    #[tokio::test]
    async fn test_upsert_model_none_preserves_presets() {
        let store = open_store().await;

        store
            .upsert_model(ModelInput {
                name: "Antminer S19".into(),
                alias: "s19".into(),
                presets: presets(&["900", "1100"]),
                max_preset: None,
            })
            .await
            .unwrap();

        let model = store
            .upsert_model(ModelInput {
                name: "Antminer S19 Pro".into(),
                alias: "s19".into(),
                presets: None,
                max_preset: None,
            })
            .await
            .unwrap();

        assert_eq!(model.name, "Antminer S19 Pro");
        assert_eq!(model.preset_values(), vec!["900", "1100"]);

        let cleared = store
            .upsert_model(ModelInput {
                name: "Antminer S19 Pro".into(),
                alias: "s19".into(),
                presets: Some(Vec::new()),
                max_preset: None,
            })
            .await
            .unwrap();
        assert!(cleared.presets.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_model_validates_max_preset() {
        let store = open_store().await;

        let err = store
            .upsert_model(ModelInput {
                name: "Antminer S19".into(),
                alias: "s19".into(),
                presets: presets(&["900", "1100"]),
                max_preset: Some("1300".into()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        // A failed upsert leaves no visible effect.
        assert!(matches!(
            store.model_by_alias("s19").await.unwrap_err(),
            StoreError::NotFound(_)
        ));

        let model = store
            .upsert_model(ModelInput {
                name: "Antminer S19".into(),
                alias: "s19".into(),
                presets: presets(&["900", "1100"]),
                max_preset: Some("1100".into()),
            })
            .await
            .unwrap();
        assert_eq!(model.max_preset.as_deref(), Some("1100"));
    }

    #[tokio::test]
    async fn test_upsert_model_rejects_duplicate_presets() {
        let store = open_store().await;
        let err = store
            .upsert_model(ModelInput {
                name: "S21".into(),
                alias: "s21".into(),
                presets: presets(&["3010W", "3010w"]),
                max_preset: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_update_preset_power() {
        let store = open_store().await;
        store
            .upsert_model(ModelInput {
                name: "S21".into(),
                alias: "s21".into(),
                presets: presets(&["3010W", "3420W"]),
                max_preset: None,
            })
            .await
            .unwrap();

        store.update_preset_power("s21", "3010W", 3010.0).await.unwrap();

        let model = store.model_by_alias("s21").await.unwrap();
        assert_eq!(model.presets[0].expected_power_w, Some(3010.0));
        assert_eq!(model.presets[1].expected_power_w, None);

        let err = store
            .update_preset_power("s21", "9999W", 9999.0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_upsert_miner_applies_partial_updates() {
        let store = open_store().await;

        let miner = store
            .upsert_miner("AA:BB:CC:DD:EE:FF", MinerUpdate::default())
            .await
            .unwrap();
        assert_eq!(miner.id, "aa:bb:cc:dd:ee:ff");
        assert!(!miner.managed);
        assert_eq!(miner.unlock_pass, "admin");
        assert!(miner.ip.is_none());

        let miner = store
            .upsert_miner(
                "aa:bb:cc:dd:ee:ff",
                MinerUpdate {
                    ip: Some("10.0.0.5".into()),
                    managed: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(miner.ip.as_deref(), Some("10.0.0.5"));
        assert!(miner.managed);
        assert!(miner.updated_at >= miner.created_at);

        // An empty-after-trim value clears the column.
        let miner = store
            .upsert_miner(
                "aa:bb:cc:dd:ee:ff",
                MinerUpdate {
                    ip: Some("  ".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(miner.ip.is_none());
        assert!(miner.managed, "unrelated fields are untouched");
    }

    #[tokio::test]
    async fn test_upsert_miner_rejects_empty_unlock_pass() {
        let store = open_store().await;
        let err = store
            .upsert_miner(
                "aa:bb:cc:dd:ee:ff",
                MinerUpdate {
                    unlock_pass: Some("  ".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_upsert_miner_unknown_model() {
        let store = open_store().await;
        let err = store
            .upsert_miner(
                "aa:bb:cc:dd:ee:ff",
                MinerUpdate {
                    model_alias: Some("nope".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_record_status_is_atomic() {
        let store = open_store().await;
        store
            .upsert_miner("aa:bb:cc:dd:ee:ff", MinerUpdate::default())
            .await
            .unwrap();

        let status = store
            .record_status(
                "aa:bb:cc:dd:ee:ff",
                StatusInput {
                    state: Some("mining".into()),
                    preset: Some("1300".into()),
                    hashrate: Some(95.0e12),
                    power_consumption: Some(1300.0),
                    fans: vec![FanStatusInput {
                        fan_identifier: Some("fan-0".into()),
                        rpm: Some(4200),
                        status: Some("ok".into()),
                    }],
                    chains: vec![ChainSnapshotInput {
                        chain_identifier: Some("chain-0".into()),
                        state: Some("mining".into()),
                        hashrate: Some(31.0e12),
                        chips: vec![ChipSnapshotInput {
                            chip_identifier: Some("chip-0".into()),
                            hashrate: Some(0.3e12),
                            temperature: Some(71.5),
                        }],
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(status.fans.len(), 1);
        assert_eq!(status.chains.len(), 1);
        assert_eq!(status.chains[0].chips.len(), 1);
        assert_eq!(status.chains[0].status_id, Some(status.id));

        let miner = store.get_miner("aa:bb:cc:dd:ee:ff").await.unwrap();
        assert_eq!(miner.latest_status_id, Some(status.id));
        assert_eq!(
            miner.latest_status.as_ref().map(|s| s.id),
            Some(status.id)
        );
    }

    #[tokio::test]
    async fn test_record_status_unknown_miner_leaves_nothing() {
        let store = open_store().await;

        let err = store
            .record_status(
                "aa:bb:cc:dd:ee:ff",
                StatusInput {
                    state: Some("mining".into()),
                    chains: vec![ChainSnapshotInput::default()],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let statuses: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM statuses")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(statuses, 0);
        let chains: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chain_snapshots")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(chains, 0);
    }

    #[tokio::test]
    async fn test_chain_telemetry_is_standalone() {
        let store = open_store().await;
        store
            .upsert_miner("aa:bb:cc:dd:ee:ff", MinerUpdate::default())
            .await
            .unwrap();

        store
            .record_chain_telemetry(
                "aa:bb:cc:dd:ee:ff",
                Utc::now(),
                &[ChainSnapshotInput {
                    chain_identifier: Some("chain-0".into()),
                    hashrate: Some(30.0e12),
                    chips: vec![ChipSnapshotInput {
                        chip_identifier: Some("chip-1".into()),
                        hashrate: Some(0.29e12),
                        temperature: Some(68.0),
                    }],
                    ..Default::default()
                }],
            )
            .await
            .unwrap();

        let snapshots = store
            .list_chain_telemetry("aa:bb:cc:dd:ee:ff", 10)
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].status_id, None);
        assert_eq!(snapshots[0].chips.len(), 1);
    }

    #[tokio::test]
    async fn test_plant_readings_latest_and_invariant() {
        let store = open_store().await;
        assert!(store.latest_plant_reading().await.unwrap().is_none());

        let first = chrono::DateTime::parse_from_rfc3339("2025-06-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        store
            .record_plant_reading(PlantReadingInput {
                plant_id: "complexo-paranhos".into(),
                total_generation_kw: 100_000.0,
                total_container_consumption_kw: 20_000.0,
                available_power_kw: 80_000.0,
                recorded_at: Some(first),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .record_plant_reading(PlantReadingInput {
                plant_id: "complexo-paranhos".into(),
                total_generation_kw: 110_000.0,
                total_container_consumption_kw: 25_000.0,
                available_power_kw: 85_000.0,
                generation_sources: HashMap::from([("generoso".to_string(), 55_000.0)]),
                recorded_at: Some(first + chrono::Duration::seconds(15)),
                ..Default::default()
            })
            .await
            .unwrap();

        let latest = store.latest_plant_reading().await.unwrap().unwrap();
        assert_eq!(latest.total_generation_kw, 110_000.0);
        assert!(
            (latest.available_power_kw
                - (latest.total_generation_kw - latest.total_container_consumption_kw))
                .abs()
                < 1e-9
        );
        assert_eq!(latest.generation_sources.get("generoso"), Some(&55_000.0));

        let history = store.list_plant_readings(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].recorded_at > history[1].recorded_at);
    }

    #[tokio::test]
    async fn test_balance_events_append_and_filter() {
        let store = open_store().await;

        store
            .record_balance_event(BalanceEventInput {
                miner_id: "aa:aa:aa:aa:aa:aa".into(),
                old_preset: Some("1300".into()),
                new_preset: Some("1100".into()),
                old_power_w: Some(1300.0),
                new_power_w: Some(1100.0),
                reason: "automatic_balance".into(),
                success: true,
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .record_balance_event(BalanceEventInput {
                miner_id: "bb:bb:bb:bb:bb:bb".into(),
                new_preset: Some("1400".into()),
                reason: "automatic_balance".into(),
                success: false,
                error_message: Some("connection refused".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let all = store.list_balance_events(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = store
            .list_balance_events(Some("aa:aa:aa:aa:aa:aa"), 10)
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].success);
        assert_eq!(filtered[0].new_preset.as_deref(), Some("1100"));
    }

    #[tokio::test]
    async fn test_app_settings_round_trip() {
        let store = open_store().await;

        assert_eq!(store.get_setting("safety_margin_percent").await.unwrap(), None);

        store.set_setting("safety_margin_percent", "10.0").await.unwrap();
        assert_eq!(
            store.get_setting("safety_margin_percent").await.unwrap(),
            Some("10.0".to_string())
        );

        store.set_setting("safety_margin_percent", "15.0").await.unwrap();
        assert_eq!(
            store.get_setting("safety_margin_percent").await.unwrap(),
            Some("15.0".to_string())
        );
    }

    #[tokio::test]
    async fn test_save_miner_settings() {
        let store = open_store().await;
        store
            .upsert_miner("aa:bb:cc:dd:ee:ff", MinerUpdate::default())
            .await
            .unwrap();

        let settings = store
            .save_miner_settings(
                "aa:bb:cc:dd:ee:ff",
                MinerSettingsInput {
                    cooling_mode: String::new(),
                    preset: Some("1300".into()),
                    pools: vec![PoolInput {
                        url: "stratum+tcp://pool.example:3333".into(),
                        username: Some("worker".into()),
                        password: None,
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(settings.cooling_mode, "auto");
        assert_eq!(settings.pools.len(), 1);

        let miner = store.get_miner("aa:bb:cc:dd:ee:ff").await.unwrap();
        assert_eq!(miner.settings.map(|s| s.id), Some(settings.id));

        let err = store
            .save_miner_settings("not:a:known:mac:00:00", MinerSettingsInput::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
