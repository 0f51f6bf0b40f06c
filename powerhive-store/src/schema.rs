//! Database schema
//!
//! Every statement is idempotent (`IF NOT EXISTS`); `Store::init` runs
//! them all on startup. SQLite resolves foreign keys at insert time, so
//! the circular reference between `miners.latest_status_id` and
//! `statuses.miner_id` is fine.

pub(crate) const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS models (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name        TEXT NOT NULL,
        alias       TEXT NOT NULL UNIQUE COLLATE NOCASE,
        max_preset  TEXT,
        created_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS model_presets (
        id                    INTEGER PRIMARY KEY AUTOINCREMENT,
        model_id              INTEGER NOT NULL REFERENCES models(id) ON DELETE CASCADE,
        value                 TEXT NOT NULL,
        position              INTEGER NOT NULL,
        expected_power_w      REAL,
        expected_hashrate_th  REAL,
        created_at            TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(model_id, value)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        id                      INTEGER PRIMARY KEY AUTOINCREMENT,
        fan_min_count           INTEGER,
        fan_min_duty            INTEGER,
        fan_max_duty            INTEGER,
        cooling_mode            TEXT NOT NULL DEFAULT 'auto',
        ignore_broken_sensors   INTEGER NOT NULL DEFAULT 0,
        min_operational_chains  INTEGER,
        preset                  TEXT,
        created_at              TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settings_pools (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        settings_id  INTEGER NOT NULL REFERENCES settings(id) ON DELETE CASCADE,
        position     INTEGER NOT NULL,
        url          TEXT NOT NULL,
        username     TEXT,
        password     TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS miners (
        id                TEXT PRIMARY KEY,
        ip                TEXT,
        api_key           TEXT,
        managed           INTEGER NOT NULL DEFAULT 0,
        unlock_pass       TEXT NOT NULL DEFAULT 'admin',
        model_id          INTEGER REFERENCES models(id),
        settings_id       INTEGER REFERENCES settings(id),
        latest_status_id  INTEGER REFERENCES statuses(id),
        created_at        TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at        TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS statuses (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        miner_id           TEXT NOT NULL REFERENCES miners(id),
        uptime             INTEGER,
        state              TEXT,
        preset             TEXT,
        hashrate           REAL,
        power_usage        REAL,
        power_consumption  REAL,
        recorded_at        TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS status_fans (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        status_id       INTEGER NOT NULL REFERENCES statuses(id) ON DELETE CASCADE,
        fan_identifier  TEXT,
        rpm             INTEGER,
        status          TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chain_snapshots (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        miner_id          TEXT NOT NULL REFERENCES miners(id),
        status_id         INTEGER REFERENCES statuses(id),
        chain_identifier  TEXT,
        state             TEXT,
        hashrate          REAL,
        pcb_temp_min      REAL,
        pcb_temp_max      REAL,
        chip_temp_min     REAL,
        chip_temp_max     REAL,
        recorded_at       TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chain_chips (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        chain_snapshot_id  INTEGER NOT NULL REFERENCES chain_snapshots(id) ON DELETE CASCADE,
        chip_identifier    TEXT,
        hashrate           REAL,
        temperature        REAL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS plant_readings (
        id                              INTEGER PRIMARY KEY AUTOINCREMENT,
        plant_id                        TEXT NOT NULL,
        total_generation_kw             REAL NOT NULL,
        total_container_consumption_kw  REAL NOT NULL,
        available_power_kw              REAL NOT NULL,
        generation_sources              TEXT,
        consumption_sources             TEXT,
        raw_data                        TEXT,
        recorded_at                     TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS power_balance_events (
        id                          INTEGER PRIMARY KEY AUTOINCREMENT,
        miner_id                    TEXT NOT NULL,
        old_preset                  TEXT,
        new_preset                  TEXT,
        old_power_w                 REAL,
        new_power_w                 REAL,
        reason                      TEXT NOT NULL,
        total_consumption_before_w  REAL,
        total_consumption_after_w   REAL,
        available_power_w           REAL,
        target_power_w              REAL,
        success                     INTEGER NOT NULL,
        error_message               TEXT,
        recorded_at                 TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS app_settings (
        key         TEXT PRIMARY KEY,
        value       TEXT NOT NULL,
        updated_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_statuses_miner ON statuses(miner_id, recorded_at)",
    "CREATE INDEX IF NOT EXISTS idx_chain_snapshots_miner ON chain_snapshots(miner_id, recorded_at)",
    "CREATE INDEX IF NOT EXISTS idx_balance_events_miner ON power_balance_events(miner_id, recorded_at)",
    "CREATE INDEX IF NOT EXISTS idx_plant_readings_time ON plant_readings(recorded_at)",
];
