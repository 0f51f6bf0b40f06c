//! SQLite-backed durable state for PowerHive
//!
//! The store is the only synchronization point between the periodic
//! services: devices, models, presets, status snapshots, plant
//! readings, balance events, and key/value settings all live in a
//! single database file. Public operations either commit or leave no
//! visible effect; writers queue behind SQLite's single-writer lock
//! with a bounded busy timeout.

pub mod models;
mod schema;
mod store;

pub use models::*;
pub use store::{Store, StoreError};

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// App-setting key for the balancer safety margin (JSON float, percent).
pub const SETTING_SAFETY_MARGIN: &str = "safety_margin_percent";

/// App-setting key for the per-device cooldown map (JSON object,
/// device id to last successful preset change instant).
pub const SETTING_LAST_PRESET_CHANGE: &str = "last_preset_change";

/// App-setting key for the projected post-plan consumption (JSON float,
/// watts). The balancer is the only writer of this key.
pub const SETTING_EXPECTED_CONSUMPTION: &str = "expected_consumption_w";
