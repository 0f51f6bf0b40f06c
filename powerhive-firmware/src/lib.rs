//! Typed client for the miner firmware HTTP API
//!
//! A thin per-device RPC adapter over `http://{ip}/api/v1`. Handles the
//! unlock/token exchange, API key lifecycle, telemetry fetches, preset
//! changes and restarts. Stored API keys go in the `x-api-key` header;
//! unlock tokens go in `Authorization: Bearer`.

mod client;
pub mod types;

pub use client::{Client, FirmwareError, Result};
pub use types::*;
