//! Shared domain primitives for PowerHive
//!
//! The preset helpers used by more than one crate: wattage parsing and
//! tolerant decoding of the firmware's `current_preset` payload.

pub mod preset;

pub use preset::{decode_current_preset, parse_wattage};
