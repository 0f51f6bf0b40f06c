//! Power balancing for PowerHive
//!
//! Matches the fleet's projected consumption to the plant's
//! safety-margined generation target. Planning is pure and lives in
//! [`planner`]; the [`service`] runs the periodic tick, persists the
//! projected consumption, and applies preset changes device by device.

pub mod planner;
pub mod service;

pub use planner::{
    create_plan, BalancePlan, MinerSnapshot, ModelPowerCurve, PlannedChange, PlannerConfig,
};
pub use service::{Balancer, BalancerError, BalancerSettings};
