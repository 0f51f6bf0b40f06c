//! Balance planner
//!
//! Pure plan computation over a snapshot of the fleet. Given the
//! target, the device list and each model's power curve, produces an
//! ordered list of preset changes that converges projected consumption
//! toward the target. Optimizes for:
//! - hashes kept per watt removed (reduce worst efficiency first)
//! - hashes gained per watt added (increase best efficiency first)
//! - stability (per-device cooldown, dead zone around the target)
//!
//! Planning never touches the store or the network.

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

use powerhive_core::parse_wattage;

/// Planner configuration
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Dead zone around the target inside which no changes are issued.
    /// Roughly one miner's consumption.
    pub tolerance_w: f64,
    /// Minimum spacing between preset changes for a single device.
    pub cooldown: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            tolerance_w: 2000.0,
            cooldown: Duration::seconds(30),
        }
    }
}

/// What the planner needs to know about one device.
#[derive(Debug, Clone, Default)]
pub struct MinerSnapshot {
    pub id: String,
    pub ip: Option<String>,
    pub api_key: Option<String>,
    pub managed: bool,
    pub model_alias: Option<String>,
    /// Preset reported by the latest status snapshot.
    pub current_preset: Option<String>,
    /// Power consumption reported by the latest status snapshot, used
    /// when the current preset has no catalog wattage.
    pub reported_power_w: Option<f64>,
    /// Realtime hashrate in H/s.
    pub hashrate: Option<f64>,
}

impl MinerSnapshot {
    fn online(&self) -> bool {
        self.ip.as_deref().is_some_and(|ip| !ip.trim().is_empty())
    }

    fn eligible(&self) -> bool {
        self.managed
            && self.online()
            && self
                .api_key
                .as_deref()
                .is_some_and(|key| !key.trim().is_empty())
            && self.model_alias.is_some()
    }
}

/// One preset with a resolved wattage.
#[derive(Debug, Clone, PartialEq)]
pub struct PresetPower {
    pub value: String,
    pub power_w: f64,
}

/// A model's presets sorted ascending by wattage, plus its cap.
///
/// Presets without a resolvable wattage (`"disabled"` and friends) are
/// excluded from balancing entirely.
#[derive(Debug, Clone, Default)]
pub struct ModelPowerCurve {
    presets: Vec<PresetPower>,
    max_preset: Option<String>,
}

impl ModelPowerCurve {
    /// Build a curve from catalog entries. `expected_power_w` is
    /// authoritative when present; otherwise the wattage is parsed from
    /// the preset value.
    pub fn new<I>(entries: I, max_preset: Option<String>) -> Self
    where
        I: IntoIterator<Item = (String, Option<f64>)>,
    {
        let mut presets: Vec<PresetPower> = entries
            .into_iter()
            .filter_map(|(value, expected)| {
                let power_w = expected.or_else(|| parse_wattage(&value))?;
                Some(PresetPower { value, power_w })
            })
            .collect();
        presets.sort_by(|a, b| a.power_w.partial_cmp(&b.power_w).unwrap_or(Ordering::Equal));

        Self {
            presets,
            max_preset,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Resolved wattage of a preset value, if it is in the curve.
    pub fn power_of(&self, preset: &str) -> Option<f64> {
        self.presets
            .iter()
            .find(|p| p.value == preset)
            .map(|p| p.power_w)
    }

    /// Wattage of the cap preset. `None` when no cap is set or the cap
    /// has no resolvable wattage; either way increases are disallowed.
    fn cap_power(&self) -> Option<f64> {
        self.max_preset.as_deref().and_then(|max| self.power_of(max))
    }
}

/// One planned preset change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub miner_id: String,
    pub old_preset: Option<String>,
    pub new_preset: String,
    /// Effective current draw used for projection (catalog wattage of
    /// the current preset, falling back to reported consumption).
    pub old_power_w: Option<f64>,
    pub new_power_w: f64,
}

/// Result of one planning pass.
#[derive(Debug, Clone, Default)]
pub struct BalancePlan {
    pub target_w: f64,
    /// Consumption of all online miners at plan time.
    pub baseline_w: f64,
    /// `target_w - baseline_w` before any planned change.
    pub initial_delta_w: f64,
    /// Consumption projected after applying every planned change.
    pub projected_w: f64,
    /// Changes in application order.
    pub changes: Vec<PlannedChange>,
}

struct Candidate<'a> {
    snapshot: &'a MinerSnapshot,
    /// W/TH; +inf for devices reporting zero hashrate.
    efficiency: f64,
    /// Catalog wattage of the current preset, falling back to the
    /// reported consumption. Candidates without either are dropped.
    current_power_w: f64,
    /// Catalog wattage only; selection treats this as "unknown" when
    /// the current preset is not in the curve.
    preset_power_w: Option<f64>,
}

/// Compute a balance plan.
///
/// `cooldowns` maps device ids to their last successful preset change;
/// devices inside the cooldown window are skipped this tick.
pub fn create_plan(
    config: &PlannerConfig,
    target_w: f64,
    miners: &[MinerSnapshot],
    curves: &HashMap<String, ModelPowerCurve>,
    cooldowns: &HashMap<String, DateTime<Utc>>,
    now: DateTime<Utc>,
) -> BalancePlan {
    let baseline_w = baseline_consumption(miners, curves);
    let mut delta = target_w - baseline_w;

    let mut plan = BalancePlan {
        target_w,
        baseline_w,
        initial_delta_w: delta,
        projected_w: baseline_w,
        changes: Vec::new(),
    };

    if delta.abs() < config.tolerance_w {
        return plan;
    }

    let reduce = delta < 0.0;
    let candidates = rank_candidates(miners, curves, reduce);

    for candidate in candidates {
        if let Some(last_change) = cooldowns.get(&candidate.snapshot.id) {
            if now.signed_duration_since(*last_change) < config.cooldown {
                continue;
            }
        }

        let curve = candidate
            .snapshot
            .model_alias
            .as_deref()
            .and_then(|alias| curves.get(alias));
        let Some(curve) = curve else { continue };

        let Some(change) = select_change(&candidate, curve, reduce) else {
            continue;
        };

        let power_change = change.new_power_w - candidate.current_power_w;
        plan.projected_w += power_change;
        delta -= power_change;
        plan.changes.push(change);

        if delta.abs() < config.tolerance_w {
            break;
        }
    }

    plan
}

/// Total draw of every online miner, managed or not. The catalog
/// wattage of the current preset wins; the reported consumption is the
/// fallback; devices with neither contribute zero.
fn baseline_consumption(miners: &[MinerSnapshot], curves: &HashMap<String, ModelPowerCurve>) -> f64 {
    let mut total = 0.0;
    for miner in miners {
        if !miner.online() || miner.model_alias.is_none() {
            continue;
        }
        match effective_power(miner, curves) {
            Some(power) => total += power,
            None => {
                debug!(miner = %miner.id, preset = ?miner.current_preset, "no power data for miner");
            }
        }
    }
    total
}

fn preset_power(miner: &MinerSnapshot, curves: &HashMap<String, ModelPowerCurve>) -> Option<f64> {
    let curve = curves.get(miner.model_alias.as_deref()?)?;
    curve.power_of(miner.current_preset.as_deref()?)
}

fn effective_power(miner: &MinerSnapshot, curves: &HashMap<String, ModelPowerCurve>) -> Option<f64> {
    preset_power(miner, curves).or(miner.reported_power_w)
}

fn rank_candidates<'a>(
    miners: &'a [MinerSnapshot],
    curves: &HashMap<String, ModelPowerCurve>,
    reduce: bool,
) -> Vec<Candidate<'a>> {
    let mut candidates: Vec<Candidate<'a>> = miners
        .iter()
        .filter(|m| m.eligible())
        .filter_map(|snapshot| {
            let current_power_w = effective_power(snapshot, curves)?;
            let hashrate_th = snapshot.hashrate.unwrap_or(0.0) / 1e12;
            let efficiency = if hashrate_th <= 0.0 {
                // Zero hashrate (disabled preset or stalled) sorts as
                // worst for reductions and first for increases.
                f64::INFINITY
            } else {
                current_power_w / hashrate_th
            };
            Some(Candidate {
                snapshot,
                efficiency,
                current_power_w,
                preset_power_w: preset_power(snapshot, curves),
            })
        })
        .collect();

    if reduce {
        // Worst efficiency first: dropping them loses the fewest hashes
        // per watt removed.
        candidates.sort_by(|a, b| {
            b.efficiency
                .partial_cmp(&a.efficiency)
                .unwrap_or(Ordering::Equal)
        });
    } else {
        // Best efficiency first, except that idle devices jump the
        // queue: the opportunity cost of leaving them off is highest.
        candidates.sort_by(|a, b| match (a.efficiency.is_infinite(), b.efficiency.is_infinite()) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a
                .efficiency
                .partial_cmp(&b.efficiency)
                .unwrap_or(Ordering::Equal),
        });
    }

    candidates
}

fn select_change(
    candidate: &Candidate<'_>,
    curve: &ModelPowerCurve,
    reduce: bool,
) -> Option<PlannedChange> {
    if curve.is_empty() {
        return None;
    }

    let picked = if reduce {
        match candidate.preset_power_w {
            // Highest preset strictly below the current draw.
            Some(current) => curve.presets.iter().rev().find(|p| p.power_w < current),
            // Unknown current wattage: fall to the highest preset with
            // a known wattage.
            None => curve.presets.last(),
        }
    } else {
        // Unknown current wattage makes "strictly greater" undefined;
        // the device sits out increase passes this tick.
        let current = candidate.preset_power_w?;
        // No cap, no increases.
        let cap = curve.cap_power()?;
        curve
            .presets
            .iter()
            .find(|p| p.power_w > current && p.power_w <= cap)
    }?;

    if candidate.snapshot.current_preset.as_deref() == Some(picked.value.as_str()) {
        return None;
    }

    Some(PlannedChange {
        miner_id: candidate.snapshot.id.clone(),
        old_preset: candidate.snapshot.current_preset.clone(),
        new_preset: picked.value.clone(),
        old_power_w: Some(candidate.current_power_w),
        new_power_w: picked.power_w,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_curve(values: &[&str], max_preset: Option<&str>) -> ModelPowerCurve {
        ModelPowerCurve::new(
            values.iter().map(|v| (v.to_string(), None)),
            max_preset.map(str::to_string),
        )
    }

    fn make_miner(id: &str, preset: &str, power_w: f64, hashrate_th: f64) -> MinerSnapshot {
        MinerSnapshot {
            id: id.to_string(),
            ip: Some("10.0.0.2".to_string()),
            api_key: Some("key".to_string()),
            managed: true,
            model_alias: Some("s19".to_string()),
            current_preset: Some(preset.to_string()),
            reported_power_w: Some(power_w),
            hashrate: Some(hashrate_th * 1e12),
        }
    }

    fn s19_curves(max_preset: Option<&str>) -> HashMap<String, ModelPowerCurve> {
        HashMap::from([(
            "s19".to_string(),
            make_curve(&["900", "1100", "1300", "1400"], max_preset),
        )])
    }

    #[test]
    fn test_curve_orders_by_wattage_and_skips_unknown() {
        let curve = ModelPowerCurve::new(
            [
                ("1300".to_string(), None),
                ("disabled".to_string(), None),
                ("900".to_string(), None),
                ("turbo".to_string(), Some(1500.0)),
            ],
            None,
        );
        let values: Vec<&str> = curve.presets.iter().map(|p| p.value.as_str()).collect();
        assert_eq!(values, vec!["900", "1300", "turbo"]);
        assert_eq!(curve.power_of("turbo"), Some(1500.0));
        assert_eq!(curve.power_of("disabled"), None);
    }

    #[test]
    fn test_increase_under_surplus() {
        // Generation 100 kW, container 20 kW, margin 10 %:
        // target 72 000 W against a 2 600 W baseline.
        let config = PlannerConfig::default();
        let miners = vec![
            make_miner("aa", "1300", 1300.0, 90.0),
            make_miner("bb", "1300", 1300.0, 95.0),
        ];
        let curves = s19_curves(Some("1400"));

        let plan = create_plan(
            &config,
            72_000.0,
            &miners,
            &curves,
            &HashMap::new(),
            Utc::now(),
        );

        assert_eq!(plan.baseline_w, 2600.0);
        assert_eq!(plan.changes.len(), 2);
        // One step per miner per tick; both move up to the cap.
        for change in &plan.changes {
            assert_eq!(change.new_preset, "1400");
        }
        // Best efficiency first: bb (1300/95) before aa (1300/90).
        assert_eq!(plan.changes[0].miner_id, "bb");
        assert_eq!(plan.projected_w, 2800.0);
    }

    #[test]
    fn test_reduce_orders_worst_efficiency_first() {
        let config = PlannerConfig::default();
        // Same wattage, different hashrates: aa is least efficient.
        let miners = vec![
            make_miner("aa", "1400", 1400.0, 60.0),
            make_miner("bb", "1400", 1400.0, 100.0),
        ];
        let curves = s19_curves(Some("1400"));

        // Target far below baseline forces a reduce pass.
        let plan = create_plan(&config, 0.0, &miners, &curves, &HashMap::new(), Utc::now());

        assert!(!plan.changes.is_empty());
        assert_eq!(plan.changes[0].miner_id, "aa");
        // Reduce picks the next preset below the current wattage.
        assert_eq!(plan.changes[0].new_preset, "1300");
    }

    #[test]
    fn test_tolerance_band_suppresses_changes() {
        let config = PlannerConfig::default();
        let miners = vec![make_miner("aa", "1300", 1300.0, 90.0)];
        let curves = s19_curves(Some("1400"));

        // Baseline 1300, target 1300 + 1999: inside the dead zone.
        let plan = create_plan(
            &config,
            3299.0,
            &miners,
            &curves,
            &HashMap::new(),
            Utc::now(),
        );
        assert!(plan.changes.is_empty());
        assert_eq!(plan.projected_w, plan.baseline_w);
    }

    #[test]
    fn test_cooldown_blocks_thrash() {
        let config = PlannerConfig::default();
        let miners = vec![
            make_miner("aa", "1300", 1300.0, 90.0),
            make_miner("bb", "1300", 1300.0, 95.0),
        ];
        let curves = s19_curves(Some("1400"));
        let now = Utc::now();
        // aa changed 10 s ago; only bb may move this tick.
        let cooldowns = HashMap::from([("aa".to_string(), now - Duration::seconds(10))]);

        let plan = create_plan(&config, 72_000.0, &miners, &curves, &cooldowns, now);

        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].miner_id, "bb");

        // Once the cooldown has elapsed, aa is movable again.
        let cooldowns = HashMap::from([("aa".to_string(), now - Duration::seconds(31))]);
        let plan = create_plan(&config, 72_000.0, &miners, &curves, &cooldowns, now);
        assert_eq!(plan.changes.len(), 2);
    }

    #[test]
    fn test_max_preset_caps_increases() {
        let config = PlannerConfig::default();
        let miners = vec![make_miner("aa", "1100", 1100.0, 80.0)];
        let curves = s19_curves(Some("1100"));

        // Positive delta, but nothing above the cap is allowed.
        let plan = create_plan(
            &config,
            72_000.0,
            &miners,
            &curves,
            &HashMap::new(),
            Utc::now(),
        );
        assert!(plan.changes.is_empty());
    }

    #[test]
    fn test_no_cap_disallows_increases_but_not_reductions() {
        let config = PlannerConfig::default();
        let miners = vec![make_miner("aa", "1100", 1100.0, 80.0)];
        let curves = s19_curves(None);

        let plan = create_plan(
            &config,
            72_000.0,
            &miners,
            &curves,
            &HashMap::new(),
            Utc::now(),
        );
        assert!(plan.changes.is_empty(), "no max_preset, no increases");

        let plan = create_plan(&config, 0.0, &miners, &curves, &HashMap::new(), Utc::now());
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].new_preset, "900");
    }

    #[test]
    fn test_zero_hashrate_goes_first_on_increase() {
        let config = PlannerConfig::default();
        let mut idle = make_miner("idle", "900", 900.0, 0.0);
        idle.hashrate = Some(0.0);
        let busy = make_miner("busy", "900", 900.0, 80.0);
        let miners = vec![busy, idle];
        let curves = s19_curves(Some("1400"));

        let plan = create_plan(
            &config,
            72_000.0,
            &miners,
            &curves,
            &HashMap::new(),
            Utc::now(),
        );
        assert_eq!(plan.changes[0].miner_id, "idle");
    }

    #[test]
    fn test_unknown_current_wattage_skips_increase() {
        let config = PlannerConfig::default();
        // Preset outside the catalog; only the reported draw is known.
        let miners = vec![make_miner("aa", "custom", 3000.0, 80.0)];
        let curves = s19_curves(Some("1400"));

        let plan = create_plan(
            &config,
            72_000.0,
            &miners,
            &curves,
            &HashMap::new(),
            Utc::now(),
        );
        assert!(plan.changes.is_empty());

        // Reductions are still allowed: fall to the highest preset with
        // a known wattage.
        let plan = create_plan(&config, 0.0, &miners, &curves, &HashMap::new(), Utc::now());
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].new_preset, "1400");
    }

    #[test]
    fn test_unmanaged_miners_count_toward_baseline_only() {
        let config = PlannerConfig::default();
        let mut unmanaged = make_miner("un", "1300", 1300.0, 90.0);
        unmanaged.managed = false;
        let managed = make_miner("ma", "1300", 1300.0, 90.0);
        let miners = vec![unmanaged, managed];
        let curves = s19_curves(Some("1400"));

        let plan = create_plan(
            &config,
            72_000.0,
            &miners,
            &curves,
            &HashMap::new(),
            Utc::now(),
        );
        assert_eq!(plan.baseline_w, 2600.0);
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].miner_id, "ma");
    }

    #[test]
    fn test_offline_miner_is_invisible() {
        let config = PlannerConfig::default();
        let mut offline = make_miner("off", "1300", 1300.0, 90.0);
        offline.ip = None;
        let miners = vec![offline];
        let curves = s19_curves(Some("1400"));

        let plan = create_plan(
            &config,
            72_000.0,
            &miners,
            &curves,
            &HashMap::new(),
            Utc::now(),
        );
        assert_eq!(plan.baseline_w, 0.0);
        assert!(plan.changes.is_empty());
    }

    #[test]
    fn test_reported_power_fallback_for_baseline() {
        let config = PlannerConfig::default();
        // Preset not in the curve; the reported consumption stands in.
        let miner = make_miner("aa", "eco", 1234.0, 80.0);
        let miners = vec![miner];
        let curves = s19_curves(Some("1400"));

        let plan = create_plan(
            &config,
            1234.0,
            &miners,
            &curves,
            &HashMap::new(),
            Utc::now(),
        );
        assert_eq!(plan.baseline_w, 1234.0);
        assert!(plan.changes.is_empty());
    }
}
